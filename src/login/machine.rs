//! Login state machine.
//!
//! Two flows share the [`AuthClient`]:
//!
//! - Stream flow: a challenge detected in a video stream is submitted as
//!   `scan`, then either auto-confirmed with the account's credentials or
//!   left for an explicit confirmation call. A rejected scan is surfaced for
//!   manual retry, never retried automatically.
//! - Polling flow: this process issues its own QR code and polls its status
//!   every two seconds until it is confirmed, expires, or hits the overall
//!   ceiling.
//!
//! Credential bootstrap runs once per session start: a stored session token
//! is preferred for deriving a fresh game token; failing that, an existing
//! game token is promoted to a session token pair. An account with neither
//! cannot participate.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::error::{Result, ScanError};
use crate::types::{GameType, LoginChallenge};

use super::api::{AuthClient, QrStatus};

/// Poll cadence for the polling flow.
pub const STATUS_POLL_INTERVAL: Duration = Duration::from_secs(2);
/// Overall ceiling for one polling flow. QR tickets themselves expire well
/// before this.
pub const LOGIN_CEILING: Duration = Duration::from_secs(300);

/// Stored credentials for one account.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Account {
    pub uid: String,
    pub game_token: Option<String>,
    pub stoken: Option<String>,
    pub mid: Option<String>,
}

impl Account {
    pub fn new(uid: impl Into<String>) -> Self {
        Self { uid: uid.into(), ..Self::default() }
    }

    fn session_pair(&self) -> Option<(&str, &str)> {
        match (self.stoken.as_deref(), self.mid.as_deref()) {
            (Some(stoken), Some(mid)) => Some((stoken, mid)),
            _ => None,
        }
    }
}

/// Outcome of submitting a detected challenge (stream flow).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// Scan and confirmation both accepted; login is complete.
    Confirmed,
    /// Scan accepted; confirmation was not attempted (auto-login off).
    AwaitingConfirmation,
    /// Scan accepted but the confirmation was rejected.
    ConfirmRejected,
    /// The scan itself was rejected (stale or foreign ticket). Retry is a
    /// user decision.
    ScanRejected,
}

/// Observable states of the polling flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoginState {
    Idle,
    /// QR issued, waiting for a device to scan it.
    Scanning,
    /// Scanned, waiting for on-device confirmation.
    Scanned,
    Confirmed,
    Expired,
}

/// Terminal result of the polling flow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    Confirmed { uid: String, game_token: String },
    Expired,
}

/// Driver for both login flows.
#[derive(Debug, Clone)]
pub struct LoginFlow {
    client: AuthClient,
    auto_confirm: bool,
}

impl LoginFlow {
    pub fn new(client: AuthClient, auto_confirm: bool) -> Self {
        Self { client, auto_confirm }
    }

    /// Refresh the account's credentials before a scan session.
    ///
    /// Preference order: derive a fresh game token from the session token;
    /// otherwise promote an existing game token to a session token pair and
    /// then derive. A refresh failure with a still-present game token is
    /// tolerated; the stale token may still be accepted.
    pub async fn refresh_credentials(&self, account: &mut Account) -> Result<()> {
        let session_pair = account
            .session_pair()
            .map(|(stoken, mid)| (stoken.to_string(), mid.to_string()));
        if let Some((stoken, mid)) = session_pair {
            match self.client.game_token_by_session(&stoken, &mid).await? {
                Some(game_token) => {
                    debug!(uid = %account.uid, "game token refreshed from session token");
                    account.game_token = Some(game_token);
                    return Ok(());
                }
                None if account.game_token.is_some() => {
                    warn!(uid = %account.uid, "session token rejected, keeping stored game token");
                    return Ok(());
                }
                None => {
                    return Err(ScanError::auth("game token refresh", -1));
                }
            }
        }

        let Some(game_token) = account.game_token.clone() else {
            return Err(ScanError::MissingCredentials { uid: account.uid.clone() });
        };
        let session = self
            .client
            .session_token_by_game_token(&account.uid, &game_token)
            .await?
            .ok_or_else(|| ScanError::auth("token exchange", -1))?;
        account.stoken = Some(session.stoken.clone());
        account.mid = Some(session.mid.clone());
        if let Some(fresh) = self
            .client
            .game_token_by_session(&session.stoken, &session.mid)
            .await?
        {
            account.game_token = Some(fresh);
        }
        info!(uid = %account.uid, "session token pair established");
        Ok(())
    }

    /// Stream flow: submit a detected challenge on behalf of `account`.
    pub async fn submit(
        &self,
        challenge: &LoginChallenge,
        account: &Account,
    ) -> Result<SubmitOutcome> {
        if account.game_token.is_none() {
            return Err(ScanError::MissingCredentials { uid: account.uid.clone() });
        }
        let accepted = self
            .client
            .scan(challenge.game_type, &challenge.ticket)
            .await?;
        if !accepted {
            warn!(game = challenge.game_type.as_str(), "scan rejected");
            return Ok(SubmitOutcome::ScanRejected);
        }
        info!(game = challenge.game_type.as_str(), "scan accepted");
        if !self.auto_confirm {
            return Ok(SubmitOutcome::AwaitingConfirmation);
        }
        if self.confirm(challenge, account).await? {
            Ok(SubmitOutcome::Confirmed)
        } else {
            Ok(SubmitOutcome::ConfirmRejected)
        }
    }

    /// Stream flow: confirm a previously scanned challenge. Separate entry
    /// point so a frontend can put a human decision between scan and
    /// confirm.
    pub async fn confirm(&self, challenge: &LoginChallenge, account: &Account) -> Result<bool> {
        let game_token = account
            .game_token
            .as_deref()
            .ok_or_else(|| ScanError::MissingCredentials { uid: account.uid.clone() })?;
        let accepted = self
            .client
            .confirm(challenge.game_type, &challenge.ticket, &account.uid, game_token)
            .await?;
        if accepted {
            info!(uid = %account.uid, "login confirmed");
        } else {
            warn!(uid = %account.uid, "confirmation rejected");
        }
        Ok(accepted)
    }

    /// Polling flow: issue a QR code for `game` and poll until it resolves.
    ///
    /// State transitions are published on `progress`; drop the receiver if
    /// they are not needed.
    pub async fn poll_login(
        &self,
        game: GameType,
        progress: &watch::Sender<LoginState>,
    ) -> Result<PollOutcome> {
        let issued = self.client.fetch_qrcode(game).await?;
        let ticket = issued
            .ticket()
            .ok_or_else(|| ScanError::parse("qrcode fetch", "issued URL carries no ticket"))?;
        progress.send_replace(LoginState::Scanning);
        info!(game = game.as_str(), "qr code issued, polling status");

        let mut ticks = tokio::time::interval(STATUS_POLL_INTERVAL);
        let deadline = tokio::time::Instant::now() + LOGIN_CEILING;

        loop {
            if tokio::time::Instant::now() >= deadline {
                progress.send_replace(LoginState::Expired);
                return Err(ScanError::Timeout { limit: LOGIN_CEILING });
            }
            ticks.tick().await;

            match self.client.query_status(game, &ticket).await? {
                QrStatus::Created => {}
                QrStatus::Scanned => {
                    progress.send_replace(LoginState::Scanned);
                }
                QrStatus::Confirmed { uid, game_token } => {
                    progress.send_replace(LoginState::Confirmed);
                    info!(%uid, "qr login confirmed");
                    return Ok(PollOutcome::Confirmed { uid, game_token });
                }
                QrStatus::Expired => {
                    progress.send_replace(LoginState::Expired);
                    info!("qr ticket expired");
                    return Ok(PollOutcome::Expired);
                }
            }
        }
    }
}
