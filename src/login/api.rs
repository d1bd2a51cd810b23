//! HTTP client for the QR login and token-exchange endpoints.
//!
//! All QR endpoints live under `/{biz}/combo/panda/qrcode/` on the SDK host
//! for the target game; hk4e uses its own SDK host for fetch and query.
//! Responses share one envelope: `{retcode, message, data}` with `retcode ==
//! 0` on success. Token exchange goes through `api-takumi`.
//!
//! The device identifier is a UUIDv4 created lazily on first use and reused
//! for the lifetime of the process, mirroring how a real client presents one
//! stable device per install.

use std::sync::OnceLock;
use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderValue};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{Result, ScanError};
use crate::types::{GameType, TICKET_LEN};

const TAKUMI_HOST: &str = "https://api-takumi.mihoyo.com";
const SDK_HOST: &str = "https://api-sdk.mihoyo.com";
const HK4E_SDK_HOST: &str = "https://hk4e-sdk.mihoyo.com";

const RPC_APP_ID: &str = "bll8iq97cem8";
const RPC_APP_VERSION: &str = "2.76.1";
const RPC_CLIENT_TYPE: &str = "2";
const RPC_SDK_VERSION: &str = "2.16.0";
const RPC_GAME_BIZ: &str = "bbs_cn";

const MOBILE_UA: &str =
    "Mozilla/5.0 (Linux; Android 13) AppleWebKit/537.36 (KHTML, like Gecko) miHoYoBBS/2.76.1";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Process-wide device identifier, created on first use.
pub fn device_id() -> &'static str {
    static DEVICE_ID: OnceLock<String> = OnceLock::new();
    DEVICE_ID.get_or_init(|| Uuid::new_v4().to_string())
}

/// Wire envelope shared by every auth endpoint. Missing `message`/`data`
/// fields deserialize as `None` without needing `T: Default`.
#[derive(Debug, Deserialize)]
struct Envelope<T> {
    retcode: i64,
    message: Option<String>,
    data: Option<T>,
}

/// Fresh QR code issued by `qrcode/fetch`.
#[derive(Debug, Clone, Deserialize)]
pub struct FetchedQr {
    /// URL-form payload to render as a QR image.
    pub url: String,
}

impl FetchedQr {
    /// Ticket for the issued URL: its trailing [`TICKET_LEN`] characters.
    ///
    /// The backend appends `ticket=<24 chars>` to every fetched URL, so the
    /// tail slice is the ticket regardless of how the rest of the URL is
    /// shaped. The stricter challenge parser is consulted only as a sanity
    /// check on the wire format.
    pub fn ticket(&self) -> Option<String> {
        let total = self.url.chars().count();
        if total < TICKET_LEN {
            return None;
        }
        let ticket: String = self.url.chars().skip(total - TICKET_LEN).collect();
        if super::parse::extract_challenge(&self.url).is_none() {
            debug!(url = %self.url, "fetched qr url has unexpected shape");
        }
        Some(ticket)
    }
}

/// Status of a pending QR login, from `qrcode/query`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QrStatus {
    /// Issued, not yet scanned.
    Created,
    /// Scanned on a device, awaiting confirmation.
    Scanned,
    /// Confirmed; credentials are included.
    Confirmed { uid: String, game_token: String },
    /// The ticket is no longer valid.
    Expired,
}

/// Session token pair from the game-token exchange.
#[derive(Debug, Clone)]
pub struct SessionToken {
    pub stoken: String,
    pub mid: String,
}

/// Client for the QR login endpoint family.
#[derive(Debug, Clone)]
pub struct AuthClient {
    http: reqwest::Client,
}

impl AuthClient {
    pub fn new() -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|err| ScanError::http("client setup", err))?;
        Ok(Self { http })
    }

    /// Issue a fresh QR code for the given game (polling variant).
    pub async fn fetch_qrcode(&self, game: GameType) -> Result<FetchedQr> {
        let body = json!({
            "app_id": game.app_id(),
            "device": device_id(),
        });
        let data: FetchData = self
            .post_enveloped(&qrcode_url(game, "fetch"), &body, "qrcode fetch")
            .await?;
        Ok(FetchedQr { url: data.url })
    }

    /// Query the status of an issued QR code (polling variant).
    ///
    /// A non-zero retcode here means the ticket is gone (consumed or timed
    /// out) and is reported as [`QrStatus::Expired`], not as an error.
    pub async fn query_status(&self, game: GameType, ticket: &str) -> Result<QrStatus> {
        let body = json!({
            "app_id": game.app_id(),
            "device": device_id(),
            "ticket": ticket,
        });
        let response = self
            .http
            .post(qrcode_url(game, "query"))
            .headers(rpc_headers())
            .json(&body)
            .send()
            .await
            .map_err(|err| ScanError::http("qrcode query", err))?;
        let envelope: Envelope<QueryData> = response
            .json()
            .await
            .map_err(|err| ScanError::http("qrcode query", err))?;
        if envelope.retcode != 0 {
            debug!(
                retcode = envelope.retcode,
                message = envelope.message.as_deref().unwrap_or(""),
                "qr ticket no longer valid"
            );
            return Ok(QrStatus::Expired);
        }
        let data = envelope
            .data
            .ok_or_else(|| ScanError::parse("qrcode query", "missing data field"))?;
        match data.stat.as_str() {
            "Init" => Ok(QrStatus::Created),
            "Scanned" => Ok(QrStatus::Scanned),
            "Confirmed" => {
                let raw = data
                    .payload
                    .and_then(|p| p.raw)
                    .ok_or_else(|| ScanError::parse("qrcode query", "confirmed without payload"))?;
                let account: ConfirmedAccount = serde_json::from_str(&raw).map_err(|err| {
                    ScanError::parse("qrcode query", format!("bad confirmed payload: {err}"))
                })?;
                Ok(QrStatus::Confirmed { uid: account.uid, game_token: account.token })
            }
            other => Err(ScanError::parse(
                "qrcode query",
                format!("unknown status {other:?}"),
            )),
        }
    }

    /// Report a scan of someone else's QR code (stream variant, first step).
    /// Returns whether the backend accepted the scan.
    pub async fn scan(&self, game: GameType, ticket: &str) -> Result<bool> {
        let body = json!({
            "app_id": game.app_id(),
            "device": device_id(),
            "ticket": ticket,
        });
        self.post_accepted(&qrcode_url(game, "scan"), &body, "qrcode scan")
            .await
    }

    /// Confirm a scanned QR code with account credentials (stream variant,
    /// second step). Returns whether the backend accepted the confirmation.
    pub async fn confirm(
        &self,
        game: GameType,
        ticket: &str,
        uid: &str,
        game_token: &str,
    ) -> Result<bool> {
        let raw = serde_json::to_string(&json!({ "uid": uid, "token": game_token }))
            .map_err(|err| ScanError::parse("qrcode confirm", err.to_string()))?;
        let body = json!({
            "app_id": game.app_id(),
            "device": device_id(),
            "ticket": ticket,
            "payload": {
                "proto": "Account",
                "raw": raw,
            },
        });
        self.post_accepted(&qrcode_url(game, "confirm"), &body, "qrcode confirm")
            .await
    }

    /// Exchange a game token for a session token pair. `Ok(None)` means the
    /// login state has expired and the user must re-authenticate.
    pub async fn session_token_by_game_token(
        &self,
        uid: &str,
        game_token: &str,
    ) -> Result<Option<SessionToken>> {
        let account_id: i64 = uid
            .parse()
            .map_err(|_| ScanError::parse("token exchange", format!("non-numeric uid {uid:?}")))?;
        let body = json!({
            "account_id": account_id,
            "game_token": game_token,
        });
        let url = format!("{TAKUMI_HOST}/account/ma-cn-session/app/getTokenByGameToken");
        let response = self
            .http
            .post(&url)
            .headers(rpc_headers())
            .json(&body)
            .send()
            .await
            .map_err(|err| ScanError::http("token exchange", err))?;
        let envelope: Envelope<TokenByGameTokenData> = response
            .json()
            .await
            .map_err(|err| ScanError::http("token exchange", err))?;
        if envelope.retcode != 0 {
            warn!(
                retcode = envelope.retcode,
                message = envelope.message.as_deref().unwrap_or(""),
                "game token no longer exchangeable"
            );
            return Ok(None);
        }
        let data = envelope
            .data
            .ok_or_else(|| ScanError::parse("token exchange", "missing data field"))?;
        Ok(Some(SessionToken { stoken: data.token.token, mid: data.user_info.mid }))
    }

    /// Derive a fresh game token from a session token pair. `Ok(None)` means
    /// the session token is no longer valid.
    pub async fn game_token_by_session(
        &self,
        stoken: &str,
        mid: &str,
    ) -> Result<Option<String>> {
        let url = format!("{TAKUMI_HOST}/auth/api/getGameToken?stoken={stoken}&mid={mid}");
        let response = self
            .http
            .get(&url)
            .headers(rpc_headers())
            .send()
            .await
            .map_err(|err| ScanError::http("game token refresh", err))?;
        let envelope: Envelope<GameTokenData> = response
            .json()
            .await
            .map_err(|err| ScanError::http("game token refresh", err))?;
        if envelope.retcode != 0 {
            warn!(
                retcode = envelope.retcode,
                message = envelope.message.as_deref().unwrap_or(""),
                "session token rejected"
            );
            return Ok(None);
        }
        Ok(envelope.data.map(|d| d.game_token))
    }

    /// POST, unwrap the envelope, require retcode 0.
    async fn post_enveloped<T: DeserializeOwned>(
        &self,
        url: &str,
        body: &serde_json::Value,
        context: &str,
    ) -> Result<T> {
        let response = self
            .http
            .post(url)
            .headers(rpc_headers())
            .json(body)
            .send()
            .await
            .map_err(|err| ScanError::http(context, err))?;
        let envelope: Envelope<T> = response
            .json()
            .await
            .map_err(|err| ScanError::http(context, err))?;
        if envelope.retcode != 0 {
            return Err(ScanError::auth(context, envelope.retcode));
        }
        envelope
            .data
            .ok_or_else(|| ScanError::parse(context, "missing data field"))
    }

    /// POST where acceptance is just `retcode == 0`; non-zero is a normal
    /// rejection, not an error.
    async fn post_accepted(
        &self,
        url: &str,
        body: &serde_json::Value,
        context: &str,
    ) -> Result<bool> {
        let response = self
            .http
            .post(url)
            .headers(rpc_headers())
            .json(body)
            .send()
            .await
            .map_err(|err| ScanError::http(context, err))?;
        let envelope: Envelope<serde_json::Value> = response
            .json()
            .await
            .map_err(|err| ScanError::http(context, err))?;
        if envelope.retcode != 0 {
            debug!(
                context,
                retcode = envelope.retcode,
                message = envelope.message.as_deref().unwrap_or(""),
                "request rejected"
            );
        }
        Ok(envelope.retcode == 0)
    }
}

/// QR endpoint URL for one operation. hk4e fetch/query go through the hk4e
/// SDK host; everything else lives on the shared SDK host.
fn qrcode_url(game: GameType, op: &str) -> String {
    let host = match (game, op) {
        (GameType::Hk4e, "fetch" | "query") => HK4E_SDK_HOST,
        _ => SDK_HOST,
    };
    format!("{host}/{}/combo/panda/qrcode/{op}", game.biz_segment())
}

/// Standard x-rpc header set presented on every auth request.
fn rpc_headers() -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert("x-rpc-app_id", HeaderValue::from_static(RPC_APP_ID));
    headers.insert("x-rpc-app_version", HeaderValue::from_static(RPC_APP_VERSION));
    headers.insert("x-rpc-client_type", HeaderValue::from_static(RPC_CLIENT_TYPE));
    headers.insert("x-rpc-sdk_version", HeaderValue::from_static(RPC_SDK_VERSION));
    headers.insert("x-rpc-game_biz", HeaderValue::from_static(RPC_GAME_BIZ));
    headers.insert("x-rpc-device_id", match HeaderValue::from_str(device_id()) {
        Ok(value) => value,
        Err(_) => HeaderValue::from_static(""),
    });
    headers.insert("User-Agent", HeaderValue::from_static(MOBILE_UA));
    headers.insert("Referer", HeaderValue::from_static("https://app.mihoyo.com"));
    headers
}

#[derive(Debug, Deserialize)]
struct FetchData {
    url: String,
}

#[derive(Debug, Deserialize)]
struct QueryData {
    stat: String,
    #[serde(default)]
    payload: Option<QueryPayload>,
}

#[derive(Debug, Deserialize)]
struct QueryPayload {
    #[serde(default)]
    raw: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ConfirmedAccount {
    uid: String,
    token: String,
}

#[derive(Debug, Deserialize)]
struct TokenByGameTokenData {
    token: TokenField,
    user_info: UserInfo,
}

#[derive(Debug, Deserialize)]
struct TokenField {
    token: String,
}

#[derive(Debug, Deserialize)]
struct UserInfo {
    mid: String,
}

#[derive(Debug, Deserialize)]
struct GameTokenData {
    game_token: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_id_is_stable_within_process() {
        let a = device_id();
        let b = device_id();
        assert_eq!(a, b);
        assert_eq!(Uuid::parse_str(a).unwrap().get_version_num(), 4);
    }

    #[test]
    fn hk4e_fetch_and_query_use_dedicated_host() {
        assert_eq!(
            qrcode_url(GameType::Hk4e, "fetch"),
            "https://hk4e-sdk.mihoyo.com/hk4e_cn/combo/panda/qrcode/fetch"
        );
        assert_eq!(
            qrcode_url(GameType::Hk4e, "query"),
            "https://hk4e-sdk.mihoyo.com/hk4e_cn/combo/panda/qrcode/query"
        );
        // scan and confirm always go through the shared host
        assert_eq!(
            qrcode_url(GameType::Hk4e, "scan"),
            "https://api-sdk.mihoyo.com/hk4e_cn/combo/panda/qrcode/scan"
        );
        assert_eq!(
            qrcode_url(GameType::Zzz, "confirm"),
            "https://api-sdk.mihoyo.com/nap_cn/combo/panda/qrcode/confirm"
        );
    }

    #[test]
    fn fetch_ticket_is_the_trailing_24_chars() {
        // the query value is longer than a ticket; only the tail counts
        let tail = "A1b2C3d4E5f6G7h8I9j0K1l2";
        assert_eq!(tail.len(), TICKET_LEN);
        let qr = FetchedQr {
            url: format!("https://user.mihoyo.com/qr_code_in_game.html?ticket=extra{tail}"),
        };
        assert_eq!(qr.ticket().as_deref(), Some(tail));

        // holds even when the URL would fail the challenge parser outright
        let qr = FetchedQr { url: format!("opaque-{tail}") };
        assert_eq!(qr.ticket().as_deref(), Some(tail));
    }

    #[test]
    fn fetch_ticket_requires_enough_characters() {
        let qr = FetchedQr { url: "short".to_string() };
        assert!(qr.ticket().is_none());

        // char-counted, not byte-counted
        let qr = FetchedQr { url: "é".repeat(TICKET_LEN) };
        assert_eq!(qr.ticket().as_deref(), Some("é".repeat(TICKET_LEN).as_str()));
    }

    #[test]
    fn envelope_tolerates_missing_fields() {
        let envelope: Envelope<QueryData> =
            serde_json::from_str(r#"{"retcode":-106,"message":"ExpiredCode"}"#).unwrap();
        assert_eq!(envelope.retcode, -106);
        assert!(envelope.data.is_none());

        let envelope: Envelope<QueryData> = serde_json::from_str(
            r#"{"retcode":0,"message":"OK","data":{"stat":"Scanned"}}"#,
        )
        .unwrap();
        assert_eq!(envelope.data.unwrap().stat, "Scanned");
    }

    #[test]
    fn confirmed_payload_raw_is_nested_json() {
        let data: QueryData = serde_json::from_str(
            r#"{"stat":"Confirmed","payload":{"proto":"Account","raw":"{\"uid\":\"123\",\"token\":\"tok\"}"}}"#,
        )
        .unwrap();
        let account: ConfirmedAccount =
            serde_json::from_str(&data.payload.unwrap().raw.unwrap()).unwrap();
        assert_eq!(account.uid, "123");
        assert_eq!(account.token, "tok");
    }
}
