//! Error types for capture, decode, and login operations.
//!
//! The taxonomy separates failures that end a capture session (spawn
//! failures, frame starvation, exhausted fallbacks) from failures of the
//! login exchange (missing credentials, rejected tickets, HTTP transport).
//! Per-frame decode misses and malformed frames are *not* errors; they are
//! normal outcomes reported through
//! [`DecodeOutcome`](crate::types::DecodeOutcome) and demux counters.

use std::time::Duration;

use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T, E = ScanError> = std::result::Result<T, E>;

/// Errors surfaced by the capture pipeline and the login flow.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum ScanError {
    /// The media decoder subprocess could not be launched.
    #[error("failed to launch media decoder: {reason}")]
    Spawn {
        reason: String,
        #[source]
        source: Option<std::io::Error>,
    },

    /// No frames (and no decoder output at all) arrived within the stall
    /// window, and every fallback stage has been tried.
    #[error("no frames received after {waited:?}, fallbacks exhausted")]
    NoFrames { waited: Duration },

    /// Frame acquisition failed repeatedly in polling mode.
    #[error("frame capture failed {attempts} times in a row: {reason}")]
    Capture { reason: String, attempts: u32 },

    /// The account has neither a game token nor a session token to
    /// bootstrap from.
    #[error("account {uid} has no usable login credentials")]
    MissingCredentials { uid: String },

    /// The auth backend rejected a request with a non-zero retcode.
    #[error("{context} rejected by auth backend (retcode {retcode})")]
    Auth { context: String, retcode: i64 },

    /// HTTP transport failure while talking to the auth backend.
    #[error("http request failed during {context}")]
    Http {
        context: String,
        #[source]
        source: reqwest::Error,
    },

    /// A response body did not have the expected shape.
    #[error("malformed response during {context}: {details}")]
    Parse { context: String, details: String },

    /// The decode worker task has shut down and cannot accept requests.
    #[error("decode worker unavailable")]
    WorkerUnavailable,

    /// The login poll loop hit its overall ceiling without confirmation.
    #[error("login not confirmed within {limit:?}")]
    Timeout { limit: Duration },

    /// The capture session ended before a challenge was produced.
    #[error("capture session ended: {reason}")]
    SessionEnded { reason: String },
}

impl ScanError {
    pub fn spawn(reason: impl Into<String>, source: Option<std::io::Error>) -> Self {
        ScanError::Spawn { reason: reason.into(), source }
    }

    pub fn auth(context: impl Into<String>, retcode: i64) -> Self {
        ScanError::Auth { context: context.into(), retcode }
    }

    pub fn http(context: impl Into<String>, source: reqwest::Error) -> Self {
        ScanError::Http { context: context.into(), source }
    }

    pub fn parse(context: impl Into<String>, details: impl Into<String>) -> Self {
        ScanError::Parse { context: context.into(), details: details.into() }
    }

    pub fn session_ended(reason: impl Into<String>) -> Self {
        ScanError::SessionEnded { reason: reason.into() }
    }

    /// Whether retrying the same operation could plausibly succeed.
    ///
    /// Advisory only; the pipeline itself never auto-retries beyond the
    /// built-in fallback ladder.
    pub fn is_retryable(&self) -> bool {
        match self {
            ScanError::NoFrames { .. }
            | ScanError::Capture { .. }
            | ScanError::Http { .. }
            | ScanError::WorkerUnavailable
            | ScanError::Timeout { .. }
            | ScanError::SessionEnded { .. } => true,
            ScanError::Spawn { .. }
            | ScanError::MissingCredentials { .. }
            | ScanError::Auth { .. }
            | ScanError::Parse { .. } => false,
        }
    }

    /// Human-oriented remediation hints for operators.
    pub fn recovery_suggestions(&self) -> Vec<&'static str> {
        match self {
            ScanError::Spawn { .. } => vec![
                "install ffmpeg or point ffmpeg_path / FFMPEG_PATH at the binary",
                "check that the binary is executable on this platform",
            ],
            ScanError::NoFrames { .. } => vec![
                "check that the stream URL is actually live",
                "check Cookie / Referer headers required by the stream host",
                "enable tls_insecure if the host uses a self-signed certificate",
                "try a lower-quality stream line",
            ],
            ScanError::Capture { .. } => vec![
                "check that the capture source is still available",
                "restart the capture session",
            ],
            ScanError::MissingCredentials { .. } => vec![
                "log the account in again to obtain a fresh game token",
            ],
            ScanError::Auth { .. } => vec![
                "the login state may have expired, re-authenticate the account",
                "check that the ticket has not already been consumed",
            ],
            ScanError::Http { .. } => vec![
                "check network connectivity to the auth backend",
                "retry after a short delay",
            ],
            ScanError::Parse { .. } => vec![
                "the auth backend response format may have changed",
            ],
            ScanError::WorkerUnavailable => vec![
                "restart the capture session to respawn the decode worker",
            ],
            ScanError::Timeout { .. } => vec![
                "generate a fresh QR code and scan again",
            ],
            ScanError::SessionEnded { .. } => vec![
                "restart the capture session",
            ],
        }
    }
}

impl From<std::io::Error> for ScanError {
    fn from(err: std::io::Error) -> Self {
        ScanError::Spawn { reason: err.to_string(), source: Some(err) }
    }
}

impl From<reqwest::Error> for ScanError {
    fn from(err: reqwest::Error) -> Self {
        ScanError::Http { context: "request".to_string(), source: err }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification() {
        assert!(ScanError::NoFrames { waited: Duration::from_secs(5) }.is_retryable());
        assert!(ScanError::WorkerUnavailable.is_retryable());
        assert!(!ScanError::spawn("ffmpeg not found", None).is_retryable());
        assert!(!ScanError::MissingCredentials { uid: "1".into() }.is_retryable());
        assert!(!ScanError::auth("qrcode scan", -106).is_retryable());
    }

    #[test]
    fn every_error_suggests_a_remedy() {
        let errors = [
            ScanError::spawn("missing", None),
            ScanError::NoFrames { waited: Duration::from_secs(5) },
            ScanError::Capture { reason: "read failed".into(), attempts: 3 },
            ScanError::MissingCredentials { uid: "42".into() },
            ScanError::auth("confirm", -1),
            ScanError::parse("token exchange", "no data field"),
            ScanError::WorkerUnavailable,
            ScanError::Timeout { limit: Duration::from_secs(300) },
            ScanError::session_ended("decoder exited"),
        ];
        for err in errors {
            assert!(!err.recovery_suggestions().is_empty(), "{err}");
        }
    }

    #[test]
    fn display_includes_context() {
        let err = ScanError::auth("qrcode confirm", -106);
        assert!(err.to_string().contains("qrcode confirm"));
        assert!(err.to_string().contains("-106"));
    }
}
