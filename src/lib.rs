//! Automated QR-code login against live video streams.
//!
//! The pipeline spawns a media decoder (ffmpeg) against a stream URL, cuts
//! its output into frames, runs a cascade of QR decode strategies over them,
//! and drives the resulting login challenge through the backend auth
//! exchange. A polling variant captures frames from any pull-based source
//! instead of a stream.
//!
//! # Stream scan
//!
//! ```no_run
//! use qrpipe::{CaptureOptions, DecodeOptions, QrPipe, ScanUpdate, StreamSource};
//!
//! # async fn run() -> qrpipe::Result<()> {
//! let source = StreamSource {
//!     url: "https://example.com/live.flv".into(),
//!     alt_url: Some("https://example.com/live-low.flv".into()),
//!     headers: vec![("Referer".into(), "https://example.com/".into())],
//! };
//! let mut scan = QrPipe::stream(source, CaptureOptions::default(), DecodeOptions::default());
//! while let Some(update) = scan.updates.recv().await {
//!     if let ScanUpdate::ChallengeReady { challenge, .. } = update {
//!         println!("ticket {} for {}", challenge.ticket, challenge.game_type.as_str());
//!         break;
//!     }
//! }
//! # Ok(())
//! # }
//! ```
//!
//! # End-to-end login
//!
//! [`QrPipe::login_via_stream`] chains credential refresh, the stream scan,
//! and the scan/confirm exchange into one call:
//!
//! ```no_run
//! use qrpipe::{Account, CaptureOptions, DecodeOptions, QrPipe, StreamSource};
//!
//! # async fn run() -> qrpipe::Result<()> {
//! let mut account = Account::new("100001");
//! account.game_token = Some("stored-token".into());
//! let outcome = QrPipe::login_via_stream(
//!     StreamSource::new("https://example.com/live.flv"),
//!     CaptureOptions::default(),
//!     DecodeOptions::default(),
//!     &mut account,
//!     true,
//! )
//! .await?;
//! println!("login outcome: {outcome:?}");
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod decode;
pub mod demux;
pub mod error;
pub mod grabber;
pub mod login;
pub mod scheduler;
pub mod stream;
pub mod supervisor;
pub mod types;
pub mod worker;

pub use config::{CaptureOptions, DecodeOptions, StreamSource};
pub use decode::QrDecoder;
pub use demux::FrameDemuxer;
pub use error::{Result, ScanError};
pub use grabber::FrameGrabber;
pub use login::{Account, AuthClient, LoginFlow, SubmitOutcome};
pub use scheduler::{PollScanner, ScanUpdate, ScannerChannels, StreamScanner};
pub use stream::DemuxExt;
pub use supervisor::StreamPipe;
pub use types::{
    Codec, DecodeOutcome, DetectionStats, Frame, FrameFormat, GameType, LoginChallenge,
    PipeFormat,
};

use tracing::info;

/// Facade over the two scan modes and the end-to-end login flow.
pub struct QrPipe;

impl QrPipe {
    /// Start a push-mode scan over a live stream. The returned channels
    /// surface progress updates and detection counters; cancel the token to
    /// stop.
    pub fn stream(
        source: StreamSource,
        capture: CaptureOptions,
        decode: DecodeOptions,
    ) -> ScannerChannels {
        StreamScanner::spawn(source, capture, decode)
    }

    /// Start a polling-mode scan over any pull-based frame source.
    pub fn poll<G: FrameGrabber>(grabber: G, decode: DecodeOptions) -> ScannerChannels {
        PollScanner::spawn(grabber, decode)
    }

    /// Scan a stream until a login challenge appears, then log `account` in
    /// with it.
    ///
    /// Refreshes the account's credentials first, runs the stream scan to
    /// the first valid challenge, and submits it. With `auto_confirm` the
    /// whole exchange completes unattended; without it the call returns
    /// [`SubmitOutcome::AwaitingConfirmation`] and the caller confirms via
    /// [`LoginFlow::confirm`].
    pub async fn login_via_stream(
        source: StreamSource,
        capture: CaptureOptions,
        decode: DecodeOptions,
        account: &mut Account,
        auto_confirm: bool,
    ) -> Result<SubmitOutcome> {
        let flow = LoginFlow::new(AuthClient::new()?, auto_confirm);
        flow.refresh_credentials(account).await?;

        let mut scan = Self::stream(source, capture, decode);
        let challenge = loop {
            match scan.updates.recv().await {
                Some(ScanUpdate::ChallengeReady { challenge, .. }) => break challenge,
                Some(ScanUpdate::Ended { error: Some(err) }) => return Err(err),
                Some(ScanUpdate::Ended { error: None }) => {
                    return Err(ScanError::session_ended("scan ended without a challenge"));
                }
                Some(_) => continue,
                None => {
                    return Err(ScanError::session_ended("scan task dropped its channel"));
                }
            }
        };
        info!(
            game = challenge.game_type.as_str(),
            stats = ?*scan.stats.borrow(),
            "challenge detected, submitting login"
        );
        flow.submit(&challenge, account).await
    }
}
