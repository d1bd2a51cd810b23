//! Detection scheduler.
//!
//! Two scan modes share one contract: frames go through the decode worker at
//! most one at a time, results from a superseded session generation are
//! discarded, and a successfully processed ticket is never handed to the
//! login layer twice.
//!
//! - [`StreamScanner`] (push mode) supervises a media decoder subprocess and
//!   decodes frames as they arrive, dropping frames that land while a decode
//!   is in flight. A stall watchdog drives a fallback ladder: raw-pipe
//!   restart first, then the alternate URL, then failure.
//! - [`PollScanner`] (polling mode) pulls frames from a [`FrameGrabber`] at
//!   a fixed cadence, skipping ticks while a decode is in flight, and ends
//!   the session after a bounded run of consecutive acquisition failures.
//!
//! A challenge ends the session: the scheduler tears down its source before
//! surfacing [`ScanUpdate::ChallengeReady`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::config::{CaptureOptions, DecodeOptions, StreamSource};
use crate::decode::QrDecoder;
use crate::error::{Result, ScanError};
use crate::grabber::FrameGrabber;
use crate::login::parse::extract_challenge;
use crate::supervisor::{SessionEvent, StreamPipe};
use crate::types::{DecodeOutcome, DetectionStats, LoginChallenge};
use crate::worker::{DecodeRequest, DecodeResponse, DecodeWorker, Submit};

/// Polling-mode cadence.
pub const POLL_INTERVAL: Duration = Duration::from_millis(500);
/// Consecutive acquisition failures tolerated in polling mode.
pub const MAX_CAPTURE_ERRORS: u32 = 3;
/// Push-mode stall window: no frames and no decoder output for this long
/// advances the fallback ladder.
pub const STALL_WINDOW: Duration = Duration::from_secs(5);

/// Update channel depth.
const UPDATE_QUEUE: usize = 16;

static NEXT_GENERATION: AtomicU64 = AtomicU64::new(1);

fn next_generation() -> u64 {
    NEXT_GENERATION.fetch_add(1, Ordering::Relaxed)
}

/// Progress updates surfaced by a scanner task.
#[derive(Debug)]
pub enum ScanUpdate {
    /// A QR code was decoded (not yet validated as a login payload).
    QrDetected { text: String, generation: u64 },
    /// A validated, non-duplicate login challenge. The capture source has
    /// already been torn down; the session is over.
    ChallengeReady { challenge: LoginChallenge, generation: u64 },
    /// The stall watchdog restarted capture in a degraded configuration.
    FallbackEngaged { stage: FallbackStage, generation: u64 },
    /// The scanner task finished, with the terminal error if any.
    Ended { error: Option<ScanError> },
}

/// Channels returned by [`StreamScanner::spawn`] / [`PollScanner::spawn`].
#[derive(Debug)]
pub struct ScannerChannels {
    pub updates: mpsc::Receiver<ScanUpdate>,
    pub stats: watch::Receiver<DetectionStats>,
    pub cancel: CancellationToken,
}

impl ScannerChannels {
    /// Split into a `Stream` of updates plus the stats and cancel handles,
    /// for combinator-style consumers.
    pub fn into_parts(
        self,
    ) -> (
        tokio_stream::wrappers::ReceiverStream<ScanUpdate>,
        watch::Receiver<DetectionStats>,
        CancellationToken,
    ) {
        (
            tokio_stream::wrappers::ReceiverStream::new(self.updates),
            self.stats,
            self.cancel,
        )
    }
}

/// Fallback ladder position for push mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FallbackStage {
    /// Caller-requested configuration against the primary URL.
    Primary,
    /// Same URL, raw RGB24 pipe at a fixed small size.
    RawPipe,
    /// Alternate URL over a PNG pipe.
    AlternateUrl,
}

impl FallbackStage {
    /// Next rung of the ladder, if one exists.
    fn next(self, has_alt_url: bool) -> Option<FallbackStage> {
        match self {
            FallbackStage::Primary => Some(FallbackStage::RawPipe),
            FallbackStage::RawPipe => has_alt_url.then_some(FallbackStage::AlternateUrl),
            FallbackStage::AlternateUrl => None,
        }
    }
}

/// Per-session scheduler state: generation tag, counters, and the ticket
/// dedup memory. The dedup memory survives fallback restarts.
#[derive(Debug)]
struct CaptureSession {
    generation: u64,
    stats: DetectionStats,
    last_ticket: Option<String>,
}

impl CaptureSession {
    fn new() -> Self {
        Self { generation: next_generation(), stats: DetectionStats::default(), last_ticket: None }
    }

    /// Start a new generation after a fallback restart. In-flight results
    /// from the previous generation become stale.
    fn renew(&mut self) -> u64 {
        self.generation = next_generation();
        self.generation
    }

    /// Record a decode hit; returns a challenge only for a valid payload
    /// carrying a ticket not yet processed this session.
    fn register_hit(&mut self, text: &str) -> Option<LoginChallenge> {
        self.stats.record_hit();
        let challenge = match extract_challenge(text) {
            Some(challenge) => challenge,
            None => {
                debug!(len = text.len(), "decoded payload is not a login challenge");
                return None;
            }
        };
        if self.last_ticket.as_deref() == Some(challenge.ticket.as_str()) {
            debug!("duplicate ticket suppressed");
            return None;
        }
        self.last_ticket = Some(challenge.ticket.clone());
        Some(challenge)
    }

    fn register_miss(&mut self) {
        self.stats.record_miss();
    }
}

/// One running capture source in push mode.
trait CapturePipe: Send {
    fn events(&mut self) -> &mut mpsc::Receiver<SessionEvent>;
    fn stop(&mut self);
}

/// Opens capture pipes for the push-mode loop. The production source spawns
/// the supervised media decoder; tests script their own pipes.
trait PipeSource: Send {
    type Pipe: CapturePipe;
    fn open(
        &mut self,
        source: &StreamSource,
        url: &str,
        capture: &CaptureOptions,
    ) -> Result<Self::Pipe>;
}

impl CapturePipe for StreamPipe {
    fn events(&mut self) -> &mut mpsc::Receiver<SessionEvent> {
        &mut self.events
    }

    fn stop(&mut self) {
        StreamPipe::stop(self);
    }
}

struct FfmpegPipes;

impl PipeSource for FfmpegPipes {
    type Pipe = StreamPipe;

    fn open(
        &mut self,
        source: &StreamSource,
        url: &str,
        capture: &CaptureOptions,
    ) -> Result<StreamPipe> {
        StreamPipe::spawn(source, url, capture)
    }
}

/// Push-mode scanner over a supervised media decoder subprocess.
pub struct StreamScanner;

impl StreamScanner {
    pub fn spawn(
        source: StreamSource,
        capture: CaptureOptions,
        decode: DecodeOptions,
    ) -> ScannerChannels {
        let (updates_tx, updates) = mpsc::channel(UPDATE_QUEUE);
        let (stats_tx, stats) = watch::channel(DetectionStats::default());
        let cancel = CancellationToken::new();
        let task_cancel = cancel.clone();
        tokio::spawn(async move {
            let mut pipes = FfmpegPipes;
            let result = stream_scan(
                &mut pipes,
                source,
                capture,
                decode,
                &updates_tx,
                &stats_tx,
                task_cancel,
            )
            .await;
            finish(result, &updates_tx).await;
        });
        ScannerChannels { updates, stats, cancel }
    }
}

/// Polling-mode scanner over a pull-based frame source.
pub struct PollScanner;

impl PollScanner {
    pub fn spawn<G: FrameGrabber>(grabber: G, decode: DecodeOptions) -> ScannerChannels {
        let (updates_tx, updates) = mpsc::channel(UPDATE_QUEUE);
        let (stats_tx, stats) = watch::channel(DetectionStats::default());
        let cancel = CancellationToken::new();
        let task_cancel = cancel.clone();
        tokio::spawn(async move {
            let result = poll_scan(grabber, decode, &updates_tx, &stats_tx, task_cancel).await;
            finish(result, &updates_tx).await;
        });
        ScannerChannels { updates, stats, cancel }
    }
}

async fn finish(result: Result<()>, updates: &mpsc::Sender<ScanUpdate>) {
    let error = match result {
        Ok(()) => None,
        Err(err) => {
            error!(%err, "scan session failed");
            Some(err)
        }
    };
    let _ = updates.send(ScanUpdate::Ended { error }).await;
}

async fn stream_scan<P: PipeSource>(
    pipes: &mut P,
    source: StreamSource,
    capture: CaptureOptions,
    decode: DecodeOptions,
    updates: &mpsc::Sender<ScanUpdate>,
    stats_tx: &watch::Sender<DetectionStats>,
    cancel: CancellationToken,
) -> Result<()> {
    let (worker, _worker_task) = DecodeWorker::spawn(QrDecoder::new(decode));
    let mut session = CaptureSession::new();
    let mut stage = FallbackStage::Primary;
    let mut pipe = pipes.open(&source, &source.url, &capture)?;
    info!(url = %source.url, generation = session.generation, "stream scan started");

    let started = Instant::now();
    let mut last_activity = Instant::now();
    let mut pending: Option<oneshot::Receiver<DecodeResponse>> = None;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                pipe.stop();
                info!("stream scan cancelled");
                return Ok(());
            }

            response = wait_pending(&mut pending), if pending.is_some() => {
                pending = None;
                let Some(response) = response else { continue };
                if response.generation != session.generation {
                    debug!(
                        got = response.generation,
                        current = session.generation,
                        "discarding stale decode result"
                    );
                    continue;
                }
                match response.outcome {
                    DecodeOutcome::Hit { text } => {
                        let _ = updates
                            .send(ScanUpdate::QrDetected {
                                text: text.clone(),
                                generation: session.generation,
                            })
                            .await;
                        let challenge = session.register_hit(&text);
                        stats_tx.send_replace(session.stats);
                        if let Some(challenge) = challenge {
                            pipe.stop();
                            info!(game = challenge.game_type.as_str(), "login challenge detected");
                            let _ = updates
                                .send(ScanUpdate::ChallengeReady {
                                    challenge,
                                    generation: session.generation,
                                })
                                .await;
                            return Ok(());
                        }
                    }
                    DecodeOutcome::Miss { reason } => {
                        trace!(%reason, "decode miss");
                        session.register_miss();
                        stats_tx.send_replace(session.stats);
                    }
                }
            }

            event = pipe.events().recv() => match event {
                Some(SessionEvent::FrameReady(frame)) => {
                    last_activity = Instant::now();
                    if pending.is_some() {
                        // single-flight: drop frames while a decode runs
                        trace!("frame dropped, decode in flight");
                        continue;
                    }
                    match worker.submit(DecodeRequest { frame, generation: session.generation }) {
                        Submit::Accepted(rx) => pending = Some(rx),
                        Submit::Busy => trace!("frame dropped, worker busy"),
                        Submit::Closed => return Err(ScanError::WorkerUnavailable),
                    }
                }
                Some(SessionEvent::LogLine(_)) => {
                    // decoder output counts as liveness even before frames
                    last_activity = Instant::now();
                }
                Some(SessionEvent::SilentSinceSpawn) => {
                    warn!(
                        "media decoder silent since spawn; check stream liveness, \
                         Cookie/Referer headers, and TLS settings"
                    );
                }
                Some(SessionEvent::ProcessExited { code }) => {
                    return Err(ScanError::session_ended(format!(
                        "media decoder exited with code {code:?}"
                    )));
                }
                None => {
                    return Err(ScanError::session_ended("capture event channel closed"));
                }
            },

            _ = tokio::time::sleep_until(last_activity + STALL_WINDOW) => {
                pipe.stop();
                let Some(next) = stage.next(source.alt_url.is_some()) else {
                    return Err(ScanError::NoFrames { waited: started.elapsed() });
                };
                stage = next;
                // a decode still in flight carries the old generation and is
                // discarded when its result lands
                let generation = session.renew();
                let (url, options) = match stage {
                    FallbackStage::RawPipe => (source.url.as_str(), capture.raw_fallback()),
                    FallbackStage::AlternateUrl => {
                        // guarded by stage.next
                        let alt = source.alt_url.as_deref().unwrap_or(source.url.as_str());
                        (alt, capture.png_fallback())
                    }
                    FallbackStage::Primary => unreachable!("ladder never returns to primary"),
                };
                warn!(?stage, url, generation, "no capture activity, engaging fallback");
                pipe = pipes.open(&source, url, &options)?;
                last_activity = Instant::now();
                let _ = updates.send(ScanUpdate::FallbackEngaged { stage, generation }).await;
            }
        }
    }
}

async fn wait_pending(
    pending: &mut Option<oneshot::Receiver<DecodeResponse>>,
) -> Option<DecodeResponse> {
    match pending.as_mut() {
        Some(rx) => rx.await.ok(),
        // select arm is guarded; never resolve without a pending decode
        None => std::future::pending().await,
    }
}

async fn poll_scan<G: FrameGrabber>(
    mut grabber: G,
    decode: DecodeOptions,
    updates: &mpsc::Sender<ScanUpdate>,
    stats_tx: &watch::Sender<DetectionStats>,
    cancel: CancellationToken,
) -> Result<()> {
    let (worker, _worker_task) = DecodeWorker::spawn(QrDecoder::new(decode));
    let mut session = CaptureSession::new();
    info!(generation = session.generation, "poll scan started");

    let mut ticks = tokio::time::interval(POLL_INTERVAL);
    // decode time eats into the cadence; never burst to catch up
    ticks.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut consecutive_errors = 0u32;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("poll scan cancelled");
                return Ok(());
            }
            _ = ticks.tick() => {}
        }

        let frame = match grabber.grab().await {
            Ok(Some(frame)) => {
                consecutive_errors = 0;
                frame
            }
            Ok(None) => {
                info!("frame source exhausted");
                return Ok(());
            }
            Err(err) => {
                consecutive_errors += 1;
                warn!(%err, consecutive_errors, "frame acquisition failed");
                if consecutive_errors >= MAX_CAPTURE_ERRORS {
                    return Err(ScanError::Capture {
                        reason: err.to_string(),
                        attempts: consecutive_errors,
                    });
                }
                continue;
            }
        };

        let response = worker
            .decode(DecodeRequest { frame, generation: session.generation })
            .await?;
        match response.outcome {
            DecodeOutcome::Hit { text } => {
                let _ = updates
                    .send(ScanUpdate::QrDetected {
                        text: text.clone(),
                        generation: session.generation,
                    })
                    .await;
                let challenge = session.register_hit(&text);
                stats_tx.send_replace(session.stats);
                if let Some(challenge) = challenge {
                    info!(game = challenge.game_type.as_str(), "login challenge detected");
                    let _ = updates
                        .send(ScanUpdate::ChallengeReady {
                            challenge,
                            generation: session.generation,
                        })
                        .await;
                    return Ok(());
                }
            }
            DecodeOutcome::Miss { reason } => {
                trace!(%reason, "decode miss");
                session.register_miss();
                stats_tx.send_replace(session.stats);
            }
        }
    }
}
