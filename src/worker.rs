//! Decode worker task.
//!
//! Owns a [`QrDecoder`] and serves decode requests sequentially over a
//! bounded channel. The channel depth of one plus [`DecodeWorker::submit`]'s
//! non-blocking send gives the scheduler its single-flight guarantee: while a
//! decode is outstanding, further frames are rejected (and dropped) instead
//! of queueing up behind a slow decode.
//!
//! Every request carries the generation of the capture session that produced
//! the frame, so results that outlive their session can be discarded.

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::decode::QrDecoder;
use crate::error::{Result, ScanError};
use crate::types::{DecodeOutcome, Frame};

/// A frame queued for decoding, tagged with its session generation.
#[derive(Debug)]
pub struct DecodeRequest {
    pub frame: Frame,
    pub generation: u64,
}

/// A finished decode, carrying the generation of the request.
#[derive(Debug)]
pub struct DecodeResponse {
    pub outcome: DecodeOutcome,
    pub generation: u64,
}

/// Result of a non-blocking submit.
#[derive(Debug)]
pub enum Submit {
    /// Accepted; the receiver resolves when the decode finishes.
    Accepted(oneshot::Receiver<DecodeResponse>),
    /// A decode is already in flight; the frame should be dropped.
    Busy,
    /// The worker task has shut down.
    Closed,
}

type Job = (DecodeRequest, oneshot::Sender<DecodeResponse>);

/// Handle to the decode worker task.
#[derive(Debug, Clone)]
pub struct DecodeWorker {
    tx: mpsc::Sender<Job>,
}

impl DecodeWorker {
    /// Spawn the worker. Requests submitted before the task is scheduled
    /// simply queue in the channel; there is no warm-up window to race.
    pub fn spawn(decoder: QrDecoder) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(1);
        let handle = tokio::spawn(run(decoder, rx));
        (Self { tx }, handle)
    }

    /// Submit a frame without waiting. Used by push mode, where frames
    /// arriving during an in-flight decode are dropped.
    pub fn submit(&self, request: DecodeRequest) -> Submit {
        let (reply_tx, reply_rx) = oneshot::channel();
        match self.tx.try_send((request, reply_tx)) {
            Ok(()) => Submit::Accepted(reply_rx),
            Err(mpsc::error::TrySendError::Full(_)) => Submit::Busy,
            Err(mpsc::error::TrySendError::Closed(_)) => Submit::Closed,
        }
    }

    /// Submit a frame and wait for its outcome. Used by polling mode, which
    /// is naturally sequential.
    pub async fn decode(&self, request: DecodeRequest) -> Result<DecodeResponse> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send((request, reply_tx))
            .await
            .map_err(|_| ScanError::WorkerUnavailable)?;
        reply_rx.await.map_err(|_| ScanError::WorkerUnavailable)
    }
}

async fn run(decoder: QrDecoder, mut rx: mpsc::Receiver<Job>) {
    while let Some((request, reply)) = rx.recv().await {
        let generation = request.generation;
        // the cascade is CPU-bound; keep it off the async threads
        let outcome = tokio::task::spawn_blocking(move || decoder.decode(&request.frame))
            .await
            .unwrap_or_else(|err| DecodeOutcome::miss(format!("decode task failed: {err}")));
        if reply.send(DecodeResponse { outcome, generation }).is_err() {
            debug!(generation, "decode result dropped, requester gone");
        }
    }
}
