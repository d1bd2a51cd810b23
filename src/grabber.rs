//! Frame acquisition trait for polling mode.

use async_trait::async_trait;

use crate::error::Result;
use crate::types::Frame;

/// Pull-based frame source, polled by the scheduler at a fixed cadence.
///
/// Implementations wrap whatever can produce a picture on demand: a screen
/// grabber, a window capture API, a test fixture. Transient acquisition
/// failures should be returned as errors; the scheduler tolerates a bounded
/// run of consecutive failures before ending the session.
#[async_trait]
pub trait FrameGrabber: Send + 'static {
    /// Capture one frame. `Ok(None)` means the source is exhausted and the
    /// session should end cleanly.
    async fn grab(&mut self) -> Result<Option<Frame>>;
}

#[async_trait]
impl FrameGrabber for Box<dyn FrameGrabber> {
    async fn grab(&mut self) -> Result<Option<Frame>> {
        (**self).grab().await
    }
}
