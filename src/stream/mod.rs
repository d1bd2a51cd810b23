//! Stream combinators for frame extraction.
//!
//! [`DemuxExt::frames`] lifts the [`FrameDemuxer`] onto any `Stream` of byte
//! chunks, yielding complete [`Frame`]s regardless of chunk boundaries.

use std::collections::VecDeque;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures::{ready, Stream};
use pin_project_lite::pin_project;

use crate::demux::{DemuxStats, FrameDemuxer};
use crate::types::{Frame, FrameFormat};

pin_project! {
    /// Stream adapter produced by [`DemuxExt::frames`].
    ///
    /// One upstream chunk can complete several frames; completed frames are
    /// queued and yielded one per poll.
    #[must_use = "streams do nothing unless polled"]
    pub struct Frames<S> {
        #[pin]
        inner: S,
        demux: FrameDemuxer,
        ready: VecDeque<Frame>,
    }
}

impl<S> Frames<S> {
    fn new(inner: S, format: FrameFormat) -> Self {
        Self { inner, demux: FrameDemuxer::new(format), ready: VecDeque::new() }
    }

    /// Demux counters accumulated so far.
    pub fn stats(&self) -> DemuxStats {
        self.demux.stats()
    }
}

impl<S, B> Stream for Frames<S>
where
    S: Stream<Item = B>,
    B: AsRef<[u8]>,
{
    type Item = Frame;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let mut this = self.project();
        loop {
            if let Some(frame) = this.ready.pop_front() {
                return Poll::Ready(Some(frame));
            }
            match ready!(this.inner.as_mut().poll_next(cx)) {
                Some(chunk) => {
                    this.ready.extend(this.demux.append(chunk.as_ref()));
                }
                // trailing partial data is dropped with the stream
                None => return Poll::Ready(None),
            }
        }
    }
}

/// Extension trait adding frame extraction to byte-chunk streams.
pub trait DemuxExt: Stream {
    /// Cut this stream of byte chunks into complete frames using the given
    /// framing rule.
    fn frames(self, format: FrameFormat) -> Frames<Self>
    where
        Self: Sized,
    {
        Frames::new(self, format)
    }
}

impl<S: Stream> DemuxExt for S {}

#[cfg(test)]
mod tests {
    use futures::StreamExt;

    use super::*;

    const PNG_HEADER: [u8; 8] = [0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A];
    const PNG_IEND: [u8; 8] = [0x49, 0x45, 0x4E, 0x44, 0xAE, 0x42, 0x60, 0x82];

    fn fake_png(body: &[u8]) -> Vec<u8> {
        let mut png = PNG_HEADER.to_vec();
        png.extend_from_slice(body);
        png.extend_from_slice(&PNG_IEND);
        png
    }

    #[tokio::test]
    async fn frames_span_chunk_boundaries() {
        let png = fake_png(b"payload");
        let mid = png.len() / 2;
        let chunks = vec![png[..mid].to_vec(), png[mid..].to_vec()];
        let frames: Vec<Frame> = futures::stream::iter(chunks)
            .frames(FrameFormat::Png)
            .collect()
            .await;
        assert_eq!(frames.len(), 1);
        assert_eq!(&frames[0].payload[..], &png[..]);
    }

    #[tokio::test]
    async fn one_chunk_can_yield_many_frames() {
        let mut chunk = fake_png(b"a");
        chunk.extend_from_slice(&fake_png(b"b"));
        chunk.extend_from_slice(&fake_png(b"c"));
        let frames: Vec<Frame> = futures::stream::iter(vec![chunk])
            .frames(FrameFormat::Png)
            .collect()
            .await;
        assert_eq!(frames.len(), 3);
    }

    #[tokio::test]
    async fn end_of_stream_drops_partial_tail() {
        let png = fake_png(b"whole");
        let mut chunks = vec![png.clone()];
        chunks.push(PNG_HEADER.to_vec()); // truncated second frame
        let frames: Vec<Frame> = futures::stream::iter(chunks)
            .frames(FrameFormat::Png)
            .collect()
            .await;
        assert_eq!(frames.len(), 1);
        assert_eq!(&frames[0].payload[..], &png[..]);
    }
}
