//! Incremental frame demultiplexer.
//!
//! Splits the continuous stdout byte stream of the media decoder into
//! complete frames. Chunks may arrive with arbitrary boundaries; the demuxer
//! buffers partial data and emits a frame the moment its end marker (or, for
//! raw pipes, its full byte count) is present. The sequence of frames emitted
//! for a given byte stream is independent of how that stream was chunked.
//!
//! Three framing rules, selected by [`FrameFormat`]:
//! - PNG: frames end with the 8-byte IEND chunk tail and must begin with the
//!   PNG signature
//! - MJPEG: frames end at the first `FFD9` marker and must begin with `FFD8`
//! - raw: fixed-size `width * height * 3` RGB24 blocks, no validation
//!
//! Malformed frames (bad header or footer) are dropped and counted, never
//! surfaced as errors. The internal buffer is capped; on overflow the buffer
//! is truncated at the last complete-frame boundary, or to its most recent
//! half when no boundary exists.

use tracing::{debug, warn};

use crate::types::{Frame, FrameFormat};

/// PNG stream signature (first 8 bytes of every PNG).
const PNG_HEADER: [u8; 8] = [0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A];
/// Tail of the IEND chunk: type + CRC. Terminates every PNG.
const PNG_IEND: [u8; 8] = [0x49, 0x45, 0x4E, 0x44, 0xAE, 0x42, 0x60, 0x82];
/// JPEG start-of-image marker.
const JPEG_SOI: [u8; 2] = [0xFF, 0xD8];
/// JPEG end-of-image marker. Cannot occur inside entropy-coded data, where
/// 0xFF bytes are always stuffed with 0x00.
const JPEG_EOI: [u8; 2] = [0xFF, 0xD9];

/// Default buffer cap: 10 MiB.
pub const DEFAULT_BUFFER_CAP: usize = 10 * 1024 * 1024;

/// Counters kept per demuxer instance.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DemuxStats {
    /// Complete, valid frames emitted.
    pub frames: u64,
    /// Malformed frames dropped (bad header or footer).
    pub dropped: u64,
    /// Buffer overflow truncations.
    pub overflows: u64,
}

/// Incremental demuxer for one capture session.
#[derive(Debug)]
pub struct FrameDemuxer {
    format: FrameFormat,
    buf: Vec<u8>,
    cap: usize,
    stats: DemuxStats,
}

impl FrameDemuxer {
    pub fn new(format: FrameFormat) -> Self {
        Self::with_buffer_cap(format, DEFAULT_BUFFER_CAP)
    }

    pub fn with_buffer_cap(format: FrameFormat, cap: usize) -> Self {
        Self { format, buf: Vec::new(), cap, stats: DemuxStats::default() }
    }

    pub fn format(&self) -> FrameFormat {
        self.format
    }

    pub fn stats(&self) -> DemuxStats {
        self.stats
    }

    /// Bytes currently buffered (partial frame data).
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Feed one chunk of stream bytes, returning every frame completed by it.
    pub fn append(&mut self, chunk: &[u8]) -> Vec<Frame> {
        self.buf.extend_from_slice(chunk);
        if self.buf.len() > self.cap {
            self.truncate_overflow();
        }
        let mut frames = Vec::new();
        while let Some(frame) = self.next_frame() {
            frames.push(frame);
        }
        frames
    }

    /// Extract the next complete frame, silently dropping malformed
    /// candidates along the way.
    fn next_frame(&mut self) -> Option<Frame> {
        loop {
            let end = self.find_frame_end()?;
            let candidate: Vec<u8> = self.buf.drain(..end).collect();
            if self.validate(&candidate) {
                self.stats.frames += 1;
                return Some(Frame::new(candidate, self.format));
            }
            self.stats.dropped += 1;
            debug!(
                codec = self.format.codec_name(),
                len = candidate.len(),
                "dropping malformed frame"
            );
        }
    }

    /// End offset (exclusive) of the earliest complete frame, if buffered.
    fn find_frame_end(&self) -> Option<usize> {
        match self.format {
            FrameFormat::Raw { .. } => {
                let size = self.format.raw_frame_size().unwrap_or(0);
                (size > 0 && self.buf.len() >= size).then_some(size)
            }
            FrameFormat::Png => find_forward(&self.buf, &PNG_IEND).map(|pos| pos + PNG_IEND.len()),
            FrameFormat::Mjpeg => {
                find_forward(&self.buf, &JPEG_EOI).map(|pos| pos + JPEG_EOI.len())
            }
        }
    }

    fn validate(&self, candidate: &[u8]) -> bool {
        match self.format {
            FrameFormat::Raw { .. } => true,
            FrameFormat::Png => {
                candidate.len() >= PNG_HEADER.len() + PNG_IEND.len()
                    && candidate.starts_with(&PNG_HEADER)
                    && candidate.ends_with(&PNG_IEND)
            }
            FrameFormat::Mjpeg => {
                candidate.len() >= JPEG_SOI.len() + JPEG_EOI.len()
                    && candidate.starts_with(&JPEG_SOI)
                    && candidate.ends_with(&JPEG_EOI)
            }
        }
    }

    /// Buffer exceeded the cap: cut everything up to the last complete-frame
    /// boundary, or keep only the most recent half-cap when no boundary is
    /// found.
    fn truncate_overflow(&mut self) {
        self.stats.overflows += 1;
        match self.last_frame_boundary() {
            Some(boundary) if boundary > 0 => {
                warn!(
                    codec = self.format.codec_name(),
                    discarded = boundary,
                    "demux buffer overflow, truncating at last frame boundary"
                );
                self.buf.drain(..boundary);
            }
            _ => {
                let keep = (self.cap / 2).min(self.buf.len());
                let start = self.buf.len() - keep;
                warn!(
                    codec = self.format.codec_name(),
                    discarded = start,
                    kept = keep,
                    "demux buffer overflow with no frame boundary, keeping most recent half"
                );
                self.buf.drain(..start);
            }
        }
    }

    /// End offset of the last complete frame currently buffered.
    fn last_frame_boundary(&self) -> Option<usize> {
        match self.format {
            FrameFormat::Raw { .. } => {
                let size = self.format.raw_frame_size()?;
                let whole = (self.buf.len() / size) * size;
                (whole > 0).then_some(whole)
            }
            FrameFormat::Png => {
                find_backward(&self.buf, &PNG_IEND).map(|pos| pos + PNG_IEND.len())
            }
            FrameFormat::Mjpeg => {
                find_backward(&self.buf, &JPEG_EOI).map(|pos| pos + JPEG_EOI.len())
            }
        }
    }
}

fn find_forward(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

fn find_backward(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).rposition(|w| w == needle)
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn fake_png(body: &[u8]) -> Vec<u8> {
        let mut png = PNG_HEADER.to_vec();
        png.extend_from_slice(body);
        png.extend_from_slice(&PNG_IEND);
        png
    }

    fn fake_jpeg(body: &[u8]) -> Vec<u8> {
        let mut jpeg = JPEG_SOI.to_vec();
        // stuff any 0xFF so the body cannot fake a marker
        for &b in body {
            jpeg.push(b);
            if b == 0xFF {
                jpeg.push(0x00);
            }
        }
        jpeg.extend_from_slice(&JPEG_EOI);
        jpeg
    }

    #[test]
    fn png_split_across_chunks() {
        let png = fake_png(b"image data");
        let mut demux = FrameDemuxer::new(FrameFormat::Png);
        let (a, b) = png.split_at(11);
        assert!(demux.append(a).is_empty());
        let frames = demux.append(b);
        assert_eq!(frames.len(), 1);
        assert_eq!(&frames[0].payload[..], &png[..]);
        assert_eq!(demux.buffered(), 0);
    }

    #[test]
    fn two_pngs_in_one_chunk() {
        let mut stream = fake_png(b"first");
        stream.extend_from_slice(&fake_png(b"second"));
        let mut demux = FrameDemuxer::new(FrameFormat::Png);
        let frames = demux.append(&stream);
        assert_eq!(frames.len(), 2);
        assert_eq!(&frames[0].payload[..], &fake_png(b"first")[..]);
        assert_eq!(&frames[1].payload[..], &fake_png(b"second")[..]);
    }

    #[test]
    fn jpeg_bad_header_dropped_good_frame_survives() {
        // garbage ending in EOI, then a valid jpeg
        let mut stream = vec![0x00, 0x01, 0x02, 0xFF, 0xD9];
        let good = fake_jpeg(b"frame");
        stream.extend_from_slice(&good);
        let mut demux = FrameDemuxer::new(FrameFormat::Mjpeg);
        let frames = demux.append(&stream);
        assert_eq!(frames.len(), 1);
        assert_eq!(&frames[0].payload[..], &good[..]);
        assert_eq!(demux.stats().dropped, 1);
        assert_eq!(demux.stats().frames, 1);
    }

    #[test]
    fn complete_jpeg_emitted_while_partial_successor_is_held() {
        let first = fake_jpeg(b"frame one");
        let mut stream = first.clone();
        stream.extend_from_slice(&JPEG_SOI);
        stream.extend_from_slice(b"second frame start");

        // split anywhere, the aggregate result is the same
        for cut in 1..stream.len() {
            let mut demux = FrameDemuxer::new(FrameFormat::Mjpeg);
            let mut frames = demux.append(&stream[..cut]);
            frames.extend(demux.append(&stream[cut..]));
            assert_eq!(frames.len(), 1, "cut at {cut}");
            assert_eq!(&frames[0].payload[..], &first[..]);
            assert_eq!(demux.buffered(), stream.len() - first.len());

            // the held partial completes once its terminator arrives
            let rest = demux.append(&JPEG_EOI);
            assert_eq!(rest.len(), 1);
            assert!(rest[0].payload.starts_with(&JPEG_SOI));
            assert!(rest[0].payload.ends_with(&JPEG_EOI));
        }
    }

    #[test]
    fn raw_frames_cut_by_size() {
        let format = FrameFormat::Raw { width: 4, height: 2 };
        let size = format.raw_frame_size().unwrap();
        let mut demux = FrameDemuxer::new(format);
        let data: Vec<u8> = (0..size as u8 * 2).collect();
        let frames = demux.append(&data[..size + 3]);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].len(), size);
        assert_eq!(demux.buffered(), 3);
        let frames = demux.append(&data[size + 3..]);
        assert_eq!(frames.len(), 1);
        assert_eq!(&frames[0].payload[..], &data[size..]);
    }

    #[test]
    fn overflow_without_boundary_keeps_recent_half() {
        let mut demux = FrameDemuxer::with_buffer_cap(FrameFormat::Png, 1000);
        // marker-free noise beyond the cap
        let noise = vec![0xAAu8; 1100];
        assert!(demux.append(&noise).is_empty());
        assert!(demux.buffered() <= 500);
        assert_eq!(demux.stats().overflows, 1);
    }

    #[test]
    fn overflow_truncates_at_last_boundary() {
        let mut demux = FrameDemuxer::with_buffer_cap(FrameFormat::Mjpeg, 64);
        let mut stream = fake_jpeg(b"tiny");
        stream.extend_from_slice(&[0x55; 80]); // partial tail past the cap
        let frames = demux.append(&stream);
        // the complete frame sits before the boundary and is discarded by
        // the truncation, the partial tail is retained
        assert!(frames.is_empty());
        assert_eq!(demux.buffered(), 80);
        assert_eq!(demux.stats().overflows, 1);
    }

    proptest! {
        // Chunk boundaries never change which frames come out.
        #[test]
        fn chunking_is_transparent_for_png(
            bodies in prop::collection::vec(prop::collection::vec(any::<u8>(), 0..64), 1..5),
            cuts in prop::collection::vec(1usize..40, 0..8),
        ) {
            let stream: Vec<u8> = bodies.iter().flat_map(|b| fake_png(b)).collect();

            let mut whole = FrameDemuxer::new(FrameFormat::Png);
            let expected = whole.append(&stream);

            let mut chunked = FrameDemuxer::new(FrameFormat::Png);
            let mut actual = Vec::new();
            let mut rest = &stream[..];
            for cut in cuts {
                if rest.is_empty() {
                    break;
                }
                let cut = cut.min(rest.len());
                let (head, tail) = rest.split_at(cut);
                actual.extend(chunked.append(head));
                rest = tail;
            }
            actual.extend(chunked.append(rest));

            prop_assert_eq!(expected.len(), actual.len());
            for (e, a) in expected.iter().zip(&actual) {
                prop_assert_eq!(&e.payload[..], &a.payload[..]);
            }
        }

        #[test]
        fn chunking_is_transparent_for_raw(
            frames in 1usize..6,
            cut in 1usize..100,
        ) {
            let format = FrameFormat::Raw { width: 5, height: 3 };
            let size = format.raw_frame_size().unwrap();
            let stream: Vec<u8> = (0..frames * size).map(|i| i as u8).collect();

            let mut demux = FrameDemuxer::new(format);
            let mut got = Vec::new();
            for chunk in stream.chunks(cut) {
                got.extend(demux.append(chunk));
            }
            prop_assert_eq!(got.len(), frames);
            for (i, frame) in got.iter().enumerate() {
                prop_assert_eq!(&frame.payload[..], &stream[i * size..(i + 1) * size]);
            }
        }

        // After a boundary-free overflow the buffer is at most half the cap.
        #[test]
        fn overflow_bound_holds(extra in 1usize..4096) {
            let cap = 2048;
            let mut demux = FrameDemuxer::with_buffer_cap(FrameFormat::Mjpeg, cap);
            let noise = vec![0x11u8; cap + extra];
            let _ = demux.append(&noise);
            prop_assert!(demux.buffered() <= cap / 2);
        }
    }
}
