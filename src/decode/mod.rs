//! QR decode engine.
//!
//! A tiered cascade of decode strategies, tried cheapest-first and stopping
//! at the first non-empty result:
//!
//! 1. whole-image reader over the undecoded compressed bytes (optional)
//! 2. scanning detector over the grayscale frame, across three polarity
//!    passes (as-is plus inverted, as-is only, inverted only)
//! 3. the same polarity passes over contrast-stretched and binarized
//!    variants of the frame
//! 4. optionally, the whole cascade again over a ladder of downscaled sizes,
//!    smallest first
//!
//! Decoding is pure and stateless: the same frame always yields the same
//! outcome, and a miss is an outcome, not an error.

pub mod transforms;

use image::imageops::FilterType;
use image::GrayImage;
use tracing::trace;

use crate::config::DecodeOptions;
use crate::types::{DecodeOutcome, Frame, FrameFormat};

use transforms::{binarize, contrast_stretch, invert, luma_from_rgb24};

/// Resize ladder targets, smallest first. Smaller sizes sharpen large codes
/// that the detector misses at native resolution.
const RESIZE_LADDER: [(u32, u32); 6] = [
    (320, 240),
    (480, 360),
    (640, 480),
    (800, 600),
    (1024, 768),
    (1280, 960),
];

/// Polarity passes for the scanning detector.
#[derive(Debug, Clone, Copy)]
enum Polarity {
    /// Original first, then inverted.
    Both,
    AsIs,
    InvertedOnly,
}

const POLARITIES: [Polarity; 3] = [Polarity::Both, Polarity::AsIs, Polarity::InvertedOnly];

/// Stateless QR decoder. Cheap to clone; safe to share across threads.
#[derive(Debug, Clone, Copy, Default)]
pub struct QrDecoder {
    opts: DecodeOptions,
}

impl QrDecoder {
    pub fn new(opts: DecodeOptions) -> Self {
        Self { opts }
    }

    /// Run the cascade over one frame.
    pub fn decode(&self, frame: &Frame) -> DecodeOutcome {
        if self.opts.whole_image_reader && !matches!(frame.format, FrameFormat::Raw { .. }) {
            if let Some(text) = read_whole_image(&frame.payload) {
                trace!(len = text.len(), "whole-image reader hit");
                return DecodeOutcome::Hit { text };
            }
        }

        let gray = match self.grayscale(frame) {
            Some(gray) => gray,
            None => return DecodeOutcome::miss("frame bytes are not a decodable image"),
        };

        if let Some(text) = scan_variants(&gray) {
            return DecodeOutcome::Hit { text };
        }

        if self.opts.resize_ladder {
            for (width, height) in RESIZE_LADDER {
                if width >= gray.width() && height >= gray.height() {
                    continue;
                }
                let resized =
                    image::imageops::resize(&gray, width, height, FilterType::Nearest);
                if let Some(text) = scan_variants(&resized) {
                    trace!(width, height, "resize ladder hit");
                    return DecodeOutcome::Hit { text };
                }
            }
        }

        DecodeOutcome::miss("no QR code found")
    }

    /// Grayscale plane of the frame, decoding compressed formats as needed.
    fn grayscale(&self, frame: &Frame) -> Option<GrayImage> {
        match frame.format {
            FrameFormat::Raw { width, height } => luma_from_rgb24(&frame.payload, width, height),
            FrameFormat::Png | FrameFormat::Mjpeg => {
                image::load_from_memory(&frame.payload).ok().map(|img| img.to_luma8())
            }
        }
    }
}

/// Stage 1: hand the undecoded image to a whole-image QR reader.
fn read_whole_image(bytes: &[u8]) -> Option<String> {
    let gray = image::load_from_memory(bytes).ok()?.to_luma8();
    let mut reader = quircs::Quirc::default();
    let codes = reader.identify(gray.width() as usize, gray.height() as usize, &gray);
    for code in codes {
        let Ok(code) = code else { continue };
        let Ok(decoded) = code.decode() else { continue };
        if let Ok(text) = String::from_utf8(decoded.payload) {
            if !text.is_empty() {
                return Some(text);
            }
        }
    }
    None
}

/// Pixel-transform variants tried after the untouched frame, in order.
/// Variants are built lazily; an early hit skips the rest.
const VARIANTS: [fn(&GrayImage) -> GrayImage; 3] =
    [contrast_stretch, binarize_mid, binarize_high];

fn binarize_mid(gray: &GrayImage) -> GrayImage {
    binarize(gray, 128)
}

fn binarize_high(gray: &GrayImage) -> GrayImage {
    binarize(gray, 180)
}

/// Run the polarity passes over the frame and its pixel-transform variants,
/// first success wins.
fn scan_variants(gray: &GrayImage) -> Option<String> {
    scan_polarities(gray)
        .or_else(|| VARIANTS.iter().find_map(|variant| scan_polarities(&variant(gray))))
}

fn scan_polarities(gray: &GrayImage) -> Option<String> {
    for polarity in POLARITIES {
        let hit = match polarity {
            Polarity::Both => scan(gray).or_else(|| scan(&invert(gray))),
            Polarity::AsIs => scan(gray),
            Polarity::InvertedOnly => scan(&invert(gray)),
        };
        if hit.is_some() {
            return hit;
        }
    }
    None
}

/// One pass of the scanning detector.
fn scan(gray: &GrayImage) -> Option<String> {
    let mut prepared = rqrr::PreparedImage::prepare(gray.clone());
    for grid in prepared.detect_grids() {
        if let Ok((_meta, text)) = grid.decode() {
            if !text.is_empty() {
                return Some(text);
            }
        }
    }
    None
}
