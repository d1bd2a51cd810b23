//! Core types for the capture and login pipeline.
//!
//! - [`Frame`] is a complete image (or raw pixel block) cut out of the
//!   subprocess byte stream, shared zero-copy via `Arc`
//! - [`FrameFormat`] selects the framing rule used to delimit frames
//! - [`DecodeOutcome`] is the per-frame verdict of the QR decode engine
//! - [`GameType`] is the closed enumeration of backend game services,
//!   together with the 3-character magic-tag table used by legacy QR payloads
//! - [`LoginChallenge`] carries a decoded `{game_type, ticket}` pair into the
//!   login state machine
//! - [`DetectionStats`] counts decode attempts for one capture session

use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Compressed image codec emitted by the media decoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Codec {
    Png,
    Mjpeg,
}

impl Codec {
    /// Name as passed on the media decoder command line.
    pub fn as_str(self) -> &'static str {
        match self {
            Codec::Png => "png",
            Codec::Mjpeg => "mjpeg",
        }
    }
}

/// Output pipe layout requested from the media decoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PipeFormat {
    /// Self-delimited compressed images (PNG or MJPEG).
    Image,
    /// Fixed-size RGB24 pixel blocks.
    Raw,
}

/// Framing rule for one capture session.
///
/// Raw frames carry their dimensions because the frame size on the wire is
/// exactly `width * height * 3` bytes and nothing else delimits them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameFormat {
    Png,
    Mjpeg,
    Raw { width: u32, height: u32 },
}

impl FrameFormat {
    /// Exact on-the-wire size of one raw frame, if this is a raw format.
    pub fn raw_frame_size(self) -> Option<usize> {
        match self {
            FrameFormat::Raw { width, height } => Some(width as usize * height as usize * 3),
            _ => None,
        }
    }

    pub fn codec_name(self) -> &'static str {
        match self {
            FrameFormat::Png => "png",
            FrameFormat::Mjpeg => "mjpeg",
            FrameFormat::Raw { .. } => "raw",
        }
    }
}

/// A complete, validated frame extracted from the capture byte stream.
///
/// Created by the demuxer the moment enough bytes are buffered, consumed
/// immediately by the decode engine, never persisted.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Frame bytes (zero-copy clone via Arc).
    pub payload: Arc<[u8]>,
    /// Framing rule this frame was cut with.
    pub format: FrameFormat,
}

impl Frame {
    pub fn new(payload: Vec<u8>, format: FrameFormat) -> Self {
        Self { payload: payload.into(), format }
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}

/// Per-frame verdict of the decode engine.
///
/// A miss is not an error; it is the normal outcome for frames that do not
/// contain a readable QR code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeOutcome {
    Hit { text: String },
    Miss { reason: String },
}

impl DecodeOutcome {
    pub fn miss(reason: impl Into<String>) -> Self {
        DecodeOutcome::Miss { reason: reason.into() }
    }

    pub fn is_hit(&self) -> bool {
        matches!(self, DecodeOutcome::Hit { .. })
    }

    /// Decoded text, if any.
    pub fn text(&self) -> Option<&str> {
        match self {
            DecodeOutcome::Hit { text } => Some(text),
            DecodeOutcome::Miss { .. } => None,
        }
    }
}

/// Backend game service a login challenge targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GameType {
    Bh3,
    Hk4e,
    Hkrpg,
    Zzz,
}

/// Magic-tag table for the fixed-offset QR payload form. The 3-character tag
/// sits at byte offset 79 of the payload. Data constant, not dispatch.
pub const GAME_MAGIC_TAGS: [(&str, GameType); 4] = [
    ("8F3", GameType::Bh3),
    ("9E&", GameType::Hk4e),
    ("8F%", GameType::Hkrpg),
    ("%BA", GameType::Zzz),
];

impl GameType {
    pub fn as_str(self) -> &'static str {
        match self {
            GameType::Bh3 => "bh3",
            GameType::Hk4e => "hk4e",
            GameType::Hkrpg => "hkrpg",
            GameType::Zzz => "zzz",
        }
    }

    /// Resolve a 3-character magic tag from the fixed-offset payload form.
    pub fn from_magic_tag(tag: &str) -> Option<Self> {
        GAME_MAGIC_TAGS.iter().find(|(t, _)| *t == tag).map(|&(_, g)| g)
    }

    /// Path segment used by the SDK endpoint family (`nap_cn` for ZZZ).
    pub fn biz_segment(self) -> &'static str {
        match self {
            GameType::Bh3 => "bh3_cn",
            GameType::Hk4e => "hk4e_cn",
            GameType::Hkrpg => "hkrpg_cn",
            GameType::Zzz => "nap_cn",
        }
    }

    /// Numeric app id submitted as `app_id` in QR login bodies.
    pub fn app_id(self) -> u32 {
        match self {
            GameType::Bh3 => 1,
            GameType::Hk4e => 4,
            GameType::Hkrpg => 8,
            GameType::Zzz => 12,
        }
    }
}

/// Ticket length in a login QR payload. Tickets are opaque and fixed-size.
pub const TICKET_LEN: usize = 24;

/// A decoded login challenge, extracted from a validated QR payload.
///
/// Consumed once by the login state machine; the originating ticket is then
/// suppressed from reprocessing for the rest of the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginChallenge {
    pub game_type: GameType,
    pub ticket: String,
}

impl LoginChallenge {
    /// Build a challenge, enforcing the fixed ticket length.
    pub fn new(game_type: GameType, ticket: impl Into<String>) -> Option<Self> {
        let ticket = ticket.into();
        (ticket.len() == TICKET_LEN).then_some(Self { game_type, ticket })
    }
}

/// Detection counters for one capture session. Reset at session start.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DetectionStats {
    pub total_attempts: u64,
    pub successful_detections: u64,
    pub failed_detections: u64,
}

impl DetectionStats {
    pub fn record_hit(&mut self) {
        self.total_attempts += 1;
        self.successful_detections += 1;
    }

    pub fn record_miss(&mut self) {
        self.total_attempts += 1;
        self.failed_detections += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn magic_tag_table_is_closed() {
        assert_eq!(GameType::from_magic_tag("8F3"), Some(GameType::Bh3));
        assert_eq!(GameType::from_magic_tag("9E&"), Some(GameType::Hk4e));
        assert_eq!(GameType::from_magic_tag("8F%"), Some(GameType::Hkrpg));
        assert_eq!(GameType::from_magic_tag("%BA"), Some(GameType::Zzz));
        assert_eq!(GameType::from_magic_tag("XYZ"), None);
        assert_eq!(GameType::from_magic_tag(""), None);
    }

    #[test]
    fn app_ids_match_endpoint_family() {
        assert_eq!(GameType::Bh3.app_id(), 1);
        assert_eq!(GameType::Hk4e.app_id(), 4);
        assert_eq!(GameType::Hkrpg.app_id(), 8);
        assert_eq!(GameType::Zzz.app_id(), 12);
        assert_eq!(GameType::Zzz.biz_segment(), "nap_cn");
    }

    #[test]
    fn raw_frame_size_is_rgb24() {
        let format = FrameFormat::Raw { width: 640, height: 360 };
        assert_eq!(format.raw_frame_size(), Some(640 * 360 * 3));
        assert_eq!(FrameFormat::Png.raw_frame_size(), None);
    }

    #[test]
    fn challenge_requires_fixed_ticket_length() {
        assert!(LoginChallenge::new(GameType::Hk4e, "a".repeat(TICKET_LEN)).is_some());
        assert!(LoginChallenge::new(GameType::Hk4e, "a".repeat(TICKET_LEN - 1)).is_none());
        assert!(LoginChallenge::new(GameType::Hk4e, "").is_none());
    }

    #[test]
    fn stats_counters_accumulate() {
        let mut stats = DetectionStats::default();
        stats.record_miss();
        stats.record_miss();
        stats.record_hit();
        assert_eq!(stats.total_attempts, 3);
        assert_eq!(stats.successful_detections, 1);
        assert_eq!(stats.failed_detections, 2);
    }
}
