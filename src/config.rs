//! Capture and decode configuration.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::types::{Codec, FrameFormat, PipeFormat};

/// Environment variable consulted when no explicit decoder path is set.
pub const FFMPEG_PATH_ENV: &str = "FFMPEG_PATH";

/// Options for one capture session.
///
/// Serialization uses camelCase so configs interoperate with the JSON shape
/// used by frontends.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CaptureOptions {
    /// Frames per second requested from the scaler.
    pub fps: u32,
    /// Output height in pixels for image pipes; width follows aspect ratio.
    pub scale: u32,
    /// Codec for `PipeFormat::Image` output.
    pub codec: Codec,
    /// Wire layout of the subprocess stdout pipe.
    pub pipe_format: PipeFormat,
    /// Exact output width for `PipeFormat::Raw`.
    pub raw_width: u32,
    /// Exact output height for `PipeFormat::Raw`.
    pub raw_height: u32,
    /// Disable TLS certificate verification in the media decoder.
    pub tls_insecure: bool,
    /// Explicit media decoder binary. Overrides the `FFMPEG_PATH`
    /// environment variable; both default to `ffmpeg` on the PATH.
    pub ffmpeg_path: Option<PathBuf>,
}

impl Default for CaptureOptions {
    fn default() -> Self {
        Self {
            fps: 2,
            scale: 480,
            codec: Codec::Mjpeg,
            pipe_format: PipeFormat::Image,
            raw_width: 640,
            raw_height: 360,
            tls_insecure: false,
            ffmpeg_path: None,
        }
    }
}

impl CaptureOptions {
    /// Resolve the media decoder binary: explicit path, then the
    /// `FFMPEG_PATH` environment variable, then `ffmpeg` on the PATH.
    pub fn resolve_ffmpeg(&self) -> PathBuf {
        if let Some(path) = &self.ffmpeg_path {
            return path.clone();
        }
        if let Ok(path) = std::env::var(FFMPEG_PATH_ENV) {
            if !path.trim().is_empty() {
                return PathBuf::from(path);
            }
        }
        PathBuf::from("ffmpeg")
    }

    /// Framing rule the demuxer should apply to this session's output.
    pub fn frame_format(&self) -> FrameFormat {
        match self.pipe_format {
            PipeFormat::Raw => {
                FrameFormat::Raw { width: self.raw_width, height: self.raw_height }
            }
            PipeFormat::Image => match self.codec {
                Codec::Png => FrameFormat::Png,
                Codec::Mjpeg => FrameFormat::Mjpeg,
            },
        }
    }

    /// First fallback stage: same source, raw RGB24 pipe at a fixed size.
    pub fn raw_fallback(&self) -> Self {
        Self {
            pipe_format: PipeFormat::Raw,
            raw_width: 640,
            raw_height: 360,
            ..self.clone()
        }
    }

    /// Second fallback stage: alternate source over a PNG pipe.
    pub fn png_fallback(&self) -> Self {
        Self { pipe_format: PipeFormat::Image, codec: Codec::Png, ..self.clone() }
    }
}

/// Options for the QR decode engine.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DecodeOptions {
    /// Try a whole-image reader on compressed frames before the scanning
    /// cascade.
    pub whole_image_reader: bool,
    /// Re-run the cascade over a ladder of downscaled sizes when the
    /// original resolution misses. Costly; off by default.
    pub resize_ladder: bool,
}

impl Default for DecodeOptions {
    fn default() -> Self {
        Self { whole_image_reader: true, resize_ladder: false }
    }
}

/// Capture source: a primary stream URL plus optional HTTP context and an
/// optional alternate URL used by the last fallback stage.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StreamSource {
    pub url: String,
    /// Alternate URL (typically a different quality line) for the final
    /// fallback stage.
    pub alt_url: Option<String>,
    /// Extra request headers (Cookie, Referer, ...) passed to the media
    /// decoder. Merged over the built-in defaults; caller values win.
    pub headers: Vec<(String, String)>,
}

impl StreamSource {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into(), ..Self::default() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_image_pipe() {
        let opts = CaptureOptions::default();
        assert_eq!(opts.fps, 2);
        assert_eq!(opts.scale, 480);
        assert_eq!(opts.frame_format(), FrameFormat::Mjpeg);
    }

    #[test]
    fn raw_fallback_pins_dimensions() {
        let opts = CaptureOptions { scale: 720, ..CaptureOptions::default() };
        let fallback = opts.raw_fallback();
        assert_eq!(fallback.pipe_format, PipeFormat::Raw);
        assert_eq!(
            fallback.frame_format(),
            FrameFormat::Raw { width: 640, height: 360 }
        );
        // unrelated options survive
        assert_eq!(fallback.scale, 720);
    }

    #[test]
    fn png_fallback_switches_codec() {
        let fallback = CaptureOptions::default().png_fallback();
        assert_eq!(fallback.frame_format(), FrameFormat::Png);
    }

    #[test]
    fn explicit_path_wins_over_env() {
        let opts = CaptureOptions {
            ffmpeg_path: Some(PathBuf::from("/opt/ffmpeg/bin/ffmpeg")),
            ..CaptureOptions::default()
        };
        assert_eq!(opts.resolve_ffmpeg(), PathBuf::from("/opt/ffmpeg/bin/ffmpeg"));
    }

    #[test]
    fn options_round_trip_as_camel_case_json() {
        let json = r#"{"fps":4,"scale":360,"codec":"png","pipeFormat":"image","tlsInsecure":true}"#;
        let opts: CaptureOptions = serde_json::from_str(json).unwrap();
        assert_eq!(opts.fps, 4);
        assert_eq!(opts.codec, Codec::Png);
        assert!(opts.tls_insecure);
        // unspecified fields come from Default
        assert_eq!(opts.raw_width, 640);
    }
}
