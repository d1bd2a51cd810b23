//! Media decoder subprocess supervisor.
//!
//! Spawns ffmpeg against a stream URL, pumps its stdout through the
//! [`FrameDemuxer`], forwards stderr lines as keepalive/diagnostic events,
//! and reports process exit. Consumers drive everything through the
//! [`SessionEvent`] channel; [`StreamPipe::stop`] kills the process
//! unconditionally (no graceful-shutdown handshake, the decoder holds no
//! state worth flushing).
//!
//! A one-shot watchdog fires a diagnostic event if the process produces no
//! output at all shortly after spawn; it never kills anything itself.

use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::config::{CaptureOptions, StreamSource};
use crate::demux::FrameDemuxer;
use crate::error::{Result, ScanError};
use crate::types::{Frame, PipeFormat};

/// Watchdog delay after spawn before flagging a silent process.
const SPAWN_WATCHDOG: Duration = Duration::from_secs(3);
/// stdout read buffer size.
const READ_CHUNK: usize = 64 * 1024;
/// Event channel depth. Frames are consumed promptly; a shallow queue keeps
/// memory bounded if the consumer stalls.
const EVENT_QUEUE: usize = 32;

/// Default request headers sent by the media decoder. Caller headers with
/// the same name replace these.
const DEFAULT_HEADERS: [(&str, &str); 2] = [
    (
        "User-Agent",
        "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
         (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36",
    ),
    ("Accept", "*/*"),
];

/// Events emitted by a running capture subprocess.
#[derive(Debug)]
pub enum SessionEvent {
    /// A complete frame came out of the demuxer.
    FrameReady(Frame),
    /// One stderr line from the decoder. Doubles as a liveness signal.
    LogLine(String),
    /// The watchdog saw no output at all since spawn. Diagnostic only.
    SilentSinceSpawn,
    /// The process exited (or was killed).
    ProcessExited { code: Option<i32> },
}

/// Handle to a running media decoder subprocess.
#[derive(Debug)]
pub struct StreamPipe {
    /// Event stream for this session.
    pub events: mpsc::Receiver<SessionEvent>,
    cancel: CancellationToken,
}

impl StreamPipe {
    /// Spawn the media decoder for `source` and start pumping its output.
    pub fn spawn(source: &StreamSource, url: &str, options: &CaptureOptions) -> Result<Self> {
        let program = options.resolve_ffmpeg();
        let args = build_args(url, &source.headers, options);
        debug!(program = %program.display(), ?args, "spawning media decoder");

        let mut child = Command::new(&program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| {
                ScanError::spawn(
                    format!("could not start {}: {err}", program.display()),
                    Some(err),
                )
            })?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ScanError::spawn("decoder stdout not captured", None))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| ScanError::spawn("decoder stderr not captured", None))?;

        let (events_tx, events) = mpsc::channel(EVENT_QUEUE);
        let cancel = CancellationToken::new();
        let saw_output = Arc::new(AtomicBool::new(false));

        // stdout pump: bytes -> demuxer -> FrameReady
        let mut demux = FrameDemuxer::new(options.frame_format());
        let tx = events_tx.clone();
        let output_flag = saw_output.clone();
        let pump_cancel = cancel.clone();
        tokio::spawn(async move {
            let mut stdout = stdout;
            let mut chunk = vec![0u8; READ_CHUNK];
            loop {
                let read = tokio::select! {
                    _ = pump_cancel.cancelled() => break,
                    read = stdout.read(&mut chunk) => read,
                };
                match read {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        output_flag.store(true, Ordering::Relaxed);
                        for frame in demux.append(&chunk[..n]) {
                            if tx.send(SessionEvent::FrameReady(frame)).await.is_err() {
                                return;
                            }
                        }
                    }
                }
            }
            let stats = demux.stats();
            debug!(
                frames = stats.frames,
                dropped = stats.dropped,
                overflows = stats.overflows,
                "stdout pump finished"
            );
        });

        // stderr pump: keepalive + diagnostics
        let tx = events_tx.clone();
        let output_flag = saw_output.clone();
        let pump_cancel = cancel.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            loop {
                let line = tokio::select! {
                    _ = pump_cancel.cancelled() => break,
                    line = lines.next_line() => line,
                };
                match line {
                    Ok(Some(line)) => {
                        output_flag.store(true, Ordering::Relaxed);
                        trace!(target: "qrpipe::ffmpeg", "{line}");
                        if tx.send(SessionEvent::LogLine(line)).await.is_err() {
                            return;
                        }
                    }
                    Ok(None) | Err(_) => break,
                }
            }
        });

        // spawn watchdog: diagnose a process that never says anything
        let tx = events_tx.clone();
        let output_flag = saw_output.clone();
        let watchdog_cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = watchdog_cancel.cancelled() => return,
                _ = tokio::time::sleep(SPAWN_WATCHDOG) => {}
            }
            if !output_flag.load(Ordering::Relaxed) {
                warn!("media decoder produced no output since spawn");
                let _ = tx.send(SessionEvent::SilentSinceSpawn).await;
            }
        });

        // waiter: owns the child, kills it on cancel
        let waiter_cancel = cancel.clone();
        tokio::spawn(async move {
            let code = tokio::select! {
                _ = waiter_cancel.cancelled() => {
                    // unconditional kill; the decoder is stateless
                    let _ = child.start_kill();
                    child.wait().await.ok().and_then(|status| status.code())
                }
                status = child.wait() => status.ok().and_then(|status| status.code()),
            };
            info!(?code, "media decoder exited");
            let _ = events_tx.send(SessionEvent::ProcessExited { code }).await;
        });

        Ok(Self { events, cancel })
    }

    /// Kill the subprocess and stop all pumps. Idempotent.
    pub fn stop(&self) {
        self.cancel.cancel();
    }
}

impl Drop for StreamPipe {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Build the full ffmpeg argument list for one capture session.
fn build_args(url: &str, headers: &[(String, String)], options: &CaptureOptions) -> Vec<String> {
    let merged = merge_headers(headers);
    let mut args: Vec<String> = Vec::new();

    args.extend(["-loglevel".into(), "debug".into(), "-nostdin".into()]);
    if let Some((_, ua)) = merged.iter().find(|(k, _)| k.eq_ignore_ascii_case("user-agent")) {
        args.extend(["-user_agent".into(), ua.clone()]);
    }
    args.extend([
        "-protocol_whitelist".into(),
        "file,http,https,tcp,tls,hls,crypto".into(),
        "-probesize".into(),
        "1M".into(),
        "-analyzeduration".into(),
        "0".into(),
        "-flush_packets".into(),
        "1".into(),
        // input open timeout, microseconds
        "-timeout".into(),
        "15000000".into(),
    ]);

    let header_block: String = merged
        .iter()
        .filter(|(k, _)| !k.eq_ignore_ascii_case("user-agent"))
        .map(|(k, v)| format!("{k}: {v}\r\n"))
        .collect();
    if !header_block.is_empty() {
        args.extend(["-headers".into(), header_block]);
    }

    if options.tls_insecure && url.starts_with("https") {
        args.extend(["-tls_verify".into(), "0".into()]);
    }

    args.extend(["-i".into(), url.to_string()]);

    args.extend([
        "-map".into(),
        "0:v:0".into(),
        "-fflags".into(),
        "nobuffer".into(),
        "-reconnect".into(),
        "1".into(),
        "-reconnect_streamed".into(),
        "1".into(),
        "-reconnect_on_network_error".into(),
        "1".into(),
        "-reconnect_delay_max".into(),
        "2".into(),
        "-rw_timeout".into(),
        "1500000".into(),
        "-fflags".into(),
        "+discardcorrupt".into(),
        "-an".into(),
    ]);

    match options.pipe_format {
        PipeFormat::Raw => args.extend([
            "-vf".into(),
            format!(
                "scale={}:{},fps={}",
                options.raw_width, options.raw_height, options.fps
            ),
            "-f".into(),
            "rawvideo".into(),
            "-pix_fmt".into(),
            "rgb24".into(),
            "pipe:1".into(),
        ]),
        PipeFormat::Image => {
            args.extend([
                "-vf".into(),
                // -2 keeps the width even while preserving aspect ratio
                format!("scale=-2:{},fps={}", options.scale, options.fps),
                "-f".into(),
                "image2pipe".into(),
            ]);
            match options.codec {
                crate::types::Codec::Png => {
                    args.extend(["-vcodec".into(), "png".into(), "pipe:1".into()]);
                }
                crate::types::Codec::Mjpeg => args.extend([
                    "-vcodec".into(),
                    "mjpeg".into(),
                    "-q:v".into(),
                    "4".into(),
                    "-pix_fmt".into(),
                    "yuvj422p".into(),
                    "pipe:1".into(),
                ]),
            }
        }
    }

    args
}

/// Default headers with caller overrides applied, caller order preserved.
fn merge_headers(overrides: &[(String, String)]) -> Vec<(String, String)> {
    let mut merged: Vec<(String, String)> = DEFAULT_HEADERS
        .iter()
        .filter(|(name, _)| !overrides.iter().any(|(k, _)| k.eq_ignore_ascii_case(name)))
        .map(|&(k, v)| (k.to_string(), v.to_string()))
        .collect();
    merged.extend(overrides.iter().cloned());
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Codec;

    fn arg_pair(args: &[String], flag: &str) -> Option<String> {
        args.iter().position(|a| a == flag).map(|i| args[i + 1].clone())
    }

    #[test]
    fn mjpeg_args_select_image_pipe() {
        let opts = CaptureOptions::default();
        let args = build_args("https://example.com/live.flv", &[], &opts);
        assert_eq!(arg_pair(&args, "-vf").unwrap(), "scale=-2:480,fps=2");
        assert_eq!(arg_pair(&args, "-f"), Some("image2pipe".into()));
        assert_eq!(arg_pair(&args, "-vcodec"), Some("mjpeg".into()));
        assert_eq!(arg_pair(&args, "-q:v"), Some("4".into()));
        assert_eq!(args.last().map(String::as_str), Some("pipe:1"));
    }

    #[test]
    fn raw_args_pin_exact_dimensions() {
        let opts = CaptureOptions::default().raw_fallback();
        let args = build_args("http://example.com/stream", &[], &opts);
        assert_eq!(arg_pair(&args, "-vf").unwrap(), "scale=640:360,fps=2");
        assert_eq!(arg_pair(&args, "-f"), Some("rawvideo".into()));
        assert_eq!(arg_pair(&args, "-pix_fmt"), Some("rgb24".into()));
    }

    #[test]
    fn tls_verify_only_for_https_when_insecure() {
        let opts = CaptureOptions { tls_insecure: true, ..CaptureOptions::default() };
        let https = build_args("https://example.com/s", &[], &opts);
        assert_eq!(arg_pair(&https, "-tls_verify"), Some("0".into()));
        let http = build_args("http://example.com/s", &[], &opts);
        assert!(arg_pair(&http, "-tls_verify").is_none());
        let secure = CaptureOptions::default();
        let none = build_args("https://example.com/s", &[], &secure);
        assert!(arg_pair(&none, "-tls_verify").is_none());
    }

    #[test]
    fn caller_headers_override_defaults() {
        let headers = vec![
            ("User-Agent".to_string(), "custom-agent/1.0".to_string()),
            ("Cookie".to_string(), "sid=abc".to_string()),
        ];
        let args = build_args("https://example.com/s", &headers, &CaptureOptions::default());
        assert_eq!(arg_pair(&args, "-user_agent"), Some("custom-agent/1.0".into()));
        let block = arg_pair(&args, "-headers").unwrap();
        assert!(block.contains("Cookie: sid=abc\r\n"));
        assert!(block.contains("Accept: */*\r\n"));
        assert!(!block.contains("User-Agent"));
    }

    #[test]
    fn input_precedes_output_options() {
        let opts = CaptureOptions { codec: Codec::Png, ..CaptureOptions::default() };
        let args = build_args("https://example.com/s", &[], &opts);
        let input = args.iter().position(|a| a == "-i").unwrap();
        let map = args.iter().position(|a| a == "-map").unwrap();
        let whitelist = args.iter().position(|a| a == "-protocol_whitelist").unwrap();
        assert!(whitelist < input);
        assert!(input < map);
        assert_eq!(args[input + 1], "https://example.com/s");
    }

    #[tokio::test]
    async fn spawn_failure_reports_binary() {
        let opts = CaptureOptions {
            ffmpeg_path: Some("/nonexistent/ffmpeg-binary".into()),
            ..CaptureOptions::default()
        };
        let source = StreamSource::new("http://example.com/s");
        let err = StreamPipe::spawn(&source, &source.url, &opts).unwrap_err();
        assert!(matches!(err, ScanError::Spawn { .. }));
        assert!(!err.is_retryable());
    }
}
