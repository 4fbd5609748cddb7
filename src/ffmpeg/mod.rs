//! Portable execution of the external `ffmpeg`/`ffprobe` binaries. Never
//! interprets business meaning of ffmpeg errors - it surfaces exit codes
//! and a bounded tail of stderr to the caller.

use crate::cancel::CancellationToken;
use crate::error::{CoreError, Result};
use std::collections::VecDeque;
use std::path::Path;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::time::Instant;
use tracing::{debug, warn};

/// Bounded byte ring buffer for a child process's stderr tail.
struct RingBuffer {
    cap: usize,
    buf: VecDeque<u8>,
}

impl RingBuffer {
    fn new(cap: usize) -> Self {
        Self {
            cap,
            buf: VecDeque::with_capacity(cap.min(4096)),
        }
    }

    fn push(&mut self, bytes: &[u8]) {
        for &b in bytes {
            if self.buf.len() == self.cap {
                self.buf.pop_front();
            }
            self.buf.push_back(b);
        }
    }

    fn tail_string(&self) -> String {
        let bytes: Vec<u8> = self.buf.iter().copied().collect();
        String::from_utf8_lossy(&bytes).to_string()
    }
}

/// Tracks the last time the child produced output on either stream, so the
/// watchdog in `run()` can tell a cold startup (no progress line yet) apart
/// from a stall mid-encode, and apply the right threshold to each.
struct ActivityTracker {
    last: Mutex<Instant>,
    progress_started: AtomicBool,
}

impl ActivityTracker {
    fn new() -> Self {
        Self {
            last: Mutex::new(Instant::now()),
            progress_started: AtomicBool::new(false),
        }
    }

    fn mark(&self) {
        *self.last.lock().unwrap() = Instant::now();
        self.progress_started.store(true, Ordering::Relaxed);
    }

    fn idle_for(&self) -> Duration {
        self.last.lock().unwrap().elapsed()
    }

    fn has_started(&self) -> bool {
        self.progress_started.load(Ordering::Relaxed)
    }
}

#[derive(Clone)]
pub struct FfmpegRunner {
    ffmpeg_path: String,
    ffprobe_path: String,
    startup_stall: Duration,
    startup_stall_cold: Duration,
    runtime_stall: Duration,
    stderr_cap: usize,
}

pub type ProgressCallback = Arc<dyn Fn(f64) + Send + Sync>;

pub struct RunOptions {
    pub op_id: String,
    pub total_duration_sec: Option<f64>,
    pub progress_cb: Option<ProgressCallback>,
    pub signal: CancellationToken,
}

impl FfmpegRunner {
    pub fn new(ffmpeg_path: impl Into<String>, ffprobe_path: impl Into<String>) -> Self {
        Self {
            ffmpeg_path: ffmpeg_path.into(),
            ffprobe_path: ffprobe_path.into(),
            startup_stall: Duration::from_secs(35),
            startup_stall_cold: Duration::from_secs(60),
            runtime_stall: Duration::from_secs(40),
            stderr_cap: 64 * 1024,
        }
    }

    pub fn with_stall_timeouts(mut self, startup: Duration, startup_cold: Duration) -> Self {
        self.startup_stall = startup;
        self.startup_stall_cold = startup_cold;
        self
    }

    pub fn with_runtime_stall(mut self, runtime_stall: Duration) -> Self {
        self.runtime_stall = runtime_stall;
        self
    }

    pub fn with_stderr_cap(mut self, bytes: usize) -> Self {
        self.stderr_cap = bytes;
        self
    }

    pub async fn probe_duration(&self, path: &Path) -> Result<f64> {
        let output = Command::new(&self.ffprobe_path)
            .args([
                "-v",
                "error",
                "-show_entries",
                "format=duration",
                "-of",
                "default=noprint_wrappers=1:nokey=1",
            ])
            .arg(path)
            .output()
            .await
            .map_err(|e| CoreError::FfmpegUnavailable(e.to_string()))?;

        if !output.status.success() {
            return Err(CoreError::ProbeFailed(
                String::from_utf8_lossy(&output.stderr).to_string(),
            ));
        }

        let text = String::from_utf8_lossy(&output.stdout);
        text.trim()
            .parse::<f64>()
            .map_err(|e| CoreError::ProbeFailed(format!("bad duration '{}': {e}", text.trim())))
    }

    pub async fn probe_fps(&self, path: &Path) -> Result<f64> {
        let output = Command::new(&self.ffprobe_path)
            .args([
                "-v",
                "error",
                "-select_streams",
                "v:0",
                "-show_entries",
                "stream=avg_frame_rate",
                "-of",
                "default=noprint_wrappers=1:nokey=1",
            ])
            .arg(path)
            .output()
            .await
            .map_err(|e| CoreError::FfmpegUnavailable(e.to_string()))?;

        if !output.status.success() {
            return Ok(30.0);
        }

        let text = String::from_utf8_lossy(&output.stdout);
        Ok(parse_frame_rate(text.trim()).unwrap_or(30.0))
    }

    pub async fn has_video_track(&self, path: &Path) -> Result<bool> {
        let output = Command::new(&self.ffprobe_path)
            .args([
                "-v",
                "error",
                "-select_streams",
                "v:0",
                "-show_entries",
                "stream=index",
                "-of",
                "csv=p=0",
            ])
            .arg(path)
            .output()
            .await
            .map_err(|e| CoreError::FfmpegUnavailable(e.to_string()))?;

        Ok(output.status.success() && !output.stdout.is_empty())
    }

    /// Spawns ffmpeg with `-progress pipe:1 -nostats`, feeding parsed
    /// percentage into `progress_cb` and tearing the child down on
    /// cancellation or startup stall.
    pub async fn run(&self, args: &[String], opts: RunOptions) -> Result<()> {
        if opts.signal.is_cancelled() {
            return Err(CoreError::Cancelled);
        }

        let mut full_args = vec!["-y".to_string(), "-progress".to_string(), "pipe:1".to_string(), "-nostats".to_string()];
        full_args.extend(args.iter().cloned());

        debug!(op_id = %opts.op_id, args = ?full_args, "spawning ffmpeg");

        let mut child: Child = Command::new(&self.ffmpeg_path)
            .args(&full_args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| CoreError::FfmpegUnavailable(e.to_string()))?;

        let stdout = child.stdout.take().expect("piped stdout");
        let stderr = child.stderr.take().expect("piped stderr");

        let stderr_ring = Arc::new(Mutex::new(RingBuffer::new(self.stderr_cap)));
        let activity = Arc::new(ActivityTracker::new());
        let stderr_task = tokio::spawn(drain_stderr(stderr, stderr_ring.clone(), activity.clone()));

        let total = opts.total_duration_sec;
        let cb = opts.progress_cb.clone();
        let progress_task = tokio::spawn(read_progress(stdout, total, cb, activity.clone()));

        let startup_stall = self.startup_stall;
        let runtime_stall = self.runtime_stall;
        let watchdog = async {
            loop {
                tokio::time::sleep(Duration::from_millis(500)).await;
                let threshold = if activity.has_started() { runtime_stall } else { startup_stall };
                if activity.idle_for() >= threshold {
                    return threshold;
                }
            }
        };

        tokio::select! {
            status = child.wait() => {
                let _ = stderr_task.await;
                let _ = progress_task.await;
                let status = status.map_err(|e| CoreError::FfmpegUnavailable(e.to_string()))?;
                if status.success() {
                    Ok(())
                } else {
                    let tail = stderr_ring.lock().unwrap().tail_string();
                    Err(CoreError::FfmpegFailed { code: status.code().unwrap_or(-1), tail })
                }
            }
            _ = opts.signal.cancelled() => {
                warn!(op_id = %opts.op_id, "cancelling ffmpeg child");
                let _ = child.start_kill();
                let _ = child.wait().await;
                Err(CoreError::Cancelled)
            }
            stall = watchdog => {
                warn!(op_id = %opts.op_id, ?stall, "ffmpeg produced no output for too long");
                let _ = child.start_kill();
                let _ = child.wait().await;
                Err(CoreError::StartupStall(format!("no output for {:?}", stall)))
            }
        }
    }

    /// Runs ffmpeg with `silencedetect` against `-f null -` and returns the
    /// raw stderr text for the caller to parse `silence_start`/`silence_end`
    /// markers out of. ffmpeg writes filter logging to stderr regardless of
    /// exit status, so a non-zero exit here is only a real error if stderr
    /// is empty.
    pub async fn detect_silence(&self, path: &Path, noise_db: f64, min_duration_sec: f64) -> Result<String> {
        let filter = format!("silencedetect=noise={noise_db}dB:d={min_duration_sec}");
        let output = Command::new(&self.ffmpeg_path)
            .args(["-i"])
            .arg(path)
            .args(["-af", &filter, "-f", "null", "-"])
            .output()
            .await
            .map_err(|e| CoreError::FfmpegUnavailable(e.to_string()))?;

        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        if stderr.is_empty() && !output.status.success() {
            return Err(CoreError::FfmpegFailed {
                code: output.status.code().unwrap_or(-1),
                tail: "no stderr output from silencedetect".to_string(),
            });
        }
        Ok(stderr)
    }

    pub async fn extract_audio_segment(
        &self,
        input: &Path,
        output: &Path,
        start_sec: f64,
        duration_sec: f64,
        signal: CancellationToken,
    ) -> Result<()> {
        let args = vec![
            "-ss".to_string(),
            format!("{start_sec:.3}"),
            "-t".to_string(),
            format!("{duration_sec:.3}"),
            "-i".to_string(),
            input.display().to_string(),
            "-vn".to_string(),
            "-acodec".to_string(),
            "pcm_s16le".to_string(),
            "-ar".to_string(),
            "16000".to_string(),
            "-ac".to_string(),
            "1".to_string(),
            output.display().to_string(),
        ];
        self.run(
            &args,
            RunOptions {
                op_id: "segment".to_string(),
                total_duration_sec: Some(duration_sec),
                progress_cb: None,
                signal,
            },
        )
        .await
    }
}

async fn drain_stderr<R: AsyncRead + Unpin>(reader: R, ring: Arc<Mutex<RingBuffer>>, activity: Arc<ActivityTracker>) {
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                activity.mark();
                let mut guard = ring.lock().unwrap();
                guard.push(line.as_bytes());
                guard.push(b"\n");
            }
            Ok(None) | Err(_) => break,
        }
    }
}

async fn read_progress<R: AsyncRead + Unpin>(
    reader: R,
    total_duration_sec: Option<f64>,
    cb: Option<ProgressCallback>,
    activity: Arc<ActivityTracker>,
) {
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        activity.mark();
        if let Some(rest) = line.strip_prefix("out_time_ms=") {
            if let (Ok(time_us), Some(total), Some(cb)) =
                (rest.parse::<i64>(), total_duration_sec, cb.as_ref())
            {
                if time_us > 0 && total > 0.0 {
                    let current = time_us as f64 / 1_000_000.0;
                    let pct = (current / total * 100.0).min(100.0);
                    cb(pct);
                }
            }
        }
    }
}

fn parse_frame_rate(s: &str) -> Option<f64> {
    if let Some((num, den)) = s.split_once('/') {
        let num: f64 = num.parse().ok()?;
        let den: f64 = den.parse().ok()?;
        if den == 0.0 {
            return None;
        }
        Some(num / den)
    } else {
        s.parse().ok()
    }
}

pub async fn check_binary(path: &str) -> Result<()> {
    let output = Command::new(path)
        .arg("-version")
        .output()
        .await
        .map_err(|e| CoreError::FfmpegUnavailable(format!("{path} not found: {e}")))?;
    if !output.status.success() {
        return Err(CoreError::FfmpegUnavailable(format!(
            "{path} -version exited non-zero"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_rate_parses_fraction() {
        assert_eq!(parse_frame_rate("60000/1001"), Some(60000.0 / 1001.0));
    }

    #[test]
    fn frame_rate_parses_plain_integer() {
        assert_eq!(parse_frame_rate("30"), Some(30.0));
    }

    #[test]
    fn frame_rate_rejects_zero_denominator() {
        assert_eq!(parse_frame_rate("30/0"), None);
    }

    #[test]
    fn ring_buffer_caps_at_capacity() {
        let mut ring = RingBuffer::new(4);
        ring.push(b"abcdef");
        assert_eq!(ring.tail_string(), "cdef");
    }

    #[tokio::test]
    async fn run_returns_cancelled_if_already_cancelled() {
        let runner = FfmpegRunner::new("ffmpeg", "ffprobe");
        let token = CancellationToken::new();
        token.cancel();
        let result = runner
            .run(
                &[],
                RunOptions {
                    op_id: "op".to_string(),
                    total_duration_sec: None,
                    progress_cb: None,
                    signal: token,
                },
            )
            .await;
        assert!(matches!(result, Err(CoreError::Cancelled)));
    }
}
