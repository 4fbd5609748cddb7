//! Burns or overlays finalized subtitles onto a media file. Mode A (ASS
//! burn-in) and Mode B (PNG overlay) share cue derivation and the
//! atomic-rename-then-copy publish step, grounded on
//! `jeremyplt-autotrim-desktop`'s `render_video` temp-then-move pattern.

pub mod ass;
pub mod cue;

use crate::cancel::CancellationToken;
use crate::diskspace::map_io_error;
use crate::error::{CoreError, Result};
use crate::ffmpeg::{FfmpegRunner, RunOptions};
use crate::segment::Segment;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tracing::info;

pub use ass::{escape_ass_text, StylePreset};
pub use cue::{derive_cue_events, CueEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderMode {
    AssBurnIn,
    PngOverlay,
}

pub struct RenderOptions {
    pub op_id: String,
    pub mode: RenderMode,
    pub style: StylePreset,
    pub vertical_9x16: bool,
    pub signal: CancellationToken,
    pub temp_dir: PathBuf,
}

/// A headless-browser (or equivalent) rasterizer that renders one subtitle
/// state to a transparent PNG. The real implementation is an external
/// collaborator outside this crate's scope; `StubPngRenderer` below is the
/// deterministic test double.
#[async_trait]
pub trait PngRenderer: Send + Sync {
    async fn render_state(&self, text: &str, style: &StylePreset, out_path: &Path) -> Result<()>;
}

pub struct StubPngRenderer;

#[async_trait]
impl PngRenderer for StubPngRenderer {
    async fn render_state(&self, _text: &str, _style: &StylePreset, out_path: &Path) -> Result<()> {
        tokio::fs::write(out_path, b"\x89PNG\r\n\x1a\n")
            .await
            .map_err(CoreError::Io)
    }
}

pub async fn render(
    runner: &FfmpegRunner,
    input: &Path,
    segments: &[Segment],
    output: &Path,
    opts: RenderOptions,
    png_renderer: Option<&dyn PngRenderer>,
) -> Result<()> {
    tokio::fs::create_dir_all(&opts.temp_dir).await.map_err(CoreError::Io)?;
    let duration = runner.probe_duration(input).await?;
    let has_video = runner.has_video_track(input).await?;

    let temp_output = opts.temp_dir.join("render_output.mp4");

    match opts.mode {
        RenderMode::AssBurnIn => render_ass_burn_in(runner, input, segments, &temp_output, &opts, duration, has_video).await?,
        RenderMode::PngOverlay => {
            let renderer = png_renderer.ok_or_else(|| {
                CoreError::InternalInvariantViolated("png overlay mode requires a PngRenderer".to_string())
            })?;
            render_png_overlay(runner, input, segments, &temp_output, &opts, duration, has_video, renderer).await?;
        }
    }

    publish(&temp_output, output).await
}

async fn render_ass_burn_in(
    runner: &FfmpegRunner,
    input: &Path,
    segments: &[Segment],
    temp_output: &Path,
    opts: &RenderOptions,
    duration: f64,
    has_video: bool,
) -> Result<()> {
    let ass_path = opts.temp_dir.join("overlay.ass");
    let ass_contents = ass::build_ass_document(segments, &opts.style);
    tokio::fs::write(&ass_path, ass_contents).await.map_err(CoreError::Io)?;

    let escaped = escape_ass_text(&ass_path.display().to_string());
    let mut vf = format!("subtitles='{escaped}'");
    if opts.vertical_9x16 {
        vf = format!("scale=1080:-2,pad=1080:1920:(ow-iw)/2:(oh-ih)/2,{vf}");
    }

    let mut args = Vec::new();
    if !has_video {
        args.push("-f".to_string());
        args.push("lavfi".to_string());
        args.push("-i".to_string());
        args.push(format!("color=c={}:s=1920x1080:d={:.3}", opts.style.background_color, duration));
        args.push("-i".to_string());
        args.push(input.display().to_string());
        args.push("-shortest".to_string());
        args.push("-map".to_string());
        args.push("0:v".to_string());
        args.push("-map".to_string());
        args.push("1:a".to_string());
    } else {
        args.push("-i".to_string());
        args.push(input.display().to_string());
    }
    args.extend([
        "-vf".to_string(),
        vf,
        "-c:v".to_string(),
        "libx264".to_string(),
        "-preset".to_string(),
        "veryfast".to_string(),
        "-crf".to_string(),
        "18".to_string(),
        "-movflags".to_string(),
        "+faststart".to_string(),
        temp_output.display().to_string(),
    ]);

    runner
        .run(
            &args,
            RunOptions {
                op_id: opts.op_id.clone(),
                total_duration_sec: Some(duration),
                progress_cb: None,
                signal: opts.signal.clone(),
            },
        )
        .await
}

async fn render_png_overlay(
    runner: &FfmpegRunner,
    input: &Path,
    segments: &[Segment],
    temp_output: &Path,
    opts: &RenderOptions,
    duration: f64,
    has_video: bool,
    png_renderer: &dyn PngRenderer,
) -> Result<()> {
    let events = derive_cue_events(segments, duration);
    let states = cue::derive_states(&events, duration);

    let mut concat_lines = String::from("ffconcat version 1.0\n");
    for (i, state) in states.iter().enumerate() {
        let png_path = opts.temp_dir.join(format!("state-{i:04}.png"));
        png_renderer.render_state(&state.text, &opts.style, &png_path).await?;
        concat_lines.push_str(&format!("file '{}'\n", png_path.display()));
        concat_lines.push_str(&format!("duration {:.6}\n", state.duration_sec));
    }
    if let Some(last) = states.last() {
        let last_path = opts.temp_dir.join(format!("state-{:04}.png", states.len() - 1));
        concat_lines.push_str(&format!("file '{}'\n", last_path.display()));
        let _ = last;
    }
    let concat_path = opts.temp_dir.join("overlay.ffconcat");
    tokio::fs::write(&concat_path, concat_lines).await.map_err(CoreError::Io)?;

    let base_input: PathBuf;
    let mut args = Vec::new();
    if !has_video {
        base_input = opts.temp_dir.join("base.mp4");
        let base_args = vec![
            "-f".to_string(),
            "lavfi".to_string(),
            "-i".to_string(),
            format!("color=c={}:s=1920x1080:d={:.3}", opts.style.background_color, duration),
            "-i".to_string(),
            input.display().to_string(),
            "-shortest".to_string(),
            "-map".to_string(),
            "0:v".to_string(),
            "-map".to_string(),
            "1:a".to_string(),
            "-c:v".to_string(),
            "libx264".to_string(),
            "-preset".to_string(),
            "veryfast".to_string(),
            base_input.display().to_string(),
        ];
        runner
            .run(
                &base_args,
                RunOptions {
                    op_id: format!("{}-base", opts.op_id),
                    total_duration_sec: Some(duration),
                    progress_cb: None,
                    signal: opts.signal.clone(),
                },
            )
            .await?;
    } else {
        base_input = input.to_path_buf();
    }

    args.extend([
        "-i".to_string(),
        base_input.display().to_string(),
        "-f".to_string(),
        "concat".to_string(),
        "-safe".to_string(),
        "0".to_string(),
        "-i".to_string(),
        concat_path.display().to_string(),
        "-filter_complex".to_string(),
        "overlay=format=auto:shortest=1".to_string(),
        "-c:v".to_string(),
        "libx264".to_string(),
        "-preset".to_string(),
        "veryfast".to_string(),
        "-crf".to_string(),
        "18".to_string(),
        "-movflags".to_string(),
        "+faststart".to_string(),
        temp_output.display().to_string(),
    ]);

    runner
        .run(
            &args,
            RunOptions {
                op_id: opts.op_id.clone(),
                total_duration_sec: Some(duration),
                progress_cb: None,
                signal: opts.signal.clone(),
            },
        )
        .await
}

/// Atomically publishes the rendered temp file to its final path, following
/// the rename-then-copy/unlink fallback used for cross-filesystem moves.
async fn publish(temp_output: &Path, output: &Path) -> Result<()> {
    match tokio::fs::rename(temp_output, output).await {
        Ok(()) => Ok(()),
        Err(e) if e.raw_os_error() == Some(libc_exdev()) => {
            tokio::fs::copy(temp_output, output).await.map_err(map_io_error)?;
            tokio::fs::remove_file(temp_output).await.map_err(map_io_error)?;
            info!("cross-device rename fallback used for render output");
            Ok(())
        }
        Err(e) => {
            // Some platforms/filesystems surface a generic error rather than
            // EXDEV for cross-device renames; fall back unconditionally.
            match tokio::fs::copy(temp_output, output).await {
                Ok(_) => {
                    let _ = tokio::fs::remove_file(temp_output).await;
                    Ok(())
                }
                Err(_) => Err(map_io_error(e)),
            }
        }
    }
}

#[cfg(unix)]
fn libc_exdev() -> i32 {
    18
}

#[cfg(not(unix))]
fn libc_exdev() -> i32 {
    17
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_renames_when_same_filesystem() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src.mp4");
        let dst = dir.path().join("dst.mp4");
        tokio::fs::write(&src, b"data").await.unwrap();
        publish(&src, &dst).await.unwrap();
        assert!(dst.exists());
        assert!(!src.exists());
    }
}
