//! Wires the component passes into the three caller-facing entry points.
//! Generalizes the teacher's single `generate_subtitles` transcribe-then-
//! postprocess flow into the multi-pass transcribe/translate/finalize/
//! render pipeline.

use crate::audio::{detect_speech_and_chunks, prepare_audio, VadConfig};
use crate::cancel::CancellationToken;
use crate::config::{Config, OutputMode, Thresholds};
use crate::diskspace;
use crate::error::{CoreError, Result};
use crate::ffmpeg::FfmpegRunner;
use crate::finalize::{finalize, parse_srt, serialize_srt};
use crate::overlay::{self, PngRenderer, RenderMode, RenderOptions, StylePreset};
use crate::progress::{bands, scale, ProgressEvent, ProgressSink, Stage};
use crate::provider::gemini::GeminiClient;
use crate::provider::whisper::WhisperClient;
use crate::provider::ProviderClient;
use crate::segment::Segment;
use crate::transcribe::{transcribe, TranscribeOptions};
use crate::translate::{translate, TranslateOptions};
use std::path::PathBuf;
use std::sync::Arc;

pub struct ExtractOptions {
    pub op_id: String,
    pub input_path: PathBuf,
    pub language: Option<String>,
    pub output_mode: OutputMode,
    pub signal: CancellationToken,
    pub sink: Arc<dyn ProgressSink>,
}

pub struct TranslateSrtOptions {
    pub op_id: String,
    pub target_language: String,
    pub signal: CancellationToken,
    pub sink: Arc<dyn ProgressSink>,
}

pub struct RenderOverlayOptions {
    pub op_id: String,
    pub input_path: PathBuf,
    pub srt: String,
    pub output_path: PathBuf,
    pub mode: RenderMode,
    pub style: StylePreset,
    pub vertical_9x16: bool,
    pub signal: CancellationToken,
}

fn provider_for(kind: crate::config::ProviderKind, config: &Config) -> Result<Arc<dyn ProviderClient>> {
    match kind {
        crate::config::ProviderKind::PrimaryRemote => {
            let key = config
                .gemini_api_key
                .clone()
                .ok_or_else(|| CoreError::Config("GEMINI_API_KEY not configured".to_string()))?;
            Ok(Arc::new(GeminiClient::new(key)))
        }
        crate::config::ProviderKind::FallbackRemote => {
            let key = config
                .openai_api_key
                .clone()
                .ok_or_else(|| CoreError::Config("OPENAI_API_KEY not configured".to_string()))?;
            Ok(Arc::new(WhisperClient::new(key)))
        }
        crate::config::ProviderKind::Local => Ok(Arc::new(crate::provider::UnimplementedLocalProvider)),
    }
}

/// Resolves both the primary provider and a best-effort runtime fallback.
/// If the primary fails to even construct (e.g. missing API key), the
/// fallback is promoted to sole primary and there's nothing left to fall
/// back to at runtime - this preserves the original construction-time
/// fallback behavior for that case.
fn resolve_providers(config: &Config) -> Result<(Arc<dyn ProviderClient>, Option<Arc<dyn ProviderClient>>)> {
    match provider_for(config.primary_provider, config) {
        Ok(primary) => {
            let fallback = config.fallback_provider.and_then(|kind| provider_for(kind, config).ok());
            Ok((primary, fallback))
        }
        Err(primary_err) => match config.fallback_provider.and_then(|kind| provider_for(kind, config).ok()) {
            Some(fallback) => Ok((fallback, None)),
            None => Err(primary_err),
        },
    }
}

/// Builds an `FfmpegRunner` wired with the configured stall/stderr
/// thresholds instead of its hardcoded defaults.
fn build_runner(config: &Config) -> FfmpegRunner {
    let t: &Thresholds = &config.thresholds;
    FfmpegRunner::new(&config.ffmpeg_path, &config.ffprobe_path)
        .with_stall_timeouts(
            std::time::Duration::from_secs(t.ffmpeg_startup_stall_sec),
            std::time::Duration::from_secs(t.ffmpeg_startup_stall_cold_sec),
        )
        .with_runtime_stall(std::time::Duration::from_secs(t.ffmpeg_runtime_stall_sec))
        .with_stderr_cap(t.stderr_ring_buffer_bytes)
}

/// Entry point 1: media in, finalized SRT out. Runs audio prep, VAD
/// chunking, transcription, optional translation, and finalize in
/// sequence, publishing progress across the full `[0, 100]` range.
pub async fn extract_subtitles_from_media(config: &Config, opts: ExtractOptions) -> Result<String> {
    let runner = build_runner(config);
    crate::audio::prepare::check_dependencies(&config.ffmpeg_path, &config.ffprobe_path).await?;

    let temp_dir = std::env::temp_dir().join(format!("subforge-{}", opts.op_id));
    let source_size = tokio::fs::metadata(&opts.input_path).await.map(|m| m.len()).unwrap_or(0);
    diskspace::ensure_space_available(&std::env::temp_dir(), source_size)?;
    tokio::fs::create_dir_all(&temp_dir).await.map_err(CoreError::Io)?;
    let audio_path = temp_dir.join("audio.wav");

    prepare_audio(&runner, &opts.input_path, &audio_path, &opts.op_id, opts.signal.clone()).await?;
    opts.sink.publish(ProgressEvent::new(opts.op_id.clone(), scale(100.0, bands::AUDIO), Stage::Audio));

    let duration_sec = runner.probe_duration(&audio_path).await?;
    let file_size = tokio::fs::metadata(&audio_path).await.map(|m| m.len()).unwrap_or(0);

    let route = crate::provider::route_transcription(duration_sec, file_size, &config.thresholds);
    let (speech, chunks) = if route == crate::provider::TranscriptionRoute::Chunked {
        let vad_config = VadConfig::from_thresholds(&config.thresholds);
        detect_speech_and_chunks(&runner, &audio_path, duration_sec, &vad_config).await?
    } else {
        (Vec::new(), Vec::new())
    };

    let (provider, fallback_provider) = resolve_providers(config)?;
    let segments = transcribe(
        &audio_path,
        duration_sec,
        &chunks,
        &speech,
        config,
        TranscribeOptions {
            op_id: opts.op_id.clone(),
            provider,
            fallback_provider,
            runner: &runner,
            signal: opts.signal.clone(),
            sink: opts.sink.clone(),
            language: opts.language.clone(),
            temp_dir: temp_dir.clone(),
        },
    )
    .await?;

    let segments = if let Some(target) = opts.language.as_deref().filter(|l| !l.eq_ignore_ascii_case("original")) {
        let (provider, fallback_provider) = resolve_providers(config)?;
        translate(
            segments,
            config,
            TranslateOptions {
                op_id: opts.op_id.clone(),
                provider,
                fallback_provider,
                signal: opts.signal.clone(),
                sink: opts.sink.clone(),
                target_language: target.to_string(),
                review: config.quality_translation,
            },
        )
        .await?
    } else {
        segments
    };

    let finalized = finalize(segments, &config.thresholds);
    opts.sink.publish(ProgressEvent::new(opts.op_id.clone(), scale(100.0, bands::FINAL), Stage::Finalize));

    let srt = serialize_srt(&finalized, opts.output_mode);
    let _ = tokio::fs::remove_dir_all(&temp_dir).await;
    Ok(srt)
}

/// Entry point 2: existing SRT in, translated SRT out.
pub async fn translate_srt(srt: &str, config: &Config, opts: TranslateSrtOptions) -> Result<String> {
    let segments = parse_srt(srt);
    let (provider, fallback_provider) = resolve_providers(config)?;
    let translated = translate(
        segments,
        config,
        TranslateOptions {
            op_id: opts.op_id,
            provider,
            fallback_provider,
            signal: opts.signal,
            sink: opts.sink,
            target_language: opts.target_language,
            review: config.quality_translation,
        },
    )
    .await?;
    Ok(serialize_srt(&translated, OutputMode::Translation))
}

/// Entry point 3: media + finalized SRT in, rendered video out.
pub async fn render_overlay(
    config: &Config,
    opts: RenderOverlayOptions,
    png_renderer: Option<&dyn PngRenderer>,
) -> Result<PathBuf> {
    let runner = build_runner(config);
    let segments: Vec<Segment> = parse_srt(&opts.srt);
    let temp_dir = std::env::temp_dir().join(format!("subforge-render-{}", opts.op_id));

    let source_size = tokio::fs::metadata(&opts.input_path).await.map(|m| m.len()).unwrap_or(0);
    diskspace::ensure_space_available(&std::env::temp_dir(), source_size)?;

    overlay::render(
        &runner,
        &opts.input_path,
        &segments,
        &opts.output_path,
        RenderOptions {
            op_id: opts.op_id,
            mode: opts.mode,
            style: opts.style,
            vertical_9x16: opts.vertical_9x16,
            signal: opts.signal,
            temp_dir,
        },
        png_renderer,
    )
    .await?;

    Ok(opts.output_path)
}

pub fn print_summary(segment_count: usize, duration_sec: f64) -> String {
    format!("{segment_count} segments, {duration_sec:.1}s of source audio")
}
