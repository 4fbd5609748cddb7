//! Orchestrates chunked or direct transcription against a `ProviderClient`,
//! then applies the hallucination filter. Fan-out shape (bounded
//! concurrency via a semaphore, results reassembled by sort) is grounded on
//! the teacher's chunk-transcription orchestrator.

use crate::audio::{Chunk, SpeechInterval, VadConfig};
use crate::cancel::CancellationToken;
use crate::config::Config;
use crate::error::{CoreError, Result};
use crate::ffmpeg::FfmpegRunner;
use crate::progress::{bands, scale, ProgressEvent, ProgressSink, Stage};
use crate::provider::retry::with_fallback;
use crate::provider::{
    route_transcription, ProviderClient, RawSegment, TranscribeRequest, TranscribeResponse, TranscriptionRoute,
};
use crate::segment::{sort_and_reindex, Segment};
use futures::stream::{FuturesUnordered, StreamExt};
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

pub struct TranscribeOptions<'a> {
    pub op_id: String,
    pub provider: Arc<dyn ProviderClient>,
    pub fallback_provider: Option<Arc<dyn ProviderClient>>,
    pub runner: &'a FfmpegRunner,
    pub signal: CancellationToken,
    pub sink: Arc<dyn ProgressSink>,
    pub language: Option<String>,
    pub temp_dir: PathBuf,
}

/// Builds a retryable attempt closure for a single provider against a
/// single audio path. Each invocation clones its captured state fresh, so
/// the same closure can be handed to [`with_fallback`]'s retry loop and
/// called any number of times.
fn transcribe_attempt(
    provider: Arc<dyn ProviderClient>,
    audio_path: PathBuf,
    prompt_context: Option<String>,
    idempotency_key: Option<String>,
    language: Option<String>,
    signal: CancellationToken,
) -> impl FnMut() -> Pin<Box<dyn std::future::Future<Output = Result<TranscribeResponse>> + Send>> {
    move || {
        let provider = provider.clone();
        let audio_path = audio_path.clone();
        let prompt_context = prompt_context.clone();
        let idempotency_key = idempotency_key.clone();
        let language = language.clone();
        let signal = signal.clone();
        Box::pin(async move {
            provider
                .transcribe(
                    TranscribeRequest {
                        audio_path,
                        prompt_context,
                        idempotency_key,
                        language,
                    },
                    &signal,
                )
                .await
        })
    }
}

fn speech_overlap_fraction(start_sec: f64, end_sec: f64, speech: &[SpeechInterval]) -> f64 {
    let duration = (end_sec - start_sec).max(f64::EPSILON);
    let overlap: f64 = speech
        .iter()
        .map(|s| (s.end_sec.min(end_sec) - s.start_sec.max(start_sec)).max(0.0))
        .sum();
    (overlap / duration).min(1.0)
}

/// Drops hallucinated segments per the filter spelled out in the component
/// design: near-certain non-speech, low average log-probability, and
/// negligible overlap with detected speech, all three at once. `start_sec`/
/// `end_sec` must already be in absolute file-time. The direct, unchunked
/// route never runs VAD, so an empty `speech` slice carries no information
/// about whether the segment overlaps real speech - it never counts as low
/// overlap, erring toward keeping the segment.
fn is_hallucination(raw: &RawSegment, start_sec: f64, end_sec: f64, speech: &[SpeechInterval]) -> bool {
    if raw.text.trim().is_empty() {
        return true;
    }
    let high_no_speech = raw.no_speech_prob.map(|p| p >= 0.92).unwrap_or(false);
    let low_confidence = raw.avg_logprob.map(|p| p <= -1.3).unwrap_or(false);
    let low_overlap = !speech.is_empty() && speech_overlap_fraction(start_sec, end_sec, speech) < 0.15;
    high_no_speech && low_confidence && low_overlap
}

pub async fn transcribe(
    audio_path: &Path,
    duration_sec: f64,
    chunks: &[Chunk],
    speech: &[SpeechInterval],
    config: &Config,
    opts: TranscribeOptions<'_>,
) -> Result<Vec<Segment>> {
    let file_size = tokio::fs::metadata(audio_path).await.map(|m| m.len()).unwrap_or(0);

    if chunks.is_empty() {
        let route = route_transcription(duration_sec, file_size, &config.thresholds);
        if route != TranscriptionRoute::Direct {
            return Ok(Vec::new());
        }

        return match transcribe_direct(audio_path, config, &opts).await {
            Ok(segments) => Ok(segments),
            Err(CoreError::Cancelled) => Err(CoreError::Cancelled),
            Err(e) => {
                warn!(error = %e, "direct transcription failed, falling back to chunked transcription");
                let vad_config = VadConfig::from_thresholds(&config.thresholds);
                let (fallback_speech, fallback_chunks) =
                    crate::audio::detect_speech_and_chunks(opts.runner, audio_path, duration_sec, &vad_config).await?;
                if fallback_chunks.is_empty() {
                    return Ok(Vec::new());
                }
                if config.quality_transcription {
                    transcribe_sequential(audio_path, &fallback_chunks, &fallback_speech, config, &opts).await
                } else {
                    transcribe_parallel(audio_path, &fallback_chunks, &fallback_speech, config, &opts).await
                }
            }
        };
    }

    if config.quality_transcription {
        transcribe_sequential(audio_path, chunks, speech, config, &opts).await
    } else {
        transcribe_parallel(audio_path, chunks, speech, config, &opts).await
    }
}

async fn transcribe_direct(audio_path: &Path, config: &Config, opts: &TranscribeOptions<'_>) -> Result<Vec<Segment>> {
    if opts.signal.is_cancelled() {
        return Err(CoreError::Cancelled);
    }

    let audio_path = audio_path.to_path_buf();
    let idempotency_key = Some(opts.op_id.clone());

    let response = with_fallback(
        &config.thresholds,
        &opts.signal,
        transcribe_attempt(
            opts.provider.clone(),
            audio_path.clone(),
            None,
            idempotency_key.clone(),
            opts.language.clone(),
            opts.signal.clone(),
        ),
        opts.fallback_provider.clone().map(|fb| {
            transcribe_attempt(fb, audio_path.clone(), None, idempotency_key.clone(), opts.language.clone(), opts.signal.clone())
        }),
    )
    .await?;

    let segments = filter_and_map(response.segments.into_iter().enumerate().map(|(i, s)| (i, s, 0.0)), &[]);
    opts.sink.publish(ProgressEvent::new(
        opts.op_id.clone(),
        scale(100.0, bands::TRANSCRIBE),
        Stage::Transcribe,
    ));
    Ok(sort_and_reindex(segments))
}

async fn transcribe_sequential(
    audio_path: &Path,
    chunks: &[Chunk],
    speech: &[SpeechInterval],
    config: &Config,
    opts: &TranscribeOptions<'_>,
) -> Result<Vec<Segment>> {
    let mut all = Vec::new();
    let mut rolling_context = String::new();
    let total = chunks.len();

    for (done, chunk) in chunks.iter().enumerate() {
        if opts.signal.is_cancelled() {
            return Err(CoreError::Cancelled);
        }

        let (segments, chunk_text) =
            transcribe_one_chunk(audio_path, chunk, speech, &rolling_context, all.len(), config, opts).await?;
        rolling_context = roll_context(&rolling_context, &chunk_text, config.thresholds.max_prompt_chars);
        all.extend(segments);

        report_chunk_progress(opts, done + 1, total);
    }

    Ok(sort_and_reindex(all))
}

async fn transcribe_parallel(
    audio_path: &Path,
    chunks: &[Chunk],
    speech: &[SpeechInterval],
    config: &Config,
    opts: &TranscribeOptions<'_>,
) -> Result<Vec<Segment>> {
    let semaphore = Arc::new(Semaphore::new(config.transcribe_concurrency.max(1)));
    let total = chunks.len();
    let thresholds = config.thresholds;
    let mut futures_unordered = FuturesUnordered::new();

    for chunk in chunks {
        let semaphore = semaphore.clone();
        let chunk = chunk.clone();
        let provider = opts.provider.clone();
        let fallback_provider = opts.fallback_provider.clone();
        let signal = opts.signal.clone();
        let language = opts.language.clone();
        let op_id = opts.op_id.clone();
        let runner = opts.runner.clone();
        let source = audio_path.to_path_buf();
        let chunk_path = opts.temp_dir.join(format!("chunk-{:04}.wav", chunk.index));

        futures_unordered.push(async move {
            let _permit = semaphore.acquire().await.expect("semaphore closed");
            if signal.is_cancelled() {
                return Err(CoreError::Cancelled);
            }
            runner
                .extract_audio_segment(&source, &chunk_path, chunk.start_sec, chunk.duration(), signal.clone())
                .await?;

            let idempotency_key = Some(format!("{op_id}-{}", chunk.index));
            let response = with_fallback(
                &thresholds,
                &signal,
                transcribe_attempt(provider, chunk_path.clone(), None, idempotency_key.clone(), language.clone(), signal.clone()),
                fallback_provider
                    .map(|fb| transcribe_attempt(fb, chunk_path.clone(), None, idempotency_key.clone(), language.clone(), signal.clone())),
            )
            .await;
            let _ = tokio::fs::remove_file(&chunk_path).await;
            response.map(|r| (chunk.clone(), r))
        });
    }

    let mut all = Vec::new();
    let mut done = 0usize;
    let mut credit_exhausted = None;

    while let Some(result) = futures_unordered.next().await {
        done += 1;
        match result {
            Ok((chunk, response)) => {
                let mapped = filter_and_map(
                    response
                        .segments
                        .into_iter()
                        .enumerate()
                        .map(|(i, s)| (i, s, chunk.start_sec)),
                    speech,
                );
                all.extend(mapped);
            }
            Err(CoreError::InsufficientCredits) => {
                credit_exhausted = Some(CoreError::InsufficientCredits);
                break;
            }
            Err(e) => {
                warn!(error = %e, "chunk transcription failed, skipping");
            }
        }
        report_chunk_progress(opts, done, total);
    }

    if let Some(err) = credit_exhausted {
        return Err(err);
    }

    Ok(sort_and_reindex(all))
}

async fn transcribe_one_chunk(
    audio_path: &Path,
    chunk: &Chunk,
    speech: &[SpeechInterval],
    rolling_context: &str,
    segments_so_far: usize,
    config: &Config,
    opts: &TranscribeOptions<'_>,
) -> Result<(Vec<Segment>, String)> {
    let chunk_path = opts.temp_dir.join(format!("chunk-{:04}.wav", chunk.index));
    opts.runner
        .extract_audio_segment(audio_path, &chunk_path, chunk.start_sec, chunk.duration(), opts.signal.clone())
        .await?;

    let prompt_context = if segments_so_far >= config.thresholds.min_context_segments {
        Some(rolling_context.to_string())
    } else {
        None
    };
    let idempotency_key = Some(format!("{}-{}", opts.op_id, chunk.index));

    let response = with_fallback(
        &config.thresholds,
        &opts.signal,
        transcribe_attempt(
            opts.provider.clone(),
            chunk_path.clone(),
            prompt_context.clone(),
            idempotency_key.clone(),
            opts.language.clone(),
            opts.signal.clone(),
        ),
        opts.fallback_provider.clone().map(|fb| {
            transcribe_attempt(
                fb,
                chunk_path.clone(),
                prompt_context.clone(),
                idempotency_key.clone(),
                opts.language.clone(),
                opts.signal.clone(),
            )
        }),
    )
    .await?;

    let _ = tokio::fs::remove_file(&chunk_path).await;

    let chunk_text: String = response.segments.iter().map(|s| s.text.clone()).collect::<Vec<_>>().join(" ");
    let mapped = filter_and_map(
        response
            .segments
            .into_iter()
            .enumerate()
            .map(|(i, s)| (i, s, chunk.start_sec)),
        speech,
    );
    Ok((mapped, chunk_text))
}

fn roll_context(previous: &str, new_text: &str, max_chars: usize) -> String {
    let combined = if previous.is_empty() {
        new_text.to_string()
    } else {
        format!("{previous} {new_text}")
    };
    if combined.len() <= max_chars {
        combined
    } else {
        let start = combined.len() - max_chars;
        combined[start..].to_string()
    }
}

/// Shifts each raw segment to absolute file-time first, then applies the
/// hallucination filter against that absolute time range - the filter
/// needs file-time to compare against `speech`, which is itself file-time.
fn filter_and_map(raw: impl Iterator<Item = (usize, RawSegment, f64)>, speech: &[SpeechInterval]) -> Vec<Segment> {
    raw.filter_map(|(i, s, shift)| {
        let start_sec = s.start_sec + shift;
        let end_sec = s.end_sec + shift;
        if is_hallucination(&s, start_sec, end_sec, speech) {
            return None;
        }
        let no_speech_prob = s.no_speech_prob;
        let avg_logprob = s.avg_logprob;
        let mut seg = Segment::new(i + 1, start_sec, end_sec, s.text);
        seg.no_speech_prob = no_speech_prob;
        seg.avg_logprob = avg_logprob;
        Some(seg)
    })
    .collect()
}

fn report_chunk_progress(opts: &TranscribeOptions<'_>, done: usize, total: usize) {
    let local = if total == 0 { 100.0 } else { (done as f64 / total as f64) * 100.0 };
    debug!(done, total, "transcription progress");
    opts.sink.publish(
        ProgressEvent::new(opts.op_id.clone(), scale(local, bands::TRANSCRIBE), Stage::Transcribe)
            .with_progress(done as u64, total as u64),
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::RawSegment;

    fn raw(text: &str, no_speech: Option<f64>, logprob: Option<f64>) -> RawSegment {
        RawSegment {
            start_sec: 0.0,
            end_sec: 1.0,
            text: text.to_string(),
            no_speech_prob: no_speech,
            avg_logprob: logprob,
        }
    }

    #[test]
    fn hallucination_filter_drops_low_confidence_silence_with_no_overlap() {
        let speech = [SpeechInterval::new(50.0, 60.0)];
        assert!(is_hallucination(&raw("um", Some(0.95), Some(-1.5)), 0.0, 1.0, &speech));
    }

    #[test]
    fn hallucination_filter_keeps_confident_speech() {
        assert!(!is_hallucination(&raw("hello world", Some(0.1), Some(-0.2)), 0.0, 1.0, &[]));
    }

    #[test]
    fn hallucination_filter_drops_empty_text() {
        assert!(is_hallucination(&raw("   ", None, None), 0.0, 1.0, &[]));
    }

    #[test]
    fn hallucination_filter_requires_all_three_conditions() {
        // high no_speech_prob alone, without a low logprob, should survive.
        assert!(!is_hallucination(&raw("hello", Some(0.95), Some(-0.1)), 0.0, 1.0, &[]));
    }

    #[test]
    fn hallucination_filter_keeps_segment_that_overlaps_detected_speech() {
        // no_speech_prob/avg_logprob both trip, but the segment actually
        // overlaps a detected speech interval almost entirely - real
        // speech, not a hallucination.
        let speech = [SpeechInterval::new(0.0, 1.0)];
        assert!(!is_hallucination(&raw("hello", Some(0.95), Some(-1.5)), 0.0, 1.0, &speech));
    }

    #[test]
    fn hallucination_filter_treats_missing_vad_data_as_no_overlap_signal() {
        // Direct route never runs VAD - an empty speech slice must not be
        // read as "zero overlap" and used to drop a segment on its own.
        assert!(!is_hallucination(&raw("hello", Some(0.95), Some(-1.5)), 0.0, 1.0, &[]));
    }

    #[test]
    fn roll_context_trims_to_max_chars_from_the_tail() {
        let rolled = roll_context("hello world", "this is new text", 10);
        assert_eq!(rolled.len(), 10);
        assert!(rolled.ends_with("new text"));
    }

    #[test]
    fn filter_and_map_shifts_timestamps_by_chunk_start() {
        let raws = vec![(0usize, raw("hi", None, None), 10.0)];
        let mapped = filter_and_map(raws.into_iter(), &[]);
        assert_eq!(mapped[0].start_sec, 10.0);
        assert_eq!(mapped[0].end_sec, 11.0);
    }

    #[test]
    fn filter_and_map_checks_overlap_against_absolute_shifted_time() {
        // The speech interval only covers the post-shift (absolute) range;
        // a pre-shift check would miss it entirely.
        let speech = [SpeechInterval::new(10.0, 11.0)];
        let raws = vec![(0usize, raw("hi", Some(0.95), Some(-1.5)), 10.0)];
        let mapped = filter_and_map(raws.into_iter(), &speech);
        assert_eq!(mapped.len(), 1);
    }
}
