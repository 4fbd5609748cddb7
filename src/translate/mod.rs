//! Batches segments into fixed-size windows, translates each window with
//! surrounding context through a `ProviderClient::complete` call, and
//! optionally runs a wider review pass. Batch-and-fan-out shape is
//! grounded on the teacher's `create_translator`/`translate_batch`
//! interface, generalized from a dedicated `Translator` trait to the
//! shared capability trait.

use crate::cancel::CancellationToken;
use crate::config::Config;
use crate::error::Result;
use crate::progress::{bands, scale, ProgressEvent, ProgressSink, Stage};
use crate::provider::retry::with_fallback;
use crate::provider::{CompleteRequest, ModelTier, ProviderClient};
use crate::segment::Segment;
use futures::stream::{FuturesUnordered, StreamExt};
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::warn;

const TRANSLATION_MARKER: &str = "###TRANSLATION_MARKER###";

pub struct TranslateOptions {
    pub op_id: String,
    pub provider: Arc<dyn ProviderClient>,
    pub fallback_provider: Option<Arc<dyn ProviderClient>>,
    pub signal: CancellationToken,
    pub sink: Arc<dyn ProgressSink>,
    pub target_language: String,
    pub review: bool,
}

/// Builds a retryable completion attempt closure for a single provider,
/// matching [`crate::transcribe::transcribe_attempt`]'s shape so both
/// passes go through the same `with_fallback` retry/fallback policy.
fn complete_attempt(
    provider: Arc<dyn ProviderClient>,
    req: CompleteRequest,
    signal: CancellationToken,
) -> impl FnMut() -> Pin<Box<dyn std::future::Future<Output = Result<String>> + Send>> {
    move || {
        let provider = provider.clone();
        let req = req.clone();
        let signal = signal.clone();
        Box::pin(async move { provider.complete(req, &signal).await })
    }
}

struct Window {
    /// Index into `segments` (not the segment's own 1-based index) of the
    /// first line that must actually be translated/reviewed.
    target_start: usize,
    target_end: usize,
    ctx_start: usize,
    ctx_end: usize,
}

pub async fn translate(segments: Vec<Segment>, config: &Config, opts: TranslateOptions) -> Result<Vec<Segment>> {
    if opts.target_language.eq_ignore_ascii_case("original") || segments.is_empty() {
        return Ok(segments);
    }

    let windows = build_windows(
        segments.len(),
        config.thresholds.translate_batch_size,
        config.thresholds.translate_before_ctx,
        config.thresholds.translate_after_ctx,
    );

    let segments = translate_windows(segments, &windows, config, &opts).await?;

    if opts.review {
        let review_windows = build_windows(
            segments.len(),
            config.thresholds.review_window,
            config.thresholds.review_ctx,
            config.thresholds.review_ctx,
        );
        review_windows_pass(segments, &review_windows, config, &opts).await
    } else {
        Ok(segments)
    }
}

fn build_windows(total: usize, size: usize, before_ctx: usize, after_ctx: usize) -> Vec<Window> {
    let mut windows = Vec::new();
    let mut start = 0;
    while start < total {
        let end = (start + size).min(total);
        windows.push(Window {
            target_start: start,
            target_end: end,
            ctx_start: start.saturating_sub(before_ctx),
            ctx_end: (end + after_ctx).min(total),
        });
        start = end;
    }
    windows
}

fn build_prompt(segments: &[Segment], window: &Window, target_language: &str) -> String {
    let mut prompt = format!(
        "Translate the following numbered lines into {target_language}. Return exactly one line per \
         input line in the form `Line N: <translation>`, preserving N. Context lines are given for \
         continuity only and must not be returned.\n\n"
    );

    for i in window.ctx_start..window.target_start {
        prompt.push_str(&format!("Context Line {}: {}\n", segments[i].index, segments[i].original_text));
    }
    for i in window.target_start..window.target_end {
        prompt.push_str(&format!("Line {}: {}\n", segments[i].index, segments[i].original_text));
    }
    for i in window.target_end..window.ctx_end {
        prompt.push_str(&format!("Context Line {}: {}\n", segments[i].index, segments[i].original_text));
    }
    prompt
}

/// Parses `Line N: <text>` responses into an index -> translation map.
/// Lines that don't match are ignored; missing indices are the caller's
/// responsibility to fall back on.
fn parse_translated_lines(response: &str) -> std::collections::HashMap<usize, String> {
    let re = regex::Regex::new(r"^\s*Line\s+(\d+):\s*(.*)$").unwrap();
    let mut map = std::collections::HashMap::new();
    for line in response.lines() {
        if let Some(caps) = re.captures(line) {
            if let Ok(n) = caps[1].parse::<usize>() {
                map.insert(n, caps[2].trim().to_string());
            }
        }
    }
    map
}

async fn translate_windows(
    mut segments: Vec<Segment>,
    windows: &[Window],
    config: &Config,
    opts: &TranslateOptions,
) -> Result<Vec<Segment>> {
    let semaphore = Arc::new(Semaphore::new(config.translate_concurrency.max(1)));
    let total = windows.len();
    let mut futures_unordered = FuturesUnordered::new();

    for (idx, window) in windows.iter().enumerate() {
        let semaphore = semaphore.clone();
        let provider = opts.provider.clone();
        let fallback_provider = opts.fallback_provider.clone();
        let signal = opts.signal.clone();
        let thresholds = config.thresholds;
        let prompt = build_prompt(&segments, window, &opts.target_language);
        let target_start = window.target_start;
        let target_end = window.target_end;
        let indices: Vec<usize> = (target_start..target_end).map(|i| segments[i].index).collect();

        futures_unordered.push(async move {
            let _permit = semaphore.acquire().await.expect("semaphore closed");
            let req = CompleteRequest {
                system_prompt: None,
                user_prompt: prompt,
                model_tier: ModelTier::Fast,
                temperature: Some(0.2),
                idempotency_key: None,
            };
            let result = with_fallback(
                &thresholds,
                &signal,
                complete_attempt(provider, req.clone(), signal.clone()),
                fallback_provider.map(|fb| complete_attempt(fb, req, signal.clone())),
            )
            .await;
            (idx, indices, result)
        });
    }

    let mut done = 0usize;
    while let Some((_idx, indices, result)) = futures_unordered.next().await {
        done += 1;
        match result {
            Ok(response) => {
                let parsed = parse_translated_lines(&response);
                for seg_index in indices {
                    if let Some(seg) = segments.iter_mut().find(|s| s.index == seg_index) {
                        match parsed.get(&seg_index) {
                            Some(text) if !text.is_empty() => seg.translated_text = Some(text.clone()),
                            _ => {
                                warn!(seg_index, "missing translation line, keeping original text");
                                seg.translated_text =
                                    Some(format!("{}{}", seg.original_text, TRANSLATION_MARKER));
                            }
                        }
                    }
                }
            }
            Err(e) => {
                warn!(error = %e, "translation batch failed after retries, keeping original text");
                for seg_index in indices {
                    if let Some(seg) = segments.iter_mut().find(|s| s.index == seg_index) {
                        seg.translated_text = Some(seg.original_text.clone());
                    }
                }
            }
        }
        report_progress(opts, done, total, bands::TRANSLATE, Stage::Translate);
    }

    Ok(segments)
}

async fn review_windows_pass(
    mut segments: Vec<Segment>,
    windows: &[Window],
    config: &Config,
    opts: &TranslateOptions,
) -> Result<Vec<Segment>> {
    let total = windows.len();
    for (done, window) in windows.iter().enumerate() {
        if opts.signal.is_cancelled() {
            break;
        }
        let prompt = build_review_prompt(&segments, window, &opts.target_language);
        let indices: Vec<usize> = (window.target_start..window.target_end)
            .map(|i| segments[i].index)
            .collect();

        let req = CompleteRequest {
            system_prompt: Some(
                "You are reviewing machine translations for fluency and accuracy. \
                 Return corrected lines in the same `Line N: <text>` format."
                    .to_string(),
            ),
            user_prompt: prompt,
            model_tier: ModelTier::Quality,
            temperature: Some(0.1),
            idempotency_key: None,
        };
        let result = with_fallback(
            &config.thresholds,
            &opts.signal,
            complete_attempt(opts.provider.clone(), req.clone(), opts.signal.clone()),
            opts.fallback_provider
                .clone()
                .map(|fb| complete_attempt(fb, req, opts.signal.clone())),
        )
        .await;

        match result {
            Ok(response) => {
                let parsed = parse_translated_lines(&response);
                for seg_index in indices {
                    if let Some(text) = parsed.get(&seg_index) {
                        if let Some(seg) = segments.iter_mut().find(|s| s.index == seg_index) {
                            seg.translated_text = Some(text.clone());
                        }
                    }
                }
            }
            Err(e) => {
                warn!(error = %e, "review pass failed for window, keeping prior translation");
            }
        }
        report_progress(opts, done + 1, total, bands::REVIEW, Stage::Review);
    }
    Ok(segments)
}

fn build_review_prompt(segments: &[Segment], window: &Window, target_language: &str) -> String {
    let mut prompt = format!(
        "The target language is {target_language}. Review and, if needed, correct the following \
         translated lines. Context lines are given for continuity only.\n\n"
    );
    for i in window.ctx_start..window.target_start {
        prompt.push_str(&format!(
            "Context Line {}: {}\n",
            segments[i].index,
            segments[i].translated_text.as_deref().unwrap_or(&segments[i].original_text)
        ));
    }
    for i in window.target_start..window.target_end {
        prompt.push_str(&format!(
            "Line {}: {}\n",
            segments[i].index,
            segments[i].translated_text.as_deref().unwrap_or(&segments[i].original_text)
        ));
    }
    for i in window.target_end..window.ctx_end {
        prompt.push_str(&format!(
            "Context Line {}: {}\n",
            segments[i].index,
            segments[i].translated_text.as_deref().unwrap_or(&segments[i].original_text)
        ));
    }
    prompt
}

fn report_progress(opts: &TranslateOptions, done: usize, total: usize, band: (f64, f64), stage: Stage) {
    let local = if total == 0 { 100.0 } else { (done as f64 / total as f64) * 100.0 };
    opts.sink.publish(
        ProgressEvent::new(opts.op_id.clone(), scale(local, band), stage).with_progress(done as u64, total as u64),
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_windows_splits_into_fixed_size_batches_with_context() {
        let windows = build_windows(25, 10, 3, 3);
        assert_eq!(windows.len(), 3);
        assert_eq!(windows[0].target_start, 0);
        assert_eq!(windows[0].target_end, 10);
        assert_eq!(windows[1].ctx_start, 7);
        assert_eq!(windows[2].target_end, 25);
        assert_eq!(windows[2].ctx_end, 25);
    }

    #[test]
    fn build_windows_handles_fewer_items_than_one_batch() {
        let windows = build_windows(4, 10, 3, 3);
        assert_eq!(windows.len(), 1);
        assert_eq!(windows[0].target_start, 0);
        assert_eq!(windows[0].target_end, 4);
    }

    #[test]
    fn parse_translated_lines_extracts_numbered_lines() {
        let response = "Line 1: bonjour\nLine 2: au revoir\nnoise\n";
        let parsed = parse_translated_lines(response);
        assert_eq!(parsed.get(&1).unwrap(), "bonjour");
        assert_eq!(parsed.get(&2).unwrap(), "au revoir");
        assert_eq!(parsed.len(), 2);
    }

    #[test]
    fn parse_translated_lines_tolerates_missing_and_out_of_order_lines() {
        let response = "Line 3: third\nLine 1: first\n";
        let parsed = parse_translated_lines(response);
        assert_eq!(parsed.len(), 2);
        assert!(!parsed.contains_key(&2));
    }

    #[test]
    fn build_prompt_includes_context_and_target_lines() {
        let segments = vec![
            Segment::new(1, 0.0, 1.0, "first"),
            Segment::new(2, 1.0, 2.0, "second"),
            Segment::new(3, 2.0, 3.0, "third"),
        ];
        let window = Window {
            target_start: 1,
            target_end: 2,
            ctx_start: 0,
            ctx_end: 3,
        };
        let prompt = build_prompt(&segments, &window, "French");
        assert!(prompt.contains("Context Line 1: first"));
        assert!(prompt.contains("Line 2: second"));
        assert!(prompt.contains("Context Line 3: third"));
    }
}
