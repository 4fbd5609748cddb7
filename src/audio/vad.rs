//! Voice-activity detection and chunk planning. Detection is delegated to
//! ffmpeg's `silencedetect` filter rather than an in-process energy
//! threshold, so behavior tracks whatever ffmpeg build the host has.

use crate::audio::{round3, Chunk, SpeechInterval};
use crate::error::Result;
use crate::ffmpeg::FfmpegRunner;
use regex::Regex;
use std::path::Path;

#[derive(Debug, Clone, Copy)]
pub struct VadConfig {
    pub noise_db: f64,
    pub min_silence_duration_sec: f64,
    pub merge_gap_sec: f64,
    pub max_speechless_sec: f64,
    pub pre_pad_sec: f64,
    pub post_pad_sec: f64,
    pub max_chunk_duration_sec: f64,
    pub min_chunk_duration_sec: f64,
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            noise_db: -50.0,
            min_silence_duration_sec: 0.5,
            merge_gap_sec: 0.6,
            max_speechless_sec: 30.0,
            pre_pad_sec: 0.25,
            post_pad_sec: 0.5,
            max_chunk_duration_sec: 60.0,
            min_chunk_duration_sec: 2.0,
        }
    }
}

impl VadConfig {
    pub fn from_thresholds(t: &crate::config::Thresholds) -> Self {
        Self {
            merge_gap_sec: t.merge_gap_sec,
            max_speechless_sec: t.max_speechless_sec,
            pre_pad_sec: t.pre_pad_sec,
            post_pad_sec: t.post_pad_sec,
            max_chunk_duration_sec: t.max_chunk_duration_sec,
            min_chunk_duration_sec: t.min_chunk_duration_sec,
            ..Self::default()
        }
    }
}

/// Runs detection, normalization, merge, split, pad and grouping; returns
/// the final chunk list. Zero detected speech returns an empty vec.
pub async fn detect_chunks(
    runner: &FfmpegRunner,
    audio_path: &Path,
    duration_sec: f64,
    config: &VadConfig,
) -> Result<Vec<Chunk>> {
    let (_, chunks) = detect_speech_and_chunks(runner, audio_path, duration_sec, config).await?;
    Ok(chunks)
}

/// Same pipeline as [`detect_chunks`], but also returns the normalized,
/// merged, split speech intervals (absolute file-time, pre-padding) that
/// the chunk grouping was built from - the hallucination filter needs
/// these to judge whether a transcribed segment actually overlaps
/// detected speech.
pub async fn detect_speech_and_chunks(
    runner: &FfmpegRunner,
    audio_path: &Path,
    duration_sec: f64,
    config: &VadConfig,
) -> Result<(Vec<SpeechInterval>, Vec<Chunk>)> {
    let stderr = runner
        .detect_silence(audio_path, config.noise_db, config.min_silence_duration_sec)
        .await?;
    let silences = parse_silences(&stderr);
    let speech = invert_silences(&silences, duration_sec);
    let speech = normalize(speech, duration_sec);
    let speech = merge_close(speech, config.merge_gap_sec);
    let speech = split_long(speech, config.max_speechless_sec);
    let chunks = pad_and_group(&speech, duration_sec, config);
    Ok((speech, chunks))
}

#[derive(Debug, Clone, Copy)]
struct SilenceSpan {
    start: f64,
    end: f64,
}

fn parse_silences(stderr: &str) -> Vec<SilenceSpan> {
    let start_re = Regex::new(r"silence_start:\s*(-?[0-9.]+)").unwrap();
    let end_re = Regex::new(r"silence_end:\s*(-?[0-9.]+)").unwrap();

    let mut starts: Vec<f64> = start_re
        .captures_iter(stderr)
        .filter_map(|c| c[1].parse::<f64>().ok())
        .collect();
    let ends: Vec<f64> = end_re
        .captures_iter(stderr)
        .filter_map(|c| c[1].parse::<f64>().ok())
        .collect();

    // ffmpeg may report a trailing silence_start with no matching
    // silence_end when the file ends in silence; that span is closed at
    // `invert_silences` time via the overall duration bound.
    let mut spans = Vec::new();
    let mut end_iter = ends.into_iter();
    starts.sort_by(|a, b| a.partial_cmp(b).unwrap());
    for start in starts.drain(..) {
        if let Some(end) = end_iter.next() {
            spans.push(SilenceSpan { start, end });
        } else {
            spans.push(SilenceSpan {
                start,
                end: f64::INFINITY,
            });
        }
    }
    spans
}

/// Speech is whatever isn't silence, within `[0, duration]`.
fn invert_silences(silences: &[SilenceSpan], duration_sec: f64) -> Vec<SpeechInterval> {
    let mut sorted = silences.to_vec();
    sorted.sort_by(|a, b| a.start.partial_cmp(&b.start).unwrap());

    let mut speech = Vec::new();
    let mut cursor = 0.0;
    for silence in &sorted {
        let silence_start = silence.start.max(0.0);
        if silence_start > cursor {
            speech.push(SpeechInterval::new(cursor, silence_start));
        }
        cursor = cursor.max(silence.end.min(duration_sec));
    }
    if cursor < duration_sec {
        speech.push(SpeechInterval::new(cursor, duration_sec));
    }
    speech
}

fn normalize(intervals: Vec<SpeechInterval>, duration_sec: f64) -> Vec<SpeechInterval> {
    let mut out: Vec<SpeechInterval> = intervals
        .into_iter()
        .map(|i| SpeechInterval::new(i.start_sec.max(0.0), i.end_sec.min(duration_sec)))
        .filter(|i| i.is_valid())
        .collect();
    out.sort_by(|a, b| a.start_sec.partial_cmp(&b.start_sec).unwrap());
    out
}

fn merge_close(intervals: Vec<SpeechInterval>, merge_gap_sec: f64) -> Vec<SpeechInterval> {
    let mut out: Vec<SpeechInterval> = Vec::with_capacity(intervals.len());
    for interval in intervals {
        if let Some(last) = out.last_mut() {
            if interval.start_sec - last.end_sec <= merge_gap_sec {
                last.end_sec = last.end_sec.max(interval.end_sec);
                continue;
            }
        }
        out.push(interval);
    }
    out
}

fn split_long(intervals: Vec<SpeechInterval>, max_speechless_sec: f64) -> Vec<SpeechInterval> {
    let mut out = Vec::new();
    for interval in intervals {
        let total = interval.duration();
        if total <= max_speechless_sec {
            out.push(interval);
            continue;
        }
        let pieces = (total / max_speechless_sec).ceil() as usize;
        let piece_len = total / pieces as f64;
        for i in 0..pieces {
            let start = interval.start_sec + piece_len * i as f64;
            let end = if i == pieces - 1 {
                interval.end_sec
            } else {
                interval.start_sec + piece_len * (i + 1) as f64
            };
            out.push(SpeechInterval::new(start, end));
        }
    }
    out
}

fn pad_and_group(intervals: &[SpeechInterval], duration_sec: f64, config: &VadConfig) -> Vec<Chunk> {
    let mut chunks = Vec::new();
    let mut index = 1usize;
    let mut current_start: Option<f64> = None;
    let mut current_end: Option<f64> = None;

    for interval in intervals {
        let padded_start = round3((interval.start_sec - config.pre_pad_sec).max(0.0));
        let padded_end = round3((interval.end_sec + config.post_pad_sec).min(duration_sec));

        match (current_start, current_end) {
            (Some(cs), Some(ce)) => {
                let candidate_end = padded_end.max(ce);
                if candidate_end - cs >= config.max_chunk_duration_sec {
                    chunks.push(Chunk {
                        index,
                        start_sec: cs,
                        end_sec: ce,
                    });
                    index += 1;
                    current_start = Some(padded_start);
                    current_end = Some(padded_end);
                } else {
                    current_end = Some(candidate_end);
                }
            }
            _ => {
                current_start = Some(padded_start);
                current_end = Some(padded_end);
            }
        }
    }

    if let (Some(cs), Some(ce)) = (current_start, current_end) {
        if ce > cs {
            chunks.push(Chunk {
                index,
                start_sec: cs,
                end_sec: ce,
            });
        }
    }

    chunks
}

#[cfg(test)]
mod tests {
    use super::*;

    fn span(s: f64, e: f64) -> SilenceSpan {
        SilenceSpan { start: s, end: e }
    }

    #[test]
    fn parse_silences_extracts_start_end_pairs() {
        let stderr = "[silencedetect @ 0x0] silence_start: 1.5\n[silencedetect @ 0x0] silence_end: 3.2 | silence_duration: 1.7\n";
        let spans = parse_silences(stderr);
        assert_eq!(spans.len(), 1);
        assert_eq!(spans[0].start, 1.5);
        assert_eq!(spans[0].end, 3.2);
    }

    #[test]
    fn invert_silences_produces_speech_gaps() {
        let silences = vec![span(2.0, 4.0)];
        let speech = invert_silences(&silences, 10.0);
        assert_eq!(speech.len(), 2);
        assert_eq!(speech[0], SpeechInterval::new(0.0, 2.0));
        assert_eq!(speech[1], SpeechInterval::new(4.0, 10.0));
    }

    #[test]
    fn no_silence_means_all_speech() {
        let speech = invert_silences(&[], 30.0);
        assert_eq!(speech, vec![SpeechInterval::new(0.0, 30.0)]);
    }

    #[test]
    fn all_silence_means_no_speech() {
        let speech = invert_silences(&[span(0.0, 30.0)], 30.0);
        assert!(speech.is_empty());
    }

    #[test]
    fn merge_close_combines_intervals_within_gap() {
        let intervals = vec![
            SpeechInterval::new(0.0, 2.0),
            SpeechInterval::new(2.5, 4.0),
        ];
        let merged = merge_close(intervals, 0.6);
        assert_eq!(merged, vec![SpeechInterval::new(0.0, 4.0)]);
    }

    #[test]
    fn merge_close_keeps_distant_intervals_separate() {
        let intervals = vec![
            SpeechInterval::new(0.0, 2.0),
            SpeechInterval::new(5.0, 7.0),
        ];
        let merged = merge_close(intervals, 0.6);
        assert_eq!(merged.len(), 2);
    }

    #[test]
    fn split_long_cuts_into_equal_pieces() {
        let intervals = vec![SpeechInterval::new(0.0, 70.0)];
        let split = split_long(intervals, 30.0);
        assert_eq!(split.len(), 3);
        for piece in &split {
            assert!(piece.duration() <= 30.0 + 1e-6);
        }
        assert_eq!(split.last().unwrap().end_sec, 70.0);
    }

    #[test]
    fn pad_and_group_closes_chunk_at_max_duration() {
        let intervals = vec![
            SpeechInterval::new(1.0, 3.0),
            SpeechInterval::new(3.5, 5.0),
        ];
        let config = VadConfig {
            pre_pad_sec: 0.25,
            post_pad_sec: 0.5,
            max_chunk_duration_sec: 60.0,
            ..VadConfig::default()
        };
        let chunks = pad_and_group(&intervals, 10.0, &config);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].start_sec, 0.75);
        assert_eq!(chunks[0].end_sec, 5.5);
    }

    #[test]
    fn pad_and_group_produces_empty_on_empty_input() {
        let chunks = pad_and_group(&[], 30.0, &VadConfig::default());
        assert!(chunks.is_empty());
    }

    #[test]
    fn pad_and_group_indices_are_dense_and_one_based() {
        let intervals = vec![
            SpeechInterval::new(0.0, 1.0),
            SpeechInterval::new(65.0, 66.0),
        ];
        let config = VadConfig {
            merge_gap_sec: 0.1,
            ..VadConfig::default()
        };
        let chunks = pad_and_group(&intervals, 100.0, &config);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].index, 1);
        assert_eq!(chunks[1].index, 2);
    }
}
