//! Shared cue-event derivation used by both render modes: appearance and
//! disappearance events sorted, deduped, clamped to the video duration, and
//! overlap-resolved per the rules in the component design.

use crate::segment::Segment;

#[derive(Debug, Clone, PartialEq)]
pub struct CueEvent {
    pub time_ms: u64,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RenderState {
    pub text: String,
    pub duration_sec: f64,
}

pub fn derive_cue_events(segments: &[Segment], duration_sec: f64) -> Vec<CueEvent> {
    let duration_ms = (duration_sec.max(0.0) * 1000.0) as u64;

    let mut cues: Vec<(u64, u64, String)> = segments
        .iter()
        .map(|s| {
            let start_ms = (s.start_sec.max(0.0) * 1000.0) as u64;
            let end_ms = ((s.end_sec.max(0.0) * 1000.0) as u64).min(duration_ms).max(start_ms);
            (start_ms, end_ms, s.original_text.clone())
        })
        .collect();

    cues.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.2.cmp(&b.2)));
    cues.dedup_by(|a, b| a.0 == b.0 && a.2 == b.2);

    let mut resolved: Vec<(u64, u64, String)> = Vec::new();
    for (start, end, text) in cues {
        if let Some(last) = resolved.last_mut() {
            if start < last.1 {
                if last.2 == text {
                    last.1 = last.1.max(end);
                    continue;
                } else {
                    let new_start = last.1;
                    if new_start >= end {
                        continue;
                    }
                    resolved.push((new_start, end, text));
                    continue;
                }
            }
        }
        resolved.push((start, end, text));
    }

    let mut events = Vec::new();
    for (start, end, text) in resolved {
        events.push(CueEvent { time_ms: start, text: text.clone() });
        events.push(CueEvent { time_ms: end, text: String::new() });
    }
    events.sort_by(|a, b| a.time_ms.cmp(&b.time_ms));
    events.dedup_by(|a, b| a.time_ms == b.time_ms && a.text == b.text);
    events
}

/// Converts a sorted event list into a sequence of display states, each
/// with a microsecond-precision duration. No frame rounding: rounding here
/// would accumulate drift over long inputs.
pub fn derive_states(events: &[CueEvent], duration_sec: f64) -> Vec<RenderState> {
    let mut states = Vec::new();
    let end_time_us = (duration_sec.max(0.0) * 1_000_000.0).round() as i64;

    for window in events.windows(2) {
        let start_us = (window[0].time_ms as i64) * 1000;
        let end_us = (window[1].time_ms as i64) * 1000;
        let duration_us = (end_us - start_us).max(0);
        if duration_us == 0 {
            continue;
        }
        states.push(RenderState {
            text: window[0].text.clone(),
            duration_sec: duration_us as f64 / 1_000_000.0,
        });
    }

    if let Some(last) = events.last() {
        let last_us = (last.time_ms as i64) * 1000;
        if end_time_us > last_us {
            states.push(RenderState {
                text: last.text.clone(),
                duration_sec: (end_time_us - last_us) as f64 / 1_000_000.0,
            });
        }
    }

    states
}
