//! Enforces the final segment invariants (duration, gap, reading-speed
//! bounds) in a deterministic, order-preserving way, then serializes to and
//! parses from SRT. Grounded on the teacher's `subtitle::postprocess`
//! merge/gap-fix passes, generalized into the fixed-point pass pipeline and
//! extended with a script-aware CPS ceiling and a paired parser.

pub mod srt;

use crate::config::Thresholds;
use crate::segment::{sort_and_reindex, Segment};

pub use srt::{parse_srt, serialize_srt};

pub fn finalize(mut segments: Vec<Segment>, thresholds: &Thresholds) -> Vec<Segment> {
    if segments.is_empty() {
        return segments;
    }

    segments = dedup_and_repair_gaps(segments);

    for _ in 0..thresholds.finalize_iteration_cap {
        let before = fingerprint(&segments);
        segments = tiny_tail_merge(segments, thresholds);
        segments = dense_short_merge(segments, thresholds);
        segments = duration_floor(segments, thresholds);
        segments = cps_ceiling(segments, thresholds);
        if fingerprint(&segments) == before {
            break;
        }
    }

    segments = gap_floor(segments, thresholds);
    sort_and_reindex(segments)
}

fn fingerprint(segments: &[Segment]) -> Vec<(usize, u64, u64, usize)> {
    segments
        .iter()
        .map(|s| (s.index, s.start_sec.to_bits(), s.end_sec.to_bits(), s.original_text.len()))
        .collect()
}

/// Pass 1: trims duplicated leading tokens that repeat the prior segment's
/// trailing tokens, and blanks near-duplicate segments outright.
fn dedup_and_repair_gaps(mut segments: Vec<Segment>) -> Vec<Segment> {
    for i in 1..segments.len() {
        let (left, right) = segments.split_at_mut(i);
        let prev = left.last().unwrap();
        let cur = &mut right[0];

        if jaccard_similarity(&prev.original_text, &cur.original_text) >= 0.9 {
            cur.original_text.clear();
            continue;
        }

        let overlap = suffix_prefix_overlap(&prev.original_text, &cur.original_text);
        if overlap > 0 {
            let cur_tokens: Vec<&str> = cur.original_text.split_whitespace().collect();
            if overlap >= 2 || (overlap >= 1 && cur_tokens.len() <= 2) {
                cur.original_text = cur_tokens[overlap..].join(" ");
            }
        }
    }
    segments.retain(|s| !s.original_text.trim().is_empty());
    segments
}

fn tokenize(s: &str) -> Vec<String> {
    s.split_whitespace().map(|t| t.to_lowercase()).collect()
}

fn jaccard_similarity(a: &str, b: &str) -> f64 {
    use std::collections::HashSet;
    let a: HashSet<String> = tokenize(a).into_iter().collect();
    let b: HashSet<String> = tokenize(b).into_iter().collect();
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    let intersection = a.intersection(&b).count() as f64;
    let union = a.union(&b).count() as f64;
    if union == 0.0 {
        0.0
    } else {
        intersection / union
    }
}

/// Longest suffix of `prev` that equals a prefix of `cur`, in tokens.
fn suffix_prefix_overlap(prev: &str, cur: &str) -> usize {
    let prev_tokens = tokenize(prev);
    let cur_tokens = tokenize(cur);
    let max_len = prev_tokens.len().min(cur_tokens.len());
    for len in (1..=max_len).rev() {
        if prev_tokens[prev_tokens.len() - len..] == cur_tokens[..len] {
            return len;
        }
    }
    0
}

/// Pass 2: folds very short trailing fragments into the previous segment
/// when they're close enough in time and the previous isn't already a
/// complete sentence.
fn tiny_tail_merge(mut segments: Vec<Segment>, thresholds: &Thresholds) -> Vec<Segment> {
    let mut i = 1;
    while i < segments.len() {
        let word_count = segments[i].original_text.split_whitespace().count();
        let gap = segments[i].start_sec - segments[i - 1].end_sec;
        let prev_ends_terminal = ends_with_terminal_punctuation(&segments[i - 1].original_text);

        if word_count <= 2 && gap <= 1.0 && !prev_ends_terminal {
            merge_into_previous(&mut segments, i, thresholds);
        } else {
            i += 1;
        }
    }
    segments
}

/// Pass 3: folds segments that are both short and read too fast into the
/// previous one, under the same time-proximity condition as pass 2.
fn dense_short_merge(mut segments: Vec<Segment>, thresholds: &Thresholds) -> Vec<Segment> {
    let mut i = 1;
    while i < segments.len() {
        let duration = segments[i].duration();
        let cps = if duration > 0.0 {
            segments[i].original_text.chars().count() as f64 / duration
        } else {
            f64::INFINITY
        };
        let gap = segments[i].start_sec - segments[i - 1].end_sec;

        if duration < 0.8 && cps > 17.0 && gap <= 1.0 {
            merge_into_previous(&mut segments, i, thresholds);
        } else {
            i += 1;
        }
    }
    segments
}

fn merge_into_previous(segments: &mut Vec<Segment>, i: usize, _thresholds: &Thresholds) {
    let removed = segments.remove(i);
    let prev = &mut segments[i - 1];
    prev.original_text = format!("{} {}", prev.original_text, removed.original_text);
    prev.end_sec = removed.end_sec.max(prev.end_sec);
}

fn ends_with_terminal_punctuation(text: &str) -> bool {
    matches!(text.trim_end().chars().last(), Some('.') | Some('!') | Some('?') | Some('…'))
}

/// Pass 4: grows segments under `MIN_DUR` by borrowing first from the gap
/// to the next segment, then from the gap to the previous, never crossing
/// `MAX_DUR`.
fn duration_floor(mut segments: Vec<Segment>, thresholds: &Thresholds) -> Vec<Segment> {
    let len = segments.len();
    for i in 0..len {
        let deficit = thresholds.min_dur_sec - segments[i].duration();
        if deficit <= 0.0 {
            continue;
        }

        let mut remaining = deficit;
        if i + 1 < len {
            let available = (segments[i + 1].start_sec - segments[i].end_sec - thresholds.min_gap_sec).max(0.0);
            let borrow = available.min(remaining);
            segments[i].end_sec += borrow;
            remaining -= borrow;
        }
        if remaining > 0.0 && i > 0 {
            let available = (segments[i].start_sec - segments[i - 1].end_sec - thresholds.min_gap_sec).max(0.0);
            let borrow = available.min(remaining);
            segments[i].start_sec -= borrow;
        }

        let cap = thresholds.max_dur_sec;
        if segments[i].duration() > cap {
            segments[i].end_sec = segments[i].start_sec + cap;
        }
    }
    segments
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Script {
    Latin,
    Cjk,
    Thai,
}

fn dominant_script(text: &str) -> Script {
    let mut cjk = 0usize;
    let mut thai = 0usize;
    let mut other = 0usize;
    for c in text.chars() {
        let code = c as u32;
        let is_cjk = (0x4E00..=0x9FFF).contains(&code)
            || (0x3040..=0x30FF).contains(&code)
            || (0xAC00..=0xD7A3).contains(&code);
        let is_thai = (0x0E00..=0x0E7F).contains(&code) || (0x0E80..=0x0EFF).contains(&code) || (0x1780..=0x17FF).contains(&code);
        if is_cjk {
            cjk += 1;
        } else if is_thai {
            thai += 1;
        } else if c.is_alphabetic() {
            other += 1;
        }
    }
    if cjk >= thai && cjk >= other && cjk > 0 {
        Script::Cjk
    } else if thai >= other && thai > 0 {
        Script::Thai
    } else {
        Script::Latin
    }
}

fn cps_cap_for(text: &str, thresholds: &Thresholds) -> f64 {
    match dominant_script(text) {
        Script::Latin => thresholds.cps_latin,
        Script::Cjk => thresholds.cps_cjk,
        Script::Thai => thresholds.cps_thai,
    }
}

/// Pass 5: caps reading speed per script class, escalating from
/// time-borrowing to neighbor-merge to a midpoint split.
fn cps_ceiling(mut segments: Vec<Segment>, thresholds: &Thresholds) -> Vec<Segment> {
    let mut i = 0;
    while i < segments.len() {
        let cap = cps_cap_for(&segments[i].original_text, thresholds);
        let len = segments[i].original_text.chars().count() as f64;
        let cps = if segments[i].duration() > 0.0 {
            len / segments[i].duration()
        } else {
            f64::INFINITY
        };
        if cps <= cap {
            i += 1;
            continue;
        }

        // Try borrowing time first, same mechanism as the duration floor.
        let needed_duration = len / cap;
        let deficit = needed_duration - segments[i].duration();
        if deficit > 0.0 {
            let mut remaining = deficit;
            if i + 1 < segments.len() {
                let available =
                    (segments[i + 1].start_sec - segments[i].end_sec - thresholds.min_gap_sec).max(0.0);
                let borrow = available.min(remaining);
                segments[i].end_sec += borrow;
                remaining -= borrow;
            }
            if remaining > 0.0 && i > 0 {
                let available =
                    (segments[i].start_sec - segments[i - 1].end_sec - thresholds.min_gap_sec).max(0.0);
                let borrow = available.min(remaining);
                segments[i].start_sec -= borrow;
            }
        }

        let still_over = {
            let len = segments[i].original_text.chars().count() as f64;
            let cps = if segments[i].duration() > 0.0 {
                len / segments[i].duration()
            } else {
                f64::INFINITY
            };
            cps > cap
        };

        if !still_over {
            i += 1;
            continue;
        }

        if try_merge_lower_cps(&mut segments, i, thresholds) {
            continue;
        }

        if split_segment(&mut segments, i, thresholds) {
            i += 2;
        } else {
            i += 1;
        }
    }
    segments
}

fn segment_cps(text: &str, duration: f64) -> f64 {
    if duration > 0.0 {
        text.chars().count() as f64 / duration
    } else {
        f64::INFINITY
    }
}

fn try_merge_lower_cps(segments: &mut Vec<Segment>, i: usize, thresholds: &Thresholds) -> bool {
    let current_cps = segment_cps(&segments[i].original_text, segments[i].duration());

    let prev_cps = if i > 0 {
        let merged_text = format!("{} {}", segments[i - 1].original_text, segments[i].original_text);
        let merged_duration = segments[i].end_sec - segments[i - 1].start_sec;
        Some(segment_cps(&merged_text, merged_duration))
    } else {
        None
    };
    let next_cps = if i + 1 < segments.len() {
        let merged_text = format!("{} {}", segments[i].original_text, segments[i + 1].original_text);
        let merged_duration = segments[i + 1].end_sec - segments[i].start_sec;
        Some(segment_cps(&merged_text, merged_duration))
    } else {
        None
    };

    let best = match (prev_cps, next_cps) {
        (Some(p), Some(n)) if p <= n && p < current_cps => Some(false),
        (Some(p), Some(n)) if n < p && n < current_cps => Some(true),
        (Some(p), None) if p < current_cps => Some(false),
        (None, Some(n)) if n < current_cps => Some(true),
        _ => None,
    };

    let _ = thresholds;
    match best {
        Some(true) => {
            merge_into_previous(segments, i + 1, thresholds);
            true
        }
        Some(false) => {
            merge_into_previous(segments, i, thresholds);
            true
        }
        None => false,
    }
}

/// Splits a segment at the nearest punctuation or whitespace to its
/// midpoint, apportioning duration by character share of the two halves.
fn split_segment(segments: &mut Vec<Segment>, i: usize, thresholds: &Thresholds) -> bool {
    let text = segments[i].original_text.clone();
    let chars: Vec<char> = text.chars().collect();
    if chars.len() < 4 {
        return false;
    }
    let midpoint = chars.len() / 2;

    let split_at = find_split_point(&chars, midpoint);
    let split_at = match split_at {
        Some(p) if p > 0 && p < chars.len() => p,
        _ => return false,
    };

    let left: String = chars[..split_at].iter().collect::<String>().trim().to_string();
    let right: String = chars[split_at..].iter().collect::<String>().trim().to_string();
    if left.is_empty() || right.is_empty() {
        return false;
    }

    let total_chars = (left.chars().count() + right.chars().count()).max(1) as f64;
    let left_share = left.chars().count() as f64 / total_chars;

    let start = segments[i].start_sec;
    let end = segments[i].end_sec;
    let span = end - start;
    let mut split_time = start + span * left_share;

    if split_time - start < thresholds.min_gap_sec {
        split_time = start + thresholds.min_gap_sec;
    }
    if end - split_time < thresholds.min_gap_sec {
        split_time = end - thresholds.min_gap_sec;
    }
    if split_time <= start || split_time >= end {
        return false;
    }

    let index = segments[i].index;
    let mut right_seg = Segment::new(index, split_time, end, right);
    right_seg.no_speech_prob = segments[i].no_speech_prob;
    right_seg.avg_logprob = segments[i].avg_logprob;

    segments[i].original_text = left;
    segments[i].end_sec = split_time;

    segments.insert(i + 1, right_seg);
    true
}

fn find_split_point(chars: &[char], midpoint: usize) -> Option<usize> {
    let is_boundary = |c: char| c.is_whitespace() || matches!(c, '.' | ',' | '!' | '?' | ';' | ':' | '…');
    let max_radius = chars.len();
    for radius in 0..max_radius {
        if midpoint + radius < chars.len() && is_boundary(chars[midpoint + radius]) {
            return Some(midpoint + radius + 1);
        }
        if midpoint >= radius && is_boundary(chars[midpoint - radius]) {
            return Some(midpoint - radius + 1);
        }
    }
    Some(midpoint)
}

/// Pass 6: enforces the minimum gap between consecutive segments, nudging
/// the later one forward and stretching it if needed to stay above the
/// minimum length.
fn gap_floor(mut segments: Vec<Segment>, thresholds: &Thresholds) -> Vec<Segment> {
    for i in 1..segments.len() {
        let min_start = segments[i - 1].end_sec + thresholds.min_gap_sec;
        if segments[i].start_sec < min_start {
            let original_duration = segments[i].duration();
            segments[i].start_sec = min_start;
            if segments[i].duration() < 0.3 {
                segments[i].end_sec = (segments[i].start_sec + original_duration.max(0.3)).max(segments[i].end_sec);
            }
        }
    }
    segments
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seg(index: usize, start: f64, end: f64, text: &str) -> Segment {
        Segment::new(index, start, end, text)
    }

    #[test]
    fn dedup_trims_repeated_leading_tokens() {
        let segments = vec![
            seg(1, 0.0, 1.0, "hello there friend"),
            seg(2, 1.0, 2.0, "there friend how are you"),
        ];
        let out = dedup_and_repair_gaps(segments);
        assert_eq!(out[1].original_text, "how are you");
    }

    #[test]
    fn dedup_blanks_near_duplicate_segments() {
        let segments = vec![seg(1, 0.0, 1.0, "hello world"), seg(2, 1.0, 2.0, "hello world")];
        let out = dedup_and_repair_gaps(segments);
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn tiny_tail_merge_folds_short_close_fragment() {
        let thresholds = Thresholds::default();
        let segments = vec![seg(1, 0.0, 1.0, "hello there"), seg(2, 1.2, 1.5, "ok")];
        let out = tiny_tail_merge(segments, &thresholds);
        assert_eq!(out.len(), 1);
        assert!(out[0].original_text.contains("ok"));
    }

    #[test]
    fn tiny_tail_merge_preserves_after_terminal_punctuation() {
        let thresholds = Thresholds::default();
        let segments = vec![seg(1, 0.0, 1.0, "hello there."), seg(2, 1.2, 1.5, "ok")];
        let out = tiny_tail_merge(segments, &thresholds);
        assert_eq!(out.len(), 2);
    }

    #[test]
    fn duration_floor_borrows_from_next_gap() {
        let thresholds = Thresholds::default();
        let segments = vec![seg(1, 0.0, 0.3, "hi"), seg(2, 3.0, 4.0, "next")];
        let out = duration_floor(segments, &thresholds);
        assert!(out[0].duration() >= thresholds.min_dur_sec - 1e-6);
    }

    #[test]
    fn gap_floor_pushes_overlapping_next_segment_forward() {
        let thresholds = Thresholds::default();
        let segments = vec![seg(1, 0.0, 1.0, "a"), seg(2, 1.05, 2.0, "b")];
        let out = gap_floor(segments, &thresholds);
        assert!(out[1].start_sec >= out[0].end_sec + thresholds.min_gap_sec - 1e-9);
    }

    #[test]
    fn dominant_script_detects_cjk() {
        assert_eq!(dominant_script("你好世界"), Script::Cjk);
        assert_eq!(dominant_script("hello world"), Script::Latin);
    }

    #[test]
    fn cps_ceiling_splits_overlong_fast_segment() {
        let thresholds = Thresholds::default();
        let long_text = "word ".repeat(40);
        let segments = vec![seg(1, 0.0, 1.0, long_text.trim())];
        let out = cps_ceiling(segments, &thresholds);
        assert!(out.len() >= 1);
        for s in &out {
            let cps = s.original_text.chars().count() as f64 / s.duration().max(0.001);
            assert!(cps <= thresholds.cps_latin + 5.0);
        }
    }

    #[test]
    fn finalize_is_idempotent_on_already_clean_input() {
        let thresholds = Thresholds::default();
        let segments = vec![seg(1, 0.0, 2.0, "a clean sentence"), seg(2, 2.5, 4.5, "another clean one")];
        let once = finalize(segments.clone(), &thresholds);
        let twice = finalize(once.clone(), &thresholds);
        assert_eq!(once.len(), twice.len());
        for (a, b) in once.iter().zip(twice.iter()) {
            assert_eq!(a.original_text, b.original_text);
        }
    }
}
