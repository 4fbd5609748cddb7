//! SRT serialization, grounded on the teacher's `subtitle::srt` writer, plus
//! a tolerant parser added because the overlay renderer and the
//! round-trip-idempotency tests both need to read SRT back into segments
//! (something the teacher's subtitle module never did).

use crate::config::OutputMode;
use crate::segment::Segment;

pub fn serialize_srt(segments: &[Segment], mode: OutputMode) -> String {
    let mut out = String::new();
    for (i, seg) in segments.iter().enumerate() {
        if i > 0 {
            out.push('\n');
        }
        out.push_str(&(i + 1).to_string());
        out.push('\n');
        out.push_str(&format!(
            "{} --> {}\n",
            format_timestamp(seg.start_sec),
            format_timestamp(seg.end_sec)
        ));
        out.push_str(&seg.display_text(mode));
        out.push('\n');
    }
    out
}

fn format_timestamp(seconds: f64) -> String {
    let total_ms = (seconds.max(0.0) * 1000.0).round() as u64;
    let ms = total_ms % 1000;
    let total_sec = total_ms / 1000;
    let s = total_sec % 60;
    let total_min = total_sec / 60;
    let m = total_min % 60;
    let h = total_min / 60;
    format!("{h:02}:{m:02}:{s:02},{ms:03}")
}

fn parse_timestamp(s: &str) -> Option<f64> {
    let s = s.trim();
    let (time, ms) = s.split_once(',')?;
    let ms: f64 = ms.parse().ok()?;
    let mut parts = time.split(':');
    let h: f64 = parts.next()?.parse().ok()?;
    let m: f64 = parts.next()?.parse().ok()?;
    let s: f64 = parts.next()?.parse().ok()?;
    Some(h * 3600.0 + m * 60.0 + s + ms / 1000.0)
}

/// Reads SRT text back into segments. Tolerates a leading UTF-8 BOM and
/// CRLF line endings; index numbers in the source are ignored and
/// reassigned densely.
pub fn parse_srt(text: &str) -> Vec<Segment> {
    let text = text.strip_prefix('\u{feff}').unwrap_or(text);
    let normalized = text.replace("\r\n", "\n");
    let mut segments = Vec::new();

    for block in normalized.split("\n\n") {
        let block = block.trim();
        if block.is_empty() {
            continue;
        }
        let mut lines = block.lines();
        let _index_line = lines.next();
        let Some(time_line) = lines.next() else { continue };
        let Some((start, end)) = time_line.split_once("-->") else {
            continue;
        };
        let (Some(start_sec), Some(end_sec)) = (parse_timestamp(start), parse_timestamp(end)) else {
            continue;
        };
        let text_lines: Vec<&str> = lines.collect();
        let text = text_lines.join("\n");
        segments.push(Segment::new(segments.len() + 1, start_sec, end_sec, text));
    }

    segments
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_timestamp_pads_correctly() {
        assert_eq!(format_timestamp(3661.5), "01:01:01,500");
        assert_eq!(format_timestamp(0.0), "00:00:00,000");
    }

    #[test]
    fn serialize_produces_blank_line_separated_blocks() {
        let segments = vec![Segment::new(1, 0.0, 1.0, "hello"), Segment::new(2, 1.5, 2.5, "world")];
        let srt = serialize_srt(&segments, OutputMode::Original);
        assert!(srt.contains("1\n00:00:00,000 --> 00:00:01,000\nhello\n\n2\n"));
    }

    #[test]
    fn parse_round_trips_serialized_output() {
        let segments = vec![Segment::new(1, 0.0, 1.5, "hello world"), Segment::new(2, 2.0, 3.25, "second line")];
        let srt = serialize_srt(&segments, OutputMode::Original);
        let parsed = parse_srt(&srt);
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[0].original_text, "hello world");
        assert!((parsed[1].start_sec - 2.0).abs() < 1e-3);
    }

    #[test]
    fn parse_tolerates_bom_and_crlf() {
        let srt = "\u{feff}1\r\n00:00:00,000 --> 00:00:01,000\r\nhello\r\n";
        let parsed = parse_srt(srt);
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].original_text, "hello");
    }

    #[test]
    fn parse_ignores_malformed_blocks() {
        let srt = "garbage\nnot a timestamp\n\n1\n00:00:00,000 --> 00:00:01,000\nreal line\n";
        let parsed = parse_srt(srt);
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].original_text, "real line");
    }
}
