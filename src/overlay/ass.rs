//! ASS subtitle document construction and the escaping rule required by
//! ffmpeg's `subtitles` filter argument.

use crate::segment::Segment;

#[derive(Debug, Clone)]
pub struct StylePreset {
    pub name: String,
    pub font_name: String,
    pub font_size: u32,
    pub primary_color: String,
    pub outline_color: String,
    pub background_color: String,
    pub outline_width: f32,
    pub shadow: f32,
    pub margin_v: u32,
    pub alignment: u8,
}

impl Default for StylePreset {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            font_name: "Arial".to_string(),
            font_size: 48,
            primary_color: "&H00FFFFFF".to_string(),
            outline_color: "&H00000000".to_string(),
            background_color: "black".to_string(),
            outline_width: 2.0,
            shadow: 0.0,
            margin_v: 40,
            alignment: 2,
        }
    }
}

/// Escapes a path for embedding inside the `subtitles=` filter argument:
/// `\` -> `\\`, `:` -> `\:`, `,` -> `\,`, `'` -> `\'`.
pub fn escape_ass_text(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            ':' => out.push_str("\\:"),
            ',' => out.push_str("\\,"),
            '\'' => out.push_str("\\'"),
            _ => out.push(c),
        }
    }
    out
}

pub fn build_ass_document(segments: &[Segment], style: &StylePreset) -> String {
    let mut doc = String::new();
    doc.push_str("[Script Info]\nScriptType: v4.00+\nWrapStyle: 0\nScaledBorderAndShadow: yes\n\n");
    doc.push_str("[V4+ Styles]\n");
    doc.push_str("Format: Name, Fontname, Fontsize, PrimaryColour, OutlineColour, BackColour, Bold, Italic, BorderStyle, Outline, Shadow, Alignment, MarginL, MarginR, MarginV, Encoding\n");
    doc.push_str(&format!(
        "Style: {},{},{},{},{},&H00000000,0,0,1,{},{},{},10,10,{},1\n\n",
        style.name,
        style.font_name,
        style.font_size,
        style.primary_color,
        style.outline_color,
        style.outline_width,
        style.shadow,
        style.alignment,
        style.margin_v
    ));
    doc.push_str("[Events]\n");
    doc.push_str("Format: Layer, Start, End, Style, Name, MarginL, MarginR, MarginV, Effect, Text\n");

    for seg in segments {
        doc.push_str(&format!(
            "Dialogue: 0,{},{},{},,0,0,0,,{}\n",
            format_ass_time(seg.start_sec),
            format_ass_time(seg.end_sec),
            style.name,
            seg.original_text.replace('\n', "\\N")
        ));
    }
    doc
}

fn format_ass_time(seconds: f64) -> String {
    let total_cs = (seconds.max(0.0) * 100.0).round() as u64;
    let cs = total_cs % 100;
    let total_sec = total_cs / 100;
    let s = total_sec % 60;
    let total_min = total_sec / 60;
    let m = total_min % 60;
    let h = total_min / 60;
    format!("{h}:{m:02}:{s:02}.{cs:02}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escape_ass_text_handles_every_special_character() {
        assert_eq!(escape_ass_text("C:\\path, it's"), "C\\:\\\\path\\, it\\'s");
    }

    #[test]
    fn format_ass_time_uses_centiseconds() {
        assert_eq!(format_ass_time(61.23), "0:01:01.23");
    }

    #[test]
    fn build_ass_document_includes_every_segment() {
        let segments = vec![Segment::new(1, 0.0, 1.0, "hi"), Segment::new(2, 1.5, 2.5, "bye")];
        let doc = build_ass_document(&segments, &StylePreset::default());
        assert!(doc.contains("hi"));
        assert!(doc.contains("bye"));
        assert_eq!(doc.matches("Dialogue:").count(), 2);
    }
}
