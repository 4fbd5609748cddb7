//! The `Segment` entity shared by every pass from transcription through
//! finalize. Owned by value; each pass consumes the previous pass's vec and
//! produces a new one rather than mutating shared state.

#[derive(Debug, Clone)]
pub struct WordTimestamp {
    pub word: String,
    pub start_sec: f64,
    pub end_sec: f64,
}

#[derive(Debug, Clone)]
pub struct Segment {
    pub id: String,
    pub index: usize,
    pub start_sec: f64,
    pub end_sec: f64,
    pub original_text: String,
    pub translated_text: Option<String>,
    pub words: Option<Vec<WordTimestamp>>,
    pub no_speech_prob: Option<f64>,
    pub avg_logprob: Option<f64>,
}

impl Segment {
    pub fn new(index: usize, start_sec: f64, end_sec: f64, text: impl Into<String>) -> Self {
        Self {
            id: format!("seg-{index}"),
            index,
            start_sec,
            end_sec,
            original_text: normalize_whitespace(&text.into()),
            translated_text: None,
            words: None,
            no_speech_prob: None,
            avg_logprob: None,
        }
    }

    pub fn duration(&self) -> f64 {
        (self.end_sec - self.start_sec).max(0.0)
    }

    /// The text a given output mode should serialize.
    pub fn display_text(&self, mode: crate::config::OutputMode) -> String {
        match mode {
            crate::config::OutputMode::Original => self.original_text.clone(),
            crate::config::OutputMode::Translation => self
                .translated_text
                .clone()
                .unwrap_or_else(|| self.original_text.clone()),
            crate::config::OutputMode::Dual => match &self.translated_text {
                Some(t) if t != &self.original_text => {
                    format!("{}\n{}", self.original_text, t)
                }
                _ => self.original_text.clone(),
            },
        }
    }
}

pub fn normalize_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Sorts by `start_sec` ascending and assigns a dense 1-based index, the
/// shape required after any concurrent fan-out reassembles its results.
pub fn sort_and_reindex(mut segments: Vec<Segment>) -> Vec<Segment> {
    segments.sort_by(|a, b| a.start_sec.partial_cmp(&b.start_sec).unwrap());
    for (i, seg) in segments.iter_mut().enumerate() {
        seg.index = i + 1;
    }
    segments
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_segment_normalizes_whitespace() {
        let seg = Segment::new(1, 0.0, 1.0, "  hello   world  ");
        assert_eq!(seg.original_text, "hello world");
    }

    #[test]
    fn sort_and_reindex_orders_by_start_and_renumbers() {
        let segments = vec![
            Segment::new(9, 5.0, 6.0, "second"),
            Segment::new(1, 0.0, 1.0, "first"),
        ];
        let sorted = sort_and_reindex(segments);
        assert_eq!(sorted[0].original_text, "first");
        assert_eq!(sorted[0].index, 1);
        assert_eq!(sorted[1].index, 2);
    }

    #[test]
    fn display_text_dual_mode_joins_original_and_translation() {
        let mut seg = Segment::new(1, 0.0, 1.0, "hello");
        seg.translated_text = Some("bonjour".to_string());
        assert_eq!(
            seg.display_text(crate::config::OutputMode::Dual),
            "hello\nbonjour"
        );
    }
}
