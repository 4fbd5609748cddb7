//! Integration tests exercising cross-module behavior without external
//! API keys: config loading/validation, the finalize pass end-to-end, SRT
//! round-tripping, and overlay cue derivation against realistic segments.

use subforge::config::{Config, OutputMode, Thresholds};
use subforge::finalize::{finalize, parse_srt, serialize_srt};
use subforge::overlay::{derive_cue_events, escape_ass_text};
use subforge::segment::Segment;

mod config_tests {
    use super::*;

    #[test]
    fn default_config_has_sane_concurrency() {
        let config = Config::default();
        assert!(config.transcribe_concurrency > 0);
        assert!(config.translate_concurrency > 0);
    }

    #[test]
    fn validate_requires_a_credential_for_the_primary_provider() {
        let mut config = Config::default();
        config.gemini_api_key = None;
        config.openai_api_key = None;
        assert!(config.validate().is_err());

        config.gemini_api_key = Some("test-key".to_string());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn output_mode_round_trips_through_its_string_form() {
        assert_eq!("original".parse::<OutputMode>().unwrap(), OutputMode::Original);
        assert_eq!("DUAL".parse::<OutputMode>().unwrap(), OutputMode::Dual);
        assert!("nonsense".parse::<OutputMode>().is_err());
    }

    #[test]
    fn thresholds_defaults_match_documented_values() {
        let thresholds = Thresholds::default();
        assert_eq!(thresholds.min_dur_sec, 1.0);
        assert_eq!(thresholds.max_dur_sec, 7.0);
        assert_eq!(thresholds.whole_file_duration_threshold_sec, 160.0);
    }
}

mod finalize_pipeline_tests {
    use super::*;

    fn seg(index: usize, start: f64, end: f64, text: &str) -> Segment {
        Segment::new(index, start, end, text)
    }

    #[test]
    fn messy_transcript_ends_up_with_no_overlaps_and_minimum_gap() {
        let thresholds = Thresholds::default();
        let segments = vec![
            seg(1, 0.0, 1.2, "hello there my friend"),
            seg(2, 1.22, 1.4, "ok"),
            seg(3, 1.45, 5.0, "friend how are you doing today"),
        ];

        let finalized = finalize(segments, &thresholds);

        for window in finalized.windows(2) {
            assert!(window[1].start_sec >= window[0].end_sec + thresholds.min_gap_sec - 1e-6);
        }
        for (i, s) in finalized.iter().enumerate() {
            assert_eq!(s.index, i + 1);
        }
    }

    #[test]
    fn finalize_then_serialize_then_parse_preserves_text_and_timing() {
        let thresholds = Thresholds::default();
        let segments = vec![seg(1, 0.0, 2.0, "a clear opening line"), seg(2, 2.5, 5.0, "and a closing line")];

        let finalized = finalize(segments, &thresholds);
        let srt = serialize_srt(&finalized, OutputMode::Original);
        let parsed = parse_srt(&srt);

        assert_eq!(finalized.len(), parsed.len());
        for (a, b) in finalized.iter().zip(parsed.iter()) {
            assert_eq!(a.original_text, b.original_text);
            assert!((a.start_sec - b.start_sec).abs() < 1e-3);
            assert!((a.end_sec - b.end_sec).abs() < 1e-3);
        }
    }

    #[test]
    fn empty_input_finalizes_to_empty_output() {
        let thresholds = Thresholds::default();
        assert!(finalize(Vec::new(), &thresholds).is_empty());
    }
}

mod overlay_cue_tests {
    use super::*;

    #[test]
    fn cue_events_stay_ordered_and_clamped_for_a_realistic_transcript() {
        let segments = vec![
            Segment::new(1, 0.0, 2.0, "first line"),
            Segment::new(2, 2.2, 4.0, "second line"),
            Segment::new(3, 4.1, 9.0, "third line runs long"),
        ];
        let events = derive_cue_events(&segments, 8.0);

        for window in events.windows(2) {
            assert!(window[0].time_ms <= window[1].time_ms);
        }
        assert!(events.iter().all(|e| e.time_ms <= 8000));
    }

    #[test]
    fn escape_rule_covers_a_realistic_windows_path() {
        let escaped = escape_ass_text("C:\\Users\\me\\video's, final.ass");
        assert!(!escaped.contains("C:\\U"));
        assert!(escaped.contains("C\\:"));
    }
}
