use crate::error::{CoreError, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Which concrete client backs a capability slot. `Local` is modeled for
/// completeness but has no implementation; selecting it surfaces
/// `ProviderUnavailable`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    PrimaryRemote,
    FallbackRemote,
    Local,
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProviderKind::PrimaryRemote => write!(f, "primary_remote"),
            ProviderKind::FallbackRemote => write!(f, "fallback_remote"),
            ProviderKind::Local => write!(f, "local"),
        }
    }
}

impl std::str::FromStr for ProviderKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "primary" | "primary_remote" | "gemini" => Ok(ProviderKind::PrimaryRemote),
            "fallback" | "fallback_remote" | "whisper" => Ok(ProviderKind::FallbackRemote),
            "local" => Ok(ProviderKind::Local),
            _ => Err(format!("Unknown provider: {s}. Use 'primary', 'fallback', or 'local'")),
        }
    }
}

/// How a finalized segment's text is serialized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputMode {
    #[default]
    Original,
    Translation,
    Dual,
}

impl std::str::FromStr for OutputMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "original" => Ok(OutputMode::Original),
            "translation" => Ok(OutputMode::Translation),
            "dual" => Ok(OutputMode::Dual),
            _ => Err(format!("Unknown output mode: {s}")),
        }
    }
}

/// Every tunable constant named in the component design, collected so a
/// single `Config` value fully determines pipeline behavior.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct Thresholds {
    pub min_dur_sec: f64,
    pub max_dur_sec: f64,
    pub min_gap_sec: f64,

    pub merge_gap_sec: f64,
    pub max_chunk_duration_sec: f64,
    pub min_chunk_duration_sec: f64,
    pub pre_pad_sec: f64,
    pub post_pad_sec: f64,
    pub max_speechless_sec: f64,

    pub max_prompt_chars: usize,
    pub min_context_segments: usize,

    pub cps_latin: f64,
    pub cps_cjk: f64,
    pub cps_thai: f64,

    pub translate_batch_size: usize,
    pub translate_before_ctx: usize,
    pub translate_after_ctx: usize,
    pub review_window: usize,
    pub review_ctx: usize,

    pub retry_base_delay_ms: u64,
    pub retry_cap_delay_ms: u64,
    pub retry_max_attempts: u32,

    pub ffmpeg_startup_stall_sec: u64,
    pub ffmpeg_startup_stall_cold_sec: u64,
    pub ffmpeg_runtime_stall_sec: u64,
    pub stderr_ring_buffer_bytes: usize,

    pub whole_file_duration_threshold_sec: f64,
    pub whole_file_size_threshold_bytes: u64,
    pub chunked_only_size_threshold_bytes: u64,

    pub finalize_iteration_cap: usize,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            min_dur_sec: 1.0,
            max_dur_sec: 7.0,
            min_gap_sec: 0.12,

            merge_gap_sec: 0.6,
            max_chunk_duration_sec: 60.0,
            min_chunk_duration_sec: 2.0,
            pre_pad_sec: 0.25,
            post_pad_sec: 0.5,
            max_speechless_sec: 30.0,

            max_prompt_chars: 224,
            min_context_segments: 5,

            cps_latin: 17.0,
            cps_cjk: 13.0,
            cps_thai: 15.0,

            translate_batch_size: 10,
            translate_before_ctx: 3,
            translate_after_ctx: 3,
            review_window: 30,
            review_ctx: 15,

            retry_base_delay_ms: 2000,
            retry_cap_delay_ms: 10_000,
            retry_max_attempts: 3,

            ffmpeg_startup_stall_sec: 35,
            ffmpeg_startup_stall_cold_sec: 60,
            ffmpeg_runtime_stall_sec: 40,
            stderr_ring_buffer_bytes: 64 * 1024,

            whole_file_duration_threshold_sec: 160.0,
            whole_file_size_threshold_bytes: 95 * 1024 * 1024,
            chunked_only_size_threshold_bytes: 500 * 1024 * 1024,

            finalize_iteration_cap: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub gemini_api_key: Option<String>,
    pub openai_api_key: Option<String>,

    pub primary_provider: ProviderKind,
    pub fallback_provider: Option<ProviderKind>,

    pub transcribe_concurrency: usize,
    pub translate_concurrency: usize,
    pub quality_transcription: bool,
    pub quality_translation: bool,

    pub ffmpeg_path: String,
    pub ffprobe_path: String,

    pub thresholds: Thresholds,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            gemini_api_key: None,
            openai_api_key: None,
            primary_provider: ProviderKind::PrimaryRemote,
            fallback_provider: Some(ProviderKind::FallbackRemote),
            transcribe_concurrency: 5,
            translate_concurrency: 4,
            quality_transcription: false,
            quality_translation: false,
            ffmpeg_path: "ffmpeg".to_string(),
            ffprobe_path: "ffprobe".to_string(),
            thresholds: Thresholds::default(),
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        let mut config = Self::default();

        if let Some(config_path) = Self::config_file_path() {
            if config_path.exists() {
                let contents = std::fs::read_to_string(&config_path)?;
                if let Ok(file_config) = toml::from_str::<Config>(&contents) {
                    config = file_config;
                }
            }
        }

        if let Ok(key) = std::env::var("GEMINI_API_KEY") {
            config.gemini_api_key = Some(key);
        }
        if let Ok(key) = std::env::var("OPENAI_API_KEY") {
            config.openai_api_key = Some(key);
        }
        if let Ok(concurrency) = std::env::var("AUTOSUB_CONCURRENCY") {
            if let Ok(c) = concurrency.parse() {
                config.transcribe_concurrency = c;
            }
        }

        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let has_credential = match self.primary_provider {
            ProviderKind::PrimaryRemote => self.gemini_api_key.is_some(),
            ProviderKind::FallbackRemote => self.openai_api_key.is_some(),
            ProviderKind::Local => true,
        };
        if !has_credential {
            return Err(CoreError::Config(format!(
                "no credential configured for primary provider {}",
                self.primary_provider
            )));
        }

        if self.transcribe_concurrency == 0 || self.translate_concurrency == 0 {
            return Err(CoreError::Config(
                "concurrency settings must be greater than 0".to_string(),
            ));
        }

        if self.thresholds.min_dur_sec >= self.thresholds.max_dur_sec {
            return Err(CoreError::Config(
                "min_dur_sec must be less than max_dur_sec".to_string(),
            ));
        }

        Ok(())
    }

    fn config_file_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("subforge").join("config.toml"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_kind_roundtrips_through_display_and_parse() {
        for kind in [
            ProviderKind::PrimaryRemote,
            ProviderKind::FallbackRemote,
            ProviderKind::Local,
        ] {
            let parsed: ProviderKind = kind.to_string().parse().unwrap();
            assert_eq!(parsed, kind);
        }
    }

    #[test]
    fn default_config_is_internally_consistent() {
        let config = Config::default();
        assert!(config.thresholds.min_dur_sec < config.thresholds.max_dur_sec);
        assert_eq!(config.transcribe_concurrency, 5);
    }

    #[test]
    fn validate_requires_primary_provider_credential() {
        let config = Config::default();
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_passes_with_credential() {
        let mut config = Config::default();
        config.gemini_api_key = Some("key".to_string());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn output_mode_parses_known_values() {
        assert_eq!("dual".parse::<OutputMode>().unwrap(), OutputMode::Dual);
        assert!("nonsense".parse::<OutputMode>().is_err());
    }
}
