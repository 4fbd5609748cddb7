use thiserror::Error;

/// Error taxonomy for the pipeline. Kinds map to the exit-code/UI-stage
/// contract in the caller-facing surface, not to Rust's own type hierarchy.
#[derive(Error, Debug)]
pub enum CoreError {
    #[error("operation cancelled")]
    Cancelled,

    #[error("insufficient provider credits")]
    InsufficientCredits,

    #[error("provider unavailable: {0}")]
    ProviderUnavailable(String),

    #[error("media malformed: {0}")]
    MediaMalformed(String),

    #[error("ffmpeg exited with code {code}: {tail}")]
    FfmpegFailed { code: i32, tail: String },

    #[error("ffmpeg could not be spawned: {0}")]
    FfmpegUnavailable(String),

    #[error("ffmpeg produced no output for too long ({0})")]
    StartupStall(String),

    #[error("insufficient disk space: {0}")]
    InsufficientDiskSpace(String),

    #[error("internal invariant violated: {0}")]
    InternalInvariantViolated(String),

    #[error("probe failed: {0}")]
    ProbeFailed(String),

    #[error("file not found: {0}")]
    FileNotFound(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl CoreError {
    /// Exit code for the CLI collaborator, per the caller-facing surface contract.
    pub fn exit_code(&self) -> i32 {
        match self {
            CoreError::Cancelled => 2,
            CoreError::InsufficientCredits => 3,
            CoreError::ProviderUnavailable(_) => 4,
            _ => 1,
        }
    }

    /// Stage tag surfaced on the terminal progress event (never a raw stack trace).
    pub fn stage_tag(&self) -> &'static str {
        match self {
            CoreError::Cancelled => "CANCELLED",
            _ => "ERROR",
        }
    }

    pub fn is_whole_pipeline_fatal(&self) -> bool {
        matches!(
            self,
            CoreError::Cancelled
                | CoreError::InsufficientCredits
                | CoreError::InsufficientDiskSpace(_)
                | CoreError::MediaMalformed(_)
                | CoreError::FfmpegFailed { .. }
                | CoreError::FfmpegUnavailable(_)
                | CoreError::ProviderUnavailable(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, CoreError>;
