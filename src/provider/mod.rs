//! Unified asynchronous client abstraction for remote transcription,
//! completion, and review, polymorphic over a capability set rather than
//! an inheritance hierarchy (see design notes on provider polymorphism).

pub mod gemini;
pub mod retry;
pub mod whisper;

use crate::cancel::CancellationToken;
use crate::config::Thresholds;
use crate::error::{CoreError, Result};
use async_trait::async_trait;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    Transcribe,
    Complete,
}

#[derive(Debug, Clone)]
pub struct RawSegment {
    pub start_sec: f64,
    pub end_sec: f64,
    pub text: String,
    pub no_speech_prob: Option<f64>,
    pub avg_logprob: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct TranscribeRequest {
    pub audio_path: std::path::PathBuf,
    pub prompt_context: Option<String>,
    pub idempotency_key: Option<String>,
    pub language: Option<String>,
}

#[derive(Debug, Clone)]
pub struct TranscribeResponse {
    pub segments: Vec<RawSegment>,
    pub language: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelTier {
    Fast,
    Quality,
}

#[derive(Debug, Clone)]
pub struct CompleteRequest {
    pub system_prompt: Option<String>,
    pub user_prompt: String,
    pub model_tier: ModelTier,
    pub temperature: Option<f32>,
    pub idempotency_key: Option<String>,
}

/// A capability-oriented client: transcription and text completion (used
/// by translate/review). Implementors pick which capabilities they
/// actually support and return `ProviderUnavailable` for the rest.
/// Streaming completion was dropped from the capability set - nothing in
/// this crate drove text incrementally, and an advertised capability with
/// no method behind it is worse than not advertising it at all.
#[async_trait]
pub trait ProviderClient: Send + Sync {
    fn name(&self) -> &'static str;

    fn capabilities(&self) -> &'static [Capability];

    async fn transcribe(
        &self,
        req: TranscribeRequest,
        signal: &CancellationToken,
    ) -> Result<TranscribeResponse>;

    async fn complete(&self, req: CompleteRequest, signal: &CancellationToken) -> Result<String>;
}

/// A provider with no implementation, standing in for the `local`
/// capability slot (spec open question: modeled, not implemented).
pub struct UnimplementedLocalProvider;

#[async_trait]
impl ProviderClient for UnimplementedLocalProvider {
    fn name(&self) -> &'static str {
        "local"
    }

    fn capabilities(&self) -> &'static [Capability] {
        &[]
    }

    async fn transcribe(
        &self,
        _req: TranscribeRequest,
        _signal: &CancellationToken,
    ) -> Result<TranscribeResponse> {
        Err(CoreError::ProviderUnavailable(
            "local provider is not implemented".to_string(),
        ))
    }

    async fn complete(&self, _req: CompleteRequest, _signal: &CancellationToken) -> Result<String> {
        Err(CoreError::ProviderUnavailable(
            "local provider is not implemented".to_string(),
        ))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TranscriptionRoute {
    Direct,
    Chunked,
}

/// Exact routing rules from the component design: duration/size gates
/// decide whole-file vs chunked transcription.
pub fn route_transcription(duration_sec: f64, file_size_bytes: u64, thresholds: &Thresholds) -> TranscriptionRoute {
    if file_size_bytes > thresholds.chunked_only_size_threshold_bytes {
        return TranscriptionRoute::Chunked;
    }
    if duration_sec > thresholds.whole_file_duration_threshold_sec
        || file_size_bytes > thresholds.whole_file_size_threshold_bytes
    {
        return TranscriptionRoute::Chunked;
    }
    TranscriptionRoute::Direct
}

/// Maps a non-2xx provider HTTP response into the error taxonomy. A 402 or
/// a quota-exceeded response body is credit exhaustion (aborts the whole
/// pass); everything else is provider unavailability, which the retry loop
/// may still consider transient based on status alone.
pub fn map_http_failure(provider_name: &str, status: reqwest::StatusCode, body: &str) -> CoreError {
    let lower = body.to_lowercase();
    if status.as_u16() == 402
        || lower.contains("insufficient_quota")
        || lower.contains("quota_exceeded")
        || lower.contains("resource_exhausted")
    {
        return CoreError::InsufficientCredits;
    }
    CoreError::ProviderUnavailable(format!("{provider_name} returned {status}: {body}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn thresholds() -> Thresholds {
        Thresholds::default()
    }

    #[test]
    fn short_small_file_routes_direct() {
        let route = route_transcription(30.0, 1024 * 1024, &thresholds());
        assert_eq!(route, TranscriptionRoute::Direct);
    }

    #[test]
    fn long_duration_routes_chunked() {
        let route = route_transcription(200.0, 1024 * 1024, &thresholds());
        assert_eq!(route, TranscriptionRoute::Chunked);
    }

    #[test]
    fn large_file_routes_chunked() {
        let route = route_transcription(30.0, 100 * 1024 * 1024, &thresholds());
        assert_eq!(route, TranscriptionRoute::Chunked);
    }

    #[test]
    fn huge_file_never_attempts_whole_file() {
        let route = route_transcription(30.0, 600 * 1024 * 1024, &thresholds());
        assert_eq!(route, TranscriptionRoute::Chunked);
    }

    #[test]
    fn payment_required_maps_to_insufficient_credits() {
        let err = map_http_failure("gemini", reqwest::StatusCode::PAYMENT_REQUIRED, "");
        assert!(matches!(err, CoreError::InsufficientCredits));
    }

    #[test]
    fn quota_body_maps_to_insufficient_credits_even_on_429() {
        let err = map_http_failure("whisper", reqwest::StatusCode::TOO_MANY_REQUESTS, "insufficient_quota");
        assert!(matches!(err, CoreError::InsufficientCredits));
    }

    #[test]
    fn other_statuses_map_to_provider_unavailable() {
        let err = map_http_failure("gemini", reqwest::StatusCode::INTERNAL_SERVER_ERROR, "oops");
        assert!(matches!(err, CoreError::ProviderUnavailable(_)));
    }
}
