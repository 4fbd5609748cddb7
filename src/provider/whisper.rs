use super::{map_http_failure, Capability, CompleteRequest, ProviderClient, RawSegment, TranscribeRequest, TranscribeResponse};
use crate::cancel::CancellationToken;
use crate::error::{CoreError, Result};
use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;

const CAPS: &[Capability] = &[Capability::Transcribe];

pub struct WhisperClient {
    api_key: String,
    http: Client,
    model: String,
}

#[derive(Deserialize)]
struct VerboseJsonResponse {
    #[serde(default)]
    segments: Vec<ApiSegment>,
    #[serde(default)]
    language: Option<String>,
}

#[derive(Deserialize)]
struct ApiSegment {
    start: f64,
    end: f64,
    text: String,
    #[serde(default)]
    no_speech_prob: Option<f64>,
    #[serde(default)]
    avg_logprob: Option<f64>,
}

impl WhisperClient {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            http: Client::builder()
                .timeout(Duration::from_secs(120))
                .build()
                .expect("reqwest client"),
            model: "whisper-1".to_string(),
        }
    }

    async fn build_form(&self, req: &TranscribeRequest) -> Result<Form> {
        let bytes = tokio::fs::read(&req.audio_path)
            .await
            .map_err(|e| CoreError::MediaMalformed(format!("cannot read chunk audio: {e}")))?;
        let file_name = req
            .audio_path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "audio.wav".to_string());

        let part = Part::bytes(bytes).file_name(file_name).mime_str("audio/wav")?;
        let mut form = Form::new()
            .part("file", part)
            .text("model", self.model.clone())
            .text("response_format", "verbose_json")
            .text("timestamp_granularities[]", "segment");

        if let Some(lang) = &req.language {
            form = form.text("language", lang.clone());
        }
        if let Some(ctx) = &req.prompt_context {
            if !ctx.is_empty() {
                form = form.text("prompt", ctx.clone());
            }
        }
        Ok(form)
    }
}

#[async_trait]
impl ProviderClient for WhisperClient {
    fn name(&self) -> &'static str {
        "whisper"
    }

    fn capabilities(&self) -> &'static [Capability] {
        CAPS
    }

    async fn transcribe(
        &self,
        req: TranscribeRequest,
        signal: &CancellationToken,
    ) -> Result<TranscribeResponse> {
        if signal.is_cancelled() {
            return Err(CoreError::Cancelled);
        }

        let form = self.build_form(&req).await?;
        let mut request = self
            .http
            .post("https://api.openai.com/v1/audio/transcriptions")
            .bearer_auth(&self.api_key)
            .multipart(form);
        if let Some(key) = &req.idempotency_key {
            request = request.header("Idempotency-Key", key);
        }
        let response = request.send().await?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(map_http_failure("whisper", status, &text));
        }

        let parsed: VerboseJsonResponse = response.json().await?;
        let segments = parsed
            .segments
            .into_iter()
            .map(|s| RawSegment {
                start_sec: s.start,
                end_sec: s.end,
                text: s.text.trim().to_string(),
                no_speech_prob: s.no_speech_prob,
                avg_logprob: s.avg_logprob,
            })
            .collect();

        Ok(TranscribeResponse {
            segments,
            language: parsed.language,
        })
    }

    async fn complete(&self, _req: CompleteRequest, _signal: &CancellationToken) -> Result<String> {
        Err(CoreError::ProviderUnavailable(
            "whisper does not support text completion".to_string(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn whisper_does_not_support_complete() {
        let client = WhisperClient::new("test-key");
        let result = client
            .complete(
                CompleteRequest {
                    system_prompt: None,
                    user_prompt: "hi".to_string(),
                    model_tier: super::super::ModelTier::Fast,
                    temperature: None,
                    idempotency_key: None,
                },
                &CancellationToken::new(),
            )
            .await;
        assert!(matches!(result, Err(CoreError::ProviderUnavailable(_))));
    }

    #[tokio::test]
    async fn transcribe_rejects_missing_file() {
        let client = WhisperClient::new("test-key");
        let result = client
            .transcribe(
                TranscribeRequest {
                    audio_path: std::path::PathBuf::from("/tmp/nonexistent_subforge_test.wav"),
                    prompt_context: None,
                    idempotency_key: None,
                    language: None,
                },
                &CancellationToken::new(),
            )
            .await;
        assert!(result.is_err());
    }
}
