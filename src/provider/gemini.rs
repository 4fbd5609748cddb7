use super::{map_http_failure, Capability, CompleteRequest, ProviderClient, RawSegment, TranscribeRequest, TranscribeResponse};
use crate::cancel::CancellationToken;
use crate::error::{CoreError, Result};
use async_trait::async_trait;
use base64::Engine;
use regex::Regex;
use reqwest::Client;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::debug;

const CAPS: &[Capability] = &[Capability::Transcribe, Capability::Complete];

pub struct GeminiClient {
    api_key: String,
    http: Client,
    model: String,
}

impl GeminiClient {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            http: Client::builder()
                .timeout(Duration::from_secs(120))
                .build()
                .expect("reqwest client"),
            model: "gemini-2.0-flash".to_string(),
        }
    }

    fn build_transcribe_prompt(prompt_context: Option<&str>, language: Option<&str>) -> String {
        let mut prompt = String::from(
            "Transcribe the speech in this audio. For every distinct line, prefix it with \
             a timestamp in [MM:SS] or [HH:MM:SS] format relative to the start of this audio clip.",
        );
        if let Some(lang) = language {
            prompt.push_str(&format!(" The spoken language is {lang}."));
        }
        if let Some(ctx) = prompt_context {
            if !ctx.is_empty() {
                prompt.push_str(&format!(
                    "\n\nFor continuity, here is the end of the preceding transcript: \"{ctx}\""
                ));
            }
        }
        prompt
    }

    async fn generate_content(
        &self,
        parts: Vec<Value>,
        idempotency_key: Option<&str>,
        signal: &CancellationToken,
    ) -> Result<String> {
        if signal.is_cancelled() {
            return Err(CoreError::Cancelled);
        }

        let url = format!(
            "https://generativelanguage.googleapis.com/v1beta/models/{}:generateContent?key={}",
            self.model, self.api_key
        );

        let body = json!({ "contents": [{ "parts": parts }] });

        let mut request = self.http.post(&url).json(&body);
        if let Some(key) = idempotency_key {
            request = request.header("Idempotency-Key", key);
        }

        let response = request.send().await?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(map_http_failure("gemini", status, &text));
        }

        let value: Value = response.json().await?;
        let text = value["candidates"][0]["content"]["parts"][0]["text"]
            .as_str()
            .unwrap_or_default()
            .to_string();
        Ok(text)
    }
}

#[async_trait]
impl ProviderClient for GeminiClient {
    fn name(&self) -> &'static str {
        "gemini"
    }

    fn capabilities(&self) -> &'static [Capability] {
        CAPS
    }

    async fn transcribe(
        &self,
        req: TranscribeRequest,
        signal: &CancellationToken,
    ) -> Result<TranscribeResponse> {
        let bytes = tokio::fs::read(&req.audio_path)
            .await
            .map_err(|e| CoreError::MediaMalformed(format!("cannot read chunk audio: {e}")))?;
        let encoded = base64::engine::general_purpose::STANDARD.encode(&bytes);

        let prompt = Self::build_transcribe_prompt(req.prompt_context.as_deref(), req.language.as_deref());
        let parts = vec![
            json!({ "text": prompt }),
            json!({ "inline_data": { "mime_type": "audio/wav", "data": encoded } }),
        ];

        let text = self.generate_content(parts, req.idempotency_key.as_deref(), signal).await?;
        let segments = parse_timestamped_text(&text);
        debug!(count = segments.len(), "gemini transcription parsed");

        Ok(TranscribeResponse {
            segments,
            language: req.language,
        })
    }

    async fn complete(&self, req: CompleteRequest, signal: &CancellationToken) -> Result<String> {
        let mut parts = Vec::new();
        if let Some(system) = &req.system_prompt {
            parts.push(json!({ "text": system }));
        }
        parts.push(json!({ "text": req.user_prompt }));
        self.generate_content(parts, req.idempotency_key.as_deref(), signal).await
    }
}

/// Parses `[MM:SS] text` or `[HH:MM:SS] text` lines into chunk-relative
/// segments. Lines with no timestamp prefix are ignored - the model is
/// instructed to always emit one.
fn parse_timestamped_text(text: &str) -> Vec<RawSegment> {
    let re = Regex::new(r"^\s*\[(\d{1,2}):(\d{2})(?::(\d{2}))?\]\s*(.+)$").unwrap();
    let mut segments = Vec::new();
    let mut pending: Option<(f64, String)> = None;

    for line in text.lines() {
        if let Some(caps) = re.captures(line) {
            if let Some((start, prev_text)) = pending.take() {
                let end = parse_timestamp(&caps);
                segments.push(RawSegment {
                    start_sec: start,
                    end_sec: end.max(start + 0.01),
                    text: prev_text,
                    no_speech_prob: None,
                    avg_logprob: None,
                });
            }
            let start = parse_timestamp(&caps);
            let body = caps.get(4).unwrap().as_str().trim().to_string();
            pending = Some((start, body));
        } else if let Some((_, body)) = pending.as_mut() {
            if !line.trim().is_empty() {
                body.push(' ');
                body.push_str(line.trim());
            }
        }
    }

    if let Some((start, text)) = pending {
        segments.push(RawSegment {
            start_sec: start,
            end_sec: start + estimate_duration(&text),
            text,
            no_speech_prob: None,
            avg_logprob: None,
        });
    }

    segments.into_iter().filter(|s| !s.text.trim().is_empty()).collect()
}

fn parse_timestamp(caps: &regex::Captures) -> f64 {
    let a: f64 = caps[1].parse().unwrap_or(0.0);
    let b: f64 = caps[2].parse().unwrap_or(0.0);
    if let Some(c) = caps.get(3) {
        let c: f64 = c.as_str().parse().unwrap_or(0.0);
        a * 3600.0 + b * 60.0 + c
    } else {
        a * 60.0 + b
    }
}

fn estimate_duration(text: &str) -> f64 {
    (text.chars().count() as f64 / 15.0).max(1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_mm_ss_timestamps() {
        let text = "[00:01] Hello there\n[00:04] How are you";
        let segments = parse_timestamped_text(text);
        assert_eq!(segments.len(), 2);
        assert_eq!(segments[0].start_sec, 1.0);
        assert_eq!(segments[0].end_sec, 4.0);
        assert_eq!(segments[0].text, "Hello there");
    }

    #[test]
    fn parses_hh_mm_ss_timestamps() {
        let text = "[01:00:01] First line";
        let segments = parse_timestamped_text(text);
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].start_sec, 3601.0);
    }

    #[test]
    fn continuation_lines_are_appended_to_pending_segment() {
        let text = "[00:01] Hello\nthere friend\n[00:05] Next line";
        let segments = parse_timestamped_text(text);
        assert_eq!(segments[0].text, "Hello there friend");
    }

    #[test]
    fn ignores_lines_with_no_timestamp_and_no_pending() {
        let segments = parse_timestamped_text("stray preamble text\n[00:02] actual line");
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].text, "actual line");
    }

    #[test]
    fn build_transcribe_prompt_includes_rolling_context() {
        let prompt = GeminiClient::build_transcribe_prompt(Some("end of prior text"), Some("en"));
        assert!(prompt.contains("end of prior text"));
        assert!(prompt.contains("en"));
    }
}
