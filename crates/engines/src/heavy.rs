//! Heavy engine: a remote OpenAI-compatible backend.
//!
//! Works with any endpoint exposing `/v1/chat/completions` (OpenAI,
//! OpenRouter, Ollama, vLLM, Together, Fireworks). The SSE byte stream
//! is parsed line by line and re-emitted as `GenerationEvent`s: one
//! `First` carrying time-to-first-token, a `Token` per content delta,
//! and `Done` when the backend signals `[DONE]` or closes the stream.

use std::time::Instant;

use async_trait::async_trait;
use futures::StreamExt;
use serde::Deserialize;
use tracing::{debug, trace, warn};

use valet_core::{
    EngineError, EngineHealth, EngineStatus, EventStream, GenerationEngine, GenerationEvent,
    GenerationParams, Message, Role, SessionId,
};

pub struct HeavyEngine {
    base_url: String,
    api_key: Option<String>,
    client: reqwest::Client,
}

impl HeavyEngine {
    pub fn new(endpoint: impl Into<String>, api_key: Option<String>) -> Result<Self, EngineError> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(120))
            .build()
            .map_err(|e| EngineError::NotConfigured(format!("HTTP client build failed: {e}")))?;

        Ok(Self {
            base_url: endpoint.into().trim_end_matches('/').to_string(),
            api_key,
            client,
        })
    }

    fn to_api_messages(messages: &[Message]) -> Vec<ApiMessage> {
        messages
            .iter()
            .map(|m| ApiMessage {
                role: match m.role {
                    Role::System => "system",
                    Role::User => "user",
                    Role::Assistant => "assistant",
                },
                content: m.content.clone(),
            })
            .collect()
    }

    fn authorize(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => req.header("Authorization", format!("Bearer {key}")),
            None => req,
        }
    }
}

#[async_trait]
impl GenerationEngine for HeavyEngine {
    fn name(&self) -> &str {
        "heavy"
    }

    async fn stream(
        &self,
        session_id: &SessionId,
        messages: &[Message],
        params: &GenerationParams,
    ) -> Result<EventStream, EngineError> {
        let url = format!("{}/chat/completions", self.base_url);
        let model = params
            .model
            .clone()
            .ok_or_else(|| EngineError::NotConfigured("no model configured for heavy tier".into()))?;

        let mut body = serde_json::json!({
            "model": model,
            "messages": Self::to_api_messages(messages),
            "stream": true,
        });
        if let Some(max_tokens) = params.max_tokens {
            body["max_tokens"] = serde_json::json!(max_tokens);
        }
        if let Some(temperature) = params.temperature {
            body["temperature"] = serde_json::json!(temperature);
        }

        debug!(session_id = %session_id, model = %model, "Sending heavy streaming request");
        let started = Instant::now();

        let response = self
            .authorize(self.client.post(&url))
            .header("Content-Type", "application/json")
            .header("Accept", "text/event-stream")
            .json(&body)
            .send()
            .await
            .map_err(|e| EngineError::Network(e.to_string()))?;

        let status = response.status().as_u16();
        if status == 429 {
            return Err(EngineError::RateLimited {
                retry_after_secs: 5,
            });
        }
        if status == 401 || status == 403 {
            return Err(EngineError::ApiError {
                status_code: status,
                message: "Invalid API key or insufficient permissions".into(),
            });
        }
        if status != 200 {
            let error_body = response.text().await.unwrap_or_default();
            warn!(status, body = %error_body, "Heavy backend returned error");
            return Err(EngineError::ApiError {
                status_code: status,
                message: error_body,
            });
        }

        let (tx, rx) = tokio::sync::mpsc::channel(64);

        tokio::spawn(async move {
            let mut byte_stream = response.bytes_stream();
            let mut buffer = String::new();
            let mut first_sent = false;

            while let Some(chunk_result) = byte_stream.next().await {
                let bytes = match chunk_result {
                    Ok(b) => b,
                    Err(e) => {
                        let _ = tx
                            .send(Err(EngineError::StreamInterrupted(e.to_string())))
                            .await;
                        return;
                    }
                };

                buffer.push_str(&String::from_utf8_lossy(&bytes));

                while let Some(line_end) = buffer.find('\n') {
                    let line = buffer[..line_end].trim_end_matches('\r').to_string();
                    buffer = buffer[line_end + 1..].to_string();

                    match parse_sse_line(&line) {
                        SseLine::Skip => {}
                        SseLine::Done => {
                            let _ = tx.send(Ok(GenerationEvent::Done)).await;
                            return;
                        }
                        SseLine::Delta(text) => {
                            if !first_sent {
                                first_sent = true;
                                let ms = started.elapsed().as_millis() as u64;
                                if tx.send(Ok(GenerationEvent::First { ms })).await.is_err() {
                                    return; // receiver dropped
                                }
                            }
                            if tx.send(Ok(GenerationEvent::Token { text })).await.is_err() {
                                return;
                            }
                        }
                    }
                }
            }

            // Stream closed without [DONE]; still terminate cleanly.
            let _ = tx.send(Ok(GenerationEvent::Done)).await;
        });

        Ok(rx)
    }

    async fn health(&self) -> EngineHealth {
        let url = format!("{}/models", self.base_url);
        let result = self.authorize(self.client.get(&url)).send().await;
        match result {
            Ok(resp) if resp.status().is_success() => EngineHealth {
                name: "heavy".into(),
                status: EngineStatus::Ready,
                model: None,
                detail: Some(self.base_url.clone()),
            },
            Ok(resp) => EngineHealth {
                name: "heavy".into(),
                status: EngineStatus::Unreachable,
                model: None,
                detail: Some(format!("endpoint returned status {}", resp.status())),
            },
            Err(e) => EngineHealth {
                name: "heavy".into(),
                status: EngineStatus::Unreachable,
                model: None,
                detail: Some(e.to_string()),
            },
        }
    }
}

// ── SSE parsing ────────────────────────────────────────────────────────

enum SseLine {
    /// Empty line, comment, or an unparseable/empty chunk.
    Skip,
    /// A content delta.
    Delta(String),
    /// The `[DONE]` sentinel.
    Done,
}

fn parse_sse_line(line: &str) -> SseLine {
    if line.is_empty() || line.starts_with(':') {
        return SseLine::Skip;
    }
    let Some(data) = line.strip_prefix("data:") else {
        return SseLine::Skip;
    };
    let data = data.trim();
    if data == "[DONE]" {
        return SseLine::Done;
    }

    match serde_json::from_str::<StreamResponse>(data) {
        Ok(resp) => {
            let delta = resp
                .choices
                .first()
                .and_then(|c| c.delta.content.clone())
                .filter(|c| !c.is_empty());
            match delta {
                Some(text) => SseLine::Delta(text),
                None => SseLine::Skip,
            }
        }
        Err(e) => {
            trace!(data = %data, error = %e, "Ignoring unparseable SSE chunk");
            SseLine::Skip
        }
    }
}

#[derive(Debug, serde::Serialize)]
struct ApiMessage {
    role: &'static str,
    content: String,
}

#[derive(Debug, Deserialize)]
struct StreamResponse {
    #[serde(default)]
    choices: Vec<StreamChoice>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    delta: StreamDelta,
    #[serde(default)]
    #[allow(dead_code)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_conversion() {
        let messages = vec![Message::system("You are Valet."), Message::user("Hello")];
        let api = HeavyEngine::to_api_messages(&messages);
        assert_eq!(api.len(), 2);
        assert_eq!(api[0].role, "system");
        assert_eq!(api[1].role, "user");
        assert_eq!(api[1].content, "Hello");
    }

    #[test]
    fn parse_content_delta() {
        let line = r#"data: {"choices":[{"delta":{"content":"Hello"},"finish_reason":null}]}"#;
        match parse_sse_line(line) {
            SseLine::Delta(text) => assert_eq!(text, "Hello"),
            _ => panic!("expected delta"),
        }
    }

    #[test]
    fn parse_done_sentinel() {
        assert!(matches!(parse_sse_line("data: [DONE]"), SseLine::Done));
        assert!(matches!(parse_sse_line("data:[DONE]"), SseLine::Done));
    }

    #[test]
    fn empty_and_comment_lines_skipped() {
        assert!(matches!(parse_sse_line(""), SseLine::Skip));
        assert!(matches!(parse_sse_line(": keep-alive"), SseLine::Skip));
        assert!(matches!(parse_sse_line("event: ping"), SseLine::Skip));
    }

    #[test]
    fn finish_chunk_without_content_skipped() {
        let line = r#"data: {"choices":[{"delta":{},"finish_reason":"stop"}]}"#;
        assert!(matches!(parse_sse_line(line), SseLine::Skip));
    }

    #[test]
    fn unparseable_chunk_skipped() {
        assert!(matches!(parse_sse_line("data: not json"), SseLine::Skip));
    }

    #[test]
    fn trailing_slash_trimmed() {
        let engine = HeavyEngine::new("https://llm.example.com/v1/", None).unwrap();
        assert_eq!(engine.base_url, "https://llm.example.com/v1");
    }

    #[tokio::test]
    async fn stream_requires_a_model() {
        let engine = HeavyEngine::new("https://llm.example.com/v1", None).unwrap();
        let err = engine
            .stream(
                &SessionId::from("s"),
                &[Message::user("hi")],
                &GenerationParams::default(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::NotConfigured(_)));
    }
}
