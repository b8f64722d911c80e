use async_trait::async_trait;
use futures_util::{Stream, StreamExt, future, stream};
use reqwest::{Client, StatusCode};
use serde::Serialize;
use serde_json::{json, Value};
use std::pin::Pin;

use crate::config::BackendConfig;
use crate::error::BackendError;
use crate::history::{Role, StoredMessage};

/// One prior turn handed to the backend as context.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Turn {
    pub role: Role,
    pub content: String,
    pub timestamp: f64,
}

impl From<&StoredMessage> for Turn {
    fn from(msg: &StoredMessage) -> Self {
        Self {
            role: msg.role,
            content: msg.content.clone(),
            timestamp: msg.timestamp,
        }
    }
}

/// Raw event emitted by a backend stream.
#[derive(Debug, Clone, PartialEq)]
pub enum BackendEvent {
    /// Human-visible text.
    Delta(String),
    Usage { prompt_tokens: u32, completion_tokens: u32 },
    /// Role markers, keep-alives, end-of-stream markers.
    Other,
}

pub type EventStream = Pin<Box<dyn Stream<Item = Result<BackendEvent, BackendError>> + Send>>;

/// An opaque async token producer.
#[async_trait]
pub trait Backend: Send + Sync {
    async fn stream(&self, turns: &[Turn]) -> Result<EventStream, BackendError>;
}

/// Builds backend handles. Called once per connection and again when
/// credentials expire.
pub trait BackendFactory: Send + Sync {
    fn build(&self) -> Result<Box<dyn Backend>, BackendError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provider {
    /// NDJSON `/api/chat`.
    Ollama,
    /// SSE `/v1/chat/completions` (OpenAI, xAI and compatible servers).
    OpenAi,
}

pub fn parse_model(model_str: &str) -> Result<(Provider, String), BackendError> {
    let (provider, model_name) = model_str
        .split_once('/')
        .ok_or_else(|| BackendError::fatal("Invalid model format. Expected 'provider/model'"))?;

    let provider = match provider {
        "ollama" => Provider::Ollama,
        "openai" | "xai" => Provider::OpenAi,
        other => return Err(BackendError::fatal(format!("Unknown provider: {}", other))),
    };
    Ok((provider, model_name.to_string()))
}

#[derive(Clone)]
pub struct LlmClient {
    client: Client,
    base_url: String,
    provider: Provider,
    model: String,
    api_key: Option<String>,
    temperature: f32,
    system_prompt: Option<String>,
}

impl LlmClient {
    pub fn from_config(config: &BackendConfig) -> Result<Self, BackendError> {
        let (provider, model) = parse_model(&config.model)?;
        let api_key = match &config.api_key_env {
            Some(var) => Some(std::env::var(var).map_err(|_| {
                BackendError::fatal(format!("API key variable {} is not set", var))
            })?),
            None => None,
        };

        Ok(Self {
            client: Client::new(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            provider,
            model,
            api_key,
            temperature: config.temperature,
            system_prompt: config.system_prompt.clone(),
        })
    }

    fn url(&self) -> String {
        match self.provider {
            Provider::Ollama => format!("{}/api/chat", self.base_url),
            Provider::OpenAi => format!("{}/v1/chat/completions", self.base_url),
        }
    }

    fn payload(&self, turns: &[Turn]) -> Value {
        let mut messages = Vec::with_capacity(turns.len() + 1);
        if let Some(prompt) = &self.system_prompt {
            messages.push(json!({"role": "system", "content": prompt}));
        }
        for turn in turns {
            messages.push(json!({"role": turn.role.as_str(), "content": turn.content}));
        }

        match self.provider {
            Provider::Ollama => json!({
                "model": self.model,
                "messages": messages,
                "stream": true,
                "options": {"temperature": self.temperature}
            }),
            Provider::OpenAi => json!({
                "model": self.model,
                "messages": messages,
                "stream": true,
                "temperature": self.temperature,
                "stream_options": {"include_usage": true}
            }),
        }
    }
}

#[async_trait]
impl Backend for LlmClient {
    async fn stream(&self, turns: &[Turn]) -> Result<EventStream, BackendError> {
        let url = self.url();
        let mut req = self.client.post(&url).json(&self.payload(turns));
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }

        let res = req.send().await?;
        let status = res.status();
        if !status.is_success() {
            let body = res.text().await.unwrap_or_default();
            return Err(classify_failure(status, &body));
        }

        tracing::debug!(url = %url, model = %self.model, "Backend stream opened");

        Ok(parse_body(self.provider, res.bytes_stream()))
    }
}

/// Parse a streamed response body line by line. A last line without a
/// trailing newline is still parsed once the body ends; a transport error
/// ends the stream.
fn parse_body<S, B, E>(provider: Provider, body: S) -> EventStream
where
    S: Stream<Item = Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: std::fmt::Display + Send + 'static,
{
    let lines = stream::unfold(
        (Box::pin(body), Vec::<u8>::new(), false),
        |(mut body, mut pending, finished)| async move {
            if finished {
                return None;
            }
            let (lines, finished) = match body.next().await {
                Some(Ok(bytes)) => {
                    pending.extend_from_slice(bytes.as_ref());
                    (drain_lines(&mut pending).into_iter().map(Ok).collect(), false)
                }
                Some(Err(e)) => (vec![Err(BackendError::fatal(format!("Stream error: {}", e)))], true),
                None => {
                    pending.push(b'\n');
                    (drain_lines(&mut pending).into_iter().map(Ok).collect::<Vec<_>>(), true)
                }
            };
            Some((lines, (body, pending, finished)))
        },
    );

    Box::pin(lines.flat_map(stream::iter).filter_map(move |line| {
        future::ready(match line {
            Ok(line) => parse_line(provider, &line),
            Err(err) => Some(Err(err)),
        })
    }))
}

/// Builds [`LlmClient`]s from config, re-reading the API key each time.
pub struct HttpBackendFactory {
    config: BackendConfig,
}

impl HttpBackendFactory {
    pub fn new(config: BackendConfig) -> Self {
        Self { config }
    }
}

impl BackendFactory for HttpBackendFactory {
    fn build(&self) -> Result<Box<dyn Backend>, BackendError> {
        Ok(Box::new(LlmClient::from_config(&self.config)?))
    }
}

fn classify_failure(status: StatusCode, body: &str) -> BackendError {
    // Covers both ExpiredToken and ExpiredTokenException.
    if status == StatusCode::UNAUTHORIZED || body.contains("ExpiredToken") {
        BackendError::TransientAuth(format!("{} - {}", status, body))
    } else {
        BackendError::Fatal(format!("LLM request failed: {} - {}", status, body))
    }
}

/// Split complete lines off the front of `buf`, leaving any partial line.
fn drain_lines(buf: &mut Vec<u8>) -> Vec<String> {
    let mut lines = Vec::new();
    while let Some(pos) = buf.iter().position(|b| *b == b'\n') {
        let line: Vec<u8> = buf.drain(..=pos).collect();
        let line = String::from_utf8_lossy(&line).trim().to_string();
        if !line.is_empty() {
            lines.push(line);
        }
    }
    lines
}

/// Missing counts read as 0; oversized ones saturate.
fn token_count(value: &Value) -> u32 {
    value.as_u64().map_or(0, |n| u32::try_from(n).unwrap_or(u32::MAX))
}

fn parse_line(provider: Provider, line: &str) -> Option<Result<BackendEvent, BackendError>> {
    match provider {
        Provider::Ollama => {
            let obj: Value = match serde_json::from_str(line) {
                Ok(v) => v,
                Err(e) => return Some(Err(BackendError::fatal(format!("Failed to parse Ollama chunk: {} | Text: {}", e, line)))),
            };
            if let Some(err) = obj["error"].as_str() {
                return Some(Err(BackendError::fatal(err)));
            }
            if let Some(content) = obj["message"]["content"].as_str().filter(|c| !c.is_empty()) {
                return Some(Ok(BackendEvent::Delta(content.to_string())));
            }
            if obj["done"].as_bool() == Some(true) {
                return Some(Ok(BackendEvent::Usage {
                    prompt_tokens: token_count(&obj["prompt_eval_count"]),
                    completion_tokens: token_count(&obj["eval_count"]),
                }));
            }
            Some(Ok(BackendEvent::Other))
        }
        Provider::OpenAi => {
            // SSE comments and event names carry nothing for us.
            let data = line.strip_prefix("data:")?.trim();
            if data == "[DONE]" {
                return Some(Ok(BackendEvent::Other));
            }
            let obj: Value = match serde_json::from_str(data) {
                Ok(v) => v,
                Err(e) => return Some(Err(BackendError::fatal(format!("Failed to parse SSE chunk: {} | Text: {}", e, data)))),
            };
            if !obj["error"].is_null() {
                let msg = obj["error"]["message"].as_str().unwrap_or("unknown backend error");
                return Some(Err(BackendError::fatal(msg)));
            }
            if let Some(content) = obj["choices"][0]["delta"]["content"].as_str().filter(|c| !c.is_empty()) {
                return Some(Ok(BackendEvent::Delta(content.to_string())));
            }
            if obj["usage"].is_object() {
                return Some(Ok(BackendEvent::Usage {
                    prompt_tokens: token_count(&obj["usage"]["prompt_tokens"]),
                    completion_tokens: token_count(&obj["usage"]["completion_tokens"]),
                }));
            }
            Some(Ok(BackendEvent::Other))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_model_splits_provider() {
        assert_eq!(parse_model("ollama/llama3.2").unwrap(), (Provider::Ollama, "llama3.2".into()));
        assert_eq!(parse_model("xai/grok-2").unwrap().0, Provider::OpenAi);
        assert!(parse_model("llama3.2").is_err());
        assert!(parse_model("gemini/pro").is_err());
    }

    #[test]
    fn unauthorized_and_expired_tokens_are_transient() {
        assert!(classify_failure(StatusCode::UNAUTHORIZED, "").is_transient_auth());
        assert!(
            classify_failure(StatusCode::FORBIDDEN, r#"{"__type":"ExpiredTokenException"}"#)
                .is_transient_auth()
        );
        assert!(!classify_failure(StatusCode::INTERNAL_SERVER_ERROR, "boom").is_transient_auth());
    }

    #[test]
    fn drain_lines_keeps_partial_tail() {
        let mut buf = b"one\ntw".to_vec();
        assert_eq!(drain_lines(&mut buf), vec!["one".to_string()]);
        buf.extend_from_slice("o\n\nthree caf\u{e9}\n".as_bytes());
        assert_eq!(drain_lines(&mut buf), vec!["two".to_string(), "three café".to_string()]);
        assert!(buf.is_empty());
    }

    #[test]
    fn drain_lines_joins_split_utf8() {
        let bytes = "é\n".as_bytes();
        let mut buf = bytes[..1].to_vec();
        assert!(drain_lines(&mut buf).is_empty());
        buf.extend_from_slice(&bytes[1..]);
        assert_eq!(drain_lines(&mut buf), vec!["é".to_string()]);
    }

    #[test]
    fn ollama_lines() {
        let delta = parse_line(Provider::Ollama, r#"{"message":{"role":"assistant","content":"Hi"},"done":false}"#);
        assert_eq!(delta, Some(Ok(BackendEvent::Delta("Hi".into()))));

        let done = parse_line(
            Provider::Ollama,
            r#"{"message":{"role":"assistant","content":""},"done":true,"prompt_eval_count":12,"eval_count":3}"#,
        );
        assert_eq!(done, Some(Ok(BackendEvent::Usage { prompt_tokens: 12, completion_tokens: 3 })));

        assert!(matches!(parse_line(Provider::Ollama, r#"{"error":"model not found"}"#), Some(Err(_))));
        assert!(matches!(parse_line(Provider::Ollama, "not json"), Some(Err(_))));
    }

    #[test]
    fn openai_sse_lines() {
        let delta = parse_line(Provider::OpenAi, r#"data: {"choices":[{"delta":{"content":"Hel"}}]}"#);
        assert_eq!(delta, Some(Ok(BackendEvent::Delta("Hel".into()))));

        let role_only = parse_line(Provider::OpenAi, r#"data: {"choices":[{"delta":{"role":"assistant"}}]}"#);
        assert_eq!(role_only, Some(Ok(BackendEvent::Other)));

        let usage = parse_line(
            Provider::OpenAi,
            r#"data: {"choices":[],"usage":{"prompt_tokens":7,"completion_tokens":2}}"#,
        );
        assert_eq!(usage, Some(Ok(BackendEvent::Usage { prompt_tokens: 7, completion_tokens: 2 })));

        assert_eq!(parse_line(Provider::OpenAi, "data: [DONE]"), Some(Ok(BackendEvent::Other)));
        assert_eq!(parse_line(Provider::OpenAi, ": keep-alive"), None);
    }

    #[test]
    fn oversized_token_counts_saturate() {
        let done = parse_line(
            Provider::Ollama,
            r#"{"done":true,"prompt_eval_count":5000000000,"eval_count":-1}"#,
        );
        assert_eq!(done, Some(Ok(BackendEvent::Usage { prompt_tokens: u32::MAX, completion_tokens: 0 })));
    }

    #[tokio::test]
    async fn body_without_trailing_newline_keeps_last_line() {
        let body = stream::iter(vec![
            Ok::<_, std::io::Error>(b"{\"message\":{\"content\":\"Hel\"}}\n{\"message\":".to_vec()),
            Ok(b"{\"content\":\"lo\"}}".to_vec()),
        ]);
        let events: Vec<_> = parse_body(Provider::Ollama, body).collect().await;
        assert_eq!(
            events,
            vec![Ok(BackendEvent::Delta("Hel".into())), Ok(BackendEvent::Delta("lo".into()))]
        );
    }

    #[tokio::test]
    async fn transport_error_ends_the_body() {
        let body = stream::iter(vec![
            Ok(b"data: {\"choices\":[{\"delta\":{\"content\":\"a\"}}]}\n".to_vec()),
            Err(std::io::Error::other("connection reset")),
            Ok(b"data: {\"choices\":[{\"delta\":{\"content\":\"b\"}}]}\n".to_vec()),
        ]);
        let events: Vec<_> = parse_body(Provider::OpenAi, body).collect().await;
        assert_eq!(events.len(), 2);
        assert_eq!(events[0], Ok(BackendEvent::Delta("a".into())));
        assert!(matches!(&events[1], Err(BackendError::Fatal(msg)) if msg.contains("connection reset")));
    }

    #[test]
    fn payload_prepends_system_prompt() {
        let config = BackendConfig {
            model: "openai/gpt-4o-mini".into(),
            system_prompt: Some("be brief".into()),
            ..BackendConfig::default()
        };
        let client = LlmClient::from_config(&config).unwrap();
        let turns = vec![Turn { role: Role::User, content: "hello".into(), timestamp: 1.0 }];

        let payload = client.payload(&turns);
        assert_eq!(payload["model"], "gpt-4o-mini");
        assert_eq!(payload["stream"], true);
        assert_eq!(payload["messages"][0]["role"], "system");
        assert_eq!(payload["messages"][1], json!({"role": "user", "content": "hello"}));
        assert_eq!(client.url(), "http://localhost:11434/v1/chat/completions");
    }

    #[test]
    fn missing_api_key_variable_fails_build() {
        let config = BackendConfig {
            api_key_env: Some("CHATWIRE_TEST_KEY_THAT_IS_NEVER_SET".into()),
            ..BackendConfig::default()
        };
        assert!(HttpBackendFactory::new(config).build().is_err());
    }
}
