//! HTTP backend: a single upstream call per attempt, with the payload and
//! extraction rules selected by the provider's dialect.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use super::{estimate_tokens, Backend, BackendResult, ExecContext, HealthProbe};
use crate::config::{ConfigError, CostPer1k, ProviderConfig};
use crate::types::{BackendKind, RequestRecord, TokenUsage};

const MAX_ERROR_BODY_BYTES: usize = 16 * 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Dialect {
    Anthropic,
    OpenAi,
    Gemini,
}

impl Dialect {
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "anthropic" => Some(Self::Anthropic),
            "openai" => Some(Self::OpenAi),
            "gemini" => Some(Self::Gemini),
            _ => None,
        }
    }
}

pub struct HttpApiBackend {
    url: String,
    dialect: Dialect,
    client: reqwest::Client,
    api_key: Option<String>,
    api_key_env: Option<String>,
    extra_headers: BTreeMap<String, String>,
    model: Option<String>,
    max_tokens: Option<u32>,
    cost_per_1k: Option<CostPer1k>,
}

impl HttpApiBackend {
    pub fn from_config(config: &ProviderConfig) -> Result<Self, ConfigError> {
        let url = config
            .api_base_url
            .clone()
            .ok_or_else(|| ConfigError::Invalid {
                reason: format!("http provider {} is missing api_base_url", config.name),
            })?;
        let dialect = config
            .dialect
            .as_deref()
            .and_then(Dialect::parse)
            .ok_or_else(|| ConfigError::Invalid {
                reason: format!("http provider {} has no usable dialect", config.name),
            })?;
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|err| ConfigError::Invalid {
                reason: format!("http client for {}: {err}", config.name),
            })?;
        let api_key = config
            .api_key_env
            .as_deref()
            .and_then(|name| std::env::var(name).ok())
            .filter(|value| !value.is_empty());
        Ok(Self {
            url,
            dialect,
            client,
            api_key,
            api_key_env: config.api_key_env.clone(),
            extra_headers: config.extra_headers.clone(),
            model: config.model.clone(),
            max_tokens: config.max_tokens,
            cost_per_1k: config.cost_per_1k,
        })
    }

    fn build_body(&self, request: &RequestRecord) -> Value {
        let model = request
            .model
            .as_deref()
            .or(self.model.as_deref())
            .unwrap_or("default");
        match self.dialect {
            Dialect::OpenAi => {
                let mut messages = Vec::new();
                if let Some(agent) = &request.agent {
                    messages.push(json!({"role": "system", "content": agent}));
                }
                messages.push(json!({"role": "user", "content": request.prompt}));
                let mut body = json!({"model": model, "messages": messages});
                if let Some(max_tokens) = self.max_tokens {
                    body["max_tokens"] = json!(max_tokens);
                }
                body
            }
            Dialect::Anthropic => {
                let mut body = json!({
                    "model": model,
                    "max_tokens": self.max_tokens.unwrap_or(1024),
                    "messages": [{"role": "user", "content": request.prompt}],
                });
                if let Some(agent) = &request.agent {
                    body["system"] = json!(agent);
                }
                body
            }
            Dialect::Gemini => {
                let mut body = json!({
                    "contents": [{"parts": [{"text": request.prompt}]}],
                });
                if let Some(agent) = &request.agent {
                    body["systemInstruction"] = json!({"parts": [{"text": agent}]});
                }
                body
            }
        }
    }

    fn apply_auth(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        let mut builder = builder;
        if let Some(key) = &self.api_key {
            builder = match self.dialect {
                Dialect::OpenAi => builder.header("authorization", format!("Bearer {key}")),
                Dialect::Anthropic => builder
                    .header("x-api-key", key)
                    .header("anthropic-version", "2023-06-01"),
                Dialect::Gemini => builder.header("x-goog-api-key", key),
            };
        }
        for (name, value) in &self.extra_headers {
            builder = builder.header(name, value);
        }
        builder
    }

    fn extract(&self, body: &Value, request: &RequestRecord) -> Option<(String, Option<String>, TokenUsage)> {
        match self.dialect {
            Dialect::OpenAi => {
                let text = body
                    .get("choices")?
                    .get(0)?
                    .get("message")?
                    .get("content")?
                    .as_str()?
                    .to_string();
                let tokens = body.get("usage").map(|usage| TokenUsage {
                    input: usage["prompt_tokens"].as_u64().unwrap_or(0) as u32,
                    output: usage["completion_tokens"].as_u64().unwrap_or(0) as u32,
                    total: usage["total_tokens"].as_u64().unwrap_or(0) as u32,
                });
                Some((text.clone(), None, tokens.unwrap_or_else(|| fallback_usage(request, &text))))
            }
            Dialect::Anthropic => {
                let content = body.get("content")?.as_array()?;
                let mut text = String::new();
                let mut thinking = String::new();
                for part in content {
                    match part.get("type").and_then(Value::as_str) {
                        Some("text") => {
                            if let Some(piece) = part.get("text").and_then(Value::as_str) {
                                text.push_str(piece);
                            }
                        }
                        Some("thinking") => {
                            if let Some(piece) = part.get("thinking").and_then(Value::as_str) {
                                thinking.push_str(piece);
                            }
                        }
                        _ => {}
                    }
                }
                let tokens = body.get("usage").map(|usage| {
                    let input = usage["input_tokens"].as_u64().unwrap_or(0) as u32;
                    let output = usage["output_tokens"].as_u64().unwrap_or(0) as u32;
                    TokenUsage::new(input, output)
                });
                let thinking = (!thinking.is_empty()).then_some(thinking);
                Some((
                    text.clone(),
                    thinking,
                    tokens.unwrap_or_else(|| fallback_usage(request, &text)),
                ))
            }
            Dialect::Gemini => {
                let parts = body
                    .get("candidates")?
                    .get(0)?
                    .get("content")?
                    .get("parts")?
                    .as_array()?;
                let mut text = String::new();
                for part in parts {
                    if let Some(piece) = part.get("text").and_then(Value::as_str) {
                        text.push_str(piece);
                    }
                }
                let tokens = body.get("usageMetadata").map(|usage| TokenUsage {
                    input: usage["promptTokenCount"].as_u64().unwrap_or(0) as u32,
                    output: usage["candidatesTokenCount"].as_u64().unwrap_or(0) as u32,
                    total: usage["totalTokenCount"].as_u64().unwrap_or(0) as u32,
                });
                Some((
                    text.clone(),
                    None,
                    tokens.unwrap_or_else(|| fallback_usage(request, &text)),
                ))
            }
        }
    }

    fn cost_for(&self, tokens: &TokenUsage) -> f64 {
        let Some(cost) = self.cost_per_1k else {
            return 0.0;
        };
        (tokens.input as f64 / 1000.0) * cost.input + (tokens.output as f64 / 1000.0) * cost.output
    }
}

fn fallback_usage(request: &RequestRecord, text: &str) -> TokenUsage {
    TokenUsage::new(estimate_tokens(&request.prompt), estimate_tokens(text))
}

#[async_trait]
impl Backend for HttpApiBackend {
    async fn execute(&self, request: &RequestRecord, ctx: &ExecContext) -> BackendResult {
        if self.api_key_env.is_some() && self.api_key.is_none() {
            tracing::info!(
                env = self.api_key_env.as_deref().unwrap_or_default(),
                "api key env var is not set"
            );
            return BackendResult::AuthRequired { hint_url: None };
        }

        let body = self.build_body(request);
        let builder = self.apply_auth(self.client.post(&self.url).json(&body));

        let send = async {
            builder
                .timeout(ctx.remaining().max(Duration::from_millis(1)))
                .send()
                .await
        };
        let response = tokio::select! {
            _ = ctx.cancel.cancelled() => {
                return BackendResult::Transient {
                    message: "request cancelled".to_string(),
                };
            }
            result = send => match result {
                Ok(response) => response,
                Err(err) => {
                    return BackendResult::Transient {
                        message: format!("request failed: {err}"),
                    };
                }
            },
        };

        let status = response.status();
        if status.as_u16() == 401 || status.as_u16() == 403 {
            return BackendResult::AuthRequired { hint_url: None };
        }
        if status.as_u16() == 429 {
            let retry_after_s = response
                .headers()
                .get("retry-after")
                .and_then(|value| value.to_str().ok())
                .and_then(|value| value.parse::<u64>().ok());
            return BackendResult::RateLimited { retry_after_s };
        }
        if status.is_server_error() {
            let body = truncated_body(response).await;
            return BackendResult::Transient {
                message: format!("upstream status {status}: {body}"),
            };
        }
        if !status.is_success() {
            let body = truncated_body(response).await;
            return BackendResult::Permanent {
                message: format!("upstream status {status}: {body}"),
            };
        }

        let parsed: Value = match response.json().await {
            Ok(value) => value,
            Err(err) => {
                return BackendResult::Transient {
                    message: format!("failed to read upstream body: {err}"),
                };
            }
        };
        match self.extract(&parsed, request) {
            Some((text, thinking, tokens)) => {
                let cost_usd = self.cost_for(&tokens);
                BackendResult::Success {
                    text,
                    thinking,
                    tokens,
                    cost_usd,
                }
            }
            None => BackendResult::Permanent {
                message: "upstream response did not match the expected dialect shape".to_string(),
            },
        }
    }

    async fn health_check(&self, _ctx: &ExecContext) -> HealthProbe {
        let probe = self
            .client
            .get(&self.url)
            .timeout(Duration::from_secs(5))
            .send()
            .await;
        match probe {
            Ok(response) if response.status().is_server_error() => {
                HealthProbe::Degraded(format!("upstream status {}", response.status()))
            }
            Ok(_) => HealthProbe::Ok,
            Err(err) => HealthProbe::Down(format!("unreachable: {err}")),
        }
    }

    fn estimated_cost(&self, request: &RequestRecord) -> f64 {
        let Some(cost) = self.cost_per_1k else {
            return 0.0;
        };
        (estimate_tokens(&request.prompt) as f64 / 1000.0) * cost.input
    }

    fn kind(&self) -> BackendKind {
        BackendKind::HttpApi
    }

    fn describe_call(&self, _request: &RequestRecord) -> Option<String> {
        Some(format!("POST {}", self.url))
    }
}

async fn truncated_body(response: reqwest::Response) -> String {
    match response.text().await {
        Ok(mut body) => {
            if body.len() > MAX_ERROR_BODY_BYTES {
                body.truncate(MAX_ERROR_BODY_BYTES);
            }
            body
        }
        Err(_) => String::from("<unreadable body>"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{now_millis, RequestStatus};

    fn request(prompt: &str) -> RequestRecord {
        let now = now_millis();
        RequestRecord {
            id: "r1".to_string(),
            provider: "p".to_string(),
            model: None,
            agent: None,
            prompt: prompt.to_string(),
            priority: 0,
            status: RequestStatus::Queued,
            attempts: 0,
            fingerprint: "fp".to_string(),
            bypass_cache: false,
            api_key_id: None,
            parent_id: None,
            worker: None,
            submitted_at_ms: now,
            deadline_ms: now + 30_000,
            updated_at_ms: now,
        }
    }

    fn backend(dialect: &str) -> HttpApiBackend {
        let config: ProviderConfig = serde_json::from_value(serde_json::json!({
            "name": "p",
            "backend_type": "http_api",
            "api_base_url": "http://127.0.0.1:9/upstream",
            "dialect": dialect,
            "model": "test-model",
        }))
        .expect("provider config");
        HttpApiBackend::from_config(&config).expect("backend")
    }

    #[test]
    fn openai_extraction_reads_choices_and_usage() {
        let body = serde_json::json!({
            "choices": [{"message": {"content": "hi"}}],
            "usage": {"prompt_tokens": 3, "completion_tokens": 1, "total_tokens": 4},
        });
        let (text, thinking, tokens) = backend("openai")
            .extract(&body, &request("hello"))
            .expect("extract");
        assert_eq!(text, "hi");
        assert!(thinking.is_none());
        assert_eq!(tokens.total, 4);
    }

    #[test]
    fn anthropic_extraction_collects_text_and_thinking() {
        let body = serde_json::json!({
            "content": [
                {"type": "thinking", "thinking": "hmm"},
                {"type": "text", "text": "answer"},
            ],
            "usage": {"input_tokens": 10, "output_tokens": 5},
        });
        let (text, thinking, tokens) = backend("anthropic")
            .extract(&body, &request("hello"))
            .expect("extract");
        assert_eq!(text, "answer");
        assert_eq!(thinking.as_deref(), Some("hmm"));
        assert_eq!(tokens.total, 15);
    }

    #[test]
    fn gemini_extraction_concatenates_parts() {
        let body = serde_json::json!({
            "candidates": [{"content": {"parts": [{"text": "a"}, {"text": "b"}]}}],
            "usageMetadata": {"promptTokenCount": 2, "candidatesTokenCount": 2, "totalTokenCount": 4},
        });
        let (text, _, tokens) = backend("gemini")
            .extract(&body, &request("hello"))
            .expect("extract");
        assert_eq!(text, "ab");
        assert_eq!(tokens.total, 4);
    }

    #[test]
    fn missing_usage_falls_back_to_estimation() {
        let body = serde_json::json!({
            "choices": [{"message": {"content": "four char"}}],
        });
        let (_, _, tokens) = backend("openai")
            .extract(&body, &request("abcdefgh"))
            .expect("extract");
        assert_eq!(tokens.input, estimate_tokens("abcdefgh"));
        assert_eq!(tokens.output, estimate_tokens("four char"));
    }

    #[test]
    fn malformed_body_yields_none() {
        let body = serde_json::json!({"unexpected": true});
        assert!(backend("openai").extract(&body, &request("x")).is_none());
        assert!(backend("gemini").extract(&body, &request("x")).is_none());
    }

    #[test]
    fn request_bodies_carry_agent_roles() {
        let mut req = request("hello");
        req.agent = Some("reviewer".to_string());
        let body = backend("openai").build_body(&req);
        assert_eq!(body["messages"][0]["role"], "system");
        let body = backend("anthropic").build_body(&req);
        assert_eq!(body["system"], "reviewer");
    }
}
