use std::collections::BTreeMap;
use std::str;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use quarry_types::ChatMessage;

use crate::reasoning::merge_tag_reasoning;
use crate::{extract_api_error, pooled_http_client, truncate_for_error, ModelClient, ModelReply};

const DEFAULT_BASE_URL: &str = "https://openrouter.ai/api/v1/chat/completions";
const DEFAULT_MAX_TOKENS: u64 = 8192;

const MODEL_ALIASES: [(&str, &str); 2] = [
    ("nemotron", "nvidia/nemotron-3-nano-30b-a3b"),
    ("qwen3", "qwen/qwen3-235b-a22b-thinking-2507"),
];

const MAX_TOKENS: [(&str, u64); 2] = [
    ("nvidia/nemotron-3-nano-30b-a3b", 32_768),
    ("qwen/qwen3-235b-a22b-thinking-2507", 131_072),
];

const NEMOTRON_SYSTEM_PROMPT: &str = "Always put your reasoning inside <think></think> tags \
first, then give your final answer after the closing tag. Do not include any reasoning outside \
the tags.";

/// Streaming-with-reasoning provider family (OpenRouter-class).
pub struct OpenRouterClient {
    api_key: Option<String>,
    base_url: String,
    client: reqwest::Client,
}

impl OpenRouterClient {
    pub fn new(api_key: Option<String>, base_url: Option<String>) -> Self {
        Self {
            api_key,
            base_url: base_url.unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            client: pooled_http_client(),
        }
    }

    fn resolve_model(model: &str) -> String {
        let lowered = model.to_lowercase();
        MODEL_ALIASES
            .iter()
            .find(|(alias, _)| *alias == lowered)
            .map(|(_, full)| full.to_string())
            .unwrap_or_else(|| model.to_string())
    }

    fn max_tokens_for(model: &str) -> u64 {
        MAX_TOKENS
            .iter()
            .find(|(id, _)| *id == model)
            .map(|(_, tokens)| *tokens)
            .unwrap_or(DEFAULT_MAX_TOKENS)
    }

    fn build_payload(
        prompt: &str,
        model: &str,
        history: &[ChatMessage],
        include_reasoning: bool,
    ) -> Value {
        let is_nemotron = model.to_lowercase().contains("nemotron");
        let mut messages = Vec::new();
        if is_nemotron {
            messages.push(json!({"role": "system", "content": NEMOTRON_SYSTEM_PROMPT}));
        }
        for message in history {
            messages.push(json!({"role": message.role, "content": message.content}));
        }
        messages.push(json!({"role": "user", "content": prompt}));

        let mut payload = json!({
            "model": model,
            "messages": messages,
            "max_tokens": Self::max_tokens_for(model),
            "stream": true,
            "temperature": if is_nemotron { 0.6 } else { 0.8 },
        });
        payload["reasoning"] = if include_reasoning {
            json!({"exclude": false, "effort": "high"})
        } else {
            json!({"exclude": true})
        };
        payload
    }
}

#[async_trait]
impl ModelClient for OpenRouterClient {
    fn provider_id(&self) -> &str {
        "openrouter"
    }

    fn default_timeout(&self) -> Duration {
        // Thinking models stream slowly; allow the full trace to arrive.
        Duration::from_secs(180)
    }

    fn honors_reasoning_budget(&self) -> bool {
        true
    }

    async fn call_once(
        &self,
        prompt: &str,
        model: &str,
        history: &[ChatMessage],
        include_reasoning: bool,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> anyhow::Result<ModelReply> {
        let api_key = self
            .api_key
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("OpenRouter API key not configured"))?;
        let model = Self::resolve_model(model);
        let payload = Self::build_payload(prompt, &model, history, include_reasoning);

        let response = self
            .client
            .post(&self.base_url)
            .bearer_auth(api_key)
            .header("HTTP-Referer", "http://localhost:8000")
            .header("X-Title", "Quarry")
            .timeout(timeout)
            .json(&payload)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("HTTP {}: {}", status.as_u16(), truncate_for_error(&body, 500));
        }

        let mut bytes = response.bytes_stream();
        let mut buffer = String::new();
        let mut collector = StreamCollector::new();
        let mut done = false;

        'read: while let Some(chunk) = bytes.next().await {
            if cancel.is_cancelled() {
                // Dropping the stream closes the connection.
                break;
            }
            let chunk = chunk?;
            buffer.push_str(str::from_utf8(&chunk).unwrap_or_default());

            while let Some(pos) = buffer.find("\n\n") {
                let frame = buffer[..pos].to_string();
                buffer = buffer[pos + 2..].to_string();
                for line in frame.lines() {
                    let Some(payload) = line.strip_prefix("data: ") else {
                        continue;
                    };
                    let payload = payload.trim();
                    if payload == "[DONE]" {
                        done = true;
                        break 'read;
                    }
                    let Ok(value) = serde_json::from_str::<Value>(payload) else {
                        continue;
                    };
                    collector.absorb(&value)?;
                }
            }
        }
        if !done {
            debug!(model = %model, "openrouter stream ended without [DONE]");
        }

        let (response_text, reasoning) = collector.finish();
        Ok(ModelReply {
            response: response_text,
            reasoning,
        })
    }
}

/// Accumulates streamed chunks into `(response, reasoning)`.
///
/// Reasoning precedence: a complete `reasoning_details` array on a final
/// message is authoritative and replaces the deltas; otherwise details
/// collected from deltas, deduplicated by id keeping the longest text per
/// id (chunks may carry cumulative text); otherwise incremental
/// `reasoning`/`thinking` fields; otherwise `<think>` tags parsed out of
/// the content.
#[derive(Debug, Default)]
pub(crate) struct StreamCollector {
    response: String,
    incremental_reasoning: String,
    reasoning_by_id: BTreeMap<String, String>,
    final_details: Option<Vec<Value>>,
}

impl StreamCollector {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn absorb(&mut self, chunk: &Value) -> anyhow::Result<()> {
        if let Some(detail) = extract_api_error(chunk) {
            anyhow::bail!("API Error: {detail}");
        }

        let choices = chunk
            .get("choices")
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default();
        for choice in choices {
            let delta = choice.get("delta");
            let message = choice.get("message");

            if let Some(details) = message
                .and_then(|m| m.get("reasoning_details"))
                .and_then(|v| v.as_array())
            {
                if !details.is_empty() {
                    self.final_details = Some(details.clone());
                }
            }

            if let Some(delta) = delta {
                if self.final_details.is_none() {
                    if let Some(details) = delta.get("reasoning_details").and_then(|v| v.as_array())
                    {
                        for detail in details {
                            let Some(id) = detail.get("id").and_then(|v| v.as_str()) else {
                                continue;
                            };
                            let Some(text) = detail.get("text").and_then(|v| v.as_str()) else {
                                continue;
                            };
                            if text.is_empty() {
                                continue;
                            }
                            let entry = self.reasoning_by_id.entry(id.to_string()).or_default();
                            if text.len() > entry.len() {
                                *entry = text.to_string();
                            }
                        }
                    }
                    if let Some(text) = delta.get("reasoning").and_then(|v| v.as_str()) {
                        self.incremental_reasoning.push_str(text);
                    }
                    if let Some(text) = delta.get("thinking").and_then(|v| v.as_str()) {
                        self.incremental_reasoning.push_str(text);
                    }
                }

                if let Some(text) = delta.get("content").and_then(|v| v.as_str()) {
                    self.response.push_str(text);
                }
            }

            if let Some(message) = message {
                if self.final_details.is_none() {
                    if let Some(text) = message.get("reasoning").and_then(|v| v.as_str()) {
                        self.incremental_reasoning.push_str(text);
                    } else if let Some(text) = message.get("thinking").and_then(|v| v.as_str()) {
                        self.incremental_reasoning.push_str(text);
                    }
                }
            }
        }
        Ok(())
    }

    pub(crate) fn finish(self) -> (String, String) {
        let reasoning = if let Some(details) = self.final_details {
            details
                .iter()
                .filter_map(|d| d.get("text").and_then(|v| v.as_str()))
                .collect::<String>()
        } else if !self.reasoning_by_id.is_empty() {
            self.reasoning_by_id.values().cloned().collect::<String>()
        } else {
            self.incremental_reasoning
        };

        let response = self.response.trim().to_string();
        let reasoning = reasoning.trim().to_string();
        let (response, reasoning) = merge_tag_reasoning(response, reasoning);
        (response.trim().to_string(), reasoning.trim().to_string())
    }
}
