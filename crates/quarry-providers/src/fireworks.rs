use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use quarry_types::ChatMessage;

use crate::reasoning::parse_think_tags;
use crate::{extract_api_error, pooled_http_client, truncate_for_error, ModelClient, ModelReply};

const DEFAULT_BASE_URL: &str = "https://api.fireworks.ai/inference/v1/chat/completions";
const MAX_TOKENS: u64 = 8192;

/// Fireworks rejects reasoning request parameters, so the reasoning split
/// is prompted instead: the model is told to frame its thinking in
/// `<think>` tags and answer after the closing tag.
const SYSTEM_PROMPT: &str = "You MUST format your response in exactly this structure:\n\n\
<think>\n[Your step-by-step reasoning, analysis, and thought process goes here]\n</think>\n\n\
[Your final answer goes here - concise and direct]\n\n\
CRITICAL: Always use <think> and </think> tags to wrap your reasoning. Your final answer must \
come AFTER the </think> tag.";

/// Buffered-with-prompted-format provider family (Fireworks-class).
pub struct FireworksClient {
    api_key: Option<String>,
    base_url: String,
    client: reqwest::Client,
}

impl FireworksClient {
    pub fn new(api_key: Option<String>, base_url: Option<String>) -> Self {
        Self {
            api_key,
            base_url: base_url.unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            client: pooled_http_client(),
        }
    }

    fn build_payload(prompt: &str, model: &str, history: &[ChatMessage]) -> Value {
        let mut messages = vec![json!({"role": "system", "content": SYSTEM_PROMPT})];
        for message in history {
            messages.push(json!({"role": message.role, "content": message.content}));
        }
        let user_message = format!(
            "Question: {prompt}\n\nRemember: Put ALL your thinking inside <think>...</think> \
             tags, then give your final answer after."
        );
        messages.push(json!({"role": "user", "content": user_message}));

        json!({
            "model": model,
            "messages": messages,
            "max_tokens": MAX_TOKENS,
            "temperature": 0.6,
            "stream": false,
        })
    }
}

#[async_trait]
impl ModelClient for FireworksClient {
    fn provider_id(&self) -> &str {
        "fireworks"
    }

    fn default_timeout(&self) -> Duration {
        Duration::from_secs(120)
    }

    async fn call_once(
        &self,
        prompt: &str,
        model: &str,
        history: &[ChatMessage],
        _include_reasoning: bool,
        timeout: Duration,
        _cancel: &CancellationToken,
    ) -> anyhow::Result<ModelReply> {
        let api_key = self
            .api_key
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("Fireworks API key not configured"))?;
        let payload = Self::build_payload(prompt, model, history);

        let response = self
            .client
            .post(&self.base_url)
            .bearer_auth(api_key)
            .header("Accept", "application/json")
            .timeout(timeout)
            .json(&payload)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!(
                "Fireworks API Error {}: {}",
                status.as_u16(),
                truncate_for_error(&body, 500)
            );
        }

        let data: Value = response.json().await?;
        if let Some(detail) = extract_api_error(&data) {
            anyhow::bail!("API Error: {detail}");
        }

        let Some(message) = data
            .get("choices")
            .and_then(|v| v.as_array())
            .and_then(|choices| choices.first())
            .and_then(|choice| choice.get("message"))
        else {
            return Ok(ModelReply::default());
        };
        let (response_text, reasoning) = extract_buffered_reply(message);
        Ok(ModelReply {
            response: response_text,
            reasoning,
        })
    }
}

/// Reasoning extraction ladder for buffered responses, in priority order:
/// `reasoning_content`, `reasoning_details[].text`, `reasoning`/`thinking`,
/// `<think>…</think>` tags in the content, then a bare `</think>` split.
pub(crate) fn extract_buffered_reply(message: &Value) -> (String, String) {
    let mut response_text = message
        .get("content")
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string();

    let mut reasoning = message
        .get("reasoning_content")
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string();

    if reasoning.is_empty() {
        if let Some(details) = message.get("reasoning_details").and_then(|v| v.as_array()) {
            reasoning = details
                .iter()
                .filter_map(|d| d.get("text").and_then(|v| v.as_str()))
                .collect();
        }
    }

    if reasoning.is_empty() {
        reasoning = message
            .get("reasoning")
            .and_then(|v| v.as_str())
            .or_else(|| message.get("thinking").and_then(|v| v.as_str()))
            .unwrap_or_default()
            .to_string();
    }

    if reasoning.is_empty() {
        let (cleaned, extracted) = parse_think_tags(&response_text);
        if !extracted.is_empty() {
            response_text = cleaned;
            reasoning = extracted;
        }
    }

    // Some models emit only the closing tag; everything before it is the
    // trace, whatever follows (possibly nothing) is the answer.
    if reasoning.is_empty() {
        if let Some(idx) = response_text.find("</think>") {
            let mut head = response_text[..idx].trim().to_string();
            let tail = response_text[idx + "</think>".len()..].trim().to_string();
            if let Some(stripped) = head.strip_prefix("<think>") {
                head = stripped.trim().to_string();
            }
            if !head.is_empty() {
                reasoning = head;
                response_text = tail;
            }
        }
    }

    (
        response_text.trim().to_string(),
        reasoning.trim().to_string(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_demands_think_framing() {
        let payload = FireworksClient::build_payload("What is 2+2?", "accounts/fireworks/models/qwen3", &[]);
        let messages = payload["messages"].as_array().unwrap();
        assert_eq!(messages[0]["role"], "system");
        assert!(messages[0]["content"]
            .as_str()
            .unwrap()
            .contains("<think>"));
        assert!(messages[1]["content"]
            .as_str()
            .unwrap()
            .starts_with("Question: What is 2+2?"));
        assert_eq!(payload["stream"], false);
        assert_eq!(payload["max_tokens"], 8192);
    }

    #[test]
    fn history_sits_between_system_and_prompt() {
        let history = vec![
            ChatMessage::user("Turn 1 prompt"),
            ChatMessage::assistant("Turn 1 reply"),
        ];
        let payload = FireworksClient::build_payload("Turn 2 prompt", "m", &history);
        let messages = payload["messages"].as_array().unwrap();
        assert_eq!(messages.len(), 4);
        assert_eq!(messages[1]["content"], "Turn 1 prompt");
        assert_eq!(messages[2]["role"], "assistant");
    }

    #[test]
    fn reasoning_content_field_wins() {
        let message = json!({
            "content": "The answer is 4.",
            "reasoning_content": "compute the sum",
            "reasoning": "ignored",
        });
        let (response, reasoning) = extract_buffered_reply(&message);
        assert_eq!(response, "The answer is 4.");
        assert_eq!(reasoning, "compute the sum");
    }

    #[test]
    fn reasoning_details_are_second_priority() {
        let message = json!({
            "content": "Answer",
            "reasoning_details": [{"text": "part one "}, {"text": "part two"}],
        });
        let (_, reasoning) = extract_buffered_reply(&message);
        assert_eq!(reasoning, "part one part two");
    }

    #[test]
    fn direct_fields_are_third_priority() {
        let message = json!({"content": "Answer", "thinking": "quiet thoughts"});
        let (_, reasoning) = extract_buffered_reply(&message);
        assert_eq!(reasoning, "quiet thoughts");
    }

    #[test]
    fn think_tags_are_parsed_out_of_content() {
        let message = json!({"content": "<think>sum the numbers</think>\n\nThe answer is 4."});
        let (response, reasoning) = extract_buffered_reply(&message);
        assert_eq!(response, "The answer is 4.");
        assert_eq!(reasoning, "sum the numbers");
    }

    #[test]
    fn bare_closing_tag_splits_trace_from_answer() {
        let message = json!({"content": "all my reasoning</think>\n\nFinal answer"});
        let (response, reasoning) = extract_buffered_reply(&message);
        assert_eq!(response, "Final answer");
        assert_eq!(reasoning, "all my reasoning");
    }

    #[test]
    fn closing_tag_with_no_answer_leaves_reasoning_only() {
        let message = json!({"content": "just reasoning, no answer</think>"});
        let (response, reasoning) = extract_buffered_reply(&message);
        assert!(response.is_empty());
        assert_eq!(reasoning, "just reasoning, no answer");
    }

    #[test]
    fn plain_content_passes_through() {
        let message = json!({"content": "Plain answer"});
        let (response, reasoning) = extract_buffered_reply(&message);
        assert_eq!(response, "Plain answer");
        assert!(reasoning.is_empty());
    }
}
