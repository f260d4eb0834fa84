use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use quarry_types::ChatMessage;

pub mod fireworks;
pub mod openrouter;
pub mod reasoning;

pub use fireworks::FireworksClient;
pub use openrouter::OpenRouterClient;

/// Connection pool shape shared by every provider client. Connections
/// survive across hunts within a process but not across restarts.
pub const POOL_MAX_IDLE_PER_HOST: usize = 10;
pub const POOL_KEEPALIVE: Duration = Duration::from_secs(30);
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ProviderSettings {
    pub openrouter_api_key: Option<String>,
    pub openrouter_base_url: Option<String>,
    pub fireworks_api_key: Option<String>,
    pub fireworks_base_url: Option<String>,
}

impl ProviderSettings {
    pub fn from_env() -> Self {
        Self {
            openrouter_api_key: non_empty_env("OPENROUTER_API_KEY"),
            openrouter_base_url: non_empty_env("OPENROUTER_BASE_URL"),
            fireworks_api_key: non_empty_env("FIREWORKS_API_KEY"),
            fireworks_base_url: non_empty_env("FIREWORKS_BASE_URL"),
        }
    }
}

fn non_empty_env(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

/// One model invocation as the orchestrator sees it.
#[derive(Debug, Clone)]
pub struct ModelRequest {
    pub prompt: String,
    pub model: String,
    /// Prior turns, prepended verbatim before the current prompt.
    pub messages_history: Vec<ChatMessage>,
    pub reasoning_budget_percent: f64,
    pub max_retries: u32,
    pub timeout: Option<Duration>,
    pub cancel: CancellationToken,
}

impl ModelRequest {
    pub fn new(prompt: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            model: model.into(),
            messages_history: Vec::new(),
            reasoning_budget_percent: 0.9,
            max_retries: 3,
            timeout: None,
            cancel: CancellationToken::new(),
        }
    }
}

/// What one attempt produced: the answer text and any reasoning trace.
#[derive(Debug, Clone, Default)]
pub struct ModelReply {
    pub response: String,
    pub reasoning: String,
}

/// What a full retried call produced. `error` is set only when every
/// attempt failed or came back empty.
#[derive(Debug, Clone, Default)]
pub struct CallOutcome {
    pub response: String,
    pub reasoning: String,
    pub error: Option<String>,
}

#[async_trait]
pub trait ModelClient: Send + Sync {
    fn provider_id(&self) -> &str;

    fn default_timeout(&self) -> Duration;

    /// Whether `reasoning_budget_percent` changes the request. The buffered
    /// family accepts the parameter but ignores it.
    fn honors_reasoning_budget(&self) -> bool {
        false
    }

    /// A single attempt: call the model once, with reasoning requested or
    /// suppressed, and return whatever text and reasoning came back.
    async fn call_once(
        &self,
        prompt: &str,
        model: &str,
        history: &[ChatMessage],
        include_reasoning: bool,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> anyhow::Result<ModelReply>;

    /// Retry ladder over `call_once`:
    /// 1. non-empty response wins as-is;
    /// 2. reasoning-only replies are returned with the reasoning as the
    ///    response (thinking-only models);
    /// 3. the final attempt runs with reasoning disabled;
    /// 4. if earlier attempts produced reasoning but never an answer, the
    ///    accumulated reasoning is sent back once with a final-answer-only
    ///    instruction;
    /// 5. `2^attempt` seconds of backoff between attempts;
    /// 6. on exhaustion the last error message is reported.
    async fn call_with_retry(&self, request: &ModelRequest) -> CallOutcome {
        let timeout = request.timeout.unwrap_or_else(|| self.default_timeout());
        let max_retries = request.max_retries.max(1);
        let mut last_error: Option<String> = None;
        let mut accumulated_reasoning = String::new();

        for attempt in 0..max_retries {
            let include_reasoning = if self.honors_reasoning_budget() {
                request.reasoning_budget_percent > 0.0 && attempt < max_retries - 1
            } else {
                true
            };

            match self
                .call_once(
                    &request.prompt,
                    &request.model,
                    &request.messages_history,
                    include_reasoning,
                    timeout,
                    &request.cancel,
                )
                .await
            {
                Ok(reply) => {
                    if !reply.reasoning.is_empty() {
                        accumulated_reasoning.push_str(&reply.reasoning);
                        accumulated_reasoning.push('\n');
                    }

                    if !reply.response.trim().is_empty() {
                        return CallOutcome {
                            response: reply.response.trim().to_string(),
                            reasoning: accumulated_reasoning.trim().to_string(),
                            error: None,
                        };
                    }

                    if !reply.reasoning.trim().is_empty() {
                        // Thinking-only model: the reasoning is the answer.
                        return CallOutcome {
                            response: reply.reasoning.trim().to_string(),
                            reasoning: accumulated_reasoning.trim().to_string(),
                            error: None,
                        };
                    }

                    if !accumulated_reasoning.is_empty() && attempt < max_retries - 1 {
                        let retry_prompt = format!(
                            "Based on your previous reasoning:\n\n{accumulated_reasoning}\n\n\
                             Please provide your final response to this question:\n\n{}\n\n\
                             Give only the final answer, no additional reasoning.",
                            request.prompt
                        );
                        match self
                            .call_once(
                                &retry_prompt,
                                &request.model,
                                &request.messages_history,
                                false,
                                timeout,
                                &request.cancel,
                            )
                            .await
                        {
                            Ok(follow_up) if !follow_up.response.trim().is_empty() => {
                                return CallOutcome {
                                    response: follow_up.response.trim().to_string(),
                                    reasoning: accumulated_reasoning.trim().to_string(),
                                    error: None,
                                };
                            }
                            Ok(_) => {}
                            Err(err) => last_error = Some(err.to_string()),
                        }
                    }
                }
                Err(err) => last_error = Some(err.to_string()),
            }

            if attempt < max_retries - 1 {
                tokio::time::sleep(Duration::from_secs(1 << attempt)).await;
            }
        }

        warn!(
            provider = self.provider_id(),
            model = %request.model,
            error = last_error.as_deref().unwrap_or("empty response"),
            "model call exhausted retries"
        );
        CallOutcome {
            response: String::new(),
            reasoning: accumulated_reasoning.trim().to_string(),
            error: Some(
                last_error.unwrap_or_else(|| "Empty response after all retries".to_string()),
            ),
        }
    }
}

/// The configured provider clients, selected by id at call time.
pub struct ModelGateway {
    clients: Vec<Arc<dyn ModelClient>>,
}

impl ModelGateway {
    pub fn new(settings: &ProviderSettings) -> Self {
        let clients: Vec<Arc<dyn ModelClient>> = vec![
            Arc::new(OpenRouterClient::new(
                settings.openrouter_api_key.clone(),
                settings.openrouter_base_url.clone(),
            )),
            Arc::new(FireworksClient::new(
                settings.fireworks_api_key.clone(),
                settings.fireworks_base_url.clone(),
            )),
        ];
        Self { clients }
    }

    pub fn from_clients(clients: Vec<Arc<dyn ModelClient>>) -> Self {
        Self { clients }
    }

    pub fn client(&self, provider_id: &str) -> anyhow::Result<Arc<dyn ModelClient>> {
        let available = self
            .clients
            .iter()
            .map(|c| c.provider_id().to_string())
            .collect::<Vec<_>>();
        self.clients
            .iter()
            .find(|c| c.provider_id() == provider_id)
            .cloned()
            .ok_or_else(|| {
                anyhow::anyhow!(
                    "provider `{}` is not configured. configured providers: {}",
                    provider_id,
                    available.join(", ")
                )
            })
    }
}

pub(crate) fn pooled_http_client() -> reqwest::Client {
    reqwest::Client::builder()
        .pool_max_idle_per_host(POOL_MAX_IDLE_PER_HOST)
        .pool_idle_timeout(POOL_KEEPALIVE)
        .connect_timeout(CONNECT_TIMEOUT)
        .build()
        .unwrap_or_default()
}

/// Provider-reported errors arrive either as `{"error": {"message": ...}}`
/// or a bare `{"message": ...}`.
pub(crate) fn extract_api_error(value: &serde_json::Value) -> Option<String> {
    value
        .get("error")
        .map(|err| {
            err.get("message")
                .and_then(|m| m.as_str())
                .map(|s| s.to_string())
                .unwrap_or_else(|| err.to_string())
        })
        .or_else(|| {
            value
                .get("message")
                .and_then(|m| m.as_str())
                .map(|s| s.to_string())
        })
}

pub(crate) fn truncate_for_error(input: &str, max_len: usize) -> String {
    if input.len() <= max_len {
        input.to_string()
    } else {
        let mut end = max_len;
        while !input.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}...", &input[..end])
    }
}
