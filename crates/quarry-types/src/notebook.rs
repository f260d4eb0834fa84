use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }
}

/// The task bundle handed over by the ingestion collaborator.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Notebook {
    #[serde(default)]
    pub prompt: String,
    /// The expected "gold" answer, used as reference context by the judge.
    #[serde(default)]
    pub response: String,
    /// Grading criteria as a JSON array embedded in free text.
    #[serde(default)]
    pub response_reference: String,
    pub judge_system_prompt: Option<String>,
    pub judge_prompt_template: Option<String>,
    #[serde(default)]
    pub model_slots: Vec<String>,
    #[serde(default)]
    pub metadata: Value,
}
