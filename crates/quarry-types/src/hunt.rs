use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::notebook::{ChatMessage, Notebook};

pub const MAX_PARALLEL_WORKERS: usize = 16;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum HuntStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ReviewStatus {
    Draft,
    Submitted,
    Returned,
    Approved,
    Rejected,
    Escalated,
}

impl ReviewStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ReviewStatus::Draft => "draft",
            ReviewStatus::Submitted => "submitted",
            ReviewStatus::Returned => "returned",
            ReviewStatus::Approved => "approved",
            ReviewStatus::Rejected => "rejected",
            ReviewStatus::Escalated => "escalated",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum CriterionVerdict {
    #[serde(rename = "PASS")]
    Pass,
    #[serde(rename = "FAIL")]
    Fail,
    #[serde(rename = "MISSING")]
    Missing,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HuntConfig {
    #[serde(default = "default_parallel_workers")]
    pub parallel_workers: usize,
    #[serde(default = "default_target_breaks")]
    pub target_breaks: usize,
    #[serde(default = "default_models")]
    pub models: Vec<String>,
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_judge_model")]
    pub judge_model: String,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_reasoning_budget")]
    pub reasoning_budget_percent: f64,
    #[serde(default)]
    pub conversation_history: Vec<ChatMessage>,
    /// Max hunt id ever assigned in this session; the next run's ids are
    /// `hunt_offset+1 ..= hunt_offset+parallel_workers`.
    #[serde(default)]
    pub hunt_offset: u64,
}

fn default_parallel_workers() -> usize {
    4
}

fn default_target_breaks() -> usize {
    1
}

fn default_models() -> Vec<String> {
    vec!["nvidia/nemotron-3-nano-30b-a3b".to_string()]
}

fn default_provider() -> String {
    "openrouter".to_string()
}

fn default_judge_model() -> String {
    "gpt-5".to_string()
}

fn default_max_retries() -> u32 {
    3
}

fn default_reasoning_budget() -> f64 {
    0.9
}

impl Default for HuntConfig {
    fn default() -> Self {
        Self {
            parallel_workers: default_parallel_workers(),
            target_breaks: default_target_breaks(),
            models: default_models(),
            provider: default_provider(),
            judge_model: default_judge_model(),
            max_retries: default_max_retries(),
            reasoning_budget_percent: default_reasoning_budget(),
            conversation_history: Vec::new(),
            hunt_offset: 0,
        }
    }
}

impl HuntConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.parallel_workers == 0 || self.parallel_workers > MAX_PARALLEL_WORKERS {
            return Err(format!(
                "parallel_workers must be in 1..={MAX_PARALLEL_WORKERS}, got {}",
                self.parallel_workers
            ));
        }
        if self.target_breaks == 0 || self.target_breaks > self.parallel_workers {
            return Err(format!(
                "target_breaks must be in 1..={}, got {}",
                self.parallel_workers, self.target_breaks
            ));
        }
        if self.models.is_empty() {
            return Err("models must not be empty".to_string());
        }
        if !(0.0..=1.0).contains(&self.reasoning_budget_percent) {
            return Err(format!(
                "reasoning_budget_percent must be in [0, 1], got {}",
                self.reasoning_budget_percent
            ));
        }
        Ok(())
    }
}

/// One model attempt: one model call plus one judge call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HuntResult {
    pub hunt_id: u64,
    pub model: String,
    pub status: HuntStatus,
    #[serde(default)]
    pub response: String,
    #[serde(default)]
    pub reasoning_trace: String,
    pub judge_score: Option<u8>,
    #[serde(default)]
    pub judge_criteria: BTreeMap<String, CriterionVerdict>,
    #[serde(default)]
    pub judge_explanation: String,
    #[serde(default)]
    pub judge_output: String,
    #[serde(default)]
    pub is_breaking: bool,
    pub error: Option<String>,
}

impl HuntResult {
    pub fn new(hunt_id: u64, model: impl Into<String>) -> Self {
        Self {
            hunt_id,
            model: model.into(),
            status: HuntStatus::Pending,
            response: String::new(),
            reasoning_trace: String::new(),
            judge_score: None,
            judge_criteria: BTreeMap::new(),
            judge_explanation: String::new(),
            judge_output: String::new(),
            is_breaking: false,
            error: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TurnStatus {
    Pending,
    Completed,
    Breaking,
}

/// One prompt-response exchange in a multi-turn session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnData {
    pub turn_number: u32,
    pub prompt: String,
    pub response_reference: String,
    pub selected_response: Option<String>,
    pub selected_hunt_id: Option<u64>,
    pub judge_result: Option<Value>,
    pub status: TurnStatus,
}

impl TurnData {
    pub fn new(turn_number: u32, prompt: impl Into<String>, reference: impl Into<String>) -> Self {
        Self {
            turn_number,
            prompt: prompt.into(),
            response_reference: reference.into(),
            selected_response: None,
            selected_hunt_id: None,
            judge_result: None,
            status: TurnStatus::Pending,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct HumanReview {
    #[serde(default)]
    pub grading_basis: String,
    #[serde(default)]
    pub explanation: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default)]
pub struct HuntCounters {
    pub total_hunts: u64,
    pub completed_hunts: u64,
    pub breaks_found: u64,
    pub accumulated_hunt_count: u64,
}

/// Full session snapshot as returned by the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub session_id: String,
    pub notebook: Notebook,
    pub config: HuntConfig,
    pub status: HuntStatus,
    pub review_status: ReviewStatus,
    pub counters: HuntCounters,
    pub current_turn: u32,
    #[serde(default)]
    pub turns: Vec<TurnData>,
    #[serde(default)]
    pub results: Vec<HuntResult>,
    #[serde(default)]
    pub all_results: Vec<HuntResult>,
    #[serde(default)]
    pub human_reviews: BTreeMap<u8, HumanReview>,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults_are_valid() {
        let config = HuntConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.parallel_workers, 4);
        assert!(config.conversation_history.is_empty());
    }

    #[test]
    fn config_rejects_out_of_range_workers() {
        let config = HuntConfig {
            parallel_workers: 17,
            ..HuntConfig::default()
        };
        assert!(config.validate().is_err());

        let config = HuntConfig {
            parallel_workers: 0,
            ..HuntConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn config_rejects_target_breaks_above_workers() {
        let config = HuntConfig {
            parallel_workers: 2,
            target_breaks: 3,
            ..HuntConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn hunt_result_defaults() {
        let result = HuntResult::new(1, "test-model");
        assert_eq!(result.status, HuntStatus::Pending);
        assert!(result.response.is_empty());
        assert!(!result.is_breaking);
        assert!(result.judge_score.is_none());
        assert!(result.error.is_none());
    }

    #[test]
    fn verdicts_serialize_uppercase() {
        assert_eq!(
            serde_json::to_string(&CriterionVerdict::Pass).unwrap(),
            "\"PASS\""
        );
        assert_eq!(
            serde_json::to_string(&CriterionVerdict::Missing).unwrap(),
            "\"MISSING\""
        );
    }

    #[test]
    fn turn_data_tracks_selection() {
        let mut turn = TurnData::new(1, "Turn 1", "[{\"id\":\"C1\",\"criteria1\":\"x\"}]");
        assert_eq!(turn.status, TurnStatus::Pending);
        turn.selected_response = Some("Good response".to_string());
        turn.selected_hunt_id = Some(3);
        turn.status = TurnStatus::Completed;
        assert_eq!(turn.selected_hunt_id, Some(3));
    }
}
