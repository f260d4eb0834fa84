use std::collections::{BTreeMap, HashSet};
use std::sync::OnceLock;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tracing::warn;

use quarry_types::CriterionVerdict;

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1/chat/completions";
const CRITERION_TIMEOUT: Duration = Duration::from_secs(120);
const CRITERION_MAX_RETRIES: u32 = 3;

pub const INVALID_REFERENCE_PREFIX: &str = "CRITICAL: Reference Answer must be VALID JSON";

#[derive(Error, Debug)]
pub enum JudgeError {
    /// The reference is not a usable JSON criteria array. Non-retriable.
    #[error("{0}")]
    InvalidReference(String),

    #[error("Judge API error: {0}")]
    Api(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Criterion {
    pub id: String,
    pub description: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JudgeVerdict {
    pub score: Option<u8>,
    pub criteria: BTreeMap<String, CriterionVerdict>,
    pub explanation: String,
    pub raw_output: String,
    pub error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct JudgeRequest {
    pub prompt: String,
    pub student_response: String,
    pub response_reference: String,
    pub judge_system_prompt: Option<String>,
    pub model: String,
    /// The expected "gold" answer, shown to the judge as format context.
    pub standard_response: String,
}

#[derive(Debug, Clone)]
struct CriterionOutcome {
    id: String,
    passed: bool,
    reason: String,
}

fn array_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"(?s)\[.*?\]").expect("valid array pattern"))
}

/// Pulls the criteria list out of a reference. Strict: the reference must
/// embed a JSON array of objects, each with an `id` and a description in
/// the first `criteria*` field (falling back to `description`/`criteria`).
pub fn extract_criteria(reference: &str) -> Result<Vec<Criterion>, JudgeError> {
    if reference.trim().is_empty() {
        return Err(JudgeError::InvalidReference(format!(
            "{INVALID_REFERENCE_PREFIX}. Error: response_reference is empty or missing"
        )));
    }

    let Some(array_match) = array_pattern().find(reference) else {
        return Err(JudgeError::InvalidReference(format!(
            "{INVALID_REFERENCE_PREFIX}. Error: Reference Answer must contain a JSON array \
             between [ and ] brackets"
        )));
    };

    let parsed: Value = serde_json::from_str(array_match.as_str()).map_err(|err| {
        JudgeError::InvalidReference(format!("{INVALID_REFERENCE_PREFIX}. Parse Error: {err}"))
    })?;
    let Some(items) = parsed.as_array() else {
        return Err(JudgeError::InvalidReference(format!(
            "{INVALID_REFERENCE_PREFIX}. Error: Reference JSON must be a JSON array"
        )));
    };
    if items.is_empty() {
        return Err(JudgeError::InvalidReference(format!(
            "{INVALID_REFERENCE_PREFIX}. Error: Reference JSON array cannot be empty"
        )));
    }

    let mut criteria = Vec::with_capacity(items.len());
    for item in items {
        let Some(object) = item.as_object() else {
            return Err(JudgeError::InvalidReference(format!(
                "{INVALID_REFERENCE_PREFIX}. Error: each criterion must be a JSON object"
            )));
        };
        let Some(id) = object.get("id").and_then(|v| v.as_str()).map(str::trim) else {
            return Err(JudgeError::InvalidReference(format!(
                "{INVALID_REFERENCE_PREFIX}. Error: each criterion must carry an `id` field"
            )));
        };
        if id.is_empty() {
            return Err(JudgeError::InvalidReference(format!(
                "{INVALID_REFERENCE_PREFIX}. Error: criterion ids cannot be empty"
            )));
        }
        let description = object
            .iter()
            .find(|(key, _)| key.starts_with("criteria") && key.as_str() != "id")
            .and_then(|(_, v)| v.as_str())
            .or_else(|| object.get("description").and_then(|v| v.as_str()))
            .or_else(|| object.get("criteria").and_then(|v| v.as_str()))
            .map(str::to_string)
            .unwrap_or_else(|| item.to_string());
        criteria.push(Criterion {
            id: id.to_string(),
            description,
        });
    }
    Ok(criteria)
}

/// The judging capability as the orchestrator consumes it.
#[async_trait]
pub trait Judge: Send + Sync {
    async fn judge_response(&self, request: &JudgeRequest) -> Result<JudgeVerdict, JudgeError>;
}

/// Judge over an OpenAI-compatible chat endpoint. Each criterion is
/// evaluated by its own call; the verdict aggregates with the majority-fail
/// rule (exactly half passing is breaking).
pub struct JudgeClient {
    api_key: Option<String>,
    base_url: String,
    client: reqwest::Client,
}

impl JudgeClient {
    pub fn new(api_key: Option<String>, base_url: Option<String>) -> Self {
        Self {
            api_key,
            base_url: base_url.unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            client: reqwest::Client::new(),
        }
    }

    pub fn from_env() -> Self {
        Self::new(
            std::env::var("OPENAI_API_KEY")
                .ok()
                .filter(|v| !v.trim().is_empty()),
            std::env::var("OPENAI_BASE_URL")
                .ok()
                .filter(|v| !v.trim().is_empty()),
        )
    }

    async fn evaluate_criterion(
        &self,
        request: &JudgeRequest,
        criterion: &Criterion,
    ) -> CriterionOutcome {
        let eval_prompt = build_criterion_prompt(
            &request.prompt,
            &request.student_response,
            criterion,
            &request.standard_response,
        );
        let mut messages = Vec::new();
        if let Some(system) = request
            .judge_system_prompt
            .as_deref()
            .filter(|s| !s.trim().is_empty())
        {
            messages.push(json!({"role": "system", "content": system}));
        }
        messages.push(json!({"role": "user", "content": eval_prompt}));

        // The judge model may not accept an explicit temperature; the
        // provider default applies.
        let payload = json!({
            "model": request.model,
            "messages": messages,
            "response_format": {"type": "json_object"},
        });

        let mut last_error = String::new();
        for attempt in 0..CRITERION_MAX_RETRIES {
            match self.post_judge_call(&payload).await {
                Ok(content) => {
                    return match serde_json::from_str::<Value>(&content) {
                        Ok(data) => {
                            let status = data
                                .get("status")
                                .and_then(|v| v.as_str())
                                .unwrap_or("FAIL")
                                .to_uppercase();
                            let reason = data
                                .get("reason")
                                .and_then(|v| v.as_str())
                                .unwrap_or("No reason")
                                .to_string();
                            CriterionOutcome {
                                id: criterion.id.clone(),
                                passed: status == "PASS",
                                reason,
                            }
                        }
                        Err(err) => CriterionOutcome {
                            id: criterion.id.clone(),
                            passed: false,
                            reason: format!("JSON Error: {err}"),
                        },
                    };
                }
                Err(err) => {
                    last_error = err.to_string();
                    if attempt < CRITERION_MAX_RETRIES - 1 {
                        tokio::time::sleep(Duration::from_secs(1 << attempt)).await;
                    }
                }
            }
        }

        warn!(
            criterion = %criterion.id,
            error = %last_error,
            "criterion evaluation exhausted retries"
        );
        CriterionOutcome {
            id: criterion.id.clone(),
            passed: false,
            reason: format!("Connection Error: {last_error}"),
        }
    }

    async fn post_judge_call(&self, payload: &Value) -> anyhow::Result<String> {
        let api_key = self
            .api_key
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("judge API key not configured"))?;
        let response = self
            .client
            .post(&self.base_url)
            .bearer_auth(api_key)
            .timeout(CRITERION_TIMEOUT)
            .json(payload)
            .send()
            .await?;
        let status = response.status();
        let data: Value = response.json().await?;
        if !status.is_success() {
            let detail = data
                .get("error")
                .and_then(|e| e.get("message"))
                .and_then(|m| m.as_str())
                .map(str::to_string)
                .unwrap_or_else(|| format!("judge request failed with status {status}"));
            anyhow::bail!(detail);
        }
        let content = data
            .get("choices")
            .and_then(|v| v.as_array())
            .and_then(|choices| choices.first())
            .and_then(|choice| choice.get("message"))
            .and_then(|message| message.get("content"))
            .and_then(|v| v.as_str())
            .ok_or_else(|| anyhow::anyhow!("judge returned no content"))?;
        Ok(content.to_string())
    }
}

#[async_trait]
impl Judge for JudgeClient {
    /// Scores a student response against every criterion in the reference.
    /// Fails only on an invalid reference; per-criterion transport failures
    /// degrade to FAIL verdicts carrying the error text.
    async fn judge_response(&self, request: &JudgeRequest) -> Result<JudgeVerdict, JudgeError> {
        let criteria = extract_criteria(&request.response_reference)?;

        let evaluations = criteria
            .iter()
            .map(|criterion| self.evaluate_criterion(request, criterion));
        let outcomes = join_all(evaluations).await;

        Ok(aggregate(&criteria, outcomes))
    }
}

fn build_criterion_prompt(
    prompt: &str,
    student_response: &str,
    criterion: &Criterion,
    standard_response: &str,
) -> String {
    let standard_section = if standard_response.trim().is_empty() {
        String::new()
    } else {
        format!(
            "\n\nStandard/Expected Answer (for reference context):\n{standard_response}\n\n\
             Note: Use the standard answer as context to understand the expected format and \
             approach, but evaluate the student answer strictly against the criterion below."
        )
    };

    format!(
        "TASK: Evaluate if the Student Answer meets this SINGLE criterion.\n\n\
         IMPORTANT: You are evaluating ONLY this one criterion. Do NOT consider other criteria.\n\
         A response can PASS some criteria while FAILING others - evaluate each criterion \
         independently.\n\n\
         Criterion ({id}): {description}\n\n\
         Original Question:\n{prompt}\n\n\
         Student Answer:\n{student_response}{standard_section}\n\n\
         Evaluate ONLY whether the Student Answer meets the specific requirement stated in \
         Criterion ({id}) above.\n\
         Do not consider other criteria or make holistic judgments.\n\n\
         Output JSON:\n{{\n    \"status\": \"PASS\" or \"FAIL\",\n    \"reason\": \"Brief \
         explanation focusing specifically on this criterion\"\n}}",
        id = criterion.id,
        description = criterion.description,
    )
}

fn aggregate(criteria: &[Criterion], outcomes: Vec<CriterionOutcome>) -> JudgeVerdict {
    let mut verdicts = BTreeMap::new();
    let mut passed = Vec::new();
    let mut failed = Vec::new();
    let mut evaluated: HashSet<String> = HashSet::new();

    for outcome in outcomes {
        evaluated.insert(outcome.id.clone());
        if outcome.passed {
            verdicts.insert(outcome.id.clone(), CriterionVerdict::Pass);
            passed.push(format!("{}: {}", outcome.id, outcome.reason));
        } else {
            verdicts.insert(outcome.id.clone(), CriterionVerdict::Fail);
            failed.push(format!("{}: {}", outcome.id, outcome.reason));
        }
    }

    // Criteria never evaluated are MISSING and excluded from the score.
    let mut missing = Vec::new();
    for criterion in criteria {
        if !evaluated.contains(&criterion.id) {
            verdicts.insert(criterion.id.clone(), CriterionVerdict::Missing);
            missing.push(criterion.id.clone());
        }
    }

    let pass_count = passed.len();
    let counted = pass_count + failed.len();
    let score = if counted == 0 {
        None
    } else {
        // Exactly half passing is breaking.
        Some(u8::from(pass_count * 2 > counted))
    };

    let mut explanation = format!("Passing Criteria: {}/{}\n", pass_count, criteria.len());
    if !missing.is_empty() {
        explanation.push_str(&format!(
            "\nMissing Criteria (not evaluated): {}\n",
            missing.join(", ")
        ));
    }
    if !passed.is_empty() {
        explanation.push_str("\nPassing Criteria Details:\n");
        explanation.push_str(&passed.join("\n"));
    }
    if !failed.is_empty() {
        explanation.push_str("\nFailed Criteria Details:\n");
        explanation.push_str(&failed.join("\n"));
    } else if missing.is_empty() && !passed.is_empty() {
        explanation.push_str("\nAll criteria passed.");
    }

    JudgeVerdict {
        score,
        criteria: verdicts,
        explanation,
        raw_output: "Generated via Independent Criteria Judging".to_string(),
        error: None,
    }
}
