use std::collections::HashSet;
use std::sync::Arc;

use anyhow::Context;
use serde_json::{json, Value};
use tracing::{error, info, warn};

use quarry_events::EventBus;
use quarry_judge::{Judge, JudgeError, JudgeRequest};
use quarry_providers::{ModelGateway, ModelRequest};
use quarry_store::SessionStore;
use quarry_types::{
    EventType, HuntConfig, HuntEvent, HuntResult, HuntStatus, Notebook, Session,
};

use crate::gate::RateGate;

const JUDGE_PROVIDER: &str = "openai";
const NONE_SCORE_ATTEMPTS: u32 = 3;
pub const REVIEW_TARGET_COUNT: usize = 4;

/// Drives hunt runs: fans out per-hunt tasks, wires the rate gate, model
/// gateway and judge together, and records everything through the store
/// and event bus. Holds no session state of its own.
#[derive(Clone)]
pub struct HuntEngine {
    store: Arc<SessionStore>,
    bus: EventBus,
    gateway: Arc<ModelGateway>,
    judge: Arc<dyn Judge>,
    gate: Arc<RateGate>,
}

impl HuntEngine {
    pub fn new(
        store: Arc<SessionStore>,
        bus: EventBus,
        gateway: Arc<ModelGateway>,
        judge: Arc<dyn Judge>,
        gate: Arc<RateGate>,
    ) -> Self {
        Self {
            store,
            bus,
            gateway,
            judge,
            gate,
        }
    }

    pub fn store(&self) -> &Arc<SessionStore> {
        &self.store
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// One run: schedules `parallel_workers` hunts over the current id
    /// window and runs every one of them to completion. Idempotent with
    /// respect to `all_results`; hunts already recorded in the window are
    /// not re-executed, so a reclaimed job resumes instead of re-running.
    pub async fn run_hunt(&self, session_id: &str) -> anyhow::Result<Session> {
        let config = self
            .store
            .get_config(session_id)
            .await
            .with_context(|| format!("session {session_id} not found or missing config"))?;
        let notebook = self
            .store
            .get_notebook(session_id)
            .await
            .with_context(|| format!("session {session_id} not found or missing notebook"))?;

        let workers = config.parallel_workers as u64;
        let base = config.hunt_offset;
        let first = base + 1;
        let last = base + workers;

        let already_done = self.store.prepare_run(session_id, first, last).await?;
        let done_ids: HashSet<u64> = already_done.iter().map(|r| r.hunt_id).collect();
        let completed_so_far = already_done.len() as u64;
        let breaks_so_far = already_done.iter().filter(|r| r.is_breaking).count() as u64;

        self.store
            .set_hunt_counters(session_id, workers, completed_so_far, breaks_so_far)
            .await?;
        self.store
            .set_status(session_id, HuntStatus::Running)
            .await?;

        info!(
            session_id,
            offset = base,
            workers,
            resumed = completed_so_far,
            "starting hunt run"
        );

        self.publish(HuntEvent::new(
            session_id,
            EventType::Start,
            json!({
                "session_id": session_id,
                "total_hunts": workers,
                "target_breaks": config.target_breaks,
                "run_start_id": base,
            }),
        ))
        .await;

        let mut handles = Vec::new();
        for i in 0..config.parallel_workers {
            let hunt_id = base + i as u64 + 1;
            if done_ids.contains(&hunt_id) {
                continue;
            }
            let model = config.models[i % config.models.len()].clone();
            let engine = self.clone();
            let session_id = session_id.to_string();
            let config = config.clone();
            let notebook = notebook.clone();
            handles.push(tokio::spawn(async move {
                engine
                    .run_single_hunt(&session_id, hunt_id, &model, &config, &notebook)
                    .await;
            }));
        }

        // Every scheduled hunt runs to completion; a panicking task is the
        // only thing that can surface here and it fails the run.
        let mut run_error: Option<String> = None;
        for handle in handles {
            if let Err(err) = handle.await {
                run_error = Some(format!("hunt task aborted: {err}"));
            }
        }
        if let Some(message) = run_error {
            error!(session_id, error = %message, "hunt run failed");
            self.store
                .set_status(session_id, HuntStatus::Failed)
                .await?;
            self.publish(HuntEvent::new(
                session_id,
                EventType::Error,
                json!({"error": message}),
            ))
            .await;
        }

        if self.store.get_status(session_id).await != Some(HuntStatus::Failed) {
            self.store
                .set_status(session_id, HuntStatus::Completed)
                .await?;
        }

        // Accumulate this run's completed hunts, deduplicated by hunt_id.
        for result in self.store.get_results(session_id).await {
            if result.status == HuntStatus::Completed {
                self.store.append_all_result(session_id, result).await?;
            }
        }
        self.store
            .set_accumulated_hunt_count(session_id, base + workers)
            .await?;

        let counters = self
            .store
            .get_counters(session_id)
            .await
            .context("session disappeared during run")?;
        let total_accumulated = self.store.get_all_results(session_id).await.len();

        info!(
            session_id,
            completed = counters.completed_hunts,
            breaks = counters.breaks_found,
            total_accumulated,
            "hunt run finished"
        );

        self.publish(HuntEvent::new(
            session_id,
            EventType::Complete,
            json!({
                "session_id": session_id,
                "completed_hunts": counters.completed_hunts,
                "breaks_found": counters.breaks_found,
                "success": counters.breaks_found >= config.target_breaks as u64,
                "total_accumulated": total_accumulated,
            }),
        ))
        .await;

        self.store
            .get_full(session_id)
            .await
            .context("session disappeared during run")
    }

    /// One hunt: model call under the provider's gate slot, judge under the
    /// judge provider's slot, then one atomic append plus counter bumps and
    /// a `hunt_result` event. Failures land in the result, never abort the
    /// run.
    async fn run_single_hunt(
        &self,
        session_id: &str,
        hunt_id: u64,
        model: &str,
        config: &HuntConfig,
        notebook: &Notebook,
    ) {
        let mut result = HuntResult::new(hunt_id, model);
        result.status = HuntStatus::Running;

        self.publish(HuntEvent::for_hunt(
            session_id,
            EventType::HuntStart,
            hunt_id,
            json!({"model": model}),
        ))
        .await;

        self.publish(HuntEvent::for_hunt(
            session_id,
            EventType::HuntProgress,
            hunt_id,
            json!({"step": "calling_model", "message": format!("Calling {}...", config.provider)}),
        ))
        .await;

        match self.gateway.client(&config.provider) {
            Err(err) => {
                result.status = HuntStatus::Failed;
                result.error = Some(err.to_string());
            }
            Ok(client) => {
                let request = ModelRequest {
                    prompt: notebook.prompt.clone(),
                    model: model.to_string(),
                    messages_history: config.conversation_history.clone(),
                    reasoning_budget_percent: config.reasoning_budget_percent,
                    max_retries: config.max_retries,
                    timeout: None,
                    cancel: Default::default(),
                };
                let outcome = {
                    let _permit = self.gate.acquire(&config.provider).await;
                    client.call_with_retry(&request).await
                };

                if let Some(err) = outcome.error {
                    result.status = HuntStatus::Failed;
                    result.judge_score = None;
                    result.is_breaking = false;
                    result.reasoning_trace = outcome.reasoning;
                    result.error = Some(format!(
                        "Model failed after {} tries: {err}",
                        config.max_retries
                    ));
                } else if outcome.response.trim().is_empty() {
                    result.status = HuntStatus::Failed;
                    result.judge_score = None;
                    result.is_breaking = false;
                    result.reasoning_trace = outcome.reasoning;
                    result.error = Some(
                        "Model returned empty response (possible timeout or token limit exceeded)"
                            .to_string(),
                    );
                } else {
                    result.response = outcome.response;
                    result.reasoning_trace = outcome.reasoning;

                    self.publish(HuntEvent::for_hunt(
                        session_id,
                        EventType::HuntProgress,
                        hunt_id,
                        json!({"step": "judging", "message": "Judging response..."}),
                    ))
                    .await;

                    self.judge_result(config, notebook, &mut result).await;
                }
            }
        }

        if let Err(err) = self.store.append_result(session_id, result.clone()).await {
            warn!(session_id, hunt_id, error = %err, "failed to append hunt result");
        }

        let completed = self
            .store
            .incr_completed_hunts(session_id)
            .await
            .unwrap_or_default();
        let breaks = if result.is_breaking {
            self.store
                .incr_breaks_found(session_id)
                .await
                .unwrap_or_default()
        } else {
            self.store
                .get_counters(session_id)
                .await
                .map(|c| c.breaks_found)
                .unwrap_or_default()
        };
        let total = self
            .store
            .get_counters(session_id)
            .await
            .map(|c| c.total_hunts)
            .unwrap_or_default();

        self.publish(HuntEvent::for_hunt(
            session_id,
            EventType::HuntResult,
            hunt_id,
            json!({
                "status": result.status,
                "score": result.judge_score,
                "is_breaking": result.is_breaking,
                "error": result.error,
                "response": result.response,
                "reasoning_trace": result.reasoning_trace,
                "model": result.model,
                "completed": completed,
                "total": total,
                "breaks": breaks,
            }),
        ))
        .await;
    }

    /// Judge step: retries a null aggregate score up to three attempts,
    /// keeps the response on judge failure.
    async fn judge_result(&self, config: &HuntConfig, notebook: &Notebook, result: &mut HuntResult) {
        let request = JudgeRequest {
            prompt: notebook.prompt.clone(),
            student_response: result.response.clone(),
            response_reference: notebook.response_reference.clone(),
            judge_system_prompt: notebook.judge_system_prompt.clone(),
            model: config.judge_model.clone(),
            standard_response: notebook.response.clone(),
        };

        let mut verdict = None;
        for attempt in 0..NONE_SCORE_ATTEMPTS {
            let judged = {
                let _permit = self.gate.acquire(JUDGE_PROVIDER).await;
                self.judge.judge_response(&request).await
            };
            match judged {
                Ok(v) => {
                    let scored = v.score.is_some();
                    verdict = Some(v);
                    if scored {
                        break;
                    }
                    warn!(
                        hunt_id = result.hunt_id,
                        attempt = attempt + 1,
                        "judge returned no score, retrying"
                    );
                }
                Err(err) => {
                    // Invalid references are non-retriable; API errors have
                    // already been retried per criterion.
                    let is_critical = matches!(err, JudgeError::InvalidReference(_));
                    result.status = HuntStatus::Failed;
                    result.judge_score = None;
                    result.is_breaking = false;
                    result.error = Some(if is_critical {
                        err.to_string()
                    } else {
                        format!("Judge error: {err}")
                    });
                    return;
                }
            }
        }

        let Some(verdict) = verdict else {
            return;
        };
        if verdict.score.is_none() {
            warn!(
                hunt_id = result.hunt_id,
                raw = %truncate(&verdict.raw_output, 500),
                "judge failed to produce a score after retries"
            );
        }
        result.judge_score = verdict.score;
        result.judge_criteria = verdict.criteria;
        result.judge_explanation = verdict.explanation;
        result.judge_output = verdict.raw_output;
        result.is_breaking = verdict.score == Some(0);
        result.status = HuntStatus::Completed;
        if let Some(err) = verdict.error {
            result.error = Some(err);
        }
    }

    async fn publish(&self, event: HuntEvent) {
        self.bus.publish(event).await;
    }

    // ------------------------------------------------------------------
    // Result queries
    // ------------------------------------------------------------------

    /// Accumulated results plus current-run completions not yet merged.
    pub async fn accumulated_results(&self, session_id: &str) -> Vec<HuntResult> {
        let mut all = self.store.get_all_results(session_id).await;
        let existing: HashSet<u64> = all.iter().map(|r| r.hunt_id).collect();
        for result in self.store.get_results(session_id).await {
            if result.status == HuntStatus::Completed && !existing.contains(&result.hunt_id) {
                all.push(result);
            }
        }
        all
    }

    pub async fn breaking_results(&self, session_id: &str) -> Vec<HuntResult> {
        self.accumulated_results(session_id)
            .await
            .into_iter()
            .filter(|r| r.is_breaking)
            .collect()
    }

    /// Up to four results for human review: breaking first, topped up with
    /// passing ones.
    pub async fn select_for_review(&self, session_id: &str) -> Vec<HuntResult> {
        let scored: Vec<HuntResult> = self
            .accumulated_results(session_id)
            .await
            .into_iter()
            .filter(|r| r.status == HuntStatus::Completed && r.judge_score.is_some())
            .collect();
        let mut selected: Vec<HuntResult> = scored
            .iter()
            .filter(|r| r.judge_score == Some(0))
            .take(REVIEW_TARGET_COUNT)
            .cloned()
            .collect();
        if selected.len() < REVIEW_TARGET_COUNT {
            selected.extend(
                scored
                    .iter()
                    .filter(|r| r.judge_score >= Some(1))
                    .take(REVIEW_TARGET_COUNT - selected.len())
                    .cloned(),
            );
        }
        selected
    }

    /// Flat export of every accumulated result with all judge fields.
    pub async fn export_results(&self, session_id: &str) -> Vec<Value> {
        self.accumulated_results(session_id)
            .await
            .iter()
            .map(|r| {
                json!({
                    "hunt_id": r.hunt_id,
                    "model": r.model,
                    "response": r.response,
                    "reasoning_trace": r.reasoning_trace,
                    "judge_output": r.judge_output,
                    "judge_score": r.judge_score,
                    "judge_criteria": r.judge_criteria,
                    "judge_explanation": r.judge_explanation,
                    "score": r.judge_score,
                    "is_breaking": r.is_breaking,
                })
            })
            .collect()
    }
}

fn truncate(input: &str, max_len: usize) -> String {
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
