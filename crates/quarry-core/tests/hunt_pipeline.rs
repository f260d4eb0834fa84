//! End-to-end hunt pipeline tests over mock model and judge clients: run
//! loop semantics, counters, event ordering, review selection, and the job
//! pipeline's heartbeat failover.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use quarry_core::{
    reclaim_stale_jobs, run_worker_loop, submit_hunt_job, HuntEngine, RateGate, WorkerContext,
};
use quarry_events::EventBus;
use quarry_judge::{extract_criteria, Judge, JudgeError, JudgeRequest, JudgeVerdict};
use quarry_providers::{ModelClient, ModelGateway, ModelReply};
use quarry_store::{HeartbeatBoard, JobLog, SessionStore, DEFAULT_SESSION_TTL};
use quarry_types::{
    ChatMessage, CriterionVerdict, EventType, HuntConfig, HuntResult, HuntStatus, Notebook,
};

const REFERENCE: &str = r#"[{"id":"C1","criteria1":"must contain 4"}]"#;

/// Model stub: models named `break-*` answer wrongly, `fail-*` error out,
/// `empty-*` return nothing, everything else answers correctly.
struct FakeModel {
    calls: AtomicUsize,
}

impl FakeModel {
    fn new() -> Self {
        Self {
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl ModelClient for FakeModel {
    fn provider_id(&self) -> &str {
        "openrouter"
    }

    fn default_timeout(&self) -> Duration {
        Duration::from_secs(1)
    }

    async fn call_once(
        &self,
        _prompt: &str,
        model: &str,
        _history: &[ChatMessage],
        _include_reasoning: bool,
        _timeout: Duration,
        _cancel: &tokio_util::sync::CancellationToken,
    ) -> anyhow::Result<ModelReply> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if model.starts_with("fail-") {
            anyhow::bail!("HTTP 500: provider exploded");
        }
        if model.starts_with("empty-") {
            return Ok(ModelReply::default());
        }
        let response = if model.starts_with("break-") {
            "I don't know.".to_string()
        } else {
            "The answer is 4.".to_string()
        };
        Ok(ModelReply {
            response,
            reasoning: "chain of thought".to_string(),
        })
    }
}

/// Judge stub with the real strict reference validation: passes a response
/// iff it contains "4".
struct FakeJudge;

#[async_trait]
impl Judge for FakeJudge {
    async fn judge_response(&self, request: &JudgeRequest) -> Result<JudgeVerdict, JudgeError> {
        let criteria = extract_criteria(&request.response_reference)?;
        let passes = request.student_response.contains('4');
        let mut verdicts = BTreeMap::new();
        for criterion in &criteria {
            verdicts.insert(
                criterion.id.clone(),
                if passes {
                    CriterionVerdict::Pass
                } else {
                    CriterionVerdict::Fail
                },
            );
        }
        Ok(JudgeVerdict {
            score: Some(u8::from(passes)),
            criteria: verdicts,
            explanation: format!(
                "Passing Criteria: {}/{}",
                if passes { criteria.len() } else { 0 },
                criteria.len()
            ),
            raw_output: "Generated via Independent Criteria Judging".to_string(),
            error: None,
        })
    }
}

struct Harness {
    store: Arc<SessionStore>,
    bus: EventBus,
    engine: HuntEngine,
}

fn harness() -> Harness {
    let store = Arc::new(SessionStore::new(DEFAULT_SESSION_TTL));
    let bus = EventBus::new();
    let clients: Vec<Arc<dyn ModelClient>> = vec![Arc::new(FakeModel::new())];
    let gateway = Arc::new(ModelGateway::from_clients(clients));
    let engine = HuntEngine::new(
        store.clone(),
        bus.clone(),
        gateway,
        Arc::new(FakeJudge),
        Arc::new(RateGate::with_defaults()),
    );
    Harness { store, bus, engine }
}

fn notebook() -> Notebook {
    Notebook {
        prompt: "What is 2+2?".to_string(),
        response: "4".to_string(),
        response_reference: REFERENCE.to_string(),
        ..Notebook::default()
    }
}

fn config(workers: usize, target: usize, models: &[&str]) -> HuntConfig {
    HuntConfig {
        parallel_workers: workers,
        target_breaks: target,
        models: models.iter().map(|m| m.to_string()).collect(),
        max_retries: 1,
        ..HuntConfig::default()
    }
}

#[tokio::test]
async fn single_hunt_pass() {
    let h = harness();
    h.store
        .create("s1", notebook(), config(1, 1, &["m1"]))
        .await
        .unwrap();

    let session = h.engine.run_hunt("s1").await.unwrap();

    assert_eq!(session.status, HuntStatus::Completed);
    assert_eq!(session.counters.completed_hunts, 1);
    assert_eq!(session.counters.breaks_found, 0);
    assert_eq!(session.all_results.len(), 1);
    assert_eq!(session.all_results[0].hunt_id, 1);
    assert_eq!(session.all_results[0].judge_score, Some(1));
    assert!(!session.all_results[0].is_breaking);

    let complete = h
        .bus
        .replay("s1", 0)
        .await
        .into_iter()
        .map(|(_, e)| e)
        .find(|e| e.event_type == EventType::Complete)
        .expect("complete event");
    assert_eq!(complete.data["success"], false);
    assert_eq!(complete.data["total_accumulated"], 1);
}

#[tokio::test]
async fn single_hunt_breaking() {
    let h = harness();
    h.store
        .create("s1", notebook(), config(1, 1, &["break-m1"]))
        .await
        .unwrap();

    let session = h.engine.run_hunt("s1").await.unwrap();

    assert_eq!(session.counters.breaks_found, 1);
    assert_eq!(session.all_results[0].judge_score, Some(0));
    assert!(session.all_results[0].is_breaking);

    let complete = h
        .bus
        .replay("s1", 0)
        .await
        .into_iter()
        .map(|(_, e)| e)
        .find(|e| e.event_type == EventType::Complete)
        .unwrap();
    assert_eq!(complete.data["success"], true);
}

#[tokio::test]
async fn four_hunts_mixed_and_review_selection() {
    let h = harness();
    // Round-robin over two models: hunts 1,3 pass and 2,4 break.
    h.store
        .create("s1", notebook(), config(4, 4, &["m1", "break-m2"]))
        .await
        .unwrap();

    let session = h.engine.run_hunt("s1").await.unwrap();

    assert_eq!(session.counters.completed_hunts, 4);
    assert_eq!(session.counters.breaks_found, 2);
    assert_eq!(session.all_results.len(), 4);

    let review = h.engine.select_for_review("s1").await;
    assert_eq!(review.len(), 4);
    assert!(review[0].is_breaking && review[1].is_breaking);
    assert!(!review[2].is_breaking && !review[3].is_breaking);

    let breaking = h.engine.breaking_results("s1").await;
    assert_eq!(breaking.len(), 2);
}

#[tokio::test]
async fn all_sixteen_workers_run_even_after_early_breaks() {
    let h = harness();
    h.store
        .create("s1", notebook(), config(16, 1, &["break-m1"]))
        .await
        .unwrap();

    let session = h.engine.run_hunt("s1").await.unwrap();
    assert_eq!(session.counters.completed_hunts, 16);
    assert_eq!(session.counters.breaks_found, 16);
    assert_eq!(session.all_results.len(), 16);
}

#[tokio::test]
async fn invalid_reference_fails_every_hunt_without_breaks() {
    let h = harness();
    let mut bad_notebook = notebook();
    bad_notebook.response_reference = "no JSON here".to_string();
    h.store
        .create("s1", bad_notebook, config(4, 1, &["m1"]))
        .await
        .unwrap();

    let session = h.engine.run_hunt("s1").await.unwrap();

    assert_eq!(session.counters.completed_hunts, 4);
    assert_eq!(session.counters.breaks_found, 0);
    assert!(session.all_results.is_empty());
    for result in &session.results {
        assert_eq!(result.status, HuntStatus::Failed);
        assert_eq!(result.judge_score, None);
        assert!(!result.is_breaking);
        assert!(result
            .error
            .as_deref()
            .unwrap()
            .contains("CRITICAL: Reference Answer must be VALID JSON"));
    }
}

#[tokio::test]
async fn model_errors_and_empty_responses_fail_without_breaking() {
    let h = harness();
    h.store
        .create("s1", notebook(), config(2, 1, &["fail-m1", "empty-m2"]))
        .await
        .unwrap();

    let session = h.engine.run_hunt("s1").await.unwrap();
    assert_eq!(session.counters.completed_hunts, 2);
    assert_eq!(session.counters.breaks_found, 0);

    let by_model: BTreeMap<&str, &HuntResult> = session
        .results
        .iter()
        .map(|r| (r.model.as_str(), r))
        .collect();
    assert!(by_model["fail-m1"]
        .error
        .as_deref()
        .unwrap()
        .contains("Model failed after 1 tries"));
    assert!(by_model["empty-m2"]
        .error
        .as_deref()
        .unwrap()
        .contains("empty response"));
}

#[tokio::test]
async fn hunt_ids_start_after_the_offset() {
    let h = harness();
    let config = HuntConfig {
        hunt_offset: 10,
        ..config(2, 1, &["m1"])
    };
    h.store.create("s1", notebook(), config).await.unwrap();

    let session = h.engine.run_hunt("s1").await.unwrap();
    let mut ids: Vec<u64> = session.all_results.iter().map(|r| r.hunt_id).collect();
    ids.sort();
    assert_eq!(ids, vec![11, 12]);

    let start = h
        .bus
        .replay("s1", 0)
        .await
        .into_iter()
        .map(|(_, e)| e)
        .find(|e| e.event_type == EventType::Start)
        .unwrap();
    assert_eq!(start.data["run_start_id"], 10);
}

#[tokio::test]
async fn event_stream_is_ordered_and_consistent() {
    let h = harness();
    h.store
        .create("s1", notebook(), config(4, 2, &["m1", "break-m2"]))
        .await
        .unwrap();
    h.engine.run_hunt("s1").await.unwrap();

    let events = h.bus.replay("s1", 0).await;
    let ids: Vec<u64> = events.iter().map(|(id, _)| *id).collect();
    let mut sorted = ids.clone();
    sorted.sort();
    sorted.dedup();
    assert_eq!(ids, sorted, "bus ids strictly increase");

    assert_eq!(events.first().unwrap().1.event_type, EventType::Start);
    assert_eq!(events.last().unwrap().1.event_type, EventType::Complete);

    // hunt_start precedes hunt_result per hunt; complete follows them all.
    for hunt_id in 1..=4u64 {
        let start_pos = events
            .iter()
            .position(|(_, e)| e.event_type == EventType::HuntStart && e.hunt_id == Some(hunt_id))
            .expect("hunt_start");
        let result_pos = events
            .iter()
            .position(|(_, e)| e.event_type == EventType::HuntResult && e.hunt_id == Some(hunt_id))
            .expect("hunt_result");
        assert!(start_pos < result_pos);
    }

    // hunt_result events agree with stored results on the breaking flag.
    let session = h.store.get_full("s1").await.unwrap();
    for (_, event) in events
        .iter()
        .filter(|(_, e)| e.event_type == EventType::HuntResult)
    {
        let stored = session
            .results
            .iter()
            .find(|r| Some(r.hunt_id) == event.hunt_id)
            .unwrap();
        assert_eq!(event.data["is_breaking"], stored.is_breaking);
        assert_eq!(stored.is_breaking, stored.judge_score == Some(0));
    }
}

#[tokio::test]
async fn second_run_accumulates_without_id_collisions() {
    let h = harness();
    h.store
        .create("s1", notebook(), config(2, 1, &["m1"]))
        .await
        .unwrap();
    h.engine.run_hunt("s1").await.unwrap();

    // Caller bumps the offset to the max assigned id before the next run.
    let mut next = h.store.get_config("s1").await.unwrap();
    next.hunt_offset = 2;
    h.store.set_config("s1", next).await.unwrap();
    let session = h.engine.run_hunt("s1").await.unwrap();

    let mut ids: Vec<u64> = session.all_results.iter().map(|r| r.hunt_id).collect();
    ids.sort();
    assert_eq!(ids, vec![1, 2, 3, 4]);
    assert_eq!(session.counters.accumulated_hunt_count, 4);
}

#[tokio::test]
async fn reclaimed_run_executes_only_the_remaining_hunts() {
    let h = harness();
    h.store
        .create("s1", notebook(), config(4, 1, &["m1"]))
        .await
        .unwrap();

    // A dead worker already finished hunts 1..3 of the window.
    for hunt_id in 1..=3u64 {
        let mut done = HuntResult::new(hunt_id, "m1");
        done.status = HuntStatus::Completed;
        done.response = "The answer is 4.".to_string();
        done.judge_score = Some(1);
        h.store.append_result("s1", done).await.unwrap();
    }

    let session = h.engine.run_hunt("s1").await.unwrap();

    assert_eq!(session.all_results.len(), 4);
    assert_eq!(session.counters.completed_hunts, 4);

    let events = h.bus.replay("s1", 0).await;
    let completes = events
        .iter()
        .filter(|(_, e)| e.event_type == EventType::Complete)
        .count();
    assert_eq!(completes, 1);
    // Only the remaining hunt produced lifecycle events.
    let starts = events
        .iter()
        .filter(|(_, e)| e.event_type == EventType::HuntStart)
        .count();
    assert_eq!(starts, 1);
}

#[tokio::test]
async fn fully_completed_window_reclaim_is_a_noop_that_still_completes() {
    let h = harness();
    h.store
        .create("s1", notebook(), config(2, 1, &["m1"]))
        .await
        .unwrap();
    for hunt_id in 1..=2u64 {
        let mut done = HuntResult::new(hunt_id, "m1");
        done.status = HuntStatus::Completed;
        done.response = "The answer is 4.".to_string();
        done.judge_score = Some(1);
        h.store.append_result("s1", done).await.unwrap();
    }

    let session = h.engine.run_hunt("s1").await.unwrap();
    assert_eq!(session.all_results.len(), 2);
    let events = h.bus.replay("s1", 0).await;
    assert!(events
        .iter()
        .any(|(_, e)| e.event_type == EventType::Complete));
    assert_eq!(
        events
            .iter()
            .filter(|(_, e)| e.event_type == EventType::HuntStart)
            .count(),
        0
    );
}

#[tokio::test]
async fn run_hunt_aborts_when_session_is_missing() {
    let h = harness();
    assert!(h.engine.run_hunt("missing").await.is_err());
}

// ---------------------------------------------------------------------------
// Job pipeline
// ---------------------------------------------------------------------------

fn worker(h: &Harness) -> WorkerContext {
    WorkerContext::new(
        h.engine.clone(),
        Arc::new(JobLog::new()),
        Arc::new(HeartbeatBoard::new(Duration::from_secs(30))),
    )
}

#[tokio::test]
async fn worker_loop_processes_a_submitted_job() {
    let h = harness();
    h.store
        .create("s1", notebook(), config(1, 1, &["m1"]))
        .await
        .unwrap();
    let ctx = worker(&h);
    submit_hunt_job(&ctx.jobs, "s1").await;

    let shutdown = CancellationToken::new();
    let handle = tokio::spawn(run_worker_loop(ctx.clone(), shutdown.clone()));

    let mut sub = h.bus.subscribe("s1", 0).await;
    let complete = tokio::time::timeout(Duration::from_secs(10), async {
        use futures::StreamExt;
        loop {
            let (_, event) = sub.next().await.expect("bus open");
            if event.event_type == EventType::Complete {
                return event;
            }
        }
    })
    .await
    .expect("hunt completes");
    assert_eq!(complete.data["completed_hunts"], 1);

    shutdown.cancel();
    handle.await.unwrap();

    assert_eq!(ctx.jobs.pending_count().await, 0, "job acked");
    assert!(!ctx.heartbeats.is_alive("s1").await, "heartbeat cleared");
}

#[tokio::test]
async fn dead_workers_job_is_reclaimed_and_resumed() {
    let h = harness();
    h.store
        .create("s1", notebook(), config(2, 1, &["m1"]))
        .await
        .unwrap();
    let ctx = worker(&h);

    // A worker claims the job and dies: entry stays pending, no heartbeat.
    submit_hunt_job(&ctx.jobs, "s1").await;
    let claimed = ctx
        .jobs
        .read_group("dead-host:1", 1, Duration::from_millis(10))
        .await;
    assert_eq!(claimed.len(), 1);

    reclaim_stale_jobs(&ctx).await;

    let session = h.store.get_full("s1").await.unwrap();
    assert_eq!(session.status, HuntStatus::Completed);
    assert_eq!(session.all_results.len(), 2);
    assert_eq!(ctx.jobs.pending_count().await, 0, "reclaimed job acked");
}

#[tokio::test]
async fn live_heartbeat_blocks_reclaim() {
    let h = harness();
    h.store
        .create("s1", notebook(), config(1, 1, &["m1"]))
        .await
        .unwrap();
    let ctx = worker(&h);

    submit_hunt_job(&ctx.jobs, "s1").await;
    ctx.jobs
        .read_group("slow-host:1", 1, Duration::from_millis(10))
        .await;
    // The owner is alive, just slow.
    ctx.heartbeats.beat("s1", "slow-host:1").await;

    reclaim_stale_jobs(&ctx).await;

    let session = h.store.get_full("s1").await.unwrap();
    assert_eq!(session.status, HuntStatus::Pending, "job was not re-run");
    assert_eq!(ctx.jobs.pending_count().await, 1, "entry stays pending");
}
