use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use quarry_store::{ClaimOutcome, HeartbeatBoard, JobLog, JobPayload, RUN_HUNT_ACTION};

use crate::engine::HuntEngine;

const BLOCK_TIMEOUT: Duration = Duration::from_secs(5);
const STALE_CHECK_EVERY: u32 = 2; // every second 5s poll, ~10s
const PENDING_SCAN_LIMIT: usize = 10;

/// Everything one worker process needs to take jobs off the shared log.
#[derive(Clone)]
pub struct WorkerContext {
    pub engine: HuntEngine,
    pub jobs: Arc<JobLog>,
    pub heartbeats: Arc<HeartbeatBoard>,
    pub consumer_id: String,
}

impl WorkerContext {
    pub fn new(engine: HuntEngine, jobs: Arc<JobLog>, heartbeats: Arc<HeartbeatBoard>) -> Self {
        Self {
            engine,
            jobs,
            heartbeats,
            consumer_id: consumer_id(),
        }
    }

    /// Consumer ids must be unique per worker loop; use this when running
    /// several loops in one process.
    pub fn with_consumer_id(mut self, consumer_id: impl Into<String>) -> Self {
        self.consumer_id = consumer_id.into();
        self
    }
}

/// Unique per worker process.
pub fn consumer_id() -> String {
    let hostname = std::env::var("HOSTNAME").unwrap_or_else(|_| "local".to_string());
    format!("{hostname}:{}", std::process::id())
}

/// Submitting a hunt is appending to the job log; no work starts in the
/// accepting process. Returns the entry id.
pub async fn submit_hunt_job(jobs: &JobLog, session_id: &str) -> u64 {
    let entry_id = jobs.append(JobPayload::run_hunt(session_id)).await;
    info!(session_id, entry_id, "submitted hunt job");
    entry_id
}

/// Worker loop: blocks on group reads for new jobs, executes each under a
/// heartbeat, acknowledges after completion, and sweeps for stale jobs from
/// dead peers about every ten seconds.
pub async fn run_worker_loop(ctx: WorkerContext, shutdown: CancellationToken) {
    info!(consumer = %ctx.consumer_id, "hunt worker started");
    let mut polls_since_stale_check = 0u32;

    loop {
        if shutdown.is_cancelled() {
            info!(consumer = %ctx.consumer_id, "hunt worker shutting down");
            return;
        }

        let delivered = tokio::select! {
            delivered = ctx.jobs.read_group(&ctx.consumer_id, 1, BLOCK_TIMEOUT) => delivered,
            _ = shutdown.cancelled() => {
                info!(consumer = %ctx.consumer_id, "hunt worker shutting down");
                return;
            }
        };

        for (entry_id, payload) in delivered {
            if payload.action != RUN_HUNT_ACTION || payload.session_id.is_empty() {
                warn!(entry_id, action = %payload.action, "skipping unknown job");
                ctx.jobs.ack(entry_id).await;
                continue;
            }
            info!(entry_id, session_id = %payload.session_id, "worker claimed job");
            if let Err(err) = run_with_heartbeat(&ctx, &payload.session_id).await {
                error!(entry_id, session_id = %payload.session_id, error = %err, "hunt job failed");
            }
            // Ack after completion: a crash mid-run leaves the entry
            // pending and reclaim-eligible.
            ctx.jobs.ack(entry_id).await;
        }

        polls_since_stale_check += 1;
        if polls_since_stale_check >= STALE_CHECK_EVERY {
            polls_since_stale_check = 0;
            reclaim_stale_jobs(&ctx).await;
        }
    }
}

/// Runs the hunt while keeping the session's heartbeat key alive. The key
/// names this worker and refreshes at a third of its TTL; it is deleted on
/// every exit path so peers see liveness, not staleness heuristics.
pub async fn run_with_heartbeat(ctx: &WorkerContext, session_id: &str) -> anyhow::Result<()> {
    ctx.heartbeats.beat(session_id, &ctx.consumer_id).await;

    let refresher = {
        let heartbeats = ctx.heartbeats.clone();
        let session_id = session_id.to_string();
        let consumer_id = ctx.consumer_id.clone();
        let interval = ctx.heartbeats.ttl() / 3;
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                heartbeats.beat(&session_id, &consumer_id).await;
            }
        })
    };

    let outcome = ctx.engine.run_hunt(session_id).await;

    refresher.abort();
    ctx.heartbeats.clear(session_id).await;
    outcome.map(|_| ())
}

/// Stale sweep: reclaims pending jobs whose owner's heartbeat is gone. A
/// present heartbeat means the owner is alive, however long the job has
/// been pending, and the entry is skipped. The compare-and-claim on the
/// observed owner makes racing reclaimers resolve to exactly one winner.
pub async fn reclaim_stale_jobs(ctx: &WorkerContext) {
    for pending in ctx.jobs.pending(PENDING_SCAN_LIMIT).await {
        if pending.consumer == ctx.consumer_id {
            continue;
        }
        let session_id = pending.payload.session_id.clone();
        if session_id.is_empty() {
            continue;
        }
        if ctx.heartbeats.is_alive(&session_id).await {
            continue;
        }

        match ctx
            .jobs
            .claim(pending.entry_id, &pending.consumer, &ctx.consumer_id)
            .await
        {
            ClaimOutcome::Claimed(payload) => {
                warn!(
                    entry_id = pending.entry_id,
                    session_id = %payload.session_id,
                    dead_worker = %pending.consumer,
                    "re-claiming job from dead worker"
                );
                if let Err(err) = run_with_heartbeat(ctx, &payload.session_id).await {
                    error!(
                        entry_id = pending.entry_id,
                        session_id = %payload.session_id,
                        error = %err,
                        "resumed hunt failed"
                    );
                }
                ctx.jobs.ack(pending.entry_id).await;
            }
            ClaimOutcome::NotPending | ClaimOutcome::OwnedBy(_) => {
                // Lost the race or the owner acked meanwhile.
            }
        }
    }
}
