use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, Notify};

pub const JOB_STREAM: &str = "hunt_jobs";
pub const CONSUMER_GROUP: &str = "hunt_workers";
pub const RUN_HUNT_ACTION: &str = "run_hunt";
pub const MAX_STREAM_LEN: usize = 500;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct JobPayload {
    pub session_id: String,
    pub action: String,
}

impl JobPayload {
    pub fn run_hunt(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            action: RUN_HUNT_ACTION.to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PendingJob {
    pub entry_id: u64,
    pub consumer: String,
    pub payload: JobPayload,
    pub delivered_at: DateTime<Utc>,
    pub delivery_count: u32,
}

/// Outcome of a compare-and-claim on a pending entry. Claiming is atomic
/// per entry: of two workers racing to reclaim, exactly one sees `Claimed`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimOutcome {
    Claimed(JobPayload),
    NotPending,
    OwnedBy(String),
}

#[derive(Debug)]
struct LogInner {
    next_id: u64,
    entries: VecDeque<(u64, JobPayload)>,
    /// Highest entry id delivered to the consumer group.
    cursor: u64,
    pending: BTreeMap<u64, PendingEntry>,
}

#[derive(Debug)]
struct PendingEntry {
    consumer: String,
    payload: JobPayload,
    delivered_at: DateTime<Utc>,
    delivery_count: u32,
}

/// Append-only job stream with one consumer group. Each entry is delivered
/// to exactly one consumer at a time and stays pending until acknowledged.
pub struct JobLog {
    inner: Arc<Mutex<LogInner>>,
    appended: Arc<Notify>,
    max_len: usize,
}

impl JobLog {
    pub fn new() -> Self {
        Self::with_max_len(MAX_STREAM_LEN)
    }

    pub fn with_max_len(max_len: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(LogInner {
                next_id: 1,
                entries: VecDeque::new(),
                cursor: 0,
                pending: BTreeMap::new(),
            })),
            appended: Arc::new(Notify::new()),
            max_len,
        }
    }

    /// Appends a job and returns its entry id. Trimming is approximate in
    /// the sense that only undelivered backlog is bounded; pending entries
    /// keep their payloads until acknowledged.
    pub async fn append(&self, payload: JobPayload) -> u64 {
        let entry_id = {
            let mut inner = self.inner.lock().await;
            let entry_id = inner.next_id;
            inner.next_id += 1;
            inner.entries.push_back((entry_id, payload));
            while inner.entries.len() > self.max_len {
                inner.entries.pop_front();
            }
            entry_id
        };
        self.appended.notify_waiters();
        entry_id
    }

    /// Blocking group read: waits up to `block` for undelivered entries,
    /// marks what it returns as pending for `consumer`.
    pub async fn read_group(
        &self,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> Vec<(u64, JobPayload)> {
        let deadline = tokio::time::Instant::now() + block;
        loop {
            let notified = self.appended.notified();
            {
                let mut inner = self.inner.lock().await;
                let cursor = inner.cursor;
                let fresh: Vec<(u64, JobPayload)> = inner
                    .entries
                    .iter()
                    .filter(|(id, _)| *id > cursor)
                    .take(count)
                    .cloned()
                    .collect();
                if !fresh.is_empty() {
                    for (id, payload) in &fresh {
                        inner.cursor = inner.cursor.max(*id);
                        inner.pending.insert(
                            *id,
                            PendingEntry {
                                consumer: consumer.to_string(),
                                payload: payload.clone(),
                                delivered_at: Utc::now(),
                                delivery_count: 1,
                            },
                        );
                    }
                    return fresh;
                }
            }
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return Vec::new();
            }
            let _ = tokio::time::timeout(remaining, notified).await;
        }
    }

    /// Marks an entry processed. Returns false if it was not pending.
    pub async fn ack(&self, entry_id: u64) -> bool {
        let mut inner = self.inner.lock().await;
        inner.pending.remove(&entry_id).is_some()
    }

    pub async fn pending(&self, limit: usize) -> Vec<PendingJob> {
        let inner = self.inner.lock().await;
        inner
            .pending
            .iter()
            .take(limit)
            .map(|(id, entry)| PendingJob {
                entry_id: *id,
                consumer: entry.consumer.clone(),
                payload: entry.payload.clone(),
                delivered_at: entry.delivered_at,
                delivery_count: entry.delivery_count,
            })
            .collect()
    }

    /// Transfers ownership of a pending entry from `from_consumer` to
    /// `to_consumer`. Fails if the entry is gone or its owner changed since
    /// the caller observed it, which is what makes reclaim races safe.
    pub async fn claim(
        &self,
        entry_id: u64,
        from_consumer: &str,
        to_consumer: &str,
    ) -> ClaimOutcome {
        let mut inner = self.inner.lock().await;
        let Some(entry) = inner.pending.get_mut(&entry_id) else {
            return ClaimOutcome::NotPending;
        };
        if entry.consumer != from_consumer {
            return ClaimOutcome::OwnedBy(entry.consumer.clone());
        }
        entry.consumer = to_consumer.to_string();
        entry.delivered_at = Utc::now();
        entry.delivery_count += 1;
        ClaimOutcome::Claimed(entry.payload.clone())
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn pending_count(&self) -> usize {
        self.inner.lock().await.pending.len()
    }
}

impl Default for JobLog {
    fn default() -> Self {
        Self::new()
    }
}
