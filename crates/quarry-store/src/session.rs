use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::Utc;
use tokio::sync::RwLock;
use tokio::time::Instant;

use quarry_types::{
    HumanReview, HuntConfig, HuntCounters, HuntResult, HuntStatus, Notebook, ReviewStatus, Session,
    TurnData, TurnStatus,
};

use crate::team::TeamConfig;

pub const DEFAULT_SESSION_TTL: Duration = Duration::from_secs(60 * 60 * 24 * 7);

/// Outcome of a compare-and-swap over the review status. `Mismatch` carries
/// the actual current status so the caller can surface it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CasOutcome {
    NotFound,
    Mismatch(ReviewStatus),
    Swapped,
}

#[derive(Debug)]
struct SessionRecord {
    notebook: Notebook,
    config: HuntConfig,
    status: HuntStatus,
    review_status: ReviewStatus,
    version: u64,
    counters: HuntCounters,
    current_turn: u32,
    turns: Vec<TurnData>,
    results: Vec<HuntResult>,
    all_results: Vec<HuntResult>,
    all_result_ids: HashSet<u64>,
    human_reviews: std::collections::BTreeMap<u8, HumanReview>,
    trainer_email: String,
    created_at: chrono::DateTime<Utc>,
    expires_at: Instant,
}

impl SessionRecord {
    fn snapshot(&self, session_id: &str) -> Session {
        Session {
            session_id: session_id.to_string(),
            notebook: self.notebook.clone(),
            config: self.config.clone(),
            status: self.status,
            review_status: self.review_status,
            counters: self.counters,
            current_turn: self.current_turn,
            turns: self.turns.clone(),
            results: self.results.clone(),
            all_results: self.all_results.clone(),
            human_reviews: self.human_reviews.clone(),
            created_at: self.created_at,
        }
    }
}

/// Authoritative session state, shared by every worker in the process.
///
/// Every public operation completes under a single lock acquisition, which
/// is what makes the increment/append/CAS contracts atomic. No caller holds
/// the lock across I/O.
pub struct SessionStore {
    sessions: Arc<RwLock<HashMap<String, SessionRecord>>>,
    ttl: Duration,
}

impl SessionStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
            ttl,
        }
    }

    fn deadline(&self) -> Instant {
        Instant::now() + self.ttl
    }

    /// Idempotent create is a create that fails when the id already exists.
    pub async fn create(
        &self,
        session_id: &str,
        notebook: Notebook,
        config: HuntConfig,
    ) -> anyhow::Result<()> {
        config
            .validate()
            .map_err(|detail| anyhow::anyhow!("invalid hunt config: {detail}"))?;
        let mut sessions = self.sessions.write().await;
        prune_expired(&mut sessions);
        if sessions.contains_key(session_id) {
            anyhow::bail!("session {session_id} already exists");
        }
        let trainer_email = notebook
            .metadata
            .get("trainer_email")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .trim()
            .to_lowercase();
        sessions.insert(
            session_id.to_string(),
            SessionRecord {
                notebook,
                config,
                status: HuntStatus::Pending,
                review_status: ReviewStatus::Draft,
                version: 0,
                counters: HuntCounters::default(),
                current_turn: 1,
                turns: Vec::new(),
                results: Vec::new(),
                all_results: Vec::new(),
                all_result_ids: HashSet::new(),
                human_reviews: std::collections::BTreeMap::new(),
                trainer_email,
                created_at: Utc::now(),
                expires_at: self.deadline(),
            },
        );
        Ok(())
    }

    /// Full snapshot. Counts as a review-relevant read: refreshes the TTL.
    pub async fn get_full(&self, session_id: &str) -> Option<Session> {
        let mut sessions = self.sessions.write().await;
        let deadline = self.deadline();
        let record = live_mut(&mut sessions, session_id)?;
        record.expires_at = deadline;
        Some(record.snapshot(session_id))
    }

    pub async fn get_config(&self, session_id: &str) -> Option<HuntConfig> {
        let mut sessions = self.sessions.write().await;
        live_mut(&mut sessions, session_id).map(|r| r.config.clone())
    }

    pub async fn get_notebook(&self, session_id: &str) -> Option<Notebook> {
        let mut sessions = self.sessions.write().await;
        live_mut(&mut sessions, session_id).map(|r| r.notebook.clone())
    }

    pub async fn get_status(&self, session_id: &str) -> Option<HuntStatus> {
        let mut sessions = self.sessions.write().await;
        live_mut(&mut sessions, session_id).map(|r| r.status)
    }

    pub async fn set_config(&self, session_id: &str, config: HuntConfig) -> anyhow::Result<()> {
        config
            .validate()
            .map_err(|detail| anyhow::anyhow!("invalid hunt config: {detail}"))?;
        self.mutate(session_id, |record| {
            record.config = config;
        })
        .await
    }

    pub async fn set_notebook(&self, session_id: &str, notebook: Notebook) -> anyhow::Result<()> {
        self.mutate(session_id, |record| {
            record.notebook = notebook;
        })
        .await
    }

    pub async fn set_status(&self, session_id: &str, status: HuntStatus) -> anyhow::Result<()> {
        self.mutate(session_id, |record| {
            record.status = status;
        })
        .await
    }

    pub async fn set_hunt_counters(
        &self,
        session_id: &str,
        total: u64,
        completed: u64,
        breaks: u64,
    ) -> anyhow::Result<()> {
        self.mutate(session_id, |record| {
            record.counters.total_hunts = total;
            record.counters.completed_hunts = completed;
            record.counters.breaks_found = breaks;
        })
        .await
    }

    pub async fn set_accumulated_hunt_count(
        &self,
        session_id: &str,
        count: u64,
    ) -> anyhow::Result<()> {
        self.mutate(session_id, |record| {
            record.counters.accumulated_hunt_count = count;
        })
        .await
    }

    pub async fn append_result(&self, session_id: &str, result: HuntResult) -> anyhow::Result<()> {
        self.mutate(session_id, |record| {
            record.results.push(result);
        })
        .await
    }

    /// Appends to the accumulated list; a second append with the same
    /// hunt_id is a no-op.
    pub async fn append_all_result(
        &self,
        session_id: &str,
        result: HuntResult,
    ) -> anyhow::Result<()> {
        self.mutate(session_id, |record| {
            if record.all_result_ids.insert(result.hunt_id) {
                record.all_results.push(result);
            }
        })
        .await
    }

    pub async fn incr_completed_hunts(&self, session_id: &str) -> anyhow::Result<u64> {
        let mut sessions = self.sessions.write().await;
        let record = live_mut(&mut sessions, session_id)
            .with_context(|| format!("session {session_id} not found"))?;
        record.counters.completed_hunts += 1;
        Ok(record.counters.completed_hunts)
    }

    pub async fn incr_breaks_found(&self, session_id: &str) -> anyhow::Result<u64> {
        let mut sessions = self.sessions.write().await;
        let record = live_mut(&mut sessions, session_id)
            .with_context(|| format!("session {session_id} not found"))?;
        record.counters.breaks_found += 1;
        Ok(record.counters.breaks_found)
    }

    pub async fn get_counters(&self, session_id: &str) -> Option<HuntCounters> {
        let mut sessions = self.sessions.write().await;
        live_mut(&mut sessions, session_id).map(|r| r.counters)
    }

    pub async fn clear_results(&self, session_id: &str) -> anyhow::Result<()> {
        self.mutate(session_id, |record| {
            record.results.clear();
        })
        .await
    }

    /// Run preparation for a hunt window: atomically drops current-run
    /// results whose hunt ids fall outside `first..=last` and returns the
    /// survivors. A fresh run (new offset) keeps nothing, which is exactly
    /// `clear_results`; a reclaimed run gets back the hunts a dead worker
    /// already finished.
    pub async fn prepare_run(
        &self,
        session_id: &str,
        first: u64,
        last: u64,
    ) -> anyhow::Result<Vec<HuntResult>> {
        let mut sessions = self.sessions.write().await;
        let record = live_mut(&mut sessions, session_id)
            .with_context(|| format!("session {session_id} not found"))?;
        record
            .results
            .retain(|r| r.hunt_id >= first && r.hunt_id <= last);
        Ok(record.results.clone())
    }

    pub async fn get_results(&self, session_id: &str) -> Vec<HuntResult> {
        let mut sessions = self.sessions.write().await;
        live_mut(&mut sessions, session_id)
            .map(|r| r.results.clone())
            .unwrap_or_default()
    }

    pub async fn get_all_results(&self, session_id: &str) -> Vec<HuntResult> {
        let mut sessions = self.sessions.write().await;
        live_mut(&mut sessions, session_id)
            .map(|r| r.all_results.clone())
            .unwrap_or_default()
    }

    pub async fn get_review_status(&self, session_id: &str) -> Option<ReviewStatus> {
        let mut sessions = self.sessions.write().await;
        live_mut(&mut sessions, session_id).map(|r| r.review_status)
    }

    /// Atomic compare-and-swap over review status. On success the session
    /// version is bumped and the TTL refreshed.
    pub async fn cas_review_status(
        &self,
        session_id: &str,
        expected: ReviewStatus,
        new: ReviewStatus,
    ) -> CasOutcome {
        let mut sessions = self.sessions.write().await;
        let deadline = self.deadline();
        let Some(record) = live_mut(&mut sessions, session_id) else {
            return CasOutcome::NotFound;
        };
        if record.review_status != expected {
            return CasOutcome::Mismatch(record.review_status);
        }
        record.review_status = new;
        record.version += 1;
        record.expires_at = deadline;
        CasOutcome::Swapped
    }

    pub async fn set_human_reviews(
        &self,
        session_id: &str,
        reviews: std::collections::BTreeMap<u8, HumanReview>,
    ) -> anyhow::Result<()> {
        self.mutate(session_id, |record| {
            record.human_reviews = reviews;
        })
        .await
    }

    /// Record the human-selected response for the current turn and advance.
    /// Conversation history grows by exactly two messages; the hunt offset
    /// moves to the max assigned id so the next run's window cannot collide.
    pub async fn advance_turn(
        &self,
        session_id: &str,
        selected_hunt_id: u64,
        next_prompt: Option<String>,
        next_reference: Option<String>,
    ) -> anyhow::Result<Session> {
        let mut sessions = self.sessions.write().await;
        let record = live_mut(&mut sessions, session_id)
            .with_context(|| format!("session {session_id} not found"))?;
        let selected = record
            .all_results
            .iter()
            .find(|r| r.hunt_id == selected_hunt_id)
            .cloned()
            .with_context(|| format!("hunt {selected_hunt_id} not found in accumulated results"))?;

        let mut turn = TurnData::new(
            record.current_turn,
            record.notebook.prompt.clone(),
            record.notebook.response_reference.clone(),
        );
        turn.selected_response = Some(selected.response.clone());
        turn.selected_hunt_id = Some(selected_hunt_id);
        turn.judge_result = serde_json::to_value(&selected).ok();
        turn.status = if selected.is_breaking {
            TurnStatus::Breaking
        } else {
            TurnStatus::Completed
        };
        record.turns.push(turn);

        record
            .config
            .conversation_history
            .push(quarry_types::ChatMessage::user(record.notebook.prompt.clone()));
        record
            .config
            .conversation_history
            .push(quarry_types::ChatMessage::assistant(selected.response));
        record.current_turn += 1;

        let max_assigned = record
            .all_result_ids
            .iter()
            .copied()
            .max()
            .unwrap_or(record.config.hunt_offset);
        record.config.hunt_offset = record.config.hunt_offset.max(max_assigned);

        if let Some(prompt) = next_prompt {
            record.notebook.prompt = prompt;
        }
        if let Some(reference) = next_reference {
            record.notebook.response_reference = reference;
        }

        Ok(record.snapshot(session_id))
    }

    /// All live session ids. The backing map cannot hold duplicates, which
    /// is the dedup guarantee enumeration requires.
    pub async fn list_sessions(&self) -> Vec<String> {
        let mut sessions = self.sessions.write().await;
        prune_expired(&mut sessions);
        let mut ids: Vec<String> = sessions.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Sessions visible to a reviewer, scoped by role and trainer pod.
    pub async fn list_for_review(&self, reviewer_email: &str, team: &TeamConfig) -> Vec<String> {
        let email = reviewer_email.trim().to_lowercase();
        let role = team.role(&email);
        let allowed_trainers = team.allowed_trainers(&email);
        let mut sessions = self.sessions.write().await;
        prune_expired(&mut sessions);
        let mut out: Vec<String> = sessions
            .iter()
            .filter(|(_, record)| {
                let reviewable = match record.review_status {
                    ReviewStatus::Submitted => true,
                    ReviewStatus::Escalated => role.can_review_escalated(),
                    _ => false,
                };
                if !reviewable {
                    return false;
                }
                match &allowed_trainers {
                    None => true,
                    Some(trainers) => trainers.contains(&record.trainer_email),
                }
            })
            .map(|(id, _)| id.clone())
            .collect();
        out.sort();
        out
    }

    pub async fn session_count(&self) -> usize {
        let mut sessions = self.sessions.write().await;
        prune_expired(&mut sessions);
        sessions.len()
    }

    async fn mutate(
        &self,
        session_id: &str,
        apply: impl FnOnce(&mut SessionRecord),
    ) -> anyhow::Result<()> {
        let mut sessions = self.sessions.write().await;
        let record = live_mut(&mut sessions, session_id)
            .with_context(|| format!("session {session_id} not found"))?;
        apply(record);
        Ok(())
    }
}

fn live_mut<'a>(
    sessions: &'a mut HashMap<String, SessionRecord>,
    session_id: &str,
) -> Option<&'a mut SessionRecord> {
    let expired = sessions
        .get(session_id)
        .map(|r| r.expires_at <= Instant::now())
        .unwrap_or(false);
    if expired {
        sessions.remove(session_id);
        return None;
    }
    sessions.get_mut(session_id)
}

fn prune_expired(sessions: &mut HashMap<String, SessionRecord>) {
    let now = Instant::now();
    sessions.retain(|_, record| record.expires_at > now);
}
