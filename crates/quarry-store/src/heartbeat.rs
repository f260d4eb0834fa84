use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

pub const DEFAULT_HEARTBEAT_TTL: Duration = Duration::from_secs(30);

#[derive(Debug)]
struct Heartbeat {
    consumer_id: String,
    expires_at: Instant,
}

/// Presence keys written by workers while they execute a hunt. A key that
/// is absent (never set, deleted, or past its TTL) means the owner is dead
/// and the job may be reclaimed.
pub struct HeartbeatBoard {
    inner: Arc<Mutex<HashMap<String, Heartbeat>>>,
    ttl: Duration,
}

impl HeartbeatBoard {
    pub fn new(ttl: Duration) -> Self {
        Self {
            inner: Arc::new(Mutex::new(HashMap::new())),
            ttl,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Set or refresh the heartbeat for a session, naming the holder.
    pub async fn beat(&self, session_id: &str, consumer_id: &str) {
        let mut inner = self.inner.lock().await;
        inner.insert(
            session_id.to_string(),
            Heartbeat {
                consumer_id: consumer_id.to_string(),
                expires_at: Instant::now() + self.ttl,
            },
        );
    }

    pub async fn clear(&self, session_id: &str) {
        self.inner.lock().await.remove(session_id);
    }

    /// The live holder of a session's heartbeat, if any.
    pub async fn holder(&self, session_id: &str) -> Option<String> {
        let mut inner = self.inner.lock().await;
        match inner.get(session_id) {
            Some(hb) if hb.expires_at > Instant::now() => Some(hb.consumer_id.clone()),
            Some(_) => {
                inner.remove(session_id);
                None
            }
            None => None,
        }
    }

    pub async fn is_alive(&self, session_id: &str) -> bool {
        self.holder(session_id).await.is_some()
    }

    /// All live heartbeats as (session_id, consumer_id) pairs.
    pub async fn active(&self) -> Vec<(String, String)> {
        let mut inner = self.inner.lock().await;
        let now = Instant::now();
        inner.retain(|_, hb| hb.expires_at > now);
        let mut out: Vec<(String, String)> = inner
            .iter()
            .map(|(session, hb)| (session.clone(), hb.consumer_id.clone()))
            .collect();
        out.sort();
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn heartbeat_expires_after_ttl() {
        let board = HeartbeatBoard::new(Duration::from_secs(30));
        board.beat("s1", "host:1").await;
        assert_eq!(board.holder("s1").await.as_deref(), Some("host:1"));

        tokio::time::advance(Duration::from_secs(31)).await;
        assert!(board.holder("s1").await.is_none());
        assert!(!board.is_alive("s1").await);
    }

    #[tokio::test(start_paused = true)]
    async fn refresh_extends_the_ttl() {
        let board = HeartbeatBoard::new(Duration::from_secs(30));
        board.beat("s1", "host:1").await;
        tokio::time::advance(Duration::from_secs(20)).await;
        board.beat("s1", "host:1").await;
        tokio::time::advance(Duration::from_secs(20)).await;
        assert!(board.is_alive("s1").await);
    }

    #[tokio::test]
    async fn clear_removes_the_key() {
        let board = HeartbeatBoard::new(DEFAULT_HEARTBEAT_TTL);
        board.beat("s1", "host:1").await;
        board.clear("s1").await;
        assert!(board.holder("s1").await.is_none());
        assert!(board.active().await.is_empty());
    }
}
