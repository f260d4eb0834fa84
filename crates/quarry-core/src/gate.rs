use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};

pub const DEFAULT_OPENROUTER_LIMIT: usize = 8;
pub const DEFAULT_FIREWORKS_LIMIT: usize = 8;
pub const DEFAULT_OPENAI_LIMIT: usize = 16;
const FALLBACK_LIMIT: usize = 8;

/// Scoped acquisition of one slot of a provider's concurrency budget.
/// Capacity returns when the permit drops, on every exit path.
pub struct RateGatePermit {
    _permit: OwnedSemaphorePermit,
}

/// Per-provider in-flight request limiter, shared by every hunt task in the
/// process. Waiters queue FIFO; a waiter dropped before acquisition never
/// consumes capacity.
pub struct RateGate {
    semaphores: Mutex<HashMap<String, Arc<Semaphore>>>,
    fallback_limit: usize,
}

impl RateGate {
    pub fn new(limits: impl IntoIterator<Item = (String, usize)>) -> Self {
        let semaphores = limits
            .into_iter()
            .map(|(provider, limit)| (provider, Arc::new(Semaphore::new(limit.max(1)))))
            .collect();
        Self {
            semaphores: Mutex::new(semaphores),
            fallback_limit: FALLBACK_LIMIT,
        }
    }

    pub fn with_defaults() -> Self {
        Self::new([
            ("openrouter".to_string(), DEFAULT_OPENROUTER_LIMIT),
            ("fireworks".to_string(), DEFAULT_FIREWORKS_LIMIT),
            ("openai".to_string(), DEFAULT_OPENAI_LIMIT),
        ])
    }

    pub async fn acquire(&self, provider: &str) -> RateGatePermit {
        let semaphore = {
            let mut semaphores = self.semaphores.lock().await;
            semaphores
                .entry(provider.to_string())
                .or_insert_with(|| Arc::new(Semaphore::new(self.fallback_limit)))
                .clone()
        };
        let permit = semaphore
            .acquire_owned()
            .await
            .expect("rate gate semaphore is never closed");
        RateGatePermit { _permit: permit }
    }

    pub async fn available(&self, provider: &str) -> Option<usize> {
        let semaphores = self.semaphores.lock().await;
        semaphores.get(provider).map(|s| s.available_permits())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn in_flight_never_exceeds_the_limit() {
        let gate = Arc::new(RateGate::new([("openrouter".to_string(), 2)]));
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let gate = gate.clone();
            let in_flight = in_flight.clone();
            let peak = peak.clone();
            handles.push(tokio::spawn(async move {
                let _permit = gate.acquire("openrouter").await;
                let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10)).await;
                in_flight.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn permits_release_on_drop() {
        let gate = RateGate::new([("openai".to_string(), 1)]);
        {
            let _permit = gate.acquire("openai").await;
            assert_eq!(gate.available("openai").await, Some(0));
        }
        assert_eq!(gate.available("openai").await, Some(1));
    }

    #[tokio::test]
    async fn cancelled_waiter_does_not_leak_capacity() {
        let gate = Arc::new(RateGate::new([("fireworks".to_string(), 1)]));
        let held = gate.acquire("fireworks").await;

        let waiter = {
            let gate = gate.clone();
            tokio::spawn(async move {
                let _permit = gate.acquire("fireworks").await;
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        waiter.abort();
        let _ = waiter.await;

        drop(held);
        // The aborted waiter must not have consumed the released slot.
        tokio::time::timeout(Duration::from_secs(1), gate.acquire("fireworks"))
            .await
            .expect("slot should be free after cancelled waiter");
    }

    #[tokio::test]
    async fn unknown_providers_get_a_bounded_fallback() {
        let gate = RateGate::with_defaults();
        let _permit = gate.acquire("somewhere-new").await;
        assert!(gate.available("somewhere-new").await.is_some());
    }
}
