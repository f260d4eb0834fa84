use std::collections::{HashMap, VecDeque};
use std::pin::Pin;
use std::sync::Arc;

use async_stream::stream;
use futures::Stream;
use tokio::sync::{broadcast, RwLock};
use tracing::debug;

use quarry_types::HuntEvent;

pub const DEFAULT_RETAINED_EVENTS: usize = 256;
const BROADCAST_CAPACITY: usize = 2048;

struct SessionStream {
    next_id: u64,
    entries: VecDeque<(u64, HuntEvent)>,
    tx: broadcast::Sender<(u64, HuntEvent)>,
}

impl SessionStream {
    fn new() -> Self {
        let (tx, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self {
            next_id: 1,
            entries: VecDeque::new(),
            tx,
        }
    }
}

/// Per-session append-only event log with server-assigned monotonic ids.
///
/// Retention is a bounded ring of the most recent events per session;
/// subscribers that fall behind recover from the ring, so delivery is
/// at-least-once with strictly increasing ids per subscription.
#[derive(Clone)]
pub struct EventBus {
    streams: Arc<RwLock<HashMap<String, SessionStream>>>,
    retain: usize,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_retention(DEFAULT_RETAINED_EVENTS)
    }

    pub fn with_retention(retain: usize) -> Self {
        Self {
            streams: Arc::new(RwLock::new(HashMap::new())),
            retain: retain.max(1),
        }
    }

    /// Appends an event and returns its assigned id.
    pub async fn publish(&self, event: HuntEvent) -> u64 {
        let mut streams = self.streams.write().await;
        let stream = streams
            .entry(event.session_id.clone())
            .or_insert_with(SessionStream::new);
        let id = stream.next_id;
        stream.next_id += 1;
        stream.entries.push_back((id, event.clone()));
        while stream.entries.len() > self.retain {
            stream.entries.pop_front();
        }
        let _ = stream.tx.send((id, event));
        id
    }

    /// All retained events strictly after `from_id`, in id order.
    pub async fn replay(&self, session_id: &str, from_id: u64) -> Vec<(u64, HuntEvent)> {
        let streams = self.streams.read().await;
        let Some(stream) = streams.get(session_id) else {
            return Vec::new();
        };
        stream
            .entries
            .iter()
            .filter(|(id, _)| *id > from_id)
            .cloned()
            .collect()
    }

    /// The id of the newest retained event, or 0 when nothing was published.
    pub async fn tail_id(&self, session_id: &str) -> u64 {
        let streams = self.streams.read().await;
        streams
            .get(session_id)
            .map(|s| s.next_id - 1)
            .unwrap_or(0)
    }

    /// Yields `(id, event)` pairs in id order, starting strictly after
    /// `from_id` (0 for everything retained). Replays the backlog first,
    /// then blocks on live events. Never yields an id twice and never
    /// skips a retained id, including across broadcast lag.
    pub async fn subscribe(
        &self,
        session_id: &str,
        from_id: u64,
    ) -> Pin<Box<dyn Stream<Item = (u64, HuntEvent)> + Send>> {
        let (mut rx, backlog) = {
            let mut streams = self.streams.write().await;
            let stream = streams
                .entry(session_id.to_string())
                .or_insert_with(SessionStream::new);
            let rx = stream.tx.subscribe();
            let backlog: Vec<(u64, HuntEvent)> = stream
                .entries
                .iter()
                .filter(|(id, _)| *id > from_id)
                .cloned()
                .collect();
            (rx, backlog)
        };

        let bus = self.clone();
        let session_id = session_id.to_string();
        Box::pin(stream! {
            let mut last = from_id;
            for (id, event) in backlog {
                last = id;
                yield (id, event);
            }
            loop {
                match rx.recv().await {
                    Ok((id, event)) => {
                        if id <= last {
                            continue;
                        }
                        last = id;
                        yield (id, event);
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!(session_id = %session_id, skipped, "event subscriber lagged, refilling from retained log");
                        for (id, event) in bus.replay(&session_id, last).await {
                            last = id;
                            yield (id, event);
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
