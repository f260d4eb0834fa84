use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Start,
    HuntStart,
    HuntProgress,
    HuntResult,
    Complete,
    Error,
    Ping,
}

impl EventType {
    pub fn as_str(self) -> &'static str {
        match self {
            EventType::Start => "start",
            EventType::HuntStart => "hunt_start",
            EventType::HuntProgress => "hunt_progress",
            EventType::HuntResult => "hunt_result",
            EventType::Complete => "complete",
            EventType::Error => "error",
            EventType::Ping => "ping",
        }
    }

    /// `complete` and `error` close the logical stream.
    pub fn is_terminal(self) -> bool {
        matches!(self, EventType::Complete | EventType::Error)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HuntEvent {
    pub session_id: String,
    pub event_type: EventType,
    pub hunt_id: Option<u64>,
    #[serde(default)]
    pub data: Value,
}

impl HuntEvent {
    pub fn new(session_id: impl Into<String>, event_type: EventType, data: Value) -> Self {
        Self {
            session_id: session_id.into(),
            event_type,
            hunt_id: None,
            data,
        }
    }

    pub fn for_hunt(
        session_id: impl Into<String>,
        event_type: EventType,
        hunt_id: u64,
        data: Value,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            event_type,
            hunt_id: Some(hunt_id),
            data,
        }
    }
}
