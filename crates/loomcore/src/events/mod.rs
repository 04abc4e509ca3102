//! Run lifecycle events and the pub/sub hub that fans them out.

mod hub;

pub use hub::{EventHub, EventSubscription};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Lifecycle event types in the order a healthy run emits them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunEventType {
    RunStarted,
    NodeStarted,
    NodeCompleted,
    NodeLog,
    RunCompleted,
    RunFailed,
}

/// One entry in a run's append-only event log. `idx` is assigned at
/// append time and is strictly increasing within a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunEvent {
    pub idx: u64,
    pub ts: DateTime<Utc>,
    #[serde(rename = "type")]
    pub kind: RunEventType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunStatus::Running)
    }
}

/// The record of one engine run. Mutated only by engine-emitted events
/// while running; immutable once status is terminal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub id: String,
    pub flow_id: String,
    pub status: RunStatus,
    pub input: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub events: Vec<RunEvent>,
}

impl RunRecord {
    pub fn new(flow_id: impl Into<String>, input: Value) -> Self {
        Self::with_id(Uuid::new_v4().to_string(), flow_id, input)
    }

    pub fn with_id(id: impl Into<String>, flow_id: impl Into<String>, input: Value) -> Self {
        Self {
            id: id.into(),
            flow_id: flow_id.into(),
            status: RunStatus::Running,
            input,
            output: None,
            error: None,
            events: Vec::new(),
        }
    }

    /// Append an event, assigning the next monotonic `idx`.
    pub fn push_event(
        &mut self,
        kind: RunEventType,
        node_id: Option<String>,
        node_type: Option<String>,
        detail: Option<Value>,
    ) -> &RunEvent {
        let event = RunEvent {
            idx: self.events.len() as u64,
            ts: Utc::now(),
            kind,
            node_id,
            node_type,
            detail,
        };
        self.events.push(event);
        self.events.last().expect("just pushed")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn event_idx_is_monotonic() {
        let mut record = RunRecord::new("flow", json!({}));
        for _ in 0..5 {
            record.push_event(RunEventType::NodeLog, None, None, None);
        }
        let idxs: Vec<u64> = record.events.iter().map(|e| e.idx).collect();
        assert_eq!(idxs, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn event_serializes_with_flat_type_field() {
        let mut record = RunRecord::new("flow", json!({}));
        record.push_event(
            RunEventType::NodeStarted,
            Some("n1".into()),
            Some("if".into()),
            Some(json!({"vars": "{}"})),
        );
        let wire = serde_json::to_value(&record.events[0]).unwrap();
        assert_eq!(wire["type"], "node_started");
        assert_eq!(wire["nodeId"].as_str(), None); // snake_case on the wire
        assert_eq!(wire["node_id"], "n1");
    }

    #[test]
    fn optional_fields_are_omitted() {
        let mut record = RunRecord::new("flow", json!({}));
        record.push_event(RunEventType::RunStarted, None, None, None);
        let wire = serde_json::to_value(&record.events[0]).unwrap();
        assert!(wire.get("node_id").is_none());
        assert!(wire.get("detail").is_none());
    }
}
