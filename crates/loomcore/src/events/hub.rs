//! Per-run fan-out of serialized run events.
//!
//! The hub is independent of the engine's control flow: publishing is
//! best-effort and never blocks the run that produced the event. A
//! closed subscriber is pruned lazily on the next publish to its run.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

use super::RunEvent;

struct Subscriber {
    id: Uuid,
    tx: mpsc::UnboundedSender<Arc<str>>,
}

#[derive(Default)]
struct HubState {
    // run id → live subscriber connections
    runs: HashMap<String, Vec<Subscriber>>,
}

/// Fan-out hub for run events. Cheap to clone; all clones share state.
#[derive(Clone, Default)]
pub struct EventHub {
    state: Arc<RwLock<HubState>>,
}

impl EventHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to one run's event stream. Dropping the subscription
    /// closes the connection; the hub notices on the next publish.
    pub async fn subscribe(&self, run_id: &str) -> EventSubscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = Uuid::new_v4();
        let mut state = self.state.write().await;
        state
            .runs
            .entry(run_id.to_string())
            .or_default()
            .push(Subscriber { id, tx });
        EventSubscription { id, rx }
    }

    /// Serialize the event once and deliver to every open subscriber of
    /// the run. Unsendable connections are pruned; delivery to the rest
    /// is unaffected.
    pub async fn publish(&self, run_id: &str, event: &RunEvent) {
        let envelope: Arc<str> = match serde_json::to_string(event) {
            Ok(json) => json.into(),
            Err(e) => {
                tracing::error!("failed to serialize run event: {e}");
                return;
            }
        };

        let mut state = self.state.write().await;
        let Some(subscribers) = state.runs.get_mut(run_id) else {
            return;
        };
        subscribers.retain(|sub| {
            let alive = sub.tx.send(Arc::clone(&envelope)).is_ok();
            if !alive {
                tracing::debug!(subscriber = %sub.id, run = run_id, "pruning closed subscriber");
            }
            alive
        });
        if subscribers.is_empty() {
            state.runs.remove(run_id);
        }
    }

    /// Drop all subscribers of a finished run.
    pub async fn close_run(&self, run_id: &str) {
        self.state.write().await.runs.remove(run_id);
    }

    pub async fn subscriber_count(&self, run_id: &str) -> usize {
        self.state
            .read()
            .await
            .runs
            .get(run_id)
            .map(|s| s.len())
            .unwrap_or(0)
    }
}

/// Receiving side of one hub subscription. Yields events as serialized
/// JSON envelopes, ready to write to a socket without re-encoding.
pub struct EventSubscription {
    #[allow(dead_code)]
    id: Uuid,
    rx: mpsc::UnboundedReceiver<Arc<str>>,
}

impl EventSubscription {
    /// Next event envelope, or `None` once the run's stream is closed.
    pub async fn recv(&mut self) -> Option<Arc<str>> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Arc<str>> {
        self.rx.try_recv().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::RunEventType;
    use chrono::Utc;

    fn event(idx: u64) -> RunEvent {
        RunEvent {
            idx,
            ts: Utc::now(),
            kind: RunEventType::NodeLog,
            node_id: None,
            node_type: None,
            detail: None,
        }
    }

    #[tokio::test]
    async fn delivers_to_all_subscribers_of_a_run() {
        let hub = EventHub::new();
        let mut a = hub.subscribe("r1").await;
        let mut b = hub.subscribe("r1").await;
        let mut other = hub.subscribe("r2").await;

        hub.publish("r1", &event(0)).await;

        assert!(a.recv().await.is_some());
        assert!(b.recv().await.is_some());
        assert!(other.try_recv().is_none());
    }

    #[tokio::test]
    async fn closed_subscriber_is_pruned_without_blocking_others() {
        let hub = EventHub::new();
        let dead = hub.subscribe("r1").await;
        let mut live = hub.subscribe("r1").await;
        drop(dead);

        hub.publish("r1", &event(0)).await;
        assert!(live.recv().await.is_some());
        assert_eq!(hub.subscriber_count("r1").await, 1);
    }

    #[tokio::test]
    async fn close_run_drops_all_subscribers() {
        let hub = EventHub::new();
        let mut sub = hub.subscribe("r1").await;
        hub.close_run("r1").await;
        assert!(sub.recv().await.is_none());
    }
}
