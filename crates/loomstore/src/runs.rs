//! Run record collection with debounced event persistence.
//!
//! Event appends arrive at node cadence, far faster than the disk
//! should see. Appends mutate memory immediately and schedule one
//! deferred write per debounce window; terminal saves and `flush`
//! write through synchronously.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;

use loomcore::{RunEvent, RunRecord};

use crate::error::StoreError;
use crate::persist;

pub const DEFAULT_EVENT_DEBOUNCE: Duration = Duration::from_millis(250);

#[derive(Clone)]
pub struct RunStore {
    inner: Arc<Inner>,
}

struct Inner {
    path: PathBuf,
    state: Mutex<HashMap<String, RunRecord>>,
    // serializes file writes so snapshots land in order
    write_gate: Mutex<()>,
    flush_scheduled: AtomicBool,
    debounce: Duration,
}

impl RunStore {
    pub async fn open(path: impl AsRef<Path>, debounce: Duration) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let existing: HashMap<String, RunRecord> =
            persist::load_json(&path).await?.unwrap_or_default();
        Ok(Self {
            inner: Arc::new(Inner {
                path,
                state: Mutex::new(existing),
                write_gate: Mutex::new(()),
                flush_scheduled: AtomicBool::new(false),
                debounce,
            }),
        })
    }

    /// Upsert a whole record and write through immediately. Used for
    /// run creation and terminal status transitions.
    pub async fn save(&self, record: RunRecord) -> Result<(), StoreError> {
        {
            let mut state = self.inner.state.lock().await;
            state.insert(record.id.clone(), record);
        }
        self.persist_now().await
    }

    /// Append one event in memory and schedule a deferred write.
    pub async fn append_event(&self, run_id: &str, event: RunEvent) -> Result<(), StoreError> {
        {
            let mut state = self.inner.state.lock().await;
            let record = state
                .get_mut(run_id)
                .ok_or_else(|| StoreError::UnknownRun(run_id.to_string()))?;
            record.events.push(event);
        }
        self.schedule_flush();
        Ok(())
    }

    pub async fn get(&self, run_id: &str) -> Option<RunRecord> {
        self.inner.state.lock().await.get(run_id).cloned()
    }

    pub async fn list(&self) -> Vec<RunRecord> {
        self.inner.state.lock().await.values().cloned().collect()
    }

    /// Write the current state out now, regardless of the debounce
    /// window. Shutdown paths and tests call this.
    pub async fn flush(&self) -> Result<(), StoreError> {
        self.persist_now().await
    }

    fn schedule_flush(&self) {
        if self.inner.flush_scheduled.swap(true, Ordering::SeqCst) {
            return;
        }
        let store = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(store.inner.debounce).await;
            store.inner.flush_scheduled.store(false, Ordering::SeqCst);
            if let Err(e) = store.persist_now().await {
                tracing::error!(error = %e, "deferred run persistence failed");
            }
        });
    }

    async fn persist_now(&self) -> Result<(), StoreError> {
        let _gate = self.inner.write_gate.lock().await;
        let snapshot = self.inner.state.lock().await.clone();
        persist::save_json(&self.inner.path, &snapshot).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use loomcore::{RunEventType, RunStatus};
    use serde_json::json;

    fn record(id: &str) -> RunRecord {
        RunRecord::with_id(id, "flow-1", json!({"x": 1}))
    }

    #[tokio::test]
    async fn save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("runs.json");

        let store = RunStore::open(&path, DEFAULT_EVENT_DEBOUNCE).await.unwrap();
        store.save(record("r1")).await.unwrap();

        let reopened = RunStore::open(&path, DEFAULT_EVENT_DEBOUNCE).await.unwrap();
        let loaded = reopened.get("r1").await.unwrap();
        assert_eq!(loaded.flow_id, "flow-1");
        assert_eq!(loaded.status, RunStatus::Running);
    }

    #[tokio::test]
    async fn appended_events_survive_flush() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("runs.json");

        let store = RunStore::open(&path, DEFAULT_EVENT_DEBOUNCE).await.unwrap();
        let mut rec = record("r1");
        rec.push_event(RunEventType::RunStarted, None, None, None);
        store.save(rec).await.unwrap();

        for i in 0..10 {
            let mut probe = store.get("r1").await.unwrap();
            let event = probe
                .push_event(
                    RunEventType::NodeLog,
                    Some(format!("n{i}")),
                    None,
                    Some(json!({"i": i})),
                )
                .clone();
            store.append_event("r1", event).await.unwrap();
        }
        store.flush().await.unwrap();

        let reopened = RunStore::open(&path, DEFAULT_EVENT_DEBOUNCE).await.unwrap();
        assert_eq!(reopened.get("r1").await.unwrap().events.len(), 11);
    }

    #[tokio::test]
    async fn debounced_write_lands_without_explicit_flush() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("runs.json");

        let store = RunStore::open(&path, Duration::from_millis(20)).await.unwrap();
        let mut rec = record("r1");
        let event = rec
            .push_event(RunEventType::RunStarted, None, None, None)
            .clone();
        store.save(rec).await.unwrap();
        store.append_event("r1", event).await.unwrap();

        tokio::time::sleep(Duration::from_millis(120)).await;

        let reopened = RunStore::open(&path, DEFAULT_EVENT_DEBOUNCE).await.unwrap();
        assert_eq!(reopened.get("r1").await.unwrap().events.len(), 2);
    }

    #[tokio::test]
    async fn append_to_unknown_run_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = RunStore::open(dir.path().join("runs.json"), DEFAULT_EVENT_DEBOUNCE)
            .await
            .unwrap();
        let mut rec = record("ghost");
        let event = rec
            .push_event(RunEventType::RunStarted, None, None, None)
            .clone();
        let err = store.append_event("ghost", event).await.unwrap_err();
        assert!(matches!(err, StoreError::UnknownRun(_)));
    }
}
