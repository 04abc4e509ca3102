//! Threads and messages with two-phase admission.
//!
//! Appending a message first reserves a slot under a per-thread gate so
//! that two concurrent writers cannot both pass a capacity check and
//! overshoot the cap. A reservation is either consumed by appends or
//! released; gates with no outstanding reservations are reaped.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::StoreError;
use crate::persist;
use crate::records::{Reservation, ReservationToken, ThreadMessageRecord, ThreadRecord};

#[derive(Clone)]
pub struct ThreadStore {
    inner: Arc<Inner>,
}

struct Inner {
    threads_path: PathBuf,
    messages_path: PathBuf,
    state: Mutex<State>,
    write_gate: Mutex<()>,
    gates: std::sync::Mutex<HashMap<String, Arc<Gate>>>,
}

#[derive(Default)]
struct State {
    threads: HashMap<String, ThreadRecord>,
    messages: HashMap<String, Vec<ThreadMessageRecord>>,
}

/// Per-thread admission gate. The mutex serializes check-and-grant;
/// `reserved` counts granted-but-unconsumed slots.
struct Gate {
    lock: Mutex<()>,
    reserved: AtomicU32,
}

impl ThreadStore {
    pub async fn open(
        threads_path: impl AsRef<Path>,
        messages_path: impl AsRef<Path>,
    ) -> Result<Self, StoreError> {
        let threads_path = threads_path.as_ref().to_path_buf();
        let messages_path = messages_path.as_ref().to_path_buf();
        let threads: HashMap<String, ThreadRecord> =
            persist::load_json(&threads_path).await?.unwrap_or_default();
        let messages: HashMap<String, Vec<ThreadMessageRecord>> =
            persist::load_json(&messages_path).await?.unwrap_or_default();
        Ok(Self {
            inner: Arc::new(Inner {
                threads_path,
                messages_path,
                state: Mutex::new(State { threads, messages }),
                write_gate: Mutex::new(()),
                gates: std::sync::Mutex::new(HashMap::new()),
            }),
        })
    }

    pub async fn create_thread(
        &self,
        agent_id: impl Into<String>,
        title: impl Into<String>,
    ) -> Result<ThreadRecord, StoreError> {
        let record = ThreadRecord::new(agent_id, title);
        {
            let mut state = self.inner.state.lock().await;
            state.threads.insert(record.id.clone(), record.clone());
        }
        self.persist_threads().await?;
        Ok(record)
    }

    pub async fn get_thread(&self, thread_id: &str) -> Option<ThreadRecord> {
        self.inner.state.lock().await.threads.get(thread_id).cloned()
    }

    pub async fn list_threads(&self, agent_id: Option<&str>) -> Vec<ThreadRecord> {
        let state = self.inner.state.lock().await;
        let mut threads: Vec<ThreadRecord> = state
            .threads
            .values()
            .filter(|t| agent_id.map_or(true, |a| t.agent_id == a))
            .cloned()
            .collect();
        threads.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        threads
    }

    pub async fn messages(&self, thread_id: &str) -> Vec<ThreadMessageRecord> {
        self.inner
            .state
            .lock()
            .await
            .messages
            .get(thread_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Atomically reserve `n` message slots against `cap`. The check
    /// and the grant happen under the thread's gate, so concurrent
    /// callers see each other's outstanding reservations.
    pub async fn reserve_slots(
        &self,
        thread_id: &str,
        cap: u32,
        n: u32,
    ) -> Result<Reservation, StoreError> {
        {
            let state = self.inner.state.lock().await;
            if !state.threads.contains_key(thread_id) {
                return Err(StoreError::UnknownThread(thread_id.to_string()));
            }
        }

        let gate = self.gate(thread_id);
        let _admission = gate.lock.lock().await;

        let current = {
            let state = self.inner.state.lock().await;
            state.messages.get(thread_id).map_or(0, |m| m.len()) as u32
        };
        let reserved = gate.reserved.load(Ordering::SeqCst);

        if current + reserved + n > cap {
            return Ok(Reservation::Denied {
                current,
                reserved,
                cap,
            });
        }

        gate.reserved.fetch_add(n, Ordering::SeqCst);
        Ok(Reservation::Granted(ReservationToken {
            thread_id: thread_id.to_string(),
            slots: n,
        }))
    }

    /// Append a message, consuming one reserved slot from the token.
    pub async fn add_message(
        &self,
        token: &mut ReservationToken,
        role: impl Into<String>,
        content: impl Into<String>,
    ) -> Result<ThreadMessageRecord, StoreError> {
        if token.slots == 0 {
            return Err(StoreError::ReservationExhausted(token.thread_id.clone()));
        }

        let record = ThreadMessageRecord {
            id: Uuid::new_v4().to_string(),
            thread_id: token.thread_id.clone(),
            role: role.into(),
            content: content.into(),
            created_at: Utc::now(),
        };

        {
            let mut state = self.inner.state.lock().await;
            if !state.threads.contains_key(&token.thread_id) {
                return Err(StoreError::UnknownThread(token.thread_id.clone()));
            }
            state
                .messages
                .entry(token.thread_id.clone())
                .or_default()
                .push(record.clone());
        }

        token.slots -= 1;
        {
            let gate = self.gate(&token.thread_id);
            gate.reserved.fetch_sub(1, Ordering::SeqCst);
        }
        self.reap_gate(&token.thread_id);

        self.persist_messages().await?;
        Ok(record)
    }

    /// Return a token's unconsumed slots. Call on abandonment so a
    /// crashed writer does not leak capacity forever.
    pub fn release(&self, token: ReservationToken) {
        if token.slots > 0 {
            let gate = self.gate(&token.thread_id);
            gate.reserved.fetch_sub(token.slots, Ordering::SeqCst);
        }
        self.reap_gate(&token.thread_id);
    }

    fn gate(&self, thread_id: &str) -> Arc<Gate> {
        let mut gates = self.inner.gates.lock().unwrap_or_else(|e| e.into_inner());
        gates
            .entry(thread_id.to_string())
            .or_insert_with(|| {
                Arc::new(Gate {
                    lock: Mutex::new(()),
                    reserved: AtomicU32::new(0),
                })
            })
            .clone()
    }

    /// Drop an idle gate. Only safe when nobody else holds the gate:
    /// with the map locked, a strong count of 1 means the map holds the
    /// only reference, so no reservation can race the removal.
    fn reap_gate(&self, thread_id: &str) {
        let mut gates = self.inner.gates.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(gate) = gates.get(thread_id) {
            if gate.reserved.load(Ordering::SeqCst) == 0 && Arc::strong_count(gate) == 1 {
                gates.remove(thread_id);
            }
        }
    }

    async fn persist_threads(&self) -> Result<(), StoreError> {
        let _gate = self.inner.write_gate.lock().await;
        let snapshot = self.inner.state.lock().await.threads.clone();
        persist::save_json(&self.inner.threads_path, &snapshot).await
    }

    async fn persist_messages(&self) -> Result<(), StoreError> {
        let _gate = self.inner.write_gate.lock().await;
        let snapshot = self.inner.state.lock().await.messages.clone();
        persist::save_json(&self.inner.messages_path, &snapshot).await
    }

    #[cfg(test)]
    fn gate_count(&self) -> usize {
        self.inner.gates.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn store(dir: &tempfile::TempDir) -> ThreadStore {
        ThreadStore::open(
            dir.path().join("threads.json"),
            dir.path().join("messages.json"),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn grant_then_deny_at_cap() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir).await;
        let thread = store.create_thread("agent-1", "t").await.unwrap();

        let first = store.reserve_slots(&thread.id, 2, 2).await.unwrap();
        assert!(matches!(first, Reservation::Granted(_)));

        let second = store.reserve_slots(&thread.id, 2, 1).await.unwrap();
        match second {
            Reservation::Denied {
                current,
                reserved,
                cap,
            } => {
                assert_eq!((current, reserved, cap), (0, 2, 2));
            }
            Reservation::Granted(_) => panic!("cap should be exhausted"),
        }
    }

    #[tokio::test]
    async fn concurrent_reservations_respect_cap() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir).await;
        let thread = store.create_thread("agent-1", "t").await.unwrap();

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            let id = thread.id.clone();
            tasks.push(tokio::spawn(
                async move { store.reserve_slots(&id, 1, 1).await },
            ));
        }

        let mut granted = 0;
        for task in tasks {
            if let Reservation::Granted(token) = task.await.unwrap().unwrap() {
                granted += 1;
                store.release(token);
            }
        }
        assert_eq!(granted, 1);
    }

    #[tokio::test]
    async fn add_message_consumes_slots() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir).await;
        let thread = store.create_thread("agent-1", "t").await.unwrap();

        let Reservation::Granted(mut token) = store.reserve_slots(&thread.id, 10, 2).await.unwrap()
        else {
            panic!("expected grant");
        };

        store.add_message(&mut token, "user", "hi").await.unwrap();
        store.add_message(&mut token, "assistant", "hello").await.unwrap();
        let err = store.add_message(&mut token, "user", "again").await.unwrap_err();
        assert!(matches!(err, StoreError::ReservationExhausted(_)));

        assert_eq!(store.messages(&thread.id).await.len(), 2);
    }

    #[tokio::test]
    async fn release_returns_capacity() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir).await;
        let thread = store.create_thread("agent-1", "t").await.unwrap();

        let Reservation::Granted(token) = store.reserve_slots(&thread.id, 1, 1).await.unwrap()
        else {
            panic!("expected grant");
        };
        store.release(token);

        let retry = store.reserve_slots(&thread.id, 1, 1).await.unwrap();
        assert!(matches!(retry, Reservation::Granted(_)));
    }

    #[tokio::test]
    async fn idle_gates_are_reaped() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir).await;
        let thread = store.create_thread("agent-1", "t").await.unwrap();

        let Reservation::Granted(token) = store.reserve_slots(&thread.id, 5, 1).await.unwrap()
        else {
            panic!("expected grant");
        };
        store.release(token);
        assert_eq!(store.gate_count(), 0);
    }

    #[tokio::test]
    async fn messages_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let thread_id;
        {
            let store = store(&dir).await;
            let thread = store.create_thread("agent-1", "t").await.unwrap();
            thread_id = thread.id.clone();
            let Reservation::Granted(mut token) =
                store.reserve_slots(&thread.id, 5, 1).await.unwrap()
            else {
                panic!("expected grant");
            };
            store.add_message(&mut token, "user", "persist me").await.unwrap();
        }

        let reopened = ThreadStore::open(
            dir.path().join("threads.json"),
            dir.path().join("messages.json"),
        )
        .await
        .unwrap();
        let messages = reopened.messages(&thread_id).await;
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].content, "persist me");
    }

    #[tokio::test]
    async fn reserving_on_unknown_thread_errors() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir).await;
        let err = store.reserve_slots("ghost", 5, 1).await.unwrap_err();
        assert!(matches!(err, StoreError::UnknownThread(_)));
    }
}
