//! Agent-scoped collections with an incrementally maintained "latest"
//! pointer per agent.
//!
//! The pointer orders by `(timestamp, id)`. Saves compare the incoming
//! record against the cached pointer only; a full scan of an agent's
//! records happens when the cached record itself was edited, superseded
//! downward, or deleted. The whole collection is scanned once, at load.

use std::cmp::Ordering as CmpOrdering;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::error::StoreError;
use crate::persist;
use crate::records::AgentScoped;

#[derive(Clone)]
pub struct AgentCollection<T> {
    inner: Arc<Inner<T>>,
}

struct Inner<T> {
    path: PathBuf,
    state: Mutex<State<T>>,
    write_gate: Mutex<()>,
}

struct State<T> {
    records: HashMap<String, T>,
    /// agent id -> id of that agent's latest record
    latest: HashMap<String, String>,
}

fn order<T: AgentScoped>(a: &T, b: &T) -> CmpOrdering {
    a.ordering_ts()
        .cmp(&b.ordering_ts())
        .then_with(|| a.id().cmp(b.id()))
}

impl<T> AgentCollection<T>
where
    T: AgentScoped + Clone + serde::Serialize + serde::de::DeserializeOwned,
{
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let records: HashMap<String, T> = persist::load_json(&path).await?.unwrap_or_default();

        let mut latest: HashMap<String, String> = HashMap::new();
        for record in records.values() {
            let replace = match latest.get(record.agent_id()) {
                None => true,
                Some(current_id) => records
                    .get(current_id)
                    .map_or(true, |current| order(record, current) == CmpOrdering::Greater),
            };
            if replace {
                latest.insert(record.agent_id().to_string(), record.id().to_string());
            }
        }

        Ok(Self {
            inner: Arc::new(Inner {
                path,
                state: Mutex::new(State { records, latest }),
                write_gate: Mutex::new(()),
            }),
        })
    }

    pub async fn save(&self, record: T) -> Result<(), StoreError> {
        {
            let mut state = self.inner.state.lock().await;
            let agent = record.agent_id().to_string();
            let id = record.id().to_string();
            let cached = state.latest.get(&agent).cloned();

            state.records.insert(id.clone(), record);

            match cached {
                None => {
                    state.latest.insert(agent, id);
                }
                // the cached record itself changed: its timestamp may
                // have moved either way, so recompute the agent
                Some(cached_id) if cached_id == id => {
                    Self::recompute_agent(&mut state, &agent);
                }
                Some(cached_id) => {
                    let incoming = &state.records[&id];
                    let supersedes = state
                        .records
                        .get(&cached_id)
                        .map_or(true, |current| order(incoming, current) == CmpOrdering::Greater);
                    if supersedes {
                        state.latest.insert(agent, id);
                    }
                }
            }
        }
        self.persist_now().await
    }

    pub async fn delete(&self, id: &str) -> Result<bool, StoreError> {
        let removed = {
            let mut state = self.inner.state.lock().await;
            match state.records.remove(id) {
                None => false,
                Some(record) => {
                    let agent = record.agent_id().to_string();
                    if state.latest.get(&agent).map(String::as_str) == Some(id) {
                        Self::recompute_agent(&mut state, &agent);
                    }
                    true
                }
            }
        };
        if removed {
            self.persist_now().await?;
        }
        Ok(removed)
    }

    pub async fn get(&self, id: &str) -> Option<T> {
        self.inner.state.lock().await.records.get(id).cloned()
    }

    pub async fn latest(&self, agent_id: &str) -> Option<T> {
        let state = self.inner.state.lock().await;
        let id = state.latest.get(agent_id)?;
        state.records.get(id).cloned()
    }

    pub async fn list(&self, agent_id: &str) -> Vec<T> {
        let state = self.inner.state.lock().await;
        let mut records: Vec<T> = state
            .records
            .values()
            .filter(|r| r.agent_id() == agent_id)
            .cloned()
            .collect();
        records.sort_by(order);
        records
    }

    /// Scan one agent's records and rebuild its pointer.
    fn recompute_agent(state: &mut State<T>, agent_id: &str) {
        let best = state
            .records
            .values()
            .filter(|r| r.agent_id() == agent_id)
            .max_by(|a, b| order(*a, *b))
            .map(|r| r.id().to_string());
        match best {
            Some(id) => {
                state.latest.insert(agent_id.to_string(), id);
            }
            None => {
                state.latest.remove(agent_id);
            }
        }
    }

    async fn persist_now(&self) -> Result<(), StoreError> {
        let _gate = self.inner.write_gate.lock().await;
        let snapshot = self.inner.state.lock().await.records.clone();
        persist::save_json(&self.inner.path, &snapshot).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::EvalRunRecord;
    use chrono::{Duration, Utc};

    fn eval(id: &str, agent: &str, offset_secs: i64) -> EvalRunRecord {
        EvalRunRecord {
            id: id.into(),
            agent_id: agent.into(),
            flow_id: "flow".into(),
            finished_at: Utc::now() + Duration::seconds(offset_secs),
            total: 3,
            passed: 3,
            failed: 0,
            pass_rate: 100.0,
        }
    }

    async fn collection(dir: &tempfile::TempDir) -> AgentCollection<EvalRunRecord> {
        AgentCollection::open(dir.path().join("eval_runs.json"))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn latest_is_independent_of_save_order() {
        let dir = tempfile::tempdir().unwrap();
        let c = collection(&dir).await;

        c.save(eval("b", "agent-1", 100)).await.unwrap();
        c.save(eval("a", "agent-1", 50)).await.unwrap();

        assert_eq!(c.latest("agent-1").await.unwrap().id, "b");
    }

    #[tokio::test]
    async fn id_breaks_timestamp_ties() {
        let dir = tempfile::tempdir().unwrap();
        let c = collection(&dir).await;

        let ts = Utc::now();
        let mut x = eval("x", "agent-1", 0);
        x.finished_at = ts;
        let mut y = eval("y", "agent-1", 0);
        y.finished_at = ts;

        c.save(y).await.unwrap();
        c.save(x).await.unwrap();
        assert_eq!(c.latest("agent-1").await.unwrap().id, "y");
    }

    #[tokio::test]
    async fn deleting_latest_recomputes_pointer() {
        let dir = tempfile::tempdir().unwrap();
        let c = collection(&dir).await;

        c.save(eval("old", "agent-1", 0)).await.unwrap();
        c.save(eval("new", "agent-1", 60)).await.unwrap();
        assert!(c.delete("new").await.unwrap());
        assert_eq!(c.latest("agent-1").await.unwrap().id, "old");

        assert!(c.delete("old").await.unwrap());
        assert!(c.latest("agent-1").await.is_none());
    }

    #[tokio::test]
    async fn editing_cached_record_backwards_moves_pointer() {
        let dir = tempfile::tempdir().unwrap();
        let c = collection(&dir).await;

        c.save(eval("a", "agent-1", 0)).await.unwrap();
        c.save(eval("b", "agent-1", 60)).await.unwrap();

        // push the cached latest behind "a"
        c.save(eval("b", "agent-1", -60)).await.unwrap();
        assert_eq!(c.latest("agent-1").await.unwrap().id, "a");
    }

    #[tokio::test]
    async fn agents_do_not_interfere() {
        let dir = tempfile::tempdir().unwrap();
        let c = collection(&dir).await;

        c.save(eval("a1", "agent-1", 0)).await.unwrap();
        c.save(eval("b1", "agent-2", 500)).await.unwrap();
        assert_eq!(c.latest("agent-1").await.unwrap().id, "a1");
        assert_eq!(c.latest("agent-2").await.unwrap().id, "b1");
    }

    #[tokio::test]
    async fn pointers_rebuild_on_load() {
        let dir = tempfile::tempdir().unwrap();
        {
            let c = collection(&dir).await;
            c.save(eval("early", "agent-1", 0)).await.unwrap();
            c.save(eval("late", "agent-1", 60)).await.unwrap();
        }
        let reopened = collection(&dir).await;
        assert_eq!(reopened.latest("agent-1").await.unwrap().id, "late");
        assert_eq!(reopened.list("agent-1").await.len(), 2);
    }
}
