//! File-backed record store.
//!
//! One JSON document per collection, written atomically (temp file then
//! rename) behind a per-collection write gate. Collections:
//! runs, threads, thread messages, eval runs and deployments.

mod agents;
mod error;
mod persist;
mod records;
mod runs;
mod threads;

pub use agents::AgentCollection;
pub use error::StoreError;
pub use records::{
    AgentScoped, DeploymentRecord, EvalRunRecord, Reservation, ReservationToken,
    ThreadMessageRecord, ThreadRecord,
};
pub use runs::{RunStore, DEFAULT_EVENT_DEBOUNCE};
pub use threads::ThreadStore;

use std::path::Path;

/// All collections rooted under one data directory.
#[derive(Clone)]
pub struct RecordStore {
    pub runs: RunStore,
    pub threads: ThreadStore,
    pub eval_runs: AgentCollection<EvalRunRecord>,
    pub deployments: AgentCollection<DeploymentRecord>,
}

impl RecordStore {
    pub async fn open(dir: impl AsRef<Path>) -> Result<Self, StoreError> {
        let dir = dir.as_ref();
        tokio::fs::create_dir_all(dir).await?;

        Ok(Self {
            runs: RunStore::open(dir.join("runs.json"), DEFAULT_EVENT_DEBOUNCE).await?,
            threads: ThreadStore::open(
                dir.join("threads.json"),
                dir.join("thread_messages.json"),
            )
            .await?,
            eval_runs: AgentCollection::open(dir.join("eval_runs.json")).await?,
            deployments: AgentCollection::open(dir.join("deployments.json")).await?,
        })
    }

    /// Push any buffered writes to disk. Call before shutdown.
    pub async fn flush(&self) -> Result<(), StoreError> {
        self.runs.flush().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn open_creates_the_data_directory() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("data/store");
        let store = RecordStore::open(&nested).await.unwrap();
        assert!(nested.is_dir());
        store.flush().await.unwrap();
    }
}
