//! Record store behavior across collections and reopen cycles.

use chrono::{Duration, Utc};
use serde_json::json;

use loomcore::{RunEventType, RunRecord, RunStatus};
use loomstore::{DeploymentRecord, EvalRunRecord, RecordStore, Reservation};

#[tokio::test]
async fn collections_survive_a_reopen() {
    let dir = tempfile::tempdir().unwrap();

    {
        let store = RecordStore::open(dir.path()).await.unwrap();

        let mut run = RunRecord::with_id("r1", "flow-1", json!({"x": 1}));
        run.push_event(RunEventType::RunStarted, None, None, None);
        run.status = RunStatus::Completed;
        store.runs.save(run).await.unwrap();

        let thread = store.threads.create_thread("agent-1", "support").await.unwrap();
        let Reservation::Granted(mut token) =
            store.threads.reserve_slots(&thread.id, 10, 1).await.unwrap()
        else {
            panic!("expected grant");
        };
        store
            .threads
            .add_message(&mut token, "user", "hello")
            .await
            .unwrap();

        store
            .eval_runs
            .save(EvalRunRecord {
                id: "e1".into(),
                agent_id: "agent-1".into(),
                flow_id: "flow-1".into(),
                finished_at: Utc::now(),
                total: 2,
                passed: 2,
                failed: 0,
                pass_rate: 100.0,
            })
            .await
            .unwrap();

        store
            .deployments
            .save(DeploymentRecord {
                id: "d1".into(),
                agent_id: "agent-1".into(),
                target: "staging".into(),
                created_at: Utc::now(),
            })
            .await
            .unwrap();

        store.flush().await.unwrap();
    }

    let store = RecordStore::open(dir.path()).await.unwrap();

    let run = store.runs.get("r1").await.unwrap();
    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.events.len(), 1);

    let threads = store.threads.list_threads(Some("agent-1")).await;
    assert_eq!(threads.len(), 1);
    assert_eq!(store.threads.messages(&threads[0].id).await.len(), 1);

    assert_eq!(store.eval_runs.latest("agent-1").await.unwrap().id, "e1");
    assert_eq!(store.deployments.latest("agent-1").await.unwrap().id, "d1");
}

#[tokio::test]
async fn concurrent_writers_cannot_exceed_the_message_cap() {
    let dir = tempfile::tempdir().unwrap();
    let store = RecordStore::open(dir.path()).await.unwrap();
    let thread = store.threads.create_thread("agent-1", "busy").await.unwrap();

    let cap = 5;
    let mut tasks = Vec::new();
    for i in 0..20 {
        let store = store.clone();
        let thread_id = thread.id.clone();
        tasks.push(tokio::spawn(async move {
            match store.threads.reserve_slots(&thread_id, cap, 1).await.unwrap() {
                Reservation::Granted(mut token) => {
                    store
                        .threads
                        .add_message(&mut token, "user", format!("m{i}"))
                        .await
                        .unwrap();
                    true
                }
                Reservation::Denied { .. } => false,
            }
        }));
    }

    let mut admitted = 0;
    for task in tasks {
        if task.await.unwrap() {
            admitted += 1;
        }
    }

    assert_eq!(admitted, cap as usize);
    assert_eq!(store.threads.messages(&thread.id).await.len(), cap as usize);
}

#[tokio::test]
async fn latest_pointer_tracks_supersession() {
    let dir = tempfile::tempdir().unwrap();
    let store = RecordStore::open(dir.path()).await.unwrap();

    let base = Utc::now();
    for (id, offset) in [("first", 0), ("second", 60)] {
        store
            .deployments
            .save(DeploymentRecord {
                id: id.into(),
                agent_id: "agent-1".into(),
                target: "prod".into(),
                created_at: base + Duration::seconds(offset),
            })
            .await
            .unwrap();
    }
    assert_eq!(store.deployments.latest("agent-1").await.unwrap().id, "second");

    store.deployments.delete("second").await.unwrap();
    assert_eq!(store.deployments.latest("agent-1").await.unwrap().id, "first");
}
