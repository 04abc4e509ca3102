use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThreadRecord {
    pub id: String,
    pub agent_id: String,
    pub title: String,
    pub created_at: DateTime<Utc>,
}

impl ThreadRecord {
    pub fn new(agent_id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            agent_id: agent_id.into(),
            title: title.into(),
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThreadMessageRecord {
    pub id: String,
    pub thread_id: String,
    pub role: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

/// Proof of an admitted write quota for one thread. Short-lived: either
/// consumed by message appends or released; never persisted.
#[derive(Debug)]
pub struct ReservationToken {
    pub(crate) thread_id: String,
    pub(crate) slots: u32,
}

impl ReservationToken {
    pub fn thread_id(&self) -> &str {
        &self.thread_id
    }

    pub fn remaining(&self) -> u32 {
        self.slots
    }
}

/// Outcome of a slot reservation. Denial is a normal answer, not an
/// error: the caller decides whether to trim, retry or give up.
#[derive(Debug)]
pub enum Reservation {
    Granted(ReservationToken),
    Denied { current: u32, reserved: u32, cap: u32 },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvalRunRecord {
    pub id: String,
    pub agent_id: String,
    pub flow_id: String,
    pub finished_at: DateTime<Utc>,
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub pass_rate: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentRecord {
    pub id: String,
    pub agent_id: String,
    pub target: String,
    pub created_at: DateTime<Utc>,
}

/// Records that belong to an agent and compete for its "latest" slot.
pub trait AgentScoped {
    fn id(&self) -> &str;
    fn agent_id(&self) -> &str;
    /// The timestamp the latest pointer orders by.
    fn ordering_ts(&self) -> DateTime<Utc>;
}

impl AgentScoped for EvalRunRecord {
    fn id(&self) -> &str {
        &self.id
    }
    fn agent_id(&self) -> &str {
        &self.agent_id
    }
    fn ordering_ts(&self) -> DateTime<Utc> {
        self.finished_at
    }
}

impl AgentScoped for DeploymentRecord {
    fn id(&self) -> &str {
        &self.id
    }
    fn agent_id(&self) -> &str {
        &self.agent_id
    }
    fn ordering_ts(&self) -> DateTime<Utc> {
        self.created_at
    }
}
