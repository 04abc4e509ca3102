//! The execution engine: a sequential interpreter over a compiled flow.
//!
//! One run executes its nodes strictly sequentially. Each step looks up
//! the current node, emits `node_started`, invokes the kind's handler,
//! emits `node_completed`, then resolves the next node through the
//! outgoing canonical-port edges. Liveness is bounded by the policy's
//! step budget plus per-node timeouts; there is no engine-level
//! cancellation.

use std::sync::Arc;

use serde_json::{json, Value};
use thiserror::Error;

use loomcore::{
    CompiledFlow, EnginePolicy, EventHub, ExecutionContext, ExecutionError, LimitError, RunEventType,
    RunRecord, RunStatus, PORT_NEXT,
};

use crate::registry::{HandlerRegistry, RunScratch};

const VARS_PREVIEW_LIMIT: usize = 500;

/// A finished run: the immutable record plus the final context (the
/// eval runner asserts against the context's bindings).
#[derive(Debug)]
pub struct RunCompletion {
    pub record: RunRecord,
    pub context: ExecutionContext,
}

/// A failed run. Carries the record (whose last event is `run_failed`)
/// alongside the error that aborted it, so hosts can persist the record
/// while still seeing the typed error.
#[derive(Debug, Error)]
#[error("{error}")]
pub struct EngineFailure {
    pub record: RunRecord,
    #[source]
    pub error: ExecutionError,
}

#[derive(Clone)]
pub struct Engine {
    registry: Arc<HandlerRegistry>,
    policy: EnginePolicy,
    hub: Option<EventHub>,
}

impl Engine {
    pub fn new(registry: Arc<HandlerRegistry>, policy: EnginePolicy) -> Self {
        Self {
            registry,
            policy,
            hub: None,
        }
    }

    /// Attach an event hub; every emitted event is also fanned out to
    /// the run's subscribers.
    pub fn with_hub(mut self, hub: EventHub) -> Self {
        self.hub = Some(hub);
        self
    }

    pub fn policy(&self) -> &EnginePolicy {
        &self.policy
    }

    /// Execute a flow with a freshly generated run id.
    pub async fn execute(
        &self,
        flow: &CompiledFlow,
        input: Value,
    ) -> Result<RunCompletion, EngineFailure> {
        self.execute_with_id(uuid::Uuid::new_v4().to_string(), flow, input)
            .await
    }

    /// Execute a flow under a caller-chosen run id (hosts pick the id up
    /// front so clients can subscribe to the event stream before the
    /// run finishes).
    pub async fn execute_with_id(
        &self,
        run_id: String,
        flow: &CompiledFlow,
        input: Value,
    ) -> Result<RunCompletion, EngineFailure> {
        let mut record = RunRecord::with_id(run_id, flow.id.clone(), input.clone());
        let mut ctx = ExecutionContext::new(input);
        let mut scratch = RunScratch::default();

        self.emit(
            &mut record,
            RunEventType::RunStarted,
            None,
            None,
            Some(json!({ "flow": flow.name })),
        )
        .await;

        let mut current = flow.entry.clone();
        let mut steps: u32 = 0;

        let result: Result<Value, ExecutionError> = loop {
            steps += 1;
            if steps > self.policy.step_budget {
                break Err(LimitError::StepBudget {
                    budget: self.policy.step_budget,
                }
                .into());
            }

            let Some(node) = flow.nodes.get(&current) else {
                break Err(ExecutionError::UnknownNode(current.clone()));
            };
            let node_id = node.id.clone();
            let node_type = node.kind().as_str().to_string();

            self.emit(
                &mut record,
                RunEventType::NodeStarted,
                Some(node_id.clone()),
                Some(node_type.clone()),
                Some(json!({ "vars": ctx.vars_preview(VARS_PREVIEW_LIMIT) })),
            )
            .await;

            let Some(handler) = self.registry.get(node.kind()) else {
                break Err(ExecutionError::UnknownHandler(node_type));
            };

            let outcome = match handler
                .execute(node, &mut ctx, &mut scratch, &self.policy)
                .await
            {
                Ok(outcome) => outcome,
                Err(e) => break Err(e),
            };

            if let Some(output) = &outcome.output {
                ctx.last = output.clone();
                ctx.output = output.clone();
            }

            for line in &outcome.logs {
                self.emit(
                    &mut record,
                    RunEventType::NodeLog,
                    Some(node_id.clone()),
                    Some(node_type.clone()),
                    Some(json!({ "message": line })),
                )
                .await;
            }

            let port = outcome.resolved_port().to_string();
            self.emit(
                &mut record,
                RunEventType::NodeCompleted,
                Some(node_id.clone()),
                Some(node_type.clone()),
                Some(json!({ "port": port })),
            )
            .await;

            if outcome.stop {
                break Ok(ctx.output.clone());
            }

            let Some(next) = self
                .resolve_next(&mut record, flow, &current, &port, &node_id, &node_type)
                .await
            else {
                // Graph end: the run's output is the last produced value.
                break Ok(ctx.output.clone());
            };
            current = next;
        };

        match result {
            Ok(output) => {
                record.status = RunStatus::Completed;
                record.output = Some(output.clone());
                self.emit(
                    &mut record,
                    RunEventType::RunCompleted,
                    None,
                    None,
                    Some(json!({ "output": output })),
                )
                .await;
                self.close(&record.id).await;
                Ok(RunCompletion {
                    record,
                    context: ctx,
                })
            }
            Err(error) => {
                record.status = RunStatus::Failed;
                record.error = Some(error.to_string());
                self.emit(
                    &mut record,
                    RunEventType::RunFailed,
                    Some(current),
                    None,
                    Some(json!({ "error": error.to_string() })),
                )
                .await;
                self.close(&record.id).await;
                Err(EngineFailure { record, error })
            }
        }
    }

    /// Resolve the next node: exact port match, else a `next` edge, else
    /// the first available port's first target. A port fanning out to
    /// multiple targets takes only the first; the count is surfaced as a
    /// `node_log` event rather than silently ignored.
    async fn resolve_next(
        &self,
        record: &mut RunRecord,
        flow: &CompiledFlow,
        current: &str,
        port: &str,
        node_id: &str,
        node_type: &str,
    ) -> Option<String> {
        let outgoing: Vec<_> = flow.outgoing(current).collect();
        if outgoing.is_empty() {
            return None;
        }

        let exact: Vec<_> = outgoing.iter().filter(|e| e.port == port).collect();
        let candidates: Vec<_> = if !exact.is_empty() {
            exact
        } else {
            let fallback: Vec<_> = outgoing.iter().filter(|e| e.port == PORT_NEXT).collect();
            if !fallback.is_empty() {
                fallback
            } else {
                let first_port = &outgoing[0].port;
                outgoing.iter().filter(|e| &e.port == first_port).collect()
            }
        };

        if candidates.len() > 1 {
            self.emit(
                record,
                RunEventType::NodeLog,
                Some(node_id.to_string()),
                Some(node_type.to_string()),
                Some(json!({
                    "message": format!(
                        "port '{}' fans out to {} targets; taking the first",
                        candidates[0].port,
                        candidates.len()
                    ),
                    "fan_out": candidates.len(),
                })),
            )
            .await;
        }

        Some(candidates[0].target.clone())
    }

    async fn emit(
        &self,
        record: &mut RunRecord,
        kind: RunEventType,
        node_id: Option<String>,
        node_type: Option<String>,
        detail: Option<Value>,
    ) {
        let event = record.push_event(kind, node_id, node_type, detail).clone();
        if let Some(hub) = &self.hub {
            hub.publish(&record.id, &event).await;
        }
    }

    async fn close(&self, run_id: &str) {
        if let Some(hub) = &self.hub {
            hub.close_run(run_id).await;
        }
    }
}
