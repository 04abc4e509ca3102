//! The node handler seam and per-run scratch state.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use loomcore::{CompiledNode, EnginePolicy, ExecutionContext, ExecutionError, NodeKind, PORT_NEXT};

/// Handler contract for one node kind. Handlers are the security
/// boundary: network- and code-executing kinds perform their policy
/// checks inside `execute` before doing anything else.
#[async_trait]
pub trait NodeHandler: Send + Sync {
    /// The node kind this handler serves.
    fn kind(&self) -> NodeKind;

    async fn execute(
        &self,
        node: &CompiledNode,
        ctx: &mut ExecutionContext,
        scratch: &mut RunScratch,
        policy: &EnginePolicy,
    ) -> Result<HandlerOutcome, ExecutionError>;
}

/// What a handler tells the engine after a step: which outgoing port to
/// follow (default `next`), whether to stop the run, the value produced
/// and any log lines to surface as `node_log` events.
#[derive(Debug, Default)]
pub struct HandlerOutcome {
    pub port: Option<String>,
    pub stop: bool,
    pub output: Option<Value>,
    pub logs: Vec<String>,
}

impl HandlerOutcome {
    /// Continue on the default port with no output.
    pub fn next() -> Self {
        Self::default()
    }

    pub fn port(port: impl Into<String>) -> Self {
        Self {
            port: Some(port.into()),
            ..Self::default()
        }
    }

    pub fn with_output(mut self, output: Value) -> Self {
        self.output = Some(output);
        self
    }

    pub fn with_log(mut self, line: impl Into<String>) -> Self {
        self.logs.push(line.into());
        self
    }

    pub fn stopping(mut self) -> Self {
        self.stop = true;
        self
    }

    pub fn resolved_port(&self) -> &str {
        self.port.as_deref().unwrap_or(PORT_NEXT)
    }
}

/// Per-run mutable state for stateful node kinds (`while` counters,
/// `for_each` cursors), keyed by node id and cleared when a loop
/// finishes.
#[derive(Debug, Default)]
pub struct RunScratch {
    pub loops: HashMap<String, LoopState>,
}

#[derive(Debug)]
pub enum LoopState {
    While { count: u32 },
    ForEach { items: Vec<Value>, index: usize },
}

/// One handler per node kind; looked up by the engine every step.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<NodeKind, Arc<dyn NodeHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, handler: Arc<dyn NodeHandler>) {
        let kind = handler.kind();
        tracing::debug!(%kind, "registering node handler");
        self.handlers.insert(kind, handler);
    }

    pub fn get(&self, kind: NodeKind) -> Option<Arc<dyn NodeHandler>> {
        self.handlers.get(&kind).cloned()
    }

    pub fn kinds(&self) -> Vec<NodeKind> {
        let mut kinds: Vec<NodeKind> = self.handlers.keys().copied().collect();
        kinds.sort_by_key(|k| k.as_str());
        kinds
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outcome_defaults_to_next_port() {
        let outcome = HandlerOutcome::next();
        assert_eq!(outcome.resolved_port(), "next");
        assert!(!outcome.stop);
        assert!(outcome.output.is_none());
    }

    #[test]
    fn outcome_builder_chains() {
        let outcome = HandlerOutcome::port("true")
            .with_output(serde_json::json!(1))
            .stopping();
        assert_eq!(outcome.resolved_port(), "true");
        assert!(outcome.stop);
    }
}
