use async_trait::async_trait;
use std::time::Duration;

use loomcore::{
    expr, CompiledNode, EnginePolicy, ExecutionContext, ExecutionError, NodeConfig, NodeKind,
};
use loomruntime::{HandlerOutcome, NodeHandler, RunScratch};

/// Suspends the run for a context-computed number of milliseconds.
pub struct DelayHandler;

#[async_trait]
impl NodeHandler for DelayHandler {
    fn kind(&self) -> NodeKind {
        NodeKind::Delay
    }

    async fn execute(
        &self,
        node: &CompiledNode,
        ctx: &mut ExecutionContext,
        _scratch: &mut RunScratch,
        _policy: &EnginePolicy,
    ) -> Result<HandlerOutcome, ExecutionError> {
        let NodeConfig::Delay { duration_ms } = &node.config else {
            return Err(ExecutionError::Configuration(format!(
                "node {} carries config for a different kind",
                node.id
            )));
        };

        let value = expr::evaluate(duration_ms, &ctx.bindings())?;
        let ms = value.as_f64().filter(|v| v.is_finite()).ok_or_else(|| {
            ExecutionError::Configuration(format!(
                "delay node {}: '{duration_ms}' did not yield a number",
                node.id
            ))
        })?;
        let ms = ms.max(0.0) as u64;

        tracing::debug!(node_id = %node.id, ms, "delaying");
        tokio::time::sleep(Duration::from_millis(ms)).await;
        Ok(HandlerOutcome::next())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn delay_node(expr: &str) -> CompiledNode {
        CompiledNode {
            id: "d".into(),
            name: "delay".into(),
            config: NodeConfig::Delay {
                duration_ms: expr.into(),
            },
        }
    }

    #[tokio::test]
    async fn sleeps_for_computed_duration() {
        let n = delay_node("input.ms * 2");
        let mut ctx = ExecutionContext::new(json!({"ms": 5}));
        let mut scratch = RunScratch::default();
        let started = std::time::Instant::now();
        DelayHandler
            .execute(&n, &mut ctx, &mut scratch, &EnginePolicy::default())
            .await
            .unwrap();
        assert!(started.elapsed() >= Duration::from_millis(10));
    }

    #[tokio::test]
    async fn non_numeric_duration_is_a_config_error() {
        let n = delay_node("input.ms");
        let mut ctx = ExecutionContext::new(json!({"ms": "soon"}));
        let mut scratch = RunScratch::default();
        let err = DelayHandler
            .execute(&n, &mut ctx, &mut scratch, &EnginePolicy::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutionError::Configuration(_)));
    }

    #[tokio::test]
    async fn negative_duration_clamps_to_zero() {
        let n = delay_node("0 - 50");
        let mut ctx = ExecutionContext::new(serde_json::Value::Null);
        let mut scratch = RunScratch::default();
        let started = std::time::Instant::now();
        DelayHandler
            .execute(&n, &mut ctx, &mut scratch, &EnginePolicy::default())
            .await
            .unwrap();
        assert!(started.elapsed() < Duration::from_millis(40));
    }
}
