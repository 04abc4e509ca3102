//! Control-flow handlers: start, if, while, for_each, assert.

use async_trait::async_trait;
use serde_json::{json, Value};

use loomcore::{
    expr, template, CompiledNode, EnginePolicy, ExecutionContext, ExecutionError, NodeConfig,
    NodeKind, PORT_DONE, PORT_FALSE, PORT_LOOP, PORT_TRUE,
};
use loomruntime::{HandlerOutcome, LoopState, NodeHandler, RunScratch};

fn config_mismatch(node: &CompiledNode) -> ExecutionError {
    ExecutionError::Configuration(format!(
        "node {} carries config for a different kind",
        node.id
    ))
}

/// Entry marker; passes through on `next`.
pub struct StartHandler;

#[async_trait]
impl NodeHandler for StartHandler {
    fn kind(&self) -> NodeKind {
        NodeKind::Start
    }

    async fn execute(
        &self,
        _node: &CompiledNode,
        _ctx: &mut ExecutionContext,
        _scratch: &mut RunScratch,
        _policy: &EnginePolicy,
    ) -> Result<HandlerOutcome, ExecutionError> {
        Ok(HandlerOutcome::next())
    }
}

/// Boolean branch: routes on `true`/`false`.
pub struct IfHandler;

#[async_trait]
impl NodeHandler for IfHandler {
    fn kind(&self) -> NodeKind {
        NodeKind::If
    }

    async fn execute(
        &self,
        node: &CompiledNode,
        ctx: &mut ExecutionContext,
        _scratch: &mut RunScratch,
        _policy: &EnginePolicy,
    ) -> Result<HandlerOutcome, ExecutionError> {
        let NodeConfig::If { condition } = &node.config else {
            return Err(config_mismatch(node));
        };
        let taken = expr::evaluate_bool(condition, &ctx.bindings())?;
        Ok(HandlerOutcome::port(if taken { PORT_TRUE } else { PORT_FALSE }))
    }
}

/// Condition-gated loop with a per-node iteration counter capped by
/// `max_iterations`. The counter is exposed in `vars` while looping and
/// cleared on `done`.
pub struct WhileHandler;

#[async_trait]
impl NodeHandler for WhileHandler {
    fn kind(&self) -> NodeKind {
        NodeKind::While
    }

    async fn execute(
        &self,
        node: &CompiledNode,
        ctx: &mut ExecutionContext,
        scratch: &mut RunScratch,
        _policy: &EnginePolicy,
    ) -> Result<HandlerOutcome, ExecutionError> {
        let NodeConfig::While {
            condition,
            max_iterations,
        } = &node.config
        else {
            return Err(config_mismatch(node));
        };

        let count = match scratch.loops.get(&node.id) {
            Some(LoopState::While { count }) => *count,
            _ => 0,
        };

        if count < *max_iterations && expr::evaluate_bool(condition, &ctx.bindings())? {
            let count = count + 1;
            scratch
                .loops
                .insert(node.id.clone(), LoopState::While { count });
            ctx.set_var(format!("{}_iteration", node.id), json!(count));
            return Ok(HandlerOutcome::port(PORT_LOOP));
        }

        scratch.loops.remove(&node.id);
        ctx.vars.remove(&format!("{}_iteration", node.id));
        Ok(HandlerOutcome::port(PORT_DONE))
    }
}

/// Iterates an array produced by the `items` expression. The array and
/// cursor are cached per node id on first activation; each pass binds
/// `item` and `index` in `vars`, and the cache is cleared on `done`.
pub struct ForEachHandler;

#[async_trait]
impl NodeHandler for ForEachHandler {
    fn kind(&self) -> NodeKind {
        NodeKind::ForEach
    }

    async fn execute(
        &self,
        node: &CompiledNode,
        ctx: &mut ExecutionContext,
        scratch: &mut RunScratch,
        _policy: &EnginePolicy,
    ) -> Result<HandlerOutcome, ExecutionError> {
        let NodeConfig::ForEach { items } = &node.config else {
            return Err(config_mismatch(node));
        };

        if !matches!(scratch.loops.get(&node.id), Some(LoopState::ForEach { .. })) {
            let value = expr::evaluate(items, &ctx.bindings())?;
            let Value::Array(list) = value else {
                return Err(ExecutionError::Configuration(format!(
                    "for_each node {}: '{items}' did not yield an array",
                    node.id
                )));
            };
            scratch.loops.insert(
                node.id.clone(),
                LoopState::ForEach {
                    items: list,
                    index: 0,
                },
            );
        }

        let Some(LoopState::ForEach { items, index }) = scratch.loops.get_mut(&node.id) else {
            unreachable!("state inserted above");
        };

        if *index < items.len() {
            let item = items[*index].clone();
            let i = *index;
            *index += 1;
            ctx.set_var("item", item);
            ctx.set_var("index", json!(i));
            return Ok(HandlerOutcome::port(PORT_LOOP));
        }

        scratch.loops.remove(&node.id);
        ctx.vars.remove("item");
        ctx.vars.remove("index");
        Ok(HandlerOutcome::port(PORT_DONE))
    }
}

/// Fails the run with an interpolated message when its condition is
/// false.
pub struct AssertHandler;

#[async_trait]
impl NodeHandler for AssertHandler {
    fn kind(&self) -> NodeKind {
        NodeKind::Assert
    }

    async fn execute(
        &self,
        node: &CompiledNode,
        ctx: &mut ExecutionContext,
        _scratch: &mut RunScratch,
        _policy: &EnginePolicy,
    ) -> Result<HandlerOutcome, ExecutionError> {
        let NodeConfig::Assert { condition, message } = &node.config else {
            return Err(config_mismatch(node));
        };
        if expr::evaluate_bool(condition, &ctx.bindings())? {
            return Ok(HandlerOutcome::next());
        }
        let rendered = template::render(message, &ctx.bindings())?;
        Err(ExecutionError::AssertionFailed(rendered))
    }
}
