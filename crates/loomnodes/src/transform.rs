//! Data-shaping handlers: json codecs, variable writes, templates, log.

use async_trait::async_trait;
use serde_json::{json, Value};

use loomcore::{
    expr, template, CompiledNode, EnginePolicy, ExecutionContext, ExecutionError, NodeConfig,
    NodeKind, OnError,
};
use loomruntime::{HandlerOutcome, NodeHandler, RunScratch};

fn config_mismatch(node: &CompiledNode) -> ExecutionError {
    ExecutionError::Configuration(format!(
        "node {} carries config for a different kind",
        node.id
    ))
}

fn codec_failure(
    node: &CompiledNode,
    on_error: OnError,
    original: Value,
    detail: String,
) -> Result<HandlerOutcome, ExecutionError> {
    match on_error {
        OnError::Error => Err(ExecutionError::Handler(format!(
            "node {}: {detail}",
            node.id
        ))),
        OnError::Null => Ok(HandlerOutcome::next().with_output(Value::Null)),
        OnError::Passthrough => Ok(HandlerOutcome::next().with_output(original)),
    }
}

/// Parses a JSON string from the context into a value.
pub struct JsonParseHandler;

#[async_trait]
impl NodeHandler for JsonParseHandler {
    fn kind(&self) -> NodeKind {
        NodeKind::JsonParse
    }

    async fn execute(
        &self,
        node: &CompiledNode,
        ctx: &mut ExecutionContext,
        _scratch: &mut RunScratch,
        _policy: &EnginePolicy,
    ) -> Result<HandlerOutcome, ExecutionError> {
        let NodeConfig::JsonParse { source, on_error } = &node.config else {
            return Err(config_mismatch(node));
        };
        let value = expr::evaluate(source, &ctx.bindings())?;
        let Value::String(text) = &value else {
            return codec_failure(
                node,
                *on_error,
                value.clone(),
                "json_parse source is not a string".into(),
            );
        };
        match serde_json::from_str::<Value>(text) {
            Ok(parsed) => Ok(HandlerOutcome::next().with_output(parsed)),
            Err(e) => codec_failure(node, *on_error, value.clone(), format!("invalid json: {e}")),
        }
    }
}

/// Encodes a context value as a JSON string.
pub struct JsonStringifyHandler;

#[async_trait]
impl NodeHandler for JsonStringifyHandler {
    fn kind(&self) -> NodeKind {
        NodeKind::JsonStringify
    }

    async fn execute(
        &self,
        node: &CompiledNode,
        ctx: &mut ExecutionContext,
        _scratch: &mut RunScratch,
        _policy: &EnginePolicy,
    ) -> Result<HandlerOutcome, ExecutionError> {
        let NodeConfig::JsonStringify {
            source,
            pretty,
            on_error,
        } = &node.config
        else {
            return Err(config_mismatch(node));
        };
        let value = expr::evaluate(source, &ctx.bindings())?;
        let encoded = if *pretty {
            serde_json::to_string_pretty(&value)
        } else {
            serde_json::to_string(&value)
        };
        match encoded {
            Ok(text) => Ok(HandlerOutcome::next().with_output(Value::String(text))),
            Err(e) => codec_failure(node, *on_error, value, format!("encode failed: {e}")),
        }
    }
}

/// Appends to a named array variable, with optional de-duplication and
/// a max-length trim that drops the oldest entries.
pub struct ArrayPushHandler;

#[async_trait]
impl NodeHandler for ArrayPushHandler {
    fn kind(&self) -> NodeKind {
        NodeKind::ArrayPush
    }

    async fn execute(
        &self,
        node: &CompiledNode,
        ctx: &mut ExecutionContext,
        _scratch: &mut RunScratch,
        _policy: &EnginePolicy,
    ) -> Result<HandlerOutcome, ExecutionError> {
        let NodeConfig::ArrayPush {
            var,
            value,
            dedupe,
            max_length,
        } = &node.config
        else {
            return Err(config_mismatch(node));
        };

        let item = expr::evaluate(value, &ctx.bindings())?;
        let mut list = match ctx.vars.get(var) {
            None | Some(Value::Null) => Vec::new(),
            Some(Value::Array(existing)) => existing.clone(),
            Some(other) => {
                return Err(ExecutionError::Configuration(format!(
                    "array_push node {}: var '{var}' holds {other}, not an array",
                    node.id
                )))
            }
        };

        if !(*dedupe && list.contains(&item)) {
            list.push(item);
        }
        if let Some(max) = max_length {
            if list.len() > *max {
                let overflow = list.len() - max;
                list.drain(..overflow);
            }
        }

        let out = Value::Array(list);
        ctx.set_var(var.clone(), out.clone());
        Ok(HandlerOutcome::next().with_output(out))
    }
}

/// Writes an evaluated expression into a named variable.
pub struct SetVarHandler;

#[async_trait]
impl NodeHandler for SetVarHandler {
    fn kind(&self) -> NodeKind {
        NodeKind::SetVar
    }

    async fn execute(
        &self,
        node: &CompiledNode,
        ctx: &mut ExecutionContext,
        _scratch: &mut RunScratch,
        _policy: &EnginePolicy,
    ) -> Result<HandlerOutcome, ExecutionError> {
        let NodeConfig::SetVar { name, value } = &node.config else {
            return Err(config_mismatch(node));
        };
        let v = expr::evaluate(value, &ctx.bindings())?;
        ctx.set_var(name.clone(), v.clone());
        Ok(HandlerOutcome::next().with_output(v))
    }
}

/// Evaluates an expression; the result becomes the node output.
pub struct TransformHandler;

#[async_trait]
impl NodeHandler for TransformHandler {
    fn kind(&self) -> NodeKind {
        NodeKind::Transform
    }

    async fn execute(
        &self,
        node: &CompiledNode,
        ctx: &mut ExecutionContext,
        _scratch: &mut RunScratch,
        _policy: &EnginePolicy,
    ) -> Result<HandlerOutcome, ExecutionError> {
        let NodeConfig::Transform { expression } = &node.config else {
            return Err(config_mismatch(node));
        };
        let v = expr::evaluate(expression, &ctx.bindings())?;
        Ok(HandlerOutcome::next().with_output(v))
    }
}

/// Renders a `{{ expr }}` template; optionally stores the string in a
/// variable as well.
pub struct TemplateHandler;

#[async_trait]
impl NodeHandler for TemplateHandler {
    fn kind(&self) -> NodeKind {
        NodeKind::Template
    }

    async fn execute(
        &self,
        node: &CompiledNode,
        ctx: &mut ExecutionContext,
        _scratch: &mut RunScratch,
        _policy: &EnginePolicy,
    ) -> Result<HandlerOutcome, ExecutionError> {
        let NodeConfig::Template { template: text, var } = &node.config else {
            return Err(config_mismatch(node));
        };
        let rendered = template::render(text, &ctx.bindings())?;
        if let Some(name) = var {
            ctx.set_var(name.clone(), json!(rendered));
        }
        Ok(HandlerOutcome::next().with_output(Value::String(rendered)))
    }
}

/// Renders a message into the run's event stream.
pub struct LogHandler;

#[async_trait]
impl NodeHandler for LogHandler {
    fn kind(&self) -> NodeKind {
        NodeKind::Log
    }

    async fn execute(
        &self,
        node: &CompiledNode,
        ctx: &mut ExecutionContext,
        _scratch: &mut RunScratch,
        _policy: &EnginePolicy,
    ) -> Result<HandlerOutcome, ExecutionError> {
        let NodeConfig::Log { message } = &node.config else {
            return Err(config_mismatch(node));
        };
        let rendered = template::render(message, &ctx.bindings())?;
        tracing::info!(node_id = %node.id, "{rendered}");
        Ok(HandlerOutcome::next().with_log(rendered))
    }
}
