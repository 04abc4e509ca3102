use thiserror::Error;

use crate::expr::ExpressionError;

#[derive(Error, Debug)]
pub enum FlowError {
    #[error("compile error: {0}")]
    Compile(#[from] CompileError),

    #[error("execution error: {0}")]
    Execution(#[from] ExecutionError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors raised while turning a raw graph export into a [`CompiledFlow`].
///
/// All of these are fatal before any run starts.
///
/// [`CompiledFlow`]: crate::CompiledFlow
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CompileError {
    #[error("graph has no nodes")]
    EmptyGraph,

    #[error("no entry node could be resolved")]
    NoEntryNode,

    #[error("malformed graph: {0}")]
    Malformed(String),

    #[error("node {node_id}: invalid config: {message}")]
    BadNodeConfig { node_id: String, message: String },
}

/// Errors that abort a run. The engine emits `run_failed` and rethrows;
/// there is no implicit retry.
#[derive(Error, Debug, Clone)]
pub enum ExecutionError {
    #[error("unknown node: {0}")]
    UnknownNode(String),

    #[error("no handler registered for node kind '{0}'")]
    UnknownHandler(String),

    #[error("assertion failed: {0}")]
    AssertionFailed(String),

    #[error("expression error: {0}")]
    Expression(#[from] ExpressionError),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("node execution failed: {0}")]
    Handler(String),

    #[error(transparent)]
    Security(#[from] SecurityError),

    #[error(transparent)]
    Limit(#[from] LimitError),
}

/// Security policy violations, distinguishable by kind for host-side
/// handling.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SecurityError {
    #[error("blocked request to private or internal address: {host}")]
    PrivateHostBlocked { host: String },

    #[error("scheme '{scheme}' is not allowed for outbound requests")]
    SchemeNotAllowed { scheme: String },

    #[error("invalid url: {0}")]
    InvalidUrl(String),

    #[error("hostname could not be resolved: {host}")]
    UnresolvableHost { host: String },

    #[error("code execution nodes are disabled by policy (node {node_id})")]
    CodeExecutionDisabled { node_id: String },
}

/// Resource governance limits. Same abort path as [`ExecutionError`].
#[derive(Error, Debug, Clone, PartialEq)]
pub enum LimitError {
    #[error("step budget of {budget} exceeded")]
    StepBudget { budget: u32 },

    #[error("timed out after {ms}ms")]
    Timeout { ms: u64 },
}
