//! Core abstractions for the loomflow engine.
//!
//! This crate provides the fundamental types and seams that all other
//! components depend on: the compiled flow data model, the execution
//! context, run events and the event hub, the security policy config,
//! and the restricted expression/template evaluator.

mod context;
mod error;
pub mod events;
pub mod expr;
mod flow;
mod policy;
pub mod template;

pub use context::ExecutionContext;
pub use error::{CompileError, ExecutionError, FlowError, LimitError, SecurityError};
pub use events::{EventHub, EventSubscription, RunEvent, RunEventType, RunRecord, RunStatus};
pub use flow::{
    CompiledEdge, CompiledFlow, CompiledNode, NodeConfig, NodeKind, OnError, ScriptLanguage,
    PORT_DONE, PORT_FALSE, PORT_LOOP, PORT_NEXT, PORT_TRUE,
};
pub use policy::EnginePolicy;

/// Result type for flow operations.
pub type Result<T> = std::result::Result<T, FlowError>;
