//! Flow compilation and execution runtime.
//!
//! This crate turns raw node-link graph exports into executable
//! [`CompiledFlow`]s, interprets them node by node under the injected
//! security policy, and drives labeled eval batches.
//!
//! [`CompiledFlow`]: loomcore::CompiledFlow

mod compiler;
mod engine;
mod eval;
mod registry;

pub use compiler::compile;
pub use engine::{Engine, EngineFailure, RunCompletion};
pub use eval::{CaseResult, EvalCase, EvalReport, EvalRunner};
pub use registry::{HandlerOutcome, HandlerRegistry, LoopState, NodeHandler, RunScratch};
