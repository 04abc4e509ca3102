//! Standard node handler library.
//!
//! One handler per node kind. Network- and code-executing handlers are
//! the security boundary: they check the injected policy before doing
//! anything observable.

mod control;
mod http;
mod script;
pub mod ssrf;
mod time;
mod transform;

pub use control::{AssertHandler, ForEachHandler, IfHandler, StartHandler, WhileHandler};
pub use http::HttpHandler;
pub use script::ScriptHandler;
pub use time::DelayHandler;
pub use transform::{
    ArrayPushHandler, JsonParseHandler, JsonStringifyHandler, LogHandler, SetVarHandler,
    TemplateHandler, TransformHandler,
};

use loomruntime::HandlerRegistry;
use std::sync::Arc;

/// Register every standard handler with a registry.
pub fn register_all(registry: &mut HandlerRegistry) {
    registry.register(Arc::new(StartHandler));
    registry.register(Arc::new(IfHandler));
    registry.register(Arc::new(WhileHandler));
    registry.register(Arc::new(ForEachHandler));
    registry.register(Arc::new(AssertHandler));
    registry.register(Arc::new(DelayHandler));
    registry.register(Arc::new(HttpHandler::new()));
    registry.register(Arc::new(JsonParseHandler));
    registry.register(Arc::new(JsonStringifyHandler));
    registry.register(Arc::new(ArrayPushHandler));
    registry.register(Arc::new(SetVarHandler));
    registry.register(Arc::new(TransformHandler));
    registry.register(Arc::new(TemplateHandler));
    registry.register(Arc::new(LogHandler));
    registry.register(Arc::new(ScriptHandler));
}
