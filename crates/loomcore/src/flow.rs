use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub const PORT_NEXT: &str = "next";
pub const PORT_TRUE: &str = "true";
pub const PORT_FALSE: &str = "false";
pub const PORT_LOOP: &str = "loop";
pub const PORT_DONE: &str = "done";

/// Closed enumeration of node kinds the engine can execute.
///
/// Raw type names from the graph editor are mapped through
/// [`NodeKind::from_raw`]; anything unrecognized compiles to `Transform`
/// rather than failing the whole graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    Start,
    If,
    While,
    ForEach,
    Assert,
    Delay,
    Http,
    JsonParse,
    JsonStringify,
    ArrayPush,
    SetVar,
    Transform,
    Template,
    Log,
    Script,
}

impl NodeKind {
    /// Map a raw editor type name to a canonical kind. Aliases cover the
    /// names the visual editor has shipped over time; unknown names fall
    /// back to `Transform`.
    pub fn from_raw(raw: &str) -> NodeKind {
        match raw.trim().to_ascii_lowercase().as_str() {
            "start" | "trigger" | "entry" => NodeKind::Start,
            "if" | "branch" | "condition" => NodeKind::If,
            "while" | "while_loop" => NodeKind::While,
            "for_each" | "foreach" | "for" | "loop" => NodeKind::ForEach,
            "assert" | "assertion" => NodeKind::Assert,
            "delay" | "wait" | "sleep" => NodeKind::Delay,
            "http" | "http_request" | "fetch" | "api_call" => NodeKind::Http,
            "json_parse" | "parse_json" => NodeKind::JsonParse,
            "json_stringify" | "stringify_json" => NodeKind::JsonStringify,
            "array_push" | "push" => NodeKind::ArrayPush,
            "set_var" | "set_variable" | "set" => NodeKind::SetVar,
            "template" | "text_template" => NodeKind::Template,
            "log" | "debug" => NodeKind::Log,
            "script" | "python_script" | "typescript_script" | "javascript_script" => {
                NodeKind::Script
            }
            _ => NodeKind::Transform,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            NodeKind::Start => "start",
            NodeKind::If => "if",
            NodeKind::While => "while",
            NodeKind::ForEach => "for_each",
            NodeKind::Assert => "assert",
            NodeKind::Delay => "delay",
            NodeKind::Http => "http",
            NodeKind::JsonParse => "json_parse",
            NodeKind::JsonStringify => "json_stringify",
            NodeKind::ArrayPush => "array_push",
            NodeKind::SetVar => "set_var",
            NodeKind::Transform => "transform",
            NodeKind::Template => "template",
            NodeKind::Log => "log",
            NodeKind::Script => "script",
        }
    }

    /// Kinds whose two outgoing ports map to `true`/`false`.
    pub fn is_branching(&self) -> bool {
        matches!(self, NodeKind::If)
    }

    /// Kinds whose outgoing ports map to `loop`/`done`.
    pub fn is_looping(&self) -> bool {
        matches!(self, NodeKind::While | NodeKind::ForEach)
    }
}

impl std::fmt::Display for NodeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What to do when a JSON encode/decode node hits a bad payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum OnError {
    #[default]
    Error,
    Null,
    Passthrough,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScriptLanguage {
    Python,
    Javascript,
}

impl ScriptLanguage {
    pub fn command(&self) -> &'static str {
        match self {
            ScriptLanguage::Python => "python3",
            ScriptLanguage::Javascript => "node",
        }
    }
}

/// Node-kind-specific configuration, decoded once at compile time.
///
/// One typed variant per kind; execution never reads the raw config bag.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NodeConfig {
    Start,
    If {
        condition: String,
    },
    While {
        condition: String,
        max_iterations: u32,
    },
    ForEach {
        /// Expression that must yield an array.
        items: String,
    },
    Assert {
        condition: String,
        /// Template, interpolated into the failure message.
        message: String,
    },
    Delay {
        /// Expression yielding a millisecond duration.
        duration_ms: String,
    },
    Http {
        method: String,
        url: String,
        headers: HashMap<String, String>,
        body: Option<String>,
        timeout_ms: Option<u64>,
    },
    JsonParse {
        source: String,
        on_error: OnError,
    },
    JsonStringify {
        source: String,
        pretty: bool,
        on_error: OnError,
    },
    ArrayPush {
        var: String,
        value: String,
        dedupe: bool,
        max_length: Option<usize>,
    },
    SetVar {
        name: String,
        value: String,
    },
    Transform {
        expression: String,
    },
    Template {
        template: String,
        var: Option<String>,
    },
    Log {
        message: String,
    },
    Script {
        language: ScriptLanguage,
        code: String,
        timeout_ms: Option<u64>,
    },
}

impl NodeConfig {
    pub fn kind(&self) -> NodeKind {
        match self {
            NodeConfig::Start => NodeKind::Start,
            NodeConfig::If { .. } => NodeKind::If,
            NodeConfig::While { .. } => NodeKind::While,
            NodeConfig::ForEach { .. } => NodeKind::ForEach,
            NodeConfig::Assert { .. } => NodeKind::Assert,
            NodeConfig::Delay { .. } => NodeKind::Delay,
            NodeConfig::Http { .. } => NodeKind::Http,
            NodeConfig::JsonParse { .. } => NodeKind::JsonParse,
            NodeConfig::JsonStringify { .. } => NodeKind::JsonStringify,
            NodeConfig::ArrayPush { .. } => NodeKind::ArrayPush,
            NodeConfig::SetVar { .. } => NodeKind::SetVar,
            NodeConfig::Transform { .. } => NodeKind::Transform,
            NodeConfig::Template { .. } => NodeKind::Template,
            NodeConfig::Log { .. } => NodeKind::Log,
            NodeConfig::Script { .. } => NodeKind::Script,
        }
    }
}

/// A node in a compiled flow, immutable after compilation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompiledNode {
    pub id: String,
    pub name: String,
    pub config: NodeConfig,
}

impl CompiledNode {
    pub fn kind(&self) -> NodeKind {
        self.config.kind()
    }
}

/// A directed edge with a canonical source port name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompiledEdge {
    pub source: String,
    pub port: String,
    pub target: String,
}

/// A validated, executable graph: node table, canonical-port edge list
/// and entry node. Created once per run from a flow snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompiledFlow {
    pub id: String,
    pub name: String,
    pub entry: String,
    pub nodes: HashMap<String, CompiledNode>,
    pub edges: Vec<CompiledEdge>,
}

impl CompiledFlow {
    /// Outgoing edges of a node, in edge-list order.
    pub fn outgoing<'a>(&'a self, node_id: &'a str) -> impl Iterator<Item = &'a CompiledEdge> {
        self.edges.iter().filter(move |e| e.source == node_id)
    }
}
