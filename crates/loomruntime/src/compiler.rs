//! Flow compiler: raw node-link exports → validated [`CompiledFlow`].
//!
//! The raw format is what the visual editor exports:
//! `{ <module>: { data: { <nodeId>: { name, data, outputs:
//! { <portKey>: { connections: [{ node: <targetId>, … }] } } } } } }`.
//!
//! Compilation maps raw type names onto the closed [`NodeKind`] set,
//! decodes each node's config bag into its typed variant exactly once,
//! rewrites raw port keys to canonical port names, drops dangling edges
//! and resolves the entry node.

use std::cmp::Ordering;
use std::collections::HashMap;

use serde_json::{Map, Value};
use uuid::Uuid;

use loomcore::{
    CompileError, CompiledEdge, CompiledFlow, CompiledNode, NodeConfig, NodeKind, OnError,
    ScriptLanguage, PORT_DONE, PORT_FALSE, PORT_LOOP, PORT_NEXT, PORT_TRUE,
};

/// Compile a raw graph export into an executable flow.
pub fn compile(raw: &Value) -> Result<CompiledFlow, CompileError> {
    let modules = raw
        .as_object()
        .ok_or_else(|| CompileError::Malformed("graph export must be an object".into()))?;

    // Merge node tables across modules; the first module names the flow.
    let mut flow_name = String::from("flow");
    let mut raw_nodes: HashMap<String, &Value> = HashMap::new();
    let mut module_names: Vec<&String> = modules.keys().collect();
    module_names.sort();
    for (i, module_name) in module_names.iter().enumerate() {
        if i == 0 {
            flow_name = (*module_name).clone();
        }
        let data = modules[*module_name]
            .get("data")
            .and_then(Value::as_object)
            .ok_or_else(|| {
                CompileError::Malformed(format!("module '{module_name}' has no data table"))
            })?;
        for (node_id, node) in data {
            raw_nodes.insert(node_id.clone(), node);
        }
    }

    if raw_nodes.is_empty() {
        return Err(CompileError::EmptyGraph);
    }

    let mut node_ids: Vec<&String> = raw_nodes.keys().collect();
    node_ids.sort_by(|a, b| id_cmp(a, b));

    let mut nodes: HashMap<String, CompiledNode> = HashMap::new();
    for id in &node_ids {
        let raw_node = raw_nodes[*id];
        let raw_type = raw_node.get("name").and_then(Value::as_str).unwrap_or("");
        let kind = NodeKind::from_raw(raw_type);
        let empty = Map::new();
        let data = raw_node
            .get("data")
            .and_then(Value::as_object)
            .unwrap_or(&empty);
        let config = decode_config(id, kind, raw_type, data)?;
        nodes.insert(
            (*id).clone(),
            CompiledNode {
                id: (*id).clone(),
                name: raw_type.to_string(),
                config,
            },
        );
    }

    // Edge list with canonical port names; edges into missing nodes are
    // dropped, not fatal.
    let mut edges = Vec::new();
    for id in &node_ids {
        let raw_node = raw_nodes[*id];
        let Some(outputs) = raw_node.get("outputs").and_then(Value::as_object) else {
            continue;
        };
        let kind = nodes[*id].kind();
        let mut port_keys: Vec<&String> = outputs.keys().collect();
        port_keys.sort();
        for (raw_key, canonical) in canonical_ports(kind, &port_keys) {
            let connections = outputs[raw_key.as_str()]
                .get("connections")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default();
            for conn in connections {
                let Some(target) = connection_target(&conn) else {
                    continue;
                };
                if !nodes.contains_key(&target) {
                    tracing::warn!(
                        source = %id,
                        target = %target,
                        "dropping edge to missing node"
                    );
                    continue;
                }
                edges.push(CompiledEdge {
                    source: (*id).clone(),
                    port: canonical.clone(),
                    target,
                });
            }
        }
    }

    let entry = resolve_entry(&nodes, &node_ids)?;

    Ok(CompiledFlow {
        id: Uuid::new_v4().to_string(),
        name: flow_name,
        entry,
        nodes,
        edges,
    })
}

/// Entry node: the unique `start`-kind node, else the lowest-ordered
/// node id.
fn resolve_entry(
    nodes: &HashMap<String, CompiledNode>,
    sorted_ids: &[&String],
) -> Result<String, CompileError> {
    let starts: Vec<&String> = sorted_ids
        .iter()
        .filter(|id| nodes[**id].kind() == NodeKind::Start)
        .copied()
        .collect();
    if starts.len() == 1 {
        return Ok(starts[0].clone());
    }
    sorted_ids
        .first()
        .map(|id| (*id).clone())
        .ok_or(CompileError::NoEntryNode)
}

/// Order ids numerically when both parse as integers, else
/// lexicographically, so "lowest node id" is well defined.
fn id_cmp(a: &str, b: &str) -> Ordering {
    match (a.parse::<u64>(), b.parse::<u64>()) {
        (Ok(x), Ok(y)) => x.cmp(&y),
        _ => a.cmp(b),
    }
}

fn connection_target(conn: &Value) -> Option<String> {
    match conn.get("node") {
        Some(Value::String(s)) => Some(s.clone()),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Port canonicalization
// ---------------------------------------------------------------------------

/// Translate raw port keys to canonical port names for a node kind.
///
/// Branching kinds get `true`/`false`, looping kinds `loop`/`done`,
/// everything else `next`, `next_2`, …. A raw key containing the
/// canonical word claims that slot directly; remaining keys fill the
/// remaining slots in sorted order.
fn canonical_ports(kind: NodeKind, sorted_keys: &[&String]) -> Vec<(String, String)> {
    let named: &[&str] = if kind.is_branching() {
        &[PORT_TRUE, PORT_FALSE]
    } else if kind.is_looping() {
        &[PORT_LOOP, PORT_DONE]
    } else {
        &[]
    };

    if named.is_empty() {
        return sorted_keys
            .iter()
            .enumerate()
            .map(|(i, key)| ((*key).clone(), sequential_port(i)))
            .collect();
    }

    let mut assigned: Vec<Option<String>> = vec![None; sorted_keys.len()];
    let mut claimed = vec![false; named.len()];

    // First pass: keys that name their canonical port claim it.
    for (ki, key) in sorted_keys.iter().enumerate() {
        let lower = key.to_ascii_lowercase();
        for (ni, name) in named.iter().enumerate() {
            if !claimed[ni] && lower.contains(name) {
                assigned[ki] = Some((*name).to_string());
                claimed[ni] = true;
                break;
            }
        }
    }

    // Second pass: positional fill, then sequential overflow.
    let mut overflow = 0;
    for slot in assigned.iter_mut() {
        if slot.is_some() {
            continue;
        }
        if let Some(ni) = claimed.iter().position(|c| !c) {
            claimed[ni] = true;
            *slot = Some(named[ni].to_string());
        } else {
            *slot = Some(sequential_port(overflow));
            overflow += 1;
        }
    }

    sorted_keys
        .iter()
        .zip(assigned)
        .map(|(key, canonical)| ((*key).clone(), canonical.expect("all slots filled")))
        .collect()
}

fn sequential_port(index: usize) -> String {
    if index == 0 {
        PORT_NEXT.to_string()
    } else {
        format!("{}_{}", PORT_NEXT, index + 1)
    }
}

// ---------------------------------------------------------------------------
// Config decoding — once, at compile time
// ---------------------------------------------------------------------------

fn decode_config(
    node_id: &str,
    kind: NodeKind,
    raw_type: &str,
    data: &Map<String, Value>,
) -> Result<NodeConfig, CompileError> {
    let cfg = match kind {
        NodeKind::Start => NodeConfig::Start,
        NodeKind::If => NodeConfig::If {
            condition: req_str(node_id, data, "condition")?,
        },
        NodeKind::While => NodeConfig::While {
            condition: req_str(node_id, data, "condition")?,
            max_iterations: get_u64(data, "max_iterations").unwrap_or(100) as u32,
        },
        NodeKind::ForEach => NodeConfig::ForEach {
            items: req_str(node_id, data, "items")?,
        },
        NodeKind::Assert => NodeConfig::Assert {
            condition: req_str(node_id, data, "condition")?,
            message: get_str(data, "message").unwrap_or_else(|| "assertion failed".into()),
        },
        NodeKind::Delay => NodeConfig::Delay {
            duration_ms: scalar_expr(data, "duration_ms").unwrap_or_else(|| "0".into()),
        },
        NodeKind::Http => NodeConfig::Http {
            method: get_str(data, "method").unwrap_or_else(|| "GET".into()),
            url: req_str(node_id, data, "url")?,
            headers: data
                .get("headers")
                .and_then(Value::as_object)
                .map(|h| {
                    h.iter()
                        .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                        .collect()
                })
                .unwrap_or_default(),
            body: get_str(data, "body"),
            timeout_ms: get_u64(data, "timeout_ms"),
        },
        NodeKind::JsonParse => NodeConfig::JsonParse {
            source: get_str(data, "source").unwrap_or_else(|| "last".into()),
            on_error: decode_on_error(data),
        },
        NodeKind::JsonStringify => NodeConfig::JsonStringify {
            source: get_str(data, "source").unwrap_or_else(|| "last".into()),
            pretty: get_bool(data, "pretty").unwrap_or(false),
            on_error: decode_on_error(data),
        },
        NodeKind::ArrayPush => NodeConfig::ArrayPush {
            var: req_str(node_id, data, "var")?,
            value: get_str(data, "value").unwrap_or_else(|| "last".into()),
            dedupe: get_bool(data, "dedupe").unwrap_or(false),
            max_length: get_u64(data, "max_length").map(|n| n as usize),
        },
        NodeKind::SetVar => NodeConfig::SetVar {
            name: req_str(node_id, data, "name")?,
            value: get_str(data, "value").unwrap_or_else(|| "last".into()),
        },
        NodeKind::Transform => NodeConfig::Transform {
            expression: get_str(data, "expression").unwrap_or_else(|| "last".into()),
        },
        NodeKind::Template => NodeConfig::Template {
            template: get_str(data, "template").unwrap_or_default(),
            var: get_str(data, "var"),
        },
        NodeKind::Log => NodeConfig::Log {
            message: get_str(data, "message").unwrap_or_default(),
        },
        NodeKind::Script => NodeConfig::Script {
            language: script_language(raw_type, data),
            code: req_str(node_id, data, "code")?,
            timeout_ms: get_u64(data, "timeout_ms"),
        },
    };
    Ok(cfg)
}

fn script_language(raw_type: &str, data: &Map<String, Value>) -> ScriptLanguage {
    if raw_type.eq_ignore_ascii_case("python_script") {
        return ScriptLanguage::Python;
    }
    if raw_type.eq_ignore_ascii_case("typescript_script")
        || raw_type.eq_ignore_ascii_case("javascript_script")
    {
        return ScriptLanguage::Javascript;
    }
    match get_str(data, "language").as_deref() {
        Some("python") => ScriptLanguage::Python,
        Some("javascript") | Some("typescript") | Some("js") => ScriptLanguage::Javascript,
        _ => ScriptLanguage::Python,
    }
}

fn decode_on_error(data: &Map<String, Value>) -> OnError {
    match get_str(data, "on_error").as_deref() {
        Some("null") => OnError::Null,
        Some("passthrough") | Some("original") => OnError::Passthrough,
        _ => OnError::Error,
    }
}

fn get_str(data: &Map<String, Value>, key: &str) -> Option<String> {
    data.get(key).and_then(Value::as_str).map(str::to_string)
}

/// A scalar config field used as an expression: numbers become numeric
/// literals, strings are taken as-is.
fn scalar_expr(data: &Map<String, Value>, key: &str) -> Option<String> {
    match data.get(key) {
        Some(Value::String(s)) => Some(s.clone()),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    }
}

fn get_u64(data: &Map<String, Value>, key: &str) -> Option<u64> {
    data.get(key).and_then(Value::as_u64)
}

fn get_bool(data: &Map<String, Value>, key: &str) -> Option<bool> {
    data.get(key).and_then(Value::as_bool)
}

fn req_str(node_id: &str, data: &Map<String, Value>, key: &str) -> Result<String, CompileError> {
    get_str(data, key).ok_or_else(|| CompileError::BadNodeConfig {
        node_id: node_id.to_string(),
        message: format!("missing required field '{key}'"),
    })
}
