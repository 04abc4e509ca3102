use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use loomcore::{
    CompiledNode, EnginePolicy, ExecutionContext, ExecutionError, LimitError, NodeConfig,
    NodeKind, ScriptLanguage, SecurityError,
};
use loomruntime::{HandlerOutcome, NodeHandler, RunScratch};

/// Runs user code in a subprocess.
///
/// Disabled unless the policy opts in. The child gets the run bindings
/// as JSON on stdin, a scrubbed environment, and a wall-clock deadline;
/// it reports back by assigning `result`, which the wrapper prints as a
/// JSON envelope on stdout.
pub struct ScriptHandler;

#[async_trait]
impl NodeHandler for ScriptHandler {
    fn kind(&self) -> NodeKind {
        NodeKind::Script
    }

    async fn execute(
        &self,
        node: &CompiledNode,
        ctx: &mut ExecutionContext,
        _scratch: &mut RunScratch,
        policy: &EnginePolicy,
    ) -> Result<HandlerOutcome, ExecutionError> {
        let NodeConfig::Script {
            language,
            code,
            timeout_ms,
        } = &node.config
        else {
            return Err(ExecutionError::Configuration(format!(
                "node {} carries config for a different kind",
                node.id
            )));
        };

        if !policy.allow_code_execution {
            return Err(SecurityError::CodeExecutionDisabled {
                node_id: node.id.clone(),
            }
            .into());
        }

        let timeout = timeout_ms.unwrap_or(policy.script_timeout_ms);
        let wrapped = wrap_code(*language, code);
        let stdin_payload = serde_json::to_vec(&ctx.bindings())
            .map_err(|e| ExecutionError::Handler(format!("failed to encode bindings: {e}")))?;

        let mut command = Command::new(language.command());
        match language {
            ScriptLanguage::Python => command.arg("-c"),
            ScriptLanguage::Javascript => command.arg("-e"),
        };
        let mut child = command
            .arg(&wrapped)
            .env_clear()
            .env("PATH", "/usr/local/bin:/usr/bin:/bin")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                ExecutionError::Handler(format!(
                    "failed to start {}: {e}",
                    language.command()
                ))
            })?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(&stdin_payload)
                .await
                .map_err(|e| ExecutionError::Handler(format!("failed to write stdin: {e}")))?;
        }

        // dropping the wait future on expiry kills the child
        let output = match tokio::time::timeout(
            Duration::from_millis(timeout),
            child.wait_with_output(),
        )
        .await
        {
            Err(_) => {
                tracing::warn!(node_id = %node.id, timeout_ms = timeout, "script timed out");
                return Err(LimitError::Timeout { ms: timeout }.into());
            }
            Ok(waited) => waited
                .map_err(|e| ExecutionError::Handler(format!("script wait failed: {e}")))?,
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let excerpt: String = stderr.chars().take(500).collect();
            return Err(ExecutionError::Handler(format!(
                "script exited with {}: {excerpt}",
                output.status
            )));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let result = parse_result(&stdout).ok_or_else(|| {
            ExecutionError::Handler("script produced no result envelope on stdout".into())
        })?;

        Ok(HandlerOutcome::next().with_output(result))
    }
}

/// The wrapper binds `input`, `vars`, `last` and `output` from stdin,
/// runs the user code at top level, then prints `{"result": ...}`.
fn wrap_code(language: ScriptLanguage, code: &str) -> String {
    match language {
        ScriptLanguage::Python => format!(
            "import sys, json\n\
             _bindings = json.load(sys.stdin)\n\
             input = _bindings[\"input\"]\n\
             vars = _bindings[\"vars\"]\n\
             last = _bindings[\"last\"]\n\
             output = _bindings[\"output\"]\n\
             result = None\n\
             {code}\n\
             print(json.dumps({{\"result\": result}}))\n"
        ),
        ScriptLanguage::Javascript => format!(
            "const _bindings = JSON.parse(require('fs').readFileSync(0, 'utf8'));\n\
             const {{ input, vars, last, output }} = _bindings;\n\
             let result = null;\n\
             {code}\n\
             console.log(JSON.stringify({{ result }}));\n"
        ),
    }
}

/// User code may print arbitrary lines before the wrapper's envelope;
/// the last line holding a JSON object with a `result` key wins.
fn parse_result(stdout: &str) -> Option<Value> {
    stdout
        .lines()
        .rev()
        .filter(|l| !l.trim().is_empty())
        .find_map(|line| {
            serde_json::from_str::<Value>(line.trim())
                .ok()
                .and_then(|v| v.get("result").cloned())
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn script_node(language: ScriptLanguage, code: &str) -> CompiledNode {
        CompiledNode {
            id: "s".into(),
            name: "script".into(),
            config: NodeConfig::Script {
                language,
                code: code.into(),
                timeout_ms: Some(5_000),
            },
        }
    }

    #[tokio::test]
    async fn disabled_by_default() {
        let n = script_node(ScriptLanguage::Python, "result = 1");
        let mut ctx = ExecutionContext::new(Value::Null);
        let mut scratch = RunScratch::default();
        let err = ScriptHandler
            .execute(&n, &mut ctx, &mut scratch, &EnginePolicy::default())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ExecutionError::Security(SecurityError::CodeExecutionDisabled { .. })
        ));
    }

    #[tokio::test]
    async fn python_result_binding_becomes_output() {
        let n = script_node(ScriptLanguage::Python, "result = input[\"a\"] + 4");
        let mut ctx = ExecutionContext::new(json!({"a": 3}));
        let mut scratch = RunScratch::default();
        let policy = EnginePolicy::default().with_code_execution(true);
        let out = ScriptHandler
            .execute(&n, &mut ctx, &mut scratch, &policy)
            .await
            .unwrap();
        assert_eq!(out.output, Some(json!(7)));
    }

    #[tokio::test]
    async fn runaway_script_is_killed_on_timeout() {
        let n = CompiledNode {
            id: "s".into(),
            name: "script".into(),
            config: NodeConfig::Script {
                language: ScriptLanguage::Python,
                code: "import time\ntime.sleep(60)".into(),
                timeout_ms: Some(200),
            },
        };
        let mut ctx = ExecutionContext::new(Value::Null);
        let mut scratch = RunScratch::default();
        let policy = EnginePolicy::default().with_code_execution(true);
        let err = ScriptHandler
            .execute(&n, &mut ctx, &mut scratch, &policy)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ExecutionError::Limit(LimitError::Timeout { ms: 200 })
        ));
    }

    #[test]
    fn result_envelope_is_last_json_line() {
        let stdout = "debug noise\n{\"result\": 5}\n";
        assert_eq!(parse_result(stdout), Some(json!(5)));
        assert_eq!(parse_result("no envelope here\n"), None);
    }
}
