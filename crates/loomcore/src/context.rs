use serde_json::{json, Map, Value};

/// The only state threaded through node execution.
///
/// `vars` persists across the whole run; `last` and `output` are
/// overwritten per step.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub input: Value,
    pub vars: Map<String, Value>,
    pub last: Value,
    pub output: Value,
}

impl ExecutionContext {
    pub fn new(input: Value) -> Self {
        Self {
            input,
            vars: Map::new(),
            last: Value::Null,
            output: Value::Null,
        }
    }

    /// The fixed binding set the expression evaluator sees. Nothing else
    /// is ever exposed to expressions or templates.
    pub fn bindings(&self) -> Value {
        json!({
            "input": self.input,
            "vars": Value::Object(self.vars.clone()),
            "last": self.last,
            "output": self.output,
        })
    }

    pub fn set_var(&mut self, name: impl Into<String>, value: Value) {
        self.vars.insert(name.into(), value);
    }

    /// Size-truncated snapshot of `vars` for observability events, so
    /// event payloads stay bounded.
    pub fn vars_preview(&self, limit: usize) -> String {
        let rendered =
            serde_json::to_string(&self.vars).unwrap_or_else(|_| "<unserializable>".to_string());
        if rendered.chars().count() <= limit {
            return rendered;
        }
        let mut cut: String = rendered.chars().take(limit).collect();
        cut.push('…');
        cut
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bindings_expose_exactly_the_four_names() {
        let mut ctx = ExecutionContext::new(json!({"q": 1}));
        ctx.set_var("x", json!(2));
        let b = ctx.bindings();
        let obj = b.as_object().unwrap();
        let mut keys: Vec<_> = obj.keys().collect();
        keys.sort();
        assert_eq!(keys, ["input", "last", "output", "vars"]);
        assert_eq!(b["vars"]["x"], json!(2));
    }

    #[test]
    fn vars_preview_truncates_on_char_boundary() {
        let mut ctx = ExecutionContext::new(Value::Null);
        ctx.set_var("blob", json!("é".repeat(600)));
        let preview = ctx.vars_preview(500);
        assert_eq!(preview.chars().count(), 501);
        assert!(preview.ends_with('…'));
    }

    #[test]
    fn vars_preview_short_values_untouched() {
        let mut ctx = ExecutionContext::new(Value::Null);
        ctx.set_var("a", json!(1));
        assert_eq!(ctx.vars_preview(500), r#"{"a":1}"#);
    }
}
