//! Template rendering: `{{ expr }}` spans evaluated against the run's
//! binding set, everything else copied through verbatim.

use serde_json::Value;

use crate::expr::{self, ExpressionError};

/// Render a template string. Each `{{ expr }}` span is evaluated with
/// the restricted evaluator; strings interpolate raw, compound values
/// interpolate as compact JSON, null as the empty string.
pub fn render(template: &str, bindings: &Value) -> Result<String, ExpressionError> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(open) = rest.find("{{") {
        out.push_str(&rest[..open]);
        let after = &rest[open + 2..];
        let close = after.find("}}").ok_or(ExpressionError::Parse {
            message: "unclosed '{{' in template".to_string(),
        })?;
        let expression = after[..close].trim();
        if !expression.is_empty() {
            let value = expr::evaluate(expression, bindings)?;
            out.push_str(&render_value(&value));
        }
        rest = &after[close + 2..];
    }
    out.push_str(rest);
    Ok(out)
}

fn render_value(value: &Value) -> String {
    expr::stringify(value)
}
