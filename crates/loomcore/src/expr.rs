//! Restricted expression evaluator for node conditions and transforms.
//!
//! Expressions are evaluated against exactly the `{input, vars, last,
//! output}` binding set — there is no ambient environment, no function
//! calls, no indexing, and nothing that can reach outside the run
//! context. Deliberately small; this is the highest scope-creep risk in
//! the system.
//!
//! Supported:
//! - Field access: dot notation (`vars.count`, `last.data.items`)
//! - Comparisons: `==`, `!=`, `>`, `<`, `>=`, `<=` (f64 coercion)
//! - Logical: `&&`, `||`, `!`
//! - Arithmetic: `+`, `-`, `*`, `/` (`+` concatenates when either side
//!   is a string)
//! - Literals: string (single or double quoted), number, bool, null
//! - Parentheses

use serde_json::{Number, Value};
use thiserror::Error;

/// Errors from expression evaluation.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ExpressionError {
    #[error("parse error: {message}")]
    Parse { message: String },
    #[error("evaluation error: {message}")]
    Eval { message: String },
}

fn parse_err(message: impl Into<String>) -> ExpressionError {
    ExpressionError::Parse {
        message: message.into(),
    }
}

fn eval_err(message: impl Into<String>) -> ExpressionError {
    ExpressionError::Eval {
        message: message.into(),
    }
}

/// Evaluate an expression against the run's binding object, producing a
/// JSON value. Missing paths resolve to null rather than erroring so
/// conditions can probe optional state.
pub fn evaluate(expression: &str, bindings: &Value) -> Result<Value, ExpressionError> {
    let tokens = tokenize(expression)?;
    if tokens.is_empty() {
        return Err(parse_err("empty expression"));
    }
    let (val, rest) = parse_or(&tokens, bindings)?;
    if !rest.is_empty() {
        return Err(parse_err(format!("unexpected token: {:?}", rest[0])));
    }
    Ok(val)
}

/// Evaluate an expression and apply truthiness.
pub fn evaluate_bool(expression: &str, bindings: &Value) -> Result<bool, ExpressionError> {
    Ok(is_truthy(&evaluate(expression, bindings)?))
}

/// JS-like truthiness: null, false, 0, NaN and "" are false; arrays and
/// objects are always true.
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0 && !f.is_nan()).unwrap_or(false),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

// ---------------------------------------------------------------------------
// Tokenizer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String), // dotted path into the bindings
    Str(String),
    Num(f64),
    Bool(bool),
    Null,
    Eq,
    Ne,
    Gt,
    Lt,
    Ge,
    Le,
    And,
    Or,
    Not,
    Plus,
    Minus,
    Star,
    Slash,
    LParen,
    RParen,
}

fn tokenize(input: &str) -> Result<Vec<Token>, ExpressionError> {
    let mut tokens = Vec::new();
    let chars: Vec<char> = input.chars().collect();
    let mut i = 0;

    while i < chars.len() {
        match chars[i] {
            ' ' | '\t' | '\r' | '\n' => i += 1,
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '+' => {
                tokens.push(Token::Plus);
                i += 1;
            }
            '-' => {
                tokens.push(Token::Minus);
                i += 1;
            }
            '*' => {
                tokens.push(Token::Star);
                i += 1;
            }
            '/' => {
                tokens.push(Token::Slash);
                i += 1;
            }
            '=' if peek(&chars, i + 1) == Some('=') => {
                tokens.push(Token::Eq);
                i += 2;
            }
            '!' if peek(&chars, i + 1) == Some('=') => {
                tokens.push(Token::Ne);
                i += 2;
            }
            '!' => {
                tokens.push(Token::Not);
                i += 1;
            }
            '>' if peek(&chars, i + 1) == Some('=') => {
                tokens.push(Token::Ge);
                i += 2;
            }
            '>' => {
                tokens.push(Token::Gt);
                i += 1;
            }
            '<' if peek(&chars, i + 1) == Some('=') => {
                tokens.push(Token::Le);
                i += 2;
            }
            '<' => {
                tokens.push(Token::Lt);
                i += 1;
            }
            '&' if peek(&chars, i + 1) == Some('&') => {
                tokens.push(Token::And);
                i += 2;
            }
            '|' if peek(&chars, i + 1) == Some('|') => {
                tokens.push(Token::Or);
                i += 2;
            }
            '"' | '\'' => {
                let quote = chars[i];
                i += 1;
                let start = i;
                while i < chars.len() && chars[i] != quote {
                    i += 1;
                }
                if i >= chars.len() {
                    return Err(parse_err("unterminated string literal"));
                }
                let s: String = chars[start..i].iter().collect();
                tokens.push(Token::Str(s));
                i += 1; // closing quote
            }
            c if c.is_ascii_digit() => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let num_str: String = chars[start..i].iter().collect();
                let num: f64 = num_str
                    .parse()
                    .map_err(|_| parse_err(format!("invalid number: {num_str}")))?;
                tokens.push(Token::Num(num));
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len()
                    && (chars[i].is_ascii_alphanumeric() || chars[i] == '_' || chars[i] == '.')
                {
                    i += 1;
                }
                let ident: String = chars[start..i].iter().collect();
                match ident.as_str() {
                    "true" => tokens.push(Token::Bool(true)),
                    "false" => tokens.push(Token::Bool(false)),
                    "null" => tokens.push(Token::Null),
                    _ => tokens.push(Token::Ident(ident)),
                }
            }
            other => {
                return Err(parse_err(format!("unexpected character: {other}")));
            }
        }
    }
    Ok(tokens)
}

fn peek(chars: &[char], idx: usize) -> Option<char> {
    chars.get(idx).copied()
}

// ---------------------------------------------------------------------------
// Recursive descent — precedence: unary > * / > + - > comparison > ! > && > ||
//
// Evaluation is eager during the descent; expressions have no side
// effects so short-circuiting is a non-observable optimization we skip.
// ---------------------------------------------------------------------------

type ParseResult<'a> = Result<(Value, &'a [Token]), ExpressionError>;

fn parse_or<'a>(tokens: &'a [Token], data: &Value) -> ParseResult<'a> {
    let (mut left, mut rest) = parse_and(tokens, data)?;
    while rest.first() == Some(&Token::Or) {
        let (right, r) = parse_and(&rest[1..], data)?;
        left = Value::Bool(is_truthy(&left) || is_truthy(&right));
        rest = r;
    }
    Ok((left, rest))
}

fn parse_and<'a>(tokens: &'a [Token], data: &Value) -> ParseResult<'a> {
    let (mut left, mut rest) = parse_not(tokens, data)?;
    while rest.first() == Some(&Token::And) {
        let (right, r) = parse_not(&rest[1..], data)?;
        left = Value::Bool(is_truthy(&left) && is_truthy(&right));
        rest = r;
    }
    Ok((left, rest))
}

fn parse_not<'a>(tokens: &'a [Token], data: &Value) -> ParseResult<'a> {
    if tokens.first() == Some(&Token::Not) {
        let (val, rest) = parse_not(&tokens[1..], data)?;
        return Ok((Value::Bool(!is_truthy(&val)), rest));
    }
    parse_comparison(tokens, data)
}

fn parse_comparison<'a>(tokens: &'a [Token], data: &Value) -> ParseResult<'a> {
    let (left, rest) = parse_additive(tokens, data)?;
    let op = match rest.first() {
        Some(Token::Eq) => CompOp::Eq,
        Some(Token::Ne) => CompOp::Ne,
        Some(Token::Gt) => CompOp::Gt,
        Some(Token::Lt) => CompOp::Lt,
        Some(Token::Ge) => CompOp::Ge,
        Some(Token::Le) => CompOp::Le,
        _ => return Ok((left, rest)),
    };
    let (right, rest) = parse_additive(&rest[1..], data)?;
    Ok((Value::Bool(compare(&left, &right, op)), rest))
}

fn parse_additive<'a>(tokens: &'a [Token], data: &Value) -> ParseResult<'a> {
    let (mut left, mut rest) = parse_multiplicative(tokens, data)?;
    loop {
        match rest.first() {
            Some(Token::Plus) => {
                let (right, r) = parse_multiplicative(&rest[1..], data)?;
                left = add_values(&left, &right)?;
                rest = r;
            }
            Some(Token::Minus) => {
                let (right, r) = parse_multiplicative(&rest[1..], data)?;
                left = numeric_op(&left, &right, "-", |a, b| a - b)?;
                rest = r;
            }
            _ => return Ok((left, rest)),
        }
    }
}

fn parse_multiplicative<'a>(tokens: &'a [Token], data: &Value) -> ParseResult<'a> {
    let (mut left, mut rest) = parse_unary(tokens, data)?;
    loop {
        match rest.first() {
            Some(Token::Star) => {
                let (right, r) = parse_unary(&rest[1..], data)?;
                left = numeric_op(&left, &right, "*", |a, b| a * b)?;
                rest = r;
            }
            Some(Token::Slash) => {
                let (right, r) = parse_unary(&rest[1..], data)?;
                left = numeric_op(&left, &right, "/", |a, b| a / b)?;
                rest = r;
            }
            _ => return Ok((left, rest)),
        }
    }
}

fn parse_unary<'a>(tokens: &'a [Token], data: &Value) -> ParseResult<'a> {
    if tokens.first() == Some(&Token::Minus) {
        let (val, rest) = parse_unary(&tokens[1..], data)?;
        let n = as_number(&val).ok_or_else(|| eval_err("unary '-' needs a number"))?;
        return Ok((number(-n)?, rest));
    }
    parse_primary(tokens, data)
}

fn parse_primary<'a>(tokens: &'a [Token], data: &Value) -> ParseResult<'a> {
    match tokens.first() {
        None => Err(parse_err("unexpected end of expression")),
        Some(Token::Str(s)) => Ok((Value::String(s.clone()), &tokens[1..])),
        Some(Token::Num(n)) => Ok((number(*n)?, &tokens[1..])),
        Some(Token::Bool(b)) => Ok((Value::Bool(*b), &tokens[1..])),
        Some(Token::Null) => Ok((Value::Null, &tokens[1..])),
        Some(Token::Ident(path)) => Ok((resolve_path(data, path), &tokens[1..])),
        Some(Token::LParen) => {
            let (val, rest) = parse_or(&tokens[1..], data)?;
            if rest.first() != Some(&Token::RParen) {
                return Err(parse_err("expected ')'"));
            }
            Ok((val, &rest[1..]))
        }
        Some(other) => Err(parse_err(format!("expected value, got {other:?}"))),
    }
}

// ---------------------------------------------------------------------------
// Operators
// ---------------------------------------------------------------------------

enum CompOp {
    Eq,
    Ne,
    Gt,
    Lt,
    Ge,
    Le,
}

fn compare(left: &Value, right: &Value, op: CompOp) -> bool {
    if left.is_null() || right.is_null() {
        let both_null = left.is_null() && right.is_null();
        return match op {
            CompOp::Eq => both_null,
            CompOp::Ne => !both_null,
            _ => false,
        };
    }

    // Numeric comparison with f64 coercion — 1 and 1.0 are equal.
    if let (Some(l), Some(r)) = (as_number(left), as_number(right)) {
        return match op {
            CompOp::Eq => (l - r).abs() < f64::EPSILON,
            CompOp::Ne => (l - r).abs() >= f64::EPSILON,
            CompOp::Gt => l > r,
            CompOp::Lt => l < r,
            CompOp::Ge => l >= r,
            CompOp::Le => l <= r,
        };
    }

    if let (Value::String(l), Value::String(r)) = (left, right) {
        return match op {
            CompOp::Eq => l == r,
            CompOp::Ne => l != r,
            CompOp::Gt => l > r,
            CompOp::Lt => l < r,
            CompOp::Ge => l >= r,
            CompOp::Le => l <= r,
        };
    }

    // Structural equality for everything else; ordering is undefined.
    match op {
        CompOp::Eq => left == right,
        CompOp::Ne => left != right,
        _ => false,
    }
}

fn add_values(left: &Value, right: &Value) -> Result<Value, ExpressionError> {
    if left.is_string() || right.is_string() {
        return Ok(Value::String(format!(
            "{}{}",
            stringify(left),
            stringify(right)
        )));
    }
    numeric_op(left, right, "+", |a, b| a + b)
}

fn numeric_op(
    left: &Value,
    right: &Value,
    op: &str,
    f: impl Fn(f64, f64) -> f64,
) -> Result<Value, ExpressionError> {
    let (l, r) = match (as_number(left), as_number(right)) {
        (Some(l), Some(r)) => (l, r),
        _ => return Err(eval_err(format!("'{op}' needs numeric operands"))),
    };
    number(f(l, r))
}

fn number(n: f64) -> Result<Value, ExpressionError> {
    Number::from_f64(n)
        .map(Value::Number)
        .ok_or_else(|| eval_err("arithmetic produced a non-finite number"))
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        _ => None,
    }
}

/// Render a value as a plain string for concatenation and templates.
/// Whole numbers drop the trailing `.0`; compound values render as
/// compact JSON.
pub(crate) fn stringify(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => match n.as_f64() {
            Some(f) if f.fract() == 0.0 && f.abs() < 1e15 => format!("{}", f as i64),
            _ => n.to_string(),
        },
        Value::String(s) => s.clone(),
        other => serde_json::to_string(other).unwrap_or_default(),
    }
}

/// Resolve a dotted path against the binding object. Missing segments
/// resolve to null (not an error).
fn resolve_path(data: &Value, path: &str) -> Value {
    let mut current = data;
    for segment in path.split('.') {
        match current.get(segment) {
            Some(v) => current = v,
            None => return Value::Null,
        }
    }
    current.clone()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx() -> Value {
        json!({
            "input": {"user": "ada", "n": 3},
            "vars": {"count": 2, "items": [1, 2, 3], "flag": true},
            "last": {"status": 200, "ok": true},
            "output": null,
        })
    }

    #[test]
    fn equality_and_inequality() {
        assert_eq!(
            evaluate(r#"input.user == "ada""#, &ctx()).unwrap(),
            json!(true)
        );
        assert_eq!(
            evaluate(r#"input.user != "ada""#, &ctx()).unwrap(),
            json!(false)
        );
    }

    #[test]
    fn numeric_coercion() {
        assert!(evaluate_bool("vars.count == 2.0", &ctx()).unwrap());
        assert!(evaluate_bool("last.status >= 200", &ctx()).unwrap());
        assert!(!evaluate_bool("last.status > 200", &ctx()).unwrap());
    }

    #[test]
    fn logical_operators() {
        assert!(evaluate_bool("last.ok && vars.flag", &ctx()).unwrap());
        assert!(evaluate_bool("!output", &ctx()).unwrap());
        assert!(evaluate_bool("output || vars.flag", &ctx()).unwrap());
    }

    #[test]
    fn arithmetic() {
        assert_eq!(evaluate("vars.count + 1", &ctx()).unwrap(), json!(3.0));
        assert_eq!(evaluate("vars.count * 10", &ctx()).unwrap(), json!(20.0));
        assert_eq!(
            evaluate("(vars.count + 1) * 2", &ctx()).unwrap(),
            json!(6.0)
        );
        assert_eq!(evaluate("-vars.count", &ctx()).unwrap(), json!(-2.0));
    }

    #[test]
    fn string_concatenation() {
        assert_eq!(
            evaluate(r#""hello " + input.user"#, &ctx()).unwrap(),
            json!("hello ada")
        );
        assert_eq!(
            evaluate(r#"input.user + "-" + vars.count"#, &ctx()).unwrap(),
            json!("ada-2")
        );
    }

    #[test]
    fn missing_path_is_null() {
        assert_eq!(evaluate("vars.nope.deeper", &ctx()).unwrap(), json!(null));
        assert!(evaluate_bool("vars.nope == null", &ctx()).unwrap());
    }

    #[test]
    fn value_producing_paths() {
        assert_eq!(
            evaluate("vars.items", &ctx()).unwrap(),
            json!([1, 2, 3])
        );
    }

    #[test]
    fn truthiness() {
        assert!(!is_truthy(&json!(null)));
        assert!(!is_truthy(&json!(0)));
        assert!(!is_truthy(&json!("")));
        assert!(is_truthy(&json!([])));
        assert!(is_truthy(&json!({"a": 1})));
    }

    #[test]
    fn division_by_zero_is_an_error() {
        assert!(matches!(
            evaluate("1 / 0", &ctx()),
            Err(ExpressionError::Eval { .. })
        ));
    }

    #[test]
    fn parse_errors() {
        assert!(evaluate("", &ctx()).is_err());
        assert!(evaluate("==", &ctx()).is_err());
        assert!(evaluate("(1 + 2", &ctx()).is_err());
        assert!(evaluate(r#""unterminated"#, &ctx()).is_err());
    }

    #[test]
    fn single_quoted_strings() {
        assert!(evaluate_bool("input.user == 'ada'", &ctx()).unwrap());
    }
}
