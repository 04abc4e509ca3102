//! Eval runner: drives the engine across labeled test cases and
//! aggregates pass/fail.

use std::time::Instant;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use loomcore::{expr, CompiledFlow};

use crate::engine::Engine;

/// One labeled case. `expect_expr` is evaluated against the finished
/// run's `{input, vars, last, output}` bindings and must be truthy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvalCase {
    pub name: String,
    pub input: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expect_expr: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_duration_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CaseResult {
    pub name: String,
    pub passed: bool,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assertion: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvalReport {
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    /// Percentage with two decimals, e.g. 66.67.
    pub pass_rate: f64,
    pub cases: Vec<CaseResult>,
}

pub struct EvalRunner {
    engine: Engine,
}

impl EvalRunner {
    pub fn new(engine: Engine) -> Self {
        Self { engine }
    }

    /// Run every case; an engine error fails that case without aborting
    /// the rest of the batch.
    pub async fn run(&self, flow: &CompiledFlow, cases: &[EvalCase]) -> EvalReport {
        let mut results = Vec::with_capacity(cases.len());

        for case in cases {
            let started = Instant::now();
            let result = self.engine.execute(flow, case.input.clone()).await;
            let duration_ms = started.elapsed().as_millis() as u64;

            let case_result = match result {
                Err(failure) => CaseResult {
                    name: case.name.clone(),
                    passed: false,
                    duration_ms,
                    output: None,
                    error: Some(failure.error.to_string()),
                    assertion: None,
                },
                Ok(done) => {
                    let output = done.record.output.clone();
                    let mut passed = true;
                    let mut error = None;
                    let mut assertion = None;

                    if let Some(expect) = &case.expect_expr {
                        assertion = Some(expect.clone());
                        match expr::evaluate_bool(expect, &done.context.bindings()) {
                            Ok(true) => {}
                            Ok(false) => {
                                passed = false;
                                error = Some(format!("expectation not met: {expect}"));
                            }
                            Err(e) => {
                                passed = false;
                                error = Some(format!("expectation error: {e}"));
                            }
                        }
                    }

                    if passed {
                        if let Some(max) = case.max_duration_ms {
                            if duration_ms > max {
                                passed = false;
                                error =
                                    Some(format!("took {duration_ms}ms, budget was {max}ms"));
                            }
                        }
                    }

                    CaseResult {
                        name: case.name.clone(),
                        passed,
                        duration_ms,
                        output,
                        error,
                        assertion,
                    }
                }
            };

            tracing::info!(
                case = %case_result.name,
                passed = case_result.passed,
                duration_ms = case_result.duration_ms,
                "eval case finished"
            );
            results.push(case_result);
        }

        let total = results.len();
        let passed = results.iter().filter(|r| r.passed).count();
        let failed = total - passed;
        let pass_rate = if total == 0 {
            0.0
        } else {
            (passed as f64 / total as f64 * 10_000.0).round() / 100.0
        };

        EvalReport {
            total,
            passed,
            failed,
            pass_rate,
            cases: results,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn case_format_uses_camel_case_keys() {
        let case: EvalCase = serde_json::from_value(serde_json::json!({
            "name": "smoke",
            "input": {"x": 1},
            "expectExpr": "output == 1",
            "maxDurationMs": 100,
        }))
        .unwrap();
        assert_eq!(case.expect_expr.as_deref(), Some("output == 1"));
        assert_eq!(case.max_duration_ms, Some(100));
    }

    #[test]
    fn pass_rate_rounds_to_two_decimals() {
        // 2 of 3 → 66.67
        let rate = (2.0_f64 / 3.0 * 10_000.0).round() / 100.0;
        assert_eq!(rate, 66.67);
    }
}
