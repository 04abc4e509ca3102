use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, LOCATION};
use reqwest::{Method, StatusCode};
use serde_json::{json, Value};

use loomcore::{
    template, CompiledNode, EnginePolicy, ExecutionContext, ExecutionError, LimitError,
    NodeConfig, NodeKind,
};
use loomruntime::{HandlerOutcome, NodeHandler, RunScratch};

use crate::ssrf;

const MAX_REDIRECT_HOPS: usize = 5;

/// Outbound HTTP requests with per-hop URL guarding.
///
/// Automatic redirect following is disabled on the client; redirects are
/// walked manually so every hop passes [`ssrf::check_url`].
pub struct HttpHandler {
    client: reqwest::Client,
}

impl HttpHandler {
    pub fn new() -> Self {
        Self {
            // builder only fails when the TLS backend cannot load
            client: reqwest::Client::builder()
                .redirect(reqwest::redirect::Policy::none())
                .build()
                .expect("http client"),
        }
    }
}

impl Default for HttpHandler {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl NodeHandler for HttpHandler {
    fn kind(&self) -> NodeKind {
        NodeKind::Http
    }

    async fn execute(
        &self,
        node: &CompiledNode,
        ctx: &mut ExecutionContext,
        _scratch: &mut RunScratch,
        policy: &EnginePolicy,
    ) -> Result<HandlerOutcome, ExecutionError> {
        let NodeConfig::Http {
            method,
            url,
            headers,
            body,
            timeout_ms,
        } = &node.config
        else {
            return Err(ExecutionError::Configuration(format!(
                "node {} carries config for a different kind",
                node.id
            )));
        };

        let bindings = ctx.bindings();
        let method_str = template::render(method, &bindings)?;
        let mut method = Method::from_bytes(method_str.to_ascii_uppercase().as_bytes())
            .map_err(|_| {
                ExecutionError::Configuration(format!("invalid http method '{method_str}'"))
            })?;
        let mut current_url = template::render(url, &bindings)?;

        let mut header_map = HeaderMap::new();
        for (name, value) in headers {
            let value = template::render(value, &bindings)?;
            let name = HeaderName::from_bytes(name.as_bytes()).map_err(|_| {
                ExecutionError::Configuration(format!("invalid header name '{name}'"))
            })?;
            let value = HeaderValue::from_str(&value).map_err(|_| {
                ExecutionError::Configuration(format!("invalid value for header '{name}'"))
            })?;
            header_map.insert(name, value);
        }

        let mut body = match body {
            Some(b) => Some(template::render(b, &bindings)?),
            None => None,
        };

        let timeout = Duration::from_millis(timeout_ms.unwrap_or(policy.http_timeout_ms));

        for _hop in 0..=MAX_REDIRECT_HOPS {
            let checked = ssrf::check_url(&current_url, policy).await?;
            tracing::debug!(node_id = %node.id, method = %method, url = %checked, "http request");

            let mut request = self
                .client
                .request(method.clone(), checked.clone())
                .headers(header_map.clone())
                .timeout(timeout);
            if let Some(b) = &body {
                request = request.body(b.clone());
            }

            let response = request.send().await.map_err(|e| {
                if e.is_timeout() {
                    ExecutionError::Limit(LimitError::Timeout {
                        ms: timeout.as_millis() as u64,
                    })
                } else {
                    ExecutionError::Handler(format!("http request failed: {e}"))
                }
            })?;

            let status = response.status();
            if status.is_redirection() {
                let Some(location) = response
                    .headers()
                    .get(LOCATION)
                    .and_then(|v| v.to_str().ok())
                else {
                    return Err(ExecutionError::Handler(format!(
                        "redirect {status} without a Location header"
                    )));
                };
                let next = checked.join(location).map_err(|e| {
                    ExecutionError::Handler(format!("bad redirect target '{location}': {e}"))
                })?;

                let downgrade = status == StatusCode::SEE_OTHER
                    || ((status == StatusCode::MOVED_PERMANENTLY
                        || status == StatusCode::FOUND)
                        && method != Method::GET
                        && method != Method::HEAD);
                if downgrade {
                    method = Method::GET;
                    body = None;
                }
                current_url = next.to_string();
                continue;
            }

            let ok = status.is_success();
            let mut response_headers = HashMap::new();
            for (name, value) in response.headers() {
                if let Ok(v) = value.to_str() {
                    response_headers.insert(name.to_string(), v.to_string());
                }
            }

            let text = response
                .text()
                .await
                .map_err(|e| ExecutionError::Handler(format!("failed to read body: {e}")))?;
            let data = serde_json::from_str::<Value>(&text)
                .unwrap_or_else(|_| Value::String(text));

            let output = json!({
                "status": status.as_u16(),
                "ok": ok,
                "headers": response_headers,
                "data": data,
            });
            return Ok(HandlerOutcome::next().with_output(output));
        }

        Err(ExecutionError::Handler(format!(
            "more than {MAX_REDIRECT_HOPS} redirects"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Network behavior is covered by the runtime integration tests
    // against the guard; here only the config plumbing is exercised.

    #[tokio::test]
    async fn wrong_config_variant_is_rejected() {
        let node = CompiledNode {
            id: "h".into(),
            name: "http".into(),
            config: NodeConfig::Start,
        };
        let mut ctx = ExecutionContext::new(Value::Null);
        let mut scratch = RunScratch::default();
        let err = HttpHandler::new()
            .execute(&node, &mut ctx, &mut scratch, &EnginePolicy::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutionError::Configuration(_)));
    }

    #[tokio::test]
    async fn private_target_is_blocked_before_any_request() {
        let node = CompiledNode {
            id: "h".into(),
            name: "http".into(),
            config: NodeConfig::Http {
                method: "GET".into(),
                url: "http://169.254.169.254/latest/meta-data".into(),
                headers: HashMap::new(),
                body: None,
                timeout_ms: None,
            },
        };
        let mut ctx = ExecutionContext::new(Value::Null);
        let mut scratch = RunScratch::default();
        let err = HttpHandler::new()
            .execute(&node, &mut ctx, &mut scratch, &EnginePolicy::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutionError::Security(_)));
    }

    #[tokio::test]
    async fn invalid_method_is_a_config_error() {
        let node = CompiledNode {
            id: "h".into(),
            name: "http".into(),
            config: NodeConfig::Http {
                method: "GE T".into(),
                url: "https://example.com/".into(),
                headers: HashMap::new(),
                body: None,
                timeout_ms: None,
            },
        };
        let mut ctx = ExecutionContext::new(Value::Null);
        let mut scratch = RunScratch::default();
        let err = HttpHandler::new()
            .execute(&node, &mut ctx, &mut scratch, &EnginePolicy::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutionError::Configuration(_)));
    }
}
