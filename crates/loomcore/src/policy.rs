/// Security and resource policy for a runtime instance.
///
/// Always injected by the host; never a module-level singleton. The
/// defaults are the locked-down posture: no code execution, no private
/// network targets, empty allowlist.
#[derive(Debug, Clone)]
pub struct EnginePolicy {
    /// Opt-in gate for `script` nodes.
    pub allow_code_execution: bool,
    /// Hosts exempt from the SSRF guard. Exact hostnames or `*.domain`
    /// globs; entries carrying a scheme/port/path are normalized down to
    /// the bare hostname.
    pub http_allowlist: Vec<String>,
    /// Escape hatch admitting private/loopback targets (local dev).
    pub allow_private_network: bool,
    /// Global per-run step budget.
    pub step_budget: u32,
    /// Default timeout for `http` nodes, overridable per node.
    pub http_timeout_ms: u64,
    /// Default wall-clock timeout for `script` nodes.
    pub script_timeout_ms: u64,
    /// Per-thread message admission cap.
    pub max_thread_messages: usize,
}

impl Default for EnginePolicy {
    fn default() -> Self {
        Self {
            allow_code_execution: false,
            http_allowlist: Vec::new(),
            allow_private_network: false,
            step_budget: 500,
            http_timeout_ms: 30_000,
            script_timeout_ms: 10_000,
            max_thread_messages: 200,
        }
    }
}

impl EnginePolicy {
    pub fn with_allowlist(mut self, hosts: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.http_allowlist = hosts.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_code_execution(mut self, enabled: bool) -> Self {
        self.allow_code_execution = enabled;
        self
    }

    pub fn with_step_budget(mut self, budget: u32) -> Self {
        self.step_budget = budget;
        self
    }
}
