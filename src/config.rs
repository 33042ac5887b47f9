use serde::Deserialize;

/// Main application configuration structure.
/// Matches the layout of `data/config.yaml`.
#[derive(Debug, Default, Deserialize, Clone)]
pub struct AppConfig {
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub timeouts: TimeoutsConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub sandbox: SandboxConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub identifiers: Vec<IdentifierPattern>,
    #[serde(default)]
    pub servers: Vec<ServerHints>,
}

/// Listener settings for the gateway HTTP surface.
#[derive(Debug, Deserialize, Clone)]
pub struct GatewayConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Shared secret checked on `/execute` and `/proxy`. Unset means open mode.
    #[serde(default)]
    pub secret: Option<String>,
    /// URL the sandboxed script uses to reach the proxy endpoint. Its host is
    /// the only network destination the sandbox runtime is allowed.
    #[serde(default)]
    pub proxy_url: Option<String>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            secret: None,
            proxy_url: None,
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:8787".to_string()
}

/// All timeouts in seconds.
#[derive(Debug, Deserialize, Clone)]
pub struct TimeoutsConfig {
    /// Single transport connect attempt.
    #[serde(default = "default_connect")]
    pub connect: u64,
    /// Overall budget for one request's batch of connect attempts.
    #[serde(default = "default_connect_budget")]
    pub connect_budget: u64,
    /// Default per tool call, unless the descriptor overrides it.
    #[serde(default = "default_tool_call")]
    pub tool_call: u64,
    /// Wall-clock limit for one sandbox run.
    #[serde(default = "default_sandbox_run")]
    pub sandbox_run: u64,
}

impl Default for TimeoutsConfig {
    fn default() -> Self {
        Self {
            connect: default_connect(),
            connect_budget: default_connect_budget(),
            tool_call: default_tool_call(),
            sandbox_run: default_sandbox_run(),
        }
    }
}

fn default_connect() -> u64 {
    10
}

fn default_connect_budget() -> u64 {
    30
}

fn default_tool_call() -> u64 {
    60
}

fn default_sandbox_run() -> u64 {
    120
}

/// Connection cache settings.
#[derive(Debug, Deserialize, Clone)]
pub struct CacheConfig {
    /// Idle time before a cached connection is evicted.
    #[serde(default = "default_ttl")]
    pub ttl_secs: u64,
    /// How often the background sweep runs.
    #[serde(default = "default_sweep")]
    pub sweep_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_ttl(),
            sweep_secs: default_sweep(),
        }
    }
}

fn default_ttl() -> u64 {
    300
}

fn default_sweep() -> u64 {
    60
}

/// Sandbox runtime settings.
#[derive(Debug, Deserialize, Clone)]
pub struct SandboxConfig {
    /// Runtime binary used to execute harness scripts.
    #[serde(default = "default_runtime")]
    pub runtime: String,
    /// Extra flags appended before the harness path.
    #[serde(default)]
    pub extra_flags: Vec<String>,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            runtime: default_runtime(),
            extra_flags: Vec::new(),
        }
    }
}

fn default_runtime() -> String {
    "deno".to_string()
}

/// Retry policy knobs.
#[derive(Debug, Deserialize, Clone)]
pub struct RetryConfig {
    /// On an enum-violation retry, substitute the first enumerated value for
    /// required fields that arrived as empty strings. This is a heuristic:
    /// the first enum value is not guaranteed to be semantically acceptable.
    /// When disabled, such fields are dropped instead.
    #[serde(default = "default_true")]
    pub substitute_first_enum_value: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            substitute_first_enum_value: default_true(),
        }
    }
}

fn default_true() -> bool {
    true
}

/// A domain-identifier pattern used by cross-reference enrichment.
#[derive(Debug, Deserialize, Clone)]
pub struct IdentifierPattern {
    /// Identifier type name, e.g. "order_id".
    pub name: String,
    /// Regex matched against the serialized response data.
    pub pattern: String,
    #[serde(default = "default_confidence")]
    pub confidence: Confidence,
}

#[derive(Debug, Deserialize, serde::Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    Low,
    Medium,
    High,
}

fn default_confidence() -> Confidence {
    Confidence::Medium
}

/// Static declaration of which identifier types a server accepts.
/// Used only to attach cross-reference hints; never consulted on the call path.
#[derive(Debug, Deserialize, Clone)]
pub struct ServerHints {
    pub key: String,
    #[serde(default)]
    pub accepts: Vec<String>,
    #[serde(default)]
    pub hint: Option<String>,
}

impl AppConfig {
    /// Load configuration from a YAML file. A missing file yields defaults
    /// (open mode, standard timeouts) so the gateway can run unconfigured.
    pub fn load(path: &str) -> anyhow::Result<Self> {
        use anyhow::Context;

        if !std::path::Path::new(path).exists() {
            return Ok(Self::default());
        }
        let content =
            std::fs::read_to_string(path).with_context(|| format!("Failed to read {}", path))?;
        let config: Self =
            serde_yaml::from_str(&content).with_context(|| format!("Failed to parse {}", path))?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_open_mode() {
        let config = AppConfig::default();
        assert!(config.gateway.secret.is_none());
        assert_eq!(config.cache.ttl_secs, 300);
        assert_eq!(config.timeouts.tool_call, 60);
        assert!(config.retry.substitute_first_enum_value);
    }

    #[test]
    fn parses_partial_yaml() {
        let yaml = r#"
gateway:
  bind: "0.0.0.0:9000"
  secret: "hunter2"
identifiers:
  - name: order_id
    pattern: "ORD-[0-9]{6}"
    confidence: high
servers:
  - key: billing
    accepts: [order_id]
    hint: "pass as the `order` argument"
"#;
        let config: AppConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.gateway.bind, "0.0.0.0:9000");
        assert_eq!(config.gateway.secret.as_deref(), Some("hunter2"));
        assert_eq!(config.identifiers.len(), 1);
        assert_eq!(config.identifiers[0].confidence, Confidence::High);
        assert_eq!(config.servers[0].accepts, vec!["order_id"]);
        // Sections not present fall back to defaults.
        assert_eq!(config.timeouts.connect, 10);
        assert_eq!(config.sandbox.runtime, "deno");
    }
}
