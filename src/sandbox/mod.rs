//! Isolated execution of model-authored scripts against the generated
//! helper API.
//!
//! A request passes through validation, harness construction and an isolated
//! run, and always terminates in exactly one of the two result shapes.

pub mod classify;
pub mod runner;
pub mod validate;

use std::time::Duration;

use serde_json::Value;

use crate::config::SandboxConfig;
use crate::error::{GatewayError, GatewayResult};

pub use classify::{ClassifiedError, classify_error};
pub use runner::{SandboxRunner, build_harness};
pub use validate::validate_script;

/// One script execution. Transient; nothing survives into the next request.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct SandboxRequest {
    pub script: String,
    pub helper_source: String,
    #[serde(default)]
    pub tool_names: Vec<String>,
    #[serde(default)]
    pub helper_meta: Value,
}

/// Terminal outcome of a sandbox run. Exactly one of the two shapes, never
/// partially populated.
#[derive(Debug, serde::Serialize)]
#[serde(untagged)]
pub enum SandboxResult {
    Success {
        result: Value,
        logs: Vec<String>,
    },
    Failure {
        error: String,
        code: String,
        suggestions: Vec<String>,
        logs: Vec<String>,
        detail: String,
    },
}

pub struct Sandbox {
    runner: SandboxRunner,
}

impl Sandbox {
    pub fn new(
        config: &SandboxConfig,
        run_timeout: Duration,
        proxy_url: &str,
    ) -> GatewayResult<Self> {
        let runner = SandboxRunner::new(&config.runtime, &config.extra_flags, run_timeout, proxy_url)?;
        Ok(Self { runner })
    }

    /// Run one request through to a terminal result.
    pub async fn execute(&self, request: SandboxRequest) -> SandboxResult {
        if let Err(err) = validate_script(&request.script) {
            let message = err.to_string();
            return SandboxResult::Failure {
                error: message.clone(),
                code: "invalid_script".to_string(),
                suggestions: vec![
                    "Rewrite the script to match the example in the message.".to_string(),
                ],
                logs: Vec::new(),
                detail: message,
            };
        }

        let harness = build_harness(&request.script, &request.helper_source);
        let envelope = match self.runner.run(&harness).await {
            Ok(envelope) => envelope,
            Err(err) => return self.infrastructure_failure(err),
        };

        if envelope.ok {
            tracing::debug!(logs = envelope.logs.len(), "script completed");
            return SandboxResult::Success {
                result: envelope.result,
                logs: envelope.logs,
            };
        }

        let raw = envelope.error.unwrap_or_else(|| "unknown script error".to_string());
        let mut classified = classify_error(&raw);
        self.suggest_tools(&mut classified, &request.tool_names);
        let stack = envelope.stack.unwrap_or_default();
        let detail = if stack.is_empty() {
            raw.clone()
        } else {
            format!("{raw}\n{}", runner::truncate(&stack, 1200))
        };
        tracing::warn!(code = %classified.code, error = %raw, "script failed");
        SandboxResult::Failure {
            error: classified.message,
            code: classified.code,
            suggestions: classified.suggestions,
            logs: envelope.logs,
            detail,
        }
    }

    fn infrastructure_failure(&self, err: GatewayError) -> SandboxResult {
        let (code, suggestions) = match &err {
            GatewayError::Timeout(_) => (
                "timeout",
                vec![format!(
                    "The script must finish within {}s; reduce the amount of work per run.",
                    self.runner.run_timeout().as_secs()
                )],
            ),
            _ => (
                "sandbox_failure",
                vec!["This is a gateway-side fault, not a script error.".to_string()],
            ),
        };
        let message = err.to_string();
        SandboxResult::Failure {
            error: message.clone(),
            code: code.to_string(),
            suggestions,
            logs: Vec::new(),
            detail: message,
        }
    }

    fn suggest_tools(&self, classified: &mut ClassifiedError, tool_names: &[String]) {
        if tool_names.is_empty() {
            return;
        }
        if classified.code == "reference_not_found" || classified.code == "http_not_found" {
            let mut names: Vec<&str> = tool_names.iter().map(String::as_str).collect();
            names.sort_unstable();
            names.truncate(12);
            classified
                .suggestions
                .push(format!("Known tools include: {}", names.join(", ")));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sandbox() -> Sandbox {
        Sandbox::new(
            &SandboxConfig::default(),
            Duration::from_secs(5),
            "http://127.0.0.1:8787/proxy",
        )
        .unwrap()
    }

    fn request(script: &str) -> SandboxRequest {
        SandboxRequest {
            script: script.to_string(),
            helper_source: "const servers = {};\n".to_string(),
            tool_names: vec!["search_files".to_string(), "read_file".to_string()],
            helper_meta: json!({}),
        }
    }

    #[tokio::test]
    async fn invalid_scripts_fail_before_any_execution() {
        let result = sandbox()
            .execute(request("function main() { return 1; }"))
            .await;
        match result {
            SandboxResult::Failure { code, error, logs, .. } => {
                assert_eq!(code, "invalid_script");
                assert!(error.contains("Good:"));
                assert!(logs.is_empty());
            }
            SandboxResult::Success { .. } => panic!("expected rejection"),
        }
    }

    #[test]
    fn tool_suggestions_attach_to_lookup_failures() {
        let sb = sandbox();
        let mut classified = classify_error("ReferenceError: foo is not defined");
        sb.suggest_tools(
            &mut classified,
            &["read_file".to_string(), "search_files".to_string()],
        );
        assert!(
            classified
                .suggestions
                .iter()
                .any(|s| s.contains("read_file, search_files"))
        );
    }

    #[tokio::test]
    #[ignore] // Requires an actual deno binary on PATH
    async fn two_row_markdown_table_round_trip() {
        // A stand-in server object is enough: no network leaves the sandbox.
        let helper = r#"
const servers = {
  files: {
    async getData(_name, _args) {
      return [
        { name: "a.txt", size: "1" },
        { name: "b.txt", size: "2" },
      ];
    },
  },
};
"#;
        let script = r#"
const rows = await servers.files.getData("search_files", { query: "txt" });
return rows.length;
"#;
        let result = sandbox()
            .execute(SandboxRequest {
                script: script.to_string(),
                helper_source: helper.to_string(),
                tool_names: Vec::new(),
                helper_meta: json!({}),
            })
            .await;
        match result {
            SandboxResult::Success { result, logs } => {
                assert_eq!(result, json!(2));
                assert!(logs.is_empty());
            }
            SandboxResult::Failure { error, .. } => panic!("script failed: {error}"),
        }
    }
}
