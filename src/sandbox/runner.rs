//! Harness construction and isolated execution of model-authored scripts.
//!
//! Each run gets a fresh work directory holding one generated file: the
//! helper module, a log-capturing console shim, the script wrapped in an
//! anonymous async entry point, and an envelope printer. The runtime is
//! launched with network access restricted to the proxy host, so the only
//! reachable destination is the gateway itself.

use std::process::Stdio;
use std::time::Duration;

use tokio::io::AsyncWriteExt as _;

use crate::error::{GatewayError, GatewayResult};

/// Line prefix the harness prints exactly once with the JSON envelope.
pub const RESULT_MARKER: &str = "__TOOLGATE_RESULT__";

/// Decoded harness envelope.
#[derive(Debug, serde::Deserialize)]
pub struct RunEnvelope {
    pub ok: bool,
    #[serde(default)]
    pub result: serde_json::Value,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub stack: Option<String>,
    #[serde(default)]
    pub logs: Vec<String>,
}

/// Wrap a validated script body into the executable harness.
pub fn build_harness(script: &str, helper_source: &str) -> String {
    let mut harness = String::new();
    harness.push_str(helper_source);
    harness.push_str(CONSOLE_SHIM);
    harness.push_str("const __main = async () => {\n");
    harness.push_str(script);
    harness.push_str("\n};\n");
    harness.push_str(&format!(
        r#"const __emit = (payload) => __print("{marker}" + payload);
(async () => {{
  try {{
    const result = await __main();
    __emit(JSON.stringify({{ ok: true, result: result === undefined ? null : result, logs: __logs }}));
  }} catch (e) {{
    __emit(JSON.stringify({{
      ok: false,
      error: String((e && e.message) || e),
      stack: String((e && e.stack) || "").split("\n").slice(0, 8).join("\n"),
      logs: __logs,
    }}));
  }}
}})();
"#,
        marker = RESULT_MARKER,
    ));
    harness
}

const CONSOLE_SHIM: &str = r#"
const __logs = [];
const __print = console.log.bind(console);
const __join = (args) => args.map((a) => (typeof a === "string" ? a : JSON.stringify(a))).join(" ");
console.log = (...args) => { __logs.push(__join(args)); };
console.error = (...args) => { __logs.push(__join(args)); };
console.warn = (...args) => { __logs.push(__join(args)); };
"#;

/// Spawns the configured runtime binary on a generated harness file.
pub struct SandboxRunner {
    runtime: String,
    extra_flags: Vec<String>,
    run_timeout: Duration,
    allow_host: String,
}

impl SandboxRunner {
    /// `proxy_url` decides the only host the runtime may reach.
    pub fn new(
        runtime: &str,
        extra_flags: &[String],
        run_timeout: Duration,
        proxy_url: &str,
    ) -> GatewayResult<Self> {
        let url = reqwest::Url::parse(proxy_url)
            .map_err(|e| GatewayError::Internal(format!("invalid proxy url '{proxy_url}': {e}")))?;
        let host = url
            .host_str()
            .ok_or_else(|| GatewayError::Internal(format!("proxy url '{proxy_url}' has no host")))?;
        let allow_host = match url.port_or_known_default() {
            Some(port) => format!("{host}:{port}"),
            None => host.to_string(),
        };
        Ok(Self {
            runtime: runtime.to_string(),
            extra_flags: extra_flags.to_vec(),
            run_timeout,
            allow_host,
        })
    }

    pub fn run_timeout(&self) -> Duration {
        self.run_timeout
    }

    /// Execute a harness and decode its envelope. `Err` here means the run
    /// infrastructure itself failed (missing binary, no envelope); script
    /// faults come back as an `ok: false` envelope.
    pub async fn run(&self, harness: &str) -> GatewayResult<RunEnvelope> {
        let workdir = tempfile::tempdir()
            .map_err(|e| GatewayError::Sandbox(format!("failed to create work directory: {e}")))?;
        let entry = workdir.path().join("main.js");
        tokio::fs::write(&entry, harness)
            .await
            .map_err(|e| GatewayError::Sandbox(format!("failed to write harness: {e}")))?;

        let mut cmd = tokio::process::Command::new(&self.runtime);
        cmd.arg("run")
            .arg("--quiet")
            .arg("--no-prompt")
            .arg(format!("--allow-net={}", self.allow_host));
        for flag in &self.extra_flags {
            cmd.arg(flag);
        }
        cmd.arg(&entry)
            .current_dir(workdir.path())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .map_err(|e| GatewayError::Sandbox(format!("failed to spawn '{}': {e}", self.runtime)))?;
        if let Some(mut stdin) = child.stdin.take() {
            // Nothing is fed to the script; close the pipe so reads fail fast.
            let _ = stdin.shutdown().await;
        }

        let output = match tokio::time::timeout(self.run_timeout, child.wait_with_output()).await {
            Ok(result) => {
                result.map_err(|e| GatewayError::Sandbox(format!("runtime wait failed: {e}")))?
            }
            Err(_) => {
                return Err(GatewayError::Timeout(format!(
                    "script execution exceeded {}s",
                    self.run_timeout.as_secs()
                )));
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout);
        if let Some(envelope) = decode_envelope(&stdout) {
            return Ok(envelope);
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        let detail = if stderr.trim().is_empty() {
            format!("runtime exited with {} and no result envelope", output.status)
        } else {
            truncate(stderr.trim(), 1200)
        };
        Err(GatewayError::Sandbox(detail))
    }
}

fn decode_envelope(stdout: &str) -> Option<RunEnvelope> {
    // Last marker line wins; anything a script prints directly to stdout
    // before it is ignored.
    let line = stdout
        .lines()
        .rev()
        .find_map(|l| l.trim().strip_prefix(RESULT_MARKER))?;
    serde_json::from_str(line).ok()
}

pub(crate) fn truncate(text: &str, max: usize) -> String {
    if text.len() <= max {
        return text.to_string();
    }
    let mut cut = max;
    while !text.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}…", &text[..cut])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn harness_wraps_script_in_anonymous_entry_point() {
        let harness = build_harness("return 41 + 1;", "const servers = {};\n");
        assert!(harness.contains("const __main = async () => {"));
        assert!(harness.contains("return 41 + 1;"));
        assert!(harness.contains(RESULT_MARKER));
        assert!(!harness.contains("function __main"));
    }

    #[test]
    fn envelope_decoding_takes_last_marker_line() {
        let stdout = format!(
            "noise\n{}{}\n{}{}\n",
            RESULT_MARKER,
            r#"{"ok":true,"result":1,"logs":[]}"#,
            RESULT_MARKER,
            r#"{"ok":true,"result":2,"logs":["a"]}"#,
        );
        let envelope = decode_envelope(&stdout).unwrap();
        assert!(envelope.ok);
        assert_eq!(envelope.result, serde_json::json!(2));
        assert_eq!(envelope.logs, vec!["a".to_string()]);
    }

    #[test]
    fn allow_host_includes_port() {
        let runner = SandboxRunner::new(
            "deno",
            &[],
            Duration::from_secs(5),
            "http://127.0.0.1:8787/proxy",
        )
        .unwrap();
        assert_eq!(runner.allow_host, "127.0.0.1:8787");
    }

    #[test]
    fn truncation_is_utf8_safe() {
        let text = "ééééé";
        let cut = truncate(text, 3);
        assert!(cut.starts_with('é'));
    }

    #[tokio::test]
    #[ignore] // Requires an actual deno binary on PATH
    async fn runs_a_trivial_script() {
        let runner = SandboxRunner::new(
            "deno",
            &[],
            Duration::from_secs(30),
            "http://127.0.0.1:8787/proxy",
        )
        .unwrap();
        let harness = build_harness("console.log(\"hi\"); return 1 + 1;", "");
        let envelope = runner.run(&harness).await.unwrap();
        assert!(envelope.ok);
        assert_eq!(envelope.result, serde_json::json!(2));
        assert_eq!(envelope.logs, vec!["hi".to_string()]);
    }
}
