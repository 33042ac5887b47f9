//! Generation of the model-facing documentation and the executable helper
//! source the sandbox loads.
//!
//! The helper is plain JavaScript: a metadata table per server, local
//! `listTools`/`searchTools`/`getToolSchema`, and a two-tier call dispatch:
//! an explicit method table (one convenience method per discovered tool)
//! falling back to the generic `invoke(name, args)`. Every remote call
//! funnels through the single `__call` function, which only ever speaks to
//! the configured proxy endpoint.

use serde_json::json;

use super::HelperRegistry;

/// Header name carrying the shared secret, on both inbound endpoints and the
/// sandbox's outbound proxy calls.
pub const SECRET_HEADER: &str = "x-toolgate-secret";

/// Compact documentation sized for inclusion in a model prompt.
pub fn generate_docs(registry: &HelperRegistry) -> String {
    let mut docs = String::from("# Available tool servers\n");

    for (key, entry) in registry.entries() {
        docs.push_str(&format!(
            "\n## servers[{}] ({})\n",
            json!(key),
            match entry.descriptor.transport {
                crate::mcp::TransportKind::Sse => "sse",
                crate::mcp::TransportKind::StreamableHttp => "streamable-http",
            }
        ));
        for tool in registry.list_tools(key) {
            let params = registry
                .tool_schema(key, &tool.name)
                .unwrap_or_default();
            let mut required: Vec<String> = params
                .iter()
                .filter(|p| p.required)
                .map(|p| format!("{}*", p.name))
                .collect();
            required.extend(
                params
                    .iter()
                    .filter(|p| !p.required)
                    .map(|p| p.name.clone()),
            );
            let summary = if tool.description.is_empty() {
                String::new()
            } else {
                format!(" - {}", tool.description.lines().next().unwrap_or_default())
            };
            docs.push_str(&format!(
                "- {}({}){}\n",
                tool.name,
                required.join(", "),
                summary
            ));
        }
    }

    docs.push_str(
        "\nUsage: `await servers[\"<server>\"].getData(\"<tool>\", { ... })` \
         returns unwrapped data; `invoke` returns the full result. \
         `listTools()`, `searchTools(q)` and `getToolSchema(name)` are local. \
         Tools not listed above can still be called via \
         `invoke(\"<tool>\", args)`.\n",
    );
    docs
}

/// Emit the executable helper module. `proxy_url`, `session` and the secret
/// are baked in; the generated code holds the only outbound call path.
pub fn generate_helper_source(
    registry: &HelperRegistry,
    proxy_url: &str,
    session: &str,
    secret: Option<&str>,
) -> String {
    let mut meta = serde_json::Map::new();
    for (key, _) in registry.entries() {
        let tools: Vec<_> = registry
            .list_tools(key)
            .into_iter()
            .map(|tool| {
                let params = registry.tool_schema(key, &tool.name).unwrap_or_default();
                json!({
                    "name": tool.name,
                    "description": tool.description,
                    "params": params,
                })
            })
            .collect();
        meta.insert(key.clone(), json!({ "tools": tools }));
    }

    let mut source = String::new();
    source.push_str(&format!(
        "const __gateway = {{ url: {}, session: {}, secret: {} }};\n",
        json!(proxy_url),
        json!(session),
        json!(secret.unwrap_or_default()),
    ));
    source.push_str(&format!(
        "const __serverMeta = {};\n",
        serde_json::to_string(&serde_json::Value::Object(meta)).unwrap_or_else(|_| "{}".into()),
    ));
    source.push_str(&format!(
        "const __secretHeader = {};\n\n",
        json!(SECRET_HEADER)
    ));

    source.push_str(HELPER_RUNTIME);

    // Alias table: generic references share the concrete server objects.
    source.push_str("\nconst servers = {};\n");
    source.push_str("for (const key of Object.keys(__serverMeta)) {\n");
    source.push_str("  servers[key] = __makeServer(key, __serverMeta[key]);\n");
    source.push_str("}\n");
    for (alias, target) in registry.aliases() {
        source.push_str(&format!(
            "servers[{}] = servers[{}];\n",
            json!(alias),
            json!(target)
        ));
    }

    source
}

/// The fixed part of the helper module. `__call` is the single outbound call
/// path; non-success responses become descriptive errors carrying the
/// server, tool, status and arguments.
const HELPER_RUNTIME: &str = r#"async function __call(server, tool, args) {
  const body = JSON.stringify({
    session: __gateway.session,
    server,
    tool,
    args: args ?? {},
  });
  let response;
  try {
    response = await fetch(__gateway.url, {
      method: "POST",
      headers: { "content-type": "application/json", [__secretHeader]: __gateway.secret },
      body,
    });
  } catch (e) {
    throw new Error(`proxy unreachable for server=${server} tool=${tool}: ${e.message}`);
  }
  if (!response.ok) {
    throw new Error(
      `tool call failed: server=${server} tool=${tool} status=${response.status} args=${JSON.stringify(args ?? {})}`
    );
  }
  const payload = await response.json();
  if (payload.error) {
    const message = typeof payload.error === "string"
      ? payload.error
      : (payload.error.message ?? JSON.stringify(payload.error));
    throw new Error(message);
  }
  return payload.result;
}

function __unwrap(data) {
  for (let depth = 0; depth < 3; depth++) {
    if (data === null || typeof data !== "object" || Array.isArray(data)) {
      return data;
    }
    const staged = ["data", "items", "results"].find((field) => field in data);
    if (staged === undefined) {
      return data;
    }
    data = data[staged];
  }
  return data;
}

function __makeServer(key, meta) {
  const api = {
    listTools() {
      return meta.tools.map((t) => ({ name: t.name, description: t.description }));
    },
    searchTools(query) {
      const q = String(query ?? "").toLowerCase();
      return api.listTools().filter(
        (t) => t.name.toLowerCase().includes(q) || t.description.toLowerCase().includes(q)
      );
    },
    getToolSchema(name) {
      const tool = meta.tools.find((t) => t.name === name);
      return tool ? { name: tool.name, params: tool.params } : null;
    },
    async invoke(name, args, _options) {
      return await __call(key, name, args);
    },
    async getData(name, args) {
      return __unwrap(await api.invoke(name, args));
    },
  };
  // Method table: one convenience method per discovered tool. Anything not
  // in the table is reached through the generic invoke entry point.
  for (const tool of meta.tools) {
    if (!(tool.name in api)) {
      api[tool.name] = (args) => api.getData(tool.name, args);
    }
  }
  return api;
}
"#;
