//! Per-request tool registry and the synthesized helper surface.
//!
//! Once the connection manager has resolved tool maps, the registry groups
//! them by server, installs the generic-reference alias table, and answers
//! the lookup operations the proxy and the generated helper code both rely
//! on. Read-only after construction.

pub mod codegen;

use std::collections::BTreeMap;

use crate::mcp::{ServerDescriptor, ToolDefinition, ToolMap, TransportKind};
use crate::resolve::{self, Resolution};
use crate::schema::{ParamInfo, describe_params};

/// One server's contribution to the helper surface.
pub struct HelperServerEntry {
    pub descriptor: ServerDescriptor,
    pub tools: ToolMap,
}

/// Compact tool listing returned by `listTools` / `searchTools`.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ToolSummary {
    pub name: String,
    pub description: String,
}

pub struct HelperRegistry {
    // BTreeMap keeps documentation and generated code deterministic.
    servers: BTreeMap<String, HelperServerEntry>,
    aliases: Vec<(String, String)>,
}

impl HelperRegistry {
    /// Build from resolved descriptors and their tool maps. Descriptors whose
    /// server never produced tools are skipped.
    pub fn build(entries: Vec<(ServerDescriptor, ToolMap)>) -> Self {
        let mut servers = BTreeMap::new();
        for (descriptor, tools) in entries {
            servers.insert(
                descriptor.key.clone(),
                HelperServerEntry { descriptor, tools },
            );
        }

        // Generic transport references point at the first matching server.
        let mut aliases = Vec::new();
        let first_of = |kind: TransportKind| -> Option<&String> {
            servers
                .values()
                .find(|entry| entry.descriptor.transport == kind)
                .map(|entry| &entry.descriptor.key)
        };
        if let Some(key) = first_of(TransportKind::StreamableHttp) {
            for alias in ["http", "streamable-http", "streamable"] {
                aliases.push((alias.to_string(), key.clone()));
            }
        }
        if let Some(key) = first_of(TransportKind::Sse) {
            for alias in ["sse", "streaming", "stream"] {
                aliases.push((alias.to_string(), key.clone()));
            }
        }

        Self { servers, aliases }
    }

    pub fn server_keys(&self) -> Vec<&str> {
        self.servers.keys().map(String::as_str).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }

    /// Look up a server by key or generic alias.
    pub fn entry(&self, server: &str) -> Option<&HelperServerEntry> {
        if let Some(entry) = self.servers.get(server) {
            return Some(entry);
        }
        self.aliases
            .iter()
            .find(|(alias, _)| alias == server)
            .and_then(|(_, key)| self.servers.get(key))
    }

    pub fn entries(&self) -> impl Iterator<Item = (&String, &HelperServerEntry)> {
        self.servers.iter()
    }

    pub fn aliases(&self) -> &[(String, String)] {
        &self.aliases
    }

    pub fn list_tools(&self, server: &str) -> Vec<ToolSummary> {
        let Some(entry) = self.entry(server) else {
            return Vec::new();
        };
        let mut summaries: Vec<ToolSummary> = entry
            .tools
            .values()
            .map(|tool| ToolSummary {
                name: tool.name.clone(),
                description: tool.description.clone(),
            })
            .collect();
        summaries.sort_by(|a, b| a.name.cmp(&b.name));
        summaries
    }

    /// Substring match over name and description.
    pub fn search_tools(&self, server: &str, query: &str) -> Vec<ToolSummary> {
        let query = query.to_lowercase();
        self.list_tools(server)
            .into_iter()
            .filter(|tool| {
                tool.name.to_lowercase().contains(&query)
                    || tool.description.to_lowercase().contains(&query)
            })
            .collect()
    }

    /// Required/optional parameter breakdown with enum and default metadata.
    pub fn tool_schema(&self, server: &str, name: &str) -> Option<Vec<ParamInfo>> {
        let entry = self.entry(server)?;
        let resolved = self.resolve_tool(server, name);
        let tool = entry.tools.get(resolved.name_or(name))?;
        Some(describe_params(&tool.schema))
    }

    /// Fuzzy name resolution scoped to one server's tools.
    pub fn resolve_tool(&self, server: &str, requested: &str) -> Resolution {
        let Some(entry) = self.entry(server) else {
            return Resolution::Unresolved;
        };
        resolve::resolve(
            requested,
            entry.tools.keys().map(String::as_str),
            &entry.descriptor.key,
        )
    }

    /// Locate the tool definition for a (possibly fuzzy) name.
    pub fn find_tool(&self, server: &str, requested: &str) -> Option<&ToolDefinition> {
        let entry = self.entry(server)?;
        let resolved = self.resolve_tool(server, requested);
        entry.tools.get(resolved.name_or(requested))
    }
}

#[cfg(test)]
pub(crate) mod test_fixtures {
    use super::*;
    use serde_json::json;

    pub fn descriptor(key: &str, transport: TransportKind) -> ServerDescriptor {
        ServerDescriptor {
            key: key.to_string(),
            transport,
            url: format!("https://{}.example.test/mcp", key),
            headers: vec![],
            timeout_secs: None,
        }
    }

    pub fn tool(name: &str, description: &str) -> ToolDefinition {
        ToolDefinition {
            name: name.to_string(),
            description: description.to_string(),
            schema: json!({
                "type": "object",
                "additionalProperties": true,
                "properties": {
                    "query": {"type": "string", "description": "search text"},
                    "limit": {"type": "integer", "default": 10}
                },
                "required": ["query"]
            }),
        }
    }

    pub fn registry() -> HelperRegistry {
        let mut fs_tools = ToolMap::new();
        for (name, desc) in [
            ("search_files", "Search files by glob"),
            ("read_file", "Read one file"),
        ] {
            fs_tools.insert(name.to_string(), tool(name, desc));
        }

        let mut feed_tools = ToolMap::new();
        feed_tools.insert(
            "latest_events".to_string(),
            tool("latest_events", "Stream of recent events"),
        );

        HelperRegistry::build(vec![
            (descriptor("files", TransportKind::StreamableHttp), fs_tools),
            (descriptor("feed", TransportKind::Sse), feed_tools),
        ])
    }
}

#[cfg(test)]
mod tests {
    use super::test_fixtures::registry;
    use super::*;

    #[test]
    fn list_and_search() {
        let registry = registry();
        let tools = registry.list_tools("files");
        assert_eq!(tools.len(), 2);
        assert_eq!(tools[0].name, "read_file");

        let hits = registry.search_tools("files", "glob");
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].name, "search_files");

        assert!(registry.list_tools("nope").is_empty());
    }

    #[test]
    fn generic_aliases_reach_first_matching_server() {
        let registry = registry();
        assert_eq!(
            registry.entry("http").unwrap().descriptor.key,
            "files",
            "streamable alias"
        );
        assert_eq!(registry.entry("streaming").unwrap().descriptor.key, "feed");
        assert!(registry.entry("gopher").is_none());
    }

    #[test]
    fn schema_breakdown_marks_required() {
        let registry = registry();
        let params = registry.tool_schema("files", "read_file").unwrap();
        let query = params.iter().find(|p| p.name == "query").unwrap();
        assert!(query.required);
        let limit = params.iter().find(|p| p.name == "limit").unwrap();
        assert!(!limit.required);
        assert_eq!(limit.default, Some(serde_json::json!(10)));
    }

    #[test]
    fn find_tool_goes_through_fuzzy_resolution() {
        let registry = registry();
        assert_eq!(
            registry.find_tool("files", "serach_files").unwrap().name,
            "search_files"
        );
        assert!(registry.find_tool("files", "no_such_thing").is_none());
    }
}
