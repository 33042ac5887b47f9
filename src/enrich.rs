//! Response normalization and enrichment.
//!
//! Tool servers answer with anything from clean structured payloads to prose
//! with a JSON blob buried in a code fence. Extraction applies a strict
//! precedence: an explicit structured-data field is authoritative, then
//! fenced JSON, then a best-effort JSON scan, then a markdown table, then raw
//! text. A secondary pass detects domain identifiers and attaches
//! cross-reference hints without ever altering the extracted values.

use regex::Regex;
use serde_json::{Value, json};

use crate::config::{Confidence, IdentifierPattern, ServerHints};

/// How the data was obtained, reported back to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractFormat {
    Structured,
    FencedJson,
    ScannedJson,
    MarkdownTable,
    Text,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct Extraction {
    pub ok: bool,
    pub data: Value,
    pub format: ExtractFormat,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ExtractedError>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct ExtractedError {
    pub code: String,
    pub message: String,
}

/// Normalize a raw tool response (a serialized MCP call result).
pub fn extract(response: &Value) -> Extraction {
    // 1. Explicit structured-data field, when present and well-formed, is
    //    authoritative over any free-text content.
    if let Some(structured) = response.get("structuredContent").filter(|v| !v.is_null()) {
        return from_structured(structured);
    }

    let text = collect_text(response);

    if response
        .get("isError")
        .and_then(Value::as_bool)
        .unwrap_or(false)
    {
        return Extraction {
            ok: false,
            data: json!(text),
            format: ExtractFormat::Text,
            error: Some(ExtractedError {
                code: "tool_error".to_string(),
                message: text,
            }),
            warnings: Vec::new(),
        };
    }

    // 2. Layered fallback extraction from free text.
    if let Some(parsed) = fenced_json(&text) {
        return finish(parsed, ExtractFormat::FencedJson);
    }
    if let Some(parsed) = scan_json(&text) {
        return finish(parsed, ExtractFormat::ScannedJson);
    }
    if let Some(rows) = markdown_table(&text) {
        return finish(rows, ExtractFormat::MarkdownTable);
    }

    Extraction {
        ok: true,
        data: json!(text),
        format: ExtractFormat::Text,
        error: None,
        warnings: Vec::new(),
    }
}

fn from_structured(structured: &Value) -> Extraction {
    // A failure marker inside the structured field surfaces as a structured
    // error rather than data.
    let failed = structured
        .get("success")
        .and_then(Value::as_bool)
        .map(|s| !s)
        .unwrap_or(false);

    if failed {
        let (code, message) = match structured.get("error") {
            Some(Value::Object(err)) => (
                err.get("code")
                    .map(render_scalar)
                    .unwrap_or_else(|| "error".to_string()),
                err.get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("tool reported failure")
                    .to_string(),
            ),
            Some(Value::String(message)) => ("error".to_string(), message.clone()),
            _ => ("error".to_string(), "tool reported failure".to_string()),
        };
        return Extraction {
            ok: false,
            data: structured.clone(),
            format: ExtractFormat::Structured,
            error: Some(ExtractedError { code, message }),
            warnings: Vec::new(),
        };
    }

    finish(structured.clone(), ExtractFormat::Structured)
}

fn finish(data: Value, format: ExtractFormat) -> Extraction {
    let warnings = graphql_null_warnings(&data);
    Extraction {
        ok: true,
        data,
        format,
        error: None,
        warnings,
    }
}

fn render_scalar(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Concatenate the text items of an MCP content array.
fn collect_text(response: &Value) -> String {
    let Some(items) = response.get("content").and_then(Value::as_array) else {
        return render_scalar(response);
    };

    items
        .iter()
        .filter_map(|item| item.get("text").and_then(Value::as_str))
        .collect::<Vec<_>>()
        .join("\n")
}

fn fenced_json(text: &str) -> Option<Value> {
    let start = text.find("```json")? + "```json".len();
    let rest = &text[start..];
    let end = rest.find("```")?;
    serde_json::from_str(rest[..end].trim()).ok()
}

/// Best-effort scan for the first balanced JSON object or array in the text.
fn scan_json(text: &str) -> Option<Value> {
    let bytes = text.as_bytes();
    for (i, &b) in bytes.iter().enumerate() {
        if b != b'{' && b != b'[' {
            continue;
        }
        let (open, close) = if b == b'{' { (b'{', b'}') } else { (b'[', b']') };
        let mut depth = 0usize;
        let mut in_string = false;
        let mut escaped = false;
        for (j, &c) in bytes.iter().enumerate().skip(i) {
            if in_string {
                if escaped {
                    escaped = false;
                } else if c == b'\\' {
                    escaped = true;
                } else if c == b'"' {
                    in_string = false;
                }
                continue;
            }
            match c {
                b'"' => in_string = true,
                _ if c == open => depth += 1,
                _ if c == close => {
                    depth -= 1;
                    if depth == 0 {
                        if let Ok(parsed) = serde_json::from_str(&text[i..=j]) {
                            return Some(parsed);
                        }
                        break;
                    }
                }
                _ => {}
            }
        }
    }
    None
}

/// Parse a markdown table into an array of row objects. Requires a header,
/// a separator line, at least two data rows and a consistent column count.
fn markdown_table(text: &str) -> Option<Value> {
    let lines: Vec<&str> = text
        .lines()
        .map(str::trim)
        .filter(|l| l.starts_with('|'))
        .collect();
    if lines.len() < 4 {
        return None;
    }

    let split = |line: &str| -> Vec<String> {
        line.trim_matches('|')
            .split('|')
            .map(|cell| cell.trim().to_string())
            .collect()
    };

    let header = split(lines[0]);
    let separator = split(lines[1]);
    let is_separator = separator
        .iter()
        .all(|cell| !cell.is_empty() && cell.chars().all(|c| c == '-' || c == ':'));
    if !is_separator || separator.len() != header.len() {
        return None;
    }

    let mut rows = Vec::new();
    for line in &lines[2..] {
        let cells = split(line);
        if cells.len() != header.len() {
            return None;
        }
        let row: serde_json::Map<String, Value> = header
            .iter()
            .cloned()
            .zip(cells.into_iter().map(Value::String))
            .collect();
        rows.push(Value::Object(row));
    }
    if rows.len() < 2 {
        return None;
    }
    Some(Value::Array(rows))
}

/// A GraphQL-shaped payload with null result fields usually means the query
/// asked for a field the server spells differently. Warn, do not abort.
fn graphql_null_warnings(data: &Value) -> Vec<String> {
    let Some(inner) = data.get("data").filter(|d| d.is_object()) else {
        return Vec::new();
    };
    inner
        .as_object()
        .into_iter()
        .flatten()
        .filter(|(_, v)| v.is_null())
        .map(|(field, _)| {
            format!(
                "GraphQL field '{}' is null; the field name may not match the server's schema",
                field
            )
        })
        .collect()
}

/// A detected identifier plus which other servers accept it.
#[derive(Debug, Clone, serde::Serialize)]
pub struct CrossRefHint {
    pub identifier: String,
    pub value: String,
    pub confidence: Confidence,
    pub summary: String,
    pub servers: Vec<ServerUsage>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct ServerUsage {
    pub server: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
}

/// Secondary, purely additive pass over already-extracted data: detect
/// configured identifier patterns and name the servers declared to accept
/// each identifier type. Original field values are never touched.
pub fn cross_reference(
    data: &Value,
    patterns: &[IdentifierPattern],
    servers: &[ServerHints],
) -> Vec<CrossRefHint> {
    let serialized = data.to_string();
    let mut hints = Vec::new();

    for pattern in patterns {
        let Ok(regex) = Regex::new(&pattern.pattern) else {
            tracing::warn!("Invalid identifier pattern '{}', skipping", pattern.name);
            continue;
        };

        let mut seen = Vec::new();
        for found in regex.find_iter(&serialized) {
            let value = found.as_str().to_string();
            if seen.contains(&value) {
                continue;
            }
            seen.push(value.clone());

            let accepting: Vec<ServerUsage> = servers
                .iter()
                .filter(|s| s.accepts.iter().any(|a| a == &pattern.name))
                .map(|s| ServerUsage {
                    server: s.key.clone(),
                    hint: s.hint.clone(),
                })
                .collect();
            if accepting.is_empty() {
                continue;
            }

            let summary = format!(
                "{} '{}' is accepted by: {}",
                pattern.name,
                value,
                accepting
                    .iter()
                    .map(|s| s.server.as_str())
                    .collect::<Vec<_>>()
                    .join(", ")
            );
            hints.push(CrossRefHint {
                identifier: pattern.name.clone(),
                value,
                confidence: pattern.confidence,
                summary,
                servers: accepting,
            });
        }
    }

    hints
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn structured_field_takes_precedence_over_text() {
        let response = json!({
            "content": [{"type": "text", "text": "Order created successfully!"}],
            "structuredContent": {"success": false, "error": {"code": "E42", "message": "quota exceeded"}}
        });
        let extraction = extract(&response);
        assert!(!extraction.ok);
        let err = extraction.error.unwrap();
        assert_eq!(err.code, "E42");
        assert_eq!(err.message, "quota exceeded");
    }

    #[test]
    fn structured_success_passes_data_through() {
        let response = json!({
            "content": [],
            "structuredContent": {"orders": [1, 2, 3]}
        });
        let extraction = extract(&response);
        assert!(extraction.ok);
        assert_eq!(extraction.format, ExtractFormat::Structured);
        assert_eq!(extraction.data["orders"], json!([1, 2, 3]));
    }

    #[test]
    fn fenced_json_beats_plain_scan() {
        let response = json!({
            "content": [{"type": "text", "text": "Result:\n```json\n{\"count\": 7}\n```\nignored {\"count\": 9}"}]
        });
        let extraction = extract(&response);
        assert_eq!(extraction.format, ExtractFormat::FencedJson);
        assert_eq!(extraction.data["count"], 7);
    }

    #[test]
    fn json_is_scanned_out_of_prose() {
        let response = json!({
            "content": [{"type": "text", "text": "The server said {\"status\": \"ok\", \"note\": \"a } in a string\"} and nothing else."}]
        });
        let extraction = extract(&response);
        assert_eq!(extraction.format, ExtractFormat::ScannedJson);
        assert_eq!(extraction.data["status"], "ok");
    }

    #[test]
    fn markdown_table_becomes_rows() {
        let table = "| name | qty |\n| --- | --- |\n| bolt | 4 |\n| nut | 9 |";
        let response = json!({"content": [{"type": "text", "text": table}]});
        let extraction = extract(&response);
        assert_eq!(extraction.format, ExtractFormat::MarkdownTable);
        let rows = extraction.data.as_array().unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["name"], "bolt");
        assert_eq!(rows[1]["qty"], "9");
    }

    #[test]
    fn inconsistent_table_falls_back_to_text() {
        let table = "| a | b |\n| --- | --- |\n| 1 |\n| 2 | 3 |";
        let response = json!({"content": [{"type": "text", "text": table}]});
        let extraction = extract(&response);
        assert_eq!(extraction.format, ExtractFormat::Text);
    }

    #[test]
    fn plain_text_is_tagged_unstructured() {
        let response = json!({"content": [{"type": "text", "text": "all good"}]});
        let extraction = extract(&response);
        assert!(extraction.ok);
        assert_eq!(extraction.format, ExtractFormat::Text);
        assert_eq!(extraction.data, json!("all good"));
    }

    #[test]
    fn graphql_null_fields_warn_without_aborting() {
        let response = json!({
            "content": [],
            "structuredContent": {"data": {"userByEmail": null, "org": {"id": 1}}}
        });
        let extraction = extract(&response);
        assert!(extraction.ok);
        assert_eq!(extraction.warnings.len(), 1);
        assert!(extraction.warnings[0].contains("userByEmail"));
    }

    #[test]
    fn is_error_content_surfaces_as_structured_error() {
        let response = json!({
            "content": [{"type": "text", "text": "boom"}],
            "isError": true
        });
        let extraction = extract(&response);
        assert!(!extraction.ok);
        assert_eq!(extraction.error.unwrap().message, "boom");
    }

    fn test_patterns() -> Vec<IdentifierPattern> {
        vec![IdentifierPattern {
            name: "order_id".to_string(),
            pattern: "ORD-[0-9]{6}".to_string(),
            confidence: Confidence::High,
        }]
    }

    fn test_servers() -> Vec<ServerHints> {
        vec![
            ServerHints {
                key: "billing".to_string(),
                accepts: vec!["order_id".to_string()],
                hint: Some("pass as the `order` argument".to_string()),
            },
            ServerHints {
                key: "weather".to_string(),
                accepts: vec![],
                hint: None,
            },
        ]
    }

    #[test]
    fn cross_reference_attaches_hints_additively() {
        let data = json!({"order": "ORD-123456", "note": "see ORD-123456"});
        let before = data.clone();

        let hints = cross_reference(&data, &test_patterns(), &test_servers());
        assert_eq!(hints.len(), 1); // duplicate value deduped
        assert_eq!(hints[0].value, "ORD-123456");
        assert_eq!(hints[0].servers.len(), 1);
        assert_eq!(hints[0].servers[0].server, "billing");
        assert!(hints[0].summary.contains("billing"));

        assert_eq!(data, before);
    }

    #[test]
    fn cross_reference_without_accepting_server_is_silent() {
        let data = json!({"id": "ORD-999999"});
        let servers = vec![ServerHints {
            key: "weather".to_string(),
            accepts: vec![],
            hint: None,
        }];
        assert!(cross_reference(&data, &test_patterns(), &servers).is_empty());
    }
}
