//! Parameter-schema sanitization.
//!
//! Tool servers ship heterogeneous, often sloppy JSON Schemas. Everything
//! downstream (argument coercion, validation, helper docs) assumes an
//! explicit type at every node, so raw schemas are normalized in place the
//! moment a server's tool list is resolved. Sanitization is idempotent.

use serde_json::{Map, Value, json};

/// Schema keywords carried through sanitization. Anything else is a meta-key
/// (`$schema`, `$defs`, vendor extensions, ...) and is stripped.
const KEPT_KEYWORDS: &[&str] = &[
    "type",
    "properties",
    "required",
    "items",
    "additionalProperties",
    "description",
    "default",
    "enum",
    "const",
    "format",
    "pattern",
    "minimum",
    "maximum",
    "exclusiveMinimum",
    "exclusiveMaximum",
    "minLength",
    "maxLength",
    "minItems",
    "maxItems",
    "uniqueItems",
    "title",
    "anyOf",
    "oneOf",
    "allOf",
    "not",
    "nullable",
];

const COMPOSITION_KEYWORDS: &[&str] = &["anyOf", "oneOf", "allOf", "not"];

/// Recursively normalize a parameter schema so that every node carries an
/// explicit type:
/// - object-shaped children without a type become `"object"` accepting
///   additional properties;
/// - list-shaped children become `"array"` with a string-typed fallback item
///   schema;
/// - composition keywords are preserved with their members sanitized;
/// - unrecognized meta-keys are stripped;
/// - remaining untyped leaves fall back to `"string"`.
pub fn sanitize_schema(schema: &mut Value) {
    let Some(node) = schema.as_object_mut() else {
        return;
    };

    node.retain(|key, _| KEPT_KEYWORDS.contains(&key.as_str()));

    if !has_type(node) {
        if node.contains_key("properties") {
            node.insert("type".to_string(), json!("object"));
        } else if node.contains_key("items") {
            node.insert("type".to_string(), json!("array"));
        } else if let Some(inferred) = infer_from_values(node) {
            node.insert("type".to_string(), json!(inferred));
        }
    }

    // Union types (`"type": ["object", "null"]`) collapse to their first
    // non-null member so children still get walked; nullability is the
    // caller's concern, not the helper docs'.
    if let Some(Value::Array(members)) = node.get("type") {
        let picked = members
            .iter()
            .filter_map(Value::as_str)
            .find(|m| *m != "null")
            .unwrap_or("string")
            .to_string();
        node.insert("type".to_string(), json!(picked));
    }

    let ty = node
        .get("type")
        .and_then(|t| t.as_str())
        .map(str::to_string);

    match ty.as_deref() {
        Some("object") => {
            if !node.contains_key("additionalProperties") {
                node.insert("additionalProperties".to_string(), json!(true));
            }
            if let Some(props) = node.get_mut("properties").and_then(|p| p.as_object_mut()) {
                for child in props.values_mut() {
                    sanitize_schema(child);
                }
            }
            if let Some(extra) = node.get_mut("additionalProperties") {
                if extra.is_object() {
                    sanitize_schema(extra);
                }
            }
        }
        Some("array") => {
            let needs_fallback = !node.get("items").map(Value::is_object).unwrap_or(false);
            if needs_fallback {
                node.insert("items".to_string(), json!({"type": "string"}));
            } else if let Some(items) = node.get_mut("items") {
                sanitize_schema(items);
            }
        }
        _ => {}
    }

    for keyword in COMPOSITION_KEYWORDS {
        if let Some(members) = node.get_mut(*keyword) {
            match members {
                Value::Array(list) => {
                    for member in list.iter_mut() {
                        sanitize_schema(member);
                    }
                }
                Value::Object(_) => sanitize_schema(members),
                _ => {}
            }
        }
    }

    // A composition-only node takes its first member's type so the
    // every-node-typed invariant holds; untyped leaves default to string.
    if !has_type(node) {
        let borrowed = composition_member_type(node).unwrap_or_else(|| "string".to_string());
        match borrowed.as_str() {
            "object" => {
                if !node.contains_key("additionalProperties") {
                    node.insert("additionalProperties".to_string(), json!(true));
                }
            }
            "array" => {
                if !node.get("items").map(Value::is_object).unwrap_or(false) {
                    node.insert("items".to_string(), json!({"type": "string"}));
                }
            }
            _ => {}
        }
        node.insert("type".to_string(), json!(borrowed));
    }
}

fn has_type(node: &Map<String, Value>) -> bool {
    match node.get("type") {
        Some(Value::String(s)) => !s.is_empty(),
        Some(Value::Array(list)) => !list.is_empty(),
        _ => false,
    }
}

/// Infer a primitive type from `enum` members or a `const` value.
fn infer_from_values(node: &Map<String, Value>) -> Option<String> {
    let sample = node
        .get("enum")
        .and_then(|e| e.as_array())
        .and_then(|list| list.first())
        .or_else(|| node.get("const"))?;

    let ty = match sample {
        Value::String(_) | Value::Null => "string",
        Value::Bool(_) => "boolean",
        Value::Number(n) if n.is_i64() || n.is_u64() => "integer",
        Value::Number(_) => "number",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    };
    Some(ty.to_string())
}

fn composition_member_type(node: &Map<String, Value>) -> Option<String> {
    for keyword in COMPOSITION_KEYWORDS {
        let first = match node.get(*keyword) {
            Some(Value::Array(list)) => list.first(),
            Some(v @ Value::Object(_)) => Some(v),
            _ => None,
        };
        if let Some(ty) = first
            .and_then(|m| m.get("type"))
            .and_then(|t| t.as_str())
        {
            return Some(ty.to_string());
        }
    }
    None
}

/// One parameter as presented by `getToolSchema` and used by argument
/// adaptation.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ParamInfo {
    pub name: String,
    #[serde(rename = "type")]
    pub ty: String,
    pub required: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(rename = "enum", skip_serializing_if = "Option::is_none")]
    pub enum_values: Option<Vec<Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
}

/// Flatten a sanitized schema's top-level properties into parameter
/// descriptions with required/enum/default metadata.
pub fn describe_params(schema: &Value) -> Vec<ParamInfo> {
    let required: Vec<&str> = schema
        .get("required")
        .and_then(|r| r.as_array())
        .map(|list| list.iter().filter_map(Value::as_str).collect())
        .unwrap_or_default();

    let Some(props) = schema.get("properties").and_then(|p| p.as_object()) else {
        return Vec::new();
    };

    props
        .iter()
        .map(|(name, prop)| ParamInfo {
            name: name.clone(),
            ty: prop
                .get("type")
                .and_then(|t| t.as_str())
                .unwrap_or("string")
                .to_string(),
            required: required.contains(&name.as_str()),
            description: prop
                .get("description")
                .and_then(|d| d.as_str())
                .map(str::to_string),
            enum_values: prop
                .get("enum")
                .and_then(|e| e.as_array())
                .map(|list| list.to_vec()),
            default: prop.get("default").cloned(),
        })
        .collect()
}

/// Coerce argument values toward the sanitized schema. Models routinely emit
/// numbers and booleans as strings; the schema says what was meant.
pub fn coerce_args(args: &mut Value, schema: &Value) {
    let Some(props) = schema.get("properties").and_then(|p| p.as_object()) else {
        return;
    };
    let Some(map) = args.as_object_mut() else {
        return;
    };

    for (key, value) in map.iter_mut() {
        let declared = props
            .get(key)
            .and_then(|p| p.get("type"))
            .and_then(|t| t.as_str());

        if let (Some(ty), Some(s)) = (declared, value.as_str()) {
            match ty {
                "number" | "integer" => {
                    if let Ok(n) = s.parse::<f64>() {
                        if ty == "integer" && n.fract() == 0.0 {
                            *value = json!(n as i64);
                        } else {
                            *value = json!(n);
                        }
                    }
                }
                "boolean" => {
                    if let Ok(b) = s.parse::<bool>() {
                        *value = json!(b);
                    }
                }
                _ => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn object_shaped_children_get_object_type() {
        let mut schema = json!({
            "properties": {
                "name": {"description": "no type here"}
            }
        });
        sanitize_schema(&mut schema);
        assert_eq!(schema["type"], "object");
        assert_eq!(schema["additionalProperties"], true);
        assert_eq!(schema["properties"]["name"]["type"], "string");
    }

    #[test]
    fn list_shaped_children_get_string_item_fallback() {
        let mut schema = json!({"items": true});
        sanitize_schema(&mut schema);
        assert_eq!(schema["type"], "array");
        assert_eq!(schema["items"]["type"], "string");

        let mut schema = json!({"type": "array"});
        sanitize_schema(&mut schema);
        assert_eq!(schema["items"]["type"], "string");
    }

    #[test]
    fn composition_members_are_sanitized_and_preserved() {
        let mut schema = json!({
            "anyOf": [
                {"properties": {"a": {}}},
                {"type": "string"}
            ]
        });
        sanitize_schema(&mut schema);
        assert_eq!(schema["anyOf"][0]["type"], "object");
        assert_eq!(schema["anyOf"][1]["type"], "string");
        // The composition node itself is typed after its first member.
        assert_eq!(schema["type"], "object");

        let once = schema.clone();
        sanitize_schema(&mut schema);
        assert_eq!(once, schema);
    }

    #[test]
    fn union_types_collapse_and_children_are_walked() {
        let mut schema = json!({
            "type": ["object", "null"],
            "properties": {
                "name": {"description": "no type here"}
            }
        });
        sanitize_schema(&mut schema);
        assert_eq!(schema["type"], "object");
        assert_eq!(schema["properties"]["name"]["type"], "string");
        assert_every_node_typed(&schema);

        let mut schema = json!({"type": ["null", "array"]});
        sanitize_schema(&mut schema);
        assert_eq!(schema["type"], "array");
        assert_eq!(schema["items"]["type"], "string");
    }

    #[test]
    fn meta_keys_are_stripped() {
        let mut schema = json!({
            "$schema": "http://json-schema.org/draft-07/schema#",
            "$id": "whatever",
            "x-vendor": 1,
            "type": "object",
            "properties": {"q": {"type": "string"}}
        });
        sanitize_schema(&mut schema);
        assert!(schema.get("$schema").is_none());
        assert!(schema.get("$id").is_none());
        assert!(schema.get("x-vendor").is_none());
        assert_eq!(schema["properties"]["q"]["type"], "string");
    }

    #[test]
    fn enum_type_is_inferred_from_first_member() {
        let mut schema = json!({"enum": ["asc", "desc"]});
        sanitize_schema(&mut schema);
        assert_eq!(schema["type"], "string");

        let mut schema = json!({"enum": [1, 2, 3]});
        sanitize_schema(&mut schema);
        assert_eq!(schema["type"], "integer");
    }

    fn assert_every_node_typed(value: &Value) {
        if let Some(node) = value.as_object() {
            assert!(
                node.get("type").is_some(),
                "untyped node survived: {}",
                value
            );
            if let Some(props) = node.get("properties").and_then(|p| p.as_object()) {
                for child in props.values() {
                    assert_every_node_typed(child);
                }
            }
            if let Some(items) = node.get("items") {
                assert_every_node_typed(items);
            }
        }
    }

    #[test]
    fn sanitization_is_idempotent_and_total() {
        let mut schema = json!({
            "properties": {
                "query": {"description": "free text"},
                "tags": {"items": {}},
                "mode": {"enum": ["fast", "slow"]},
                "nested": {
                    "properties": {
                        "deep": {"items": [1, 2]}
                    }
                }
            },
            "required": ["query"],
            "$defs": {"junk": true}
        });

        sanitize_schema(&mut schema);
        let once = schema.clone();
        sanitize_schema(&mut schema);
        assert_eq!(once, schema);
        assert_every_node_typed(&schema);
    }

    #[test]
    fn describe_params_reads_required_enum_default() {
        let mut schema = json!({
            "type": "object",
            "properties": {
                "mode": {"enum": ["a", "b"], "default": "a"},
                "limit": {"type": "integer", "description": "max rows"}
            },
            "required": ["mode"]
        });
        sanitize_schema(&mut schema);

        let mut params = describe_params(&schema);
        params.sort_by(|a, b| a.name.cmp(&b.name));

        assert_eq!(params[1].name, "mode");
        assert!(params[1].required);
        assert_eq!(params[1].enum_values.as_ref().unwrap().len(), 2);
        assert_eq!(params[1].default, Some(json!("a")));
        assert_eq!(params[0].name, "limit");
        assert!(!params[0].required);
        assert_eq!(params[0].description.as_deref(), Some("max rows"));
    }

    #[test]
    fn string_numbers_are_coerced() {
        let schema = json!({
            "type": "object",
            "properties": {
                "limit": {"type": "integer"},
                "ratio": {"type": "number"},
                "strict": {"type": "boolean"},
                "name": {"type": "string"}
            }
        });
        let mut args = json!({"limit": "5", "ratio": "0.5", "strict": "true", "name": "7"});
        coerce_args(&mut args, &schema);
        assert_eq!(args["limit"], json!(5));
        assert_eq!(args["ratio"], json!(0.5));
        assert_eq!(args["strict"], json!(true));
        assert_eq!(args["name"], json!("7"));
    }
}
