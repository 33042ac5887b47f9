//! Classification of uncaught sandbox failures into actionable categories.

use regex::Regex;

/// User-facing classification of a runtime fault. The raw message and stack
/// are carried alongside so nothing is lost to the rewording.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ClassifiedError {
    pub code: String,
    pub message: String,
    pub suggestions: Vec<String>,
}

pub fn classify_error(raw: &str) -> ClassifiedError {
    let lower = raw.to_lowercase();

    if Regex::new(r"(?i)\b([A-Za-z_$][\w$]*) is not defined\b")
        .unwrap()
        .is_match(raw)
    {
        return ClassifiedError {
            code: "reference_not_found".into(),
            message: format!("The script references something that does not exist: {raw}"),
            suggestions: vec![
                "Check the spelling of variable and server names.".into(),
                "Access servers via servers[\"<key>\"] rather than bare identifiers.".into(),
                "Call listTools() to see what each server provides.".into(),
            ],
        };
    }

    if lower.contains("no server") || lower.contains("server not available")
        || lower.contains("unknown server")
    {
        return ClassifiedError {
            code: "server_unavailable".into(),
            message: format!("A referenced tool server is not available: {raw}"),
            suggestions: vec![
                "Verify the server key against the generated documentation.".into(),
                "The server may have failed to connect; it is then excluded from this request.".into(),
            ],
        };
    }

    if let Some(status) = http_status(&lower) {
        let (code, hint) = match status {
            400 => ("http_bad_request", "Check argument names and types against getToolSchema()."),
            404 => ("http_not_found", "The tool or resource does not exist; verify the tool name."),
            429 => ("http_rate_limited", "Slow down: the upstream server is rate limiting this client."),
            _ => ("http_server_error", "The upstream server failed; retrying later may succeed."),
        };
        return ClassifiedError {
            code: code.into(),
            message: format!("A tool call failed with HTTP {status}: {raw}"),
            suggestions: vec![hint.into()],
        };
    }

    if lower.contains("required") && (lower.contains("parameter") || lower.contains("argument") || lower.contains("property")) {
        return ClassifiedError {
            code: "missing_required_parameter".into(),
            message: format!("A required parameter was missing: {raw}"),
            suggestions: vec![
                "Call getToolSchema(name) and supply every parameter marked required.".into(),
            ],
        };
    }

    if lower.contains("timed out") || lower.contains("timeout") {
        return ClassifiedError {
            code: "timeout".into(),
            message: format!("The operation did not finish in time: {raw}"),
            suggestions: vec![
                "Narrow the request (smaller query, lower limit) and try again.".into(),
            ],
        };
    }

    if lower.contains("connection refused")
        || lower.contains("dns")
        || lower.contains("unreachable")
        || lower.contains("proxy unreachable")
        || lower.contains("failed to fetch")
    {
        return ClassifiedError {
            code: "connectivity".into(),
            message: format!("A network hop could not be reached: {raw}"),
            suggestions: vec![
                "The gateway or the tool server may be down; retry shortly.".into(),
            ],
        };
    }

    if lower.contains("is not a function")
        || lower.contains("cannot read propert")
        || (lower.contains("expected") && lower.contains("got"))
        || lower.contains("invalid type")
    {
        return ClassifiedError {
            code: "argument_type_mismatch".into(),
            message: format!("A value had the wrong shape or type: {raw}"),
            suggestions: vec![
                "Compare the arguments against getToolSchema(name).".into(),
                "Results from getData() may be objects or arrays; inspect before indexing.".into(),
            ],
        };
    }

    ClassifiedError {
        code: "script_error".into(),
        message: raw.to_string(),
        suggestions: Vec::new(),
    }
}

fn http_status(lower: &str) -> Option<u16> {
    let re = Regex::new(r"status[=: ]*(\d{3})|\bhttp (\d{3})\b").unwrap();
    let caps = re.captures(lower)?;
    let digits = caps.get(1).or_else(|| caps.get(2))?.as_str();
    let status: u16 = digits.parse().ok()?;
    match status {
        400 | 404 | 429 => Some(status),
        500..=599 => Some(status),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reference_errors_are_named() {
        let c = classify_error("ReferenceError: sevrers is not defined");
        assert_eq!(c.code, "reference_not_found");
        assert!(!c.suggestions.is_empty());
    }

    #[test]
    fn http_statuses_map_to_distinct_codes() {
        assert_eq!(classify_error("tool call failed: server=files tool=read_file status=404 args={}").code, "http_not_found");
        assert_eq!(classify_error("status=429 too many requests").code, "http_rate_limited");
        assert_eq!(classify_error("upstream replied HTTP 503").code, "http_server_error");
        assert_eq!(classify_error("status=400 bad request").code, "http_bad_request");
    }

    #[test]
    fn missing_parameter_and_timeout() {
        assert_eq!(classify_error("missing required parameter 'query'").code, "missing_required_parameter");
        assert_eq!(classify_error("'search_files' timed out after 60s").code, "timeout");
    }

    #[test]
    fn type_mismatch_and_fallthrough() {
        assert_eq!(classify_error("rows.map is not a function").code, "argument_type_mismatch");
        let other = classify_error("something exotic happened");
        assert_eq!(other.code, "script_error");
        assert_eq!(other.message, "something exotic happened");
    }
}
