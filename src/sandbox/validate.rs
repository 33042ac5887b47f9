//! Pre-execution script validation.
//!
//! Scripts run inside a generated anonymous async entry point, so top-level
//! named procedure declarations have ambiguous hoisting there and are
//! rejected outright. Static type annotations are rejected for the same
//! reason: the runtime executes plain JavaScript.

use regex::Regex;

use crate::error::{GatewayError, GatewayResult};

/// Reject scripts the harness cannot host. Returns a corrective message with
/// a minimal good/bad example pair; never attempts to build or run anything.
pub fn validate_script(script: &str) -> GatewayResult<()> {
    // Patterns run against a masked copy so text inside string literals and
    // comments cannot trip them.
    let masked = mask_literals(script);

    let named_fn = Regex::new(r"(?m)^\s*(?:async\s+)?function\s+[A-Za-z_$][\w$]*\s*\(").unwrap();
    if named_fn.is_match(&masked) {
        return Err(GatewayError::Script(
            "Named top-level function declarations are not supported. \
             Use an arrow function assigned to a const, or inline the logic.\n\
             Bad:  function fetchAll() { ... }\n\
             Good: const fetchAll = async () => { ... };"
                .to_string(),
        ));
    }

    for pattern in TYPE_ANNOTATION_PATTERNS {
        let re = Regex::new(pattern).unwrap();
        if re.is_match(&masked) {
            return Err(GatewayError::Script(
                "Type annotations are not supported; write plain JavaScript.\n\
                 Bad:  const count: number = rows.length;\n\
                 Good: const count = rows.length;"
                    .to_string(),
            ));
        }
    }

    Ok(())
}

// Matches the annotation syntax models actually produce: primitive type
// annotations, annotated arrow parameters/returns, interface blocks and
// `as` casts. A bare object literal `{ key: value }` matches none of these.
const TYPE_ANNOTATION_PATTERNS: &[&str] = &[
    r":\s*(?:string|number|boolean|object|any|unknown|void|never)\b",
    r"\)\s*:\s*[A-Za-z_$][\w$]*(?:<[^>]*>)?\s*(?:=>|\{)",
    r"\binterface\s+[A-Za-z_$][\w$]*\s*\{",
    r"\bas\s+(?:const\b|[A-Z][\w$]*)",
    r"\(\s*[A-Za-z_$][\w$]*\s*:\s*[A-Za-z_$][\w$]*(?:\[\])?\s*[,)]",
];

/// Blank out string literals and comments, keeping newlines so line-anchored
/// patterns still line up with the source.
fn mask_literals(script: &str) -> String {
    #[derive(Clone, Copy, PartialEq)]
    enum State {
        Code,
        Single,
        Double,
        Template,
        LineComment,
        BlockComment,
    }

    let mut state = State::Code;
    let mut out = String::with_capacity(script.len());
    let mut chars = script.chars().peekable();

    while let Some(c) = chars.next() {
        match state {
            State::Code => match c {
                '\'' => {
                    state = State::Single;
                    out.push(' ');
                }
                '"' => {
                    state = State::Double;
                    out.push(' ');
                }
                '`' => {
                    state = State::Template;
                    out.push(' ');
                }
                '/' if chars.peek() == Some(&'/') => {
                    chars.next();
                    state = State::LineComment;
                    out.push_str("  ");
                }
                '/' if chars.peek() == Some(&'*') => {
                    chars.next();
                    state = State::BlockComment;
                    out.push_str("  ");
                }
                _ => out.push(c),
            },
            State::Single | State::Double | State::Template => {
                let closer = match state {
                    State::Single => '\'',
                    State::Double => '"',
                    _ => '`',
                };
                if c == '\\' {
                    out.push(' ');
                    if let Some(escaped) = chars.next() {
                        out.push(if escaped == '\n' { '\n' } else { ' ' });
                    }
                } else if c == closer {
                    state = State::Code;
                    out.push(' ');
                } else {
                    out.push(if c == '\n' { '\n' } else { ' ' });
                }
            }
            State::LineComment => {
                if c == '\n' {
                    state = State::Code;
                    out.push('\n');
                } else {
                    out.push(' ');
                }
            }
            State::BlockComment => {
                if c == '*' && chars.peek() == Some(&'/') {
                    chars.next();
                    state = State::Code;
                    out.push_str("  ");
                } else {
                    out.push(if c == '\n' { '\n' } else { ' ' });
                }
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_plain_scripts() {
        let script = r#"
            const rows = await servers["files"].getData("search_files", { query: "foo" });
            console.log("rows", rows.length);
            return rows.length;
        "#;
        assert!(validate_script(script).is_ok());
    }

    #[test]
    fn accepts_object_literals_and_arrow_functions() {
        let script = r#"
            const opts = { query: "x", limit: 5 };
            const pick = (row) => row.name;
            return (await servers.files.search_files(opts)).map(pick);
        "#;
        assert!(validate_script(script).is_ok());
    }

    #[test]
    fn rejects_named_function_with_corrective_example() {
        let err = validate_script("function run() { return 1; }\nreturn run();").unwrap_err();
        let message = err.to_string();
        assert!(message.contains("const fetchAll = async () =>"));
    }

    #[test]
    fn rejects_async_named_function() {
        assert!(validate_script("async function main() { return 2; }").is_err());
    }

    #[test]
    fn annotation_syntax_inside_strings_and_comments_is_fine() {
        let script = r#"
            const label = "time: number";
            // const n: number = 1;
            /* function legacy() { interface Row { id: string } } */
            const note = `rows as Const: ${rows.length}`;
            return label;
        "#;
        assert!(validate_script(script).is_ok());
    }

    #[test]
    fn masking_does_not_hide_real_annotations() {
        let script = r#"
            const prefix = "ok";
            const n: number = 1;
            return prefix + n;
        "#;
        assert!(validate_script(script).is_err());
    }

    #[test]
    fn rejects_type_annotations() {
        assert!(validate_script("const n: number = 1; return n;").is_err());
        assert!(validate_script("interface Row { name: string }").is_err());
        assert!(validate_script("const v = data as SearchResult;").is_err());
        assert!(validate_script("const f = (row: Row) => row.id;").is_err());
    }
}
