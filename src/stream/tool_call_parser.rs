//! Tool argument parsing — turns a completed segment payload into arguments.
//!
//! Supports two dialects (per `transport.dialect` in the config):
//!
//! 1. **json** — the payload is a JSON object:
//!    ```text
//!    {"command": "ls -la"}
//!    ```
//!
//! 2. **tagged** — the payload is an XML-like invoke block; the tool name may
//!    only be known once the opening tag has fully arrived:
//!    ```text
//!    <invoke name="bash">
//!    <parameter name="command">ls -la</parameter>
//!    </invoke>
//!    ```
//!    Parameter text is kept verbatim as a string (entities decoded, no
//!    trimming). Conversion to numbers, booleans and structures happens in
//!    the validator, where the declared field type is known.
//!
//! These functions are only ever called on a closed segment. They return a
//! human-readable reason on failure; the caller attaches segment context.

use serde_json::{Map, Value};

const INVOKE_OPEN: &str = "<invoke name=\"";
const INVOKE_CLOSE: &str = "</invoke>";
const PARAM_OPEN: &str = "<parameter name=\"";
const PARAM_CLOSE: &str = "</parameter>";

// ─── JSON Dialect ────────────────────────────────────────────────────────────

/// Parse a JSON-object argument payload.
///
/// An empty (or whitespace-only) payload means "no arguments" and yields an
/// empty mapping. Any other non-object JSON value is rejected.
pub fn parse_json_arguments(raw: &str) -> Result<Map<String, Value>, String> {
    if raw.trim().is_empty() {
        return Ok(Map::new());
    }

    let value: Value =
        serde_json::from_str(raw).map_err(|e| format!("invalid JSON arguments: {e}"))?;

    match value {
        Value::Object(map) => Ok(map),
        other => Err(format!(
            "arguments must be a JSON object, got {}",
            json_type_name(&other)
        )),
    }
}

// ─── Tagged Dialect ──────────────────────────────────────────────────────────

/// The tool name from a fully received `<invoke name="...">` opening tag.
///
/// Returns `None` while the name is still arriving (no closing quote yet), so a
/// partial name is never mistaken for a complete one.
pub fn invoke_name(raw: &str) -> Option<&str> {
    let start = raw.find(INVOKE_OPEN)? + INVOKE_OPEN.len();
    let len = raw[start..].find('"')?;
    let name = raw[start..start + len].trim();
    if name.is_empty() {
        None
    } else {
        Some(name)
    }
}

/// Parse a tagged payload into `(name, arguments)`.
///
/// The invoke wrapper is optional when the service supplied the name on
/// segment-start; a bare run of `<parameter>` elements is accepted then and
/// the returned name is `None`.
pub fn parse_tagged_call(raw: &str) -> Result<(Option<String>, Map<String, Value>), String> {
    let (name, body) = match raw.find(INVOKE_OPEN) {
        Some(open) => {
            let name_start = open + INVOKE_OPEN.len();
            let name_len = raw[name_start..]
                .find('"')
                .ok_or_else(|| "unterminated tool name in invoke tag".to_string())?;
            let name = raw[name_start..name_start + name_len].trim().to_string();
            let after_name = &raw[name_start + name_len + 1..];
            let tag_end = after_name
                .find('>')
                .ok_or_else(|| "unterminated invoke tag".to_string())?;
            let body = &after_name[tag_end + 1..];
            let close = body
                .rfind(INVOKE_CLOSE)
                .ok_or_else(|| format!("missing {INVOKE_CLOSE} for tool '{name}'"))?;
            (Some(name).filter(|n| !n.is_empty()), &body[..close])
        }
        None => (None, raw),
    };

    let mut arguments = Map::new();
    let mut rest = body;
    while let Some(open) = rest.find(PARAM_OPEN) {
        let key_start = open + PARAM_OPEN.len();
        let key_len = rest[key_start..]
            .find('"')
            .ok_or_else(|| "unterminated parameter name".to_string())?;
        let key = &rest[key_start..key_start + key_len];
        if key.is_empty() {
            return Err("parameter with empty name".into());
        }

        let after_key = &rest[key_start + key_len + 1..];
        let tag_end = after_key
            .find('>')
            .ok_or_else(|| format!("unterminated parameter tag '{key}'"))?;
        let value_and_rest = &after_key[tag_end + 1..];
        let value_len = value_and_rest
            .find(PARAM_CLOSE)
            .ok_or_else(|| format!("missing {PARAM_CLOSE} for parameter '{key}'"))?;

        let value = Value::String(unescape_xml(&value_and_rest[..value_len]));
        arguments.insert(key.to_string(), value);
        rest = &value_and_rest[value_len + PARAM_CLOSE.len()..];
    }

    if arguments.is_empty() && !rest.trim().is_empty() {
        return Err("no <parameter> elements found in tagged payload".into());
    }

    Ok((name, arguments))
}

fn unescape_xml(text: &str) -> String {
    if !text.contains('&') {
        return text.to_string();
    }
    text.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

pub(crate) fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(n) if n.is_i64() || n.is_u64() => "integer",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_json_object() {
        let args = parse_json_arguments(r#"{"command": "ls -la"}"#).unwrap();
        assert_eq!(args["command"], "ls -la");
    }

    #[test]
    fn test_json_empty_payload_is_empty_object() {
        assert!(parse_json_arguments("").unwrap().is_empty());
        assert!(parse_json_arguments("  \n").unwrap().is_empty());
    }

    #[test]
    fn test_json_unquoted_value_is_rejected() {
        let err = parse_json_arguments(r#"{"command": ls -la}"#).unwrap_err();
        assert!(err.contains("invalid JSON arguments"), "got: {err}");
    }

    #[test]
    fn test_json_non_object_is_rejected() {
        let err = parse_json_arguments(r#"["ls"]"#).unwrap_err();
        assert!(err.contains("got array"), "got: {err}");
    }

    #[test]
    fn test_json_truncated_is_rejected() {
        assert!(parse_json_arguments(r#"{"command": "ls"#).is_err());
    }

    #[test]
    fn test_invoke_name_complete() {
        assert_eq!(invoke_name(r#"<invoke name="bash">"#), Some("bash"));
        assert_eq!(invoke_name(r#"<invoke name="bash""#), Some("bash"));
    }

    #[test]
    fn test_invoke_name_partial_is_not_ready() {
        assert_eq!(invoke_name("<invoke na"), None);
        assert_eq!(invoke_name(r#"<invoke name="ba"#), None);
        assert_eq!(invoke_name(r#"<invoke name="""#), None);
    }

    #[test]
    fn test_tagged_call() {
        let raw = "<invoke name=\"bash\">\n<parameter name=\"command\">ls -la</parameter>\n<parameter name=\"timeout\">30</parameter>\n</invoke>";
        let (name, args) = parse_tagged_call(raw).unwrap();
        assert_eq!(name.as_deref(), Some("bash"));
        assert_eq!(args["command"], "ls -la");
        assert_eq!(args["timeout"], "30");
    }

    #[test]
    fn test_tagged_bare_parameters() {
        let raw = r#"<parameter name="path">/tmp</parameter>"#;
        let (name, args) = parse_tagged_call(raw).unwrap();
        assert!(name.is_none());
        assert_eq!(args["path"], "/tmp");
    }

    #[test]
    fn test_tagged_values_stay_verbatim_strings() {
        let raw = concat!(
            r#"<invoke name="t">"#,
            r#"<parameter name="flag">true</parameter>"#,
            r#"<parameter name="ratio">0.5</parameter>"#,
            r#"<parameter name="items">["a", "b"]</parameter>"#,
            r#"<parameter name="expr">a &lt; b &amp;&amp; c</parameter>"#,
            r#"</invoke>"#
        );
        let (_, args) = parse_tagged_call(raw).unwrap();
        assert_eq!(args["flag"], json!("true"));
        assert_eq!(args["ratio"], json!("0.5"));
        assert_eq!(args["items"], json!(r#"["a", "b"]"#));
        assert_eq!(args["expr"], "a < b && c");
    }

    #[test]
    fn test_tagged_whitespace_is_preserved() {
        let raw = "<invoke name=\"write_file\">\n<parameter name=\"content\">    indented line\n</parameter>\n<parameter name=\"command\">123</parameter>\n</invoke>";
        let (_, args) = parse_tagged_call(raw).unwrap();
        assert_eq!(args["content"], json!("    indented line\n"));
        assert_eq!(args["command"], json!("123"));
    }

    #[test]
    fn test_tagged_unterminated_parameter() {
        let raw = r#"<invoke name="bash"><parameter name="command">ls"#;
        let err = parse_tagged_call(raw).unwrap_err();
        assert!(err.contains("</invoke>") || err.contains("</parameter>"), "got: {err}");
    }

    #[test]
    fn test_tagged_unterminated_name() {
        let err = parse_tagged_call(r#"<invoke name="ba"#).unwrap_err();
        assert!(err.contains("unterminated tool name"), "got: {err}");
    }

    #[test]
    fn test_tagged_garbage_is_rejected() {
        assert!(parse_tagged_call("just some text").is_err());
    }

    #[test]
    fn test_json_type_name() {
        assert_eq!(json_type_name(&json!(1)), "integer");
        assert_eq!(json_type_name(&json!(1.5)), "number");
        assert_eq!(json_type_name(&json!(null)), "null");
    }
}
