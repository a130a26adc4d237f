//! `json-formatter`: pretty-print or minify a JSON document.

use serde::Serialize;
use serde_json::Value;
use serde_json::ser::{PrettyFormatter, Serializer};

use super::json_input;
use crate::config::ResolvedConfig;
use crate::error::{ModuleError, Result};
use crate::module::ExecuteOptions;

pub(super) const OPERATIONS: &[&str] = &["format", "minify"];

const DEFAULT_INDENT: usize = 2;
const MAX_INDENT: usize = 16;

pub(super) fn run(input: Value, options: &ExecuteOptions, config: &ResolvedConfig) -> Result<Value> {
    let doc = json_input(input)?;
    let text = match options.operation.as_str() {
        "minify" => serde_json::to_string(&doc)
            .map_err(|e| ModuleError::execution(format!("failed to serialize JSON: {e}")))?,
        _ => {
            let indent = indent_width(options, config)?;
            pretty(&doc, indent)?
        }
    };
    Ok(Value::String(text))
}

fn indent_width(options: &ExecuteOptions, config: &ResolvedConfig) -> Result<usize> {
    match options.param("indent", config) {
        None | Some(Value::Null) => Ok(DEFAULT_INDENT),
        Some(v) => v
            .as_u64()
            .map(|n| n as usize)
            .filter(|n| *n <= MAX_INDENT)
            .ok_or_else(|| {
                ModuleError::invalid_input(format!(
                    "indent must be an integer between 0 and {MAX_INDENT}, got {v}"
                ))
            }),
    }
}

fn pretty(doc: &Value, indent: usize) -> Result<String> {
    let pad = vec![b' '; indent];
    let mut buf = Vec::new();
    let mut ser = Serializer::with_formatter(&mut buf, PrettyFormatter::with_indent(&pad));
    doc.serialize(&mut ser)
        .map_err(|e| ModuleError::execution(format!("failed to serialize JSON: {e}")))?;
    String::from_utf8(buf).map_err(|e| ModuleError::execution(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use serde_json::json;

    fn run_op(input: Value, options: ExecuteOptions) -> Result<Value> {
        run(input, &options, &ResolvedConfig::default())
    }

    #[test]
    fn formats_with_default_indent() {
        let out = run_op(json!(r#"{"a":[1,2]}"#), ExecuteOptions::new("format")).unwrap();
        assert_eq!(out, json!("{\n  \"a\": [\n    1,\n    2\n  ]\n}"));
    }

    #[test]
    fn indent_param_is_honoured() {
        let out = run_op(
            json!({"k": true}),
            ExecuteOptions::new("format").with_param("indent", 4),
        )
        .unwrap();
        assert_eq!(out, json!("{\n    \"k\": true\n}"));
    }

    #[test]
    fn minify_strips_whitespace() {
        let out = run_op(json!("{ \"a\" : 1 ,\n \"b\": [ ] }"), ExecuteOptions::new("minify")).unwrap();
        assert_eq!(out, json!(r#"{"a":1,"b":[]}"#));
    }

    #[test]
    fn malformed_text_is_invalid_input() {
        let err = run_op(json!("{\"a\": }"), ExecuteOptions::new("format")).unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidInput);
        assert_eq!(err.details["line"], 1);
    }

    #[test]
    fn rejects_bad_indent() {
        let err = run_op(
            json!({}),
            ExecuteOptions::new("format").with_param("indent", "wide"),
        )
        .unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidInput);
    }
}
