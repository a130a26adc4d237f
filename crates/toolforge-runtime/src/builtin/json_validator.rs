//! `json-validator`: syntax check with the position of the first error.
//!
//! An invalid document is a successful execution whose result says
//! `valid: false`; only a non-text input is rejected.

use serde_json::{Value, json};

use super::json_type_name;
use crate::config::ResolvedConfig;
use crate::error::Result;
use crate::module::ExecuteOptions;

pub(super) const OPERATIONS: &[&str] = &["validate"];

pub(super) fn run(input: Value, _options: &ExecuteOptions, _config: &ResolvedConfig) -> Result<Value> {
    let text = match input {
        Value::String(text) => text,
        // Already structured, so it parsed somewhere upstream.
        other => {
            return Ok(json!({ "valid": true, "type": json_type_name(&other) }));
        }
    };

    match serde_json::from_str::<Value>(&text) {
        Ok(doc) => Ok(json!({ "valid": true, "type": json_type_name(&doc) })),
        Err(e) => {
            let message = e.to_string();
            // serde_json appends " at line L column C"; keep only the reason.
            let reason = message
                .rsplit_once(" at line ")
                .map(|(head, _)| head.to_owned())
                .unwrap_or(message);
            Ok(json!({
                "valid": false,
                "error": {
                    "line": e.line(),
                    "column": e.column(),
                    "message": reason,
                }
            }))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn validate(input: Value) -> Value {
        run(input, &ExecuteOptions::new("validate"), &ResolvedConfig::default()).unwrap()
    }

    #[test]
    fn valid_document() {
        let out = validate(json!(r#"{"ok": [1, 2, 3]}"#));
        assert_eq!(out["valid"], true);
        assert_eq!(out["type"], "object");
        assert!(out.get("error").is_none());
    }

    #[test]
    fn reports_error_position() {
        let out = validate(json!("{\n  \"a\": 1,\n  \"b\": \n}"));
        assert_eq!(out["valid"], false);
        assert_eq!(out["error"]["line"], 4);
        assert!(out["error"]["column"].as_u64().unwrap() >= 1);
        assert!(!out["error"]["message"].as_str().unwrap().contains("at line"));
    }

    #[test]
    fn empty_input_is_invalid() {
        let out = validate(json!(""));
        assert_eq!(out["valid"], false);
    }

    #[test]
    fn structured_input_is_valid() {
        let out = validate(json!([1, 2]));
        assert_eq!(out["valid"], true);
        assert_eq!(out["type"], "array");
    }
}
