//! `json-converter`: JSON to and from YAML, XML and CSV.
//!
//! YAML goes through `serde_yaml`.  XML output is element-per-key with arrays
//! as repeated elements.  CSV follows RFC 4180 quoting; rows come from an
//! array of flat objects and columns are the union of their keys in
//! first-seen order.

use serde_json::{Map, Value};

use super::{json_input, json_type_name, text_input};
use crate::config::ResolvedConfig;
use crate::error::{ModuleError, Result};
use crate::module::ExecuteOptions;

pub(super) const OPERATIONS: &[&str] = &["to_yaml", "from_yaml", "to_xml", "to_csv", "from_csv"];

const DEFAULT_XML_ROOT: &str = "root";

pub(super) fn run(input: Value, options: &ExecuteOptions, config: &ResolvedConfig) -> Result<Value> {
    match options.operation.as_str() {
        "to_yaml" => to_yaml(json_input(input)?),
        "from_yaml" => from_yaml(&text_input(input)?),
        "to_xml" => {
            let root = options
                .param("root", config)
                .and_then(Value::as_str)
                .unwrap_or(DEFAULT_XML_ROOT);
            Ok(Value::String(to_xml(&json_input(input)?, root)))
        }
        "to_csv" => to_csv(&json_input(input)?).map(Value::String),
        _ => from_csv(&text_input(input)?),
    }
}

// ---------------------------------------------------------------------------
// YAML
// ---------------------------------------------------------------------------

fn to_yaml(doc: Value) -> Result<Value> {
    serde_yaml::to_string(&doc)
        .map(Value::String)
        .map_err(|e| ModuleError::execution(format!("failed to emit YAML: {e}")))
}

fn from_yaml(text: &str) -> Result<Value> {
    let doc: serde_yaml::Value = serde_yaml::from_str(text).map_err(|e| {
        let err = ModuleError::invalid_input(format!("input is not valid YAML: {e}"));
        match e.location() {
            Some(loc) => err
                .with_detail("line", loc.line())
                .with_detail("column", loc.column()),
            None => err,
        }
    })?;
    serde_json::to_value(doc).map_err(|e| {
        ModuleError::invalid_input(format!("YAML document has no JSON representation: {e}"))
    })
}

// ---------------------------------------------------------------------------
// XML
// ---------------------------------------------------------------------------

fn to_xml(doc: &Value, root: &str) -> String {
    let mut out = String::from("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n");
    write_element(&mut out, &xml_name(root), doc, 0);
    out
}

fn write_element(out: &mut String, name: &str, value: &Value, depth: usize) {
    let pad = "  ".repeat(depth);
    match value {
        Value::Null => {
            out.push_str(&format!("{pad}<{name}/>\n"));
        }
        Value::Array(items) if depth == 0 => {
            out.push_str(&format!("{pad}<{name}>\n"));
            for item in items {
                write_element(out, "item", item, depth + 1);
            }
            out.push_str(&format!("{pad}</{name}>\n"));
        }
        Value::Array(items) => {
            for item in items {
                write_element(out, name, item, depth);
            }
        }
        Value::Object(map) => {
            out.push_str(&format!("{pad}<{name}>\n"));
            for (key, child) in map {
                write_element(out, &xml_name(key), child, depth + 1);
            }
            out.push_str(&format!("{pad}</{name}>\n"));
        }
        scalar => {
            let text = scalar_text(scalar);
            out.push_str(&format!("{pad}<{name}>{}</{name}>\n", xml_escape(&text)));
        }
    }
}

/// Coerce a key into a valid XML element name.
fn xml_name(key: &str) -> String {
    let mut name: String = key
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || matches!(c, '_' | '-' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let starts_ok = name
        .chars()
        .next()
        .is_some_and(|c| c.is_alphabetic() || c == '_');
    if !starts_ok {
        name.insert(0, '_');
    }
    name
}

fn xml_escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            c => out.push(c),
        }
    }
    out
}

// ---------------------------------------------------------------------------
// CSV
// ---------------------------------------------------------------------------

fn to_csv(doc: &Value) -> Result<String> {
    let rows: Vec<&Map<String, Value>> = match doc {
        Value::Array(items) => items
            .iter()
            .enumerate()
            .map(|(i, item)| {
                item.as_object().ok_or_else(|| {
                    ModuleError::invalid_input(format!(
                        "row {i} is {}, expected an object",
                        json_type_name(item)
                    ))
                })
            })
            .collect::<Result<_>>()?,
        Value::Object(map) => vec![map],
        other => {
            return Err(ModuleError::invalid_input(format!(
                "CSV conversion needs an array of objects, got {}",
                json_type_name(other)
            )));
        }
    };

    let mut columns: Vec<&str> = Vec::new();
    for row in &rows {
        for key in row.keys() {
            if !columns.contains(&key.as_str()) {
                columns.push(key);
            }
        }
    }

    let mut out = String::new();
    push_record(&mut out, columns.iter().map(|c| (*c).to_owned()));
    for row in rows {
        push_record(
            &mut out,
            columns.iter().map(|c| match row.get(*c) {
                None | Some(Value::Null) => String::new(),
                Some(v @ (Value::Array(_) | Value::Object(_))) => v.to_string(),
                Some(v) => scalar_text(v),
            }),
        );
    }
    Ok(out)
}

fn push_record(out: &mut String, fields: impl Iterator<Item = String>) {
    let mut first = true;
    for field in fields {
        if !first {
            out.push(',');
        }
        first = false;
        if field.contains([',', '"', '\n', '\r']) {
            out.push('"');
            out.push_str(&field.replace('"', "\"\""));
            out.push('"');
        } else {
            out.push_str(&field);
        }
    }
    out.push('\n');
}

fn from_csv(text: &str) -> Result<Value> {
    let mut records = parse_csv(text)?.into_iter();
    let Some(header) = records.next() else {
        return Ok(Value::Array(Vec::new()));
    };

    let mut rows = Vec::new();
    for (line, record) in records.enumerate() {
        if record.len() != header.len() {
            return Err(ModuleError::invalid_input(format!(
                "record {} has {} field(s), header has {}",
                line + 1,
                record.len(),
                header.len()
            ))
            .with_detail("record", line + 1));
        }
        let row: Map<String, Value> = header
            .iter()
            .cloned()
            .zip(record.into_iter().map(Value::String))
            .collect();
        rows.push(Value::Object(row));
    }
    Ok(Value::Array(rows))
}

/// Split CSV text into records.  Blank lines are skipped.
fn parse_csv(text: &str) -> Result<Vec<Vec<String>>> {
    let mut records = Vec::new();
    let mut record: Vec<String> = Vec::new();
    let mut field = String::new();
    let mut in_quotes = false;
    let mut chars = text.chars().peekable();

    while let Some(c) = chars.next() {
        if in_quotes {
            match c {
                '"' if chars.peek() == Some(&'"') => {
                    chars.next();
                    field.push('"');
                }
                '"' => in_quotes = false,
                c => field.push(c),
            }
            continue;
        }
        match c {
            '"' if field.is_empty() => in_quotes = true,
            ',' => record.push(std::mem::take(&mut field)),
            '\r' => {}
            '\n' => {
                record.push(std::mem::take(&mut field));
                if !(record.len() == 1 && record[0].is_empty()) {
                    records.push(std::mem::take(&mut record));
                } else {
                    record.clear();
                }
            }
            c => field.push(c),
        }
    }

    if in_quotes {
        return Err(ModuleError::invalid_input("unterminated quoted field in CSV input"));
    }
    if !field.is_empty() || !record.is_empty() {
        record.push(field);
        records.push(record);
    }
    Ok(records)
}

fn scalar_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
