//! Byte-stable JSON rendering.
//!
//! Object keys are emitted in lexicographic order, separators carry no
//! whitespace, and numbers use serde_json's shortest round-trip form. Digests
//! are computed over this string, so rendering the same value twice (or
//! rendering a value that was parsed from a previous rendering) must yield
//! identical bytes.
//!
//! The output is printable ASCII only: anything outside `0x20..=0x7e` is
//! written as a `\uXXXX` escape, so a rendering is always a valid HTTP
//! header value.

use std::fmt::Write;

use serde_json::Value;

pub fn canonicalize_to_string(value: &Value) -> String {
    let mut out = String::new();
    write_value(value, &mut out);
    out
}

/// True when `raw` can travel in a header unchanged.
pub fn is_header_safe(raw: &str) -> bool {
    raw.bytes().all(|byte| (0x20..=0x7e).contains(&byte))
}

fn write_value(value: &Value, out: &mut String) {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(flag) => out.push_str(if *flag { "true" } else { "false" }),
        Value::Number(num) => out.push_str(&num.to_string()),
        Value::String(text) => write_str(text, out),
        Value::Array(items) => {
            out.push('[');
            let mut first = true;
            for item in items {
                if !std::mem::take(&mut first) {
                    out.push(',');
                }
                write_value(item, out);
            }
            out.push(']');
        }
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort_unstable();
            out.push('{');
            let mut first = true;
            for key in keys {
                if !std::mem::take(&mut first) {
                    out.push(',');
                }
                write_str(key, out);
                out.push(':');
                write_value(&map[key.as_str()], out);
            }
            out.push('}');
        }
    }
}

fn write_str(text: &str, out: &mut String) {
    out.push('"');
    for ch in text.chars() {
        match ch {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            ' '..='~' => out.push(ch),
            other => {
                let mut units = [0u16; 2];
                for unit in other.encode_utf16(&mut units) {
                    // writing into a String cannot fail
                    let _ = write!(out, "\\u{unit:04x}");
                }
            }
        }
    }
    out.push('"');
}
