// src/ingest/fields.rs
//! Tolerant access to untyped upstream JSON objects.
//!
//! Every lookup takes a list of aliases and returns the first one present
//! with a usable value. Nothing here fails: absent or unusable fields come
//! back as `None` (or the documented default).

use serde_json::{Map, Value};

/// First alias holding a non-empty string. Numbers are stringified.
pub fn text(obj: &Map<String, Value>, aliases: &[&str]) -> Option<String> {
    aliases.iter().find_map(|k| match obj.get(*k) {
        Some(Value::String(s)) if !s.is_empty() => Some(s.clone()),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}

/// Like [`text`] but defaults to an empty string.
pub fn text_or_empty(obj: &Map<String, Value>, aliases: &[&str]) -> String {
    text(obj, aliases).unwrap_or_default()
}

/// First alias holding a finite number, either as JSON number or as a
/// numeric string (`"1,250.5"` is accepted).
pub fn number(obj: &Map<String, Value>, aliases: &[&str]) -> Option<f64> {
    aliases.iter().find_map(|k| obj.get(*k).and_then(as_f64))
}

/// Like [`number`] but defaults to 0.
pub fn number_or_zero(obj: &Map<String, Value>, aliases: &[&str]) -> f64 {
    number(obj, aliases).unwrap_or(0.0)
}

fn as_f64(v: &Value) -> Option<f64> {
    let x = match v {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => parse_numeric_str(s)?,
        _ => return None,
    };
    x.is_finite().then_some(x)
}

fn parse_numeric_str(s: &str) -> Option<f64> {
    let cleaned: String = s.trim().chars().filter(|c| *c != ',').collect();
    if cleaned.is_empty() {
        return None;
    }
    cleaned.parse::<f64>().ok()
}
