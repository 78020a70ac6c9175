//! `${name}` token substitution

use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use serde_json::Value;
use std::collections::HashMap;

use crate::types::Bindings;

static TOKEN_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\$\{([^{}]+)\}").expect("Invalid token regex"));

/// Render a binding value the way it appears inside substituted text
pub fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        other => other.to_string(),
    }
}

/// Replace every `${name}` whose name is bound. Unknown tokens stay as they are.
pub fn replace_tokens(text: &str, bindings: &Bindings) -> String {
    if !text.contains("${") {
        return text.to_string();
    }

    TOKEN_REGEX
        .replace_all(text, |caps: &Captures| match bindings.get(&caps[1]) {
            Some(value) => value_to_string(value),
            None => caps[0].to_string(),
        })
        .into_owned()
}

pub fn replace_tokens_in_list(items: &[String], bindings: &Bindings) -> Vec<String> {
    items.iter().map(|s| replace_tokens(s, bindings)).collect()
}

pub fn replace_tokens_in_map(
    items: &HashMap<String, String>,
    bindings: &Bindings,
) -> HashMap<String, String> {
    items
        .iter()
        .map(|(k, v)| (k.clone(), replace_tokens(v, bindings)))
        .collect()
}

/// Substitute inside an operation argument. Strings, arrays made only of
/// strings and objects made only of strings are rewritten; anything else is
/// returned untouched.
pub fn replace_tokens_in_value(value: &Value, bindings: &Bindings) -> Value {
    match value {
        Value::String(s) => Value::String(replace_tokens(s, bindings)),
        Value::Array(items) if items.iter().all(Value::is_string) => Value::Array(
            items
                .iter()
                .map(|v| Value::String(replace_tokens(v.as_str().unwrap_or_default(), bindings)))
                .collect(),
        ),
        Value::Object(map) if map.values().all(Value::is_string) => Value::Object(
            map.iter()
                .map(|(k, v)| {
                    (
                        k.clone(),
                        Value::String(replace_tokens(v.as_str().unwrap_or_default(), bindings)),
                    )
                })
                .collect(),
        ),
        other => other.clone(),
    }
}
