//! Payload redaction for logs and lifecycle events.

use serde_json::{Map, Value};

const MAX_STRING_LEN: usize = 256;
const MAX_ARRAY_LEN: usize = 20;

/// Matched anywhere in the key once it is lowercased with `_` and `-` removed, so
/// `clientSecret`, `x-api-key` and `db_password` are all caught.
const SECRET_FRAGMENTS: &[&str] = &[
    "password",
    "passwd",
    "secret",
    "apikey",
    "privatekey",
    "mnemonic",
    "seedphrase",
    "authorization",
    "accesstoken",
    "refreshtoken",
];

fn is_secret(key: &str) -> bool {
    let normalized: String = key
        .chars()
        .filter(|c| *c != '_' && *c != '-')
        .map(|c| c.to_ascii_lowercase())
        .collect();
    normalized == "seed" || SECRET_FRAGMENTS.iter().any(|f| normalized.contains(f))
}

/// Copy of `value` with secret-shaped fields dropped and long strings/arrays truncated.
pub fn sanitize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut out = Map::with_capacity(map.len());
            for (k, v) in map {
                if !is_secret(k) {
                    out.insert(k.clone(), sanitize(v));
                }
            }
            Value::Object(out)
        }
        Value::Array(items) if items.len() > MAX_ARRAY_LEN => {
            let mut out: Vec<Value> = items.iter().take(MAX_ARRAY_LEN).map(sanitize).collect();
            out.push(Value::String(format!("... {} more", items.len() - MAX_ARRAY_LEN)));
            Value::Array(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(sanitize).collect()),
        Value::String(s) if s.chars().count() > MAX_STRING_LEN => {
            let head: String = s.chars().take(MAX_STRING_LEN).collect();
            Value::String(format!("{}...", head))
        }
        other => other.clone(),
    }
}
