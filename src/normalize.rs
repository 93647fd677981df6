//! Turns raw HTTP replies into [`ApiResult`]s.

use serde::Serialize;
use serde_json::{Map, Value};

/// Nested `payload` envelopes deeper than this are left as-is.
pub const MAX_ENVELOPE_DEPTH: usize = 8;

const MAX_RAW_ERROR_CHARS: usize = 500;

/// Uniform result of one vendor API call.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ApiResult {
    pub ok: bool,
    pub status: u16,
    /// Unwrapped body on success; an empty object otherwise.
    pub payload: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// `pagination` object from the outermost envelope, when present.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pagination: Option<Value>,
    pub debug: Map<String, Value>,
}

impl ApiResult {
    /// Result for a call that never produced an HTTP status.
    pub fn failed(message: impl Into<String>, debug: Map<String, Value>) -> Self {
        let message = message.into();
        let mut debug = debug;
        debug.insert("exception".into(), Value::String(message.clone()));
        Self {
            ok: false,
            status: 0,
            payload: Value::Object(Map::new()),
            error: Some(message),
            pagination: None,
            debug,
        }
    }

    /// Continuation token under `key`, looked up in the payload first and
    /// then in the pagination side value.
    pub fn next_token(&self, key: &str) -> Option<String> {
        let lookup = |v: &Value| {
            v.get(key)
                .and_then(Value::as_str)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
        };
        lookup(&self.payload).or_else(|| self.pagination.as_ref().and_then(lookup))
    }

    /// Array under `key` in the payload (empty if absent).
    pub fn records(&self, key: &str) -> Vec<Value> {
        self.payload
            .get(key)
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default()
    }
}

/// Build an [`ApiResult`] from a status and raw body text.
pub fn normalize(status: u16, body: &str, debug: Map<String, Value>) -> ApiResult {
    let parsed = parse_body(body);
    let ok = (200..300).contains(&status);

    if !ok {
        return ApiResult {
            ok,
            status,
            payload: Value::Object(Map::new()),
            error: Some(extract_error_message(status, &parsed)),
            pagination: None,
            debug,
        };
    }

    let pagination = parsed
        .get("pagination")
        .filter(|p| !p.is_null())
        .cloned();
    ApiResult {
        ok,
        status,
        payload: unwrap_envelope(parsed),
        error: None,
        pagination,
        debug,
    }
}

/// JSON when the body parses, otherwise the text as a JSON string.
pub fn parse_body(body: &str) -> Value {
    if body.trim().is_empty() {
        return Value::String(String::new());
    }
    serde_json::from_str(body).unwrap_or_else(|_| Value::String(body.to_string()))
}

/// Descend through `{"payload": {...}}` wrappers, at most
/// [`MAX_ENVELOPE_DEPTH`] levels.
pub fn unwrap_envelope(value: Value) -> Value {
    unwrap_at_depth(value, 0)
}

fn unwrap_at_depth(value: Value, depth: usize) -> Value {
    if depth >= MAX_ENVELOPE_DEPTH {
        return value;
    }
    match value {
        Value::Object(mut map) if map.get("payload").is_some_and(Value::is_object) => {
            let inner = map.remove("payload").unwrap_or(Value::Null);
            unwrap_at_depth(inner, depth + 1)
        }
        other => other,
    }
}

/// Human-readable message for a non-2xx reply.
pub fn extract_error_message(status: u16, body: &Value) -> String {
    match body {
        Value::Object(map) => {
            if let Some(first) = map
                .get("errors")
                .and_then(Value::as_array)
                .and_then(|errors| errors.first())
            {
                let msg = non_empty_str(first.get("message"))
                    .or_else(|| non_empty_str(first.get("details")))
                    .unwrap_or_else(|| first.to_string());
                return match non_empty_str(first.get("code")) {
                    Some(code) => format!("HTTP {}: {} - {}", status, code, msg),
                    None => format!("HTTP {}: {}", status, msg),
                };
            }
            if let Some(message) = map.get("message") {
                return format!("HTTP {}: {}", status, display_value(message));
            }
            if let Some(error) = map.get("error") {
                return format!("HTTP {}: {}", status, display_value(error));
            }
            format!("HTTP {}: {}", status, truncate(&body.to_string()))
        }
        Value::Array(_) => format!("HTTP {}: {}", status, truncate(&body.to_string())),
        Value::String(text) if !text.trim().is_empty() => {
            format!("HTTP {}: {}", status, truncate(text))
        }
        Value::Null | Value::String(_) => format!("HTTP {}: (empty response)", status),
        other => format!("HTTP {}: {}", status, truncate(&other.to_string())),
    }
}

fn non_empty_str(value: Option<&Value>) -> Option<String> {
    match value {
        Some(Value::String(s)) if !s.is_empty() => Some(s.clone()),
        Some(Value::Null) | Some(Value::String(_)) | None => None,
        Some(other) => Some(other.to_string()),
    }
}

fn display_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn truncate(text: &str) -> String {
    text.chars().take(MAX_RAW_ERROR_CHARS).collect()
}
