//! Audit trail types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

const SENSITIVE_KEY_MARKERS: [&str; 4] = ["token", "password", "secret", "key"];

/// Audit input, as passed to `AuditLog::record`.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct AuditRecord {
    pub action: String,
    /// `idle`, `success` or `error` for ticks; `success`/`error` elsewhere.
    pub result: String,
    pub actor: String,
    pub target: Option<String>,
    pub payload: Value,
    pub error: Option<Value>,
}

impl AuditRecord {
    pub fn new(action: impl Into<String>, result: impl Into<String>, actor: impl Into<String>) -> Self {
        Self {
            action: action.into(),
            result: result.into(),
            actor: actor.into(),
            target: None,
            payload: Value::Object(Map::new()),
            error: None,
        }
    }

    pub fn target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    pub fn payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn error(mut self, error: Value) -> Self {
        self.error = Some(error);
        self
    }
}

/// Persisted audit row.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct AuditEntry {
    pub audit_id: i64,
    pub timestamp: DateTime<Utc>,
    pub actor: String,
    pub action: String,
    pub target: Option<String>,
    pub result: String,
    pub payload: Value,
    pub error: Option<Value>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct AuditFilter {
    pub action: Option<String>,
    pub result: Option<String>,
    pub target: Option<String>,
}

/// Drops object keys that look like credentials, at any depth.
pub fn sanitize_payload(value: &Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.iter()
                .filter(|(k, _)| !is_sensitive_key(k))
                .map(|(k, v)| (k.clone(), sanitize_payload(v)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(sanitize_payload).collect()),
        other => other.clone(),
    }
}

fn is_sensitive_key(key: &str) -> bool {
    let lower = key.to_ascii_lowercase();
    SENSITIVE_KEY_MARKERS.iter().any(|m| lower.contains(m))
}
