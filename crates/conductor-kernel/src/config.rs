//! Versioned policy blobs and the per-lane kill switch document.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Config kind under which kill switch documents are versioned.
pub const KILL_SWITCH_KIND: &str = "kill_switch";

/// One immutable `config_versions` row.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ConfigVersion {
    pub kind: String,
    pub version: i64,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub created_by: String,
    pub blob: Value,
}

/// Stop flag of one lane.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct KillSwitchState {
    pub engaged: bool,
    #[serde(default)]
    pub reason: String,
}

/// Blob shape of the `kill_switch` config kind.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct KillSwitchDocument {
    #[serde(default)]
    pub lanes: BTreeMap<String, KillSwitchState>,
}

impl KillSwitchDocument {
    /// Lenient parse: an unreadable blob counts as "nothing engaged".
    pub fn from_blob(blob: &Value) -> Self {
        serde_json::from_value(blob.clone()).unwrap_or_default()
    }

    pub fn to_blob(&self) -> Value {
        serde_json::to_value(self).unwrap_or_else(|_| Value::Object(Default::default()))
    }

    /// Unknown lanes are enabled.
    pub fn status(&self, lane: &str) -> KillSwitchState {
        self.lanes.get(lane).cloned().unwrap_or_default()
    }

    pub fn set(&mut self, lane: &str, engaged: bool, reason: &str) {
        self.lanes.insert(
            lane.to_string(),
            KillSwitchState {
                engaged,
                reason: reason.to_string(),
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn unknown_lanes_are_enabled() {
        let doc = KillSwitchDocument::from_blob(&json!({
            "lanes": {"prod": {"engaged": true, "reason": "incident"}}
        }));
        assert!(doc.status("prod").engaged);
        assert_eq!(doc.status("prod").reason, "incident");
        assert!(!doc.status("staging").engaged);
    }

    #[test]
    fn malformed_blob_is_treated_as_empty() {
        let doc = KillSwitchDocument::from_blob(&json!({"lanes": "nope"}));
        assert!(doc.lanes.is_empty());
    }

    #[test]
    fn set_then_serialize_keeps_other_lanes() {
        let mut doc = KillSwitchDocument::default();
        doc.set("a", true, "maintenance");
        doc.set("b", false, "");
        let blob = doc.to_blob();
        assert_eq!(blob["lanes"]["a"]["engaged"], true);
        assert_eq!(blob["lanes"]["b"]["engaged"], false);
    }
}
