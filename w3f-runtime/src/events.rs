//! Protocol events exchanged over the transport bridge.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::types::{ErrorPayload, StorageMap, Web3FunctionContextData};

/// Whether a script left its storage untouched or changed it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageState {
    Last,
    Updated,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StorageReply {
    pub state: StorageState,
    pub storage: StorageMap,
}

impl StorageReply {
    /// Build a reply by comparing storage content before and after execution.
    pub fn diff(before: &StorageMap, after: StorageMap) -> Self {
        let state = if storage_hash(before) == storage_hash(&after) {
            StorageState::Last
        } else {
            StorageState::Updated
        };
        Self {
            state,
            storage: after,
        }
    }
}

/// One message on the bridge. Serialized as `{"action": ..., "data": {...}}`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", content = "data", rename_all = "lowercase")]
pub enum Event {
    /// Orchestrator to script, exactly once per invocation.
    Start { context: Web3FunctionContextData },
    /// Script to orchestrator, terminal success.
    Result { result: Value, storage: StorageReply },
    /// Script to orchestrator, terminal failure.
    Error {
        error: ErrorPayload,
        storage: StorageReply,
    },
}

impl Event {
    pub fn action(&self) -> &'static str {
        match self {
            Event::Start { .. } => "start",
            Event::Result { .. } => "result",
            Event::Error { .. } => "error",
        }
    }
}

/// SHA-256 over the storage entries sorted by key, hex encoded.
///
/// `None` values and empty strings hash differently.
pub fn storage_hash(storage: &StorageMap) -> String {
    let mut entries: Vec<(&String, &Option<String>)> = storage.iter().collect();
    entries.sort_by(|a, b| a.0.cmp(b.0));

    let mut hasher = Sha256::new();
    for (key, value) in entries {
        hasher.update((key.len() as u64).to_be_bytes());
        hasher.update(key.as_bytes());
        match value {
            Some(value) => {
                hasher.update([1u8]);
                hasher.update((value.len() as u64).to_be_bytes());
                hasher.update(value.as_bytes());
            }
            None => hasher.update([0u8]),
        }
    }
    hex::encode(hasher.finalize())
}

/// Serialized size of a storage map in KB.
pub fn storage_size_kb(storage: &StorageMap) -> f64 {
    let bytes = serde_json::to_vec(storage).map(|v| v.len()).unwrap_or(0);
    bytes as f64 / 1024.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn map(entries: &[(&str, Option<&str>)]) -> StorageMap {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.map(str::to_string)))
            .collect()
    }

    #[test]
    fn hash_ignores_insertion_order() {
        let mut a = StorageMap::new();
        a.insert("alpha".into(), Some("1".into()));
        a.insert("beta".into(), Some("2".into()));
        a.insert("gamma".into(), None);

        let mut b = StorageMap::new();
        b.insert("gamma".into(), None);
        b.insert("beta".into(), Some("2".into()));
        b.insert("alpha".into(), Some("1".into()));

        assert_eq!(storage_hash(&a), storage_hash(&b));
        assert_eq!(StorageReply::diff(&a, b).state, StorageState::Last);
    }

    #[test]
    fn hash_detects_value_changes() {
        let before = map(&[("count", Some("1"))]);
        let after = map(&[("count", Some("2"))]);
        assert_eq!(StorageReply::diff(&before, after).state, StorageState::Updated);

        let unset = map(&[("k", None)]);
        let empty = map(&[("k", Some(""))]);
        assert_ne!(storage_hash(&unset), storage_hash(&empty));

        // Concatenation boundaries must not collide.
        let split_a = map(&[("ab", Some("c"))]);
        let split_b = map(&[("a", Some("bc"))]);
        assert_ne!(storage_hash(&split_a), storage_hash(&split_b));
    }

    #[test]
    fn events_use_action_data_envelope() {
        let event = Event::Error {
            error: ErrorPayload {
                name: "Error".into(),
                message: "boom".into(),
            },
            storage: StorageReply {
                state: StorageState::Last,
                storage: StorageMap::new(),
            },
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["action"], "error");
        assert_eq!(value["data"]["error"]["message"], "boom");
        assert_eq!(value["data"]["storage"]["state"], "last");

        let parsed: Event = serde_json::from_value(json!({
            "action": "result",
            "data": {
                "result": { "canExec": false, "message": "Simple" },
                "storage": { "state": "updated", "storage": { "k": "v" } }
            }
        }))
        .unwrap();
        assert_eq!(parsed.action(), "result");
    }
}
