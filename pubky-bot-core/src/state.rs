//! In-memory flow state, keyed per (chat, user, service).
//!
//! Holds the multi-step conversation state for each service plus the
//! active-flow pointer that routes uncommanded messages. Everything here is
//! process-local: a restart is an authorized reset.

use std::collections::HashMap;
use std::sync::Mutex;

use serde_json::Value;

use crate::types::StateDirective;

/// Identifies one service's state for one user in one chat.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ServiceKey {
    pub chat_id: String,
    pub user_id: String,
    pub service_id: String,
}

impl ServiceKey {
    pub fn new(
        chat_id: impl Into<String>,
        user_id: impl Into<String>,
        service_id: impl Into<String>,
    ) -> Self {
        Self {
            chat_id: chat_id.into(),
            user_id: user_id.into(),
            service_id: service_id.into(),
        }
    }
}

/// A state value with its mutation counter.
#[derive(Debug, Clone, PartialEq)]
pub struct StateRecord {
    pub value: Value,
    pub version: u64,
}

/// Per-key service state plus the per-(chat, user) active-flow pointer.
///
/// A single mutex per map serializes mutations, which satisfies the per-key
/// ordering guarantee; lock hold times are bounded by shallow map and JSON
/// operations.
#[derive(Default)]
pub struct StateStore {
    states: Mutex<HashMap<ServiceKey, StateRecord>>,
    flows: Mutex<HashMap<(String, String), String>>,
}

impl StateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current state for a key, if any.
    pub fn get(&self, key: &ServiceKey) -> Option<StateRecord> {
        self.states.lock().unwrap().get(key).cloned()
    }

    /// Apply a directive and return the resulting record (`None` after a
    /// `clear`). Every `replace`/`merge` bumps the version by exactly one;
    /// `merge` onto an absent key behaves as `replace`.
    pub fn apply(&self, key: &ServiceKey, directive: &StateDirective) -> Option<StateRecord> {
        let mut states = self.states.lock().unwrap();
        match directive {
            StateDirective::Clear => {
                states.remove(key);
                None
            }
            StateDirective::Replace { value } => {
                let version = states.get(key).map(|r| r.version).unwrap_or(0) + 1;
                let record = StateRecord {
                    value: value.clone(),
                    version,
                };
                states.insert(key.clone(), record.clone());
                Some(record)
            }
            StateDirective::Merge { value } => {
                let (merged, version) = match states.get(key) {
                    Some(existing) => (shallow_merge(&existing.value, value), existing.version + 1),
                    None => (value.clone(), 1),
                };
                let record = StateRecord {
                    value: merged,
                    version,
                };
                states.insert(key.clone(), record.clone());
                Some(record)
            }
        }
    }

    /// Remove the state record for a key.
    pub fn clear(&self, key: &ServiceKey) {
        self.states.lock().unwrap().remove(key);
    }

    // ── Active-flow pointer ─────────────────────────────────────────────

    /// Mark `service_id` as the owner of uncommanded messages for this
    /// (chat, user). At most one flow is active per pair.
    pub fn set_active_flow(&self, chat_id: &str, user_id: &str, service_id: &str) {
        self.flows.lock().unwrap().insert(
            (chat_id.to_string(), user_id.to_string()),
            service_id.to_string(),
        );
    }

    /// The service currently owning this (chat, user), if any.
    pub fn active_flow(&self, chat_id: &str, user_id: &str) -> Option<String> {
        self.flows
            .lock()
            .unwrap()
            .get(&(chat_id.to_string(), user_id.to_string()))
            .cloned()
    }

    /// Drop the active-flow pointer for this (chat, user).
    pub fn clear_active_flow(&self, chat_id: &str, user_id: &str) {
        self.flows
            .lock()
            .unwrap()
            .remove(&(chat_id.to_string(), user_id.to_string()));
    }
}

/// Shallow top-level key override. Non-object inputs on either side mean the
/// new value wins wholesale.
fn shallow_merge(existing: &Value, incoming: &Value) -> Value {
    match (existing, incoming) {
        (Value::Object(old), Value::Object(new)) => {
            let mut merged = old.clone();
            for (k, v) in new {
                merged.insert(k.clone(), v.clone());
            }
            Value::Object(merged)
        }
        _ => incoming.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn key() -> ServiceKey {
        ServiceKey::new("c1", "u1", "svc")
    }

    #[test]
    fn replace_then_merge_then_clear() {
        let store = StateStore::new();
        let k = key();

        let r1 = store
            .apply(&k, &StateDirective::Replace { value: json!({"step": 1}) })
            .unwrap();
        assert_eq!(r1.value, json!({"step": 1}));
        assert_eq!(r1.version, 1);

        let r2 = store
            .apply(&k, &StateDirective::Merge { value: json!({"step": 2, "extra": true}) })
            .unwrap();
        assert_eq!(r2.value, json!({"step": 2, "extra": true}));
        assert_eq!(r2.version, 2);

        assert!(store.apply(&k, &StateDirective::Clear).is_none());
        assert!(store.get(&k).is_none());
    }

    #[test]
    fn versions_increase_by_one_per_mutation() {
        let store = StateStore::new();
        let k = key();
        for expected in 1..=5u64 {
            let record = store
                .apply(&k, &StateDirective::Replace { value: json!(expected) })
                .unwrap();
            assert_eq!(record.version, expected);
        }
    }

    #[test]
    fn merge_onto_absent_key_behaves_as_replace() {
        let store = StateStore::new();
        let record = store
            .apply(&key(), &StateDirective::Merge { value: json!({"a": 1}) })
            .unwrap();
        assert_eq!(record.value, json!({"a": 1}));
        assert_eq!(record.version, 1);
    }

    #[test]
    fn merge_keeps_untouched_top_level_keys() {
        let store = StateStore::new();
        let k = key();
        store.apply(&k, &StateDirective::Replace { value: json!({"a": 1, "b": {"x": 1}}) });
        let record = store
            .apply(&k, &StateDirective::Merge { value: json!({"b": {"y": 2}}) })
            .unwrap();
        // Shallow: the whole "b" object is overridden, "a" survives.
        assert_eq!(record.value, json!({"a": 1, "b": {"y": 2}}));
    }

    #[test]
    fn disjoint_keys_are_independent() {
        let store = StateStore::new();
        let k1 = ServiceKey::new("c1", "u1", "svc");
        let k2 = ServiceKey::new("c1", "u2", "svc");
        store.apply(&k1, &StateDirective::Replace { value: json!(1) });
        store.apply(&k2, &StateDirective::Replace { value: json!(2) });
        store.apply(&k1, &StateDirective::Replace { value: json!(3) });

        assert_eq!(store.get(&k1).unwrap().version, 2);
        assert_eq!(store.get(&k2).unwrap().version, 1);
    }

    #[test]
    fn active_flow_set_get_clear() {
        let store = StateStore::new();
        assert!(store.active_flow("c1", "u1").is_none());

        store.set_active_flow("c1", "u1", "svc_a");
        assert_eq!(store.active_flow("c1", "u1").as_deref(), Some("svc_a"));

        // One pointer per (chat, user): setting again overwrites.
        store.set_active_flow("c1", "u1", "svc_b");
        assert_eq!(store.active_flow("c1", "u1").as_deref(), Some("svc_b"));

        store.clear_active_flow("c1", "u1");
        assert!(store.active_flow("c1", "u1").is_none());
    }

    #[test]
    fn concurrent_mutations_keep_versions_strictly_increasing() {
        use std::sync::Arc;
        let store = Arc::new(StateStore::new());
        let k = key();
        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = Arc::clone(&store);
            let k = k.clone();
            handles.push(std::thread::spawn(move || {
                for _ in 0..50 {
                    store.apply(&k, &StateDirective::Merge { value: json!({"n": 1}) });
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(store.get(&k).unwrap().version, 8 * 50);
    }
}
