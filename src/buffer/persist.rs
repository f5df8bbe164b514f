// src/buffer/persist.rs — Durable carry-over of unsent buffers
//
// On hidden-visibility and unload the unsent buffer is written to the
// per-tab store so a reload can replay it. The store holds one entry per
// session, capped at the three most recent sessions.

use serde::{Deserialize, Serialize};

use crate::core::events::{EventRecord, UserIdentity};
use crate::infra::store::StateStore;

/// Durable key holding the persisted buffer entries for this tab.
pub const BUFFER_DATA_KEY: &str = "perceptr_buffer_data";

/// At most this many session entries survive in the store.
pub const MAX_PERSISTED_SESSIONS: usize = 3;

/// One session's unsent events, durable across unloads.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PersistedBuffer {
    pub session_id: String,
    /// Batch id assigned at persist time so a replayed upload deduplicates
    /// server-side.
    pub batch_id: String,
    pub start_time: i64,
    pub end_time: i64,
    pub last_activity_time: i64,
    pub size: usize,
    pub events: Vec<EventRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_identity: Option<UserIdentity>,
}

/// Read all persisted entries; a missing or unparseable slot is empty.
pub fn load_entries(store: &dyn StateStore) -> Vec<PersistedBuffer> {
    let Some(raw) = store.get(BUFFER_DATA_KEY) else {
        return Vec::new();
    };
    match serde_json::from_str(&raw) {
        Ok(entries) => entries,
        Err(e) => {
            tracing::warn!("Discarding unparseable persisted buffers: {}", e);
            Vec::new()
        }
    }
}

/// Write the entries back, evicting the oldest sessions past the cap.
pub fn save_entries(store: &dyn StateStore, mut entries: Vec<PersistedBuffer>) {
    if entries.len() > MAX_PERSISTED_SESSIONS {
        entries.sort_by_key(|e| e.end_time);
        let excess = entries.len() - MAX_PERSISTED_SESSIONS;
        entries.drain(0..excess);
    }
    match serde_json::to_string(&entries) {
        Ok(json) => {
            if let Err(e) = store.set(BUFFER_DATA_KEY, &json) {
                tracing::warn!("Failed to persist buffer entries: {}", e);
            }
        }
        Err(e) => tracing::warn!("Failed to serialize buffer entries: {}", e),
    }
}

/// Replace the entry for `entry.session_id`, or append one.
pub fn upsert_entry(entries: &mut Vec<PersistedBuffer>, entry: PersistedBuffer) {
    match entries.iter_mut().find(|e| e.session_id == entry.session_id) {
        Some(existing) => *existing = entry,
        None => entries.push(entry),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::events::DomEvent;
    use crate::infra::store::MemoryStore;
    use serde_json::json;

    fn entry(session_id: &str, end_time: i64) -> PersistedBuffer {
        PersistedBuffer {
            session_id: session_id.into(),
            batch_id: format!("batch-{session_id}"),
            start_time: 0,
            end_time,
            last_activity_time: end_time,
            size: 10,
            events: vec![DomEvent::new(3, end_time, json!({"source": 1})).into()],
            user_identity: None,
        }
    }

    #[test]
    fn test_load_empty_store() {
        let store = MemoryStore::new();
        assert!(load_entries(&store).is_empty());
    }

    #[test]
    fn test_save_load_roundtrip() {
        let store = MemoryStore::new();
        let entries = vec![entry("s-1", 100), entry("s-2", 200)];
        save_entries(&store, entries.clone());
        assert_eq!(load_entries(&store), entries);
    }

    #[test]
    fn test_roundtrip_preserves_identity_and_events() {
        let store = MemoryStore::new();
        let mut e = entry("s-1", 100);
        e.user_identity = Some(UserIdentity::new("u-1"));
        save_entries(&store, vec![e.clone()]);

        let loaded = load_entries(&store);
        assert_eq!(loaded[0].events, e.events);
        assert_eq!(loaded[0].session_id, "s-1");
        assert_eq!(loaded[0].start_time, 0);
        assert_eq!(loaded[0].user_identity, e.user_identity);
    }

    #[test]
    fn test_caps_at_three_most_recent_sessions() {
        let store = MemoryStore::new();
        let entries = vec![
            entry("s-1", 100),
            entry("s-2", 400),
            entry("s-3", 200),
            entry("s-4", 300),
        ];
        save_entries(&store, entries);

        let loaded = load_entries(&store);
        assert_eq!(loaded.len(), MAX_PERSISTED_SESSIONS);
        let ids: Vec<&str> = loaded.iter().map(|e| e.session_id.as_str()).collect();
        assert!(!ids.contains(&"s-1"));
    }

    #[test]
    fn test_upsert_replaces_same_session() {
        let mut entries = vec![entry("s-1", 100)];
        let mut updated = entry("s-1", 150);
        updated.size = 99;
        upsert_entry(&mut entries, updated);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].size, 99);
        assert_eq!(entries[0].end_time, 150);
    }

    #[test]
    fn test_unparseable_slot_treated_empty() {
        let store = MemoryStore::new();
        store.set(BUFFER_DATA_KEY, "garbage").unwrap();
        assert!(load_entries(&store).is_empty());
    }
}
