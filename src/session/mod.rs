// src/session/mod.rs — Session lifecycle and continuity
//
// A session is a contiguous activity-bounded interval in a single tab.
// Continuity is decided from the persisted state alone; other tabs only
// hear advisory notifications on a lossy broadcast channel.

use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::core::events::UserIdentity;
use crate::infra::clock::Clock;
use crate::infra::store::StateStore;

/// Durable key holding the session identity for this tab.
pub const SESSION_STATE_KEY: &str = "perceptr_session_state";

/// Name of the advisory cross-tab channel.
pub const SESSION_CHANNEL_NAME: &str = "perceptr_session";

/// Persisted per-tab session identity.
///
/// Invariant: `start_time <= last_activity_time <= now`. Mutated only by
/// activity updates; replaced outright when continuity fails.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SessionState {
    pub session_id: String,
    pub start_time: i64,
    pub last_activity_time: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_identity: Option<UserIdentity>,
}

/// Advisory message posted to other tabs. Lossy; nothing depends on it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum SessionMessage {
    SessionStart { session_id: String, timestamp: i64 },
    Activity { session_id: String, timestamp: i64 },
}

/// Pure continuity rule: a session continues iff it is neither inactive
/// past the timeout nor older than the maximum duration. Both bounds are
/// strict, so a session exactly at the timeout does not continue.
pub fn should_continue_session(
    last_activity_time: i64,
    start_time: i64,
    now: i64,
    inactivity_timeout_ms: i64,
    max_session_duration_ms: i64,
) -> bool {
    now - last_activity_time < inactivity_timeout_ms
        && now - start_time < max_session_duration_ms
}

pub struct SessionManager {
    clock: Arc<dyn Clock>,
    store: Arc<dyn StateStore>,
    inactivity_timeout_ms: i64,
    max_session_duration_ms: i64,
    broadcast: Option<broadcast::Sender<SessionMessage>>,
    current: Mutex<Option<SessionState>>,
}

impl SessionManager {
    pub fn new(
        clock: Arc<dyn Clock>,
        store: Arc<dyn StateStore>,
        inactivity_timeout_ms: i64,
        max_session_duration_ms: i64,
        broadcast: Option<broadcast::Sender<SessionMessage>>,
    ) -> Self {
        Self {
            clock,
            store,
            inactivity_timeout_ms,
            max_session_duration_ms,
            broadcast,
            current: Mutex::new(None),
        }
    }

    /// Adopt the persisted session when it still continues, otherwise mint
    /// a fresh one, persist it, and announce it. Idempotent within a tab.
    pub fn get_or_create_session(&self) -> SessionState {
        let now = self.clock.now_ms();

        if let Some(prior) = self.read_persisted() {
            if should_continue_session(
                prior.last_activity_time,
                prior.start_time,
                now,
                self.inactivity_timeout_ms,
                self.max_session_duration_ms,
            ) {
                tracing::debug!(session_id = %prior.session_id, "Continuing session");
                self.set_current_state(prior.clone());
                return prior;
            }
        }

        let fresh = SessionState {
            session_id: Uuid::new_v4().to_string(),
            start_time: now,
            last_activity_time: now,
            user_identity: None,
        };
        tracing::info!(session_id = %fresh.session_id, "Starting new session");
        self.persist(&fresh);
        self.set_current_state(fresh.clone());
        self.post(SessionMessage::SessionStart {
            session_id: fresh.session_id.clone(),
            timestamp: now,
        });
        fresh
    }

    /// Refresh the activity clock. Silently a no-op without a current
    /// session.
    pub fn update_activity(&self) {
        let now = self.clock.now_ms();
        let updated = {
            let mut current = match self.current.lock() {
                Ok(c) => c,
                Err(_) => return,
            };
            match current.as_mut() {
                Some(state) => {
                    state.last_activity_time = now;
                    state.clone()
                }
                None => return,
            }
        };
        self.persist(&updated);
        self.post(SessionMessage::Activity {
            session_id: updated.session_id,
            timestamp: now,
        });
    }

    pub fn set_current_state(&self, state: SessionState) {
        if let Ok(mut current) = self.current.lock() {
            *current = Some(state);
        }
    }

    pub fn get_current_state(&self) -> Option<SessionState> {
        self.current.lock().ok()?.clone()
    }

    fn read_persisted(&self) -> Option<SessionState> {
        let raw = self.store.get(SESSION_STATE_KEY)?;
        match serde_json::from_str(&raw) {
            Ok(state) => Some(state),
            Err(e) => {
                tracing::warn!("Discarding unparseable session state: {}", e);
                None
            }
        }
    }

    fn persist(&self, state: &SessionState) {
        match serde_json::to_string(state) {
            Ok(json) => {
                if let Err(e) = self.store.set(SESSION_STATE_KEY, &json) {
                    tracing::warn!("Failed to persist session state: {}", e);
                }
            }
            Err(e) => tracing::warn!("Failed to serialize session state: {}", e),
        }
    }

    fn post(&self, message: SessionMessage) {
        if let Some(tx) = &self.broadcast {
            // Nobody listening is fine; the channel is advisory.
            let _ = tx.send(message);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infra::clock::ManualClock;
    use crate::infra::store::MemoryStore;

    const INACTIVITY: i64 = 30 * 60 * 1000;
    const MAX_DURATION: i64 = 24 * 60 * 60 * 1000;

    fn manager(clock: Arc<ManualClock>, store: Arc<MemoryStore>) -> SessionManager {
        SessionManager::new(clock, store, INACTIVITY, MAX_DURATION, None)
    }

    #[test]
    fn test_continue_within_bounds() {
        assert!(should_continue_session(900, 0, 1_000, INACTIVITY, MAX_DURATION));
    }

    #[test]
    fn test_exactly_at_inactivity_timeout_ends() {
        // Strict `<`: now - last_activity == timeout does not continue.
        assert!(!should_continue_session(
            0,
            0,
            INACTIVITY,
            INACTIVITY,
            MAX_DURATION
        ));
        assert!(should_continue_session(
            0,
            0,
            INACTIVITY - 1,
            INACTIVITY,
            MAX_DURATION
        ));
    }

    #[test]
    fn test_exactly_at_max_duration_ends() {
        let now = MAX_DURATION;
        assert!(!should_continue_session(now - 1, 0, now, INACTIVITY, MAX_DURATION));
    }

    #[test]
    fn test_monotone_in_last_activity() {
        // Later activity can only help continuation (fixing the rest).
        let now = 100_000;
        let mut prev = false;
        for activity in (0..=now).step_by(5_000) {
            let cont = should_continue_session(activity, 0, now, 60_000, MAX_DURATION);
            if prev {
                assert!(cont, "continuation regressed at activity={activity}");
            }
            prev = cont;
        }
        assert!(prev);
    }

    #[test]
    fn test_anti_monotone_in_start_time() {
        // An older start can only hurt continuation (fixing the rest).
        let now = MAX_DURATION + 50_000;
        let newer = should_continue_session(now - 1, 100_000, now, INACTIVITY, MAX_DURATION);
        let older = should_continue_session(now - 1, 10_000, now, INACTIVITY, MAX_DURATION);
        assert!(newer);
        assert!(!older);
    }

    #[test]
    fn test_creates_fresh_session_when_store_empty() {
        let clock = ManualClock::new(5_000);
        let store = Arc::new(MemoryStore::new());
        let mgr = manager(clock, store.clone());

        let session = mgr.get_or_create_session();
        assert_eq!(session.start_time, 5_000);
        assert_eq!(session.last_activity_time, 5_000);
        assert!(store.get(SESSION_STATE_KEY).is_some());
    }

    #[test]
    fn test_continues_recent_session() {
        let clock = ManualClock::new(5_000);
        let store = Arc::new(MemoryStore::new());
        let first = manager(clock.clone(), store.clone()).get_or_create_session();

        clock.advance(60_000); // one minute, well inside the window
        let second = manager(clock, store).get_or_create_session();
        assert_eq!(second.session_id, first.session_id);
        assert_eq!(second.start_time, first.start_time);
    }

    #[test]
    fn test_replaces_stale_session() {
        let clock = ManualClock::new(5_000);
        let store = Arc::new(MemoryStore::new());
        let first = manager(clock.clone(), store.clone()).get_or_create_session();

        clock.advance(INACTIVITY); // exactly the timeout: continuity fails
        let second = manager(clock, store).get_or_create_session();
        assert_ne!(second.session_id, first.session_id);
    }

    #[test]
    fn test_update_activity_persists_and_no_ops_without_state() {
        let clock = ManualClock::new(1_000);
        let store = Arc::new(MemoryStore::new());
        let mgr = manager(clock.clone(), store.clone());

        // No current state: silently nothing.
        mgr.update_activity();
        assert!(store.get(SESSION_STATE_KEY).is_none());

        mgr.get_or_create_session();
        clock.advance(2_500);
        mgr.update_activity();

        let persisted: SessionState =
            serde_json::from_str(&store.get(SESSION_STATE_KEY).unwrap()).unwrap();
        assert_eq!(persisted.last_activity_time, 3_500);
        assert_eq!(mgr.get_current_state().unwrap().last_activity_time, 3_500);
    }

    #[test]
    fn test_broadcasts_session_start() {
        let (tx, mut rx) = broadcast::channel(4);
        let clock = ManualClock::new(1_000);
        let store = Arc::new(MemoryStore::new());
        let mgr = SessionManager::new(clock, store, INACTIVITY, MAX_DURATION, Some(tx));

        let session = mgr.get_or_create_session();
        match rx.try_recv().unwrap() {
            SessionMessage::SessionStart {
                session_id,
                timestamp,
            } => {
                assert_eq!(session_id, session.session_id);
                assert_eq!(timestamp, 1_000);
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn test_unparseable_state_replaced() {
        let clock = ManualClock::new(1_000);
        let store = Arc::new(MemoryStore::new());
        store.set(SESSION_STATE_KEY, "not json").unwrap();

        let session = manager(clock, store).get_or_create_session();
        assert_eq!(session.start_time, 1_000);
    }
}
