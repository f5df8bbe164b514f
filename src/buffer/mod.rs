// src/buffer/mod.rs — Central batching engine
//
// Collects the mixed event stream, cuts it into size- and age-bounded
// batches with contiguous chronology, and hands them to the upload sink.
// Upload failure backs off exponentially; unload-time persistence carries
// unsent events across reloads.

pub mod persist;
pub mod split;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::broadcast;
use uuid::Uuid;

use crate::api::types::{Batch, BatchMetadata};
use crate::api::BatchSink;
use crate::core::events::{EventRecord, UserIdentity};
use crate::infra::clock::Clock;
use crate::infra::errors::{AgentError, PerceptrError};
use crate::infra::store::StateStore;
use crate::session::{SessionManager, SessionState};
use crate::util::estimated_json_size;
use persist::{load_entries, save_entries, upsert_entry, PersistedBuffer};
use split::{split_events, SEVEN_MEGABYTES};

// Internal tuning, not user-configurable.
pub const MAX_BUFFER_SIZE: usize = 1024 * 1024;
pub const FLUSH_TRIGGER_RATIO: f64 = 0.9;
pub const FLUSH_INTERVAL_MS: u64 = 60_000;
pub const MAX_BUFFER_AGE_MS: i64 = 300_000;
pub const BACKOFF_INTERVAL_MS: i64 = 5_000;
pub const MAX_BACKOFF_INTERVAL_MS: i64 = 300_000;
/// Above this the oldest 20% of the buffer is dropped — the only
/// intentional data loss path.
pub const HARD_DROP_THRESHOLD: usize = 140 * 1024 * 1024;

#[derive(Default)]
struct BufferInner {
    events: Vec<EventRecord>,
    estimated_size: usize,
    /// When the first event after the last flush arrived; drives the age
    /// trigger.
    buffer_started_at: Option<i64>,
    /// End time of the last successful flush. The next batch starts here,
    /// which is what keeps the chronology contiguous.
    last_batch_end_time: Option<i64>,
    flush_failures: u32,
    backoff_until: Option<i64>,
    session: Option<SessionState>,
    user_identity: Option<UserIdentity>,
}

pub struct EventBuffer {
    sink: Arc<dyn BatchSink>,
    clock: Arc<dyn Clock>,
    store: Arc<dyn StateStore>,
    session_manager: Arc<SessionManager>,
    inner: Mutex<BufferInner>,
    is_flushing: AtomicBool,
    persistence_enabled: bool,
    error_tx: Option<broadcast::Sender<AgentError>>,
}

/// Clears the in-progress flag on every exit path of `flush`.
struct FlushGuard<'a>(&'a AtomicBool);

impl Drop for FlushGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl EventBuffer {
    pub fn new(
        sink: Arc<dyn BatchSink>,
        clock: Arc<dyn Clock>,
        store: Arc<dyn StateStore>,
        session_manager: Arc<SessionManager>,
        error_tx: Option<broadcast::Sender<AgentError>>,
    ) -> Self {
        Self {
            sink,
            clock,
            store,
            session_manager,
            inner: Mutex::new(BufferInner::default()),
            is_flushing: AtomicBool::new(false),
            persistence_enabled: true,
            error_tx,
        }
    }

    /// Session identity is injected by the orchestrator; the session
    /// manager remains the sole writer of session state.
    pub fn set_session_state(&self, state: SessionState) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.session = Some(state);
        }
    }

    pub fn set_user_identity(&self, identity: UserIdentity) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.user_identity = Some(identity);
        }
    }

    pub fn event_count(&self) -> usize {
        self.inner.lock().map(|i| i.events.len()).unwrap_or(0)
    }

    pub fn estimated_size(&self) -> usize {
        self.inner.lock().map(|i| i.estimated_size).unwrap_or(0)
    }

    pub fn last_batch_end_time(&self) -> Option<i64> {
        self.inner.lock().ok()?.last_batch_end_time
    }

    /// Append one record to the stream. Synchronous: producers call this
    /// from their emit paths. Internal console records are dropped here so
    /// the agent's own logging cannot feed back into the capture.
    pub fn add_event(self: &Arc<Self>, event: EventRecord) {
        if let EventRecord::Dom(dom) = &event {
            if dom.is_internal_log() {
                tracing::trace!("Dropped internal log record");
                return;
            }
        }

        let interactive = event.as_dom().is_some_and(|d| d.is_interactive());
        let now = self.clock.now_ms();

        let should_flush = {
            let mut inner = match self.inner.lock() {
                Ok(i) => i,
                Err(_) => return,
            };
            inner.estimated_size += estimated_json_size(&event);
            inner.events.push(event);
            if inner.buffer_started_at.is_none() {
                inner.buffer_started_at = Some(now);
            }
            self.should_schedule_flush(&inner, now)
        };

        if interactive {
            self.session_manager.update_activity();
        }
        if should_flush {
            self.schedule_flush();
        }
    }

    fn should_schedule_flush(&self, inner: &BufferInner, now: i64) -> bool {
        let over_size =
            inner.estimated_size as f64 >= MAX_BUFFER_SIZE as f64 * FLUSH_TRIGGER_RATIO;
        let over_age = inner
            .buffer_started_at
            .is_some_and(|t| now - t > MAX_BUFFER_AGE_MS);
        if !(over_size || over_age) {
            return false;
        }
        if self.is_flushing.load(Ordering::SeqCst) {
            return false;
        }
        if let Some(deadline) = inner.backoff_until {
            if now < deadline {
                return false;
            }
        }
        true
    }

    /// Spawn a deferred flush, yielding first so the producing turn
    /// completes before upload work starts.
    pub fn schedule_flush(self: &Arc<Self>) {
        let buffer = Arc::clone(self);
        tokio::spawn(async move {
            tokio::task::yield_now().await;
            if let Err(e) = buffer.flush(false).await {
                tracing::warn!("Scheduled flush failed: {}", e);
            }
        });
    }

    /// Flush the buffered events as one batch (split when oversized).
    ///
    /// Serialized: a flush already in progress turns this call into a
    /// no-op. Non-terminal flushes also no-op before the backoff deadline;
    /// a terminal flush ignores backoff.
    pub async fn flush(&self, is_session_ended: bool) -> Result<(), PerceptrError> {
        if self.is_flushing.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let _guard = FlushGuard(&self.is_flushing);
        let now = self.clock.now_ms();

        let (events, snapshot_started_at, session, identity, batch_start) = {
            let mut inner = self
                .inner
                .lock()
                .map_err(|_| PerceptrError::Store("buffer mutex poisoned".into()))?;

            if !is_session_ended {
                if let Some(deadline) = inner.backoff_until {
                    if now < deadline {
                        return Ok(());
                    }
                }
            }

            let Some(session) = inner.session.clone() else {
                return Ok(());
            };
            if inner.events.is_empty()
                && !(is_session_ended && inner.last_batch_end_time.is_some())
            {
                // Nothing buffered, and either the flush is not terminal or
                // nothing was ever uploaded for this session.
                return Ok(());
            }

            let events = std::mem::take(&mut inner.events);
            inner.estimated_size = 0;
            let started_at = inner.buffer_started_at.take();
            let batch_start = inner.last_batch_end_time.unwrap_or(session.start_time);
            (
                events,
                started_at,
                session,
                inner.user_identity.clone(),
                batch_start,
            )
        };

        let end_time = now;
        let pieces = split_events(events, SEVEN_MEGABYTES);
        let piece_count = pieces.len();
        let mut failure: Option<PerceptrError> = None;
        let mut unsent: Vec<EventRecord> = Vec::new();

        for (i, piece) in pieces.into_iter().enumerate() {
            if failure.is_some() {
                unsent.extend(piece);
                continue;
            }
            let terminal = is_session_ended && i + 1 == piece_count;
            let batch = make_batch(
                &session,
                Uuid::new_v4().to_string(),
                batch_start,
                end_time,
                piece,
                terminal,
                identity.clone(),
            );
            if let Err(e) = self.sink.send_events(&batch).await {
                unsent.extend(batch.data);
                failure = Some(e);
            }
        }

        match failure {
            None => {
                {
                    let mut inner = self
                        .inner
                        .lock()
                        .map_err(|_| PerceptrError::Store("buffer mutex poisoned".into()))?;
                    inner.last_batch_end_time = Some(end_time);
                    inner.flush_failures = 0;
                    inner.backoff_until = None;
                }
                self.remove_persisted_entry(&session.session_id);
                Ok(())
            }
            Some(e) => {
                {
                    let mut inner = self
                        .inner
                        .lock()
                        .map_err(|_| PerceptrError::Store("buffer mutex poisoned".into()))?;
                    inner.flush_failures += 1;
                    let exponent = inner.flush_failures.saturating_sub(1).min(16);
                    let delay =
                        (BACKOFF_INTERVAL_MS << exponent).min(MAX_BACKOFF_INTERVAL_MS);
                    inner.backoff_until = Some(now + delay);
                    tracing::warn!(
                        failures = inner.flush_failures,
                        backoff_ms = delay,
                        "Flush failed, backing off"
                    );

                    // Restore unsent events ahead of anything enqueued while
                    // the upload was in flight.
                    let restored_size = estimated_json_size(&unsent);
                    let newer = std::mem::take(&mut inner.events);
                    inner.events = unsent;
                    inner.events.extend(newer);
                    inner.estimated_size += restored_size;
                    if snapshot_started_at.is_some() {
                        inner.buffer_started_at = snapshot_started_at;
                    } else if inner.buffer_started_at.is_none() {
                        inner.buffer_started_at = Some(now);
                    }

                    if inner.estimated_size > HARD_DROP_THRESHOLD {
                        let drop_count = inner.events.len() / 5;
                        inner.events.drain(0..drop_count);
                        inner.estimated_size = estimated_json_size(&inner.events);
                        tracing::warn!(
                            dropped = drop_count,
                            "Buffer over hard threshold, dropped oldest events"
                        );
                    }
                }
                self.surface(&e);
                Err(e)
            }
        }
    }

    /// Synchronously save the unsent buffer to the durable store under the
    /// current session id. Called on hidden-visibility and unload.
    pub fn persist_now(&self) {
        if !self.persistence_enabled {
            return;
        }
        let now = self.clock.now_ms();
        let entry = {
            let inner = match self.inner.lock() {
                Ok(i) => i,
                Err(_) => return,
            };
            let session = self
                .session_manager
                .get_current_state()
                .or_else(|| inner.session.clone());
            let Some(session) = session else { return };

            if inner.events.is_empty() {
                None
            } else {
                Some(PersistedBuffer {
                    session_id: session.session_id.clone(),
                    batch_id: Uuid::new_v4().to_string(),
                    start_time: inner.last_batch_end_time.unwrap_or(session.start_time),
                    end_time: now,
                    last_activity_time: session.last_activity_time,
                    size: inner.estimated_size,
                    events: inner.events.clone(),
                    user_identity: inner
                        .user_identity
                        .clone()
                        .or(session.user_identity),
                })
            }
        };

        let mut entries = load_entries(&*self.store);
        match entry {
            Some(entry) => {
                tracing::debug!(
                    session_id = %entry.session_id,
                    events = entry.events.len(),
                    "Persisting unsent buffer"
                );
                upsert_entry(&mut entries, entry);
            }
            None => {
                let session_id = self
                    .session_manager
                    .get_current_state()
                    .map(|s| s.session_id);
                if let Some(session_id) = session_id {
                    entries.retain(|e| e.session_id != session_id);
                }
            }
        }
        save_entries(&*self.store, entries);
    }

    /// Replay buffers persisted by a previous load. Entries of other
    /// sessions are by definition terminal for their owners; an entry of
    /// the current session re-enters the chronology at
    /// `last_batch_end_time` when one exists.
    pub async fn flush_persisted_buffers(&self) {
        let entries = load_entries(&*self.store);
        if entries.is_empty() {
            return;
        }

        let (current_session_id, last_end) = {
            match self.inner.lock() {
                Ok(inner) => (
                    inner.session.as_ref().map(|s| s.session_id.clone()),
                    inner.last_batch_end_time,
                ),
                Err(_) => return,
            }
        };

        let mut kept = Vec::new();
        for entry in entries {
            if entry.events.is_empty() {
                continue;
            }

            let is_current = Some(&entry.session_id) == current_session_id.as_ref();
            let start_time = if is_current {
                last_end.unwrap_or(entry.start_time)
            } else {
                entry.start_time
            };
            let is_session_ended = !is_current;

            let pieces = split_events(entry.events.clone(), SEVEN_MEGABYTES);
            let piece_count = pieces.len();
            let mut sent = true;
            for (i, piece) in pieces.into_iter().enumerate() {
                let batch_id = if i == 0 {
                    entry.batch_id.clone()
                } else {
                    Uuid::new_v4().to_string()
                };
                let batch = Batch {
                    session_id: entry.session_id.clone(),
                    batch_id,
                    is_session_ended: is_session_ended && i + 1 == piece_count,
                    start_time,
                    end_time: entry.end_time,
                    size: estimated_json_size(&piece),
                    data: piece,
                    metadata: BatchMetadata {
                        event_count: entry.events.len(),
                        compressed: false,
                        extra: serde_json::Map::new(),
                    },
                    user_identity: entry.user_identity.clone(),
                };
                if let Err(e) = self.sink.send_events(&batch).await {
                    tracing::warn!(
                        session_id = %entry.session_id,
                        "Persisted buffer replay failed: {}",
                        e
                    );
                    self.surface(&e);
                    sent = false;
                    break;
                }
            }

            if !sent {
                kept.push(entry);
            }
        }
        save_entries(&*self.store, kept);
    }

    /// Terminal teardown: flush what remains with the session-ended flag,
    /// persisting instead when the flush fails.
    pub async fn destroy(&self) -> Result<(), PerceptrError> {
        if let Err(e) = self.flush(true).await {
            self.persist_now();
            let export = PerceptrError::Export {
                message: e.to_string(),
            };
            self.surface(&export);
            return Err(export);
        }
        Ok(())
    }

    fn remove_persisted_entry(&self, session_id: &str) {
        let mut entries = load_entries(&*self.store);
        let before = entries.len();
        entries.retain(|e| e.session_id != session_id);
        if entries.len() != before {
            save_entries(&*self.store, entries);
        }
    }

    fn surface(&self, error: &PerceptrError) {
        if let Some(tx) = &self.error_tx {
            let _ = tx.send(AgentError::from(error));
        }
    }
}

fn make_batch(
    session: &SessionState,
    batch_id: String,
    start_time: i64,
    end_time: i64,
    events: Vec<EventRecord>,
    is_session_ended: bool,
    user_identity: Option<UserIdentity>,
) -> Batch {
    Batch {
        session_id: session.session_id.clone(),
        batch_id,
        is_session_ended,
        start_time,
        end_time,
        size: estimated_json_size(&events),
        metadata: BatchMetadata {
            event_count: events.len(),
            compressed: false,
            extra: serde_json::Map::new(),
        },
        data: events,
        user_identity,
    }
}
