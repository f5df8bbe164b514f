// src/recorder/mod.rs — Wrapper around the DOM-recording primitive
//
// Gates the raw emit stream: mutation floods are rate-limited per node,
// blocklisted URLs pause recording, idleness pauses recording until the
// next interaction, and everything surviving lands in a bounded ring and
// the subscriber callback.

pub mod primitive;
pub mod rate_limit;

use regex::Regex;
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use crate::core::events::{DomEvent, SOURCE_MUTATION, CONSOLE_PLUGIN_NAME, EVENT_TYPE_INCREMENTAL_SNAPSHOT};
use crate::infra::clock::Clock;
use crate::infra::config::RecorderConfig;
use crate::infra::errors::PerceptrError;
use primitive::{RecordOptions, RecorderHandle, RecordingPrimitive};
use rate_limit::{mutation_node_ids, MutationRateLimiter};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecorderState {
    Idle,
    Recording,
    Paused,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PauseReason {
    /// No interactive event within the idle timeout.
    Idle,
    /// The page URL matches the blocklist.
    UrlBlocked,
    /// Explicit `pause()` from the orchestrator.
    Manual,
}

type Subscriber = Box<dyn Fn(DomEvent) + Send + Sync>;

struct RecorderInner {
    state: RecorderState,
    pause_reason: Option<PauseReason>,
    last_interactive_at: i64,
    last_href: Option<String>,
    events: VecDeque<DomEvent>,
    limiter: MutationRateLimiter,
}

struct RecorderShared {
    clock: Arc<dyn Clock>,
    idle_timeout_ms: i64,
    max_events: usize,
    blocklist: Vec<Regex>,
    inner: Mutex<RecorderInner>,
    subscriber: Mutex<Option<Subscriber>>,
    handle: Mutex<Option<Box<dyn RecorderHandle>>>,
}

pub struct DomRecorder {
    primitive: Arc<dyn RecordingPrimitive>,
    shared: Arc<RecorderShared>,
}

impl DomRecorder {
    pub fn new(
        primitive: Arc<dyn RecordingPrimitive>,
        clock: Arc<dyn Clock>,
        config: &RecorderConfig,
    ) -> Self {
        let blocklist = config
            .url_blocklist
            .iter()
            .filter_map(|entry| match Regex::new(&entry.url) {
                Ok(re) => Some(re),
                Err(e) => {
                    tracing::warn!("Ignoring invalid blocklist pattern '{}': {}", entry.url, e);
                    None
                }
            })
            .collect();

        Self {
            primitive,
            shared: Arc::new(RecorderShared {
                clock,
                idle_timeout_ms: config.idle_timeout_ms,
                max_events: config.max_events,
                blocklist,
                inner: Mutex::new(RecorderInner {
                    state: RecorderState::Idle,
                    pause_reason: None,
                    last_interactive_at: 0,
                    last_href: None,
                    events: VecDeque::new(),
                    limiter: MutationRateLimiter::new(
                        config.mutation_bucket_capacity,
                        config.mutation_refill_per_sec,
                    ),
                }),
                subscriber: Mutex::new(None),
                handle: Mutex::new(None),
            }),
        }
    }

    pub fn subscribe(&self, callback: impl Fn(DomEvent) + Send + Sync + 'static) {
        if let Ok(mut subscriber) = self.shared.subscriber.lock() {
            *subscriber = Some(Box::new(callback));
        }
    }

    /// Start recording through the primitive. No-op when already active.
    pub fn start_session(&self) -> Result<(), PerceptrError> {
        {
            let mut inner = lock_inner(&self.shared)?;
            if inner.state == RecorderState::Recording || inner.state == RecorderState::Paused {
                return Ok(());
            }
            inner.state = RecorderState::Recording;
            inner.pause_reason = None;
            inner.last_interactive_at = self.shared.clock.now_ms();
            inner.last_href = self.primitive.current_href();
        }

        let shared = Arc::clone(&self.shared);
        let handle = self.primitive.record(RecordOptions {
            emit: Box::new(move |event| handle_emit(&shared, event)),
            plugins: vec![CONSOLE_PLUGIN_NAME.to_string()],
            sampling: None,
        });

        match handle {
            Ok(handle) => {
                if let Ok(mut slot) = self.shared.handle.lock() {
                    *slot = Some(handle);
                }
                tracing::info!("DOM recording started");
                Ok(())
            }
            Err(e) => {
                if let Ok(mut inner) = self.shared.inner.lock() {
                    inner.state = RecorderState::Idle;
                }
                Err(PerceptrError::Recording {
                    component: "dom_recorder".into(),
                    message: e.to_string(),
                })
            }
        }
    }

    /// Stop and clear everything: events, rate-limit state, interception.
    pub fn stop_session(&self) {
        if let Ok(mut inner) = self.shared.inner.lock() {
            inner.state = RecorderState::Stopped;
            inner.pause_reason = None;
            inner.events.clear();
        }
        let handle = self.shared.handle.lock().ok().and_then(|mut h| h.take());
        if let Some(handle) = handle {
            handle.stop();
        }
        tracing::info!("DOM recording stopped");
    }

    /// Explicit pause from the orchestrator; only `resume()` reverses it.
    pub fn pause(&self) {
        if let Ok(mut inner) = self.shared.inner.lock() {
            if inner.state == RecorderState::Recording {
                inner.state = RecorderState::Paused;
                inner.pause_reason = Some(PauseReason::Manual);
            }
        }
    }

    pub fn resume(&self) {
        if let Ok(mut inner) = self.shared.inner.lock() {
            if inner.state == RecorderState::Paused
                && inner.pause_reason == Some(PauseReason::Manual)
            {
                inner.state = RecorderState::Recording;
                inner.pause_reason = None;
                inner.last_interactive_at = self.shared.clock.now_ms();
            }
        }
    }

    pub fn state(&self) -> RecorderState {
        self.shared
            .inner
            .lock()
            .map(|i| i.state)
            .unwrap_or(RecorderState::Stopped)
    }

    /// Snapshot of the bounded event ring.
    pub fn events(&self) -> Vec<DomEvent> {
        self.shared
            .inner
            .lock()
            .map(|i| i.events.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Periodic check driven by the orchestrator: idle expiry, and
    /// navigations that produced no meta event.
    pub fn poll(&self) {
        let now = self.shared.clock.now_ms();
        let mut changed_href: Option<String> = None;
        {
            let mut inner = match self.shared.inner.lock() {
                Ok(i) => i,
                Err(_) => return,
            };
            if inner.state == RecorderState::Recording
                && now - inner.last_interactive_at > self.shared.idle_timeout_ms
            {
                tracing::debug!("No interaction within idle timeout, pausing recording");
                inner.state = RecorderState::Paused;
                inner.pause_reason = Some(PauseReason::Idle);
            }

            if inner.state == RecorderState::Recording {
                if let Some(href) = self.primitive.current_href() {
                    if inner.last_href.as_deref() != Some(href.as_str()) {
                        inner.last_href = Some(href.clone());
                        changed_href = Some(href);
                    }
                }
            }
        }

        if let Some(href) = changed_href {
            self.add_custom_event("$url_changed", json!({ "href": href }));
        }
    }

    /// Inject a custom event through the primitive so it appears inline in
    /// the chronology.
    pub fn add_custom_event(&self, tag: &str, payload: Value) {
        let handle = self.shared.handle.lock();
        match handle {
            Ok(guard) => match guard.as_ref() {
                Some(handle) => handle.add_custom_event(tag, payload),
                None => tracing::debug!("Custom event '{}' dropped: recorder not active", tag),
            },
            Err(_) => {}
        }
    }
}

fn lock_inner<'a>(
    shared: &'a RecorderShared,
) -> Result<std::sync::MutexGuard<'a, RecorderInner>, PerceptrError> {
    shared
        .inner
        .lock()
        .map_err(|_| PerceptrError::Recording {
            component: "dom_recorder".into(),
            message: "recorder mutex poisoned".into(),
        })
}

/// The emit pipeline: rate limiter, blocklist on meta, pause filter,
/// idle reset on interaction, then ring + subscriber.
fn handle_emit(shared: &RecorderShared, event: DomEvent) {
    let now = shared.clock.now_ms();
    let mut newly_blocked: Vec<u64> = Vec::new();
    let mut rate_dropped = false;

    let deliver = {
        let mut inner = match shared.inner.lock() {
            Ok(i) => i,
            Err(_) => return,
        };
        if inner.state == RecorderState::Stopped || inner.state == RecorderState::Idle {
            return;
        }

        if event.kind == EVENT_TYPE_INCREMENTAL_SNAPSHOT
            && event.incremental_source() == Some(SOURCE_MUTATION)
        {
            let ids = mutation_node_ids(&event.data);
            if !ids.is_empty() {
                let outcome = inner.limiter.charge(&ids, now);
                newly_blocked = outcome.newly_blocked;
                rate_dropped = outcome.drop_event;
            }
        }

        if let Some(href) = event.meta_href() {
            inner.last_href = Some(href.to_string());
            let blocked = shared.blocklist.iter().any(|re| re.is_match(href));
            if blocked && inner.state == RecorderState::Recording {
                tracing::debug!(href, "URL matches blocklist, pausing recording");
                inner.state = RecorderState::Paused;
                inner.pause_reason = Some(PauseReason::UrlBlocked);
            } else if !blocked
                && inner.state == RecorderState::Paused
                && inner.pause_reason == Some(PauseReason::UrlBlocked)
            {
                inner.state = RecorderState::Recording;
                inner.pause_reason = None;
                inner.last_interactive_at = now;
            }
        }

        if event.is_interactive() {
            inner.last_interactive_at = now;
            if inner.state == RecorderState::Paused
                && inner.pause_reason == Some(PauseReason::Idle)
            {
                inner.state = RecorderState::Recording;
                inner.pause_reason = None;
            }
        }

        let deliver = inner.state == RecorderState::Recording && !rate_dropped;
        if deliver {
            inner.events.push_back(event.clone());
            while inner.events.len() > shared.max_events {
                inner.events.pop_front();
            }
        }
        deliver
    };

    if !newly_blocked.is_empty() {
        if let Ok(guard) = shared.handle.lock() {
            if let Some(handle) = guard.as_ref() {
                for id in &newly_blocked {
                    handle.block_node(*id);
                }
                handle.take_full_snapshot();
            }
        }
        tracing::warn!(nodes = ?newly_blocked, "Mutation flood throttled");
    }

    if deliver {
        if let Ok(subscriber) = shared.subscriber.lock() {
            if let Some(cb) = subscriber.as_ref() {
                cb(event);
            }
        }
    }
}
