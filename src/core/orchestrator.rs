// src/core/orchestrator.rs — Component wiring and lifecycle
//
// Owns every singleton in the pipeline. Construction kicks off async
// init (credential check, component build, session resolution, persisted
// replay); start/stop/identify gate on that init and fail if it failed.

use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use crate::api::{ApiClient, BatchSink, ControlPlane};
use crate::buffer::{EventBuffer, FLUSH_INTERVAL_MS};
use crate::core::events::UserIdentity;
use crate::infra::clock::{Clock, SystemClock};
use crate::infra::config::AgentConfig;
use crate::infra::errors::{AgentError, PerceptrError};
use crate::infra::store::{FileStore, StateStore};
use crate::monitor::{MemoryProbe, MemoryWatch};
use crate::network::gateway::HttpGateway;
use crate::network::NetworkTap;
use crate::recorder::primitive::RecordingPrimitive;
use crate::recorder::DomRecorder;
use crate::session::{SessionManager, SessionMessage};

/// Debounce window for visibility transitions.
pub const VISIBILITY_DEBOUNCE_MS: u64 = 400;

/// Tab visibility as reported by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visibility {
    Visible,
    Hidden,
}

/// The host-environment seams the embedder wires in: clock, durable
/// store, request dispatchers, the recording primitive, and the heap
/// probe. `api` overrides the control-plane client (tests inject a mock).
pub struct HostBindings {
    pub clock: Arc<dyn Clock>,
    pub store: Arc<dyn StateStore>,
    pub gateway: Arc<HttpGateway>,
    pub primitive: Arc<dyn RecordingPrimitive>,
    pub memory_probe: Arc<dyn MemoryProbe>,
    pub api: Option<Arc<dyn ControlPlane>>,
}

impl HostBindings {
    /// Production defaults for clock and store; the remaining seams have
    /// no meaningful default and must come from the host.
    pub fn new(
        config: &AgentConfig,
        gateway: Arc<HttpGateway>,
        primitive: Arc<dyn RecordingPrimitive>,
        memory_probe: Arc<dyn MemoryProbe>,
    ) -> Self {
        let state_dir = config.state_dir.clone().unwrap_or_else(|| {
            std::env::temp_dir()
                .join("perceptr")
                .join(&config.project_id)
                .to_string_lossy()
                .into_owned()
        });
        Self {
            clock: Arc::new(SystemClock),
            store: Arc::new(FileStore::new(state_dir)),
            gateway,
            primitive,
            memory_probe,
            api: None,
        }
    }
}

/// Everything built by a successful init, in construction order.
struct Components {
    session_manager: Arc<SessionManager>,
    buffer: Arc<EventBuffer>,
    tap: Arc<NetworkTap>,
    recorder: Arc<DomRecorder>,
    memory_watch: Arc<MemoryWatch>,
}

enum InitState {
    Pending(JoinHandle<Result<Components, PerceptrError>>),
    Ready(Arc<Components>),
    Failed(String),
}

pub struct Orchestrator {
    config: AgentConfig,
    init: tokio::sync::Mutex<InitState>,
    ready: OnceLock<Arc<Components>>,
    started: AtomicBool,
    error_tx: broadcast::Sender<AgentError>,
    session_tx: broadcast::Sender<SessionMessage>,
    shutdown_tx: Mutex<Option<broadcast::Sender<()>>>,
    overload_tx: mpsc::Sender<u64>,
    overload_rx: Mutex<Option<mpsc::Receiver<u64>>>,
    visibility_generation: AtomicU64,
}

impl Orchestrator {
    /// Construction kicks off init in the background; every public entry
    /// point awaits it.
    pub fn new(config: AgentConfig, host: HostBindings) -> Arc<Self> {
        let (error_tx, _) = broadcast::channel(32);
        let (session_tx, _) = broadcast::channel(16);
        let (overload_tx, overload_rx) = mpsc::channel(4);

        let api: Arc<dyn ControlPlane> = host.api.unwrap_or_else(|| {
            Arc::new(ApiClient::new(
                config.project_id.clone(),
                config.environment,
                config.compression,
            ))
        });

        let init_handle = tokio::spawn(Self::run_init(
            config.clone(),
            api,
            host.clock,
            host.store,
            host.gateway,
            host.primitive,
            host.memory_probe,
            error_tx.clone(),
            session_tx.clone(),
        ));

        Arc::new(Self {
            config,
            init: tokio::sync::Mutex::new(InitState::Pending(init_handle)),
            ready: OnceLock::new(),
            started: AtomicBool::new(false),
            error_tx,
            session_tx,
            shutdown_tx: Mutex::new(None),
            overload_tx,
            overload_rx: Mutex::new(Some(overload_rx)),
            visibility_generation: AtomicU64::new(0),
        })
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_init(
        config: AgentConfig,
        api: Arc<dyn ControlPlane>,
        clock: Arc<dyn Clock>,
        store: Arc<dyn StateStore>,
        gateway: Arc<HttpGateway>,
        primitive: Arc<dyn RecordingPrimitive>,
        memory_probe: Arc<dyn MemoryProbe>,
        error_tx: broadcast::Sender<AgentError>,
        session_tx: broadcast::Sender<SessionMessage>,
    ) -> Result<Components, PerceptrError> {
        if !api.check_valid_project_id().await {
            return Err(PerceptrError::Initialization {
                message: format!("invalid project id '{}'", config.project_id),
            });
        }

        let tap = Arc::new(NetworkTap::new(gateway, clock.clone(), &config.network));
        let recorder = Arc::new(DomRecorder::new(
            primitive,
            clock.clone(),
            &config.recorder,
        ));
        let memory_watch = Arc::new(MemoryWatch::new(memory_probe, &config.memory));

        let session_manager = Arc::new(SessionManager::new(
            clock.clone(),
            store.clone(),
            config.session.effective_inactivity_timeout_ms(),
            config.session.max_session_duration_ms,
            Some(session_tx),
        ));

        let sink: Arc<dyn BatchSink> = api.clone();
        let buffer = Arc::new(EventBuffer::new(
            sink,
            clock,
            store,
            session_manager.clone(),
            Some(error_tx),
        ));

        let session = session_manager.get_or_create_session();
        buffer.set_session_state(session);
        buffer.flush_persisted_buffers().await;

        Ok(Components {
            session_manager,
            buffer,
            tap,
            recorder,
            memory_watch,
        })
    }

    /// Await the init kicked off at construction, memoizing the outcome.
    async fn ensure_init(&self) -> Result<Arc<Components>, PerceptrError> {
        if let Some(components) = self.ready.get() {
            return Ok(Arc::clone(components));
        }

        let mut state = self.init.lock().await;
        let current = std::mem::replace(&mut *state, InitState::Failed("init interrupted".into()));
        match current {
            InitState::Ready(components) => {
                *state = InitState::Ready(Arc::clone(&components));
                Ok(components)
            }
            InitState::Failed(message) => {
                *state = InitState::Failed(message.clone());
                Err(PerceptrError::Initialization { message })
            }
            InitState::Pending(handle) => match handle.await {
                Ok(Ok(components)) => {
                    let components = Arc::new(components);
                    *state = InitState::Ready(Arc::clone(&components));
                    let _ = self.ready.set(Arc::clone(&components));
                    Ok(components)
                }
                Ok(Err(e)) => {
                    let message = e.to_string();
                    *state = InitState::Failed(message.clone());
                    self.surface(&e);
                    Err(e)
                }
                Err(join_err) => {
                    let message = format!("init task aborted: {join_err}");
                    *state = InitState::Failed(message.clone());
                    let e = PerceptrError::Initialization { message };
                    self.surface(&e);
                    Err(e)
                }
            },
        }
    }

    /// Wire producers into the buffer and bring every component up.
    pub async fn start(self: &Arc<Self>) -> Result<(), PerceptrError> {
        let c = self.ensure_init().await?;
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        tracing::info!(project_id = %self.config.project_id, "Starting capture pipeline");

        let buffer = Arc::clone(&c.buffer);
        c.recorder.subscribe(move |event| buffer.add_event(event.into()));
        let buffer = Arc::clone(&c.buffer);
        c.tap.subscribe(move |record| buffer.add_event(record.into()));

        // Memory overage pauses the pipeline from a task of its own; the
        // probe callback only signals.
        let overload_tx = self.overload_tx.clone();
        c.memory_watch.start(move |used| {
            let _ = overload_tx.try_send(used);
        });
        if let Some(mut overload_rx) = self.overload_rx.lock().ok().and_then(|mut r| r.take()) {
            let this = Arc::clone(self);
            let limit_bytes = self.config.memory.memory_limit_bytes;
            tokio::spawn(async move {
                while let Some(used_bytes) = overload_rx.recv().await {
                    let error = PerceptrError::MemoryLimit {
                        used_bytes,
                        limit_bytes,
                    };
                    this.surface(&error);
                    this.pause();
                }
            });
        }

        // The recorder starts immediately so the initial full snapshot is
        // not missed; tap installation is deferred to a spawned turn.
        if let Err(e) = c.recorder.start_session() {
            self.surface(&e);
            tracing::warn!("Continuing without DOM recording: {}", e);
        }
        let tap = Arc::clone(&c.tap);
        tokio::spawn(async move {
            tokio::task::yield_now().await;
            tap.enable();
        });

        self.spawn_timers(&c);
        Ok(())
    }

    fn spawn_timers(&self, c: &Arc<Components>) {
        let (shutdown_tx, _) = broadcast::channel(1);
        if let Ok(mut slot) = self.shutdown_tx.lock() {
            *slot = Some(shutdown_tx.clone());
        }

        let buffer = Arc::clone(&c.buffer);
        let mut flush_shutdown = shutdown_tx.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(std::time::Duration::from_millis(FLUSH_INTERVAL_MS)) => {
                        if let Err(e) = buffer.flush(false).await {
                            tracing::debug!("Interval flush failed: {}", e);
                        }
                    }
                    _ = flush_shutdown.recv() => break,
                }
            }
        });

        let recorder = Arc::clone(&c.recorder);
        let poll_interval = self.config.recorder.url_poll_interval_ms;
        let mut poll_shutdown = shutdown_tx.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(std::time::Duration::from_millis(poll_interval)) => {
                        recorder.poll();
                    }
                    _ = poll_shutdown.recv() => break,
                }
            }
        });
    }

    /// Terminal flush, then teardown.
    pub async fn stop(self: &Arc<Self>) -> Result<(), PerceptrError> {
        let c = self.ensure_init().await?;
        self.started.store(false, Ordering::SeqCst);

        let result = c.buffer.destroy().await;

        // Teardown happens after yielding, letting in-flight producer
        // turns finish first.
        tokio::task::yield_now().await;
        if let Ok(mut slot) = self.shutdown_tx.lock() {
            if let Some(tx) = slot.take() {
                let _ = tx.send(());
            }
        }
        c.recorder.stop_session();
        c.tap.disable();
        c.memory_watch.stop();
        tracing::info!("Capture pipeline stopped");
        result
    }

    /// Symmetric pause of recorder, tap, and memory watch.
    pub fn pause(&self) {
        let Some(c) = self.ready.get() else {
            tracing::warn!("pause() before init completed is a no-op");
            return;
        };
        c.recorder.pause();
        c.tap.disable();
        c.memory_watch.stop();
        tracing::info!("Capture pipeline paused");
    }

    pub fn resume(&self) {
        let Some(c) = self.ready.get() else {
            tracing::warn!("resume() before init completed is a no-op");
            return;
        };
        c.recorder.resume();
        c.tap.enable();
        let overload_tx = self.overload_tx.clone();
        c.memory_watch.start(move |used| {
            let _ = overload_tx.try_send(used);
        });
        tracing::info!("Capture pipeline resumed");
    }

    /// Attach a user identity to subsequent batches and inject an
    /// `$identify` event into the chronology.
    pub async fn identify(&self, distinct_id: &str, traits: Value) -> Result<(), PerceptrError> {
        let c = self.ensure_init().await?;
        let identity = UserIdentity {
            distinct_id: distinct_id.to_string(),
            traits: traits.as_object().cloned().unwrap_or_default(),
        };
        c.buffer.set_user_identity(identity);
        c.recorder.add_custom_event(
            "$identify",
            json!({ "distinctId": distinct_id, "traits": traits }),
        );
        Ok(())
    }

    /// Debounced visibility handling: hidden persists the buffer, visible
    /// re-resolves the session and replays persisted carry-overs.
    pub fn on_visibility_change(self: &Arc<Self>, visibility: Visibility) {
        let generation = self
            .visibility_generation
            .fetch_add(1, Ordering::SeqCst)
            + 1;
        let this = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(VISIBILITY_DEBOUNCE_MS)).await;
            if this.visibility_generation.load(Ordering::SeqCst) != generation {
                return; // superseded by a newer transition
            }
            let Some(c) = this.ready.get() else { return };
            match visibility {
                Visibility::Hidden => c.buffer.persist_now(),
                Visibility::Visible => {
                    let session = c.session_manager.get_or_create_session();
                    c.buffer.set_session_state(session);
                    c.buffer.flush_persisted_buffers().await;
                }
            }
        });
    }

    /// Synchronous unload path: persist whatever is buffered.
    pub fn on_before_unload(&self) {
        if let Some(c) = self.ready.get() {
            c.buffer.persist_now();
        }
    }

    /// Observable error channel: every surfaced fault is broadcast here.
    pub fn subscribe_errors(&self) -> broadcast::Receiver<AgentError> {
        self.error_tx.subscribe()
    }

    /// Advisory session notifications (`session_start`, `activity`) for the
    /// host to bridge onto its cross-tab channel. Delivery is lossy.
    pub fn subscribe_session_messages(&self) -> broadcast::Receiver<SessionMessage> {
        self.session_tx.subscribe()
    }

    fn surface(&self, error: &PerceptrError) {
        let _ = self.error_tx.send(AgentError::from(error));
    }
}
