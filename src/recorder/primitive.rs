// src/recorder/primitive.rs — Contract of the external recording primitive
//
// The DOM-recording primitive is an external collaborator: it walks the
// document, emits snapshot/mutation/meta events, and hosts plugins such
// as console capture. This crate only drives it through these traits.

use serde_json::Value;

use crate::core::events::DomEvent;
use crate::infra::errors::PerceptrError;

pub type EmitFn = Box<dyn Fn(DomEvent) + Send + Sync>;

/// Options passed to `record`. Mirrors the primitive's
/// `record({emit, plugins, sampling, …})` surface.
pub struct RecordOptions {
    pub emit: EmitFn,
    /// Plugin names to activate (e.g. the console-capture plugin).
    pub plugins: Vec<String>,
    /// Primitive-specific sampling knobs, passed through opaquely.
    pub sampling: Option<Value>,
}

/// The recording primitive itself.
pub trait RecordingPrimitive: Send + Sync {
    /// Start recording; events flow through `options.emit` until the
    /// returned handle is stopped.
    fn record(&self, options: RecordOptions) -> Result<Box<dyn RecorderHandle>, PerceptrError>;

    /// The document's current location, for detecting navigations that
    /// produced no meta event.
    fn current_href(&self) -> Option<String>;
}

/// Control surface of an active recording.
pub trait RecorderHandle: Send + Sync {
    fn stop(&self);

    /// Request a fresh full snapshot (used after mutation throttling so
    /// the stream can re-anchor).
    fn take_full_snapshot(&self);

    /// Stop emitting mutations for a node that exceeded its rate budget.
    fn block_node(&self, node_id: u64);

    /// Inject a custom event (`$identify`, `$url_changed`) into the
    /// stream; the primitive emits it back through `emit` so it lands in
    /// chronological order.
    fn add_custom_event(&self, tag: &str, payload: Value);
}
