// src/network/gateway.rs — Swappable request dispatcher slots
//
// The host page owns two request APIs. The gateway models them as two
// dispatcher slots the tap can wrap and restore; everything in the process
// issues requests through the current slot contents.

use async_trait::async_trait;
use std::sync::{Arc, Mutex};

/// A request about to leave the process.
#[derive(Debug, Clone)]
pub struct OutboundRequest {
    pub method: String,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<String>,
}

impl OutboundRequest {
    pub fn new(method: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            url: url.into(),
            headers: Vec::new(),
            body: None,
        }
    }
}

/// The response as the dispatcher saw it. The legacy API reports headers
/// as one raw block instead of structured pairs.
#[derive(Debug, Clone)]
pub struct OutboundResponse {
    pub status: u16,
    pub status_text: String,
    pub headers: Vec<(String, String)>,
    pub raw_header_block: Option<String>,
    pub body: Option<String>,
}

/// One of the host's request APIs.
#[async_trait]
pub trait HttpDispatch: Send + Sync {
    async fn dispatch(&self, request: OutboundRequest) -> Result<OutboundResponse, String>;
}

/// Which of the two request APIs a call went through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchSlot {
    Primary,
    Legacy,
}

/// Holder for the two dispatcher slots. Shared with the host page: the
/// tap wraps the slots on enable and must restore the exact originals on
/// disable.
pub struct HttpGateway {
    primary: Mutex<Arc<dyn HttpDispatch>>,
    legacy: Mutex<Arc<dyn HttpDispatch>>,
}

impl HttpGateway {
    pub fn new(primary: Arc<dyn HttpDispatch>, legacy: Arc<dyn HttpDispatch>) -> Arc<Self> {
        Arc::new(Self {
            primary: Mutex::new(primary),
            legacy: Mutex::new(legacy),
        })
    }

    pub fn get(&self, slot: DispatchSlot) -> Arc<dyn HttpDispatch> {
        let holder = match slot {
            DispatchSlot::Primary => &self.primary,
            DispatchSlot::Legacy => &self.legacy,
        };
        let guard = holder.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        Arc::clone(&guard)
    }

    pub fn set(&self, slot: DispatchSlot, dispatch: Arc<dyn HttpDispatch>) {
        let holder = match slot {
            DispatchSlot::Primary => &self.primary,
            DispatchSlot::Legacy => &self.legacy,
        };
        if let Ok(mut current) = holder.lock() {
            *current = dispatch;
        }
    }

    /// Issue a request through whatever currently occupies the slot.
    pub async fn dispatch(
        &self,
        slot: DispatchSlot,
        request: OutboundRequest,
    ) -> Result<OutboundResponse, String> {
        self.get(slot).dispatch(request).await
    }
}
