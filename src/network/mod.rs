// src/network/mod.rs — Outbound request interception
//
// Wraps both gateway dispatcher slots on enable and restores the
// construction-time originals on disable, so wrappers other libraries
// install in between never leak into restoration. Every intercepted
// request becomes one sanitized record, delivered synchronously to the
// subscriber and retained in a bounded FIFO as a safety net.

pub mod gateway;
pub mod sanitize;

use async_trait::async_trait;
use regex::Regex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

use crate::api::INGEST_PATH_SEGMENT;
use crate::core::events::{NetworkRecord, EVENT_TYPE_NETWORK};
use crate::infra::clock::Clock;
use crate::infra::config::NetworkConfig;
use gateway::{DispatchSlot, HttpDispatch, HttpGateway, OutboundRequest, OutboundResponse};
use sanitize::Sanitizer;

type Subscriber = Box<dyn Fn(NetworkRecord) + Send + Sync>;

/// State shared between the tap handle and its installed wrappers.
struct TapShared {
    clock: Arc<dyn Clock>,
    sanitizer: Sanitizer,
    exclude: Vec<Regex>,
    records: Mutex<VecDeque<NetworkRecord>>,
    max_requests: usize,
    subscriber: Mutex<Option<Subscriber>>,
}

impl TapShared {
    fn should_skip(&self, url: &str) -> bool {
        // Hard denylist first: never record the agent's own uploads.
        url.contains(INGEST_PATH_SEGMENT) || self.exclude.iter().any(|re| re.is_match(url))
    }

    fn deliver(&self, record: NetworkRecord) {
        {
            let mut records = match self.records.lock() {
                Ok(r) => r,
                Err(_) => return,
            };
            if records.len() >= self.max_requests {
                records.pop_front();
            }
            records.push_back(record.clone());
        }
        if let Ok(subscriber) = self.subscriber.lock() {
            if let Some(cb) = subscriber.as_ref() {
                cb(record);
            }
        }
    }
}

pub struct NetworkTap {
    gateway: Arc<HttpGateway>,
    // Captured at construction, not at enable, so disable restores the
    // exact prior state even if other code re-wraps the slots later.
    original_primary: Arc<dyn HttpDispatch>,
    original_legacy: Arc<dyn HttpDispatch>,
    shared: Arc<TapShared>,
    enabled: AtomicBool,
}

impl NetworkTap {
    pub fn new(gateway: Arc<HttpGateway>, clock: Arc<dyn Clock>, config: &NetworkConfig) -> Self {
        let exclude = config
            .exclude_urls
            .iter()
            .filter_map(|pattern| match Regex::new(pattern) {
                Ok(re) => Some(re),
                Err(e) => {
                    tracing::warn!("Ignoring invalid exclude pattern '{}': {}", pattern, e);
                    None
                }
            })
            .collect();

        Self {
            original_primary: gateway.get(DispatchSlot::Primary),
            original_legacy: gateway.get(DispatchSlot::Legacy),
            shared: Arc::new(TapShared {
                clock,
                sanitizer: Sanitizer::from_config(config),
                exclude,
                records: Mutex::new(VecDeque::new()),
                max_requests: config.max_requests,
                subscriber: Mutex::new(None),
            }),
            gateway,
            enabled: AtomicBool::new(false),
        }
    }

    /// Register the downstream consumer. Records are handed over
    /// synchronously from the dispatch path.
    pub fn subscribe(&self, callback: impl Fn(NetworkRecord) + Send + Sync + 'static) {
        if let Ok(mut subscriber) = self.shared.subscriber.lock() {
            *subscriber = Some(Box::new(callback));
        }
    }

    /// Install the interception wrappers. A second enable is a no-op.
    pub fn enable(&self) {
        if self.enabled.swap(true, Ordering::SeqCst) {
            return;
        }
        self.gateway.set(
            DispatchSlot::Primary,
            Arc::new(TapDispatch {
                inner: Arc::clone(&self.original_primary),
                shared: Arc::clone(&self.shared),
                slot: DispatchSlot::Primary,
            }),
        );
        self.gateway.set(
            DispatchSlot::Legacy,
            Arc::new(TapDispatch {
                inner: Arc::clone(&self.original_legacy),
                shared: Arc::clone(&self.shared),
                slot: DispatchSlot::Legacy,
            }),
        );
        tracing::debug!("Network tap enabled");
    }

    /// Restore the construction-time originals. A second disable is a
    /// no-op.
    pub fn disable(&self) {
        if !self.enabled.swap(false, Ordering::SeqCst) {
            return;
        }
        self.gateway
            .set(DispatchSlot::Primary, Arc::clone(&self.original_primary));
        self.gateway
            .set(DispatchSlot::Legacy, Arc::clone(&self.original_legacy));
        tracing::debug!("Network tap disabled");
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// Snapshot of the retained records (bounded safety net, not the
    /// primary channel).
    pub fn records(&self) -> Vec<NetworkRecord> {
        self.shared
            .records
            .lock()
            .map(|r| r.iter().cloned().collect())
            .unwrap_or_default()
    }
}

/// Wrapper installed into a gateway slot while the tap is enabled.
struct TapDispatch {
    inner: Arc<dyn HttpDispatch>,
    shared: Arc<TapShared>,
    slot: DispatchSlot,
}

#[async_trait]
impl HttpDispatch for TapDispatch {
    async fn dispatch(&self, request: OutboundRequest) -> Result<OutboundResponse, String> {
        if self.shared.should_skip(&request.url) {
            return self.inner.dispatch(request).await;
        }

        let id = Uuid::new_v4().to_string();
        let start = self.shared.clock.now_ms();
        let sanitizer = &self.shared.sanitizer;

        let url = sanitizer.sanitize_url(&request.url);
        let method = request.method.clone();
        let request_headers = sanitizer.sanitize_headers(&request.headers);
        let request_body = request.body.as_deref().map(|b| sanitizer.sanitize_body(b));

        let result = self.inner.dispatch(request).await;
        let now = self.shared.clock.now_ms();

        let record = match &result {
            Ok(response) => {
                let response_headers = match (self.slot, &response.raw_header_block) {
                    // The legacy API reports headers as one raw block.
                    (DispatchSlot::Legacy, Some(block)) => {
                        sanitizer.sanitize_headers(&parse_raw_headers(block))
                    }
                    _ => sanitizer.sanitize_headers(&response.headers),
                };
                NetworkRecord {
                    kind: EVENT_TYPE_NETWORK,
                    id,
                    timestamp: start,
                    duration: now - start,
                    method,
                    url,
                    status: Some(response.status),
                    status_text: Some(response.status_text.clone()),
                    request_headers,
                    response_headers,
                    request_body,
                    response_body: response
                        .body
                        .as_deref()
                        .map(|b| sanitizer.sanitize_body(b)),
                    error: None,
                }
            }
            Err(error) => NetworkRecord {
                kind: EVENT_TYPE_NETWORK,
                id,
                timestamp: start,
                duration: now - start,
                method,
                url,
                status: None,
                status_text: None,
                request_headers,
                response_headers: HashMap::new(),
                request_body,
                response_body: None,
                error: Some(error.clone()),
            },
        };
        self.shared.deliver(record);

        result
    }
}

/// Parse a raw header block (`name: value` lines) into pairs.
fn parse_raw_headers(block: &str) -> Vec<(String, String)> {
    block
        .split("\r\n")
        .flat_map(|chunk| chunk.split('\n'))
        .filter_map(|line| {
            let (name, value) = line.split_once(':')?;
            let name = name.trim();
            if name.is_empty() {
                return None;
            }
            Some((name.to_string(), value.trim().to_string()))
        })
        .collect()
}
