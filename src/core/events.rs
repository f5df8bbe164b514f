// src/core/events.rs — Event records shared by the capture pipeline
//
// DOM events and network records travel a single ordered stream. The
// network tag (7) is disjoint from the recorder's event-type range (0-6)
// so consumers can dispatch on the numeric `type` alone.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

// Recorder event-type codes (the range owned by the recording primitive).
pub const EVENT_TYPE_DOM_CONTENT_LOADED: u8 = 0;
pub const EVENT_TYPE_LOAD: u8 = 1;
pub const EVENT_TYPE_FULL_SNAPSHOT: u8 = 2;
pub const EVENT_TYPE_INCREMENTAL_SNAPSHOT: u8 = 3;
pub const EVENT_TYPE_META: u8 = 4;
pub const EVENT_TYPE_CUSTOM: u8 = 5;
pub const EVENT_TYPE_PLUGIN: u8 = 6;
/// Network records share the stream under a tag outside the recorder range.
pub const EVENT_TYPE_NETWORK: u8 = 7;

// Incremental-snapshot source codes.
pub const SOURCE_MUTATION: u64 = 0;
pub const SOURCE_MOUSE_MOVE: u64 = 1;
pub const SOURCE_MOUSE_INTERACTION: u64 = 2;
pub const SOURCE_SCROLL: u64 = 3;
pub const SOURCE_VIEWPORT_RESIZE: u64 = 4;
pub const SOURCE_INPUT: u64 = 5;
pub const SOURCE_TOUCH_MOVE: u64 = 6;
pub const SOURCE_MEDIA_INTERACTION: u64 = 7;
pub const SOURCE_DRAG: u64 = 12;

/// Incremental sources that count as user interaction: they refresh the
/// session's activity clock and wake the recorder from idle.
pub const ACTIVE_SOURCES: [u64; 6] = [
    SOURCE_MOUSE_MOVE,
    SOURCE_SCROLL,
    SOURCE_INPUT,
    SOURCE_TOUCH_MOVE,
    SOURCE_MEDIA_INTERACTION,
    SOURCE_DRAG,
];

/// Name of the console-capture plugin delivered through the recording
/// primitive.
pub const CONSOLE_PLUGIN_NAME: &str = "rrweb/console@1";

/// Marker prefixed to the agent's own log lines. Console records carrying
/// it are dropped before they can feed back into the pipeline.
pub const INTERNAL_LOG_MARKER: &str = "[Perceptr]";

/// Raw event produced by the recording primitive. The payload shape is
/// owned by the primitive; this crate only inspects the fields it gates on.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DomEvent {
    #[serde(rename = "type")]
    pub kind: u8,
    pub timestamp: i64,
    pub data: Value,
}

impl DomEvent {
    pub fn new(kind: u8, timestamp: i64, data: Value) -> Self {
        Self {
            kind,
            timestamp,
            data,
        }
    }

    /// Source tag of an incremental snapshot, if this is one.
    pub fn incremental_source(&self) -> Option<u64> {
        if self.kind != EVENT_TYPE_INCREMENTAL_SNAPSHOT {
            return None;
        }
        self.data.get("source").and_then(Value::as_u64)
    }

    /// True for incremental events whose source is a user interaction.
    pub fn is_interactive(&self) -> bool {
        self.incremental_source()
            .is_some_and(|s| ACTIVE_SOURCES.contains(&s))
    }

    /// The `href` of a meta event, if this is one.
    pub fn meta_href(&self) -> Option<&str> {
        if self.kind != EVENT_TYPE_META {
            return None;
        }
        self.data.get("href").and_then(Value::as_str)
    }

    /// Plugin name of a plugin event, if this is one.
    pub fn plugin_name(&self) -> Option<&str> {
        if self.kind != EVENT_TYPE_PLUGIN {
            return None;
        }
        self.data.get("plugin").and_then(Value::as_str)
    }

    /// First element of a console plugin record's argument array.
    pub fn first_plugin_arg(&self) -> Option<&str> {
        self.data
            .get("payload")?
            .get("payload")?
            .get(0)?
            .as_str()
    }

    /// A record is internal iff it is a console-plugin record whose first
    /// argument carries the agent's own log marker. Dropping these prevents
    /// a feedback loop with the agent's debug logging.
    pub fn is_internal_log(&self) -> bool {
        self.plugin_name() == Some(CONSOLE_PLUGIN_NAME)
            && self
                .first_plugin_arg()
                .is_some_and(|arg| arg.contains(INTERNAL_LOG_MARKER))
    }
}

/// Uniform record for one intercepted HTTP request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NetworkRecord {
    #[serde(rename = "type", default = "network_type")]
    pub kind: u8,
    pub id: String,
    pub timestamp: i64,
    pub duration: i64,
    pub method: String,
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_text: Option<String>,
    #[serde(default)]
    pub request_headers: HashMap<String, String>,
    #[serde(default)]
    pub response_headers: HashMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_body: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_body: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

fn network_type() -> u8 {
    EVENT_TYPE_NETWORK
}

/// One entry in the ordered capture stream.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum EventRecord {
    Network(NetworkRecord),
    Dom(DomEvent),
}

impl EventRecord {
    pub fn timestamp(&self) -> i64 {
        match self {
            EventRecord::Network(r) => r.timestamp,
            EventRecord::Dom(e) => e.timestamp,
        }
    }

    pub fn type_code(&self) -> u8 {
        match self {
            EventRecord::Network(r) => r.kind,
            EventRecord::Dom(e) => e.kind,
        }
    }

    pub fn as_dom(&self) -> Option<&DomEvent> {
        match self {
            EventRecord::Dom(e) => Some(e),
            EventRecord::Network(_) => None,
        }
    }
}

impl From<DomEvent> for EventRecord {
    fn from(e: DomEvent) -> Self {
        EventRecord::Dom(e)
    }
}

impl From<NetworkRecord> for EventRecord {
    fn from(r: NetworkRecord) -> Self {
        EventRecord::Network(r)
    }
}

/// Identity attached to batches after `identify()` is called.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UserIdentity {
    pub distinct_id: String,
    #[serde(flatten)]
    pub traits: serde_json::Map<String, Value>,
}

impl UserIdentity {
    pub fn new(distinct_id: impl Into<String>) -> Self {
        Self {
            distinct_id: distinct_id.into(),
            traits: serde_json::Map::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn incremental(source: u64, ts: i64) -> DomEvent {
        DomEvent::new(
            EVENT_TYPE_INCREMENTAL_SNAPSHOT,
            ts,
            json!({ "source": source }),
        )
    }

    #[test]
    fn test_interactive_sources() {
        assert!(incremental(SOURCE_MOUSE_MOVE, 1).is_interactive());
        assert!(incremental(SOURCE_SCROLL, 1).is_interactive());
        assert!(incremental(SOURCE_INPUT, 1).is_interactive());
        assert!(incremental(SOURCE_TOUCH_MOVE, 1).is_interactive());
        assert!(incremental(SOURCE_MEDIA_INTERACTION, 1).is_interactive());
        assert!(incremental(SOURCE_DRAG, 1).is_interactive());
    }

    #[test]
    fn test_mutation_not_interactive() {
        assert!(!incremental(SOURCE_MUTATION, 1).is_interactive());
        assert!(!incremental(SOURCE_VIEWPORT_RESIZE, 1).is_interactive());
    }

    #[test]
    fn test_meta_not_interactive() {
        let meta = DomEvent::new(EVENT_TYPE_META, 1, json!({ "href": "https://x/y" }));
        assert!(!meta.is_interactive());
        assert_eq!(meta.meta_href(), Some("https://x/y"));
    }

    #[test]
    fn test_internal_log_detection() {
        let internal = DomEvent::new(
            EVENT_TYPE_PLUGIN,
            1,
            json!({
                "plugin": CONSOLE_PLUGIN_NAME,
                "payload": { "level": "debug", "payload": ["[Perceptr] flush scheduled"] }
            }),
        );
        assert!(internal.is_internal_log());

        let user_log = DomEvent::new(
            EVENT_TYPE_PLUGIN,
            1,
            json!({
                "plugin": CONSOLE_PLUGIN_NAME,
                "payload": { "level": "log", "payload": ["checkout clicked"] }
            }),
        );
        assert!(!user_log.is_internal_log());
    }

    #[test]
    fn test_internal_log_requires_console_plugin() {
        let other_plugin = DomEvent::new(
            EVENT_TYPE_PLUGIN,
            1,
            json!({
                "plugin": "rrweb/sequential-id@1",
                "payload": { "payload": ["[Perceptr] not a console record"] }
            }),
        );
        assert!(!other_plugin.is_internal_log());
    }

    #[test]
    fn test_network_record_wire_shape() {
        let record = NetworkRecord {
            kind: EVENT_TYPE_NETWORK,
            id: "req-1".into(),
            timestamp: 250,
            duration: 40,
            method: "GET".into(),
            url: "https://x/y".into(),
            status: Some(200),
            status_text: Some("OK".into()),
            request_headers: HashMap::new(),
            response_headers: HashMap::new(),
            request_body: None,
            response_body: None,
            error: None,
        };
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["type"], 7);
        assert_eq!(json["statusText"], "OK");
        assert!(json.get("requestBody").is_none());
    }

    #[test]
    fn test_event_record_untagged_roundtrip() {
        let dom: EventRecord = DomEvent::new(EVENT_TYPE_FULL_SNAPSHOT, 100, json!({})).into();
        let net: EventRecord = NetworkRecord {
            kind: EVENT_TYPE_NETWORK,
            id: "req-2".into(),
            timestamp: 250,
            duration: 5,
            method: "POST".into(),
            url: "https://x/z".into(),
            status: None,
            status_text: None,
            request_headers: HashMap::new(),
            response_headers: HashMap::new(),
            request_body: None,
            response_body: None,
            error: Some("connection reset".into()),
        }
        .into();

        for original in [dom, net] {
            let json = serde_json::to_string(&original).unwrap();
            let parsed: EventRecord = serde_json::from_str(&json).unwrap();
            assert_eq!(parsed, original);
            assert_eq!(parsed.timestamp(), original.timestamp());
        }
    }

    #[test]
    fn test_user_identity_flattens_traits() {
        let mut identity = UserIdentity::new("user-9");
        identity
            .traits
            .insert("plan".into(), Value::String("pro".into()));
        let json = serde_json::to_value(&identity).unwrap();
        assert_eq!(json["distinctId"], "user-9");
        assert_eq!(json["plan"], "pro");
    }
}
