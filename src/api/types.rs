// src/api/types.rs — Upload wire format and control-plane responses

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::events::{EventRecord, UserIdentity};

/// The atomic upload unit: a prefix of one session's event stream.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Batch {
    pub session_id: String,
    pub batch_id: String,
    pub is_session_ended: bool,
    pub start_time: i64,
    pub end_time: i64,
    /// Estimated size in bytes (pre-compression JSON length of `data`).
    pub size: usize,
    pub data: Vec<EventRecord>,
    pub metadata: BatchMetadata,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_identity: Option<UserIdentity>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BatchMetadata {
    pub event_count: usize,
    pub compressed: bool,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

#[derive(Debug, Deserialize)]
pub struct CheckResponse {
    #[serde(default)]
    pub success: bool,
}

#[derive(Debug, Deserialize)]
pub struct UploadUrlResponse {
    pub url: String,
}

#[derive(Debug, Deserialize)]
pub struct ErrorDetail {
    #[serde(default)]
    pub detail: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::events::DomEvent;
    use serde_json::json;

    #[test]
    fn test_batch_wire_shape() {
        let batch = Batch {
            session_id: "s-1".into(),
            batch_id: "b-1".into(),
            is_session_ended: true,
            start_time: 100,
            end_time: 400,
            size: 42,
            data: vec![DomEvent::new(2, 100, json!({})).into()],
            metadata: BatchMetadata {
                event_count: 1,
                compressed: false,
                extra: serde_json::Map::new(),
            },
            user_identity: None,
        };

        let json = serde_json::to_value(&batch).unwrap();
        assert_eq!(json["sessionId"], "s-1");
        assert_eq!(json["batchId"], "b-1");
        assert_eq!(json["isSessionEnded"], true);
        assert_eq!(json["metadata"]["eventCount"], 1);
        assert_eq!(json["metadata"]["compressed"], false);
        assert!(json.get("userIdentity").is_none());
    }

    #[test]
    fn test_batch_roundtrip_preserves_event_order() {
        let batch = Batch {
            session_id: "s-2".into(),
            batch_id: "b-2".into(),
            is_session_ended: false,
            start_time: 0,
            end_time: 300,
            size: 0,
            data: vec![
                DomEvent::new(2, 100, json!({"seq": 0})).into(),
                DomEvent::new(3, 200, json!({"seq": 1, "source": 1})).into(),
                DomEvent::new(3, 300, json!({"seq": 2, "source": 3})).into(),
            ],
            metadata: BatchMetadata::default(),
            user_identity: Some(UserIdentity::new("u-1")),
        };

        let text = serde_json::to_string(&batch).unwrap();
        let parsed: Batch = serde_json::from_str(&text).unwrap();
        assert_eq!(parsed, batch);
        let seqs: Vec<i64> = parsed
            .data
            .iter()
            .map(|e| e.as_dom().unwrap().data["seq"].as_i64().unwrap())
            .collect();
        assert_eq!(seqs, vec![0, 1, 2]);
    }
}
