// src/buffer/split.rs — Batch splitting for oversized event lists

use crate::core::events::EventRecord;
use crate::util::estimated_json_size;

/// Hard cap on a single upload, chosen to stay under typical endpoint
/// limits.
pub const SEVEN_MEGABYTES: usize = 7 * 1024 * 1024;

/// Split an event list at the midpoint, recursively, until every piece is
/// under `cap` or contains a single event. Order is preserved; each piece's
/// size is re-estimated from its own slice.
pub fn split_events(events: Vec<EventRecord>, cap: usize) -> Vec<Vec<EventRecord>> {
    if events.len() <= 1 || estimated_json_size(&events) < cap {
        return vec![events];
    }

    let mid = events.len() / 2;
    let mut left = events;
    let right = left.split_off(mid);

    let mut pieces = split_events(left, cap);
    pieces.extend(split_events(right, cap));
    pieces
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::events::{DomEvent, EVENT_TYPE_INCREMENTAL_SNAPSHOT};
    use serde_json::json;

    fn event_of_size(seq: usize, payload_len: usize) -> EventRecord {
        DomEvent::new(
            EVENT_TYPE_INCREMENTAL_SNAPSHOT,
            seq as i64,
            json!({ "seq": seq, "fill": "x".repeat(payload_len) }),
        )
        .into()
    }

    #[test]
    fn test_small_list_untouched() {
        let events: Vec<EventRecord> = (0..4).map(|i| event_of_size(i, 10)).collect();
        let pieces = split_events(events.clone(), SEVEN_MEGABYTES);
        assert_eq!(pieces, vec![events]);
    }

    #[test]
    fn test_splits_at_cap() {
        // Ten events of ~1 KiB against a 4 KiB cap forces recursion.
        let events: Vec<EventRecord> = (0..10).map(|i| event_of_size(i, 1024)).collect();
        let pieces = split_events(events, 4 * 1024);

        assert!(pieces.len() > 1);
        for piece in &pieces {
            assert!(
                piece.len() == 1 || estimated_json_size(piece) < 4 * 1024,
                "piece of {} events over cap",
                piece.len()
            );
        }
    }

    #[test]
    fn test_split_preserves_order() {
        let events: Vec<EventRecord> = (0..10).map(|i| event_of_size(i, 1024)).collect();
        let pieces = split_events(events, 4 * 1024);

        let seqs: Vec<u64> = pieces
            .iter()
            .flatten()
            .map(|e| match e {
                EventRecord::Dom(d) => d.data["seq"].as_u64().unwrap(),
                EventRecord::Network(_) => unreachable!(),
            })
            .collect();
        assert_eq!(seqs, (0..10).collect::<Vec<u64>>());
    }

    #[test]
    fn test_single_oversized_event_not_split() {
        let events = vec![event_of_size(0, 64 * 1024)];
        let pieces = split_events(events, 1024);
        assert_eq!(pieces.len(), 1);
        assert_eq!(pieces[0].len(), 1);
    }

    #[test]
    fn test_exactly_at_cap_splits() {
        // "Meets or exceeds" the cap: equality splits a two-event list.
        let events: Vec<EventRecord> = (0..2).map(|i| event_of_size(i, 100)).collect();
        let cap = estimated_json_size(&events);
        let pieces = split_events(events, cap);
        assert_eq!(pieces.len(), 2);
    }
}
