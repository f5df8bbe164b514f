// src/recorder/rate_limit.rs — Per-node mutation flood defense

use serde_json::Value;
use std::collections::HashMap;

/// Token bucket per DOM node identity. Pathological subtrees producing
/// thousands of mutations per second exhaust their bucket and get blocked
/// at the primitive, instead of flooding the pipeline.
pub struct MutationRateLimiter {
    capacity: f64,
    refill_per_sec: f64,
    buckets: HashMap<u64, Bucket>,
}

struct Bucket {
    tokens: f64,
    last_refill_ms: i64,
    throttled: bool,
}

/// What to do with a mutation event after charging its nodes.
pub struct ChargeOutcome {
    /// Nodes that just ran out of budget; the caller blocks them at the
    /// primitive and requests a fresh snapshot.
    pub newly_blocked: Vec<u64>,
    /// Whether the event itself should be dropped.
    pub drop_event: bool,
}

impl MutationRateLimiter {
    pub fn new(capacity: u32, refill_per_sec: u32) -> Self {
        Self {
            capacity: f64::from(capacity),
            refill_per_sec: f64::from(refill_per_sec),
            buckets: HashMap::new(),
        }
    }

    /// Charge one token per touched node.
    pub fn charge(&mut self, node_ids: &[u64], now_ms: i64) -> ChargeOutcome {
        let mut newly_blocked = Vec::new();
        let mut drop_event = false;

        for &id in node_ids {
            let bucket = self.buckets.entry(id).or_insert(Bucket {
                tokens: self.capacity,
                last_refill_ms: now_ms,
                throttled: false,
            });

            let elapsed_s = (now_ms - bucket.last_refill_ms).max(0) as f64 / 1_000.0;
            bucket.tokens = (bucket.tokens + elapsed_s * self.refill_per_sec).min(self.capacity);
            bucket.last_refill_ms = now_ms;

            if bucket.tokens >= 1.0 {
                bucket.tokens -= 1.0;
                if bucket.throttled {
                    bucket.throttled = false;
                }
            } else {
                drop_event = true;
                if !bucket.throttled {
                    bucket.throttled = true;
                    newly_blocked.push(id);
                }
            }
        }

        ChargeOutcome {
            newly_blocked,
            drop_event,
        }
    }

    pub fn is_throttled(&self, node_id: u64) -> bool {
        self.buckets.get(&node_id).is_some_and(|b| b.throttled)
    }
}

/// Collect the node ids a mutation event touches.
pub fn mutation_node_ids(data: &Value) -> Vec<u64> {
    let mut ids = Vec::new();
    for key in ["texts", "attributes", "removes"] {
        if let Some(items) = data.get(key).and_then(Value::as_array) {
            ids.extend(items.iter().filter_map(|item| item.get("id")?.as_u64()));
        }
    }
    if let Some(adds) = data.get("adds").and_then(Value::as_array) {
        ids.extend(
            adds.iter()
                .filter_map(|item| item.get("node")?.get("id")?.as_u64()),
        );
    }
    ids
}
