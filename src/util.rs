// src/util.rs — Shared utility functions

use serde::Serialize;

/// Estimate the serialized size of a value in bytes (JSON string length).
///
/// Batch accounting and flush thresholds are driven by this estimate, not
/// by exact wire bytes. Values that fail to serialize count as zero; owned
/// `serde_json` trees cannot contain reference cycles, so no cycle guard
/// is needed on this path.
pub fn estimated_json_size<T: Serialize>(value: &T) -> usize {
    serde_json::to_string(value).map(|s| s.len()).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_estimated_size_matches_json_length() {
        let v = json!({ "a": 1, "b": "xy" });
        assert_eq!(estimated_json_size(&v), v.to_string().len());
    }

    #[test]
    fn test_estimated_size_empty_list() {
        let v: Vec<u8> = vec![];
        assert_eq!(estimated_json_size(&v), 2); // "[]"
    }

    #[test]
    fn test_estimated_size_counts_string_escapes() {
        // Escapes inflate the JSON length past the raw character count.
        let v = json!("a\"b");
        assert_eq!(estimated_json_size(&v), 6); // "a\"b" with quotes
    }
}
