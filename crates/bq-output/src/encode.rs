// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Event encoding.
//!
//! Column names may not contain `@`, so the leading sigil is stripped from
//! every key (recursively through nested objects) before the event is
//! serialized to a compact JSON line.

use crate::batcher::Message;
use serde_json::{Map, Value};

/// Reserved leading character removed from field names.
pub const SIGIL: char = '@';

/// Strip the leading sigil from every object key.
///
/// Only keys change. Non-object values, arrays included, are returned as-is.
pub fn strip_sigil_keys(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut out = Map::with_capacity(map.len());
            for (key, value) in map {
                let key = key.trim_start_matches(SIGIL).to_string();
                out.insert(key, strip_sigil_keys(value));
            }
            Value::Object(out)
        }
        other => other,
    }
}

/// Sanitize and serialize an event into a batchable message.
pub fn encode_event(event: Value) -> Result<Message, serde_json::Error> {
    let sanitized = strip_sigil_keys(event);
    serde_json::to_string(&sanitized).map(Message::new)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_strip_top_level_key() {
        assert_eq!(strip_sigil_keys(json!({"@foo": "bar"})), json!({"foo": "bar"}));
    }

    #[test]
    fn test_values_untouched() {
        let event = json!({"foo": "@bar"});
        assert_eq!(strip_sigil_keys(event.clone()), event);
    }

    #[test]
    fn test_strip_nested_keys() {
        assert_eq!(
            strip_sigil_keys(json!({"@foo": "bar", "nested": {"@x": 1}})),
            json!({"foo": "bar", "nested": {"x": 1}})
        );
    }

    #[test]
    fn test_structure_preserved() {
        let event = json!({
            "@timestamp": "2012-09-08T07:06:00Z",
            "tags": ["@a", {"@b": 1}],
            "count": 3,
            "ok": true,
            "none": null
        });
        assert_eq!(
            strip_sigil_keys(event),
            json!({
                "timestamp": "2012-09-08T07:06:00Z",
                "tags": ["@a", {"@b": 1}],
                "count": 3,
                "ok": true,
                "none": null
            })
        );
    }

    #[test]
    fn test_scalar_passthrough() {
        assert_eq!(strip_sigil_keys(json!("@x")), json!("@x"));
        assert_eq!(strip_sigil_keys(json!(42)), json!(42));
    }

    #[test]
    fn test_encode_event() {
        let message = encode_event(json!({"@version": "1", "message": "hi"})).expect("encode");
        let decoded: Value = serde_json::from_str(message.as_str()).expect("decode");
        assert_eq!(decoded, json!({"version": "1", "message": "hi"}));
        assert_eq!(message.len(), message.as_str().len());
    }
}
