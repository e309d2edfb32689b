//! Content identifiers used to recognise repeated submissions of one error.
//!
//! The identifier only depends on the parts of an event that describe the
//! error itself (explicit fingerprint, exception types and frames, message),
//! so resubmissions with a new `event_id` or `timestamp` collapse together.

use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

const DEFAULT_FINGERPRINT: &str = "{{ default }}";

// Fields that differ between two submissions of the same error.
const VOLATILE_FIELDS: &[&str] = &["event_id", "timestamp", "sent_at", "received"];

#[derive(thiserror::Error, Debug)]
pub enum GroupingError {
    #[error("event payload is not valid JSON: {0}")]
    InvalidPayload(#[from] serde_json::Error),

    #[error("event payload is not a JSON object")]
    NotAnObject,
}

/// Deterministic content to identifier function.
pub trait GroupingOracle: Send + Sync {
    fn hash(&self, body: &[u8]) -> Result<String, GroupingError>;
}

/// Groups Sentry event payloads.
#[derive(Debug, Clone, Copy, Default)]
pub struct EventGrouping;

impl GroupingOracle for EventGrouping {
    fn hash(&self, body: &[u8]) -> Result<String, GroupingError> {
        let event: Value = serde_json::from_slice(body)?;
        let event = event.as_object().ok_or(GroupingError::NotAnObject)?;

        let mut components = Components::default();
        if !(fingerprint(event, &mut components)
            || exceptions(event, &mut components)
            || stacktrace(event.get("stacktrace"), &mut components)
            || message(event, &mut components))
        {
            whole_event(event, &mut components);
        }

        Ok(components.finalize())
    }
}

#[derive(Default)]
struct Components {
    hasher: Sha256,
}

impl Components {
    fn push(&mut self, component: &str) {
        self.hasher.update(component.as_bytes());
        self.hasher.update([0u8]);
    }

    fn finalize(self) -> String {
        format!("{:x}", self.hasher.finalize())
    }
}

fn fingerprint(event: &Map<String, Value>, components: &mut Components) -> bool {
    let Some(parts) = event.get("fingerprint").and_then(Value::as_array) else {
        return false;
    };
    let parts: Vec<&str> = parts.iter().filter_map(Value::as_str).collect();
    if parts.is_empty() || parts == [DEFAULT_FINGERPRINT] {
        return false;
    }

    components.push("fingerprint");
    for part in parts {
        components.push(part);
    }
    true
}

fn exceptions(event: &Map<String, Value>, components: &mut Components) -> bool {
    // Either {"values": [...]} or a bare list, depending on the client
    let values = match event.get("exception") {
        Some(Value::Object(exception)) => exception.get("values").and_then(Value::as_array),
        Some(Value::Array(values)) => Some(values),
        _ => None,
    };
    let Some(values) = values.filter(|values| !values.is_empty()) else {
        return false;
    };

    components.push("exception");
    for exception in values {
        components.push(str_field(exception, "type"));
        if !stacktrace(exception.get("stacktrace"), components) {
            components.push(str_field(exception, "value"));
        }
    }
    true
}

fn stacktrace(stacktrace: Option<&Value>, components: &mut Components) -> bool {
    let Some(frames) = stacktrace
        .and_then(|s| s.get("frames"))
        .and_then(Value::as_array)
        .filter(|frames| !frames.is_empty())
    else {
        return false;
    };

    // Only in-app frames are considered when the client marked any
    let in_app: Vec<&Value> = frames
        .iter()
        .filter(|frame| frame.get("in_app").and_then(Value::as_bool) == Some(true))
        .collect();
    let frames: Vec<&Value> = if in_app.is_empty() {
        frames.iter().collect()
    } else {
        in_app
    };

    for frame in frames {
        let location = frame
            .get("module")
            .and_then(Value::as_str)
            .unwrap_or_else(|| str_field(frame, "filename"));
        components.push(location);
        components.push(str_field(frame, "function"));
    }
    true
}

fn message(event: &Map<String, Value>, components: &mut Components) -> bool {
    let message = event
        .get("logentry")
        .and_then(message_text)
        .or_else(|| event.get("message").and_then(message_text));

    match message {
        Some(message) => {
            components.push("message");
            components.push(message);
            true
        }
        None => false,
    }
}

fn message_text(value: &Value) -> Option<&str> {
    let message = match value {
        Value::String(message) => Some(message.as_str()),
        Value::Object(entry) => entry
            .get("message")
            .or_else(|| entry.get("formatted"))
            .and_then(Value::as_str),
        _ => None,
    };
    message.filter(|message| !message.is_empty())
}

fn whole_event(event: &Map<String, Value>, components: &mut Components) {
    // serde_json keeps object keys sorted, so the rendering is canonical
    let stable: Map<String, Value> = event
        .iter()
        .filter(|(key, _)| !VOLATILE_FIELDS.contains(&key.as_str()))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect();
    components.push("event");
    components.push(&Value::Object(stable).to_string());
}

fn str_field<'a>(value: &'a Value, field: &str) -> &'a str {
    value.get(field).and_then(Value::as_str).unwrap_or("")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::body::decode_body;
    use hyper::body::Bytes;
    use serde_json::json;

    fn hash(value: Value) -> String {
        EventGrouping
            .hash(value.to_string().as_bytes())
            .expect("groupable event")
    }

    #[test]
    fn test_hash_is_deterministic_hex() {
        let event = json!({"message": "boom"});
        let first = hash(event.clone());
        assert_eq!(first, hash(event));
        assert_eq!(first.len(), 64);
        assert!(first.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_volatile_fields_are_ignored() {
        let first = hash(json!({
            "event_id": "a",
            "timestamp": "2024-01-01T00:00:00Z",
            "message": "boom",
        }));
        let second = hash(json!({
            "event_id": "b",
            "timestamp": "2024-01-02T00:00:00Z",
            "message": "boom",
        }));
        assert_eq!(first, second);

        // Also without any grouping component
        let first = hash(json!({"event_id": "a", "extra": {"k": 1}}));
        let second = hash(json!({"event_id": "b", "extra": {"k": 1}}));
        assert_eq!(first, second);
    }

    #[test]
    fn test_different_content_differs() {
        assert_ne!(hash(json!({"message": "boom"})), hash(json!({"message": "bang"})));
        assert_ne!(hash(json!({"a": 1})), hash(json!({"a": 2})));
    }

    #[test]
    fn test_exception_frames_take_precedence_over_value() {
        let event = |value: &str, function: &str| {
            json!({
                "exception": {"values": [{
                    "type": "ValueError",
                    "value": value,
                    "stacktrace": {"frames": [
                        {"module": "lib.vendor", "function": "helper", "in_app": false},
                        {"module": "app.views", "function": function, "in_app": true},
                    ]},
                }]},
            })
        };

        // Same frames with a different message group together
        assert_eq!(hash(event("id 1", "index")), hash(event("id 2", "index")));
        assert_ne!(hash(event("id 1", "index")), hash(event("id 1", "detail")));
    }

    #[test]
    fn test_exception_without_frames_uses_value() {
        let first = hash(json!({"exception": [{"type": "E", "value": "one"}]}));
        let second = hash(json!({"exception": {"values": [{"type": "E", "value": "one"}]}}));
        assert_eq!(first, second);
        assert_ne!(
            first,
            hash(json!({"exception": [{"type": "E", "value": "two"}]}))
        );
    }

    #[test]
    fn test_explicit_fingerprint() {
        let first = hash(json!({"fingerprint": ["db-down"], "message": "a"}));
        let second = hash(json!({"fingerprint": ["db-down"], "message": "b"}));
        assert_eq!(first, second);

        // The default placeholder falls back to regular grouping
        assert_ne!(
            hash(json!({"fingerprint": ["{{ default }}"], "message": "a"})),
            hash(json!({"fingerprint": ["{{ default }}"], "message": "b"}))
        );
    }

    #[test]
    fn test_logentry_and_message_agree() {
        assert_eq!(
            hash(json!({"logentry": {"message": "boom %s"}})),
            hash(json!({"message": "boom %s"}))
        );
    }

    #[test]
    fn test_encoded_and_plain_bodies_group_together() {
        let plain = decode_body(Bytes::from_static(br#"{"a":1}"#));
        let encoded = decode_body(Bytes::from_static(b"eyJhIjoxfQ=="));

        assert_eq!(
            EventGrouping.hash(&plain).unwrap(),
            EventGrouping.hash(&encoded).unwrap()
        );
    }

    #[test]
    fn test_invalid_payloads() {
        assert!(matches!(
            EventGrouping.hash(b"not json"),
            Err(GroupingError::InvalidPayload(_))
        ));
        assert!(matches!(
            EventGrouping.hash(b"[1, 2]"),
            Err(GroupingError::NotAnObject)
        ));
    }
}
