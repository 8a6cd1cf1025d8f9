//! Wire envelope for every message crossing the broker.
//!
//! The envelope is a fixed JSON shape with an open `metadata` map:
//!
//! ```json
//! {
//!   "event_id": "0b8f4a12",
//!   "occurred_at": "2026-01-15T09:30:00Z",
//!   "message": { "order_id": "O-1" },
//!   "metadata": { "trace_id": "..." }
//! }
//! ```
//!
//! `event_id` doubles as the broker deduplication key and the inbox
//! idempotency key. Unknown metadata keys pass through untouched, and
//! `parse(serialize(e))` returns an envelope equal to `e`.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::correlation;
use crate::error::{Error, Result};

/// Wire representation of a single message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Envelope {
    /// Stable unique identifier; drives broker duplicate suppression and
    /// inbox deduplication.
    pub event_id: String,

    /// Instant the event occurred, RFC3339 on the wire.
    pub occurred_at: DateTime<Utc>,

    /// Opaque application payload.
    pub message: Value,

    /// Open map of correlation and caller metadata.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,
}

/// Caller-supplied knobs for [`Envelope::build`].
#[derive(Debug, Clone, Default)]
pub struct EnvelopeOptions {
    /// Explicit event id; generated when absent.
    pub event_id: Option<String>,
    /// Explicit occurrence instant; `now` when absent.
    pub occurred_at: Option<DateTime<Utc>>,
    /// Caller metadata, merged over the ambient correlation scope.
    pub metadata: Option<Map<String, Value>>,
}

impl Envelope {
    /// Build an envelope around an application payload.
    ///
    /// Stamps `event_id` and `occurred_at`, then merges caller metadata with
    /// the ambient [`correlation`] scope; caller keys take precedence.
    pub fn build(message: Value, opts: EnvelopeOptions) -> Envelope {
        let mut metadata = opts.metadata.unwrap_or_default();
        if let Some(scope) = correlation::current() {
            scope.merge_into(&mut metadata);
        }
        Envelope {
            event_id: opts.event_id.unwrap_or_else(|| Uuid::new_v4().to_string()),
            occurred_at: opts.occurred_at.unwrap_or_else(Utc::now),
            message,
            metadata,
        }
    }

    /// Serialize to the UTF-8 JSON wire form.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Parse the wire form. Unknown top-level fields are tolerated; a
    /// missing `event_id` or `message` is rejected.
    pub fn from_bytes(bytes: &[u8]) -> Result<Envelope> {
        let value: Value = serde_json::from_slice(bytes)
            .map_err(|e| Error::Envelope(format!("invalid JSON: {e}")))?;
        let map = value
            .as_object()
            .ok_or_else(|| Error::Envelope("envelope must be a JSON object".into()))?;
        match map.get("event_id") {
            Some(Value::String(id)) if !id.is_empty() => {}
            _ => return Err(Error::Envelope("missing or empty event_id".into())),
        }
        if !map.contains_key("message") || map["message"].is_null() {
            return Err(Error::Envelope("missing message".into()));
        }
        serde_json::from_value(value).map_err(|e| Error::Envelope(e.to_string()))
    }

    /// RFC3339 form of `occurred_at`, as stamped into broker headers.
    pub fn occurred_at_rfc3339(&self) -> String {
        self.occurred_at.to_rfc3339_opts(SecondsFormat::Millis, true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn build_stamps_id_and_instant() {
        let env = Envelope::build(json!({"order_id": "O-1"}), EnvelopeOptions::default());
        assert!(!env.event_id.is_empty());
        assert_eq!(env.message["order_id"], "O-1");
        assert!(env.metadata.is_empty());
    }

    #[test]
    fn build_honors_explicit_id() {
        let env = Envelope::build(
            json!({}),
            EnvelopeOptions {
                event_id: Some("E-77".into()),
                ..Default::default()
            },
        );
        assert_eq!(env.event_id, "E-77");
    }

    #[test]
    fn round_trip_preserves_everything() {
        let mut metadata = Map::new();
        metadata.insert("tenant_id".into(), json!("acme"));
        metadata.insert("custom-key".into(), json!({"nested": [1, 2, 3]}));
        let env = Envelope::build(
            json!({"b_second": 2, "a_first": 1}),
            EnvelopeOptions {
                event_id: Some("E-1".into()),
                metadata: Some(metadata),
                ..Default::default()
            },
        );

        let parsed = Envelope::from_bytes(&env.to_bytes().unwrap()).unwrap();
        assert_eq!(parsed, env);
        // Application key order survives serialization.
        let keys: Vec<&String> = parsed.message.as_object().unwrap().keys().collect();
        assert_eq!(keys, ["b_second", "a_first"]);
    }

    #[test]
    fn parse_tolerates_unknown_top_level_fields() {
        let bytes = br#"{"event_id":"E-2","occurred_at":"2026-01-01T00:00:00Z","message":{},"future_field":true}"#;
        let env = Envelope::from_bytes(bytes).unwrap();
        assert_eq!(env.event_id, "E-2");
    }

    #[test]
    fn parse_rejects_missing_fields() {
        let missing_id = br#"{"occurred_at":"2026-01-01T00:00:00Z","message":{}}"#;
        assert!(matches!(Envelope::from_bytes(missing_id), Err(Error::Envelope(_))));

        let missing_message = br#"{"event_id":"E-3","occurred_at":"2026-01-01T00:00:00Z"}"#;
        assert!(matches!(Envelope::from_bytes(missing_message), Err(Error::Envelope(_))));

        let null_message = br#"{"event_id":"E-4","occurred_at":"2026-01-01T00:00:00Z","message":null}"#;
        assert!(matches!(Envelope::from_bytes(null_message), Err(Error::Envelope(_))));
    }

    #[tokio::test]
    async fn ambient_scope_lands_in_metadata() {
        let scope = crate::correlation::CorrelationScope {
            trace_id: Some("t-42".into()),
            ..Default::default()
        };
        let env = crate::correlation::with_scope(scope, async {
            Envelope::build(json!({}), EnvelopeOptions::default())
        })
        .await;
        assert_eq!(env.metadata["trace_id"], "t-42");
    }
}
