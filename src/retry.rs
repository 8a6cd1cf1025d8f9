//! Failure classification, retry backoff, and dead-letter routing.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::envelope::Envelope;

/// Failure classes an error can fall into. `Permanent` and `Validation`
/// skip retries entirely; the rest retry until `max_deliver`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Transient,
    Permanent,
    Validation,
    Infrastructure,
}

/// Injectable classification predicate.
pub type Classifier = dyn Fn(&anyhow::Error) -> ErrorClass + Send + Sync;

/// What the runtime should do with a failed delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    /// `nak` with the given redelivery delay.
    Retry { delay: Duration },
    /// Publish a dead-letter envelope, then ack the original.
    DeadLetter,
}

/// Envelope published to the DLQ subject when retries are exhausted or the
/// failure is classified permanent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetterEnvelope {
    pub event_id: String,
    pub original_subject: String,
    /// The original envelope, untouched.
    pub event: Envelope,
    pub metadata: Map<String, Value>,
    pub error: String,
    pub deliveries: i64,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

impl DeadLetterEnvelope {
    pub fn new(envelope: &Envelope, subject: &str, error: &str, deliveries: i64) -> Self {
        Self {
            event_id: envelope.event_id.clone(),
            original_subject: subject.to_string(),
            metadata: envelope.metadata.clone(),
            event: envelope.clone(),
            error: error.to_string(),
            deliveries,
            first_seen: envelope.occurred_at,
            last_seen: Utc::now(),
        }
    }
}

/// Default classification heuristics: connection/timeout/5xx patterns are
/// transient, schema/validation patterns are permanent.
pub fn default_classifier(error: &anyhow::Error) -> ErrorClass {
    let text = format!("{error:#}").to_lowercase();
    if ["validation", "schema", "malformed", "unprocessable"]
        .iter()
        .any(|p| text.contains(p))
    {
        return ErrorClass::Validation;
    }
    if ["connection", "timeout", "timed out", "unavailable", "500", "502", "503", "504"]
        .iter()
        .any(|p| text.contains(p))
    {
        return ErrorClass::Transient;
    }
    ErrorClass::Infrastructure
}

const MAX_EXTENDED_BACKOFF: Duration = Duration::from_secs(60);

/// Decides between redelivery and dead-lettering for failed handler
/// invocations.
pub struct RetryEngine {
    schedule: Vec<Duration>,
    max_deliver: i64,
    pub(crate) classifier: Arc<Classifier>,
}

impl RetryEngine {
    pub fn new(schedule: Vec<Duration>, max_deliver: i64) -> Self {
        Self {
            schedule,
            max_deliver,
            classifier: Arc::new(default_classifier),
        }
    }

    /// Replace the default classification heuristics.
    pub fn with_classifier(
        mut self,
        classifier: impl Fn(&anyhow::Error) -> ErrorClass + Send + Sync + 'static,
    ) -> Self {
        self.classifier = Arc::new(classifier);
        self
    }

    pub fn classify(&self, error: &anyhow::Error) -> ErrorClass {
        (self.classifier)(error)
    }

    /// Route a failure given the broker-reported delivery count.
    pub fn disposition(&self, error: &anyhow::Error, deliveries: i64) -> Disposition {
        match self.classify(error) {
            ErrorClass::Permanent | ErrorClass::Validation => Disposition::DeadLetter,
            _ if deliveries >= self.max_deliver => Disposition::DeadLetter,
            _ => Disposition::Retry {
                delay: self.backoff_delay(deliveries),
            },
        }
    }

    /// Delay before the next delivery attempt. Indexes the schedule by
    /// `deliveries - 1`; past the end the last entry doubles per attempt,
    /// capped at 60s.
    pub fn backoff_delay(&self, deliveries: i64) -> Duration {
        let attempt = deliveries.max(1) as usize - 1;
        if self.schedule.is_empty() {
            return Duration::from_secs(1);
        }
        if attempt < self.schedule.len() {
            return self.schedule[attempt];
        }
        let last = self.schedule[self.schedule.len() - 1];
        let extra = (attempt - self.schedule.len() + 1).min(31) as u32;
        last.saturating_mul(2u32.saturating_pow(extra)).min(MAX_EXTENDED_BACKOFF)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::default_backoff_schedule;
    use crate::envelope::EnvelopeOptions;
    use serde_json::json;

    fn engine() -> RetryEngine {
        RetryEngine::new(default_backoff_schedule(), 5)
    }

    #[test]
    fn schedule_indexing_and_extension() {
        let engine = engine();
        assert_eq!(engine.backoff_delay(1), Duration::from_secs(1));
        assert_eq!(engine.backoff_delay(2), Duration::from_secs(2));
        assert_eq!(engine.backoff_delay(3), Duration::from_secs(5));
        assert_eq!(engine.backoff_delay(4), Duration::from_secs(10));
        assert_eq!(engine.backoff_delay(5), Duration::from_secs(30));
        // Past the schedule the last entry doubles, capped at 60s.
        assert_eq!(engine.backoff_delay(6), Duration::from_secs(60));
        assert_eq!(engine.backoff_delay(20), Duration::from_secs(60));
    }

    #[test]
    fn transient_errors_retry_until_exhausted() {
        let engine = engine();
        let err = anyhow::anyhow!("connection refused");
        assert_eq!(
            engine.disposition(&err, 1),
            Disposition::Retry { delay: Duration::from_secs(1) }
        );
        assert_eq!(engine.disposition(&err, 5), Disposition::DeadLetter);
    }

    #[test]
    fn validation_errors_skip_retries() {
        let engine = engine();
        let err = anyhow::anyhow!("schema validation failed for field total");
        assert_eq!(engine.disposition(&err, 1), Disposition::DeadLetter);
    }

    #[test]
    fn injected_classifier_wins() {
        let engine = engine().with_classifier(|_| ErrorClass::Permanent);
        let err = anyhow::anyhow!("connection refused");
        assert_eq!(engine.disposition(&err, 1), Disposition::DeadLetter);
    }

    #[test]
    fn default_heuristics() {
        assert_eq!(default_classifier(&anyhow::anyhow!("request timed out")), ErrorClass::Transient);
        assert_eq!(default_classifier(&anyhow::anyhow!("upstream 503")), ErrorClass::Transient);
        assert_eq!(
            default_classifier(&anyhow::anyhow!("schema mismatch")),
            ErrorClass::Validation
        );
        assert_eq!(
            default_classifier(&anyhow::anyhow!("disk corrupted")),
            ErrorClass::Infrastructure
        );
    }

    #[test]
    fn dead_letter_envelope_carries_original() {
        let envelope = Envelope::build(
            json!({"order_id": "O-1"}),
            EnvelopeOptions { event_id: Some("E-9".into()), ..Default::default() },
        );
        let dlq = DeadLetterEnvelope::new(&envelope, "test.orders.order.created", "boom", 3);
        assert_eq!(dlq.event_id, "E-9");
        assert_eq!(dlq.deliveries, 3);
        assert_eq!(dlq.event, envelope);
        assert_eq!(dlq.first_seen, envelope.occurred_at);
    }
}
