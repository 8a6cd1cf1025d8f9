//! Stream and durable-consumer topology management.
//!
//! Streams and consumers are declared as specs and reconciled against the
//! broker on startup: created when absent, updated in place when the change
//! is update-compatible, and rejected with a topology error otherwise.
//! Streams are never deleted here. Before any consumer starts, the overlap
//! guard verifies that no two streams (and no two bindings on different
//! streams) claim overlapping subject patterns, since the broker would
//! otherwise split deliveries between them.

use std::sync::Arc;
use std::time::Duration;

use async_nats::jetstream::{consumer, stream};
use tracing::{debug, info};

use crate::connection::ConnectionManager;
use crate::error::{Error, Result};
use crate::subject;

/// Stream retention policies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Retention {
    #[default]
    Limits,
    Interest,
    WorkQueue,
}

/// Stream storage backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Storage {
    #[default]
    File,
    Memory,
}

/// Where a new durable consumer starts reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeliverPolicy {
    #[default]
    All,
    Last,
    New,
}

/// How a consumer replays stored messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReplayPolicy {
    #[default]
    Instant,
    Original,
}

/// Declarative stream description, reconciled on startup.
#[derive(Debug, Clone)]
pub struct StreamSpec {
    pub name: String,
    /// Full subject patterns captured by the stream.
    pub subject_patterns: Vec<String>,
    pub retention: Retention,
    pub storage: Storage,
    pub replicas: usize,
    pub max_msgs: i64,
    pub max_bytes: i64,
    pub max_age: Duration,
    pub max_msg_size: i32,
    /// Broker-side duplicate suppression window for `Nats-Msg-Id`.
    pub duplicate_window: Duration,
}

impl StreamSpec {
    pub fn new(name: impl Into<String>, subject_patterns: Vec<String>) -> Self {
        Self {
            name: name.into(),
            subject_patterns,
            retention: Retention::Limits,
            storage: Storage::File,
            replicas: 1,
            max_msgs: -1,
            max_bytes: -1,
            max_age: Duration::ZERO,
            max_msg_size: -1,
            duplicate_window: Duration::from_secs(120),
        }
    }

    fn to_config(&self) -> stream::Config {
        stream::Config {
            name: self.name.clone(),
            subjects: self.subject_patterns.clone(),
            retention: match self.retention {
                Retention::Limits => stream::RetentionPolicy::Limits,
                Retention::Interest => stream::RetentionPolicy::Interest,
                Retention::WorkQueue => stream::RetentionPolicy::WorkQueue,
            },
            storage: match self.storage {
                Storage::File => stream::StorageType::File,
                Storage::Memory => stream::StorageType::Memory,
            },
            num_replicas: self.replicas,
            max_messages: self.max_msgs,
            max_bytes: self.max_bytes,
            max_age: self.max_age,
            max_message_size: self.max_msg_size,
            duplicate_window: self.duplicate_window,
            ..Default::default()
        }
    }
}

/// Declarative durable-consumer description. Ack policy is always explicit.
#[derive(Debug, Clone)]
pub struct ConsumerSpec {
    pub durable_name: String,
    /// Full subject patterns the consumer filters on.
    pub filter_subjects: Vec<String>,
    pub deliver_policy: DeliverPolicy,
    pub ack_wait: Duration,
    pub max_deliver: i64,
    pub max_ack_pending: i64,
    pub replay_policy: ReplayPolicy,
    /// Broker-side redelivery backoff, mirroring the retry schedule.
    pub backoff_schedule: Vec<Duration>,
}

impl ConsumerSpec {
    fn to_config(&self) -> consumer::pull::Config {
        let mut config = consumer::pull::Config {
            durable_name: Some(self.durable_name.clone()),
            ack_policy: consumer::AckPolicy::Explicit,
            deliver_policy: match self.deliver_policy {
                DeliverPolicy::All => consumer::DeliverPolicy::All,
                DeliverPolicy::Last => consumer::DeliverPolicy::Last,
                DeliverPolicy::New => consumer::DeliverPolicy::New,
            },
            replay_policy: match self.replay_policy {
                ReplayPolicy::Instant => consumer::ReplayPolicy::Instant,
                ReplayPolicy::Original => consumer::ReplayPolicy::Original,
            },
            ack_wait: self.ack_wait,
            max_deliver: self.max_deliver,
            max_ack_pending: self.max_ack_pending,
            backoff: self.backoff_schedule.clone(),
            ..Default::default()
        };
        if self.filter_subjects.len() == 1 {
            config.filter_subject = self.filter_subjects[0].clone();
        } else {
            config.filter_subjects = self.filter_subjects.clone();
        }
        config
    }
}

/// Reconciles declared topology against the broker.
pub struct TopologyManager {
    connection: Arc<ConnectionManager>,
}

impl TopologyManager {
    pub fn new(connection: Arc<ConnectionManager>) -> Self {
        Self { connection }
    }

    /// Create the stream if absent, otherwise update it in place. A change
    /// the broker cannot apply in place (storage or retention) is a
    /// topology error, not a silent migration.
    pub async fn ensure_stream(&self, spec: &StreamSpec) -> Result<()> {
        let js = self.connection.jetstream().await?;
        let config = spec.to_config();

        match js.get_stream(&spec.name).await {
            Ok(mut existing) => {
                let remote = &existing
                    .info()
                    .await
                    .map_err(|e| Error::Topology(format!("failed to inspect stream '{}': {e}", spec.name)))?
                    .config;
                if remote.storage != config.storage {
                    return Err(Error::Topology(format!(
                        "stream '{}' storage cannot change in place ({:?} -> {:?})",
                        spec.name, remote.storage, config.storage
                    )));
                }
                if remote.retention != config.retention {
                    return Err(Error::Topology(format!(
                        "stream '{}' retention cannot change in place ({:?} -> {:?})",
                        spec.name, remote.retention, config.retention
                    )));
                }
                debug!(stream = %spec.name, "stream exists, updating config");
                js.update_stream(config)
                    .await
                    .map_err(|e| Error::Topology(format!("failed to update stream '{}': {e}", spec.name)))?;
            }
            Err(_) => {
                info!(stream = %spec.name, subjects = ?spec.subject_patterns, "creating stream");
                js.create_stream(config)
                    .await
                    .map_err(|e| Error::Topology(format!("failed to create stream '{}': {e}", spec.name)))?;
            }
        }
        Ok(())
    }

    /// Create or look up the durable consumer described by the spec.
    pub async fn ensure_consumer(
        &self,
        stream_name: &str,
        spec: &ConsumerSpec,
    ) -> Result<consumer::Consumer<consumer::pull::Config>> {
        let js = self.connection.jetstream().await?;
        let stream = js
            .get_stream(stream_name)
            .await
            .map_err(|e| Error::Topology(format!("failed to get stream '{stream_name}': {e}")))?;
        let consumer = stream
            .get_or_create_consumer(&spec.durable_name, spec.to_config())
            .await
            .map_err(|e| {
                Error::Topology(format!(
                    "failed to create consumer '{}' on stream '{stream_name}': {e}",
                    spec.durable_name
                ))
            })?;
        info!(
            stream = %stream_name,
            consumer = %spec.durable_name,
            filter = ?spec.filter_subjects,
            "durable consumer ready"
        );
        Ok(consumer)
    }
}

/// Verify that no two groups on different streams claim overlapping subject
/// patterns. Each item is a stream name with the patterns bound to it;
/// overlap within one stream is allowed.
pub fn validate_no_overlap(groups: &[(String, Vec<String>)]) -> Result<()> {
    for (i, (stream_a, patterns_a)) in groups.iter().enumerate() {
        for (stream_b, patterns_b) in groups.iter().skip(i + 1) {
            if stream_a == stream_b {
                continue;
            }
            for a in patterns_a {
                for b in patterns_b {
                    if subject::matches(a, b) || subject::matches(b, a) {
                        return Err(Error::Topology(format!(
                            "subject pattern '{a}' on stream '{stream_a}' overlaps \
                             '{b}' on stream '{stream_b}'"
                        )));
                    }
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn group(stream: &str, patterns: &[&str]) -> (String, Vec<String>) {
        (stream.to_string(), patterns.iter().map(|s| s.to_string()).collect())
    }

    #[test]
    fn disjoint_streams_pass() {
        let groups = [
            group("ORDERS", &["test.orders.order.>"]),
            group("INVOICES", &["test.orders.invoice.>"]),
        ];
        assert!(validate_no_overlap(&groups).is_ok());
    }

    #[test]
    fn overlap_across_streams_is_rejected_and_names_both_patterns() {
        let groups = [
            group("A", &["test.orders.order.*"]),
            group("B", &["test.orders.order.created"]),
        ];
        let err = validate_no_overlap(&groups).unwrap_err();
        let text = err.to_string();
        assert!(text.contains("test.orders.order.*"));
        assert!(text.contains("test.orders.order.created"));
        assert!(text.contains('A') && text.contains('B'));
    }

    #[test]
    fn overlap_within_one_stream_is_allowed() {
        let groups = [
            group("ORDERS", &["test.orders.order.*"]),
            group("ORDERS", &["test.orders.order.created"]),
        ];
        assert!(validate_no_overlap(&groups).is_ok());
    }

    #[test]
    fn trailing_wildcard_overlap_is_caught() {
        let groups = [
            group("ALL", &["test.orders.>"]),
            group("SOME", &["test.orders.order.created"]),
        ];
        assert!(validate_no_overlap(&groups).is_err());
    }

    #[test]
    fn consumer_spec_single_filter_uses_scalar_field() {
        let spec = ConsumerSpec {
            durable_name: "test-orders-worker".into(),
            filter_subjects: vec!["test.orders.order.created".into()],
            deliver_policy: DeliverPolicy::All,
            ack_wait: Duration::from_secs(30),
            max_deliver: 5,
            max_ack_pending: 256,
            replay_policy: ReplayPolicy::Instant,
            backoff_schedule: vec![Duration::from_secs(1)],
        };
        let config = spec.to_config();
        assert_eq!(config.filter_subject, "test.orders.order.created");
        assert!(config.filter_subjects.is_empty());
        assert_eq!(config.ack_policy, consumer::AckPolicy::Explicit);
    }
}
