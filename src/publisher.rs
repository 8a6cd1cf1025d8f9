//! Publishing pipeline: envelope construction, validation, batch fan-out,
//! and the outbox handoff.
//!
//! In direct mode a publish is acked by the broker before the call returns.
//! In outbox mode the call returns once the outbox insert commits; the
//! worker in [`crate::outbox`] performs the broker publish later and the
//! insert wakes it immediately, so the poll interval only bounds recovery,
//! not the happy path.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::Notify;
use tracing::{debug, info};

use crate::config::PublisherConfig;
use crate::connection::ConnectionManager;
use crate::envelope::{Envelope, EnvelopeOptions};
use crate::error::{Error, Result};
use crate::repository::{NewOutboxRecord, OutboxRepository};
use crate::subject;

/// Broker header carrying the deduplication id.
pub const MSG_ID_HEADER: &str = "Nats-Msg-Id";
/// Broker header stamping the publish instant, for audit.
pub const PUBLISHED_AT_HEADER: &str = "Nats-Published-At";

/// Per-call publish options.
#[derive(Debug, Clone, Default)]
pub struct PublishOptions {
    /// Explicit event id; generated when absent.
    pub event_id: Option<String>,
    /// Explicit occurrence instant; `now` when absent.
    pub occurred_at: Option<chrono::DateTime<chrono::Utc>>,
    /// Caller metadata merged into the envelope.
    pub metadata: Option<serde_json::Map<String, Value>>,
    /// Operator headers passed through to the broker unchanged.
    pub headers: HashMap<String, String>,
}

/// Outcome of a single publish.
#[derive(Debug, Clone)]
pub struct PublishResult {
    pub event_id: String,
    pub subject: String,
    /// Stream that captured the message; absent in outbox mode.
    pub stream: Option<String>,
    /// Stream sequence of the captured message; absent in outbox mode.
    pub sequence: Option<u64>,
    /// Whether the broker suppressed the message as a duplicate.
    pub duplicate: bool,
    /// Whether the publish was handed to the outbox instead of the broker.
    pub outboxed: bool,
}

/// Outcome of a multi-topic fan-out.
#[derive(Debug)]
pub struct MultiPublishResult {
    /// Event id shared by every fan-out leg.
    pub event_id: String,
    pub results: Vec<(String, Result<PublishResult>)>,
}

impl MultiPublishResult {
    pub fn all_ok(&self) -> bool {
        self.results.iter().all(|(_, r)| r.is_ok())
    }
}

/// Outcome of a batch publish.
#[derive(Debug)]
pub struct BatchResult {
    pub count: usize,
    pub success_count: usize,
    pub failure_count: usize,
    /// Per-item results in insertion order.
    pub results: Vec<Result<PublishResult>>,
}

/// Declarative publisher bound to one `{env}.{app}` identity.
#[derive(Clone)]
pub struct Publisher {
    env: String,
    app: String,
    config: PublisherConfig,
    connection: Arc<ConnectionManager>,
    outbox: Option<Arc<dyn OutboxRepository>>,
    outbox_notify: Arc<Notify>,
}

impl Publisher {
    pub(crate) fn new(
        env: String,
        app: String,
        config: PublisherConfig,
        connection: Arc<ConnectionManager>,
        outbox: Option<Arc<dyn OutboxRepository>>,
        outbox_notify: Arc<Notify>,
    ) -> Self {
        Self {
            env,
            app,
            config,
            connection,
            outbox,
            outbox_notify,
        }
    }

    /// Publish one message to one topic.
    pub async fn publish(
        &self,
        topic: &str,
        message: Value,
        opts: PublishOptions,
    ) -> Result<PublishResult> {
        let prepared = self.prepare(topic, message, &opts)?;
        self.dispatch(prepared).await
    }

    /// Fan one message out to several topics under a single event id.
    ///
    /// Callers wanting distinct ids per topic should publish per topic
    /// instead.
    pub async fn publish_many(
        &self,
        topics: &[&str],
        message: Value,
        mut opts: PublishOptions,
    ) -> Result<MultiPublishResult> {
        let event_id = opts
            .event_id
            .take()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let occurred_at = opts.occurred_at.take().unwrap_or_else(chrono::Utc::now);

        let mut results = Vec::with_capacity(topics.len());
        for topic in topics {
            let leg = PublishOptions {
                event_id: Some(event_id.clone()),
                occurred_at: Some(occurred_at),
                metadata: opts.metadata.clone(),
                headers: opts.headers.clone(),
            };
            let result = match self.prepare(topic, message.clone(), &leg) {
                Ok(prepared) => self.dispatch(prepared).await,
                Err(e) => Err(e),
            };
            results.push((topic.to_string(), result));
        }
        Ok(MultiPublishResult { event_id, results })
    }

    /// Start accumulating a batch.
    pub fn batch(&self) -> PublishBatch {
        PublishBatch {
            publisher: self.clone(),
            items: Vec::new(),
        }
    }

    /// Validate the topic, build the envelope, and enforce the size limit.
    fn prepare(&self, topic: &str, message: Value, opts: &PublishOptions) -> Result<Prepared> {
        let subject = subject::compose(&self.env, &self.app, topic)?;
        let envelope = Envelope::build(
            message,
            EnvelopeOptions {
                event_id: opts.event_id.clone(),
                occurred_at: opts.occurred_at,
                metadata: opts.metadata.clone(),
            },
        );
        let payload = envelope.to_bytes()?;
        if payload.len() > self.config.max_payload_bytes {
            return Err(Error::Publish(format!(
                "payload is {} bytes, limit is {}",
                payload.len(),
                self.config.max_payload_bytes
            )));
        }
        Ok(Prepared {
            subject,
            envelope,
            payload,
            headers: opts.headers.clone(),
        })
    }

    async fn dispatch(&self, prepared: Prepared) -> Result<PublishResult> {
        if self.config.use_outbox {
            self.dispatch_outbox(prepared).await
        } else {
            self.dispatch_direct(prepared).await
        }
    }

    /// Persist the publish; the worker drains it into the broker later.
    async fn dispatch_outbox(&self, prepared: Prepared) -> Result<PublishResult> {
        let outbox = self
            .outbox
            .as_ref()
            .ok_or_else(|| Error::Config("outbox mode is on but no outbox repository is set".into()))?;

        let record = NewOutboxRecord {
            event_id: prepared.envelope.event_id.clone(),
            subject: prepared.subject.clone(),
            payload: prepared.payload,
            headers: if prepared.headers.is_empty() {
                None
            } else {
                Some(prepared.headers)
            },
        };
        outbox.find_or_create(&record).await?;
        self.outbox_notify.notify_one();

        debug!(
            event_id = %prepared.envelope.event_id,
            subject = %prepared.subject,
            "publish handed to outbox"
        );
        Ok(PublishResult {
            event_id: prepared.envelope.event_id,
            subject: prepared.subject,
            stream: None,
            sequence: None,
            duplicate: false,
            outboxed: true,
        })
    }

    /// Publish straight to the broker with a bounded timeout.
    async fn dispatch_direct(&self, prepared: Prepared) -> Result<PublishResult> {
        let _slot = self
            .connection
            .reserve_publish_slot(self.config.publish_timeout)
            .await?;
        let js = self.connection.jetstream().await?;
        let headers = broker_headers(&prepared.envelope, &prepared.headers);

        let ack = tokio::time::timeout(self.config.publish_timeout, async {
            js.publish_with_headers(prepared.subject.clone(), headers, prepared.payload.into())
                .await
                .map_err(|e| Error::Publish(e.to_string()))?
                .await
                .map_err(|e| Error::Publish(e.to_string()))
        })
        .await
        .map_err(|_| Error::PublishTimeout(self.config.publish_timeout))??;

        info!(
            event_id = %prepared.envelope.event_id,
            subject = %prepared.subject,
            stream = %ack.stream,
            sequence = ack.sequence,
            duplicate = ack.duplicate,
            "message published"
        );
        Ok(PublishResult {
            event_id: prepared.envelope.event_id,
            subject: prepared.subject,
            stream: Some(ack.stream),
            sequence: Some(ack.sequence),
            duplicate: ack.duplicate,
            outboxed: false,
        })
    }
}

impl Publisher {
    /// Pipeline one subject group: put every publish in flight, then await
    /// the acks in order.
    async fn dispatch_direct_group(
        &self,
        items: Vec<(usize, Prepared)>,
    ) -> Vec<(usize, Result<PublishResult>)> {
        let mut settled = Vec::with_capacity(items.len());

        let gate = match self.connection.reserve_publish_slot(self.config.publish_timeout).await {
            Ok(slot) => slot,
            Err(e) => {
                let text = e.to_string();
                return items
                    .into_iter()
                    .map(|(index, _)| (index, Err(Error::Publish(text.clone()))))
                    .collect();
            }
        };
        let js = match self.connection.jetstream().await {
            Ok(js) => js,
            Err(e) => {
                let text = e.to_string();
                return items
                    .into_iter()
                    .map(|(index, _)| (index, Err(Error::Connection(text.clone()))))
                    .collect();
            }
        };

        let mut in_flight = Vec::with_capacity(items.len());
        for (index, prepared) in items {
            let headers = broker_headers(&prepared.envelope, &prepared.headers);
            match js
                .publish_with_headers(prepared.subject.clone(), headers, prepared.payload.into())
                .await
            {
                Ok(ack) => in_flight.push((index, prepared.envelope.event_id, prepared.subject, ack)),
                Err(e) => settled.push((index, Err(Error::Publish(e.to_string())))),
            }
        }

        for (index, event_id, subject, ack) in in_flight {
            let result = match tokio::time::timeout(self.config.publish_timeout, ack).await {
                Ok(Ok(ack)) => Ok(PublishResult {
                    event_id,
                    subject,
                    stream: Some(ack.stream),
                    sequence: Some(ack.sequence),
                    duplicate: ack.duplicate,
                    outboxed: false,
                }),
                Ok(Err(e)) => Err(Error::Publish(e.to_string())),
                Err(_) => Err(Error::PublishTimeout(self.config.publish_timeout)),
            };
            settled.push((index, result));
        }
        drop(gate);
        settled
    }
}

/// Headers attached to every direct broker publish.
pub(crate) fn broker_headers(
    envelope: &Envelope,
    custom: &HashMap<String, String>,
) -> async_nats::HeaderMap {
    let mut headers = async_nats::HeaderMap::new();
    headers.insert(MSG_ID_HEADER, envelope.event_id.as_str());
    headers.insert(
        PUBLISHED_AT_HEADER,
        chrono::Utc::now().to_rfc3339().as_str(),
    );
    for (key, value) in custom {
        headers.insert(key.as_str(), value.as_str());
    }
    headers
}

struct Prepared {
    subject: String,
    envelope: Envelope,
    payload: Vec<u8>,
    headers: HashMap<String, String>,
}

/// Accumulates `(topic, message, opts)` tuples for a grouped publish.
pub struct PublishBatch {
    publisher: Publisher,
    items: Vec<(String, Value, PublishOptions)>,
}

impl PublishBatch {
    pub fn add(mut self, topic: impl Into<String>, message: Value, opts: PublishOptions) -> Self {
        self.items.push((topic.into(), message, opts));
        self
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Publish every accumulated item, grouped by subject.
    ///
    /// Items within one subject keep their insertion order; ordering across
    /// subjects in a mixed batch is undefined. In direct mode all publishes
    /// of a group are in flight before the first ack is awaited. Failures
    /// are per-item and do not abort the rest of the batch.
    pub async fn publish(self) -> BatchResult {
        let count = self.items.len();
        let mut results: Vec<Option<Result<PublishResult>>> = Vec::new();
        results.resize_with(count, || None);

        // Prepare everything first so envelope errors are attributed to the
        // right item, then group the survivors by subject.
        let mut groups: HashMap<String, Vec<(usize, Prepared)>> = HashMap::new();
        for (index, (topic, message, opts)) in self.items.into_iter().enumerate() {
            match self.publisher.prepare(&topic, message, &opts) {
                Ok(prepared) => groups
                    .entry(prepared.subject.clone())
                    .or_default()
                    .push((index, prepared)),
                Err(e) => results[index] = Some(Err(e)),
            }
        }

        for (_, items) in groups {
            if self.publisher.config.use_outbox {
                for (index, prepared) in items {
                    results[index] = Some(self.publisher.dispatch_outbox(prepared).await);
                }
            } else {
                for (index, result) in self.publisher.dispatch_direct_group(items).await {
                    results[index] = Some(result);
                }
            }
        }

        let results: Vec<Result<PublishResult>> = results
            .into_iter()
            .map(|r| r.unwrap_or_else(|| Err(Error::Publish("item was not attempted".into()))))
            .collect();
        let success_count = results.iter().filter(|r| r.is_ok()).count();
        BatchResult {
            count,
            success_count,
            failure_count: count - success_count,
            results,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConnectionConfig;
    use crate::repository::memory::MemoryOutboxRepository;
    use crate::repository::OutboxStatus;
    use serde_json::json;

    fn outbox_publisher(repo: Arc<MemoryOutboxRepository>) -> Publisher {
        Publisher::new(
            "test".into(),
            "orders".into(),
            PublisherConfig {
                use_outbox: true,
                ..PublisherConfig::default()
            },
            Arc::new(ConnectionManager::new(ConnectionConfig::default())),
            Some(repo),
            Arc::new(Notify::new()),
        )
    }

    #[tokio::test]
    async fn outbox_publish_persists_pending_row() {
        let repo = Arc::new(MemoryOutboxRepository::new());
        let publisher = outbox_publisher(repo.clone());

        let result = publisher
            .publish("order.created", json!({"order_id": "O-2"}), PublishOptions::default())
            .await
            .unwrap();

        assert!(result.outboxed);
        assert_eq!(result.subject, "test.orders.order.created");
        let pending = repo.find_pending(10).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].status, OutboxStatus::Pending);
        assert_eq!(pending[0].event_id, result.event_id);

        let envelope = Envelope::from_bytes(&pending[0].payload).unwrap();
        assert_eq!(envelope.message["order_id"], "O-2");
    }

    #[tokio::test]
    async fn outbox_publish_is_idempotent_per_event_id() {
        let repo = Arc::new(MemoryOutboxRepository::new());
        let publisher = outbox_publisher(repo.clone());
        let opts = PublishOptions {
            event_id: Some("E-77".into()),
            ..Default::default()
        };

        publisher.publish("order.created", json!({}), opts.clone()).await.unwrap();
        publisher.publish("order.created", json!({}), opts).await.unwrap();

        assert_eq!(repo.find_pending(10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn invalid_topic_is_rejected_before_any_side_effect() {
        let repo = Arc::new(MemoryOutboxRepository::new());
        let publisher = outbox_publisher(repo.clone());

        let err = publisher
            .publish("Order.Created", json!({}), PublishOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Subject(_)));
        assert!(repo.find_pending(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn oversized_payload_is_rejected() {
        let repo = Arc::new(MemoryOutboxRepository::new());
        let mut publisher = outbox_publisher(repo);
        publisher.config.max_payload_bytes = 64;

        let err = publisher
            .publish(
                "order.created",
                json!({"blob": "x".repeat(256)}),
                PublishOptions::default(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Publish(_)));
    }

    #[tokio::test]
    async fn publish_many_shares_one_event_id() {
        let repo = Arc::new(MemoryOutboxRepository::new());
        let publisher = outbox_publisher(repo.clone());

        let result = publisher
            .publish_many(
                &["order.created", "audit.order"],
                json!({"order_id": "O-3"}),
                PublishOptions::default(),
            )
            .await
            .unwrap();

        assert!(result.all_ok());
        let pending = repo.find_pending(10).await.unwrap();
        assert_eq!(pending.len(), 2);
        // Fan-out legs share the event id but land on distinct subjects, so
        // one leg per subject survives broker deduplication.
        assert!(pending.iter().all(|r| r.event_id == result.event_id));
    }

    #[tokio::test]
    async fn batch_reports_per_item_results() {
        let repo = Arc::new(MemoryOutboxRepository::new());
        let publisher = outbox_publisher(repo.clone());

        let batch = publisher
            .batch()
            .add("order.created", json!({"n": 1}), PublishOptions::default())
            .add("BAD TOPIC", json!({"n": 2}), PublishOptions::default())
            .add("order.updated", json!({"n": 3}), PublishOptions::default());
        assert_eq!(batch.len(), 3);

        let result = batch.publish().await;
        assert_eq!(result.count, 3);
        assert_eq!(result.success_count, 2);
        assert_eq!(result.failure_count, 1);
        assert!(result.results[0].is_ok());
        assert!(result.results[1].is_err());
        assert!(result.results[2].is_ok());
    }

    #[tokio::test]
    async fn headers_are_persisted_verbatim() {
        let repo = Arc::new(MemoryOutboxRepository::new());
        let publisher = outbox_publisher(repo.clone());
        let mut headers = HashMap::new();
        headers.insert("x-operator".to_string(), "replay-tool".to_string());

        publisher
            .publish(
                "order.created",
                json!({}),
                PublishOptions { headers, ..Default::default() },
            )
            .await
            .unwrap();

        let pending = repo.find_pending(1).await.unwrap();
        assert_eq!(
            pending[0].headers.as_ref().unwrap()["x-operator"],
            "replay-tool"
        );
    }
}
