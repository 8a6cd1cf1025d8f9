//! Background worker draining the outbox store into the broker.
//!
//! The worker wakes on a fixed poll interval and whenever the publisher
//! inserts a row. Each drain cycle leases a batch of `pending` rows through
//! the atomic `mark_publishing` transition, publishes them with
//! `Nats-Msg-Id` set to the event id, and marks them `sent` on broker ack.
//! Transport failures leave the lease in place; the stale sweeper reverts
//! abandoned leases to `pending` so a later cycle (possibly in another
//! process) retries them. Multiple workers may race over the same store;
//! correctness rests entirely on the lease transition succeeding for
//! exactly one of them per record.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::OutboxConfig;
use crate::connection::ConnectionManager;
use crate::error::{Error, Result};
use crate::publisher::{MSG_ID_HEADER, PUBLISHED_AT_HEADER};
use crate::repository::{OutboxRecord, OutboxRepository};

/// Transport seam between the worker and the broker, injectable for tests.
#[async_trait]
pub trait OutboxPublisher: Send + Sync {
    /// Publish one leased record and wait for the broker ack.
    async fn publish(&self, record: &OutboxRecord) -> Result<()>;
}

/// Broker-backed transport publishing over the shared JetStream context.
pub struct JetStreamOutboxPublisher {
    connection: Arc<ConnectionManager>,
    publish_timeout: Duration,
}

impl JetStreamOutboxPublisher {
    pub fn new(connection: Arc<ConnectionManager>, publish_timeout: Duration) -> Self {
        Self {
            connection,
            publish_timeout,
        }
    }
}

#[async_trait]
impl OutboxPublisher for JetStreamOutboxPublisher {
    async fn publish(&self, record: &OutboxRecord) -> Result<()> {
        let js = self.connection.jetstream().await?;

        let mut headers = async_nats::HeaderMap::new();
        headers.insert(MSG_ID_HEADER, record.event_id.as_str());
        headers.insert(PUBLISHED_AT_HEADER, chrono::Utc::now().to_rfc3339().as_str());
        if let Some(custom) = &record.headers {
            for (key, value) in custom {
                headers.insert(key.as_str(), value.as_str());
            }
        }

        tokio::time::timeout(self.publish_timeout, async {
            js.publish_with_headers(
                record.subject.clone(),
                headers,
                record.payload.clone().into(),
            )
            .await
            .map_err(|e| Error::Publish(e.to_string()))?
            .await
            .map_err(|e| Error::Publish(e.to_string()))
        })
        .await
        .map_err(|_| Error::PublishTimeout(self.publish_timeout))??;
        Ok(())
    }
}

/// Drains pending outbox rows into the broker.
pub struct OutboxWorker {
    repository: Arc<dyn OutboxRepository>,
    publisher: Arc<dyn OutboxPublisher>,
    config: OutboxConfig,
    notify: Arc<Notify>,
}

impl OutboxWorker {
    pub fn new(
        repository: Arc<dyn OutboxRepository>,
        publisher: Arc<dyn OutboxPublisher>,
        config: OutboxConfig,
        notify: Arc<Notify>,
    ) -> Self {
        Self {
            repository,
            publisher,
            config,
            notify,
        }
    }

    /// Drain loop; runs until cancelled.
    pub async fn run(&self, cancel: CancellationToken) {
        info!(
            poll_interval = ?self.config.poll_interval,
            batch_size = self.config.batch_size,
            "outbox worker starting"
        );
        let mut poll = tokio::time::interval(self.config.poll_interval);
        poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = poll.tick() => {}
                _ = self.notify.notified() => {}
            }
            match self.drain_once().await {
                Ok(0) => debug!("no pending outbox records"),
                Ok(count) => {
                    info!(published_count = count, "drained outbox records");
                    // A full batch suggests more are waiting.
                    if count as i64 >= self.config.batch_size {
                        self.notify.notify_one();
                    }
                }
                Err(e) => error!(error = ?e, "outbox drain failed"),
            }
        }
        info!("outbox worker stopped");
    }

    /// Stale-lease and retention sweeps; runs until cancelled.
    pub async fn run_sweeper(&self, cancel: CancellationToken) {
        let mut stale = tokio::time::interval(self.config.sweep_interval);
        let mut retention = tokio::time::interval(self.config.cleanup_interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = stale.tick() => {
                    match self.repository.reset_stale(self.config.stale_after).await {
                        Ok(0) => {}
                        Ok(count) => {
                            warn!(reverted = count, "reverted stale outbox leases to pending");
                            self.notify.notify_one();
                        }
                        Err(e) => error!(error = ?e, "stale outbox sweep failed"),
                    }
                }
                _ = retention.tick() => {
                    match self.repository.cleanup(self.config.retention).await {
                        Ok(0) => {}
                        Ok(count) => debug!(deleted = count, "purged sent outbox records"),
                        Err(e) => error!(error = ?e, "outbox retention purge failed"),
                    }
                }
            }
        }
    }

    /// Lease and publish one batch. Returns the number of records sent.
    pub async fn drain_once(&self) -> Result<usize> {
        let batch = self.repository.find_pending(self.config.batch_size).await?;
        let mut sent = 0;

        for record in batch {
            // Another worker may have leased the record between the query
            // and here; losing the race is not an error.
            if !self.repository.mark_publishing(&record.event_id).await? {
                continue;
            }

            match self.publisher.publish(&record).await {
                Ok(()) => {
                    if !self.repository.mark_sent(&record.event_id).await? {
                        // The broker has the message but the row moved under
                        // us; duplicate suppression covers the redelivery.
                        warn!(
                            event_id = %record.event_id,
                            "outbox record changed state while publishing"
                        );
                    }
                    sent += 1;
                }
                Err(e) if e.is_transient() => {
                    // Leave the lease; the stale sweeper reverts it and a
                    // later cycle retries. Stop the cycle since the broker
                    // is likely unreachable for the rest too.
                    warn!(
                        event_id = %record.event_id,
                        error = %e,
                        "transient publish failure, leaving lease for stale sweep"
                    );
                    break;
                }
                Err(e) => {
                    error!(
                        event_id = %record.event_id,
                        subject = %record.subject,
                        error = %e,
                        "unrecoverable publish failure, marking record failed"
                    );
                    self.repository
                        .mark_failed(&record.event_id, &e.to_string())
                        .await?;
                }
            }
        }
        Ok(sent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::memory::MemoryOutboxRepository;
    use crate::repository::{NewOutboxRecord, OutboxStatus};
    use std::sync::Mutex;

    enum Mode {
        Ok,
        Transient,
        Permanent,
    }

    struct StubPublisher {
        mode: Mode,
        published: Mutex<Vec<String>>,
    }

    impl StubPublisher {
        fn new(mode: Mode) -> Arc<Self> {
            Arc::new(Self {
                mode,
                published: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl OutboxPublisher for StubPublisher {
        async fn publish(&self, record: &OutboxRecord) -> Result<()> {
            match self.mode {
                Mode::Ok => {
                    self.published.lock().unwrap().push(record.event_id.clone());
                    Ok(())
                }
                Mode::Transient => Err(Error::Connection("broker unreachable".into())),
                Mode::Permanent => Err(Error::Publish("payload rejected".into())),
            }
        }
    }

    async fn seed(repo: &MemoryOutboxRepository, ids: &[&str]) {
        for id in ids {
            repo.find_or_create(&NewOutboxRecord {
                event_id: id.to_string(),
                subject: "test.orders.order.created".to_string(),
                payload: b"{}".to_vec(),
                headers: None,
            })
            .await
            .unwrap();
        }
    }

    fn worker(repo: Arc<MemoryOutboxRepository>, publisher: Arc<StubPublisher>) -> OutboxWorker {
        OutboxWorker::new(repo, publisher, OutboxConfig::default(), Arc::new(Notify::new()))
    }

    #[tokio::test]
    async fn drain_publishes_and_marks_sent_in_order() {
        let repo = Arc::new(MemoryOutboxRepository::new());
        seed(&repo, &["E-1", "E-2"]).await;
        let publisher = StubPublisher::new(Mode::Ok);

        let sent = worker(repo.clone(), publisher.clone()).drain_once().await.unwrap();

        assert_eq!(sent, 2);
        assert_eq!(*publisher.published.lock().unwrap(), ["E-1", "E-2"]);
        let counts = repo.count_by_status().await.unwrap();
        assert_eq!(counts[&OutboxStatus::Sent], 2);
    }

    #[tokio::test]
    async fn transient_failure_leaves_lease_for_stale_sweep() {
        let repo = Arc::new(MemoryOutboxRepository::new());
        seed(&repo, &["E-1"]).await;
        let publisher = StubPublisher::new(Mode::Transient);

        let sent = worker(repo.clone(), publisher).drain_once().await.unwrap();

        assert_eq!(sent, 0);
        let counts = repo.count_by_status().await.unwrap();
        assert_eq!(counts[&OutboxStatus::Publishing], 1);

        // The sweep promotes the abandoned lease back to pending.
        assert_eq!(repo.reset_stale(Duration::ZERO).await.unwrap(), 1);
        assert_eq!(repo.find_pending(10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn permanent_failure_marks_record_failed() {
        let repo = Arc::new(MemoryOutboxRepository::new());
        seed(&repo, &["E-1"]).await;
        let publisher = StubPublisher::new(Mode::Permanent);

        let sent = worker(repo.clone(), publisher).drain_once().await.unwrap();

        assert_eq!(sent, 0);
        let counts = repo.count_by_status().await.unwrap();
        assert_eq!(counts[&OutboxStatus::Failed], 1);
    }

    #[tokio::test]
    async fn records_leased_elsewhere_are_skipped() {
        let repo = Arc::new(MemoryOutboxRepository::new());
        seed(&repo, &["E-1", "E-2"]).await;
        // Simulate another worker holding E-1.
        let snapshot = repo.find_pending(10).await.unwrap();
        assert_eq!(snapshot.len(), 2);
        repo.mark_publishing("E-1").await.unwrap();

        let publisher = StubPublisher::new(Mode::Ok);
        let sent = worker(repo.clone(), publisher.clone()).drain_once().await.unwrap();

        assert_eq!(sent, 1);
        assert_eq!(*publisher.published.lock().unwrap(), ["E-2"]);
    }
}
