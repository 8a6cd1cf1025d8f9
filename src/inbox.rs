//! Inbox deduplication: exactly-once effect over at-least-once delivery.
//!
//! [`InboxMiddleware`] runs innermost in the chain, directly around the
//! handler. It reserves the event id in the inbox store before invoking the
//! handler and commits the reservation after it returns, so a redelivered
//! message whose handler already completed is acked without side effects.
//! Handlers that also write business data to the same store should compose
//! the inbox commit into the same transaction; the repository contract
//! leaves room for such a unit of work but does not impose one.

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::config::InboxConfig;
use crate::handler::MessageContext;
use crate::middleware::{Middleware, Next};
use crate::repository::{InboxRepository, InboxStatus, NewInboxRecord};

/// Innermost middleware reserving and committing inbox rows.
pub struct InboxMiddleware {
    repository: Arc<dyn InboxRepository>,
}

impl InboxMiddleware {
    pub fn new(repository: Arc<dyn InboxRepository>) -> Self {
        Self { repository }
    }
}

#[async_trait]
impl Middleware for InboxMiddleware {
    async fn call(&self, ctx: &mut MessageContext, next: Next<'_>) -> anyhow::Result<()> {
        let record = self
            .repository
            .find_or_create(&NewInboxRecord {
                event_id: ctx.envelope.event_id.clone(),
                subject: ctx.subject.clone(),
                payload: ctx.envelope.to_bytes()?,
                headers: if ctx.headers.is_empty() {
                    None
                } else {
                    Some(ctx.headers.clone())
                },
                stream: ctx.stream.clone(),
                stream_sequence: ctx.stream_sequence.map(|s| s as i64),
            })
            .await?;

        if record.status == InboxStatus::Processed {
            debug!(
                event_id = %ctx.envelope.event_id,
                deliveries = record.deliveries,
                "duplicate delivery suppressed by inbox"
            );
            return Ok(());
        }

        // On failure the row stays `processing`; the retry engine decides
        // what happens to the delivery and the stale sweeper reclaims the
        // row if every retry is lost.
        next.run(ctx).await?;

        if !self.repository.mark_processed(&ctx.envelope.event_id).await? {
            // A concurrent delivery committed first; this one still acks.
            debug!(
                event_id = %ctx.envelope.event_id,
                "inbox row already processed by a concurrent delivery"
            );
        }
        Ok(())
    }
}

/// Background sweep flipping abandoned `processing` rows to `failed` and
/// purging old `processed` rows.
pub struct InboxSweeper {
    repository: Arc<dyn InboxRepository>,
    config: InboxConfig,
}

impl InboxSweeper {
    pub fn new(repository: Arc<dyn InboxRepository>, config: InboxConfig) -> Self {
        Self { repository, config }
    }

    pub async fn run(&self, cancel: CancellationToken) {
        let mut tick = tokio::time::interval(self.config.sweep_interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tick.tick() => {}
            }
            match self.repository.reset_stale(self.config.stale_after).await {
                Ok(0) => {}
                Ok(count) => warn!(failed = count, "flipped stale inbox rows to failed"),
                Err(e) => error!(error = ?e, "stale inbox sweep failed"),
            }
            match self.repository.cleanup(self.config.retention).await {
                Ok(0) => {}
                Ok(count) => debug!(deleted = count, "purged processed inbox rows"),
                Err(e) => error!(error = ?e, "inbox retention purge failed"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::{Envelope, EnvelopeOptions};
    use crate::handler::handler_fn;
    use crate::middleware::run_chain;
    use crate::repository::memory::MemoryInboxRepository;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn ctx(event_id: &str) -> MessageContext {
        let envelope = Envelope::build(
            json!({"order_id": "O-1"}),
            EnvelopeOptions {
                event_id: Some(event_id.to_string()),
                ..Default::default()
            },
        );
        MessageContext::new(envelope, "test.orders.order.created")
    }

    fn chain(repo: Arc<MemoryInboxRepository>) -> Vec<Arc<dyn Middleware>> {
        vec![Arc::new(InboxMiddleware::new(repo))]
    }

    #[tokio::test]
    async fn handler_runs_once_per_event_id() {
        let repo = Arc::new(MemoryInboxRepository::new());
        let invocations = Arc::new(AtomicU32::new(0));
        let counter = invocations.clone();
        let handler = handler_fn(move |_| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });
        let chain = chain(repo.clone());

        run_chain(&chain, &handler, &mut ctx("E-1")).await.unwrap();
        // Crash-redelivery of the same event id.
        run_chain(&chain, &handler, &mut ctx("E-1")).await.unwrap();

        assert_eq!(invocations.load(Ordering::SeqCst), 1);
        let counts = repo.count_by_status().await.unwrap();
        assert_eq!(counts[&InboxStatus::Processed], 1);
    }

    #[tokio::test]
    async fn handler_failure_leaves_row_processing() {
        let repo = Arc::new(MemoryInboxRepository::new());
        let handler = handler_fn(|_| async { anyhow::bail!("boom") });
        let chain = chain(repo.clone());

        let err = run_chain(&chain, &handler, &mut ctx("E-2")).await.unwrap_err();
        assert!(err.to_string().contains("boom"));

        let counts = repo.count_by_status().await.unwrap();
        assert_eq!(counts[&InboxStatus::Processing], 1);
    }

    #[tokio::test]
    async fn retry_after_failure_can_still_complete() {
        let repo = Arc::new(MemoryInboxRepository::new());
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = attempts.clone();
        let handler = handler_fn(move |_| {
            let counter = counter.clone();
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    anyhow::bail!("transient");
                }
                Ok(())
            }
        });
        let chain = chain(repo.clone());

        assert!(run_chain(&chain, &handler, &mut ctx("E-3")).await.is_err());
        run_chain(&chain, &handler, &mut ctx("E-3")).await.unwrap();

        assert_eq!(attempts.load(Ordering::SeqCst), 2);
        let counts = repo.count_by_status().await.unwrap();
        assert_eq!(counts[&InboxStatus::Processed], 1);
    }
}
