//! Pull-based consumption runtime, one worker per subscriber binding.
//!
//! The fetch loop asks the broker for at most `concurrency_limit - in_flight`
//! messages at a time and dispatches each delivery onto its own task, so a
//! slow handler never blocks the rest of the batch. With
//! `concurrency_limit = 1` the single permit serializes processing in
//! delivery order. Long-running handlers are kept alive by in-progress
//! heartbeats at `ack_wait × 0.66`. Shutdown stops fetching, waits for
//! in-flight tasks up to the drain deadline, then aborts the rest; their
//! messages redeliver after `ack_wait`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_nats::jetstream::consumer::pull;
use async_nats::jetstream::{consumer, AckKind, Message};
use futures::StreamExt;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::ConsumerConfig;
use crate::connection::ConnectionManager;
use crate::envelope::Envelope;
use crate::handler::{Handler, MessageContext, Outcome};
use crate::middleware::{run_chain, Middleware};
use crate::publisher::MSG_ID_HEADER;
use crate::repository::InboxRepository;
use crate::retry::{DeadLetterEnvelope, Disposition, RetryEngine};

pub(crate) type PullConsumer = consumer::Consumer<pull::Config>;

/// Runs the fetch/dispatch loop for one subscriber binding.
pub(crate) struct ConsumerWorker {
    pub name: String,
    pub consumer: PullConsumer,
    pub chain: Vec<Arc<dyn Middleware>>,
    pub handler: Arc<dyn Handler>,
    pub config: ConsumerConfig,
    pub retry: RetryEngine,
    pub dlq_subject: String,
    pub inbox: Option<Arc<dyn InboxRepository>>,
    pub semaphore: Arc<Semaphore>,
    pub connection: Arc<ConnectionManager>,
}

/// Heartbeat cadence keeping the broker's redelivery timer at bay.
pub(crate) fn heartbeat_interval(ack_wait: Duration) -> Duration {
    ack_wait.mul_f64(0.66)
}

impl ConsumerWorker {
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        info!(subscriber = %self.name, "consumer worker started");
        let mut tasks = JoinSet::new();

        'fetch: while !cancel.is_cancelled() {
            while tasks.try_join_next().is_some() {}

            let available = self.semaphore.available_permits();
            if available == 0 {
                // Full; wait for capacity instead of fetching messages we
                // cannot start.
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    permit = self.semaphore.acquire() => drop(permit),
                }
                continue;
            }

            let mut batch = match self
                .consumer
                .batch()
                .max_messages(available.min(self.config.batch_size))
                .expires(self.config.fetch_timeout)
                .messages()
                .await
            {
                Ok(batch) => batch,
                Err(e) => {
                    warn!(subscriber = %self.name, error = %e, "fetch failed, backing off");
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(Duration::from_secs(1)) => continue,
                    }
                }
            };

            loop {
                let next = tokio::select! {
                    _ = cancel.cancelled() => break 'fetch,
                    next = batch.next() => next,
                };
                match next {
                    Some(Ok(message)) => {
                        let permit = tokio::select! {
                            _ = cancel.cancelled() => break 'fetch,
                            permit = self.semaphore.clone().acquire_owned() => match permit {
                                Ok(permit) => permit,
                                Err(_) => break 'fetch,
                            },
                        };
                        let worker = self.clone();
                        tasks.spawn(async move {
                            worker.process(message).await;
                            drop(permit);
                        });
                    }
                    Some(Err(e)) => {
                        warn!(subscriber = %self.name, error = %e, "batch stream error");
                        break;
                    }
                    None => break,
                }
            }
        }

        info!(subscriber = %self.name, in_flight = tasks.len(), "consumer draining");
        let drained = tokio::time::timeout(self.config.drain_timeout, async {
            while tasks.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!(
                subscriber = %self.name,
                remaining = tasks.len(),
                "drain deadline exceeded, aborting in-flight handlers; \
                 their messages redeliver after ack_wait"
            );
            tasks.abort_all();
            while tasks.join_next().await.is_some() {}
        }
        info!(subscriber = %self.name, "consumer worker stopped");
    }

    /// Process one delivery end to end: parse, run the chain, settle the ack.
    async fn process(self: Arc<Self>, message: Message) {
        let (deliveries, stream, stream_sequence) = match message.info() {
            Ok(info) => (info.delivered, Some(info.stream.to_string()), info.stream_sequence),
            Err(e) => {
                warn!(subscriber = %self.name, error = %e, "missing delivery info, assuming first");
                (1, None, 0)
            }
        };

        let envelope = match Envelope::from_bytes(&message.payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                // Redelivering a payload that cannot parse can never
                // succeed; terminate it and keep the subject visible in the
                // log for operators.
                warn!(
                    subscriber = %self.name,
                    subject = %message.subject,
                    deliveries,
                    error = %e,
                    "malformed envelope, terminating delivery"
                );
                if let Err(e) = message.ack_with(AckKind::Term).await {
                    warn!(subscriber = %self.name, error = %e, "failed to term malformed message");
                }
                return;
            }
        };

        let mut ctx = MessageContext::new(envelope, message.subject.to_string());
        ctx.deliveries = deliveries;
        ctx.stream = stream;
        ctx.stream_sequence = Some(stream_sequence);
        ctx.reply = message.reply.as_ref().map(|r| r.to_string());
        ctx.headers = header_map(&message);

        let message = Arc::new(message);
        let heartbeat = self.spawn_heartbeat(message.clone());
        let result = run_chain(&self.chain, self.handler.as_ref(), &mut ctx).await;
        heartbeat.abort();

        match result {
            Ok(()) => match ctx.take_outcome() {
                None | Some(Outcome::Ack) => {
                    if let Err(e) = message.ack().await {
                        warn!(
                            subscriber = %self.name,
                            event_id = %ctx.envelope.event_id,
                            error = %e,
                            "ack failed; message will redeliver"
                        );
                    }
                }
                Some(Outcome::Retry { reason }) => {
                    debug!(
                        subscriber = %self.name,
                        event_id = %ctx.envelope.event_id,
                        reason = %reason,
                        "middleware requested retry"
                    );
                    let delay = self.retry.backoff_delay(ctx.deliveries);
                    self.nak(&message, &ctx, delay).await;
                }
                Some(Outcome::DeadLetter { reason }) => {
                    self.dead_letter(&message, &ctx, &reason).await;
                }
            },
            Err(e) => {
                warn!(
                    subscriber = %self.name,
                    event_id = %ctx.envelope.event_id,
                    subject = %ctx.subject,
                    deliveries = ctx.deliveries,
                    error = ?e,
                    "handler failed"
                );
                match self.retry.disposition(&e, ctx.deliveries) {
                    Disposition::Retry { delay } => self.nak(&message, &ctx, delay).await,
                    Disposition::DeadLetter => {
                        self.dead_letter(&message, &ctx, &format!("{e:#}")).await
                    }
                }
            }
        }
    }

    fn spawn_heartbeat(&self, message: Arc<Message>) -> tokio::task::JoinHandle<()> {
        let cadence = heartbeat_interval(self.config.ack_wait);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(cadence);
            tick.tick().await;
            loop {
                tick.tick().await;
                if let Err(e) = message.ack_with(AckKind::Progress).await {
                    debug!(error = %e, "in-progress heartbeat failed");
                    break;
                }
            }
        })
    }

    async fn nak(&self, message: &Message, ctx: &MessageContext, delay: Duration) {
        debug!(
            subscriber = %self.name,
            event_id = %ctx.envelope.event_id,
            deliveries = ctx.deliveries,
            delay = ?delay,
            "scheduling redelivery"
        );
        if let Err(e) = message.ack_with(AckKind::Nak(Some(delay))).await {
            warn!(subscriber = %self.name, error = %e, "nak failed; broker will redeliver after ack_wait");
        }
    }

    /// Publish the dead-letter envelope and settle the original message.
    async fn dead_letter(&self, message: &Message, ctx: &MessageContext, error: &str) {
        if !self.config.use_dlq {
            warn!(
                subscriber = %self.name,
                event_id = %ctx.envelope.event_id,
                deliveries = ctx.deliveries,
                error = %error,
                "retries exhausted and DLQ disabled, terminating delivery"
            );
            if let Some(inbox) = &self.inbox {
                let _ = inbox.mark_failed(&ctx.envelope.event_id, error).await;
            }
            if let Err(e) = message.ack_with(AckKind::Term).await {
                warn!(subscriber = %self.name, error = %e, "term failed");
            }
            return;
        }

        match self.publish_dead_letter(ctx, error).await {
            Ok(()) => {
                error!(
                    subscriber = %self.name,
                    event_id = %ctx.envelope.event_id,
                    subject = %ctx.subject,
                    dlq_subject = %self.dlq_subject,
                    deliveries = ctx.deliveries,
                    error = %error,
                    "message routed to DLQ"
                );
                if let Some(inbox) = &self.inbox {
                    if let Err(e) = inbox.mark_failed(&ctx.envelope.event_id, error).await {
                        warn!(event_id = %ctx.envelope.event_id, error = ?e, "failed to mark inbox row failed");
                    }
                }
                if let Err(e) = message.ack().await {
                    warn!(subscriber = %self.name, error = %e, "ack after DLQ publish failed");
                }
            }
            Err(e) => {
                // Without the DLQ copy the message must not be lost; put it
                // back on the retry track instead of acking.
                warn!(
                    subscriber = %self.name,
                    event_id = %ctx.envelope.event_id,
                    error = ?e,
                    "DLQ publish failed, scheduling redelivery"
                );
                self.nak(message, ctx, self.retry.backoff_delay(ctx.deliveries)).await;
            }
        }
    }

    async fn publish_dead_letter(&self, ctx: &MessageContext, error: &str) -> crate::error::Result<()> {
        let dead_letter = DeadLetterEnvelope::new(&ctx.envelope, &ctx.subject, error, ctx.deliveries);
        let payload = serde_json::to_vec(&dead_letter)?;
        let js = self.connection.jetstream().await?;

        let mut headers = async_nats::HeaderMap::new();
        // Distinct from the original event id so the DLQ copy is deduped on
        // its own, not against the original message.
        headers.insert(MSG_ID_HEADER, format!("dlq-{}", ctx.envelope.event_id).as_str());

        js.publish_with_headers(self.dlq_subject.clone(), headers, payload.into())
            .await
            .map_err(|e| crate::error::Error::Publish(e.to_string()))?
            .await
            .map_err(|e| crate::error::Error::Publish(e.to_string()))?;
        Ok(())
    }
}

fn header_map(message: &Message) -> HashMap<String, String> {
    let mut map = HashMap::new();
    if let Some(headers) = &message.headers {
        for (key, values) in headers.iter() {
            if let Some(value) = values.first() {
                map.insert(key.to_string(), value.to_string());
            }
        }
    }
    map
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heartbeat_runs_well_inside_ack_wait() {
        let cadence = heartbeat_interval(Duration::from_secs(30));
        assert!(cadence > Duration::from_secs(19) && cadence < Duration::from_secs(20));
        assert!(heartbeat_interval(Duration::from_secs(1)) < Duration::from_secs(1));
    }
}
