//! Handler contract and the per-message context it receives.

use std::collections::HashMap;
use std::future::Future;

use async_trait::async_trait;

use crate::envelope::Envelope;

/// Explicit ack decision a middleware can record when it short-circuits the
/// chain instead of calling `next`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Acknowledge without further processing.
    Ack,
    /// Redeliver after the engine's backoff for the current delivery count.
    Retry { reason: String },
    /// Route to the DLQ subject and acknowledge the original.
    DeadLetter { reason: String },
}

/// Everything the middleware chain and handler see about one delivery.
#[derive(Debug, Clone)]
pub struct MessageContext {
    pub envelope: Envelope,
    /// Concrete subject the message arrived on.
    pub subject: String,
    /// Broker-reported delivery attempt, starting at 1.
    pub deliveries: i64,
    pub stream: Option<String>,
    pub stream_sequence: Option<u64>,
    /// Reply subject, when the producer requested one.
    pub reply: Option<String>,
    /// Broker headers, passed through unchanged.
    pub headers: HashMap<String, String>,
    outcome: Option<Outcome>,
}

impl MessageContext {
    pub fn new(envelope: Envelope, subject: impl Into<String>) -> Self {
        Self {
            envelope,
            subject: subject.into(),
            deliveries: 1,
            stream: None,
            stream_sequence: None,
            reply: None,
            headers: HashMap::new(),
            outcome: None,
        }
    }

    /// Record an explicit ack decision. A middleware that suppresses `next`
    /// owns the outcome; without one, a clean chain return acks.
    pub fn set_outcome(&mut self, outcome: Outcome) {
        self.outcome = Some(outcome);
    }

    pub(crate) fn take_outcome(&mut self) -> Option<Outcome> {
        self.outcome.take()
    }
}

/// A subscriber's message handler, the innermost node of the middleware
/// chain. Any error it returns is classified and routed by the retry engine.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, ctx: &mut MessageContext) -> anyhow::Result<()>;
}

/// Adapt an async closure over the envelope into a [`Handler`].
///
/// ```no_run
/// # use jetbus::handler_fn;
/// let handler = handler_fn(|envelope| async move {
///     println!("got {}", envelope.event_id);
///     Ok(())
/// });
/// ```
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(Envelope) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send,
{
    FnHandler(f)
}

/// Closure adapter returned by [`handler_fn`].
pub struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> Handler for FnHandler<F>
where
    F: Fn(Envelope) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send,
{
    async fn handle(&self, ctx: &mut MessageContext) -> anyhow::Result<()> {
        (self.0)(ctx.envelope.clone()).await
    }
}
