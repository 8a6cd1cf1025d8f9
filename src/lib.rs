//! # jetbus
//!
//! Declarative pub/sub messaging over a NATS JetStream broker, with the two
//! patterns that make at-least-once delivery safe to build on:
//!
//! 1. A **transactional outbox**: publishes are persisted in the same store
//!    as business data and a background worker drains them into the broker,
//!    so an event is never lost between a commit and a publish.
//! 2. An **idempotent inbox**: processed event ids are recorded so that
//!    redeliveries (crashes, rebalances, broker retries) do not repeat the
//!    handler's side effects.
//!
//! Around those sit topic/subject translation, stream and durable-consumer
//! topology management with subject-overlap detection, a pull-based consumer
//! runtime with bounded per-subscriber concurrency, an around-advice
//! middleware chain, and retry/DLQ routing with failure classification.
//!
//! ## Delivery guarantees
//!
//! - Publishes carry `Nats-Msg-Id` so the broker's duplicate window
//!   suppresses replays of the same event id.
//! - With the outbox on, `publish` succeeds iff the outbox row committed;
//!   the row is drained at least once, and broker deduplication collapses
//!   worker races.
//! - With the inbox on, a handler completes at most once per event id;
//!   retries and redeliveries ack without re-running it.
//! - A message whose handler keeps failing backs off per the retry schedule
//!   and lands on `{env}.{app}.dlq` with the original envelope, the error,
//!   and its delivery count.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use jetbus::{
//!     handler_fn, PublishOptions, Runtime, RuntimeConfig, SubscriberSpec,
//! };
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = RuntimeConfig::new("test", "orders");
//!     let mut runtime = Runtime::new(config);
//!
//!     runtime.subscribe(SubscriberSpec::new(
//!         "order-processor",
//!         "ORDERS",
//!         vec!["order.created".into()],
//!         Arc::new(handler_fn(|envelope| async move {
//!             println!("order {}", envelope.message["order_id"]);
//!             Ok(())
//!         })),
//!     ));
//!
//!     runtime.start().await?;
//!
//!     let publisher = runtime.publisher();
//!     publisher
//!         .publish(
//!             "order.created",
//!             serde_json::json!({"order_id": "O-1", "total": 42}),
//!             PublishOptions::default(),
//!         )
//!         .await?;
//!
//!     runtime.stop().await?;
//!     Ok(())
//! }
//! ```
//!
//! The outbox and inbox are enabled through [`RuntimeConfig`] plus a
//! repository implementation: [`repository::PostgresOutboxRepository`] /
//! [`repository::PostgresInboxRepository`] over sqlx (schema in
//! `migrations/`), or the in-memory pair for tests.

pub mod config;
pub mod connection;
pub mod consumer;
pub mod correlation;
pub mod envelope;
pub mod error;
pub mod handler;
pub mod inbox;
pub mod middleware;
pub mod outbox;
pub mod publisher;
pub mod registry;
pub mod repository;
pub mod retry;
pub mod subject;
pub mod topology;

pub use config::{
    AuthMode, ConnectionConfig, ConsumerConfig, InboxConfig, OutboxConfig, PublisherConfig,
    RuntimeConfig, TlsConfig,
};
pub use connection::{ConnectionManager, ConnectionState};
pub use correlation::CorrelationScope;
pub use envelope::{Envelope, EnvelopeOptions};
pub use error::{Error, Result};
pub use handler::{handler_fn, Handler, MessageContext, Outcome};
pub use inbox::InboxMiddleware;
pub use middleware::{Middleware, Next};
pub use publisher::{
    BatchResult, MultiPublishResult, PublishBatch, PublishOptions, PublishResult, Publisher,
};
pub use registry::{HealthReport, Runtime, SubscriberHealth, SubscriberSpec};
pub use repository::{
    InboxRecord, InboxRepository, InboxStatus, NewInboxRecord, NewOutboxRecord, OutboxRecord,
    OutboxRepository, OutboxStatus,
};
pub use retry::{DeadLetterEnvelope, Disposition, ErrorClass, RetryEngine};
pub use topology::{ConsumerSpec, Retention, Storage, StreamSpec};
