//! Persistence contract for the outbox and inbox stores.
//!
//! The traits here are purely data-plane; all delivery semantics live in the
//! workers that call them. Any implementation must guarantee:
//!
//! 1. `find_or_create` is atomic under concurrent callers: exactly one
//!    inserter wins and every other caller observes the winner's row.
//! 2. Status transitions are monotone per record:
//!    `pending → publishing → sent | failed` and
//!    `processing → processed | failed`, with `reset_stale` as the only
//!    reverse edge. One late forward edge exists on the inbox side:
//!    `failed → processed`, taken when a handler completes after the stale
//!    sweeper already gave up on the row. `processed` and outbox `sent` are
//!    terminal.
//! 3. `find_pending` and the status counts observe committed rows only.
//!
//! Two implementations ship with the crate: [`memory`] (tests and ephemeral
//! deployments) and [`postgres`] (sqlx; see `migrations/` for the schema).
//! Implementations for other stores plug in through these traits and must
//! document their isolation level.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;

pub mod memory;
pub mod postgres;

pub use memory::{MemoryInboxRepository, MemoryOutboxRepository};
pub use postgres::{PostgresInboxRepository, PostgresOutboxRepository};

/// Outbox record lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OutboxStatus {
    Pending,
    Publishing,
    Sent,
    Failed,
}

impl OutboxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutboxStatus::Pending => "pending",
            OutboxStatus::Publishing => "publishing",
            OutboxStatus::Sent => "sent",
            OutboxStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<OutboxStatus> {
        match s {
            "pending" => Some(OutboxStatus::Pending),
            "publishing" => Some(OutboxStatus::Publishing),
            "sent" => Some(OutboxStatus::Sent),
            "failed" => Some(OutboxStatus::Failed),
            _ => None,
        }
    }
}

/// Inbox record lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InboxStatus {
    Processing,
    Processed,
    Failed,
}

impl InboxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InboxStatus::Processing => "processing",
            InboxStatus::Processed => "processed",
            InboxStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<InboxStatus> {
        match s {
            "processing" => Some(InboxStatus::Processing),
            "processed" => Some(InboxStatus::Processed),
            "failed" => Some(InboxStatus::Failed),
            _ => None,
        }
    }
}

/// A store-then-forward row awaiting (or past) broker publication.
#[derive(Debug, Clone)]
pub struct OutboxRecord {
    pub event_id: String,
    pub subject: String,
    /// Serialized envelope, persisted verbatim.
    pub payload: Vec<u8>,
    /// Operator headers persisted alongside the payload.
    pub headers: Option<HashMap<String, String>>,
    pub status: OutboxStatus,
    pub enqueued_at: DateTime<Utc>,
    /// Lease stamp set by `mark_publishing`.
    pub publishing_at: Option<DateTime<Utc>>,
    pub sent_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
}

/// Template for inserting a new outbox row.
#[derive(Debug, Clone)]
pub struct NewOutboxRecord {
    pub event_id: String,
    pub subject: String,
    pub payload: Vec<u8>,
    pub headers: Option<HashMap<String, String>>,
}

/// A deduplication row tracking one observed delivery.
#[derive(Debug, Clone)]
pub struct InboxRecord {
    pub event_id: String,
    pub subject: String,
    pub payload: Vec<u8>,
    pub headers: Option<HashMap<String, String>>,
    pub stream: Option<String>,
    pub stream_sequence: Option<i64>,
    pub status: InboxStatus,
    pub received_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    /// Observed delivery count, incremented on each `find_or_create`.
    pub deliveries: i32,
    pub error_message: Option<String>,
}

/// Template for inserting a new inbox row.
#[derive(Debug, Clone)]
pub struct NewInboxRecord {
    pub event_id: String,
    pub subject: String,
    pub payload: Vec<u8>,
    pub headers: Option<HashMap<String, String>>,
    pub stream: Option<String>,
    pub stream_sequence: Option<i64>,
}

/// Persistence for the transactional outbox.
#[async_trait]
pub trait OutboxRepository: Send + Sync {
    /// Insert a `pending` row, or return the existing row unchanged if the
    /// event id is already present. Atomic under concurrent callers.
    async fn find_or_create(&self, record: &NewOutboxRecord) -> Result<OutboxRecord>;

    /// Lease transition `pending → publishing`, stamping the lease start.
    /// Returns whether this caller won the lease.
    async fn mark_publishing(&self, event_id: &str) -> Result<bool>;

    /// Transition `publishing → sent`. Idempotent: repeat calls after the
    /// first leave the row unchanged and return `false`.
    async fn mark_sent(&self, event_id: &str) -> Result<bool>;

    /// Transition any non-`sent` state to `failed`, recording the error.
    async fn mark_failed(&self, event_id: &str, error: &str) -> Result<bool>;

    /// Committed `pending` rows, oldest `enqueued_at` first.
    async fn find_pending(&self, limit: i64) -> Result<Vec<OutboxRecord>>;

    /// Revert `publishing` rows whose lease is older than `age` back to
    /// `pending`. Returns the number of rows reverted.
    async fn reset_stale(&self, age: Duration) -> Result<u64>;

    /// Delete `sent` rows older than `age`. Returns the number deleted.
    async fn cleanup(&self, age: Duration) -> Result<u64>;

    /// Row counts per status, for the health view.
    async fn count_by_status(&self) -> Result<HashMap<OutboxStatus, i64>>;

    /// Age of the oldest `pending` row, if any; a drain-lag signal for the
    /// health view.
    async fn oldest_pending_age(&self) -> Result<Option<Duration>>;
}

/// Persistence for the idempotent inbox.
#[async_trait]
pub trait InboxRepository: Send + Sync {
    /// Insert a `processing` row, or return the existing row (with its
    /// delivery count incremented) if the event id is already present.
    /// Atomic under concurrent callers.
    async fn find_or_create(&self, record: &NewInboxRecord) -> Result<InboxRecord>;

    /// Transition `processing | failed → processed`. The `failed` edge
    /// records a handler that completed after the stale sweep gave up on
    /// the row. Returns whether the transition happened; a no-op on rows
    /// already `processed`.
    async fn mark_processed(&self, event_id: &str) -> Result<bool>;

    /// Transition `processing → failed`, recording the error.
    async fn mark_failed(&self, event_id: &str, error: &str) -> Result<bool>;

    /// Flip `processing` rows older than `age` to `failed` with reason
    /// "processing timeout". Returns the number flipped.
    async fn reset_stale(&self, age: Duration) -> Result<u64>;

    /// Delete `processed` rows older than `age`. Returns the number deleted.
    async fn cleanup(&self, age: Duration) -> Result<u64>;

    /// Row counts per status, for the health view.
    async fn count_by_status(&self) -> Result<HashMap<InboxStatus, i64>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_string_round_trip() {
        for status in [
            OutboxStatus::Pending,
            OutboxStatus::Publishing,
            OutboxStatus::Sent,
            OutboxStatus::Failed,
        ] {
            assert_eq!(OutboxStatus::parse(status.as_str()), Some(status));
        }
        for status in [InboxStatus::Processing, InboxStatus::Processed, InboxStatus::Failed] {
            assert_eq!(InboxStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(OutboxStatus::parse("bogus"), None);
    }
}
