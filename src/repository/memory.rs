//! In-memory repositories for tests and ephemeral deployments.
//!
//! Atomicity comes from holding the map lock across the read-check-write of
//! each operation; the invariants in the module docs hold, but nothing
//! survives a process restart.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;

use crate::error::Result;

use super::{
    InboxRecord, InboxRepository, InboxStatus, NewInboxRecord, NewOutboxRecord, OutboxRecord,
    OutboxRepository, OutboxStatus,
};

/// Outbox store backed by a process-local map.
#[derive(Default)]
pub struct MemoryOutboxRepository {
    records: Mutex<HashMap<String, OutboxRecord>>,
}

impl MemoryOutboxRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl OutboxRepository for MemoryOutboxRepository {
    async fn find_or_create(&self, record: &NewOutboxRecord) -> Result<OutboxRecord> {
        let mut records = self.records.lock().await;
        if let Some(existing) = records.get(&record.event_id) {
            return Ok(existing.clone());
        }
        let row = OutboxRecord {
            event_id: record.event_id.clone(),
            subject: record.subject.clone(),
            payload: record.payload.clone(),
            headers: record.headers.clone(),
            status: OutboxStatus::Pending,
            enqueued_at: Utc::now(),
            publishing_at: None,
            sent_at: None,
            error_message: None,
        };
        records.insert(record.event_id.clone(), row.clone());
        Ok(row)
    }

    async fn mark_publishing(&self, event_id: &str) -> Result<bool> {
        let mut records = self.records.lock().await;
        match records.get_mut(event_id) {
            Some(row) if row.status == OutboxStatus::Pending => {
                row.status = OutboxStatus::Publishing;
                row.publishing_at = Some(Utc::now());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn mark_sent(&self, event_id: &str) -> Result<bool> {
        let mut records = self.records.lock().await;
        match records.get_mut(event_id) {
            Some(row) if row.status == OutboxStatus::Publishing => {
                row.status = OutboxStatus::Sent;
                row.sent_at = Some(Utc::now());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn mark_failed(&self, event_id: &str, error: &str) -> Result<bool> {
        let mut records = self.records.lock().await;
        match records.get_mut(event_id) {
            Some(row) if row.status != OutboxStatus::Sent => {
                row.status = OutboxStatus::Failed;
                row.error_message = Some(error.to_string());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn find_pending(&self, limit: i64) -> Result<Vec<OutboxRecord>> {
        let records = self.records.lock().await;
        let mut pending: Vec<OutboxRecord> = records
            .values()
            .filter(|r| r.status == OutboxStatus::Pending)
            .cloned()
            .collect();
        pending.sort_by_key(|r| r.enqueued_at);
        pending.truncate(limit.max(0) as usize);
        Ok(pending)
    }

    async fn reset_stale(&self, age: Duration) -> Result<u64> {
        let cutoff = Utc::now() - chrono::Duration::from_std(age).unwrap_or_else(|_| chrono::Duration::zero());
        let mut records = self.records.lock().await;
        let mut reverted = 0;
        for row in records.values_mut() {
            if row.status == OutboxStatus::Publishing
                && row.publishing_at.is_some_and(|t| t < cutoff)
            {
                row.status = OutboxStatus::Pending;
                row.publishing_at = None;
                reverted += 1;
            }
        }
        Ok(reverted)
    }

    async fn cleanup(&self, age: Duration) -> Result<u64> {
        let cutoff = Utc::now() - chrono::Duration::from_std(age).unwrap_or_else(|_| chrono::Duration::zero());
        let mut records = self.records.lock().await;
        let before = records.len();
        records.retain(|_, row| {
            !(row.status == OutboxStatus::Sent && row.sent_at.is_some_and(|t| t < cutoff))
        });
        Ok((before - records.len()) as u64)
    }

    async fn count_by_status(&self) -> Result<HashMap<OutboxStatus, i64>> {
        let records = self.records.lock().await;
        let mut counts = HashMap::new();
        for row in records.values() {
            *counts.entry(row.status).or_insert(0) += 1;
        }
        Ok(counts)
    }

    async fn oldest_pending_age(&self) -> Result<Option<Duration>> {
        let records = self.records.lock().await;
        let oldest = records
            .values()
            .filter(|r| r.status == OutboxStatus::Pending)
            .map(|r| r.enqueued_at)
            .min();
        Ok(oldest.map(|t| {
            Utc::now()
                .signed_duration_since(t)
                .to_std()
                .unwrap_or(Duration::ZERO)
        }))
    }
}

/// Inbox store backed by a process-local map.
#[derive(Default)]
pub struct MemoryInboxRepository {
    records: Mutex<HashMap<String, InboxRecord>>,
}

impl MemoryInboxRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl InboxRepository for MemoryInboxRepository {
    async fn find_or_create(&self, record: &NewInboxRecord) -> Result<InboxRecord> {
        let mut records = self.records.lock().await;
        if let Some(existing) = records.get_mut(&record.event_id) {
            existing.deliveries += 1;
            return Ok(existing.clone());
        }
        let row = InboxRecord {
            event_id: record.event_id.clone(),
            subject: record.subject.clone(),
            payload: record.payload.clone(),
            headers: record.headers.clone(),
            stream: record.stream.clone(),
            stream_sequence: record.stream_sequence,
            status: InboxStatus::Processing,
            received_at: Utc::now(),
            processed_at: None,
            deliveries: 1,
            error_message: None,
        };
        records.insert(record.event_id.clone(), row.clone());
        Ok(row)
    }

    async fn mark_processed(&self, event_id: &str) -> Result<bool> {
        let mut records = self.records.lock().await;
        match records.get_mut(event_id) {
            // Also admits `failed`: a handler that completes after the stale
            // sweeper gave up on the row still ran to success, and the
            // health view must say so.
            Some(row) if row.status != InboxStatus::Processed => {
                row.status = InboxStatus::Processed;
                row.processed_at = Some(Utc::now());
                row.error_message = None;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn mark_failed(&self, event_id: &str, error: &str) -> Result<bool> {
        let mut records = self.records.lock().await;
        match records.get_mut(event_id) {
            Some(row) if row.status == InboxStatus::Processing => {
                row.status = InboxStatus::Failed;
                row.error_message = Some(error.to_string());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn reset_stale(&self, age: Duration) -> Result<u64> {
        let cutoff = Utc::now() - chrono::Duration::from_std(age).unwrap_or_else(|_| chrono::Duration::zero());
        let mut records = self.records.lock().await;
        let mut flipped = 0;
        for row in records.values_mut() {
            if row.status == InboxStatus::Processing && row.received_at < cutoff {
                row.status = InboxStatus::Failed;
                row.error_message = Some("processing timeout".to_string());
                flipped += 1;
            }
        }
        Ok(flipped)
    }

    async fn cleanup(&self, age: Duration) -> Result<u64> {
        let cutoff = Utc::now() - chrono::Duration::from_std(age).unwrap_or_else(|_| chrono::Duration::zero());
        let mut records = self.records.lock().await;
        let before = records.len();
        records.retain(|_, row| {
            !(row.status == InboxStatus::Processed && row.processed_at.is_some_and(|t| t < cutoff))
        });
        Ok((before - records.len()) as u64)
    }

    async fn count_by_status(&self) -> Result<HashMap<InboxStatus, i64>> {
        let records = self.records.lock().await;
        let mut counts = HashMap::new();
        for row in records.values() {
            *counts.entry(row.status).or_insert(0) += 1;
        }
        Ok(counts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outbox_template(event_id: &str) -> NewOutboxRecord {
        NewOutboxRecord {
            event_id: event_id.to_string(),
            subject: "test.orders.order.created".to_string(),
            payload: b"{}".to_vec(),
            headers: None,
        }
    }

    #[tokio::test]
    async fn find_or_create_returns_winner_row() {
        let repo = MemoryOutboxRepository::new();
        let first = repo.find_or_create(&outbox_template("E-1")).await.unwrap();
        let mut other = outbox_template("E-1");
        other.subject = "test.orders.other".to_string();
        let second = repo.find_or_create(&other).await.unwrap();
        assert_eq!(second.subject, first.subject);
    }

    #[tokio::test]
    async fn lease_is_exclusive() {
        let repo = MemoryOutboxRepository::new();
        repo.find_or_create(&outbox_template("E-1")).await.unwrap();
        assert!(repo.mark_publishing("E-1").await.unwrap());
        assert!(!repo.mark_publishing("E-1").await.unwrap());
    }

    #[tokio::test]
    async fn mark_sent_is_idempotent() {
        let repo = MemoryOutboxRepository::new();
        repo.find_or_create(&outbox_template("E-1")).await.unwrap();
        repo.mark_publishing("E-1").await.unwrap();
        assert!(repo.mark_sent("E-1").await.unwrap());
        assert!(!repo.mark_sent("E-1").await.unwrap());
        let counts = repo.count_by_status().await.unwrap();
        assert_eq!(counts[&OutboxStatus::Sent], 1);
    }

    #[tokio::test]
    async fn sent_rows_resist_mark_failed() {
        let repo = MemoryOutboxRepository::new();
        repo.find_or_create(&outbox_template("E-1")).await.unwrap();
        repo.mark_publishing("E-1").await.unwrap();
        repo.mark_sent("E-1").await.unwrap();
        assert!(!repo.mark_failed("E-1", "late error").await.unwrap());
    }

    #[tokio::test]
    async fn reset_stale_reverts_only_old_leases() {
        let repo = MemoryOutboxRepository::new();
        repo.find_or_create(&outbox_template("E-1")).await.unwrap();
        repo.mark_publishing("E-1").await.unwrap();
        // Fresh lease stays put.
        assert_eq!(repo.reset_stale(Duration::from_secs(60)).await.unwrap(), 0);
        // A zero horizon treats it as stale.
        assert_eq!(repo.reset_stale(Duration::ZERO).await.unwrap(), 1);
        let pending = repo.find_pending(10).await.unwrap();
        assert_eq!(pending.len(), 1);
    }

    #[tokio::test]
    async fn pending_ordering_is_fifo() {
        let repo = MemoryOutboxRepository::new();
        for id in ["E-1", "E-2", "E-3"] {
            repo.find_or_create(&outbox_template(id)).await.unwrap();
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        let pending = repo.find_pending(2).await.unwrap();
        let ids: Vec<&str> = pending.iter().map(|r| r.event_id.as_str()).collect();
        assert_eq!(ids, ["E-1", "E-2"]);
    }

    #[tokio::test]
    async fn oldest_pending_age_tracks_first_enqueued() {
        let repo = MemoryOutboxRepository::new();
        assert!(repo.oldest_pending_age().await.unwrap().is_none());

        repo.find_or_create(&outbox_template("E-1")).await.unwrap();
        assert!(repo.oldest_pending_age().await.unwrap().is_some());

        repo.mark_publishing("E-1").await.unwrap();
        assert!(repo.oldest_pending_age().await.unwrap().is_none());
    }

    fn inbox_template(event_id: &str) -> NewInboxRecord {
        NewInboxRecord {
            event_id: event_id.to_string(),
            subject: "test.orders.order.created".to_string(),
            payload: b"{}".to_vec(),
            headers: None,
            stream: Some("ORDERS".to_string()),
            stream_sequence: Some(7),
        }
    }

    #[tokio::test]
    async fn inbox_redelivery_increments_deliveries() {
        let repo = MemoryInboxRepository::new();
        let first = repo.find_or_create(&inbox_template("E-1")).await.unwrap();
        assert_eq!(first.deliveries, 1);
        let second = repo.find_or_create(&inbox_template("E-1")).await.unwrap();
        assert_eq!(second.deliveries, 2);
        assert_eq!(second.status, InboxStatus::Processing);
    }

    #[tokio::test]
    async fn processed_is_terminal() {
        let repo = MemoryInboxRepository::new();
        repo.find_or_create(&inbox_template("E-1")).await.unwrap();
        assert!(repo.mark_processed("E-1").await.unwrap());
        assert!(!repo.mark_processed("E-1").await.unwrap());
        assert!(!repo.mark_failed("E-1", "late").await.unwrap());
    }

    #[tokio::test]
    async fn stale_processing_flips_to_failed_with_reason() {
        let repo = MemoryInboxRepository::new();
        repo.find_or_create(&inbox_template("E-1")).await.unwrap();
        assert_eq!(repo.reset_stale(Duration::ZERO).await.unwrap(), 1);
        let counts = repo.count_by_status().await.unwrap();
        assert_eq!(counts[&InboxStatus::Failed], 1);
    }

    #[tokio::test]
    async fn late_success_after_stale_failure_is_recorded() {
        let repo = MemoryInboxRepository::new();
        repo.find_or_create(&inbox_template("E-1")).await.unwrap();
        // The sweeper gives up on the row, then a redelivered handler run
        // completes anyway.
        repo.reset_stale(Duration::ZERO).await.unwrap();
        assert!(repo.mark_processed("E-1").await.unwrap());

        let counts = repo.count_by_status().await.unwrap();
        assert_eq!(counts.get(&InboxStatus::Failed), None);
        assert_eq!(counts[&InboxStatus::Processed], 1);
    }
}
