//! PostgreSQL repositories backed by sqlx.
//!
//! Schema lives in `migrations/`; apply with `sqlx migrate run` before
//! startup. All operations run at READ COMMITTED, which is sufficient for
//! the contract: `find_or_create` leans on the primary-key
//! `ON CONFLICT DO NOTHING`, and every status transition is a single guarded
//! `UPDATE ... WHERE status = _` so exactly one concurrent caller observes
//! `rows_affected = 1`.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};

use crate::error::{Error, Result};

use super::{
    InboxRecord, InboxRepository, InboxStatus, NewInboxRecord, NewOutboxRecord, OutboxRecord,
    OutboxRepository, OutboxStatus,
};

/// Outbox store on `outbox_records`.
pub struct PostgresOutboxRepository {
    pool: PgPool,
}

impl PostgresOutboxRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn headers_to_json(headers: &Option<HashMap<String, String>>) -> Result<Option<serde_json::Value>> {
    headers
        .as_ref()
        .map(|h| serde_json::to_value(h).map_err(Error::from))
        .transpose()
}

fn headers_from_json(value: Option<serde_json::Value>) -> Option<HashMap<String, String>> {
    value.and_then(|v| serde_json::from_value(v).ok())
}

fn cutoff(age: Duration) -> DateTime<Utc> {
    Utc::now() - chrono::Duration::from_std(age).unwrap_or_else(|_| chrono::Duration::zero())
}

fn outbox_row(row: &sqlx::postgres::PgRow) -> Result<OutboxRecord> {
    let status: String = row.try_get("status").context("outbox row missing status")?;
    Ok(OutboxRecord {
        event_id: row.try_get("event_id").context("outbox row missing event_id")?,
        subject: row.try_get("subject").context("outbox row missing subject")?,
        payload: row.try_get("payload").context("outbox row missing payload")?,
        headers: headers_from_json(row.try_get("headers").ok()),
        status: OutboxStatus::parse(&status)
            .ok_or_else(|| Error::RecordNotFound(format!("unknown outbox status '{status}'")))?,
        enqueued_at: row.try_get("enqueued_at").context("outbox row missing enqueued_at")?,
        publishing_at: row.try_get("publishing_at").unwrap_or(None),
        sent_at: row.try_get("sent_at").unwrap_or(None),
        error_message: row.try_get("error_message").unwrap_or(None),
    })
}

#[async_trait]
impl OutboxRepository for PostgresOutboxRepository {
    async fn find_or_create(&self, record: &NewOutboxRecord) -> Result<OutboxRecord> {
        sqlx::query(
            r#"
            INSERT INTO outbox_records (event_id, subject, payload, headers, status, enqueued_at)
            VALUES ($1, $2, $3, $4, 'pending', NOW())
            ON CONFLICT (event_id) DO NOTHING
            "#,
        )
        .bind(&record.event_id)
        .bind(&record.subject)
        .bind(&record.payload)
        .bind(headers_to_json(&record.headers)?)
        .execute(&self.pool)
        .await
        .context("failed to insert outbox record")?;

        let row = sqlx::query("SELECT * FROM outbox_records WHERE event_id = $1")
            .bind(&record.event_id)
            .fetch_one(&self.pool)
            .await
            .context("failed to read back outbox record")?;
        outbox_row(&row)
    }

    async fn mark_publishing(&self, event_id: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE outbox_records
            SET status = 'publishing', publishing_at = NOW()
            WHERE event_id = $1 AND status = 'pending'
            "#,
        )
        .bind(event_id)
        .execute(&self.pool)
        .await
        .context("failed to lease outbox record")?;
        Ok(result.rows_affected() > 0)
    }

    async fn mark_sent(&self, event_id: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE outbox_records
            SET status = 'sent', sent_at = NOW(), error_message = NULL
            WHERE event_id = $1 AND status = 'publishing'
            "#,
        )
        .bind(event_id)
        .execute(&self.pool)
        .await
        .context("failed to mark outbox record sent")?;
        Ok(result.rows_affected() > 0)
    }

    async fn mark_failed(&self, event_id: &str, error: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE outbox_records
            SET status = 'failed', error_message = $2
            WHERE event_id = $1 AND status <> 'sent'
            "#,
        )
        .bind(event_id)
        .bind(error)
        .execute(&self.pool)
        .await
        .context("failed to mark outbox record failed")?;
        Ok(result.rows_affected() > 0)
    }

    async fn find_pending(&self, limit: i64) -> Result<Vec<OutboxRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM outbox_records
            WHERE status = 'pending'
            ORDER BY enqueued_at ASC
            LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("failed to fetch pending outbox records")?;
        rows.iter().map(outbox_row).collect()
    }

    async fn reset_stale(&self, age: Duration) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE outbox_records
            SET status = 'pending', publishing_at = NULL
            WHERE status = 'publishing' AND publishing_at < $1
            "#,
        )
        .bind(cutoff(age))
        .execute(&self.pool)
        .await
        .context("failed to reset stale outbox leases")?;
        Ok(result.rows_affected())
    }

    async fn cleanup(&self, age: Duration) -> Result<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM outbox_records
            WHERE status = 'sent' AND sent_at < $1
            "#,
        )
        .bind(cutoff(age))
        .execute(&self.pool)
        .await
        .context("failed to clean up sent outbox records")?;
        Ok(result.rows_affected())
    }

    async fn count_by_status(&self) -> Result<HashMap<OutboxStatus, i64>> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS n FROM outbox_records GROUP BY status")
            .fetch_all(&self.pool)
            .await
            .context("failed to count outbox records")?;
        let mut counts = HashMap::new();
        for row in rows {
            let status: String = row.try_get("status")?;
            if let Some(status) = OutboxStatus::parse(&status) {
                counts.insert(status, row.try_get("n")?);
            }
        }
        Ok(counts)
    }

    async fn oldest_pending_age(&self) -> Result<Option<Duration>> {
        let row = sqlx::query(
            r#"
            SELECT EXTRACT(EPOCH FROM (NOW() - MIN(enqueued_at)))::BIGINT AS age_seconds
            FROM outbox_records
            WHERE status = 'pending'
            "#,
        )
        .fetch_one(&self.pool)
        .await
        .context("failed to compute oldest pending age")?;
        let age: Option<i64> = row.try_get("age_seconds")?;
        Ok(age.map(|secs| Duration::from_secs(secs.max(0) as u64)))
    }
}

/// Inbox store on `inbox_records`.
pub struct PostgresInboxRepository {
    pool: PgPool,
}

impl PostgresInboxRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn inbox_row(row: &sqlx::postgres::PgRow) -> Result<InboxRecord> {
    let status: String = row.try_get("status").context("inbox row missing status")?;
    Ok(InboxRecord {
        event_id: row.try_get("event_id").context("inbox row missing event_id")?,
        subject: row.try_get("subject").context("inbox row missing subject")?,
        payload: row.try_get("payload").context("inbox row missing payload")?,
        headers: headers_from_json(row.try_get("headers").ok()),
        stream: row.try_get("stream").unwrap_or(None),
        stream_sequence: row.try_get("stream_sequence").unwrap_or(None),
        status: InboxStatus::parse(&status)
            .ok_or_else(|| Error::RecordNotFound(format!("unknown inbox status '{status}'")))?,
        received_at: row.try_get("received_at").context("inbox row missing received_at")?,
        processed_at: row.try_get("processed_at").unwrap_or(None),
        deliveries: row.try_get("deliveries").context("inbox row missing deliveries")?,
        error_message: row.try_get("error_message").unwrap_or(None),
    })
}

#[async_trait]
impl InboxRepository for PostgresInboxRepository {
    async fn find_or_create(&self, record: &NewInboxRecord) -> Result<InboxRecord> {
        // The conflict arm bumps the delivery counter so the returned row
        // reflects this observation either way.
        let row = sqlx::query(
            r#"
            INSERT INTO inbox_records
                (event_id, subject, payload, headers, stream, stream_sequence,
                 status, received_at, deliveries)
            VALUES ($1, $2, $3, $4, $5, $6, 'processing', NOW(), 1)
            ON CONFLICT (event_id)
            DO UPDATE SET deliveries = inbox_records.deliveries + 1
            RETURNING *
            "#,
        )
        .bind(&record.event_id)
        .bind(&record.subject)
        .bind(&record.payload)
        .bind(headers_to_json(&record.headers)?)
        .bind(&record.stream)
        .bind(record.stream_sequence)
        .fetch_one(&self.pool)
        .await
        .context("failed to upsert inbox record")?;
        inbox_row(&row)
    }

    async fn mark_processed(&self, event_id: &str) -> Result<bool> {
        // Also admits 'failed': a handler that completes after the stale
        // sweeper gave up on the row still ran to success, and the health
        // view must say so.
        let result = sqlx::query(
            r#"
            UPDATE inbox_records
            SET status = 'processed', processed_at = NOW(), error_message = NULL
            WHERE event_id = $1 AND status IN ('processing', 'failed')
            "#,
        )
        .bind(event_id)
        .execute(&self.pool)
        .await
        .context("failed to mark inbox record processed")?;
        Ok(result.rows_affected() > 0)
    }

    async fn mark_failed(&self, event_id: &str, error: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE inbox_records
            SET status = 'failed', error_message = $2
            WHERE event_id = $1 AND status = 'processing'
            "#,
        )
        .bind(event_id)
        .bind(error)
        .execute(&self.pool)
        .await
        .context("failed to mark inbox record failed")?;
        Ok(result.rows_affected() > 0)
    }

    async fn reset_stale(&self, age: Duration) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE inbox_records
            SET status = 'failed', error_message = 'processing timeout'
            WHERE status = 'processing' AND received_at < $1
            "#,
        )
        .bind(cutoff(age))
        .execute(&self.pool)
        .await
        .context("failed to reset stale inbox rows")?;
        Ok(result.rows_affected())
    }

    async fn cleanup(&self, age: Duration) -> Result<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM inbox_records
            WHERE status = 'processed' AND processed_at < $1
            "#,
        )
        .bind(cutoff(age))
        .execute(&self.pool)
        .await
        .context("failed to clean up processed inbox rows")?;
        Ok(result.rows_affected())
    }

    async fn count_by_status(&self) -> Result<HashMap<InboxStatus, i64>> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS n FROM inbox_records GROUP BY status")
            .fetch_all(&self.pool)
            .await
            .context("failed to count inbox records")?;
        let mut counts = HashMap::new();
        for row in rows {
            let status: String = row.try_get("status")?;
            if let Some(status) = InboxStatus::parse(&status) {
                counts.insert(status, row.try_get("n")?);
            }
        }
        Ok(counts)
    }
}
