//! Repository for mailing rows.
//!
//! Owns the claim transaction: due mailings are selected with
//! `FOR UPDATE SKIP LOCKED` and flipped to `PENDING` before the transaction
//! commits, so concurrent dispatchers on any host partition the due set
//! between them instead of waiting on each other's row locks.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::PgPool;

use crate::{
    error::Result,
    models::{Mailing, MailingId, MailingStatus, NewMailing},
};

const MAILING_COLUMNS: &str =
    "id, message_ids, status, scheduled_at, started_at, ended_at, created_at, updated_at";

/// Repository for mailing database operations.
pub struct Repository {
    pool: Arc<PgPool>,
}

impl Repository {
    /// Creates a new repository instance.
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Claims up to `limit` due mailings for exclusive dispatch.
    ///
    /// Rows locked by a concurrent claimant are skipped rather than awaited,
    /// so contention yields fewer ids instead of blocking. The status update
    /// shares the locking transaction; if it fails nothing is claimed.
    ///
    /// # Errors
    ///
    /// Returns error if the transaction fails.
    pub async fn claim_due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<MailingId>> {
        let claimable = MailingStatus::CLAIMABLE.map(MailingStatus::as_str);
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);

        let mut tx = self.pool.begin().await?;

        let locked: Vec<MailingId> = sqlx::query_scalar(
            r#"
            SELECT id FROM mailings
            WHERE status = ANY($1)
              AND scheduled_at <= $2
            ORDER BY scheduled_at ASC, id ASC
            LIMIT $3
            FOR UPDATE SKIP LOCKED
            "#,
        )
        .bind(&claimable[..])
        .bind(now)
        .bind(limit)
        .fetch_all(&mut *tx)
        .await?;

        if locked.is_empty() {
            tx.rollback().await?;
            return Ok(Vec::new());
        }

        let claimed: Vec<MailingId> = sqlx::query_scalar(
            r#"
            UPDATE mailings
            SET status = $2, updated_at = NOW()
            WHERE id = ANY($1)
            RETURNING id
            "#,
        )
        .bind(&locked)
        .bind(MailingStatus::Pending.as_str())
        .fetch_all(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(claimed)
    }

    /// Inserts a mailing and its recipients in one transaction.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::ConstraintViolation` if a chat id is listed twice.
    pub async fn create(&self, mailing: &NewMailing) -> Result<MailingId> {
        let mut tx = self.pool.begin().await?;

        let id: MailingId = sqlx::query_scalar(
            r#"
            INSERT INTO mailings (message_ids, status, scheduled_at)
            VALUES ($1, $2, $3)
            RETURNING id
            "#,
        )
        .bind(&mailing.message_ids)
        .bind(MailingStatus::Created.as_str())
        .bind(mailing.scheduled_at)
        .fetch_one(&mut *tx)
        .await?;

        if !mailing.recipients.is_empty() {
            sqlx::query(
                r#"
                INSERT INTO mailing_recipients (mailing_id, recipient_id)
                SELECT $1, chat_id FROM UNNEST($2::BIGINT[]) WITH ORDINALITY AS r(chat_id, n)
                ORDER BY n
                "#,
            )
            .bind(id)
            .bind(&mailing.recipients)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(id)
    }

    /// Finds a mailing by id.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn find_by_id(&self, id: MailingId) -> Result<Option<Mailing>> {
        let mailing = sqlx::query_as::<_, Mailing>(&format!(
            "SELECT {MAILING_COLUMNS} FROM mailings WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&*self.pool)
        .await?;

        Ok(mailing)
    }

    /// Reads only the status column, used for the per-batch pause check.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn find_status(&self, id: MailingId) -> Result<Option<MailingStatus>> {
        let status = sqlx::query_scalar::<_, MailingStatus>(
            "SELECT status FROM mailings WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&*self.pool)
        .await?;

        Ok(status)
    }

    /// Sets the status of several mailings.
    ///
    /// # Errors
    ///
    /// Returns error if the update fails.
    pub async fn update_statuses(&self, ids: &[MailingId], status: MailingStatus) -> Result<u64> {
        if ids.is_empty() {
            return Ok(0);
        }

        let result = sqlx::query(
            "UPDATE mailings SET status = $2, updated_at = NOW() WHERE id = ANY($1)",
        )
        .bind(ids)
        .bind(status.as_str())
        .execute(&*self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    /// Moves a mailing to `SENDING` and opens a new dispatch epoch.
    ///
    /// `started_at` keeps its first value; `ended_at` is cleared so the run
    /// can record its own end.
    ///
    /// # Errors
    ///
    /// Returns error if the update fails.
    pub async fn start_sending(&self, id: MailingId, now: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE mailings
            SET status = $2,
                started_at = COALESCE(started_at, $3),
                ended_at = NULL,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(MailingStatus::Sending.as_str())
        .bind(now)
        .execute(&*self.pool)
        .await?;

        Ok(())
    }

    /// Terminates a dispatch run with `SENT` or `FAILED`.
    ///
    /// # Errors
    ///
    /// Returns error if the update fails.
    pub async fn finish_sending(
        &self,
        id: MailingId,
        success: bool,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let status = if success { MailingStatus::Sent } else { MailingStatus::Failed };

        sqlx::query(
            r#"
            UPDATE mailings
            SET status = $2,
                ended_at = COALESCE(ended_at, GREATEST($3, started_at)),
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(status.as_str())
        .bind(now)
        .execute(&*self.pool)
        .await?;

        Ok(())
    }

    /// Records the end of a run without touching the status.
    ///
    /// # Errors
    ///
    /// Returns error if the update fails.
    pub async fn mark_ended(&self, id: MailingId, now: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE mailings
            SET ended_at = COALESCE(ended_at, GREATEST($2, started_at)), updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(now)
        .execute(&*self.pool)
        .await?;

        Ok(())
    }

    /// Pauses a sending mailing. Returns `false` if it was not sending.
    ///
    /// # Errors
    ///
    /// Returns error if the update fails.
    pub async fn pause(&self, id: MailingId) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE mailings SET status = $2, updated_at = NOW() WHERE id = $1 AND status = $3",
        )
        .bind(id)
        .bind(MailingStatus::Paused.as_str())
        .bind(MailingStatus::Sending.as_str())
        .execute(&*self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Re-arms a paused or failed mailing so the next claim cycle picks it
    /// up. Returns `false` if the mailing was in any other status.
    ///
    /// # Errors
    ///
    /// Returns error if the update fails.
    pub async fn resume(&self, id: MailingId) -> Result<bool> {
        let resumable = [MailingStatus::Paused.as_str(), MailingStatus::Failed.as_str()];

        let result = sqlx::query(
            r#"
            UPDATE mailings
            SET status = $2, ended_at = NULL, updated_at = NOW()
            WHERE id = $1 AND status = ANY($3)
            "#,
        )
        .bind(id)
        .bind(MailingStatus::Resume.as_str())
        .bind(&resumable[..])
        .execute(&*self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }
}
