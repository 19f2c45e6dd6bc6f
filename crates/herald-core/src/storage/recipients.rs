//! Repository for mailing recipient rows.

use std::sync::Arc;

use sqlx::PgPool;

use crate::{
    error::Result,
    models::{MailingId, MailingRecipient, RecipientId, RecipientStatus},
};

const RECIPIENT_COLUMNS: &str = "id, mailing_id, recipient_id, status, created_at, updated_at";

/// Repository for recipient database operations.
pub struct Repository {
    pool: Arc<PgPool>,
}

impl Repository {
    /// Creates a new repository instance.
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Returns one page of recipients in the given statuses, oldest first.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn page(
        &self,
        mailing_id: MailingId,
        statuses: &[RecipientStatus],
        limit: usize,
        offset: usize,
    ) -> Result<Vec<MailingRecipient>> {
        let statuses: Vec<&str> = statuses.iter().map(|s| s.as_str()).collect();

        let recipients = sqlx::query_as::<_, MailingRecipient>(&format!(
            r#"
            SELECT {RECIPIENT_COLUMNS} FROM mailing_recipients
            WHERE mailing_id = $1 AND status = ANY($2)
            ORDER BY id ASC
            LIMIT $3 OFFSET $4
            "#
        ))
        .bind(mailing_id)
        .bind(&statuses)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .bind(i64::try_from(offset).unwrap_or(i64::MAX))
        .fetch_all(&*self.pool)
        .await?;

        Ok(recipients)
    }

    /// Sets the status of several recipients in one statement.
    ///
    /// # Errors
    ///
    /// Returns error if the update fails.
    pub async fn update_statuses(&self, ids: &[RecipientId], status: RecipientStatus) -> Result<u64> {
        if ids.is_empty() {
            return Ok(0);
        }

        let result = sqlx::query(
            "UPDATE mailing_recipients SET status = $2, updated_at = NOW() WHERE id = ANY($1)",
        )
        .bind(ids)
        .bind(status.as_str())
        .execute(&*self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    /// Lists every recipient of a mailing, oldest first.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn find_by_mailing(&self, mailing_id: MailingId) -> Result<Vec<MailingRecipient>> {
        let recipients = sqlx::query_as::<_, MailingRecipient>(&format!(
            "SELECT {RECIPIENT_COLUMNS} FROM mailing_recipients WHERE mailing_id = $1 ORDER BY id"
        ))
        .bind(mailing_id)
        .fetch_all(&*self.pool)
        .await?;

        Ok(recipients)
    }

    /// Counts recipients of a mailing in one status.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn count_by_status(
        &self,
        mailing_id: MailingId,
        status: RecipientStatus,
    ) -> Result<i64> {
        let count = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM mailing_recipients WHERE mailing_id = $1 AND status = $2",
        )
        .bind(mailing_id)
        .bind(status.as_str())
        .fetch_one(&*self.pool)
        .await?;

        Ok(count)
    }
}
