//! PostgreSQL repositories for mailings and their recipients.
//!
//! All SQL lives in this module. The dispatch crate consumes it through its
//! own storage trait so the engine can be exercised without a database.

use std::sync::Arc;

use sqlx::PgPool;

pub mod mailings;
pub mod recipients;

use crate::error::Result;

/// Schema statements, applied idempotently by [`Storage::migrate`].
const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS mailings (
        id BIGSERIAL PRIMARY KEY,
        message_ids BIGINT[] NOT NULL DEFAULT '{}',
        status TEXT NOT NULL DEFAULT 'CREATED',
        scheduled_at TIMESTAMPTZ NOT NULL,
        started_at TIMESTAMPTZ,
        ended_at TIMESTAMPTZ,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        CONSTRAINT mailings_status_check CHECK (status IN
            ('CREATED', 'PENDING', 'RESUME', 'SENDING', 'PAUSED', 'SENT', 'FAILED')),
        CONSTRAINT mailings_ended_after_started CHECK
            (started_at IS NULL OR ended_at IS NULL OR ended_at >= started_at)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS mailing_recipients (
        id BIGSERIAL PRIMARY KEY,
        mailing_id BIGINT NOT NULL REFERENCES mailings(id) ON DELETE CASCADE,
        recipient_id BIGINT NOT NULL,
        status TEXT NOT NULL DEFAULT 'CREATED',
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        CONSTRAINT uq_mailing_recipient UNIQUE (mailing_id, recipient_id),
        CONSTRAINT mailing_recipients_status_check CHECK (status IN ('CREATED', 'SENT', 'FAILED'))
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_mailings_claimable
    ON mailings(scheduled_at)
    WHERE status IN ('CREATED', 'PENDING', 'RESUME')
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_mailing_recipients_ready
    ON mailing_recipients(mailing_id, id)
    WHERE status IN ('CREATED', 'FAILED')
    "#,
];

/// Entry point for all database operations.
#[derive(Clone)]
pub struct Storage {
    /// Repository for mailing rows.
    pub mailings: Arc<mailings::Repository>,

    /// Repository for recipient rows.
    pub recipients: Arc<recipients::Repository>,

    pool: Arc<PgPool>,
}

impl Storage {
    /// Creates a storage instance sharing one connection pool.
    pub fn new(pool: PgPool) -> Self {
        let pool = Arc::new(pool);

        Self {
            mailings: Arc::new(mailings::Repository::new(pool.clone())),
            recipients: Arc::new(recipients::Repository::new(pool.clone())),
            pool,
        }
    }

    /// Returns the shared connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Creates tables and indexes when they do not exist yet.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Database` if any statement fails.
    pub async fn migrate(&self) -> Result<()> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&*self.pool).await?;
        }
        Ok(())
    }

    /// Verifies database connectivity.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Database` if the connection is unhealthy.
    pub async fn health_check(&self) -> Result<()> {
        let _: (i32,) = sqlx::query_as("SELECT 1").fetch_one(&*self.pool).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn storage_can_be_created_without_connecting() {
        let pool = sqlx::postgres::PgPoolOptions::new()
            .connect_lazy("postgresql://herald@localhost/herald")
            .unwrap();
        let storage = Storage::new(pool);
        assert!(!storage.pool().is_closed());
    }

    #[test]
    fn schema_enforces_recipient_uniqueness() {
        assert!(SCHEMA.iter().any(|s| s.contains("UNIQUE (mailing_id, recipient_id)")));
    }
}
