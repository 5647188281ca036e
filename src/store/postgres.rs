//! Postgres session store
//!
//! The session body is stored as JSONB next to the columns the store filters
//! on. CAS is a single `UPDATE ... WHERE version = $expected`, so concurrent
//! writers are serialised by the row lock and the loser sees zero rows.
//!
//! NOTE: runtime-checked `sqlx::query()` is used because the table is created
//! by a migration that may not exist at compile time.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use tracing::{info, warn};
use uuid::Uuid;

use super::{SessionStore, StoreError};
use crate::types::VerificationSession;

pub struct PgSessionStore {
    pool: PgPool,
}

impl PgSessionStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Check the migration has been applied before serving traffic
    pub async fn verify_schema(&self) -> Result<(), StoreError> {
        info!("verifying verification session schema");

        let row = sqlx::query(
            r#"
            SELECT COUNT(*) AS count
            FROM information_schema.tables
            WHERE table_schema = 'idv'
            AND table_name = 'verification_sessions'
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        let count: i64 = row.get("count");
        if count < 1 {
            warn!("idv.verification_sessions not found; apply migrations/0001_verification_sessions.sql");
            return Err(StoreError::SchemaMissing(
                "idv.verification_sessions".to_string(),
            ));
        }

        info!("verification session schema present");
        Ok(())
    }

    fn decode(body: serde_json::Value) -> Result<VerificationSession, StoreError> {
        Ok(serde_json::from_value(body)?)
    }
}

fn to_db_version(version: u64) -> Result<i64, StoreError> {
    i64::try_from(version).map_err(|_| StoreError::Backend(format!("version overflow: {}", version)))
}

#[async_trait]
impl SessionStore for PgSessionStore {
    async fn insert(&self, session: &VerificationSession) -> Result<bool, StoreError> {
        let body = serde_json::to_value(session)?;
        let result = sqlx::query(
            r#"
            INSERT INTO idv.verification_sessions
                (session_id, tenant_id, subject_id, status, is_terminal, version, body, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (session_id) DO NOTHING
            "#,
        )
        .bind(session.id)
        .bind(&session.tenant_id)
        .bind(&session.subject_id)
        .bind(session.status.as_str())
        .bind(session.is_terminal())
        .bind(to_db_version(session.version)?)
        .bind(body)
        .bind(session.created_at)
        .bind(session.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn load(&self, id: Uuid) -> Result<Option<VerificationSession>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT body
            FROM idv.verification_sessions
            WHERE session_id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| Self::decode(r.get("body"))).transpose()
    }

    async fn compare_and_swap(
        &self,
        session: &VerificationSession,
        expected_version: u64,
    ) -> Result<bool, StoreError> {
        let body = serde_json::to_value(session)?;
        let result = sqlx::query(
            r#"
            UPDATE idv.verification_sessions
            SET status = $2,
                is_terminal = $3,
                version = $4,
                body = $5,
                updated_at = $6
            WHERE session_id = $1 AND version = $7
            "#,
        )
        .bind(session.id)
        .bind(session.status.as_str())
        .bind(session.is_terminal())
        .bind(to_db_version(session.version)?)
        .bind(body)
        .bind(session.updated_at)
        .bind(to_db_version(expected_version)?)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn list_terminal_since(
        &self,
        since: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<VerificationSession>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT body
            FROM idv.verification_sessions
            WHERE is_terminal AND updated_at >= $1
            ORDER BY updated_at DESC
            LIMIT $2
            "#,
        )
        .bind(since)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(|r| Self::decode(r.get("body"))).collect()
    }
}
