//! Usage records
//!
//! One row per finalized paid operation, appended by the orchestrator after
//! the output is safely stored. Keyed by the reservation attempt id.

use async_trait::async_trait;
use serde::Serialize;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::LedgerResult;

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct GenerationRecord {
    pub id: Uuid,
    pub account_id: Uuid,
    pub attempt_id: Uuid,
    pub output_url: String,
    pub prompt: String,
    pub mime_type: String,
    pub cost: i64,
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone)]
pub struct NewGeneration {
    pub account_id: Uuid,
    pub attempt_id: Uuid,
    pub output_url: String,
    pub prompt: String,
    pub mime_type: String,
    pub cost: i64,
}

#[async_trait]
pub trait UsageStore: Send + Sync {
    async fn record_generation(&self, generation: NewGeneration) -> LedgerResult<()>;

    async fn generations_for_account(
        &self,
        account_id: Uuid,
        limit: i64,
    ) -> LedgerResult<Vec<GenerationRecord>>;
}

#[derive(Clone)]
pub struct PgUsageStore {
    pool: sqlx::PgPool,
}

impl PgUsageStore {
    pub fn new(pool: sqlx::PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl UsageStore for PgUsageStore {
    async fn record_generation(&self, generation: NewGeneration) -> LedgerResult<()> {
        sqlx::query(
            r#"
            INSERT INTO generations
                (account_id, attempt_id, output_url, prompt, mime_type, cost)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (attempt_id) DO NOTHING
            "#,
        )
        .bind(generation.account_id)
        .bind(generation.attempt_id)
        .bind(&generation.output_url)
        .bind(&generation.prompt)
        .bind(&generation.mime_type)
        .bind(generation.cost)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn generations_for_account(
        &self,
        account_id: Uuid,
        limit: i64,
    ) -> LedgerResult<Vec<GenerationRecord>> {
        let rows = sqlx::query_as::<_, GenerationRecord>(
            r#"
            SELECT id, account_id, attempt_id, output_url, prompt, mime_type, cost, created_at
            FROM generations
            WHERE account_id = $1
            ORDER BY created_at DESC
            LIMIT $2
            "#,
        )
        .bind(account_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }
}
