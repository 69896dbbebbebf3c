use crate::error::StoreError;
use crate::idempotency::record::{IdempotencyRecord, RecordTransition};
use crate::idempotency::store::{CreateOutcome, IdempotencyStore, StoreResult};
use async_trait::async_trait;
use chrono::Utc;
use sqlx::PgPool;
use uuid::Uuid;

const CREATE_ATTEMPTS: usize = 3;

/// PostgreSQL-backed store using an upsert as the compare-and-set.
pub struct PostgresIdempotencyStore {
    pool: PgPool,
}

impl PostgresIdempotencyStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Inserts the claim, or replaces an expired row. Returns the row only
    /// when this call wrote it.
    async fn insert_or_replace_expired(
        &self,
        record: &IdempotencyRecord,
    ) -> StoreResult<Option<IdempotencyRecord>> {
        let written = sqlx::query_as::<_, IdempotencyRecord>(
            r#"
            INSERT INTO idempotency_records (idempotency_key, claim_id, fingerprint, state, result, error_message, created_at, expires_at, completed_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (idempotency_key) DO UPDATE SET
                claim_id = EXCLUDED.claim_id,
                fingerprint = EXCLUDED.fingerprint,
                state = EXCLUDED.state,
                result = EXCLUDED.result,
                error_message = EXCLUDED.error_message,
                created_at = EXCLUDED.created_at,
                expires_at = EXCLUDED.expires_at,
                completed_at = EXCLUDED.completed_at
            WHERE idempotency_records.expires_at <= $10
            RETURNING claim_id, idempotency_key, fingerprint, state, result, error_message, created_at, expires_at, completed_at
            "#,
        )
        .bind(&record.idempotency_key)
        .bind(record.claim_id)
        .bind(&record.fingerprint)
        .bind(record.state)
        .bind(&record.result)
        .bind(&record.error_message)
        .bind(record.created_at)
        .bind(record.expires_at)
        .bind(record.completed_at)
        .bind(Utc::now())
        .fetch_optional(&self.pool)
        .await?;

        Ok(written)
    }
}

#[async_trait]
impl IdempotencyStore for PostgresIdempotencyStore {
    async fn try_create(&self, record: &IdempotencyRecord) -> StoreResult<CreateOutcome> {
        for _ in 0..CREATE_ATTEMPTS {
            if let Some(written) = self.insert_or_replace_expired(record).await? {
                if written.claim_id == record.claim_id {
                    return Ok(CreateOutcome::Created);
                }
            }

            // Conflict with a live row. It may vanish before we read it
            // (cleanup or expiry), in which case the insert is retried.
            if let Some(existing) = self.get(&record.idempotency_key).await? {
                return Ok(CreateOutcome::AlreadyExists(existing));
            }
        }

        Err(StoreError::Contended(record.idempotency_key.clone()))
    }

    async fn update(
        &self,
        key: &str,
        claim_id: Uuid,
        transition: RecordTransition,
    ) -> StoreResult<bool> {
        let state = transition.target_state();
        let (result, error_message) = match transition {
            RecordTransition::Complete(value) => (Some(value), None),
            RecordTransition::Fail(message) => (None, Some(message)),
        };

        let outcome = sqlx::query(
            r#"
            UPDATE idempotency_records
            SET state = $3, result = $4, error_message = $5, completed_at = $6
            WHERE idempotency_key = $1 AND claim_id = $2
            "#,
        )
        .bind(key)
        .bind(claim_id)
        .bind(state)
        .bind(result)
        .bind(error_message)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        Ok(outcome.rows_affected() > 0)
    }

    async fn get(&self, key: &str) -> StoreResult<Option<IdempotencyRecord>> {
        let record = sqlx::query_as::<_, IdempotencyRecord>(
            r#"
            SELECT claim_id, idempotency_key, fingerprint, state, result, error_message, created_at, expires_at, completed_at
            FROM idempotency_records
            WHERE idempotency_key = $1 AND expires_at > $2
            "#,
        )
        .bind(key)
        .bind(Utc::now())
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    async fn delete_failed(&self, key: &str) -> StoreResult<bool> {
        let outcome = sqlx::query(
            r#"
            DELETE FROM idempotency_records
            WHERE idempotency_key = $1 AND state = 'FAILED' AND expires_at > $2
            "#,
        )
        .bind(key)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        Ok(outcome.rows_affected() > 0)
    }

    async fn cleanup_expired(&self) -> StoreResult<u64> {
        let outcome = sqlx::query(
            r#"
            DELETE FROM idempotency_records
            WHERE expires_at <= $1
            "#,
        )
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        Ok(outcome.rows_affected())
    }

    async fn ping(&self) -> StoreResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "postgres"
    }
}
