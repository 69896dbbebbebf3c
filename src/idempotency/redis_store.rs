use crate::error::StoreError;
use crate::idempotency::record::{IdempotencyRecord, RecordTransition};
use crate::idempotency::store::{CreateOutcome, IdempotencyStore, StoreResult};
use async_trait::async_trait;
use chrono::Utc;
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use uuid::Uuid;

const CREATE_ATTEMPTS: usize = 3;

/// Replaces the record only if it still belongs to ARGV[1], keeping its TTL.
const UPDATE_IF_CLAIMED: &str = r#"
local current = redis.call('GET', KEYS[1])
if not current then
    return 0
end
local record = cjson.decode(current)
if record['claim_id'] ~= ARGV[1] then
    return 0
end
redis.call('SET', KEYS[1], ARGV[2], 'KEEPTTL')
return 1
"#;

const DELETE_IF_FAILED: &str = r#"
local current = redis.call('GET', KEYS[1])
if not current then
    return 0
end
local record = cjson.decode(current)
if record['state'] ~= 'FAILED' then
    return 0
end
redis.call('DEL', KEYS[1])
return 1
"#;

/// Redis-backed store. Records are JSON values created with `SET NX PXAT`,
/// so expiry is enforced by Redis itself.
pub struct RedisIdempotencyStore {
    client: redis::Client,
    key_prefix: String,
    update_script: redis::Script,
    delete_failed_script: redis::Script,
}

impl RedisIdempotencyStore {
    pub fn new(client: redis::Client, key_prefix: impl Into<String>) -> Self {
        Self {
            client,
            key_prefix: key_prefix.into(),
            update_script: redis::Script::new(UPDATE_IF_CLAIMED),
            delete_failed_script: redis::Script::new(DELETE_IF_FAILED),
        }
    }

    fn make_key(&self, idempotency_key: &str) -> String {
        format!("{}:{}", self.key_prefix, idempotency_key)
    }

    async fn connection(&self) -> StoreResult<MultiplexedConnection> {
        Ok(self.client.get_multiplexed_async_connection().await?)
    }

    /// Reads the stored record whether or not the application clock
    /// considers it expired.
    async fn read_raw(
        &self,
        conn: &mut MultiplexedConnection,
        idempotency_key: &str,
    ) -> StoreResult<Option<IdempotencyRecord>> {
        let raw: Option<String> = conn.get(self.make_key(idempotency_key)).await?;

        match raw {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    async fn read(
        &self,
        conn: &mut MultiplexedConnection,
        idempotency_key: &str,
    ) -> StoreResult<Option<IdempotencyRecord>> {
        Ok(self
            .read_raw(conn, idempotency_key)
            .await?
            .filter(|record| !record.is_expired()))
    }
}

#[async_trait]
impl IdempotencyStore for RedisIdempotencyStore {
    async fn try_create(&self, record: &IdempotencyRecord) -> StoreResult<CreateOutcome> {
        let mut conn = self.connection().await?;
        let key = self.make_key(&record.idempotency_key);
        let payload = serde_json::to_string(record)?;
        let expires_at_ms = record.expires_at.timestamp_millis().max(0) as usize;

        for _ in 0..CREATE_ATTEMPTS {
            let created: Option<String> = conn
                .set_options(
                    &key,
                    &payload,
                    redis::SetOptions::default()
                        .conditional_set(redis::ExistenceCheck::NX)
                        .with_expiration(redis::SetExpiry::PXAT(expires_at_ms)),
                )
                .await?;

            if created.is_some() {
                return Ok(CreateOutcome::Created);
            }

            // Redis may still hold a key the application clock sees as
            // expired; the coordinator decides how to treat it.
            if let Some(existing) = self.read_raw(&mut conn, &record.idempotency_key).await? {
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
        let mut conn = self.connection().await?;

        let mut record = match self.read(&mut conn, key).await? {
            Some(record) if record.claim_id == claim_id => record,
            _ => return Ok(false),
        };
        record.apply(transition, Utc::now());
        let payload = serde_json::to_string(&record)?;

        let applied: i32 = self
            .update_script
            .key(self.make_key(key))
            .arg(claim_id.to_string())
            .arg(payload)
            .invoke_async(&mut conn)
            .await?;

        Ok(applied == 1)
    }

    async fn get(&self, key: &str) -> StoreResult<Option<IdempotencyRecord>> {
        let mut conn = self.connection().await?;
        self.read(&mut conn, key).await
    }

    async fn delete_failed(&self, key: &str) -> StoreResult<bool> {
        let mut conn = self.connection().await?;

        let deleted: i32 = self
            .delete_failed_script
            .key(self.make_key(key))
            .invoke_async(&mut conn)
            .await?;

        Ok(deleted == 1)
    }

    async fn cleanup_expired(&self) -> StoreResult<u64> {
        // Keys carry their own PXAT expiry.
        Ok(0)
    }

    async fn ping(&self) -> StoreResult<()> {
        let mut conn = self.connection().await?;
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "redis"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_make_key_uses_prefix() {
        let client = redis::Client::open("redis://127.0.0.1:6379").unwrap();
        let store = RedisIdempotencyStore::new(client, "idem");
        assert_eq!(store.make_key("order-42"), "idem:order-42");
    }

    #[test]
    fn test_record_json_carries_fields_scripts_read() {
        let record = IdempotencyRecord::claim("k", "fp", std::time::Duration::from_secs(5));
        let value: serde_json::Value = serde_json::to_value(&record).unwrap();

        assert_eq!(value["state"], "IN_PROGRESS");
        assert_eq!(value["claim_id"], record.claim_id.to_string());
    }
}
