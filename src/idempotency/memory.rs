use crate::idempotency::record::{IdempotencyRecord, RecordTransition};
use crate::idempotency::store::{CreateOutcome, IdempotencyStore, StoreResult};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use tokio::sync::Mutex;
use uuid::Uuid;

/// Process-local store. The map lock is the compare-and-set primitive, so
/// this backend only arbitrates callers sharing the same instance.
#[derive(Debug, Default)]
pub struct InMemoryIdempotencyStore {
    records: Mutex<HashMap<String, IdempotencyRecord>>,
}

impl InMemoryIdempotencyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of records held, including expired ones not yet cleaned up.
    pub async fn len(&self) -> usize {
        self.records.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.lock().await.is_empty()
    }
}

#[async_trait]
impl IdempotencyStore for InMemoryIdempotencyStore {
    async fn try_create(&self, record: &IdempotencyRecord) -> StoreResult<CreateOutcome> {
        let mut records = self.records.lock().await;
        let now = Utc::now();

        if let Some(existing) = records.get(&record.idempotency_key) {
            if !existing.is_expired_at(now) {
                return Ok(CreateOutcome::AlreadyExists(existing.clone()));
            }
        }

        records.insert(record.idempotency_key.clone(), record.clone());
        Ok(CreateOutcome::Created)
    }

    async fn update(
        &self,
        key: &str,
        claim_id: Uuid,
        transition: RecordTransition,
    ) -> StoreResult<bool> {
        let mut records = self.records.lock().await;

        match records.get_mut(key) {
            Some(record) if record.claim_id == claim_id => {
                record.apply(transition, Utc::now());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn get(&self, key: &str) -> StoreResult<Option<IdempotencyRecord>> {
        let records = self.records.lock().await;
        let now = Utc::now();

        Ok(records
            .get(key)
            .filter(|record| !record.is_expired_at(now))
            .cloned())
    }

    async fn delete_failed(&self, key: &str) -> StoreResult<bool> {
        let mut records = self.records.lock().await;
        let now = Utc::now();

        let deletable = records
            .get(key)
            .map(|record| record.is_failed() && !record.is_expired_at(now))
            .unwrap_or(false);

        if deletable {
            records.remove(key);
        }
        Ok(deletable)
    }

    async fn cleanup_expired(&self) -> StoreResult<u64> {
        let mut records = self.records.lock().await;
        let now = Utc::now();
        let before = records.len();

        records.retain(|_, record| !record.is_expired_at(now));

        Ok((before - records.len()) as u64)
    }

    async fn ping(&self) -> StoreResult<()> {
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    #[tokio::test]
    async fn test_second_create_sees_existing_record() {
        let store = InMemoryIdempotencyStore::new();
        let first = IdempotencyRecord::claim("order-42", "fp-1", Duration::from_secs(60));
        let second = IdempotencyRecord::claim("order-42", "fp-2", Duration::from_secs(60));

        assert_eq!(store.try_create(&first).await.unwrap(), CreateOutcome::Created);

        match store.try_create(&second).await.unwrap() {
            CreateOutcome::AlreadyExists(existing) => {
                assert_eq!(existing.claim_id, first.claim_id);
                assert_eq!(existing.fingerprint, "fp-1");
            }
            other => panic!("expected AlreadyExists, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_expired_record_is_replaced() {
        let store = InMemoryIdempotencyStore::new();
        let stale = IdempotencyRecord::claim("k", "fp", Duration::ZERO);
        let fresh = IdempotencyRecord::claim("k", "fp", Duration::from_secs(60));

        store.try_create(&stale).await.unwrap();
        assert!(store.get("k").await.unwrap().is_none());

        assert_eq!(store.try_create(&fresh).await.unwrap(), CreateOutcome::Created);
        assert_eq!(store.get("k").await.unwrap().unwrap().claim_id, fresh.claim_id);
    }

    #[tokio::test]
    async fn test_update_requires_matching_claim() {
        let store = InMemoryIdempotencyStore::new();
        let record = IdempotencyRecord::claim("k", "fp", Duration::from_secs(60));
        store.try_create(&record).await.unwrap();

        let applied = store
            .update("k", Uuid::new_v4(), RecordTransition::Fail("x".to_string()))
            .await
            .unwrap();
        assert!(!applied);

        let applied = store
            .update("k", record.claim_id, RecordTransition::Complete(json!(1)))
            .await
            .unwrap();
        assert!(applied);

        // Re-applying is harmless.
        let applied = store
            .update("k", record.claim_id, RecordTransition::Complete(json!(1)))
            .await
            .unwrap();
        assert!(applied);

        let stored = store.get("k").await.unwrap().unwrap();
        assert!(stored.is_completed());
        assert_eq!(stored.result, Some(json!(1)));
    }

    #[tokio::test]
    async fn test_delete_failed_only_removes_failed() {
        let store = InMemoryIdempotencyStore::new();
        let record = IdempotencyRecord::claim("k", "fp", Duration::from_secs(60));
        store.try_create(&record).await.unwrap();

        assert!(!store.delete_failed("k").await.unwrap());

        store
            .update("k", record.claim_id, RecordTransition::Fail("boom".to_string()))
            .await
            .unwrap();
        assert!(store.delete_failed("k").await.unwrap());
        assert!(store.get("k").await.unwrap().is_none());
        assert!(!store.delete_failed("missing").await.unwrap());
    }

    #[tokio::test]
    async fn test_cleanup_expired() {
        let store = InMemoryIdempotencyStore::new();
        store
            .try_create(&IdempotencyRecord::claim("old", "fp", Duration::ZERO))
            .await
            .unwrap();
        store
            .try_create(&IdempotencyRecord::claim("new", "fp", Duration::from_secs(60)))
            .await
            .unwrap();

        assert_eq!(store.len().await, 2);
        assert_eq!(store.cleanup_expired().await.unwrap(), 1);
        assert_eq!(store.len().await, 1);
        assert!(store.get("new").await.unwrap().is_some());
    }
}
