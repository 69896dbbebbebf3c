//! Storage contract consumed by the coordinator.
//!
//! Any backend offering a conditional (compare-and-set) create can implement
//! [`IdempotencyStore`]. The coordinator never takes an in-process lock; all
//! arbitration between concurrent callers happens in [`IdempotencyStore::try_create`].

use crate::error::StoreError;
use crate::idempotency::record::{IdempotencyRecord, RecordTransition};
use async_trait::async_trait;
use uuid::Uuid;

/// Outcome of an atomic create attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum CreateOutcome {
    /// The caller now holds the claim for this key.
    Created,
    /// A record already exists for this key. Under clock skew between the
    /// application and the backend it may already look expired to the caller.
    AlreadyExists(IdempotencyRecord),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait IdempotencyStore: Send + Sync {
    /// Creates `record` unless a non-expired record exists for its key.
    /// An expired record is replaced as if it were absent.
    async fn try_create(&self, record: &IdempotencyRecord) -> StoreResult<CreateOutcome>;

    /// Writes a terminal state for `key` if `claim_id` still owns the record.
    /// Returns `false` when the claim was lost (record gone or re-claimed).
    async fn update(
        &self,
        key: &str,
        claim_id: Uuid,
        transition: RecordTransition,
    ) -> StoreResult<bool>;

    /// Returns the live record for `key`; expired records read as `None`.
    async fn get(&self, key: &str) -> StoreResult<Option<IdempotencyRecord>>;

    /// Deletes the record for `key` only if it is live and `Failed`.
    async fn delete_failed(&self, key: &str) -> StoreResult<bool>;

    /// Physically removes expired records, returning how many were deleted.
    async fn cleanup_expired(&self) -> StoreResult<u64>;

    /// Round-trips to the backend.
    async fn ping(&self) -> StoreResult<()>;

    /// Backend name for logs and health reports.
    fn backend_name(&self) -> &'static str;
}
