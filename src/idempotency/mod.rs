pub mod cleanup;
pub mod coordinator;
pub mod fingerprint;
pub mod key_generator;
pub mod memory;
pub mod postgres;
pub mod record;
pub mod redis_store;
pub mod store;

pub use cleanup::IdempotencyCleanupJob;
pub use coordinator::{
    CoordinatorConfig, CoordinatorStats, FailurePolicy, IdempotencyCoordinator, StatsSnapshot,
    MAX_FINGERPRINT_LENGTH, MAX_KEY_LENGTH,
};
pub use fingerprint::{FingerprintConfig, RequestFingerprinter};
pub use key_generator::{IdempotencyKeyGenerator, KeyGeneratorConfig};
pub use memory::InMemoryIdempotencyStore;
pub use postgres::PostgresIdempotencyStore;
pub use record::{IdempotencyRecord, RecordState, RecordTransition};
pub use redis_store::RedisIdempotencyStore;
pub use store::{CreateOutcome, IdempotencyStore, StoreResult};
