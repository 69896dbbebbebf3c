//! At-most-once execution of mutating operations keyed by an idempotency key.
//!
//! The first caller to win [`IdempotencyStore::try_create`] for a key is the
//! only executor of that key's current generation. Every other caller is a
//! follower: it replays the stored result, replays the stored failure, or
//! waits (bounded) for the executor to finish. A generation ends when its
//! record expires; the next caller then starts a fresh one.

use crate::error::{AppError, Result, StoreError};
use crate::idempotency::fingerprint::RequestFingerprinter;
use crate::idempotency::record::{IdempotencyRecord, RecordState, RecordTransition};
use crate::idempotency::store::{CreateOutcome, IdempotencyStore};
use crate::observability::{get_metrics, mask_sensitive, LatencyTimer};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Longest idempotency key accepted, matching the `idempotency_key` column.
pub const MAX_KEY_LENGTH: usize = 255;

/// Longest fingerprint accepted, matching the `fingerprint` column.
pub const MAX_FINGERPRINT_LENGTH: usize = 128;

/// What followers do when they find a `Failed` record for their request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Replay the stored failure until the record expires.
    Terminal,
    /// Drop the failed record and compete for a fresh claim.
    RetryFailed,
}

impl Default for FailurePolicy {
    fn default() -> Self {
        FailurePolicy::Terminal
    }
}

/// Configuration for the coordinator.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub default_ttl: Duration,
    /// Upper bound a follower waits on an `InProgress` record.
    pub max_wait: Duration,
    pub poll_interval: Duration,
    pub max_poll_interval: Duration,
    pub failure_policy: FailurePolicy,
    /// Attempts for each terminal write before giving up.
    pub completion_write_attempts: u32,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            default_ttl: Duration::from_secs(86400),
            max_wait: Duration::from_secs(10),
            poll_interval: Duration::from_millis(50),
            max_poll_interval: Duration::from_secs(1),
            failure_policy: FailurePolicy::Terminal,
            completion_write_attempts: 3,
        }
    }
}

/// In-process counters for one coordinator.
#[derive(Debug, Default)]
pub struct CoordinatorStats {
    pub total_requests: AtomicU64,
    pub executed: AtomicU64,
    pub replayed: AtomicU64,
    pub replayed_failures: AtomicU64,
    pub fingerprint_conflicts: AtomicU64,
    pub waits: AtomicU64,
    pub wait_timeouts: AtomicU64,
    pub operation_failures: AtomicU64,
    pub store_errors: AtomicU64,
}

impl CoordinatorStats {
    pub fn new() -> Self {
        Self::default()
    }

    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            total_requests: self.total_requests.load(Ordering::Relaxed),
            executed: self.executed.load(Ordering::Relaxed),
            replayed: self.replayed.load(Ordering::Relaxed),
            replayed_failures: self.replayed_failures.load(Ordering::Relaxed),
            fingerprint_conflicts: self.fingerprint_conflicts.load(Ordering::Relaxed),
            waits: self.waits.load(Ordering::Relaxed),
            wait_timeouts: self.wait_timeouts.load(Ordering::Relaxed),
            operation_failures: self.operation_failures.load(Ordering::Relaxed),
            store_errors: self.store_errors.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub total_requests: u64,
    pub executed: u64,
    pub replayed: u64,
    pub replayed_failures: u64,
    pub fingerprint_conflicts: u64,
    /// Follower episodes that slept at least once.
    pub waits: u64,
    pub wait_timeouts: u64,
    pub operation_failures: u64,
    pub store_errors: u64,
}

impl StatsSnapshot {
    pub fn replay_rate(&self) -> f64 {
        if self.total_requests == 0 {
            0.0
        } else {
            self.replayed as f64 / self.total_requests as f64
        }
    }
}

/// Wait budget shared by every follower episode of one call.
struct WaitState {
    started: Instant,
    deadline: Instant,
    poll_interval: Duration,
    expired_retry_used: bool,
}

/// How a follower should proceed after inspecting an existing record.
enum Resolution<T> {
    Replay(T),
    Wait,
    Reclaim,
}

/// Guarantees that an operation runs at most once per key and fingerprint.
pub struct IdempotencyCoordinator {
    store: Arc<dyn IdempotencyStore>,
    fingerprinter: RequestFingerprinter,
    config: CoordinatorConfig,
    stats: Arc<CoordinatorStats>,
}

impl IdempotencyCoordinator {
    pub fn new(store: Arc<dyn IdempotencyStore>, config: CoordinatorConfig) -> Self {
        Self {
            store,
            fingerprinter: RequestFingerprinter::default(),
            config,
            stats: Arc::new(CoordinatorStats::new()),
        }
    }

    pub fn with_fingerprinter(mut self, fingerprinter: RequestFingerprinter) -> Self {
        self.fingerprinter = fingerprinter;
        self
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    pub fn store(&self) -> Arc<dyn IdempotencyStore> {
        Arc::clone(&self.store)
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Runs `operation` at most once for `key`, fingerprinting `request` and
    /// using the configured default TTL.
    pub async fn execute_request<R, T, F, Fut>(
        &self,
        key: &str,
        request: &R,
        operation: F,
    ) -> Result<T>
    where
        R: Serialize + ?Sized,
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let fingerprint = self.fingerprinter.fingerprint(request)?;
        self.execute(key, &fingerprint, self.config.default_ttl, operation)
            .await
    }

    /// Runs `operation` at most once for `key`.
    ///
    /// Callers repeating the same `key` and `fingerprint` before `ttl`
    /// elapses get the first execution's result, or its error message as
    /// [`AppError::PreviouslyFailed`]. The executing caller receives the
    /// operation's own error unchanged.
    pub async fn execute<T, F, Fut>(
        &self,
        key: &str,
        fingerprint: &str,
        ttl: Duration,
        operation: F,
    ) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        CoordinatorStats::bump(&self.stats.total_requests);
        validate_request(key, fingerprint, ttl)?;

        let outcome = self.coordinate(key, fingerprint, ttl, operation).await;

        let label = match &outcome {
            Ok((_, true)) => "executed",
            Ok((_, false)) => "replayed",
            Err(e) => e.kind(),
        };
        get_metrics().record_execution(self.store.backend_name(), label);

        outcome.map(|(value, _)| value)
    }

    /// Returns `(value, executed_here)`.
    async fn coordinate<T, F, Fut>(
        &self,
        key: &str,
        fingerprint: &str,
        ttl: Duration,
        operation: F,
    ) -> Result<(T, bool)>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let masked_key = mask_sensitive(key, 4);
        let started = Instant::now();
        let mut wait = WaitState {
            started,
            deadline: started + self.config.max_wait,
            poll_interval: self.config.poll_interval,
            expired_retry_used: false,
        };

        loop {
            let claim = IdempotencyRecord::claim(key, fingerprint, ttl);
            let outcome = self
                .store
                .try_create(&claim)
                .await
                .map_err(|e| self.store_failure("try_create", e))?;

            let existing = match outcome {
                CreateOutcome::Created => {
                    get_metrics().record_claim(self.store.backend_name());
                    debug!(key = %masked_key, claim_id = %claim.claim_id, "Claimed idempotency key");
                    let value = self.run_claimed(claim, operation).await?;
                    return Ok((value, true));
                }
                CreateOutcome::AlreadyExists(existing) => existing,
            };

            let follow_started = Instant::now();
            let mut slept = false;
            let followed = self
                .follow::<T>(key, fingerprint, existing, &mut wait, &mut slept)
                .await;

            if slept {
                CoordinatorStats::bump(&self.stats.waits);
                get_metrics().record_wait_latency(follow_started.elapsed().as_secs_f64() * 1000.0);
            }

            if let Some(value) = followed? {
                CoordinatorStats::bump(&self.stats.replayed);
                return Ok((value, false));
            }
        }
    }

    /// Follower path: inspects `existing` and keeps polling while the
    /// executor runs. `Ok(None)` sends the caller back to `try_create`.
    async fn follow<T: DeserializeOwned>(
        &self,
        key: &str,
        fingerprint: &str,
        mut existing: IdempotencyRecord,
        wait: &mut WaitState,
        slept: &mut bool,
    ) -> Result<Option<T>> {
        let masked_key = mask_sensitive(key, 4);

        loop {
            if existing.is_expired() {
                if !wait.expired_retry_used {
                    wait.expired_retry_used = true;
                    debug!(key = %masked_key, "Existing record already expired, retrying claim");
                    return Ok(None);
                }
            } else {
                match self.resolve::<T>(key, fingerprint, &existing).await? {
                    Resolution::Replay(value) => return Ok(Some(value)),
                    Resolution::Reclaim => return Ok(None),
                    Resolution::Wait => {}
                }
            }

            let now = Instant::now();
            if now >= wait.deadline {
                let waited = now.duration_since(wait.started);
                CoordinatorStats::bump(&self.stats.wait_timeouts);
                get_metrics().record_wait_timeout(self.store.backend_name());
                warn!(key = %masked_key, ?waited, "Gave up waiting on in-flight execution");
                return Err(AppError::ConcurrentExecutionTimeout {
                    key: key.to_string(),
                    waited,
                });
            }

            tokio::time::sleep(wait.poll_interval.min(wait.deadline - now)).await;
            *slept = true;
            wait.poll_interval = (wait.poll_interval * 2).min(self.config.max_poll_interval);

            match self
                .store
                .get(key)
                .await
                .map_err(|e| self.store_failure("get", e))?
            {
                Some(current) => existing = current,
                None => return Ok(None),
            }
        }
    }

    /// Decides what a follower does with a live record.
    async fn resolve<T: DeserializeOwned>(
        &self,
        key: &str,
        fingerprint: &str,
        existing: &IdempotencyRecord,
    ) -> Result<Resolution<T>> {
        if !existing.matches_fingerprint(fingerprint) {
            CoordinatorStats::bump(&self.stats.fingerprint_conflicts);
            get_metrics().record_fingerprint_conflict(self.store.backend_name());
            warn!(
                key = %mask_sensitive(key, 4),
                "Idempotency key reused with a different request"
            );
            return Err(AppError::FingerprintMismatch {
                key: key.to_string(),
            });
        }

        match existing.state {
            RecordState::Completed => {
                let stored = existing.result.clone().ok_or_else(|| {
                    AppError::Internal(anyhow::anyhow!(
                        "Completed idempotency record has no result"
                    ))
                })?;
                Ok(Resolution::Replay(serde_json::from_value(stored)?))
            }
            RecordState::Failed => match self.config.failure_policy {
                FailurePolicy::Terminal => {
                    CoordinatorStats::bump(&self.stats.replayed_failures);
                    Err(AppError::PreviouslyFailed {
                        key: key.to_string(),
                        message: existing.error_message.clone().unwrap_or_default(),
                    })
                }
                FailurePolicy::RetryFailed => {
                    // Losing this race is fine: the subsequent create decides.
                    self.store
                        .delete_failed(key)
                        .await
                        .map_err(|e| self.store_failure("delete_failed", e))?;
                    Ok(Resolution::Reclaim)
                }
            },
            RecordState::InProgress => Ok(Resolution::Wait),
        }
    }

    /// Executes the operation under a won claim and persists its outcome.
    async fn run_claimed<T, F, Fut>(&self, claim: IdempotencyRecord, operation: F) -> Result<T>
    where
        T: Serialize,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        CoordinatorStats::bump(&self.stats.executed);
        let timer = LatencyTimer::new();
        let outcome = operation().await;
        get_metrics().record_operation_latency(timer.elapsed_ms(), outcome.is_ok());

        match outcome {
            Ok(value) => match serde_json::to_value(&value) {
                Ok(stored) => {
                    self.persist(&claim, RecordTransition::Complete(stored)).await;
                    Ok(value)
                }
                Err(e) => {
                    CoordinatorStats::bump(&self.stats.operation_failures);
                    let message = format!("Failed to serialize operation result: {}", e);
                    self.persist(&claim, RecordTransition::Fail(message)).await;
                    Err(AppError::Serialization(e))
                }
            },
            Err(e) => {
                CoordinatorStats::bump(&self.stats.operation_failures);
                self.persist(&claim, RecordTransition::Fail(e.to_string())).await;
                Err(e)
            }
        }
    }

    /// Writes the terminal state, retrying because the write is idempotent.
    /// The operation already ran, so a persistent failure is logged rather
    /// than replacing the operation's outcome.
    async fn persist(&self, claim: &IdempotencyRecord, transition: RecordTransition) {
        let key = &claim.idempotency_key;
        let attempts = self.config.completion_write_attempts.max(1);
        let mut backoff = self.config.poll_interval;

        for attempt in 1..=attempts {
            match self
                .store
                .update(key, claim.claim_id, transition.clone())
                .await
            {
                Ok(true) => {
                    debug!(
                        key = %mask_sensitive(key, 4),
                        state = transition.target_state().as_str(),
                        "Recorded terminal state"
                    );
                    return;
                }
                Ok(false) => {
                    get_metrics().record_lost_claim(self.store.backend_name());
                    warn!(
                        key = %mask_sensitive(key, 4),
                        claim_id = %claim.claim_id,
                        "Claim expired before the outcome was recorded"
                    );
                    return;
                }
                Err(e) => {
                    self.store_failure("update", e);
                    if attempt < attempts {
                        tokio::time::sleep(backoff).await;
                        backoff = (backoff * 2).min(self.config.max_poll_interval);
                    }
                }
            }
        }

        error!(
            key = %mask_sensitive(key, 4),
            claim_id = %claim.claim_id,
            attempts,
            "Failed to record terminal state; key stays in progress until it expires"
        );
    }

    /// Returns the live record for `key`, if any.
    pub async fn lookup(&self, key: &str) -> Result<Option<IdempotencyRecord>> {
        self.store
            .get(key)
            .await
            .map_err(|e| self.store_failure("get", e))
    }

    /// Removes a `Failed` record so the key can be executed again.
    pub async fn clear_failure(&self, key: &str) -> Result<bool> {
        let cleared = self
            .store
            .delete_failed(key)
            .await
            .map_err(|e| self.store_failure("delete_failed", e))?;

        if cleared {
            info!(key = %mask_sensitive(key, 4), "Cleared failed idempotency record");
        }
        Ok(cleared)
    }

    /// Physically removes expired records from the store.
    pub async fn cleanup_expired(&self) -> Result<u64> {
        let removed = self
            .store
            .cleanup_expired()
            .await
            .map_err(|e| self.store_failure("cleanup_expired", e))?;

        get_metrics().record_cleanup(self.store.backend_name(), removed);
        Ok(removed)
    }

    fn store_failure(&self, operation: &str, e: StoreError) -> AppError {
        CoordinatorStats::bump(&self.stats.store_errors);
        get_metrics().record_store_error(self.store.backend_name(), operation);
        error!(backend = self.store.backend_name(), operation, "Idempotency store call failed: {}", e);
        AppError::StoreUnavailable(e)
    }
}

fn validate_request(key: &str, fingerprint: &str, ttl: Duration) -> Result<()> {
    if key.trim().is_empty() {
        return Err(AppError::Validation("Idempotency key must not be empty".to_string()));
    }
    if key.chars().count() > MAX_KEY_LENGTH {
        return Err(AppError::Validation(format!(
            "Idempotency key exceeds {} characters",
            MAX_KEY_LENGTH
        )));
    }
    if fingerprint.is_empty() {
        return Err(AppError::Validation("Request fingerprint must not be empty".to_string()));
    }
    if fingerprint.chars().count() > MAX_FINGERPRINT_LENGTH {
        return Err(AppError::Validation(format!(
            "Request fingerprint exceeds {} characters",
            MAX_FINGERPRINT_LENGTH
        )));
    }
    if ttl.is_zero() {
        return Err(AppError::Validation("TTL must be positive".to_string()));
    }
    Ok(())
}
