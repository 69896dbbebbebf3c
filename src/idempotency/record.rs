use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use uuid::Uuid;

/// Lifecycle state of an idempotency record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RecordState {
    InProgress,
    Completed,
    Failed,
}

impl RecordState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordState::InProgress => "IN_PROGRESS",
            RecordState::Completed => "COMPLETED",
            RecordState::Failed => "FAILED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, RecordState::InProgress)
    }
}

/// Terminal write applied by the claim holder.
#[derive(Debug, Clone, PartialEq)]
pub enum RecordTransition {
    Complete(serde_json::Value),
    Fail(String),
}

impl RecordTransition {
    pub fn target_state(&self) -> RecordState {
        match self {
            RecordTransition::Complete(_) => RecordState::Completed,
            RecordTransition::Fail(_) => RecordState::Failed,
        }
    }
}

/// Stored idempotency record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct IdempotencyRecord {
    pub claim_id: Uuid,
    pub idempotency_key: String,
    pub fingerprint: String,
    pub state: RecordState,
    /// A completed operation that returned `()` or `None` stores
    /// `Some(Value::Null)`; `None` means no result was recorded.
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "deserialize_present_result"
    )]
    pub result: Option<serde_json::Value>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Maps a present `"result": null` to `Some(Value::Null)`. A missing
/// field falls back to `None` through `#[serde(default)]`.
fn deserialize_present_result<'de, D>(
    deserializer: D,
) -> std::result::Result<Option<serde_json::Value>, D::Error>
where
    D: Deserializer<'de>,
{
    serde_json::Value::deserialize(deserializer).map(Some)
}

impl IdempotencyRecord {
    /// Builds a fresh `InProgress` claim for `key` expiring after `ttl`.
    pub fn claim(
        idempotency_key: impl Into<String>,
        fingerprint: impl Into<String>,
        ttl: std::time::Duration,
    ) -> Self {
        let now = Utc::now();
        let ttl = Duration::from_std(ttl).unwrap_or(Duration::MAX);
        Self {
            claim_id: Uuid::new_v4(),
            idempotency_key: idempotency_key.into(),
            fingerprint: fingerprint.into(),
            state: RecordState::InProgress,
            result: None,
            error_message: None,
            created_at: now,
            expires_at: now.checked_add_signed(ttl).unwrap_or(DateTime::<Utc>::MAX_UTC),
            completed_at: None,
        }
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    pub fn is_in_progress(&self) -> bool {
        self.state == RecordState::InProgress
    }

    pub fn is_completed(&self) -> bool {
        self.state == RecordState::Completed
    }

    pub fn is_failed(&self) -> bool {
        self.state == RecordState::Failed
    }

    pub fn matches_fingerprint(&self, fingerprint: &str) -> bool {
        self.fingerprint == fingerprint
    }

    /// Applies a terminal transition in place. Re-applying the same
    /// transition leaves the record unchanged apart from `completed_at`.
    pub fn apply(&mut self, transition: RecordTransition, at: DateTime<Utc>) {
        self.state = transition.target_state();
        match transition {
            RecordTransition::Complete(value) => {
                self.result = Some(value);
                self.error_message = None;
            }
            RecordTransition::Fail(message) => {
                self.result = None;
                self.error_message = Some(message);
            }
        }
        self.completed_at = Some(at);
    }
}
