use crate::error::Result;
use crate::idempotency::fingerprint::{hash_bytes, RequestFingerprinter};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Configuration for idempotency key generation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyGeneratorConfig {
    /// Prefix for generated keys
    pub key_prefix: String,
    /// Bucket derived keys into windows of this many seconds; `None` keeps
    /// derived keys stable forever.
    pub time_window_seconds: Option<i64>,
}

impl Default for KeyGeneratorConfig {
    fn default() -> Self {
        Self {
            key_prefix: "idem".to_string(),
            time_window_seconds: None,
        }
    }
}

/// Builds idempotency keys, either by normalizing a client-supplied key or
/// by deriving one from the operation inputs.
#[derive(Debug, Clone)]
pub struct IdempotencyKeyGenerator {
    config: KeyGeneratorConfig,
    fingerprinter: RequestFingerprinter,
}

impl IdempotencyKeyGenerator {
    pub fn new(config: KeyGeneratorConfig, fingerprinter: RequestFingerprinter) -> Self {
        Self {
            config,
            fingerprinter,
        }
    }

    pub fn with_default_config() -> Self {
        Self::new(KeyGeneratorConfig::default(), RequestFingerprinter::default())
    }

    /// Normalizes a client-provided key into a fixed-length key.
    pub fn from_client_key(&self, client_key: &str) -> String {
        format!("{}_{}", self.config.key_prefix, hash_bytes(client_key.trim().as_bytes()))
    }

    /// Derives a key from `scope` (e.g. the operation name) and its inputs.
    pub fn derive<T: Serialize + ?Sized>(&self, scope: &str, inputs: &T) -> Result<String> {
        self.derive_at(scope, inputs, Utc::now())
    }

    /// Derives a key as of `timestamp`, which only matters when a time
    /// window is configured.
    pub fn derive_at<T: Serialize + ?Sized>(
        &self,
        scope: &str,
        inputs: &T,
        timestamp: DateTime<Utc>,
    ) -> Result<String> {
        let fingerprint = self.fingerprinter.fingerprint(inputs)?;

        let mut material = format!("{}|{}", scope, fingerprint);
        if let Some(window) = self.time_window(timestamp) {
            material.push_str("|tw:");
            material.push_str(&window.to_string());
        }

        Ok(format!("{}_{}", self.config.key_prefix, hash_bytes(material.as_bytes())))
    }

    fn time_window(&self, timestamp: DateTime<Utc>) -> Option<i64> {
        self.config
            .time_window_seconds
            .filter(|seconds| *seconds > 0)
            .map(|seconds| timestamp.timestamp().div_euclid(seconds))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn at(rfc3339: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(rfc3339).unwrap().with_timezone(&Utc)
    }

    #[test]
    fn test_derived_key_is_deterministic() {
        let generator = IdempotencyKeyGenerator::with_default_config();
        let key1 = generator.derive("charge", &json!({"order": 42, "amount": 100})).unwrap();
        let key2 = generator.derive("charge", &json!({"amount": 100, "order": 42})).unwrap();

        assert_eq!(key1, key2);
        assert!(key1.starts_with("idem_"));
    }

    #[test]
    fn test_scope_separates_keys() {
        let generator = IdempotencyKeyGenerator::with_default_config();
        let inputs = json!({"order": 42});

        assert_ne!(
            generator.derive("charge", &inputs).unwrap(),
            generator.derive("refund", &inputs).unwrap()
        );
    }

    #[test]
    fn test_volatile_inputs_do_not_change_key() {
        let generator = IdempotencyKeyGenerator::with_default_config();
        let key1 = generator
            .derive("charge", &json!({"order": 42, "request_id": "a"}))
            .unwrap();
        let key2 = generator
            .derive("charge", &json!({"order": 42, "request_id": "b"}))
            .unwrap();

        assert_eq!(key1, key2);
    }

    #[test]
    fn test_time_window_buckets() {
        let generator = IdempotencyKeyGenerator::new(
            KeyGeneratorConfig {
                key_prefix: "test".to_string(),
                time_window_seconds: Some(3600),
            },
            RequestFingerprinter::default(),
        );
        let inputs = json!({"order": 42});

        let noon = generator.derive_at("charge", &inputs, at("2026-01-18T12:00:00Z")).unwrap();
        let half_past = generator.derive_at("charge", &inputs, at("2026-01-18T12:30:00Z")).unwrap();
        let later = generator.derive_at("charge", &inputs, at("2026-01-18T13:30:00Z")).unwrap();

        assert_eq!(noon, half_past);
        assert_ne!(noon, later);
        assert!(noon.starts_with("test_"));
    }

    #[test]
    fn test_without_window_time_is_ignored() {
        let generator = IdempotencyKeyGenerator::with_default_config();
        let inputs = json!({"order": 42});

        assert_eq!(
            generator.derive_at("charge", &inputs, at("2026-01-18T12:00:00Z")).unwrap(),
            generator.derive_at("charge", &inputs, at("2026-01-19T12:00:00Z")).unwrap()
        );
    }

    #[test]
    fn test_from_client_key() {
        let generator = IdempotencyKeyGenerator::with_default_config();

        let key1 = generator.from_client_key("my-unique-request-123");
        let key2 = generator.from_client_key(" my-unique-request-123 ");
        let key3 = generator.from_client_key("different-request");

        assert_eq!(key1, key2);
        assert_ne!(key1, key3);
        assert_eq!(key1.len(), "idem_".len() + 64);
    }
}
