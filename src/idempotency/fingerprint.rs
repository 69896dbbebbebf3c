use crate::error::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

/// Configuration for request fingerprinting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FingerprintConfig {
    /// Object fields ignored at any depth (timestamps, request ids).
    pub volatile_fields: Vec<String>,
}

impl Default for FingerprintConfig {
    fn default() -> Self {
        Self {
            volatile_fields: ["timestamp", "request_id", "requestId", "trace_id", "created_at"]
                .iter()
                .map(|field| field.to_string())
                .collect(),
        }
    }
}

/// Hashes the semantically relevant part of a request payload.
#[derive(Debug, Clone, Default)]
pub struct RequestFingerprinter {
    config: FingerprintConfig,
}

impl RequestFingerprinter {
    pub fn new(config: FingerprintConfig) -> Self {
        Self { config }
    }

    /// SHA-256 (hex) of the canonical JSON form of `request` with volatile
    /// fields removed. Object keys are emitted in sorted order, so field
    /// order in the source type does not matter.
    pub fn fingerprint<T: Serialize + ?Sized>(&self, request: &T) -> Result<String> {
        let mut value = serde_json::to_value(request)?;
        self.strip_volatile(&mut value);

        let canonical = serde_json::to_vec(&value)?;
        Ok(hash_bytes(&canonical))
    }

    fn strip_volatile(&self, value: &mut Value) {
        match value {
            Value::Object(map) => {
                for field in &self.config.volatile_fields {
                    map.remove(field);
                }
                for nested in map.values_mut() {
                    self.strip_volatile(nested);
                }
            }
            Value::Array(items) => {
                for item in items {
                    self.strip_volatile(item);
                }
            }
            _ => {}
        }
    }
}

pub(crate) fn hash_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}
