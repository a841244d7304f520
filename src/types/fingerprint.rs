//! Request fingerprints.
//!
//! A [`Fingerprint`] identifies the equivalence class of requests that may
//! share one cached response and one in-flight provider call. It is a
//! SHA-256 digest over the normalized prompt, the resolved model and the
//! sampling parameters. Caller identity and idempotency keys are not part of
//! it, so two tenants asking the same question share the answer.
//!
//! The digest is stable across processes (unlike `DefaultHasher`), which lets
//! an external key-value store hold cache entries.

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::{Message, SamplingParams};

/// Bumped whenever the digest input layout changes.
const FINGERPRINT_VERSION: &str = "pg1";

/// Deterministic digest of a request's cache-relevant content.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Compute the fingerprint for a prompt, resolved model and parameters.
    pub fn compute(messages: &[Message], model: &str, params: &SamplingParams) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(FINGERPRINT_VERSION.as_bytes());
        update_field(&mut hasher, "model", model.trim().as_bytes());

        for message in messages {
            update_field(&mut hasher, "role", message.role.as_str().as_bytes());
            update_field(
                &mut hasher,
                "content",
                message.normalized_content().as_bytes(),
            );
        }

        update_field(&mut hasher, "temperature", &opt_f32(params.temperature));
        update_field(&mut hasher, "max_tokens", &opt_u64(params.max_tokens.map(u64::from)));
        update_field(&mut hasher, "top_p", &opt_f32(params.top_p));
        update_field(
            &mut hasher,
            "frequency_penalty",
            &opt_f32(params.frequency_penalty),
        );
        update_field(
            &mut hasher,
            "presence_penalty",
            &opt_f32(params.presence_penalty),
        );
        update_field(&mut hasher, "seed", &opt_u64(params.seed));
        match &params.stop {
            Some(stops) => {
                for stop in stops {
                    update_field(&mut hasher, "stop", stop.as_bytes());
                }
            }
            None => update_field(&mut hasher, "stop", b"-"),
        }

        Self(hex::encode(hasher.finalize()))
    }

    /// Wrap an already-computed digest (e.g. read back from a store).
    pub fn from_hex(digest: impl Into<String>) -> Self {
        Self(digest.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short prefix for log lines.
    pub fn short(&self) -> &str {
        &self.0[..12.min(self.0.len())]
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Length-prefixed, labelled field so adjacent values cannot run together.
fn update_field(hasher: &mut Sha256, label: &str, value: &[u8]) {
    hasher.update(label.as_bytes());
    hasher.update((value.len() as u64).to_le_bytes());
    hasher.update(value);
}

fn opt_f32(value: Option<f32>) -> Vec<u8> {
    match value {
        // -0.0 and 0.0 sample identically
        Some(v) if v == 0.0 => 0f32.to_le_bytes().to_vec(),
        Some(v) => v.to_le_bytes().to_vec(),
        None => b"-".to_vec(),
    }
}

fn opt_u64(value: Option<u64>) -> Vec<u8> {
    match value {
        Some(v) => v.to_le_bytes().to_vec(),
        None => b"-".to_vec(),
    }
}
