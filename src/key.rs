//! Cache key derivation.
//! Key: `v1-` + 64-bit xor/multiply fold of the canonical descriptor serialization.
//! Bumping [`KEY_VERSION`] invalidates every previously cached key at once.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::descriptor::{DescriptorMeta, SynthesisDescriptor};

/// Version tag prefixed to every key.
pub const KEY_VERSION: &str = "v1";

const FOLD_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FOLD_PRIME: u64 = 0x0000_0100_0000_01b3;

/// Fixed-width fingerprint of a normalized descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CacheKey(String);

impl CacheKey {
    /// Wrap a key read back from storage or an archive manifest. No validation.
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for CacheKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Derive the cache key for a descriptor. Pure; never fails.
pub fn derive_key(descriptor: &SynthesisDescriptor) -> CacheKey {
    key_for_meta(&descriptor.resolve())
}

/// Derive the key from already-defaulted fields.
pub fn key_for_meta(meta: &DescriptorMeta) -> CacheKey {
    let hash = fold(meta.canonical().as_bytes());
    CacheKey(format!("{KEY_VERSION}-{hash:016x}"))
}

fn fold(bytes: &[u8]) -> u64 {
    bytes.iter().fold(FOLD_OFFSET, |hash, &b| {
        (hash ^ u64::from(b)).wrapping_mul(FOLD_PRIME)
    })
}

/// Digest of the fields used for semantic-duplicate detection on write.
/// Indexed by the stores so `put` never scans every record.
pub fn equivalence_digest(meta: &DescriptorMeta) -> String {
    let mut hasher = blake3::Hasher::new();
    for field in meta.equivalence_fields() {
        hasher.update(field.as_bytes());
        hasher.update(b"|");
    }
    hasher.finalize().to_hex().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equivalent_descriptors_share_a_key() {
        let a = SynthesisDescriptor::new("Well done!").with_lang("EN-us");
        let b = SynthesisDescriptor::new("  well   DONE! ").with_lang("en-US").with_rate(1.0);
        assert_eq!(derive_key(&a), derive_key(&b));
    }

    #[test]
    fn different_descriptors_get_different_keys() {
        let base = SynthesisDescriptor::new("Three");
        let keys = [
            derive_key(&base),
            derive_key(&base.clone().with_text("Four")),
            derive_key(&base.clone().with_voice("alloy")),
            derive_key(&base.clone().with_rate(1.25)),
            derive_key(&base.clone().with_format("wav")),
            derive_key(&base.clone().with_flavor("counting")),
        ];
        for (i, a) in keys.iter().enumerate() {
            for b in &keys[i + 1..] {
                assert_ne!(a, b);
            }
        }
    }

    #[test]
    fn signed_zero_pitch_shares_a_key() {
        let positive = SynthesisDescriptor::new("Ready").with_pitch(0.0);
        let negative = SynthesisDescriptor::new("Ready").with_pitch(-0.0);
        assert_eq!(positive.clone().resolve(), negative.clone().resolve());
        assert_eq!(derive_key(&positive), derive_key(&negative));
        assert_eq!(derive_key(&positive), derive_key(&SynthesisDescriptor::new("Ready")));
    }

    #[test]
    fn nearby_rates_get_distinct_keys() {
        let base = SynthesisDescriptor::new("Ready");
        assert_ne!(
            derive_key(&base.clone().with_rate(1.0)),
            derive_key(&base.clone().with_rate(1.0004))
        );
    }

    #[test]
    fn key_has_fixed_shape() {
        let key = derive_key(&SynthesisDescriptor::new("x"));
        assert!(key.as_str().starts_with("v1-"));
        assert_eq!(key.as_str().len(), KEY_VERSION.len() + 1 + 16);
        assert!(!key.as_str().contains('/'));
    }

    #[test]
    fn equivalence_ignores_rate_and_format() {
        let a = SynthesisDescriptor::new("Hello").with_rate(0.8).resolve();
        let b = SynthesisDescriptor::new("hello").with_format("wav").resolve();
        assert_eq!(equivalence_digest(&a), equivalence_digest(&b));
        assert_ne!(key_for_meta(&a), key_for_meta(&b));
    }
}
