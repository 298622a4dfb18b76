//! Deterministic key hashing used to place keys into percentage buckets.
//!
//! Buckets must agree bit-for-bit with the ones computed by the server and by every other SDK, so
//! both algorithms are checked against a fixed table of reference vectors.
use std::io::Cursor;

use serde::{Deserialize, Serialize};

/// Hashing algorithm of a flag.
///
/// On the wire, `2` selects Murmur3. Anything else (including a missing field) selects the legacy
/// hash.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "i32", into = "i32")]
pub enum Algo {
    #[default]
    Legacy,
    Murmur3,
}

impl From<i32> for Algo {
    fn from(value: i32) -> Self {
        match value {
            2 => Algo::Murmur3,
            _ => Algo::Legacy,
        }
    }
}

impl From<Algo> for i32 {
    fn from(value: Algo) -> Self {
        match value {
            Algo::Legacy => 1,
            Algo::Murmur3 => 2,
        }
    }
}

/// Rolling `31 * h + c` hash over UTF-16 code units, xor-ed with `seed`.
pub fn legacy_hash(key: &str, seed: i32) -> i32 {
    let h = key
        .encode_utf16()
        .fold(0i32, |h, unit| h.wrapping_mul(31).wrapping_add(i32::from(unit)));
    h ^ seed
}

/// 32-bit Murmur3 (x86 variant) of the UTF-8 bytes of `key`.
pub fn murmur3_hash(key: &str, seed: i32) -> u32 {
    // Reading from an in-memory slice cannot fail.
    murmur3::murmur3_32(&mut Cursor::new(key.as_bytes()), seed as u32).unwrap_or_default()
}

/// Hash `key` with the given algorithm. The result is widened to `i64` so that both the signed
/// legacy hash and the unsigned Murmur3 hash are represented exactly.
pub fn hash(key: &str, seed: i32, algo: Algo) -> i64 {
    match algo {
        Algo::Legacy => i64::from(legacy_hash(key, seed)),
        Algo::Murmur3 => i64::from(murmur3_hash(key, seed)),
    }
}

/// Bucket of `key` in `[0, 100)`.
pub fn bucket(key: &str, seed: i32, algo: Algo) -> u32 {
    // `% 100` keeps the sign of the hash, so the absolute value is taken afterwards. The result is
    // always below 100.
    (hash(key, seed, algo) % 100).unsigned_abs() as u32
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::{bucket, hash, legacy_hash, murmur3_hash, Algo};

    #[test]
    fn murmur3_reference_uuid() {
        let key = "0bac8bc0-1a75-0136-46fe-0242ac11510f";
        assert_eq!(murmur3_hash(key, 467569525), 1127423255);
        assert_eq!(bucket(key, 467569525, Algo::Murmur3), 55);
    }

    // (key, seed, murmur3 hash, murmur3 bucket, legacy hash, legacy bucket)
    const VECTORS: &[(&str, i32, u32, u32, i32, u32)] = &[
        ("user_1", 1, 3102732882, 82, -836030276, 76),
        ("key", -1, 1805980261, 61, -106080, 80),
        ("abc", 123456, 2826323210, 10, 39458, 58),
        ("a1b2c3", -987654321, 2550557350, 50, 1833205631, 31),
        ("test@split.io", 42, 1139011959, 59, 1321078850, 50),
        ("", 7, 415870660, 60, 7, 7),
        ("café", 10, 3485567506, 6, 3045931, 31),
        ("日本", -5, 2208574607, 7, -835044, 44),
    ];

    #[test]
    fn reference_vectors() {
        for &(key, seed, murmur, murmur_bucket, legacy, legacy_bucket) in VECTORS {
            assert_eq!(murmur3_hash(key, seed), murmur, "murmur3 hash of {key:?}");
            assert_eq!(bucket(key, seed, Algo::Murmur3), murmur_bucket, "murmur3 bucket of {key:?}");
            assert_eq!(legacy_hash(key, seed), legacy, "legacy hash of {key:?}");
            assert_eq!(bucket(key, seed, Algo::Legacy), legacy_bucket, "legacy bucket of {key:?}");
        }
    }

    #[test]
    fn algo_from_wire() {
        assert_eq!(serde_json::from_str::<Algo>("2").unwrap(), Algo::Murmur3);
        assert_eq!(serde_json::from_str::<Algo>("1").unwrap(), Algo::Legacy);
        assert_eq!(serde_json::from_str::<Algo>("7").unwrap(), Algo::Legacy);
    }

    proptest! {
        #[test]
        fn bucket_is_in_range(key in ".*", seed in any::<i32>()) {
            prop_assert!(bucket(&key, seed, Algo::Murmur3) < 100);
            prop_assert!(bucket(&key, seed, Algo::Legacy) < 100);
        }
    }

    proptest! {
        #[test]
        fn hash_is_deterministic(key in ".*", seed in any::<i32>()) {
            prop_assert_eq!(hash(&key, seed, Algo::Murmur3), hash(&key, seed, Algo::Murmur3));
            prop_assert_eq!(hash(&key, seed, Algo::Legacy), hash(&key, seed, Algo::Legacy));
        }
    }
}
