//! # Key Routing
//!
//! Purpose: Map cache keys onto the weight-replicated bucket list, and walk to
//! alternate buckets deterministically when the first choice is unavailable.
//!
//! ## Design Principles
//! 1. **Pure Functions**: Routing never touches pool state and needs no lock.
//! 2. **Rehash on Retry**: Attempt `n` adds the hash of `"{n}{key}"` to the
//!    running hash, so failover needs no replicated ring.
//! 3. **Selected Once**: The algorithm is fixed when the pool is configured;
//!    retries always reuse it.
//!
//! ## Algorithms
//!
//! - `Native`: aHash with fixed seeds. Stable within one build, not meant to
//!   be shared with clients written against other hash functions.
//! - `LegacyAdditive`: `hash = hash * 33 + code_unit` over UTF-16 code units,
//!   wrapping at 32 bits, for deployments sharded by older clients.
//! - `Crc32`: bits 16..=30 of the CRC-32 of the UTF-8 key bytes.

use std::hash::{BuildHasher, Hasher};

use ahash::RandomState;
use serde::{Deserialize, Serialize};

use crate::crc::crc32;

const NATIVE_SEEDS: [u64; 4] = [
    0x243F_6A88_85A3_08D3,
    0x1319_8A2E_0370_7344,
    0xA409_3822_299F_31D0,
    0x082E_FA98_EC4E_6C89,
];

/// Hash function used to place keys on buckets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum HashingAlgorithm {
    /// Fast in-process string hash.
    #[default]
    Native,
    /// Additive `* 33` hash kept for compatibility with older deployments.
    LegacyAdditive,
    /// 15-bit slice of the key's CRC-32.
    Crc32,
}

impl HashingAlgorithm {
    /// Hashes `key` to a signed 32-bit value.
    pub fn hash(self, key: &str) -> i32 {
        match self {
            HashingAlgorithm::Native => native_hash(key),
            HashingAlgorithm::LegacyAdditive => legacy_additive_hash(key),
            HashingAlgorithm::Crc32 => crc32_hash(key),
        }
    }
}

fn native_hash(key: &str) -> i32 {
    let [k0, k1, k2, k3] = NATIVE_SEEDS;
    let mut hasher = RandomState::with_seeds(k0, k1, k2, k3).build_hasher();
    hasher.write(key.as_bytes());
    hasher.finish() as i32
}

fn legacy_additive_hash(key: &str) -> i32 {
    key.encode_utf16()
        .fold(0i32, |hash, unit| hash.wrapping_mul(33).wrapping_add(unit as i32))
}

fn crc32_hash(key: &str) -> i32 {
    ((crc32(key.as_bytes()) >> 16) & 0x7FFF) as i32
}

/// Routes keys onto a bucket list of fixed length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HashRouter {
    algorithm: HashingAlgorithm,
    buckets: usize,
}

impl HashRouter {
    /// Creates a router over `buckets` slots.
    pub fn new(algorithm: HashingAlgorithm, buckets: usize) -> Self {
        HashRouter { algorithm, buckets }
    }

    pub fn algorithm(&self) -> HashingAlgorithm {
        self.algorithm
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets
    }

    /// Returns the bucket for `key` on the given attempt.
    ///
    /// Attempt 0 is the primary bucket. Returns `None` once `attempt` reaches
    /// the bucket count, i.e. when every retry has been spent.
    pub fn route(&self, key: &str, attempt: usize) -> Option<usize> {
        self.probe(key).nth(attempt)
    }

    /// Iterates the primary bucket followed by every failover bucket.
    pub fn probe<'a>(&self, key: &'a str) -> Probe<'a> {
        self.probe_from(key, self.algorithm.hash(key))
    }

    /// Like [`probe`](Self::probe), but starts from a caller-supplied hash.
    ///
    /// Retries still rehash `key`, so callers that pin the primary bucket get
    /// the same failover walk as everyone else from that point on.
    pub fn probe_from<'a>(&self, key: &'a str, hash: i32) -> Probe<'a> {
        Probe {
            router: *self,
            key,
            hash,
            attempt: 0,
        }
    }

    /// Reduces a raw hash onto the bucket range.
    ///
    /// Negative hashes are folded into range rather than mirrored.
    fn bucket_of(&self, hash: i32) -> usize {
        (hash as i64).rem_euclid(self.buckets as i64) as usize
    }
}

/// Iterator over successive routing attempts for one key.
#[derive(Debug, Clone)]
pub struct Probe<'a> {
    router: HashRouter,
    key: &'a str,
    hash: i32,
    attempt: usize,
}

impl Probe<'_> {
    /// Number of attempts already yielded.
    pub fn attempts(&self) -> usize {
        self.attempt
    }
}

impl Iterator for Probe<'_> {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        if self.attempt >= self.router.buckets {
            return None;
        }

        if self.attempt > 0 {
            let salted = format!("{}{}", self.attempt, self.key);
            self.hash = self.hash.wrapping_add(self.router.algorithm.hash(&salted));
        }

        let bucket = self.router.bucket_of(self.hash);
        self.attempt += 1;
        Some(bucket)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.router.buckets.saturating_sub(self.attempt);
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for Probe<'_> {}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn legacy_additive_matches_known_values() {
        assert_eq!(HashingAlgorithm::LegacyAdditive.hash(""), 0);
        assert_eq!(HashingAlgorithm::LegacyAdditive.hash("a"), 97);
        assert_eq!(HashingAlgorithm::LegacyAdditive.hash("ab"), 97 * 33 + 98);
    }

    #[test]
    fn legacy_additive_wraps_instead_of_overflowing() {
        let long_key = "z".repeat(64);
        let _ = HashingAlgorithm::LegacyAdditive.hash(&long_key);
    }

    #[test]
    fn crc32_hash_is_fifteen_bit_positive() {
        for key in ["", "alpha", "user:42", "\u{00e9}t\u{00e9}"] {
            let hash = HashingAlgorithm::Crc32.hash(key);
            assert!((0..=0x7FFF).contains(&hash), "{key} -> {hash}");
        }
        // crc32("123456789") = 0xCBF43926
        assert_eq!(HashingAlgorithm::Crc32.hash("123456789"), 0x4BF4);
    }

    #[test]
    fn negative_hashes_fold_into_range() {
        let router = HashRouter::new(HashingAlgorithm::Native, 4);
        assert_eq!(router.bucket_of(-7), 1);
        assert_eq!(router.bucket_of(i32::MIN), 0);
        assert_eq!(router.bucket_of(9), 1);
    }

    #[test]
    fn probe_walks_with_salted_rehash() {
        let algorithm = HashingAlgorithm::LegacyAdditive;
        let router = HashRouter::new(algorithm, 7);
        let buckets: Vec<usize> = router.probe("key").collect();
        assert_eq!(buckets.len(), 7);

        let first = algorithm.hash("key");
        let second = first.wrapping_add(algorithm.hash("1key"));
        let third = second.wrapping_add(algorithm.hash("2key"));
        assert_eq!(buckets[0], first.rem_euclid(7) as usize);
        assert_eq!(buckets[1], second.rem_euclid(7) as usize);
        assert_eq!(buckets[2], third.rem_euclid(7) as usize);
    }

    #[test]
    fn probe_from_pins_primary_bucket() {
        let router = HashRouter::new(HashingAlgorithm::Crc32, 5);
        let mut probe = router.probe_from("key", 13);
        assert_eq!(probe.next(), Some(3));
        assert_eq!(probe.attempts(), 1);
    }

    #[test]
    fn route_fails_once_attempts_are_exhausted() {
        let router = HashRouter::new(HashingAlgorithm::Crc32, 3);
        assert!(router.route("key", 2).is_some());
        assert_eq!(router.route("key", 3), None);
        assert_eq!(HashRouter::new(HashingAlgorithm::Crc32, 0).route("key", 0), None);
    }

    #[test]
    fn algorithm_names_deserialize() {
        let parsed: Vec<HashingAlgorithm> =
            serde_json::from_str(r#"["native", "legacyAdditive", "crc32"]"#).expect("parse");
        assert_eq!(
            parsed,
            vec![
                HashingAlgorithm::Native,
                HashingAlgorithm::LegacyAdditive,
                HashingAlgorithm::Crc32
            ]
        );
    }

    fn any_algorithm() -> impl Strategy<Value = HashingAlgorithm> {
        prop_oneof![
            Just(HashingAlgorithm::Native),
            Just(HashingAlgorithm::LegacyAdditive),
            Just(HashingAlgorithm::Crc32),
        ]
    }

    proptest! {
        #[test]
        fn route_is_stable_and_in_range(
            key in ".{0,40}",
            buckets in 1usize..64,
            algorithm in any_algorithm(),
        ) {
            let router = HashRouter::new(algorithm, buckets);
            let first = router.route(&key, 0);
            prop_assert_eq!(first, router.route(&key, 0));
            prop_assert!(first.is_some_and(|bucket| bucket < buckets));
        }

        #[test]
        fn route_agrees_with_probe(
            key in "[a-z0-9:]{1,24}",
            buckets in 1usize..16,
            algorithm in any_algorithm(),
        ) {
            let router = HashRouter::new(algorithm, buckets);
            let walked: Vec<usize> = router.probe(&key).collect();
            prop_assert_eq!(walked.len(), buckets);
            for (attempt, bucket) in walked.iter().enumerate() {
                prop_assert_eq!(router.route(&key, attempt), Some(*bucket));
            }
        }
    }
}
