//! Metric identity hashing
//!
//! Output layouts are grouped by a hash of the measurement name and its tag
//! set, so equally named metrics with different tags address independent
//! register regions. The seed is owned by the generator instance; two
//! generators hash differently unless built with the same seeds.

use ahash::RandomState;
use std::hash::{BuildHasher, Hasher};

const SEPARATOR: &[u8] = b"\n";

#[derive(Debug, Clone)]
pub struct HashIdGenerator {
    state: RandomState,
}

impl Default for HashIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl HashIdGenerator {
    /// Generator with a freshly drawn random seed
    pub fn new() -> Self {
        Self::with_seeds(
            rand::random(),
            rand::random(),
            rand::random(),
            rand::random(),
        )
    }

    /// Deterministic generator
    pub fn with_seeds(k0: u64, k1: u64, k2: u64, k3: u64) -> Self {
        Self {
            state: RandomState::with_seeds(k0, k1, k2, k3),
        }
    }

    /// Hash a measurement name and tag set; tag order does not matter.
    pub fn hash_id<I, K, V>(&self, name: &str, tags: I) -> u64
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut tags: Vec<(K, V)> = tags.into_iter().collect();
        tags.sort_by(|a, b| a.0.as_ref().cmp(b.0.as_ref()));

        let mut hasher = self.state.build_hasher();
        hasher.write(name.as_bytes());
        hasher.write(SEPARATOR);
        for (key, value) in &tags {
            hasher.write(key.as_ref().as_bytes());
            hasher.write(SEPARATOR);
            hasher.write(value.as_ref().as_bytes());
            hasher.write(SEPARATOR);
        }
        hasher.write(SEPARATOR);
        hasher.finish()
    }
}
