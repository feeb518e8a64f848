//! Weighted consistent-hash ring (ketama-style continuum).
//!
//! Each bucket is replicated into a number of virtual points proportional to
//! its share of the total weight, so membership changes only remap the share
//! of keys owned by the changed bucket instead of reshuffling globally.

use std::hash::Hasher;

use fnv::FnvHasher;

use crate::error::{Error, Result};

/// Baseline virtual points per bucket at equal weights.
const REPLICA_FACTOR: usize = 160;

/// One routable backend with its configured weight.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bucket {
    pub label: String,
    pub weight: u32,
}

impl Bucket {
    pub fn new(label: impl Into<String>, weight: u32) -> Self {
        Self {
            label: label.into(),
            weight,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Point {
    hash: u64,
    bucket: usize,
}

/// An immutable continuum of virtual points sorted by hash value.
///
/// A ring is never mutated in place: rebuilding produces a new ring that the
/// owner swaps atomically, so concurrent lookups always observe either the
/// fully-old or fully-new ring.
#[derive(Debug, Clone)]
pub struct HashRing {
    points: Vec<Point>,
    buckets: Vec<Bucket>,
}

fn hash_bytes(key: &[u8]) -> u64 {
    let mut hasher = FnvHasher::default();
    hasher.write(key);
    hasher.finish()
}

impl HashRing {
    /// Build a ring from a non-empty bucket set.
    ///
    /// Fails with [`Error::NoBackends`] if the set is empty or its total
    /// weight is zero. Hash collisions between virtual points are resolved
    /// deterministically: the first inserted point wins, later duplicates
    /// are discarded.
    pub fn build(buckets: Vec<Bucket>) -> Result<Self> {
        let total: u64 = buckets.iter().map(|b| u64::from(b.weight)).sum();
        if buckets.is_empty() || total == 0 {
            return Err(Error::NoBackends);
        }

        let base = (REPLICA_FACTOR * buckets.len()) as f64;
        let mut points = Vec::new();
        for (index, bucket) in buckets.iter().enumerate() {
            let share = f64::from(bucket.weight) / total as f64;
            let replicas = (base * share).round() as usize;
            for replica in 0..replicas {
                let hash = hash_bytes(format!("{}#{}", bucket.label, replica).as_bytes());
                points.push(Point {
                    hash,
                    bucket: index,
                });
            }
        }

        // Stable sort keeps insertion order among equal hashes, dedup keeps
        // the first inserted point.
        points.sort_by_key(|p| p.hash);
        points.dedup_by_key(|p| p.hash);

        Ok(Self { points, buckets })
    }

    /// Map a key to its owning bucket, clockwise on the ring.
    pub fn hash(&self, key: &[u8]) -> Result<&Bucket> {
        if self.points.is_empty() {
            return Err(Error::NoBackends);
        }
        let hash = hash_bytes(key);
        let index = self.points.partition_point(|p| p.hash < hash);
        let point = self.points.get(index).unwrap_or(&self.points[0]);
        Ok(&self.buckets[point.bucket])
    }

    /// Snapshot of the buckets this ring was built from.
    pub fn buckets(&self) -> &[Bucket] {
        &self.buckets
    }

    /// Number of virtual points on the ring.
    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }
}
