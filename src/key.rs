//! Deterministic, partition-scoped key allocation.
//!
//! Keys are allocated as `base + n * stride`. The partition id lives in the
//! upper bits of `base`, so keys never collide across partitions, and each
//! [`EntityCategory`] gets its own residue class within a partition's key
//! space. Because the generator is part of processor state (and is
//! snapshotted with it), replaying the same log always yields the same keys.

use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize};

use crate::error::SnapshotError;
use crate::snapshot::SnapshotSupport;

/// Number of low bits available to keys within one partition.
pub const PARTITION_BIT_OFFSET: u32 = 51;

/// First key of a partition's key space.
///
/// # Arguments
///
/// * `partition_id` - Partition owning the key space; must fit in 12 bits.
pub fn partition_key_space(partition_id: i32) -> i64 {
    i64::from(partition_id) << PARTITION_BIT_OFFSET
}

/// Recover the partition a key was allocated on.
pub fn decode_partition_id(key: i64) -> i32 {
    (key >> PARTITION_BIT_OFFSET) as i32
}

/// Entity families that draw keys from one partition.
///
/// Each category owns the keys `space + index + n * COUNT`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityCategory {
    ProcessInstance,
    Job,
    Incident,
    Deployment,
}

impl EntityCategory {
    /// Number of categories, used as the stride between keys of one category.
    pub const COUNT: i64 = 4;

    fn index(self) -> i64 {
        match self {
            EntityCategory::ProcessInstance => 0,
            EntityCategory::Job => 1,
            EntityCategory::Incident => 2,
            EntityCategory::Deployment => 3,
        }
    }
}

/// Allocates keys `next_key, next_key + stride, ...`.
///
/// Generators with distinct base offsets modulo a shared stride never hand
/// out the same key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyGenerator {
    next_key: i64,
    stride: i64,
}

impl KeyGenerator {
    /// Create a generator whose first key is `base_offset`.
    ///
    /// # Arguments
    ///
    /// * `base_offset` - First key handed out.
    /// * `stride` - Distance between consecutive keys; values below 1 are
    ///   clamped to 1.
    pub fn new(base_offset: i64, stride: i64) -> Self {
        Self {
            next_key: base_offset,
            stride: stride.max(1),
        }
    }

    /// Create the generator for one entity category of a partition.
    pub fn for_category(partition_id: i32, category: EntityCategory) -> Self {
        Self::new(
            partition_key_space(partition_id) + category.index(),
            EntityCategory::COUNT,
        )
    }

    /// Return the next key and advance by one stride.
    pub fn next_key(&mut self) -> i64 {
        let key = self.next_key;
        self.next_key += self.stride;
        key
    }

    /// Move the generator past `key`, so the next allocated key is
    /// `key + stride`.
    ///
    /// Used while replaying events whose keys were allocated before the
    /// last snapshot was taken.
    pub fn set_key(&mut self, key: i64) {
        self.next_key = key + self.stride;
    }

    /// The key [`next_key`](KeyGenerator::next_key) would return.
    pub fn peek(&self) -> i64 {
        self.next_key
    }

    pub fn stride(&self) -> i64 {
        self.stride
    }
}

impl Default for KeyGenerator {
    /// Keys `0, 1, 2, ...`.
    fn default() -> Self {
        Self::new(0, 1)
    }
}

impl SnapshotSupport for KeyGenerator {
    fn write_snapshot(&self, out: &mut BytesMut) -> Result<(), SnapshotError> {
        out.put_i64(self.next_key);
        out.put_i64(self.stride);
        Ok(())
    }

    fn recover_from_snapshot(&mut self, mut input: &[u8]) -> Result<(), SnapshotError> {
        if input.len() != 16 {
            return Err(SnapshotError::Corrupt(format!(
                "key generator snapshot must be 16 bytes, got {}",
                input.len()
            )));
        }
        self.next_key = input.get_i64();
        self.stride = input.get_i64();
        if self.stride < 1 {
            return Err(SnapshotError::Corrupt(format!(
                "key generator stride must be positive, got {}",
                self.stride
            )));
        }
        Ok(())
    }
}
