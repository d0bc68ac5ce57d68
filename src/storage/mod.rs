//! Local storage engine seam for bucket entries.
//!
//! The coordination core never owns value formats; it talks to whatever
//! storage the embedding process provides through this trait. The in-memory
//! implementation here backs tests and any deployment content with a
//! volatile grid.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::directory::{BucketId, RegionId};
use crate::utils::GridError;

use bytes::Bytes;

/// One bucket's backing store address.
type BucketAddr = (RegionId, BucketId);

/// Local storage engine consumed by message handlers. Implementations must
/// be callable from blocking worker threads (`spawn_blocking`), hence the
/// sync API.
pub trait BucketStorage: Send + Sync {
    /// Allocates backing storage for a bucket. Idempotent.
    fn create_bucket_storage(
        &self,
        region: RegionId,
        bucket: BucketId,
    ) -> Result<(), GridError>;

    /// Destroys a bucket's backing storage and all entries. Idempotent.
    fn destroy_bucket_storage(
        &self,
        region: RegionId,
        bucket: BucketId,
    ) -> Result<(), GridError>;

    /// True if backing storage exists for the bucket.
    fn has_bucket(&self, region: RegionId, bucket: BucketId) -> bool;

    fn get(
        &self,
        region: RegionId,
        bucket: BucketId,
        key: &Bytes,
    ) -> Result<Option<Bytes>, GridError>;

    fn put(
        &self,
        region: RegionId,
        bucket: BucketId,
        key: Bytes,
        value: Bytes,
    ) -> Result<(), GridError>;

    /// Destroys an entry, returning the old value if present.
    fn destroy(
        &self,
        region: RegionId,
        bucket: BucketId,
        key: &Bytes,
    ) -> Result<Option<Bytes>, GridError>;

    /// Bytes used by the bucket's entries.
    fn local_size(&self, region: RegionId, bucket: BucketId) -> u64;

    /// Number of entries in the bucket.
    fn entry_count(&self, region: RegionId, bucket: BucketId) -> u64;

    /// All entries of a bucket in key order (finite; re-invoke to restart).
    fn scan(
        &self,
        region: RegionId,
        bucket: BucketId,
    ) -> Result<Vec<(Bytes, Bytes)>, GridError>;
}

/// In-memory bucket storage: per-bucket hash maps with byte accounting.
#[derive(Default)]
pub struct MemStorage {
    buckets: Mutex<HashMap<BucketAddr, HashMap<Bytes, Bytes>>>,
}

impl MemStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn missing(region: RegionId, bucket: BucketId) -> GridError {
        GridError(format!(
            "no storage for bucket {} of region {}",
            bucket, region
        ))
    }
}

impl BucketStorage for MemStorage {
    fn create_bucket_storage(
        &self,
        region: RegionId,
        bucket: BucketId,
    ) -> Result<(), GridError> {
        self.buckets
            .lock()
            .unwrap()
            .entry((region, bucket))
            .or_default();
        Ok(())
    }

    fn destroy_bucket_storage(
        &self,
        region: RegionId,
        bucket: BucketId,
    ) -> Result<(), GridError> {
        self.buckets.lock().unwrap().remove(&(region, bucket));
        Ok(())
    }

    fn has_bucket(&self, region: RegionId, bucket: BucketId) -> bool {
        self.buckets
            .lock()
            .unwrap()
            .contains_key(&(region, bucket))
    }

    fn get(
        &self,
        region: RegionId,
        bucket: BucketId,
        key: &Bytes,
    ) -> Result<Option<Bytes>, GridError> {
        match self.buckets.lock().unwrap().get(&(region, bucket)) {
            Some(entries) => Ok(entries.get(key).cloned()),
            None => Err(Self::missing(region, bucket)),
        }
    }

    fn put(
        &self,
        region: RegionId,
        bucket: BucketId,
        key: Bytes,
        value: Bytes,
    ) -> Result<(), GridError> {
        match self.buckets.lock().unwrap().get_mut(&(region, bucket)) {
            Some(entries) => {
                entries.insert(key, value);
                Ok(())
            }
            None => Err(Self::missing(region, bucket)),
        }
    }

    fn destroy(
        &self,
        region: RegionId,
        bucket: BucketId,
        key: &Bytes,
    ) -> Result<Option<Bytes>, GridError> {
        match self.buckets.lock().unwrap().get_mut(&(region, bucket)) {
            Some(entries) => Ok(entries.remove(key)),
            None => Err(Self::missing(region, bucket)),
        }
    }

    fn local_size(&self, region: RegionId, bucket: BucketId) -> u64 {
        match self.buckets.lock().unwrap().get(&(region, bucket)) {
            Some(entries) => entries
                .iter()
                .map(|(k, v)| (k.len() + v.len()) as u64)
                .sum(),
            None => 0,
        }
    }

    fn entry_count(&self, region: RegionId, bucket: BucketId) -> u64 {
        match self.buckets.lock().unwrap().get(&(region, bucket)) {
            Some(entries) => entries.len() as u64,
            None => 0,
        }
    }

    fn scan(
        &self,
        region: RegionId,
        bucket: BucketId,
    ) -> Result<Vec<(Bytes, Bytes)>, GridError> {
        match self.buckets.lock().unwrap().get(&(region, bucket)) {
            Some(entries) => {
                let mut pairs: Vec<(Bytes, Bytes)> = entries
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect();
                pairs.sort_by(|a, b| a.0.cmp(&b.0));
                Ok(pairs)
            }
            None => Err(Self::missing(region, bucket)),
        }
    }
}
