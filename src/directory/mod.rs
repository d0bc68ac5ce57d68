//! Partition directory: per-bucket host set and primary bookkeeping.
//!
//! Every message handler consults this to decide whether "this member"
//! should act. There is no global directory lock; each bucket record sits
//! behind its own mutex, and readers always get a consistent snapshot of the
//! host set and primary taken together. Records are mutated only by the
//! bucket lifecycle coordinator and by departure handling.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Mutex;

use crate::membership::MemberId;
use crate::utils::{Bitmap, GridError};

use serde::{Deserialize, Serialize};

/// Region ID type.
pub type RegionId = u32;

/// Bucket (partition) ID type, in `[0, total_buckets)` for a region.
pub type BucketId = u32;

/// Static description of a region's partitioning, fixed at region creation.
#[derive(Debug, Clone)]
pub struct RegionSpec {
    pub id: RegionId,

    /// Bucket count; static for the region's lifetime.
    pub total_buckets: u32,

    /// Configured number of replica copies beyond the primary.
    pub redundancy: u8,

    /// Colocated regions share the parent's bucket ID space and must always
    /// be co-hosted bucket-by-bucket.
    pub colocated_with: Option<RegionId>,
}

impl RegionSpec {
    pub fn new(id: RegionId, total_buckets: u32, redundancy: u8) -> Self {
        RegionSpec {
            id,
            total_buckets,
            redundancy,
            colocated_with: None,
        }
    }

    pub fn colocated(mut self, parent: RegionId) -> Self {
        self.colocated_with = Some(parent);
        self
    }
}

/// Per-bucket record of who hosts a copy and who is primary.
///
/// Invariants: `hosts.count() <= redundancy + 1`; `primary` is `Some` iff
/// the host set is nonempty; the primary is always a host.
#[derive(Debug, Clone)]
pub(crate) struct BucketRecord {
    /// Members currently storing a copy of this bucket.
    pub(crate) hosts: Bitmap,

    /// Current primary, exactly one host whenever hosts is nonempty.
    pub(crate) primary: Option<MemberId>,

    /// Configured copies beyond the primary.
    pub(crate) redundancy: u8,

    /// True while the bucket has fewer copies than configured.
    pub(crate) low_redundancy: bool,
}

impl BucketRecord {
    fn new(population: u8, redundancy: u8) -> Self {
        BucketRecord {
            hosts: Bitmap::new(population, false),
            primary: None,
            redundancy,
            low_redundancy: true,
        }
    }

    /// Re-derives the low-redundancy flag and repairs the primary after a
    /// host-set change. Called at the end of every mutation.
    pub(crate) fn refresh(&mut self) {
        if self.hosts.count() == 0 {
            self.primary = None;
        } else {
            match self.primary {
                Some(p) if self.hosts.get(p).unwrap_or(false) => {}
                _ => {
                    // elect the lowest-ID host
                    self.primary = self.hosts.iter_ones().next();
                }
            }
        }
        self.low_redundancy = self.hosts.count() < self.redundancy + 1;
    }

    pub(crate) fn snapshot(&self) -> BucketSnapshot {
        BucketSnapshot {
            hosts: self.hosts.clone(),
            primary: self.primary,
            low_redundancy: self.low_redundancy,
        }
    }
}

/// Consistent point-in-time read of a bucket record. Also the payload of
/// directory advisory messages between members.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketSnapshot {
    pub hosts: Bitmap,
    pub primary: Option<MemberId>,
    pub low_redundancy: bool,
}

impl BucketSnapshot {
    /// True if the given member holds a copy.
    pub fn hosts_member(&self, id: MemberId) -> bool {
        self.hosts.get(id).unwrap_or(false)
    }
}

/// Per-region directory state.
struct RegionMeta {
    spec: RegionSpec,

    /// Child regions colocated onto this region's bucket space.
    children: Vec<RegionId>,

    /// One mutex per bucket record; lifecycle operations on different
    /// buckets never contend.
    buckets: Vec<Mutex<BucketRecord>>,
}

/// The partition directory of one member.
pub struct PartitionDirectory {
    regions: HashMap<RegionId, RegionMeta>,
}

impl PartitionDirectory {
    /// Builds the directory for a static set of region specs. Colocated
    /// regions must name an existing parent with the same bucket count.
    pub fn new(
        population: u8,
        specs: Vec<RegionSpec>,
    ) -> Result<Self, GridError> {
        let mut regions: HashMap<RegionId, RegionMeta> = HashMap::new();
        for spec in &specs {
            if spec.total_buckets == 0 {
                return logged_err!(
                    "region {} has zero total_buckets",
                    spec.id
                );
            }
            // redundancy + 1 distinct hosts must fit the membership
            if spec.redundancy >= population {
                return logged_err!(
                    "region {} redundancy {} not satisfiable with population {}",
                    spec.id,
                    spec.redundancy,
                    population
                );
            }
            let buckets = (0..spec.total_buckets)
                .map(|_| {
                    Mutex::new(BucketRecord::new(population, spec.redundancy))
                })
                .collect();
            if regions
                .insert(
                    spec.id,
                    RegionMeta {
                        spec: spec.clone(),
                        children: Vec::new(),
                        buckets,
                    },
                )
                .is_some()
            {
                return logged_err!("duplicate region ID {}", spec.id);
            }
        }

        // wire up colocation chains after all regions are known
        for spec in &specs {
            if let Some(parent) = spec.colocated_with {
                let parent_buckets = match regions.get(&parent) {
                    Some(meta) => meta.spec.total_buckets,
                    None => {
                        return logged_err!(
                            "region {} colocated with unknown region {}",
                            spec.id,
                            parent
                        );
                    }
                };
                if parent_buckets != spec.total_buckets {
                    return logged_err!(
                        "region {} bucket count {} mismatches parent {} ({})",
                        spec.id,
                        spec.total_buckets,
                        parent,
                        parent_buckets
                    );
                }
                regions
                    .get_mut(&parent)
                    .unwrap()
                    .children
                    .push(spec.id);
            }
        }

        Ok(PartitionDirectory { regions })
    }

    fn meta(&self, region: RegionId) -> Result<&RegionMeta, GridError> {
        self.regions
            .get(&region)
            .ok_or_else(|| GridError(format!("unknown region {}", region)))
    }

    /// All region IDs configured.
    pub fn region_ids(&self) -> Vec<RegionId> {
        let mut ids: Vec<RegionId> = self.regions.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn total_buckets(&self, region: RegionId) -> Result<u32, GridError> {
        Ok(self.meta(region)?.spec.total_buckets)
    }

    pub fn redundancy(&self, region: RegionId) -> Result<u8, GridError> {
        Ok(self.meta(region)?.spec.redundancy)
    }

    /// Child regions colocated onto this region.
    pub fn colocated_children(
        &self,
        region: RegionId,
    ) -> Result<Vec<RegionId>, GridError> {
        Ok(self.meta(region)?.children.clone())
    }

    /// Static hash partitioning of a key into the region's bucket space.
    pub fn key_to_bucket(
        &self,
        region: RegionId,
        key: &[u8],
    ) -> Result<BucketId, GridError> {
        let total = self.total_buckets(region)?;
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        Ok((hasher.finish() % total as u64) as BucketId)
    }

    /// Takes a consistent snapshot of a bucket record.
    pub fn snapshot(
        &self,
        region: RegionId,
        bucket: BucketId,
    ) -> Result<BucketSnapshot, GridError> {
        let meta = self.meta(region)?;
        match meta.buckets.get(bucket as usize) {
            Some(record) => Ok(record.lock().unwrap().snapshot()),
            None => logged_err!(
                "bucket {} out of range for region {}",
                bucket,
                region
            ),
        }
    }

    /// Runs a mutation on a bucket record under its mutex, refreshing
    /// derived fields afterward. Only the lifecycle coordinator and the
    /// departure handler go through here.
    pub(crate) fn mutate<R>(
        &self,
        region: RegionId,
        bucket: BucketId,
        f: impl FnOnce(&mut BucketRecord) -> R,
    ) -> Result<R, GridError> {
        let meta = self.meta(region)?;
        match meta.buckets.get(bucket as usize) {
            Some(record) => {
                let mut guard = record.lock().unwrap();
                let ret = f(&mut guard);
                guard.refresh();
                Ok(ret)
            }
            None => logged_err!(
                "bucket {} out of range for region {}",
                bucket,
                region
            ),
        }
    }

    /// Overwrites a bucket record from an advisory snapshot received from
    /// the member that performed a lifecycle operation.
    pub(crate) fn apply_advisory(
        &self,
        region: RegionId,
        bucket: BucketId,
        snap: &BucketSnapshot,
    ) -> Result<(), GridError> {
        self.mutate(region, bucket, |record| {
            record.hosts = snap.hosts.clone();
            record.primary = snap.primary;
        })
    }

    /// Purges a departed member from every bucket record, re-electing
    /// primaries where it led. Returns the (region, bucket) pairs whose
    /// primary changed.
    pub(crate) fn member_departed(
        &self,
        id: MemberId,
    ) -> Vec<(RegionId, BucketId)> {
        let mut reprimaried = Vec::new();
        for (&region, meta) in &self.regions {
            for (bucket, record) in meta.buckets.iter().enumerate() {
                let mut guard = record.lock().unwrap();
                if guard.hosts.get(id).unwrap_or(false) {
                    let was_primary = guard.primary == Some(id);
                    guard.hosts.set(id, false).unwrap();
                    guard.refresh();
                    if was_primary && guard.primary.is_some() {
                        reprimaried.push((region, bucket as BucketId));
                    }
                }
            }
        }
        reprimaried
    }

    /// Buckets of a region hosted by the given member, per this directory.
    pub fn hosted_buckets(
        &self,
        region: RegionId,
        id: MemberId,
    ) -> Result<Vec<BucketId>, GridError> {
        let meta = self.meta(region)?;
        let mut hosted = Vec::new();
        for (bucket, record) in meta.buckets.iter().enumerate() {
            if record.lock().unwrap().hosts.get(id).unwrap_or(false) {
                hosted.push(bucket as BucketId);
            }
        }
        Ok(hosted)
    }
}

#[cfg(test)]
mod directory_tests {
    use super::*;

    fn test_directory() -> PartitionDirectory {
        PartitionDirectory::new(
            3,
            vec![
                RegionSpec::new(1, 4, 1),
                RegionSpec::new(2, 4, 1).colocated(1),
            ],
        )
        .unwrap()
    }

    #[test]
    fn build_validation() {
        // colocated with unknown parent
        assert!(PartitionDirectory::new(
            3,
            vec![RegionSpec::new(2, 4, 1).colocated(9)]
        )
        .is_err());
        // bucket count mismatch along the chain
        assert!(PartitionDirectory::new(
            3,
            vec![
                RegionSpec::new(1, 4, 1),
                RegionSpec::new(2, 8, 1).colocated(1)
            ]
        )
        .is_err());
        // redundancy target beyond what the membership can host
        assert!(PartitionDirectory::new(
            2,
            vec![RegionSpec::new(1, 4, 2)]
        )
        .is_err());
        let dir = test_directory();
        assert_eq!(dir.colocated_children(1).unwrap(), vec![2]);
        assert_eq!(dir.region_ids(), vec![1, 2]);
    }

    #[test]
    fn key_to_bucket_stable() -> Result<(), GridError> {
        let dir = test_directory();
        let b1 = dir.key_to_bucket(1, b"some-key")?;
        let b2 = dir.key_to_bucket(1, b"some-key")?;
        assert_eq!(b1, b2);
        assert!(b1 < 4);
        Ok(())
    }

    #[test]
    fn mutate_refreshes_record() -> Result<(), GridError> {
        let dir = test_directory();
        dir.mutate(1, 0, |record| {
            record.hosts.set(2, true).unwrap();
        })?;
        let snap = dir.snapshot(1, 0)?;
        // first host becomes primary and redundancy 1 is not yet met
        assert_eq!(snap.primary, Some(2));
        assert!(snap.low_redundancy);

        dir.mutate(1, 0, |record| {
            record.hosts.set(0, true).unwrap();
        })?;
        let snap = dir.snapshot(1, 0)?;
        assert_eq!(snap.primary, Some(2)); // existing primary untouched
        assert!(!snap.low_redundancy);
        assert_eq!(snap.hosts, Bitmap::from(3, vec![0, 2]));
        Ok(())
    }

    #[test]
    fn departure_reelects_primary() -> Result<(), GridError> {
        let dir = test_directory();
        dir.mutate(1, 3, |record| {
            record.hosts.set(1, true).unwrap();
        })?;
        dir.mutate(1, 3, |record| {
            record.hosts.set(2, true).unwrap();
        })?;
        assert_eq!(dir.snapshot(1, 3)?.primary, Some(1));

        let reprimaried = dir.member_departed(1);
        assert!(reprimaried.contains(&(1, 3)));
        let snap = dir.snapshot(1, 3)?;
        assert_eq!(snap.primary, Some(2));
        assert!(!snap.hosts_member(1));
        assert!(snap.low_redundancy);

        // last host leaving empties the record
        dir.member_departed(2);
        let snap = dir.snapshot(1, 3)?;
        assert_eq!(snap.primary, None);
        assert_eq!(snap.hosts.count(), 0);
        Ok(())
    }

    #[test]
    fn hosted_buckets_listing() -> Result<(), GridError> {
        let dir = test_directory();
        dir.mutate(1, 0, |r| r.hosts.set(0, true).unwrap())?;
        dir.mutate(1, 2, |r| r.hosts.set(0, true).unwrap())?;
        assert_eq!(dir.hosted_buckets(1, 0)?, vec![0, 2]);
        assert!(dir.hosted_buckets(9, 0).is_err());
        Ok(())
    }
}
