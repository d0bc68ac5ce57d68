//! Bucket lifecycle coordination: the target-side state transitions for
//! create / create-redundant / remove / become-primary / depose-primary.
//!
//! Every handler here is safe to deliver twice: a duplicate lands on the
//! idempotent result arm (AlreadyExists, NotHosting, ...) and never throws
//! for being already in the target state. Colocated child regions share the
//! bucket ID space and are handled as a unit with the parent; a child
//! failing partway leaves the parent untouched and names the child.
//!
//! The initiator-side move composition (create on target, then remove on
//! source, never the reverse) lives in the node API, since it is a
//! request/response exchange, not a local transition.

use crate::directory::{
    BucketId, BucketSnapshot, PartitionDirectory, RegionId,
};
use crate::membership::MemberId;
use crate::ops::LifecycleAck;
use crate::storage::BucketStorage;
use crate::utils::GridError;

/// Result of one local lifecycle transition: the ack code to reply with and
/// the advisory snapshots (per chain region) to gossip to other members.
#[derive(Debug)]
pub struct LifecycleOutcome {
    pub ack: LifecycleAck,
    pub advisories: Vec<(RegionId, BucketId, BucketSnapshot)>,
}

impl LifecycleOutcome {
    fn ack_only(ack: LifecycleAck) -> Self {
        LifecycleOutcome {
            ack,
            advisories: Vec::new(),
        }
    }
}

/// Transitive colocation chain rooted at a region: the region itself first,
/// then children in breadth-first order.
pub fn colocation_chain(
    directory: &PartitionDirectory,
    region: RegionId,
) -> Result<Vec<RegionId>, GridError> {
    let mut chain = vec![region];
    let mut cursor = 0;
    while cursor < chain.len() {
        let children = directory.colocated_children(chain[cursor])?;
        chain.extend(children);
        cursor += 1;
    }
    Ok(chain)
}

fn chain_advisories(
    directory: &PartitionDirectory,
    chain: &[RegionId],
    bucket: BucketId,
) -> Result<Vec<(RegionId, BucketId, BucketSnapshot)>, GridError> {
    let mut advisories = Vec::with_capacity(chain.len());
    for &r in chain {
        advisories.push((r, bucket, directory.snapshot(r, bucket)?));
    }
    Ok(advisories)
}

/// Handles CreateBucket / CreateRedundantBucket at the target member `me`.
///
/// Redundant creation never reassigns an existing primary and treats a
/// bucket already at its redundancy target as AlreadyExists.
pub fn create_bucket(
    directory: &PartitionDirectory,
    storage: &dyn BucketStorage,
    me: MemberId,
    region: RegionId,
    bucket: BucketId,
    redundant: bool,
) -> Result<LifecycleOutcome, GridError> {
    let snap = directory.snapshot(region, bucket)?;
    if snap.hosts_member(me) {
        return Ok(LifecycleOutcome::ack_only(LifecycleAck::AlreadyExists));
    }
    if redundant
        && snap.hosts.count() >= directory.redundancy(region)? + 1
    {
        // redundancy target already met
        return Ok(LifecycleOutcome::ack_only(LifecycleAck::AlreadyExists));
    }

    let chain = colocation_chain(directory, region)?;

    // allocate storage for the whole chain before touching any record
    for (idx, &r) in chain.iter().enumerate() {
        if let Err(e) = storage.create_bucket_storage(r, bucket) {
            // roll back storages created so far; records are untouched
            for &created in &chain[..idx] {
                let _ = storage.destroy_bucket_storage(created, bucket);
            }
            return Ok(LifecycleOutcome::ack_only(LifecycleAck::Refused {
                reason: format!(
                    "create of colocated region {} failed: {}",
                    r, e
                ),
            }));
        }
    }

    for &r in &chain {
        directory.mutate(r, bucket, |record| {
            record.hosts.set(me, true).unwrap();
            // record.refresh() assigns a primary only if there is none, so
            // a redundant copy never displaces the existing primary
        })?;
    }

    pf_debug!(
        "created bucket {} of region {} (chain {:?}, redundant {})",
        bucket,
        region,
        chain,
        redundant
    );
    Ok(LifecycleOutcome {
        ack: LifecycleAck::Created,
        advisories: chain_advisories(directory, &chain, bucket)?,
    })
}

/// Handles RemoveBucket at the target member `me`. Colocated children are
/// removed first; if a child fails, the parent is left untouched and the
/// failing child is reported so the caller can retry the whole chain.
pub fn remove_bucket(
    directory: &PartitionDirectory,
    storage: &dyn BucketStorage,
    me: MemberId,
    region: RegionId,
    bucket: BucketId,
    forced: bool,
) -> Result<LifecycleOutcome, GridError> {
    let snap = directory.snapshot(region, bucket)?;
    if !snap.hosts_member(me) {
        return Ok(LifecycleOutcome::ack_only(LifecycleAck::NotHosting));
    }
    if snap.primary == Some(me) && !forced {
        return Ok(LifecycleOutcome::ack_only(LifecycleAck::Refused {
            reason: format!(
                "member {} is primary of bucket {}; removal needs forced",
                me, bucket
            ),
        }));
    }

    let chain = colocation_chain(directory, region)?;

    // children first (deepest first), parent storage last; records are only
    // mutated once every storage teardown succeeded
    for &r in chain.iter().skip(1).rev() {
        if let Err(e) = storage.destroy_bucket_storage(r, bucket) {
            return Ok(LifecycleOutcome::ack_only(LifecycleAck::Refused {
                reason: format!(
                    "remove of colocated region {} failed: {}",
                    r, e
                ),
            }));
        }
    }
    storage.destroy_bucket_storage(region, bucket)?;

    for &r in &chain {
        directory.mutate(r, bucket, |record| {
            record.hosts.set(me, false).unwrap();
        })?;
    }

    pf_debug!(
        "removed bucket {} of region {} (chain {:?})",
        bucket,
        region,
        chain
    );
    Ok(LifecycleOutcome {
        ack: LifecycleAck::Removed,
        advisories: chain_advisories(directory, &chain, bucket)?,
    })
}

/// Handles BecomePrimary at the target member `me`: unconditional local
/// assumption of primaryship across the colocation chain. Other hosts learn
/// through the advisory fan-out.
pub fn become_primary(
    directory: &PartitionDirectory,
    me: MemberId,
    region: RegionId,
    bucket: BucketId,
) -> Result<LifecycleOutcome, GridError> {
    let snap = directory.snapshot(region, bucket)?;
    if !snap.hosts_member(me) {
        return Ok(LifecycleOutcome::ack_only(LifecycleAck::Refused {
            reason: format!(
                "member {} does not host bucket {}",
                me, bucket
            ),
        }));
    }

    let chain = colocation_chain(directory, region)?;
    for &r in &chain {
        directory.mutate(r, bucket, |record| {
            record.primary = Some(me);
        })?;
    }

    pf_debug!("assumed primary of bucket {} region {}", bucket, region);
    Ok(LifecycleOutcome {
        ack: LifecycleAck::PrimaryAssumed,
        advisories: chain_advisories(directory, &chain, bucket)?,
    })
}

/// Handles DeposePrimary at the target member `me`: relinquishes primary
/// and elects the lowest remaining host. A sole host stays primary since a
/// hosted bucket is never left headless; deposing a non-primary is the
/// idempotent duplicate-delivery arm.
pub fn depose_primary(
    directory: &PartitionDirectory,
    me: MemberId,
    region: RegionId,
    bucket: BucketId,
) -> Result<LifecycleOutcome, GridError> {
    let snap = directory.snapshot(region, bucket)?;
    if snap.primary != Some(me) {
        return Ok(LifecycleOutcome::ack_only(LifecycleAck::Deposed));
    }

    let successor = snap
        .hosts
        .iter_ones()
        .find(|&h| h != me)
        .unwrap_or(me);

    let chain = colocation_chain(directory, region)?;
    for &r in &chain {
        directory.mutate(r, bucket, |record| {
            record.primary = Some(successor);
        })?;
    }

    pf_debug!(
        "deposed primary of bucket {} region {}; successor {}",
        bucket,
        region,
        successor
    );
    Ok(LifecycleOutcome {
        ack: LifecycleAck::Deposed,
        advisories: chain_advisories(directory, &chain, bucket)?,
    })
}
