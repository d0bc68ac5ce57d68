//! Wire message model for partition operations.
//!
//! One tagged request enum covers every operation type; there is no message
//! class hierarchy. Each request carries the region, a processor ID unique
//! to the logical call, and an operation-specific payload. Replies carry the
//! processor ID plus either a typed payload, a stream chunk, or a typed
//! failure.

use crate::directory::{BucketId, BucketSnapshot, RegionId};
use crate::membership::MemberId;
use crate::stream::ChunkEnvelope;

use bytes::Bytes;

use serde::{Deserialize, Serialize};

/// Processor ID type: unique per logical call, monotonically assigned by the
/// calling member's correlator.
pub type ProcessorId = u64;

/// Version stamp assigned by a bucket's primary when it originates a write.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize,
)]
pub struct VersionTag {
    /// Member that originated (version-stamped) the write.
    pub member: MemberId,

    /// Per-bucket monotonic write sequence at that member.
    pub sequence: u64,
}

/// Typed failure taxonomy carried in replies and surfaced to callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureKind {
    /// Send could not reach the target. Retryable at dispatcher level.
    Transport,

    /// Target left the membership view mid-operation. Retryable; triggers
    /// re-resolution.
    MemberDeparted,

    /// Target replied "not primary" / "not hosting". Retryable; triggers
    /// re-resolution.
    StaleOwnership { bucket: BucketId },

    /// Target executed the operation and it failed logically. Surfaced to
    /// the caller verbatim, never retried.
    Application { detail: String },

    /// Target's bucket relocated during a long-running scan. Retried under
    /// HA policy, else surfaced distinctly.
    BucketMoved { bucket: BucketId },

    /// Resource guard tripped during evaluation. Surfaced immediately,
    /// never retried.
    LowMemoryAbort,
}

impl FailureKind {
    /// True for kinds the dispatcher may transparently resend to a newly
    /// resolved owner.
    pub fn resendable(&self) -> bool {
        matches!(
            self,
            FailureKind::Transport
                | FailureKind::MemberDeparted
                | FailureKind::StaleOwnership { .. }
        )
    }
}

/// Caller-visible failure of a whole operation, tagged with the originating
/// target(s) and whether already-merged partial results were discarded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpFailure {
    pub kind: FailureKind,
    pub members: Vec<MemberId>,
    pub partial_discarded: bool,
}

impl OpFailure {
    pub fn of(kind: FailureKind, member: MemberId) -> Self {
        OpFailure {
            kind,
            members: vec![member],
            partial_discarded: false,
        }
    }
}

impl std::fmt::Display for OpFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "{:?} at members {:?}{}",
            self.kind,
            self.members,
            if self.partial_discarded {
                " (partial results discarded)"
            } else {
                ""
            }
        )
    }
}

/// Per-member partition statistics, one entry per replying member of a
/// fetch-partition-details call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionMemberInfo {
    pub member: MemberId,

    /// True for a departed member reported from last-known records; its
    /// statistics fields are zeroed since it can no longer be asked.
    pub offline: bool,

    /// Buckets this member hosts a copy of.
    pub hosted: Vec<BucketId>,

    /// Subset of `hosted` this member is primary for.
    pub primaries: Vec<BucketId>,

    /// Bytes used by local bucket storage.
    pub bytes_used: u64,

    /// Entries across local buckets.
    pub entry_count: u64,

    /// Hosted buckets currently below target redundancy.
    pub low_redundancy: Vec<BucketId>,
}

/// Result code of a bucket lifecycle exchange. Lifecycle handlers never
/// throw for benign races; duplicate delivery lands on the idempotent arm.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LifecycleAck {
    /// Bucket storage allocated and host set joined.
    Created,

    /// Target was already hosting; state unchanged.
    AlreadyExists,

    /// Local copy destroyed and host set left.
    Removed,

    /// Target held no copy; state unchanged.
    NotHosting,

    /// Target assumed primary for the bucket.
    PrimaryAssumed,

    /// Target relinquished primary; a re-election ran among remaining hosts.
    Deposed,

    /// Precondition refused (e.g. removing an unforced primary, or a
    /// colocated child failing partway). Names what refused.
    Refused { reason: String },
}

/// Operation-specific request payloads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpPayload {
    /// Destroy a key at the bucket's primary, optionally conditional on the
    /// currently stored value.
    DestroyKey {
        bucket: BucketId,
        key: Bytes,
        expected_old: Option<Bytes>,
    },

    /// Fetch this member's partition statistics. Offline members cannot be
    /// asked; the caller fills those in from its own last-known records.
    FetchDetails,

    /// Evaluate a compiled query against the listed locally-hosted buckets,
    /// streaming results back in chunks.
    Query {
        compiled: Bytes,
        buckets: Vec<BucketId>,
    },

    /// Execute a function against the listed locally-hosted buckets,
    /// streaming results back in chunks. `failed_members` carries the HA
    /// re-execution exclusion set from prior attempts.
    Function {
        function: Bytes,
        buckets: Vec<BucketId>,
        is_ha: bool,
        failed_members: Vec<MemberId>,
    },

    /// Host a new copy of the bucket. `redundant` marks a redundant-copy
    /// creation, which never reassigns an existing primary.
    CreateBucket { bucket: BucketId, redundant: bool },

    /// Drop the local copy of the bucket. Needs `forced` when the target is
    /// primary.
    RemoveBucket { bucket: BucketId, forced: bool },

    /// Unconditionally assume primary for the bucket.
    BecomePrimary { bucket: BucketId },

    /// Relinquish primary for the bucket and trigger re-election.
    DeposePrimary { bucket: BucketId },

    /// Fire-and-forget directory advisory carrying the authoritative record
    /// after a lifecycle mutation.
    Advisory {
        bucket: BucketId,
        snapshot: BucketSnapshot,
    },
}

impl OpPayload {
    /// True for payloads answered with a chunk stream rather than a single
    /// reply.
    pub fn is_streamed(&self) -> bool {
        matches!(
            self,
            OpPayload::Query { .. } | OpPayload::Function { .. }
        )
    }

    /// True for payloads that expect no reply at all.
    pub fn is_one_way(&self) -> bool {
        matches!(self, OpPayload::Advisory { .. })
    }
}

/// A request message to a target member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    pub region: RegionId,
    pub processor: ProcessorId,
    pub payload: OpPayload,
}

/// Operation-specific reply payloads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplyPayload {
    /// Key destroyed; carries the primary's version stamp.
    Destroyed { tag: VersionTag },

    /// This member's partition statistics.
    Details(PartitionMemberInfo),

    /// Lifecycle result code.
    Lifecycle(LifecycleAck),
}

/// Outcome part of a reply message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplyResult {
    /// Single complete reply.
    Payload(ReplyPayload),

    /// One chunk of a streamed reply.
    Chunk(ChunkEnvelope),

    /// Typed failure from the target.
    Failure(FailureKind),
}

/// A reply message back to the requesting member. The sending member rides
/// on the transport envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reply {
    pub processor: ProcessorId,
    pub result: ReplyResult,
}

/// Top-level peer-to-peer message type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum GridMsg {
    Request(Request),
    Reply(Reply),
}
