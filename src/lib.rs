//! Shardgrid: distributed coordination core of a partitioned, replicated
//! in-memory data grid.
//!
//! The crate covers the member-to-member plumbing of a data grid node:
//! fan-out request dispatch over a membership view, reply correlation,
//! chunked result streaming, the partition directory with bucket lifecycle
//! coordination, and HA result reconciliation. Data replication, the query
//! planner, and the failure detector are the embedding process's business
//! and enter through the seams in `membership`, `storage`, and `evaluate`.

#[macro_use]
mod utils;

mod correlate;
mod directory;
mod evaluate;
pub mod lifecycle;
mod membership;
mod node;
mod ops;
mod reconcile;
mod storage;
mod stream;

pub use crate::utils::{logger_init, Bitmap, GridError, ME};

pub use crate::correlate::{
    Correlator, FoldFn, ReplyHandle, ReplyOutcomes, TargetOutcome,
};
pub use crate::directory::{
    BucketId, BucketSnapshot, PartitionDirectory, RegionId, RegionSpec,
};
pub use crate::evaluate::{Evaluator, ResultSeq, ScanEvaluator};
pub use crate::membership::{
    build_fabric, HubSender, Member, MemberId, MembershipView, MessageHub,
};
pub use crate::node::{GridConfig, GridNode};
pub use crate::ops::{
    DispatchConfig, Dispatcher, FailureKind, GridMsg, LifecycleAck, OpError,
    OpFailure, OpPayload, PartitionMemberInfo, ProcessorId, Reply,
    ReplyPayload, ReplyResult, Request, VersionTag,
};
pub use crate::reconcile::{
    ExecKind, ReconcileConfig, Reconciler, ResultCollector,
};
pub use crate::storage::{BucketStorage, MemStorage};
pub use crate::stream::{ChunkAssembly, ChunkEnvelope, ChunkedSender};
