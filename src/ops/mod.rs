//! Partition operation model and dispatcher.

mod dispatch;
mod messages;

pub use dispatch::{DispatchConfig, Dispatcher, OpError};
pub use messages::{
    FailureKind, GridMsg, LifecycleAck, OpFailure, OpPayload,
    PartitionMemberInfo, ProcessorId, ReplyPayload, ReplyResult, Reply,
    Request, VersionTag,
};
