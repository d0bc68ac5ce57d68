//! Reply correlator: matches a fan-out request to its scattered replies.
//!
//! One `Pending` per logical call, keyed by processor ID, tracking which
//! targets are still outstanding and what each resolved to. A departure of a
//! still-outstanding target resolves it as `Departed`, equivalent to but
//! distinguishable from a reply. The whole coordination state for a call
//! lives in one mutex-guarded struct; the separate in-flight counter keeps
//! the wait from returning while another reply for the same round is still
//! being processed off-lock.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::membership::MemberId;
use crate::ops::{FailureKind, ProcessorId, ReplyPayload, ReplyResult};
use crate::stream::ChunkAssembly;
use crate::utils::{Bitmap, GridError};

use bytes::Bytes;

use tokio::sync::Notify;
use tokio::time::{sleep_until, Duration, Instant};

/// What one target of a pending operation resolved to. After a successful
/// await, every target has exactly one of these.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetOutcome {
    /// Target replied with a complete payload.
    Replied(ReplyPayload),

    /// Target's chunk stream completed; the reassembled object sequence in
    /// production order.
    Streamed(Vec<Bytes>),

    /// Target replied with a typed failure.
    Failed(FailureKind),

    /// Target left the view while outstanding.
    Departed,
}

/// Per-object fold callback applied to streamed objects as their chunks
/// become processable in order. A fold error aborts the whole streaming
/// operation: later chunks are still drained for completion but no longer
/// folded.
pub type FoldFn =
    Arc<dyn Fn(MemberId, &Bytes) -> Result<(), GridError> + Send + Sync>;

/// Mutable state of one pending operation, guarded by a single mutex.
struct PendingState {
    /// Targets that have not yet resolved.
    outstanding: Bitmap,

    /// Count of replies currently being processed outside this lock. The
    /// wait may only return when this is zero as well, so a departure
    /// decrementing `outstanding` to zero cannot race a chunk still being
    /// folded.
    in_flight: u32,

    /// Resolved outcome per target.
    outcomes: HashMap<MemberId, TargetOutcome>,

    /// Per-sender chunk reassembly, streamed operations only.
    streams: HashMap<MemberId, ChunkAssembly>,

    /// Streaming abort flag: drain further chunks, fold nothing.
    aborted: bool,

    /// Set when the awaiter returned or abandoned the wait; late replies
    /// finding this set are dropped and can never resurrect the operation.
    retired: bool,
}

/// One pending operation. Owned by the correlator registry, referenced by
/// the handle given to the caller.
struct Pending {
    /// Optional streamed-object fold callback.
    fold: Option<FoldFn>,

    state: Mutex<PendingState>,

    /// Wakes the awaiter after any state change.
    notify: Notify,
}

impl Pending {
    fn notify_change(&self) {
        self.notify.notify_one();
    }
}

/// The reply correlator of one member.
pub struct Correlator {
    /// Cluster population (bitmap sizing).
    population: u8,

    /// Monotonic processor ID assignment.
    next_processor: AtomicU64,

    /// Registry of pending operations. Retiring an operation and dropping a
    /// late reply for it go through the state lock of the same `Pending`,
    /// looked up here.
    registry: Mutex<HashMap<ProcessorId, Arc<Pending>>>,
}

impl Correlator {
    pub fn new(population: u8) -> Arc<Self> {
        Arc::new(Correlator {
            population,
            next_processor: AtomicU64::new(1),
            registry: Mutex::new(HashMap::new()),
        })
    }

    pub fn population(&self) -> u8 {
        self.population
    }

    /// Registers a new pending operation for the given target set. Must be
    /// called before the request message is sent: targets already absent
    /// from `alive` are resolved as departed right here, and targets
    /// departing later are caught by `member_departed`, so no departure
    /// falls in a gap.
    pub fn register(
        self: &Arc<Self>,
        targets: Bitmap,
        alive: &Bitmap,
        fold: Option<FoldFn>,
    ) -> ReplyHandle {
        let processor =
            self.next_processor.fetch_add(1, Ordering::Relaxed);
        let pending = Arc::new(Pending {
            fold,
            state: Mutex::new(PendingState {
                outstanding: targets.clone(),
                in_flight: 0,
                outcomes: HashMap::new(),
                streams: HashMap::new(),
                aborted: false,
                retired: false,
            }),
            notify: Notify::new(),
        });

        self.registry
            .lock()
            .unwrap()
            .insert(processor, pending.clone());

        // resolve targets that were gone before registration
        for target in targets.iter_ones() {
            if !alive.get(target).unwrap_or(false) {
                let mut st = pending.state.lock().unwrap();
                if st.outstanding.get(target).unwrap_or(false) {
                    st.outstanding.set(target, false).unwrap();
                    st.outcomes.insert(target, TargetOutcome::Departed);
                }
            }
        }

        pf_debug!(
            "registered processor {} targets {:?}",
            processor,
            targets
        );
        ReplyHandle {
            correlator: self.clone(),
            processor,
            pending,
            awaited: false,
        }
    }

    fn lookup(&self, processor: ProcessorId) -> Option<Arc<Pending>> {
        self.registry.lock().unwrap().get(&processor).cloned()
    }

    fn retire(&self, processor: ProcessorId) {
        self.registry.lock().unwrap().remove(&processor);
    }

    /// Routes one reply message into its pending operation. Replies for
    /// retired or unknown processor IDs are dropped.
    pub fn deliver(
        &self,
        processor: ProcessorId,
        sender: MemberId,
        result: ReplyResult,
    ) {
        let pending = match self.lookup(processor) {
            Some(pending) => pending,
            None => {
                pf_trace!(
                    "reply from {} for retired processor {} dropped",
                    sender,
                    processor
                );
                return;
            }
        };

        match result {
            ReplyResult::Payload(payload) => Self::deliver_final(
                &pending,
                sender,
                TargetOutcome::Replied(payload),
            ),
            ReplyResult::Failure(kind) => Self::deliver_final(
                &pending,
                sender,
                TargetOutcome::Failed(kind),
            ),
            ReplyResult::Chunk(env) => {
                Self::deliver_chunk(&pending, sender, env)
            }
        }
    }

    /// Records a final (non-chunk) outcome for a target.
    fn deliver_final(
        pending: &Arc<Pending>,
        sender: MemberId,
        outcome: TargetOutcome,
    ) {
        let mut st = pending.state.lock().unwrap();
        if st.retired || !st.outstanding.get(sender).unwrap_or(false) {
            // late, duplicate, or target already resolved (e.g. departed)
            return;
        }
        st.outstanding.set(sender, false).unwrap();
        st.outcomes.insert(sender, outcome);
        drop(st);
        pending.notify_change();
    }

    /// Folds one chunk of a streamed reply. The fold callback runs outside
    /// the state lock with the in-flight counter held up, so a concurrent
    /// departure cannot let the wait return mid-fold.
    fn deliver_chunk(
        pending: &Arc<Pending>,
        sender: MemberId,
        env: crate::stream::ChunkEnvelope,
    ) {
        // phase 1: stage the chunk, pull out chunks now foldable in order
        let ready = {
            let mut st = pending.state.lock().unwrap();
            if st.retired || !st.outstanding.get(sender).unwrap_or(false) {
                return;
            }
            st.in_flight += 1;
            st.streams.entry(sender).or_default().offer(env)
        };

        // phase 2: fold off-lock
        let mut fold_failed = false;
        let mut kept: Vec<Vec<Bytes>> = Vec::new();
        let already_aborted = pending.state.lock().unwrap().aborted;
        if !already_aborted {
            'fold: for objects in ready {
                if let Some(fold) = &pending.fold {
                    for obj in &objects {
                        if let Err(e) = fold(sender, obj) {
                            pf_warn!(
                                "fold error on chunk from {}: {}",
                                sender,
                                e
                            );
                            fold_failed = true;
                            break 'fold;
                        }
                    }
                }
                kept.push(objects);
            }
        }

        // phase 3: absorb folded objects, settle counters
        let mut st = pending.state.lock().unwrap();
        if fold_failed {
            st.aborted = true;
        }
        let aborted = st.aborted;
        if let Some(assembly) = st.streams.get_mut(&sender) {
            if !aborted {
                for objects in kept {
                    assembly.absorb(objects);
                }
            }
            if assembly.complete() {
                st.outstanding.set(sender, false).unwrap();
            }
        }
        st.in_flight -= 1;
        drop(st);
        pending.notify_change();
    }

    /// Membership departure callback: resolves the departed member in every
    /// pending operation it is still outstanding for.
    pub fn member_departed(&self, id: MemberId) {
        let pendings: Vec<Arc<Pending>> = self
            .registry
            .lock()
            .unwrap()
            .values()
            .cloned()
            .collect();
        for pending in pendings {
            let mut st = pending.state.lock().unwrap();
            if st.retired || !st.outstanding.get(id).unwrap_or(false) {
                continue;
            }
            st.outstanding.set(id, false).unwrap();
            st.outcomes.insert(id, TargetOutcome::Departed);
            drop(st);
            pending.notify_change();
        }
    }
}

/// Resolved outcomes of one pending operation, per target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyOutcomes {
    /// True if the streaming operation was aborted mid-stream; streamed
    /// sequences are then partial and must be discarded by the caller.
    pub aborted: bool,

    pub outcomes: HashMap<MemberId, TargetOutcome>,
}

impl ReplyOutcomes {
    /// First application-level failure among targets, lowest member ID
    /// first for determinism. Departures are not failures here.
    pub fn first_failure(&self) -> Option<(MemberId, &FailureKind)> {
        let mut ids: Vec<MemberId> = self.outcomes.keys().cloned().collect();
        ids.sort();
        for id in ids {
            if let Some(TargetOutcome::Failed(kind)) = self.outcomes.get(&id)
            {
                return Some((id, kind));
            }
        }
        None
    }

    /// All typed failures, for callers that opted into collect-all.
    pub fn all_failures(&self) -> Vec<(MemberId, FailureKind)> {
        let mut fails: Vec<(MemberId, FailureKind)> = self
            .outcomes
            .iter()
            .filter_map(|(id, o)| match o {
                TargetOutcome::Failed(kind) => Some((*id, kind.clone())),
                _ => None,
            })
            .collect();
        fails.sort_by_key(|(id, _)| *id);
        fails
    }

    /// Targets that resolved by pure departure: the distinguished
    /// "unreachable" condition callers retry against a different owner.
    pub fn departed(&self) -> Vec<MemberId> {
        let mut ids: Vec<MemberId> = self
            .outcomes
            .iter()
            .filter_map(|(id, o)| match o {
                TargetOutcome::Departed => Some(*id),
                _ => None,
            })
            .collect();
        ids.sort();
        ids
    }

    /// Reply payload of a target, if it replied complete.
    pub fn payload(&self, id: MemberId) -> Option<&ReplyPayload> {
        match self.outcomes.get(&id) {
            Some(TargetOutcome::Replied(payload)) => Some(payload),
            _ => None,
        }
    }

    /// Reassembled streamed sequence of a target.
    pub fn streamed(&self, id: MemberId) -> Option<&[Bytes]> {
        match self.outcomes.get(&id) {
            Some(TargetOutcome::Streamed(objects)) => Some(objects),
            _ => None,
        }
    }

    /// True if every target replied successfully.
    pub fn fully_replied(&self) -> bool {
        self.outcomes.values().all(|o| {
            matches!(
                o,
                TargetOutcome::Replied(_) | TargetOutcome::Streamed(_)
            )
        })
    }
}

/// Single-shot handle on a pending operation.
pub struct ReplyHandle {
    correlator: Arc<Correlator>,
    pub processor: ProcessorId,
    pending: Arc<Pending>,
    awaited: bool,
}

impl ReplyHandle {
    /// Blocks until every target has resolved and no reply is mid-
    /// processing, or until the timeout. On timeout the operation is
    /// abandoned: replies arriving afterward are matched against the
    /// processor ID, found retired, and dropped.
    pub async fn await_replies(
        &mut self,
        timeout: Duration,
    ) -> Result<ReplyOutcomes, GridError> {
        if self.awaited {
            return logged_err!(
                "processor {} awaited twice",
                self.processor
            );
        }
        self.awaited = true;

        let deadline = Instant::now() + timeout;
        loop {
            {
                let mut st = self.pending.state.lock().unwrap();
                if st.outstanding.count() == 0 && st.in_flight == 0 {
                    st.retired = true;
                    // unresolved-by-outcome streams become streamed outcomes
                    let streams = std::mem::take(&mut st.streams);
                    for (member, assembly) in streams {
                        st.outcomes.entry(member).or_insert_with(|| {
                            TargetOutcome::Streamed(assembly.into_objects())
                        });
                    }
                    let outcomes = ReplyOutcomes {
                        aborted: st.aborted,
                        outcomes: std::mem::take(&mut st.outcomes),
                    };
                    drop(st);
                    self.correlator.retire(self.processor);
                    return Ok(outcomes);
                }
            }

            tokio::select! {
                _ = self.pending.notify.notified() => {}
                _ = sleep_until(deadline) => {
                    self.pending.state.lock().unwrap().retired = true;
                    self.correlator.retire(self.processor);
                    return logged_err!(
                        "await timed out on processor {}",
                        self.processor
                    );
                }
            }
        }
    }

    /// Marks the streaming operation aborted: later chunks are drained but
    /// not folded.
    pub fn abort(&self) {
        self.pending.state.lock().unwrap().aborted = true;
    }
}

impl Drop for ReplyHandle {
    fn drop(&mut self) {
        // abandoning without awaiting still retires the operation
        self.pending.state.lock().unwrap().retired = true;
        self.correlator.retire(self.processor);
    }
}
