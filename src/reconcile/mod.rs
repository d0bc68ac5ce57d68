//! Fan-out execution of queries and functions across bucket owners, with
//! HA result reconciliation.
//!
//! The reconciler plans one target member per bucket, fans the operation
//! out in a single correlated round, and classifies what came back. A
//! retryable disruption (a target departing, a transport miss, stale
//! ownership, a bucket relocating mid-scan) is reconciled by re-executing
//! the WHOLE operation against a fresh plan, after discarding every partial
//! result already collected. Partials from a failed round are never
//! observable by the caller; only the last, fully successful round reaches
//! the collector. This is deliberately a different strategy from the
//! dispatcher's single-key resend, where re-sending the idempotent request
//! to the newly resolved owner suffices.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::directory::{BucketId, RegionId};
use crate::membership::MemberId;
use crate::correlate::TargetOutcome;
use crate::ops::{Dispatcher, FailureKind, OpError, OpFailure, OpPayload};
use crate::utils::GridError;

use bytes::Bytes;

use tokio::sync::Notify;
use tokio::time::{sleep_until, Duration, Instant};

/// What a fan-out round executes at each target.
#[derive(Debug, Clone)]
pub enum ExecKind {
    /// Compiled query evaluated against the target's hosted buckets.
    Query { compiled: Bytes },

    /// Function executed against the target's hosted buckets. `is_ha`
    /// enables whole-operation re-execution on retryable disruption.
    Function { function: Bytes, is_ha: bool },
}

impl ExecKind {
    fn is_ha(&self) -> bool {
        matches!(self, ExecKind::Function { is_ha: true, .. })
    }

    fn payload(
        &self,
        buckets: Vec<BucketId>,
        excluded: &[MemberId],
    ) -> OpPayload {
        match self {
            ExecKind::Query { compiled } => OpPayload::Query {
                compiled: compiled.clone(),
                buckets,
            },
            ExecKind::Function { function, is_ha } => OpPayload::Function {
                function: function.clone(),
                buckets,
                is_ha: *is_ha,
                failed_members: excluded.to_vec(),
            },
        }
    }
}

/// Mutable accumulator state behind the collector mutex.
#[derive(Default)]
struct CollectorState {
    results: Vec<Bytes>,
    ended: bool,
    failure: Option<OpFailure>,
}

/// Caller-facing accumulator for fan-out results. The reconciler feeds it;
/// the caller blocks on `get_result`. `clear` is the discard hook of HA
/// re-execution.
pub struct ResultCollector {
    state: Mutex<CollectorState>,
    notify: Notify,
}

impl Default for ResultCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl ResultCollector {
    pub fn new() -> Self {
        ResultCollector {
            state: Mutex::new(CollectorState::default()),
            notify: Notify::new(),
        }
    }

    pub fn add_result(&self, object: Bytes) {
        self.state.lock().unwrap().results.push(object);
    }

    /// Discards everything collected so far. Called before a re-execution
    /// round so a caller can never observe partials of a failed round.
    pub fn clear(&self) {
        self.state.lock().unwrap().results.clear();
    }

    pub fn end_results(&self) {
        self.state.lock().unwrap().ended = true;
        self.notify.notify_one();
    }

    pub fn end_with_failure(&self, failure: OpFailure) {
        let mut st = self.state.lock().unwrap();
        st.failure = Some(failure);
        st.ended = true;
        drop(st);
        self.notify.notify_one();
    }

    /// Blocks until the operation ended, then yields the merged results or
    /// the operation's failure.
    pub async fn get_result(
        &self,
        timeout: Duration,
    ) -> Result<Vec<Bytes>, OpError> {
        let deadline = Instant::now() + timeout;
        loop {
            {
                let mut st = self.state.lock().unwrap();
                if st.ended {
                    if let Some(failure) = st.failure.take() {
                        return Err(OpError::Failure(failure));
                    }
                    return Ok(std::mem::take(&mut st.results));
                }
            }
            tokio::select! {
                _ = self.notify.notified() => {}
                _ = sleep_until(deadline) => {
                    return Err(OpError::Internal(GridError::msg(
                        "result collector wait timed out",
                    )));
                }
            }
        }
    }
}

/// Reconciler tunables.
#[derive(Debug, Clone)]
pub struct ReconcileConfig {
    /// Whole-operation re-executions allowed under HA before giving up.
    pub ha_retry_ceiling: u8,
}

#[allow(clippy::derivable_impls)]
impl Default for ReconcileConfig {
    fn default() -> Self {
        ReconcileConfig {
            ha_retry_ceiling: 3,
        }
    }
}

/// What one fan-out round resolved to, after classification.
enum RoundVerdict {
    /// Every target streamed to completion; results were merged.
    Done,

    /// A target failed in a way no retry can fix.
    Fatal(OpFailure),

    /// Disrupted by departures, transport misses, stale ownership, or
    /// bucket moves. `moved_only` is true when bucket relocation was the
    /// only disruption, so exhaustion can name it distinctly.
    Retryable {
        members: Vec<MemberId>,
        kind: FailureKind,
        moved_only: bool,
    },
}

/// The fan-out executor of one member.
pub struct Reconciler {
    dispatcher: Arc<Dispatcher>,
    config: ReconcileConfig,
}

impl Reconciler {
    pub fn new(dispatcher: Arc<Dispatcher>, config: ReconcileConfig) -> Self {
        Reconciler { dispatcher, config }
    }

    /// Plans one target member per bucket against the current directory and
    /// membership view, grouping buckets by chosen member. Prefers the
    /// primary, then the lowest alive host outside the exclusion set, then
    /// any alive host.
    fn plan_round(
        &self,
        region: RegionId,
        buckets: &[BucketId],
        excluded: &[MemberId],
    ) -> Result<HashMap<MemberId, Vec<BucketId>>, OpError> {
        let directory = self.dispatcher.directory();
        let alive = self.dispatcher.view().alive_map();
        let mut plan: HashMap<MemberId, Vec<BucketId>> = HashMap::new();
        for &bucket in buckets {
            let snap = directory.snapshot(region, bucket)?;
            let usable = |h: MemberId| alive.get(h).unwrap_or(false);
            let target = if excluded.is_empty() {
                // fresh round: queries are reads, honor the read policy
                self.dispatcher.read_target(&snap)
            } else {
                snap.primary
                    .filter(|&p| usable(p) && !excluded.contains(&p))
                    .or_else(|| {
                        snap.hosts
                            .iter_ones()
                            .find(|&h| usable(h) && !excluded.contains(&h))
                    })
                    .or_else(|| snap.hosts.iter_ones().find(|&h| usable(h)))
            };
            match target {
                Some(member) => plan.entry(member).or_default().push(bucket),
                None => {
                    return Err(OpError::PartitionUnavailable {
                        region,
                        bucket,
                    });
                }
            }
        }
        Ok(plan)
    }

    /// Runs one fan-out round and classifies the outcome. Merging into the
    /// collector happens only when every target completed, in member-ID
    /// order for determinism.
    async fn run_round(
        &self,
        region: RegionId,
        kind: &ExecKind,
        buckets: &[BucketId],
        excluded: &[MemberId],
        collector: &ResultCollector,
    ) -> Result<RoundVerdict, OpError> {
        let plan = self.plan_round(region, buckets, excluded)?;
        let per_target: HashMap<MemberId, OpPayload> = plan
            .into_iter()
            .map(|(member, hosted)| (member, kind.payload(hosted, excluded)))
            .collect();

        let mut handle =
            self.dispatcher.send_round(region, per_target, None).await?;
        let outcomes = handle
            .await_replies(self.dispatcher.config().reply_timeout)
            .await?;

        // fatal failures win over everything else
        for (member, failure) in outcomes.all_failures() {
            if let FailureKind::Application { .. } | FailureKind::LowMemoryAbort =
                failure
            {
                return Ok(RoundVerdict::Fatal(OpFailure {
                    kind: failure,
                    members: vec![member],
                    partial_discarded: outcomes
                        .outcomes
                        .values()
                        .any(|o| matches!(o, TargetOutcome::Streamed(_))),
                }));
            }
        }

        let mut members = outcomes.departed();
        let mut kinds = Vec::new();
        for (member, failure) in outcomes.all_failures() {
            members.push(member);
            kinds.push(failure);
        }
        if !members.is_empty() {
            members.sort_unstable();
            members.dedup();
            let moved_only = outcomes.departed().is_empty()
                && kinds
                    .iter()
                    .all(|k| matches!(k, FailureKind::BucketMoved { .. }));
            let kind = kinds
                .into_iter()
                .next()
                .unwrap_or(FailureKind::MemberDeparted);
            return Ok(RoundVerdict::Retryable {
                members,
                kind,
                moved_only,
            });
        }

        let mut ids: Vec<MemberId> = outcomes.outcomes.keys().cloned().collect();
        ids.sort_unstable();
        for id in ids {
            if let Some(objects) = outcomes.streamed(id) {
                for object in objects {
                    collector.add_result(object.clone());
                }
            }
        }
        Ok(RoundVerdict::Done)
    }

    /// The re-execute strategy of HA reconciliation, as opposed to the
    /// dispatcher's resend-to-new-owner: discard every partial result, then
    /// run the whole operation again against a fresh plan that avoids the
    /// members that disrupted the previous round.
    async fn reexecute_whole_operation(
        &self,
        region: RegionId,
        kind: &ExecKind,
        buckets: &[BucketId],
        excluded: &[MemberId],
        collector: &ResultCollector,
    ) -> Result<RoundVerdict, OpError> {
        collector.clear();
        self.run_round(region, kind, buckets, excluded, collector).await
    }

    /// Executes a query or function across the owners of the given buckets
    /// (all of the region's buckets if `None`), reconciling disruptions per
    /// the HA policy and feeding the collector.
    pub async fn execute(
        &self,
        region: RegionId,
        kind: ExecKind,
        buckets: Option<Vec<BucketId>>,
        collector: &ResultCollector,
    ) -> Result<(), OpError> {
        let directory = self.dispatcher.directory();
        let buckets = match buckets {
            Some(list) => list,
            None => (0..directory.total_buckets(region)?).collect(),
        };

        let mut excluded: Vec<MemberId> = Vec::new();
        let mut retries_left = self.config.ha_retry_ceiling;
        let mut verdict = self
            .run_round(region, &kind, &buckets, &excluded, collector)
            .await;
        loop {
            match verdict {
                Ok(RoundVerdict::Done) => {
                    collector.end_results();
                    return Ok(());
                }
                Ok(RoundVerdict::Fatal(failure)) => {
                    collector.end_with_failure(failure.clone());
                    return Err(OpError::Failure(failure));
                }
                Ok(RoundVerdict::Retryable {
                    members,
                    kind: fail_kind,
                    moved_only,
                }) => {
                    let exhausted = !kind.is_ha() || retries_left == 0;
                    if exhausted {
                        // partials of the failed round never reach the caller
                        collector.clear();
                        let reason = if moved_only {
                            "bucket relocation persisted across rounds"
                        } else if kind.is_ha() {
                            "HA retry ceiling reached"
                        } else {
                            "retryable disruption without HA"
                        };
                        pf_warn!(
                            "fan-out on region {} gave up: {} ({:?} at {:?})",
                            region,
                            reason,
                            fail_kind,
                            members
                        );
                        let failure = OpFailure {
                            kind: fail_kind,
                            members,
                            partial_discarded: true,
                        };
                        collector.end_with_failure(failure.clone());
                        return Err(OpError::Failure(failure));
                    }
                    pf_debug!(
                        "re-executing fan-out on region {} excluding {:?}",
                        region,
                        members
                    );
                    excluded.extend(members);
                    excluded.sort_unstable();
                    excluded.dedup();
                    retries_left -= 1;
                    verdict = self
                        .reexecute_whole_operation(
                            region, &kind, &buckets, &excluded, collector,
                        )
                        .await;
                }
                Err(e) => {
                    if let OpError::Internal(ge) = &e {
                        collector.end_with_failure(OpFailure {
                            kind: FailureKind::Application {
                                detail: ge.to_string(),
                            },
                            members: vec![self.dispatcher.me()],
                            partial_discarded: true,
                        });
                    } else if let OpError::PartitionUnavailable { .. } = &e {
                        collector.end_with_failure(OpFailure {
                            kind: FailureKind::MemberDeparted,
                            members: Vec::new(),
                            partial_discarded: true,
                        });
                    }
                    return Err(e);
                }
            }
        }
    }
}
