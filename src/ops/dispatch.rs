//! Partition operation dispatcher: target resolution plus bounded resend.
//!
//! Retries live here, never inside the reply correlator. A reply of
//! "not primary", a departure, or a send failure triggers one re-resolution
//! and resend cycle per unit of the caller's retry budget; exhausting the
//! budget surfaces a typed partition-unavailable failure. This is the
//! `resend_to_new_owner` strategy; whole-operation re-execution is the
//! reconciler's business.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::correlate::{Correlator, FoldFn, ReplyHandle, ReplyOutcomes};
use crate::directory::{BucketId, BucketSnapshot, PartitionDirectory, RegionId};
use crate::membership::{HubSender, MemberId, MembershipView};
use crate::ops::{
    FailureKind, GridMsg, OpFailure, OpPayload, ReplyPayload, ReplyResult,
    Request,
};
use crate::utils::{Bitmap, GridError};

use rand::prelude::*;

use tokio::time::Duration;

/// Dispatcher tuning knobs.
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Re-resolution + resend cycles allowed per call.
    pub retry_budget: u8,

    /// Reply wait deadline per attempt.
    pub reply_timeout: Duration,

    /// Read-target policy: true routes reads to a random replica instead of
    /// the primary.
    pub read_any_replica: bool,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        DispatchConfig {
            retry_budget: 2,
            reply_timeout: Duration::from_secs(5),
            read_any_replica: false,
        }
    }
}

/// Typed caller-visible operation error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpError {
    /// No owner could be reached within the retry budget.
    PartitionUnavailable { region: RegionId, bucket: BucketId },

    /// A target failed the operation; carries the taxonomy kind, the
    /// originating member(s), and whether partial results were discarded.
    Failure(OpFailure),

    /// Local plumbing error.
    Internal(GridError),
}

impl fmt::Display for OpError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            OpError::PartitionUnavailable { region, bucket } => write!(
                f,
                "partition unavailable: region {} bucket {}",
                region, bucket
            ),
            OpError::Failure(failure) => write!(f, "{}", failure),
            OpError::Internal(e) => write!(f, "internal error: {}", e),
        }
    }
}

impl From<GridError> for OpError {
    fn from(e: GridError) -> Self {
        OpError::Internal(e)
    }
}

/// Resolves targets, sends typed requests, and returns correlated replies.
pub struct Dispatcher {
    me: MemberId,
    view: Arc<MembershipView>,
    sender: HubSender<GridMsg>,
    correlator: Arc<Correlator>,
    directory: Arc<PartitionDirectory>,
    config: DispatchConfig,
}

impl Dispatcher {
    pub fn new(
        me: MemberId,
        view: Arc<MembershipView>,
        sender: HubSender<GridMsg>,
        correlator: Arc<Correlator>,
        directory: Arc<PartitionDirectory>,
        config: DispatchConfig,
    ) -> Self {
        Dispatcher {
            me,
            view,
            sender,
            correlator,
            directory,
            config,
        }
    }

    pub fn me(&self) -> MemberId {
        self.me
    }

    pub fn directory(&self) -> &Arc<PartitionDirectory> {
        &self.directory
    }

    pub fn view(&self) -> &Arc<MembershipView> {
        &self.view
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    fn single_target(&self, target: MemberId) -> Result<Bitmap, GridError> {
        let mut targets = Bitmap::new(self.view.population(), false);
        targets.set(target, true)?;
        Ok(targets)
    }

    /// Picks the member a read for this bucket goes to: the primary, or any
    /// replica under the any-replica policy. `None` if no host is alive.
    pub fn read_target(&self, snap: &BucketSnapshot) -> Option<MemberId> {
        let alive = self.view.alive_map();
        let candidates: Vec<MemberId> = snap
            .hosts
            .iter_ones()
            .filter(|&h| alive.get(h).unwrap_or(false))
            .collect();
        if candidates.is_empty() {
            return None;
        }
        if self.config.read_any_replica {
            candidates.iter().cloned().choose(&mut thread_rng())
        } else {
            match snap.primary {
                Some(p) if alive.get(p).unwrap_or(false) => Some(p),
                _ => candidates.first().cloned(),
            }
        }
    }

    /// Registers a pending operation and sends one request per target from
    /// the given payload map, all under one processor ID. Targets the send
    /// could not reach are resolved immediately as transport failures.
    pub async fn send_round(
        &self,
        region: RegionId,
        per_target: HashMap<MemberId, OpPayload>,
        fold: Option<FoldFn>,
    ) -> Result<ReplyHandle, GridError> {
        let mut targets = Bitmap::new(self.view.population(), false);
        for target in per_target.keys() {
            targets.set(*target, true)?;
        }

        // register before sending so no departure event can fall between
        let handle = self.correlator.register(
            targets,
            &self.view.alive_map(),
            fold,
        );

        for (target, payload) in per_target {
            let msg = GridMsg::Request(Request {
                region,
                processor: handle.processor,
                payload,
            });
            let failed = self
                .sender
                .send_msg(&msg, &self.single_target(target)?)
                .await?;
            if failed.get(target)? {
                self.correlator.deliver(
                    handle.processor,
                    target,
                    ReplyResult::Failure(FailureKind::Transport),
                );
            }
        }
        Ok(handle)
    }

    /// One request to one explicit target, no retry.
    pub async fn call_target(
        &self,
        target: MemberId,
        region: RegionId,
        payload: OpPayload,
    ) -> Result<ReplyOutcomes, OpError> {
        let mut handle = self
            .send_round(region, HashMap::from([(target, payload)]), None)
            .await?;
        Ok(handle.await_replies(self.config.reply_timeout).await?)
    }

    /// The resend-to-new-owner strategy: resolve the bucket's primary, send,
    /// and on a resendable failure re-resolve and resend, bounded by the
    /// retry budget.
    pub async fn resend_to_new_owner(
        &self,
        region: RegionId,
        bucket: BucketId,
        payload: OpPayload,
    ) -> Result<ReplyPayload, OpError> {
        let mut budget = self.config.retry_budget;
        loop {
            let snap = self.directory.snapshot(region, bucket)?;
            let alive = self.view.alive_map();
            let target = match snap.primary {
                Some(p) if alive.get(p).unwrap_or(false) => p,
                _ => {
                    // no live primary known; wait for re-election through
                    // the remaining budget
                    if budget > 0 {
                        budget -= 1;
                        tokio::time::sleep(Duration::from_millis(10)).await;
                        continue;
                    }
                    return Err(OpError::PartitionUnavailable {
                        region,
                        bucket,
                    });
                }
            };

            let outcomes = self
                .call_target(target, region, payload.clone())
                .await?;
            if let Some(reply) = outcomes.payload(target) {
                return Ok(reply.clone());
            }

            // classify: resendable failures burn budget, others surface
            let resendable = match outcomes.first_failure() {
                Some((_, kind)) => {
                    if !kind.resendable() {
                        return Err(OpError::Failure(OpFailure::of(
                            kind.clone(),
                            target,
                        )));
                    }
                    true
                }
                None => !outcomes.departed().is_empty(),
            };

            if resendable && budget > 0 {
                budget -= 1;
                pf_debug!(
                    "resending op on region {} bucket {} (budget {})",
                    region,
                    bucket,
                    budget
                );
                tokio::time::sleep(Duration::from_millis(10)).await;
                continue;
            }
            return Err(OpError::PartitionUnavailable { region, bucket });
        }
    }
}
