//! Grid node: wires the membership view, message hub, directory,
//! correlator, dispatcher, and reconciler into one running member.
//!
//! Each node runs a single dispatch loop that multiplexes incoming peer
//! messages with departure events. Replies are routed to the correlator
//! inline; requests are handled in spawned tasks so a long bucket scan
//! never stalls reply correlation.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::correlate::Correlator;
use crate::directory::{
    BucketId, BucketSnapshot, PartitionDirectory, RegionId, RegionSpec,
};
use crate::evaluate::Evaluator;
use crate::lifecycle;
use crate::membership::{
    HubSender, Member, MemberId, MembershipView, MessageHub,
};
use crate::ops::{
    DispatchConfig, Dispatcher, FailureKind, GridMsg, LifecycleAck, OpError,
    OpFailure, OpPayload, PartitionMemberInfo, ProcessorId, Reply,
    ReplyPayload, ReplyResult, Request, VersionTag,
};
use crate::reconcile::{
    ExecKind, ReconcileConfig, Reconciler, ResultCollector,
};
use crate::storage::BucketStorage;
use crate::stream::ChunkedSender;
use crate::utils::GridError;

use bytes::Bytes;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Duration;

/// Node configuration parameters:
/// - `chunk_capacity`: soft byte cap per streamed result chunk
/// - `retry_budget`: re-resolution/resend cycles per dispatched call
/// - `ha_retry_ceiling`: whole-operation re-executions under HA
/// - `reply_timeout_ms`: reply wait deadline per round
/// - `read_any_replica`: route reads to a random replica, not the primary
/// - `move_fail_after_create`: fault injection point of `move_bucket`,
///   failing the move after the target copy exists
#[derive(Debug, Clone)]
pub struct GridConfig {
    pub chunk_capacity: usize,
    pub retry_budget: u8,
    pub ha_retry_ceiling: u8,
    pub reply_timeout_ms: u64,
    pub read_any_replica: bool,
    pub move_fail_after_create: bool,
}

impl Default for GridConfig {
    fn default() -> Self {
        GridConfig {
            chunk_capacity: 4096,
            retry_budget: 2,
            ha_retry_ceiling: 3,
            reply_timeout_ms: 5000,
            read_any_replica: false,
            move_fail_after_create: false,
        }
    }
}

/// Everything a node's message handlers share.
struct NodeInner {
    me: MemberId,
    config: GridConfig,
    view: Arc<MembershipView>,
    sender: HubSender<GridMsg>,
    correlator: Arc<Correlator>,
    directory: Arc<PartitionDirectory>,
    storage: Arc<dyn BucketStorage>,
    evaluator: Arc<dyn Evaluator>,
    dispatcher: Arc<Dispatcher>,
    reconciler: Reconciler,

    /// Per-bucket monotonic write sequence for version stamping writes
    /// this member originates as primary.
    write_seqs: Mutex<HashMap<(RegionId, BucketId), u64>>,

    /// Last-known hosted buckets of departed members, captured at departure
    /// time for offline partition-details reporting.
    departed_hosts: Mutex<HashMap<MemberId, HashMap<RegionId, Vec<BucketId>>>>,
}

/// One running grid member.
pub struct GridNode {
    inner: Arc<NodeInner>,
    loop_handle: JoinHandle<()>,
}

impl GridNode {
    /// Creates a node for the given member and starts its dispatch loop.
    /// `config_str` is an optional TOML overlay on the default config.
    pub fn new(
        member: Member,
        view: Arc<MembershipView>,
        hub: MessageHub<GridMsg>,
        specs: Vec<RegionSpec>,
        storage: Arc<dyn BucketStorage>,
        evaluator: Arc<dyn Evaluator>,
        config_str: Option<&str>,
    ) -> Result<GridNode, GridError> {
        let config = parsed_config!(config_str => GridConfig;
                                    chunk_capacity, retry_budget,
                                    ha_retry_ceiling, reply_timeout_ms,
                                    read_any_replica,
                                    move_fail_after_create)?;
        if config.chunk_capacity == 0 {
            return logged_err!("invalid config chunk_capacity 0");
        }

        let me = member.id;
        let directory = Arc::new(PartitionDirectory::new(
            view.population(),
            specs,
        )?);
        let correlator = Correlator::new(view.population());
        let sender = hub.sender();
        let dispatcher = Arc::new(Dispatcher::new(
            me,
            view.clone(),
            sender.clone(),
            correlator.clone(),
            directory.clone(),
            DispatchConfig {
                retry_budget: config.retry_budget,
                reply_timeout: Duration::from_millis(config.reply_timeout_ms),
                read_any_replica: config.read_any_replica,
            },
        ));
        let reconciler = Reconciler::new(
            dispatcher.clone(),
            ReconcileConfig {
                ha_retry_ceiling: config.ha_retry_ceiling,
            },
        );

        // subscribe before reading the view so no departure slips between
        let rx_depart = view.subscribe_departures();

        let inner = Arc::new(NodeInner {
            me,
            config,
            view,
            sender,
            correlator,
            directory,
            storage,
            evaluator,
            dispatcher,
            reconciler,
            write_seqs: Mutex::new(HashMap::new()),
            departed_hosts: Mutex::new(HashMap::new()),
        });

        let loop_inner = inner.clone();
        let loop_handle = tokio::spawn(async move {
            NodeInner::dispatch_loop(loop_inner, hub, rx_depart).await;
        });

        pf_info!("node {} started", member);
        Ok(GridNode { inner, loop_handle })
    }

    pub fn me(&self) -> MemberId {
        self.inner.me
    }

    pub fn directory(&self) -> &Arc<PartitionDirectory> {
        &self.inner.directory
    }

    pub fn view(&self) -> &Arc<MembershipView> {
        &self.inner.view
    }

    /// Destroys the entry under `key`, routed to the owning bucket's
    /// primary with bounded resend on ownership changes. With
    /// `expected_old` the destroy is conditional on the stored value.
    pub async fn destroy(
        &self,
        region: RegionId,
        key: Bytes,
        expected_old: Option<Bytes>,
    ) -> Result<VersionTag, OpError> {
        let bucket = self.inner.directory.key_to_bucket(region, &key)?;
        let payload = OpPayload::DestroyKey {
            bucket,
            key,
            expected_old,
        };
        match self
            .inner
            .dispatcher
            .resend_to_new_owner(region, bucket, payload)
            .await?
        {
            ReplyPayload::Destroyed { tag } => Ok(tag),
            other => Err(OpError::Internal(GridError(format!(
                "unexpected destroy reply {:?}",
                other
            )))),
        }
    }

    /// Collects per-member partition statistics from every alive member.
    /// With `include_offline`, appends one `offline` entry per departed
    /// member from its last-known host set, after the live entries.
    pub async fn fetch_partition_details(
        &self,
        region: RegionId,
        include_offline: bool,
    ) -> Result<Vec<PartitionMemberInfo>, OpError> {
        let alive = self.inner.view.alive_map();
        let per_target: HashMap<MemberId, OpPayload> = alive
            .iter_ones()
            .map(|m| (m, OpPayload::FetchDetails))
            .collect();
        let mut handle = self
            .inner
            .dispatcher
            .send_round(region, per_target, None)
            .await?;
        let outcomes = handle
            .await_replies(self.inner.dispatcher.config().reply_timeout)
            .await?;

        let mut ids: Vec<MemberId> = outcomes.outcomes.keys().cloned().collect();
        ids.sort_unstable();
        let mut infos = Vec::new();
        for id in ids {
            if let Some(ReplyPayload::Details(info)) = outcomes.payload(id) {
                infos.push(info.clone());
            }
        }
        if include_offline {
            infos.extend(self.inner.offline_details(region));
        }
        Ok(infos)
    }

    /// Evaluates a compiled query across the owners of the given buckets
    /// (all buckets if `None`) and returns the merged results.
    pub async fn run_query(
        &self,
        region: RegionId,
        compiled: Bytes,
        buckets: Option<Vec<BucketId>>,
    ) -> Result<Vec<Bytes>, OpError> {
        let collector = ResultCollector::new();
        self.inner
            .reconciler
            .execute(region, ExecKind::Query { compiled }, buckets, &collector)
            .await?;
        collector.get_result(Duration::from_millis(10)).await
    }

    /// Executes a function across the owners of the given buckets. Under
    /// `is_ha` a retryable disruption re-executes the whole operation with
    /// partials discarded.
    pub async fn run_function(
        &self,
        region: RegionId,
        function: Bytes,
        buckets: Option<Vec<BucketId>>,
        is_ha: bool,
    ) -> Result<Vec<Bytes>, OpError> {
        let collector = ResultCollector::new();
        self.inner
            .reconciler
            .execute(
                region,
                ExecKind::Function { function, is_ha },
                buckets,
                &collector,
            )
            .await?;
        collector.get_result(Duration::from_millis(10)).await
    }

    async fn lifecycle_call(
        &self,
        target: MemberId,
        region: RegionId,
        payload: OpPayload,
    ) -> Result<LifecycleAck, OpError> {
        let outcomes = self
            .inner
            .dispatcher
            .call_target(target, region, payload)
            .await?;
        match outcomes.payload(target) {
            Some(ReplyPayload::Lifecycle(ack)) => Ok(ack.clone()),
            Some(other) => Err(OpError::Internal(GridError(format!(
                "unexpected lifecycle reply {:?}",
                other
            )))),
            None => match outcomes.first_failure() {
                Some((member, kind)) => Err(OpError::Failure(
                    OpFailure::of(kind.clone(), member),
                )),
                None => Err(OpError::Failure(OpFailure::of(
                    FailureKind::MemberDeparted,
                    target,
                ))),
            },
        }
    }

    /// Asks `target` to host a new copy of the bucket.
    pub async fn create_bucket(
        &self,
        region: RegionId,
        bucket: BucketId,
        target: MemberId,
    ) -> Result<LifecycleAck, OpError> {
        self.lifecycle_call(
            target,
            region,
            OpPayload::CreateBucket {
                bucket,
                redundant: false,
            },
        )
        .await
    }

    /// Asks `target` to host a redundant copy; never displaces the current
    /// primary and refuses past the redundancy target.
    pub async fn create_redundant_bucket(
        &self,
        region: RegionId,
        bucket: BucketId,
        target: MemberId,
    ) -> Result<LifecycleAck, OpError> {
        self.lifecycle_call(
            target,
            region,
            OpPayload::CreateBucket {
                bucket,
                redundant: true,
            },
        )
        .await
    }

    /// Asks `target` to drop its copy of the bucket. `forced` is required
    /// when the target is the bucket's primary.
    pub async fn remove_bucket(
        &self,
        region: RegionId,
        bucket: BucketId,
        target: MemberId,
        forced: bool,
    ) -> Result<LifecycleAck, OpError> {
        self.lifecycle_call(
            target,
            region,
            OpPayload::RemoveBucket { bucket, forced },
        )
        .await
    }

    pub async fn become_primary(
        &self,
        region: RegionId,
        bucket: BucketId,
        target: MemberId,
    ) -> Result<LifecycleAck, OpError> {
        self.lifecycle_call(
            target,
            region,
            OpPayload::BecomePrimary { bucket },
        )
        .await
    }

    pub async fn depose_primary(
        &self,
        region: RegionId,
        bucket: BucketId,
        target: MemberId,
    ) -> Result<LifecycleAck, OpError> {
        self.lifecycle_call(
            target,
            region,
            OpPayload::DeposePrimary { bucket },
        )
        .await
    }

    /// Moves a bucket copy from one member to another. The copy on `to` is
    /// created before the copy on `from` is removed, so the bucket never
    /// drops below one copy; a failure after creation rolls the new copy
    /// back.
    pub async fn move_bucket(
        &self,
        region: RegionId,
        bucket: BucketId,
        from: MemberId,
        to: MemberId,
    ) -> Result<(), OpError> {
        let created = self.create_bucket(region, bucket, to).await?;
        let fresh_copy = match created {
            LifecycleAck::Created => true,
            LifecycleAck::AlreadyExists => false,
            LifecycleAck::Refused { reason } => {
                return Err(OpError::Failure(OpFailure::of(
                    FailureKind::Application { detail: reason },
                    to,
                )));
            }
            other => {
                return Err(OpError::Internal(GridError(format!(
                    "unexpected create ack {:?}",
                    other
                ))));
            }
        };

        let removal = if self.inner.config.move_fail_after_create {
            // injected fault in the window between create and remove
            Err(OpError::Failure(OpFailure::of(
                FailureKind::Transport,
                from,
            )))
        } else {
            self.remove_bucket(region, bucket, from, true).await
        };

        match removal {
            Ok(LifecycleAck::Removed) | Ok(LifecycleAck::NotHosting) => {
                Ok(())
            }
            Ok(LifecycleAck::Refused { reason }) => {
                self.rollback_move(region, bucket, to, fresh_copy).await;
                Err(OpError::Failure(OpFailure::of(
                    FailureKind::Application { detail: reason },
                    from,
                )))
            }
            Ok(other) => {
                self.rollback_move(region, bucket, to, fresh_copy).await;
                Err(OpError::Internal(GridError(format!(
                    "unexpected remove ack {:?}",
                    other
                ))))
            }
            Err(e) => {
                self.rollback_move(region, bucket, to, fresh_copy).await;
                Err(e)
            }
        }
    }

    async fn rollback_move(
        &self,
        region: RegionId,
        bucket: BucketId,
        to: MemberId,
        fresh_copy: bool,
    ) {
        if !fresh_copy {
            // the target hosted a copy before this move; leave it be
            return;
        }
        pf_warn!(
            "move of bucket {} region {} failed; rolling back copy on {}",
            bucket,
            region,
            to
        );
        if let Err(e) =
            self.remove_bucket(region, bucket, to, true).await
        {
            pf_error!(
                "rollback of bucket {} on member {} failed: {}",
                bucket,
                to,
                e
            );
        }
    }

    /// Stops the node's dispatch loop. In-flight handler tasks finish on
    /// their own.
    pub fn shutdown(&self) {
        pf_info!("node {} shutting down", self.inner.me);
        self.loop_handle.abort();
    }
}

impl Drop for GridNode {
    fn drop(&mut self) {
        self.loop_handle.abort();
    }
}

impl NodeInner {
    async fn dispatch_loop(
        inner: Arc<NodeInner>,
        mut hub: MessageHub<GridMsg>,
        mut rx_depart: broadcast::Receiver<(Member, bool)>,
    ) {
        loop {
            tokio::select! {
                msg = hub.recv_msg() => match msg {
                    Ok((peer, GridMsg::Reply(reply))) => {
                        inner.correlator.deliver(
                            reply.processor,
                            peer,
                            reply.result,
                        );
                    }
                    Ok((peer, GridMsg::Request(req))) => {
                        let handler = inner.clone();
                        tokio::spawn(async move {
                            if let Err(e) = NodeInner::handle_request(
                                handler, peer, req,
                            )
                            .await
                            {
                                pf_error!(
                                    "error handling request from {}: {}",
                                    peer,
                                    e
                                );
                            }
                        });
                    }
                    Err(_) => {
                        // recv channel closed, fabric torn down
                        break;
                    }
                },

                event = rx_depart.recv() => match event {
                    Ok((member, _crashed)) => {
                        inner.handle_departure(member.id);
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        pf_warn!("lagged {} departure events", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }
    }

    fn handle_departure(&self, id: MemberId) {
        // snapshot what the member hosted before the purge wipes it
        let mut last_known = HashMap::new();
        for region in self.directory.region_ids() {
            if let Ok(hosted) = self.directory.hosted_buckets(region, id) {
                if !hosted.is_empty() {
                    last_known.insert(region, hosted);
                }
            }
        }
        if !last_known.is_empty() {
            self.departed_hosts.lock().unwrap().insert(id, last_known);
        }

        let reprimaried = self.directory.member_departed(id);
        for (region, bucket) in &reprimaried {
            pf_info!(
                "bucket {} of region {} re-primaried after departure of {}",
                bucket,
                region,
                id
            );
        }
        self.correlator.member_departed(id);
    }

    async fn respond(
        &self,
        peer: MemberId,
        processor: ProcessorId,
        result: ReplyResult,
    ) -> Result<(), GridError> {
        self.sender
            .send_to(
                &GridMsg::Reply(Reply { processor, result }),
                peer,
            )
            .await
    }

    async fn handle_request(
        inner: Arc<NodeInner>,
        peer: MemberId,
        req: Request,
    ) -> Result<(), GridError> {
        let Request {
            region,
            processor,
            payload,
        } = req;
        match payload {
            OpPayload::Advisory { bucket, snapshot } => {
                if let Err(e) =
                    inner.directory.apply_advisory(region, bucket, &snapshot)
                {
                    pf_warn!(
                        "advisory for region {} bucket {} rejected: {}",
                        region,
                        bucket,
                        e
                    );
                }
                Ok(())
            }

            OpPayload::DestroyKey {
                bucket,
                key,
                expected_old,
            } => {
                let result = inner.do_destroy_key(
                    region,
                    bucket,
                    &key,
                    expected_old.as_ref(),
                )?;
                inner.respond(peer, processor, result).await
            }

            OpPayload::FetchDetails => {
                let info = inner.local_details(region)?;
                inner
                    .respond(
                        peer,
                        processor,
                        ReplyResult::Payload(ReplyPayload::Details(info)),
                    )
                    .await
            }

            OpPayload::Query { compiled, buckets } => {
                inner
                    .stream_evaluate(peer, processor, region, buckets, compiled)
                    .await
            }

            OpPayload::Function {
                function,
                buckets,
                is_ha: _,
                failed_members: _,
            } => {
                inner
                    .stream_evaluate(peer, processor, region, buckets, function)
                    .await
            }

            OpPayload::CreateBucket { bucket, redundant } => {
                let (directory, storage, me) = inner.blocking_parts();
                let outcome = tokio::task::spawn_blocking(move || {
                    lifecycle::create_bucket(
                        &directory,
                        storage.as_ref(),
                        me,
                        region,
                        bucket,
                        redundant,
                    )
                })
                .await??;
                inner
                    .respond(
                        peer,
                        processor,
                        ReplyResult::Payload(ReplyPayload::Lifecycle(
                            outcome.ack,
                        )),
                    )
                    .await?;
                inner.broadcast_advisories(outcome.advisories).await;
                Ok(())
            }

            OpPayload::RemoveBucket { bucket, forced } => {
                let (directory, storage, me) = inner.blocking_parts();
                let outcome = tokio::task::spawn_blocking(move || {
                    lifecycle::remove_bucket(
                        &directory,
                        storage.as_ref(),
                        me,
                        region,
                        bucket,
                        forced,
                    )
                })
                .await??;
                inner
                    .respond(
                        peer,
                        processor,
                        ReplyResult::Payload(ReplyPayload::Lifecycle(
                            outcome.ack,
                        )),
                    )
                    .await?;
                inner.broadcast_advisories(outcome.advisories).await;
                Ok(())
            }

            OpPayload::BecomePrimary { bucket } => {
                let outcome = lifecycle::become_primary(
                    &inner.directory,
                    inner.me,
                    region,
                    bucket,
                )?;
                inner
                    .respond(
                        peer,
                        processor,
                        ReplyResult::Payload(ReplyPayload::Lifecycle(
                            outcome.ack,
                        )),
                    )
                    .await?;
                inner.broadcast_advisories(outcome.advisories).await;
                Ok(())
            }

            OpPayload::DeposePrimary { bucket } => {
                let outcome = lifecycle::depose_primary(
                    &inner.directory,
                    inner.me,
                    region,
                    bucket,
                )?;
                inner
                    .respond(
                        peer,
                        processor,
                        ReplyResult::Payload(ReplyPayload::Lifecycle(
                            outcome.ack,
                        )),
                    )
                    .await?;
                inner.broadcast_advisories(outcome.advisories).await;
                Ok(())
            }
        }
    }

    fn blocking_parts(
        &self,
    ) -> (Arc<PartitionDirectory>, Arc<dyn BucketStorage>, MemberId) {
        (self.directory.clone(), self.storage.clone(), self.me)
    }

    /// Executes a destroy locally. Only the bucket's primary may execute;
    /// anyone else answers stale-ownership so the dispatcher re-resolves.
    fn do_destroy_key(
        &self,
        region: RegionId,
        bucket: BucketId,
        key: &Bytes,
        expected_old: Option<&Bytes>,
    ) -> Result<ReplyResult, GridError> {
        let snap = self.directory.snapshot(region, bucket)?;
        if snap.primary != Some(self.me)
            || !self.storage.has_bucket(region, bucket)
        {
            return Ok(ReplyResult::Failure(FailureKind::StaleOwnership {
                bucket,
            }));
        }

        if let Some(expected) = expected_old {
            let stored = self.storage.get(region, bucket, key)?;
            if stored.as_ref() != Some(expected) {
                return Ok(ReplyResult::Failure(FailureKind::Application {
                    detail: "stored value does not match expected".into(),
                }));
            }
        }

        match self.storage.destroy(region, bucket, key)? {
            Some(_) => {
                let sequence = {
                    let mut seqs = self.write_seqs.lock().unwrap();
                    let seq = seqs.entry((region, bucket)).or_insert(0);
                    *seq += 1;
                    *seq
                };
                Ok(ReplyResult::Payload(ReplyPayload::Destroyed {
                    tag: VersionTag {
                        member: self.me,
                        sequence,
                    },
                }))
            }
            None => Ok(ReplyResult::Failure(FailureKind::Application {
                detail: "no entry under key".into(),
            })),
        }
    }

    /// Assembles this member's partition statistics for a region.
    fn local_details(
        &self,
        region: RegionId,
    ) -> Result<PartitionMemberInfo, GridError> {
        let hosted = self.directory.hosted_buckets(region, self.me)?;
        let mut primaries = Vec::new();
        let mut low_redundancy = Vec::new();
        let mut bytes_used = 0;
        let mut entry_count = 0;
        for &bucket in &hosted {
            let snap = self.directory.snapshot(region, bucket)?;
            if snap.primary == Some(self.me) {
                primaries.push(bucket);
            }
            if snap.low_redundancy {
                low_redundancy.push(bucket);
            }
            bytes_used += self.storage.local_size(region, bucket);
            entry_count += self.storage.entry_count(region, bucket);
        }
        Ok(PartitionMemberInfo {
            member: self.me,
            offline: false,
            hosted,
            primaries,
            bytes_used,
            entry_count,
            low_redundancy,
        })
    }

    /// Entries for departed members that last hosted buckets of the region,
    /// from the host sets captured at departure. Statistics are gone with
    /// the member.
    fn offline_details(&self, region: RegionId) -> Vec<PartitionMemberInfo> {
        let departed = self.departed_hosts.lock().unwrap();
        let mut infos: Vec<PartitionMemberInfo> = departed
            .iter()
            .filter_map(|(&member, regions)| {
                regions.get(&region).map(|hosted| PartitionMemberInfo {
                    member,
                    offline: true,
                    hosted: hosted.clone(),
                    primaries: Vec::new(),
                    bytes_used: 0,
                    entry_count: 0,
                    low_redundancy: Vec::new(),
                })
            })
            .collect();
        infos.sort_unstable_by_key(|info| info.member);
        infos
    }

    /// Evaluates the compiled operation against each listed bucket and
    /// streams results back in chunks, closing with the last-chunk marker.
    /// An object never spans chunks. A bucket found missing after the
    /// stream started is reported as moved, so the caller's HA policy can
    /// re-execute.
    async fn stream_evaluate(
        &self,
        peer: MemberId,
        processor: ProcessorId,
        region: RegionId,
        buckets: Vec<BucketId>,
        compiled: Bytes,
    ) -> Result<(), GridError> {
        let mut chunks = ChunkedSender::new(self.config.chunk_capacity)?;
        let mut started = false;
        for bucket in buckets {
            let snap = self.directory.snapshot(region, bucket)?;
            if !snap.hosts_member(self.me)
                || !self.storage.has_bucket(region, bucket)
            {
                let kind = if started {
                    FailureKind::BucketMoved { bucket }
                } else {
                    FailureKind::StaleOwnership { bucket }
                };
                return self
                    .respond(peer, processor, ReplyResult::Failure(kind))
                    .await;
            }

            let seq = match self.evaluator.evaluate(
                region,
                bucket,
                &compiled,
                self.storage.as_ref(),
            ) {
                Ok(seq) => seq,
                Err(kind) => {
                    return self
                        .respond(peer, processor, ReplyResult::Failure(kind))
                        .await;
                }
            };

            for item in seq {
                match item {
                    Ok(object) => {
                        if let Some(env) = chunks.push(object) {
                            self.respond(
                                peer,
                                processor,
                                ReplyResult::Chunk(env),
                            )
                            .await?;
                        }
                    }
                    Err(kind) => {
                        return self
                            .respond(
                                peer,
                                processor,
                                ReplyResult::Failure(kind),
                            )
                            .await;
                    }
                }
            }
            started = true;
        }

        self.respond(peer, processor, ReplyResult::Chunk(chunks.finish()))
            .await
    }

    /// Gossips the authoritative records of a lifecycle mutation to every
    /// other alive member. Fire-and-forget; a member that misses one learns
    /// from stale-ownership replies later.
    async fn broadcast_advisories(
        &self,
        advisories: Vec<(RegionId, BucketId, BucketSnapshot)>,
    ) {
        let mut others = self.view.alive_map();
        if others.set(self.me, false).is_err() {
            return;
        }
        for (region, bucket, snapshot) in advisories {
            let msg = GridMsg::Request(Request {
                region,
                processor: 0,
                payload: OpPayload::Advisory { bucket, snapshot },
            });
            if let Err(e) = self.sender.send_msg(&msg, &others).await {
                pf_warn!(
                    "advisory broadcast for region {} bucket {} failed: {}",
                    region,
                    bucket,
                    e
                );
            }
        }
    }
}

#[cfg(test)]
mod node_tests {
    use super::*;
    use crate::evaluate::{ResultSeq, ScanEvaluator};
    use crate::membership::build_fabric;
    use crate::storage::MemStorage;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use tokio::time::{sleep, Instant};

    /// A small in-process cluster sharing one channel fabric.
    struct TestCluster {
        view: Arc<MembershipView>,
        nodes: HashMap<MemberId, GridNode>,
        storages: HashMap<MemberId, Arc<MemStorage>>,
    }

    impl TestCluster {
        fn launch(
            population: u8,
            specs: Vec<RegionSpec>,
            config_str: Option<&str>,
        ) -> Result<TestCluster, GridError> {
            Self::launch_with(population, specs, config_str, |_| {
                Arc::new(ScanEvaluator)
            })
        }

        fn launch_with(
            population: u8,
            specs: Vec<RegionSpec>,
            config_str: Option<&str>,
            mut evaluator_of: impl FnMut(MemberId) -> Arc<dyn Evaluator>,
        ) -> Result<TestCluster, GridError> {
            let members =
                (0..population).map(|id| Member::new(id, 1)).collect();
            let view = MembershipView::new(members);
            let mut hubs = build_fabric::<GridMsg>(&view);

            let mut nodes = HashMap::new();
            let mut storages = HashMap::new();
            for id in 0..population {
                let storage = Arc::new(MemStorage::new());
                let node = GridNode::new(
                    Member::new(id, 1),
                    view.clone(),
                    hubs.remove(&id).unwrap(),
                    specs.clone(),
                    storage.clone(),
                    evaluator_of(id),
                    config_str,
                )?;
                nodes.insert(id, node);
                storages.insert(id, storage);
            }
            Ok(TestCluster {
                view,
                nodes,
                storages,
            })
        }

        fn node(&self, id: MemberId) -> &GridNode {
            &self.nodes[&id]
        }

        /// Creates a bucket on one member plus a redundant copy on another,
        /// then waits for advisories to settle everywhere.
        async fn host_bucket(
            &self,
            region: RegionId,
            bucket: BucketId,
            primary: MemberId,
            replica: MemberId,
        ) -> Result<(), OpError> {
            let initiator = self.node(primary);
            assert_eq!(
                initiator.create_bucket(region, bucket, primary).await?,
                LifecycleAck::Created
            );
            assert_eq!(
                initiator
                    .create_redundant_bucket(region, bucket, replica)
                    .await?,
                LifecycleAck::Created
            );
            sleep(Duration::from_millis(30)).await;
            Ok(())
        }
    }

    fn one_region() -> Vec<RegionSpec> {
        vec![RegionSpec::new(1, 4, 1)]
    }

    /// Polls until the condition holds, failing past a deadline. Advisory
    /// propagation is asynchronous, so observers converge rather than jump.
    async fn settle(mut cond: impl FnMut() -> bool, what: &str) {
        let deadline = Instant::now() + Duration::from_secs(3);
        while !cond() {
            assert!(
                Instant::now() < deadline,
                "timed out waiting for {}",
                what
            );
            sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 3)]
    async fn destroy_follows_primary_across_failure(
    ) -> Result<(), OpError> {
        let cluster = TestCluster::launch(3, one_region(), None)?;
        let caller = cluster.node(2);

        let key_a = Bytes::from_static(b"alpha");
        let key_b = Bytes::from_static(b"beta");
        let bucket_a = caller.directory().key_to_bucket(1, &key_a)?;
        let bucket_b = caller.directory().key_to_bucket(1, &key_b)?;
        for bucket in [bucket_a, bucket_b] {
            if !caller.directory().snapshot(1, bucket)?.hosts_member(0) {
                cluster.host_bucket(1, bucket, 0, 1).await?;
            }
        }

        // seed the entries at both copies
        for id in [0, 1] {
            let storage = &cluster.storages[&id];
            storage
                .put(1, bucket_a, key_a.clone(), Bytes::from_static(b"1"))?;
            storage
                .put(1, bucket_b, key_b.clone(), Bytes::from_static(b"2"))?;
        }

        let tag = caller.destroy(1, key_a.clone(), None).await?;
        assert_eq!(tag.member, 0);
        // destroying again finds nothing
        assert!(caller.destroy(1, key_a, None).await.is_err());

        // primary crashes; re-election promotes the replica and the next
        // destroy transparently resolves to it
        cluster.view.announce_departure(0, true)?;
        sleep(Duration::from_millis(30)).await;
        let tag = caller.destroy(1, key_b, None).await?;
        assert_eq!(tag.member, 1);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 3)]
    async fn conditional_destroy_checks_value() -> Result<(), OpError> {
        let cluster = TestCluster::launch(2, one_region(), None)?;
        let caller = cluster.node(1);
        let key = Bytes::from_static(b"gamma");
        let bucket = caller.directory().key_to_bucket(1, &key)?;
        cluster.host_bucket(1, bucket, 0, 1).await?;
        cluster.storages[&0]
            .put(1, bucket, key.clone(), Bytes::from_static(b"v"))?;

        let miss = caller
            .destroy(1, key.clone(), Some(Bytes::from_static(b"other")))
            .await;
        match miss {
            Err(OpError::Failure(f)) => assert!(matches!(
                f.kind,
                FailureKind::Application { .. }
            )),
            other => panic!("unexpected outcome {:?}", other.map(|_| ())),
        }
        // the entry survived the failed conditional destroy
        caller
            .destroy(1, key, Some(Bytes::from_static(b"v")))
            .await?;
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 3)]
    async fn create_is_idempotent_across_members() -> Result<(), OpError> {
        let cluster = TestCluster::launch(2, one_region(), None)?;
        let caller = cluster.node(0);

        assert_eq!(
            caller.create_bucket(1, 2, 1).await?,
            LifecycleAck::Created
        );
        let snap_first = cluster.node(1).directory().snapshot(1, 2)?;
        assert_eq!(
            caller.create_bucket(1, 2, 1).await?,
            LifecycleAck::AlreadyExists
        );
        assert_eq!(cluster.node(1).directory().snapshot(1, 2)?, snap_first);

        // caller learned the advisory
        sleep(Duration::from_millis(30)).await;
        assert!(caller.directory().snapshot(1, 2)?.hosts_member(1));
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 3)]
    async fn move_keeps_a_copy_and_rolls_back() -> Result<(), OpError> {
        // fail point armed: the move dies after the target copy exists
        let cluster = TestCluster::launch(
            2,
            one_region(),
            Some("move_fail_after_create = true"),
        )?;
        let caller = cluster.node(0);
        caller.create_bucket(1, 0, 0).await?;

        assert!(caller.move_bucket(1, 0, 0, 1).await.is_err());
        // lifecycle acks were awaited, so the target's own record is
        // authoritative already: the fresh copy was rolled back
        let snap = cluster.node(1).directory().snapshot(1, 0)?;
        assert!(snap.hosts_member(0));
        assert!(!snap.hosts_member(1));
        settle(
            || {
                caller
                    .directory()
                    .snapshot(1, 0)
                    .map(|s| s.hosts_member(0) && !s.hosts_member(1))
                    .unwrap_or(false)
            },
            "rollback advisory at the caller",
        )
        .await;

        // unarmed move relocates the only copy without ever dropping to zero
        let cluster = TestCluster::launch(2, one_region(), None)?;
        let caller = cluster.node(0);
        caller.create_bucket(1, 0, 0).await?;
        cluster.storages[&0].put(
            1,
            0,
            Bytes::from_static(b"k"),
            Bytes::from_static(b"v"),
        )?;
        caller.move_bucket(1, 0, 0, 1).await?;
        settle(
            || {
                caller
                    .directory()
                    .snapshot(1, 0)
                    .map(|s| {
                        !s.hosts_member(0)
                            && s.hosts_member(1)
                            && s.primary == Some(1)
                    })
                    .unwrap_or(false)
            },
            "relocation advisory at the caller",
        )
        .await;
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 3)]
    async fn query_streams_all_entries() -> Result<(), OpError> {
        let cluster = TestCluster::launch(2, one_region(), None)?;
        let caller = cluster.node(0);
        cluster.host_bucket(1, 0, 0, 1).await?;
        cluster.host_bucket(1, 1, 1, 0).await?;

        for i in 0..20u8 {
            let bucket = (i % 2) as BucketId;
            let primary = bucket as MemberId;
            cluster.storages[&primary].put(
                1,
                bucket,
                Bytes::from(vec![i]),
                Bytes::from(vec![i, i]),
            )?;
        }

        let results = caller
            .run_query(1, Bytes::new(), Some(vec![0, 1]))
            .await?;
        assert_eq!(results.len(), 20);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 3)]
    async fn details_cover_all_members() -> Result<(), OpError> {
        let cluster = TestCluster::launch(3, one_region(), None)?;
        let caller = cluster.node(2);
        cluster.host_bucket(1, 0, 0, 1).await?;
        cluster.storages[&0].put(
            1,
            0,
            Bytes::from_static(b"k"),
            Bytes::from_static(b"vvvv"),
        )?;

        let infos = caller.fetch_partition_details(1, false).await?;
        assert_eq!(infos.len(), 3);
        assert_eq!(infos[0].member, 0);
        assert_eq!(infos[0].hosted, vec![0]);
        assert_eq!(infos[0].primaries, vec![0]);
        assert_eq!(infos[0].entry_count, 1);
        assert!(infos[0].bytes_used >= 5);
        assert_eq!(infos[1].hosted, vec![0]);
        assert!(infos[1].primaries.is_empty());
        assert!(infos[2].hosted.is_empty());
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 3)]
    async fn details_report_offline_members_on_request(
    ) -> Result<(), OpError> {
        let cluster = TestCluster::launch(3, one_region(), None)?;
        let caller = cluster.node(2);
        cluster.host_bucket(1, 0, 0, 1).await?;

        cluster.view.announce_departure(0, true)?;
        settle(
            || {
                caller
                    .directory()
                    .snapshot(1, 0)
                    .map(|s| !s.hosts_member(0))
                    .unwrap_or(false)
            },
            "departure purge at the caller",
        )
        .await;

        // without the flag the departed member is simply absent
        let live_only = caller.fetch_partition_details(1, false).await?;
        assert_eq!(live_only.len(), 2);
        assert!(live_only.iter().all(|info| info.member != 0));

        // with the flag it trails the live entries, from last-known records
        let with_offline = caller.fetch_partition_details(1, true).await?;
        assert_eq!(with_offline.len(), 3);
        let gone = &with_offline[2];
        assert!(gone.offline);
        assert_eq!(gone.member, 0);
        assert_eq!(gone.hosted, vec![0]);
        assert_eq!(gone.entry_count, 0);
        Ok(())
    }

    /// Evaluator failing one bucket's first scan mid-stream, after having
    /// produced some objects, to exercise partial-result discarding.
    struct FlakyEvaluator {
        fail_bucket: BucketId,
        tripped: AtomicBool,
    }

    impl Evaluator for FlakyEvaluator {
        fn evaluate(
            &self,
            region: RegionId,
            bucket: BucketId,
            compiled: &Bytes,
            storage: &dyn BucketStorage,
        ) -> Result<ResultSeq, FailureKind> {
            let seq =
                ScanEvaluator.evaluate(region, bucket, compiled, storage)?;
            if bucket == self.fail_bucket
                && !self.tripped.swap(true, Ordering::SeqCst)
            {
                let mut items: Vec<Result<Bytes, FailureKind>> =
                    seq.take(1).collect();
                items.push(Err(FailureKind::BucketMoved { bucket }));
                return Ok(Box::new(items.into_iter()));
            }
            Ok(seq)
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 3)]
    async fn ha_reexecution_discards_partials() -> Result<(), OpError> {
        let specs = vec![RegionSpec::new(1, 2, 1)];
        let cluster =
            TestCluster::launch_with(2, specs, None, |id| {
                if id == 1 {
                    Arc::new(FlakyEvaluator {
                        fail_bucket: 1,
                        tripped: AtomicBool::new(false),
                    })
                } else {
                    Arc::new(ScanEvaluator)
                }
            })?;
        let caller = cluster.node(0);
        cluster.host_bucket(1, 0, 0, 1).await?;
        cluster.host_bucket(1, 1, 1, 0).await?;

        for i in 0..10u8 {
            let bucket = (i % 2) as BucketId;
            for id in [0, 1] {
                cluster.storages[&id].put(
                    1,
                    bucket,
                    Bytes::from(vec![i]),
                    Bytes::from(vec![i]),
                )?;
            }
        }

        // first round fails on member 1 after partial results; the whole
        // operation re-executes and the merged result has no duplicates
        let results = caller
            .run_function(1, Bytes::new(), None, true)
            .await?;
        assert_eq!(results.len(), 10);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 3)]
    async fn non_ha_surfaces_discarded_partials() -> Result<(), OpError> {
        let specs = vec![RegionSpec::new(1, 2, 1)];
        let cluster =
            TestCluster::launch_with(2, specs, None, |id| {
                if id == 1 {
                    Arc::new(FlakyEvaluator {
                        fail_bucket: 1,
                        tripped: AtomicBool::new(false),
                    })
                } else {
                    Arc::new(ScanEvaluator)
                }
            })?;
        let caller = cluster.node(0);
        cluster.host_bucket(1, 0, 0, 1).await?;
        cluster.host_bucket(1, 1, 1, 0).await?;
        cluster.storages[&1].put(
            1,
            1,
            Bytes::from_static(b"k"),
            Bytes::from_static(b"v"),
        )?;

        match caller.run_function(1, Bytes::new(), None, false).await {
            Err(OpError::Failure(failure)) => {
                assert!(matches!(
                    failure.kind,
                    FailureKind::BucketMoved { .. }
                ));
                assert!(failure.partial_discarded);
                assert_eq!(failure.members, vec![1]);
            }
            other => panic!("unexpected outcome {:?}", other.map(|_| ())),
        }
        Ok(())
    }

    /// Evaluator whose every scan trips the low-memory guard after one
    /// object, counting how often it was asked.
    struct LowMemoryEvaluator {
        calls: AtomicUsize,
    }

    impl Evaluator for LowMemoryEvaluator {
        fn evaluate(
            &self,
            region: RegionId,
            bucket: BucketId,
            compiled: &Bytes,
            storage: &dyn BucketStorage,
        ) -> Result<ResultSeq, FailureKind> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let seq =
                ScanEvaluator.evaluate(region, bucket, compiled, storage)?;
            let mut items: Vec<Result<Bytes, FailureKind>> =
                seq.take(1).collect();
            items.push(Err(FailureKind::LowMemoryAbort));
            Ok(Box::new(items.into_iter()))
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 3)]
    async fn low_memory_abort_is_fatal_without_retry() -> Result<(), OpError> {
        let specs = vec![RegionSpec::new(1, 2, 1)];
        let low_memory = Arc::new(LowMemoryEvaluator {
            calls: AtomicUsize::new(0),
        });
        let tripping = low_memory.clone();
        let cluster = TestCluster::launch_with(2, specs, None, move |id| {
            if id == 1 {
                tripping.clone() as Arc<dyn Evaluator>
            } else {
                Arc::new(ScanEvaluator)
            }
        })?;
        let caller = cluster.node(0);
        cluster.host_bucket(1, 0, 0, 1).await?;
        cluster.host_bucket(1, 1, 1, 0).await?;

        // both members hold all the data, so a re-execution excluding the
        // aborting member would have succeeded
        for i in 0..10u8 {
            let bucket = (i % 2) as BucketId;
            for id in [0, 1] {
                cluster.storages[&id].put(
                    1,
                    bucket,
                    Bytes::from(vec![i]),
                    Bytes::from(vec![i]),
                )?;
            }
        }

        match caller.run_function(1, Bytes::new(), None, true).await {
            Err(OpError::Failure(failure)) => {
                assert_eq!(failure.kind, FailureKind::LowMemoryAbort);
                assert_eq!(failure.members, vec![1]);
                assert!(failure.partial_discarded);
            }
            other => panic!("unexpected outcome {:?}", other.map(|_| ())),
        }
        // surfaced in the first round even under HA
        assert_eq!(low_memory.calls.load(Ordering::SeqCst), 1);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 3)]
    async fn primary_handoff_via_messages() -> Result<(), OpError> {
        let cluster = TestCluster::launch(2, one_region(), None)?;
        let caller = cluster.node(0);
        cluster.host_bucket(1, 3, 0, 1).await?;
        assert_eq!(caller.directory().snapshot(1, 3)?.primary, Some(0));

        assert_eq!(
            caller.become_primary(1, 3, 1).await?,
            LifecycleAck::PrimaryAssumed
        );
        sleep(Duration::from_millis(30)).await;
        assert_eq!(caller.directory().snapshot(1, 3)?.primary, Some(1));

        assert_eq!(
            caller.depose_primary(1, 3, 1).await?,
            LifecycleAck::Deposed
        );
        sleep(Duration::from_millis(30)).await;
        assert_eq!(caller.directory().snapshot(1, 3)?.primary, Some(0));
        Ok(())
    }
}
