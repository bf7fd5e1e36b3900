//! The range replica.
//!
//! A `Range` owns one range's admission pipeline (bounds and consistency
//! checks, lease acquisition/redirect, command queue, response cache lookup,
//! timestamp-cache forwarding, proposal) and its apply path (lease guard,
//! replay detection, atomic engine batch with response cache, applied index
//! and stats, in-memory cache updates, pending-handle fanout).
//!
//! Client-facing methods run on arbitrary caller tasks and may suspend;
//! apply runs only on the consensus driver task. Dropping a `send` future is
//! the cancellation path: its queue entry is removed by a drop guard and the
//! pending apply handle is abandoned.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use tokio::sync::oneshot;
use tracing::{debug, error, warn};

use stratum_raft::raft::{ConfChange, ConfChangeKind, MemStorage, MultiRaft, RaftError};

use crate::api::{
    CommandId, Lease, RaftCommand, RangeDescriptor, ReadConsistency, ReplicaDesc, Request,
    RequestBody, Response, ResponseBody,
};
use crate::clock::{Clock, Timestamp};
use crate::command_queue::CommandQueue;
use crate::commands;
use crate::engine::{EngineState, MemEngine, MvccStats};
use crate::error::RangeError;
use crate::gossip::Gossip;
use crate::keys;
use crate::response_cache::ResponseCache;
use crate::ts_cache::TsCache;

/// Default authorization window for a leader lease.
pub const DEFAULT_LEADER_LEASE_DURATION_NS: i64 = 1_000_000_000;

/// Test hook consulted before a command executes; returning an error makes it
/// the command's result. Injected per store, never process-wide.
pub type CommandFilter = Arc<dyn Fn(&Request) -> Option<RangeError> + Send + Sync>;

/// Shared store services handed to every replica.
pub struct StoreContext {
    pub node_id: u64,
    pub store_id: u64,
    pub clock: Clock,
    pub engine: Arc<MemEngine>,
    pub raft: MultiRaft,
    pub raft_storage: Arc<MemStorage>,
    pub gossip: Arc<dyn Gossip>,
    pub lease_duration_ns: i64,
    pub max_clock_offset_ns: i64,
    pub command_filter: Option<CommandFilter>,
}

impl StoreContext {
    pub fn replica(&self) -> ReplicaDesc {
        ReplicaDesc::new(self.node_id, self.store_id)
    }

    pub fn raft_node_id(&self) -> u64 {
        self.replica().raft_node_id()
    }
}

/// Follow-up work a committed command leaves for the store, which owns
/// replica and consensus-group lifecycles.
#[derive(Debug)]
pub enum ApplyAction {
    SplitApplied { new_desc: RangeDescriptor },
    MergeApplied { subsumed_range_id: u64 },
    TruncateLog { first_kept: u64 },
}

pub struct Range {
    ctx: Arc<StoreContext>,
    range_id: u64,
    desc: RwLock<RangeDescriptor>,
    lease: Mutex<Lease>,
    applied_index: AtomicU64,
    ts_cache: Mutex<TsCache>,
    cmd_queue: Mutex<CommandQueue>,
    pending: Mutex<HashMap<String, oneshot::Sender<Result<Response, RangeError>>>>,
    response_cache: ResponseCache,
    corrupt: Mutex<Option<String>>,
}

/// Removes the command-queue entry when the command finishes or its caller
/// gives up.
struct CmdGuard<'a> {
    range: &'a Range,
    id: u64,
}

impl Drop for CmdGuard<'_> {
    fn drop(&mut self) {
        self.range.cmd_queue.lock().unwrap().remove(self.id);
    }
}

impl Range {
    /// Build the replica, recovering applied index and lease from the engine
    /// if present.
    pub fn new(ctx: Arc<StoreContext>, desc: RangeDescriptor) -> Arc<Range> {
        let range_id = desc.range_id;
        let (applied, lease) = {
            let view = ctx.engine.read_view();
            let applied = view
                .sys_get(&keys::applied_index_key(range_id))
                .and_then(|b| b.as_slice().try_into().ok().map(u64::from_le_bytes))
                .unwrap_or(0);
            let lease = view
                .sys_get(&keys::range_lease_key(range_id))
                .and_then(|b| serde_json::from_slice(b).ok())
                .unwrap_or_default();
            (applied, lease)
        };
        let low_water = ctx.clock.now();
        Arc::new(Range {
            range_id,
            desc: RwLock::new(desc),
            lease: Mutex::new(lease),
            applied_index: AtomicU64::new(applied),
            ts_cache: Mutex::new(TsCache::new(low_water)),
            cmd_queue: Mutex::new(CommandQueue::new()),
            pending: Mutex::new(HashMap::new()),
            response_cache: ResponseCache::new(range_id),
            corrupt: Mutex::new(None),
            ctx,
        })
    }

    pub fn range_id(&self) -> u64 {
        self.range_id
    }

    pub fn descriptor(&self) -> RangeDescriptor {
        self.desc.read().unwrap().clone()
    }

    pub fn lease(&self) -> Lease {
        *self.lease.lock().unwrap()
    }

    pub fn applied_index(&self) -> u64 {
        self.applied_index.load(Ordering::SeqCst)
    }

    /// Low-level timestamp cache access for tests and stats.
    pub fn ts_cache_max(
        &self,
        start: &[u8],
        end: &[u8],
        txn_id: Option<uuid::Uuid>,
    ) -> (Timestamp, Timestamp) {
        let end = if end.is_empty() {
            keys::next_key(start)
        } else {
            end.to_vec()
        };
        self.ts_cache.lock().unwrap().get_max(start, &end, txn_id)
    }

    fn check_not_corrupt(&self) -> Result<(), RangeError> {
        match &*self.corrupt.lock().unwrap() {
            Some(msg) => Err(RangeError::ReplicaCorruption {
                processed: true,
                msg: msg.clone(),
            }),
            None => Ok(()),
        }
    }

    pub(crate) fn mark_corrupt(&self, msg: String, processed: bool) -> RangeError {
        error!(range_id = self.range_id, msg = %msg, "marking replica corrupt");
        *self.corrupt.lock().unwrap() = Some(msg.clone());
        RangeError::ReplicaCorruption { processed, msg }
    }

    // ------------------------------------------------------------------
    // Admission
    // ------------------------------------------------------------------

    /// Admit and execute one command, waiting for its apply when it mutates.
    pub async fn send(&self, mut req: Request) -> Result<Response, RangeError> {
        self.check_not_corrupt()?;
        if req.header.timestamp.is_zero() {
            req.header.timestamp = self.ctx.clock.now();
        }
        {
            let desc = self.desc.read().unwrap();
            if !desc.contains_key_range(&req.header.key, &req.header.end_key) {
                return Err(RangeError::RangeKeyMismatch {
                    range_id: self.range_id,
                });
            }
        }
        match req.header.read_consistency {
            ReadConsistency::Consensus => {
                // Undefined by contract; rejected until one exists.
                return Err(RangeError::invalid(
                    "CONSENSUS reads are not implemented",
                ));
            }
            ReadConsistency::Inconsistent => {
                if req.header.txn.is_some() {
                    return Err(RangeError::invalid(
                        "cannot allow inconsistent reads within a transaction",
                    ));
                }
                if !req.is_read_only() {
                    return Err(RangeError::invalid(
                        "inconsistent mode only applies to read commands",
                    ));
                }
                // Bypasses lease, queue, caches: straight to the engine.
                return self.execute_read_local(&req);
            }
            ReadConsistency::Consistent => {}
        }
        if req.is_read_only() {
            self.add_read_only_cmd(req).await
        } else {
            self.add_read_write_cmd(req).await
        }
    }

    async fn add_read_only_cmd(&self, req: Request) -> Result<Response, RangeError> {
        self.redirect_on_or_acquire_lease(req.header.timestamp)
            .await?;
        let guard = self.begin_cmd(&req, true).await;
        let result = self.execute_read_local(&req);
        if result.is_ok() {
            let (start, end) = req.span();
            self.ts_cache.lock().unwrap().add(
                &start,
                &end,
                req.header.timestamp,
                req.txn_id(),
                true,
            );
        }
        drop(guard);
        result
    }

    async fn add_read_write_cmd(&self, mut req: Request) -> Result<Response, RangeError> {
        // Replica changes are validated before proposing: the consensus-level
        // membership change commits with the command, so a doomed request
        // must never reach the log.
        if let RequestBody::ChangeReplicas {
            change_type,
            replica,
        } = &req.body
        {
            self.validate_change_replicas(*change_type, replica)?;
        }
        if !matches!(req.body, RequestBody::LeaderLease { .. }) {
            self.redirect_on_or_acquire_lease(req.header.timestamp)
                .await?;
        }
        let guard = self.begin_cmd(&req, false).await;

        // A replayed command id returns its original outcome without
        // proposing again.
        if let Some(cached) = self
            .response_cache
            .get(&self.ctx.engine.read_view(), req.header.command_id)
        {
            return cached;
        }

        // Forward the write past every recent read or write of the span,
        // except entries belonging to this command's own transaction.
        let (start, end) = req.span();
        {
            let cache = self.ts_cache.lock().unwrap();
            let (max_read, max_write) = cache.get_max(&start, &end, req.txn_id());
            let floor = max_read.max(max_write);
            if req.header.timestamp <= floor {
                req.header.timestamp = floor.next();
            }
        }

        let result = self.propose_and_wait(req.clone()).await;
        if let Ok(response) = &result {
            self.ts_cache.lock().unwrap().add(
                &start,
                &end,
                response.timestamp,
                req.txn_id(),
                false,
            );
        }
        drop(guard);
        result
    }

    /// Enter the command queue and wait out conflicting predecessors.
    async fn begin_cmd(&self, req: &Request, read_only: bool) -> CmdGuard<'_> {
        let (start, end) = req.span();
        let (id, wait) = self
            .cmd_queue
            .lock()
            .unwrap()
            .add(&start, &end, read_only);
        let guard = CmdGuard { range: self, id };
        wait.wait().await;
        guard
    }

    fn execute_read_local(&self, req: &Request) -> Result<Response, RangeError> {
        if let Some(filter) = &self.ctx.command_filter {
            if let Some(err) = filter(req) {
                return Err(err);
            }
        }
        let view = self.ctx.engine.read_view();
        let body = commands::execute_read(&view, req)?;
        Ok(Response {
            timestamp: req.header.timestamp,
            body,
        })
    }

    // ------------------------------------------------------------------
    // Leases
    // ------------------------------------------------------------------

    /// Serve under a covering lease held by this replica, acquire one if the
    /// range has none, or redirect to the holder.
    pub async fn redirect_on_or_acquire_lease(
        &self,
        timestamp: Timestamp,
    ) -> Result<(), RangeError> {
        for _ in 0..3 {
            let lease = self.lease();
            if lease.covers(timestamp) {
                if lease.holder == self.ctx.raft_node_id() {
                    return Ok(());
                }
                let desc = self.desc.read().unwrap();
                return Err(RangeError::NotLeader {
                    leader: desc.replica_by_raft_id(lease.holder).cloned(),
                });
            }
            match self.request_leader_lease(timestamp).await {
                Ok(()) => continue,
                // Lost the race; re-check who holds the lease now.
                Err(RangeError::LeaseRejected { .. }) => continue,
                Err(err) => return Err(err),
            }
        }
        Err(RangeError::internal("leader lease acquisition stalled"))
    }

    /// Propose a lease naming this replica the holder. The start is pushed
    /// back as far as possible (just past the previous lease) so the lease
    /// covers the waiting command's timestamp; the expiration is measured
    /// from now.
    async fn request_leader_lease(&self, timestamp: Timestamp) -> Result<(), RangeError> {
        let now = self.ctx.clock.now();
        let prev = self.lease();
        let lease = Lease {
            start: prev.expiration.next(),
            expiration: now.max(timestamp).add(self.ctx.lease_duration_ns, 0),
            holder: self.ctx.raft_node_id(),
        };
        debug!(range_id = self.range_id, ?lease, "requesting leader lease");
        let req = Request {
            header: crate::api::RequestHeader {
                range_id: self.range_id,
                replica: self.ctx.replica(),
                key: self.desc.read().unwrap().start_key.clone(),
                end_key: Vec::new(),
                timestamp: now,
                txn: None,
                command_id: CommandId::default(),
                read_consistency: ReadConsistency::Consistent,
                user_priority: 0,
            },
            body: RequestBody::LeaderLease { lease },
        };
        self.propose_and_wait(req).await.map(|_| ())
    }

    // ------------------------------------------------------------------
    // Proposal
    // ------------------------------------------------------------------

    /// Serialize the command, hand it to the consensus driver, and wait
    /// first for admission (commit or routing error), then for the apply
    /// result delivered by this replica's apply path.
    async fn propose_and_wait(&self, req: Request) -> Result<Response, RangeError> {
        let raft_id = if req.header.command_id.is_empty() {
            // Internal commands still need a consensus-level identity.
            format!("internal.{:x}", rand::random::<u64>())
        } else {
            req.header.command_id.key()
        };
        let body = req.body.clone();
        let command = RaftCommand {
            origin: self.ctx.replica(),
            request: req,
        };
        let payload = serde_json::to_vec(&command)
            .map_err(|err| RangeError::internal(format!("command encode failed: {err}")))?;

        let (tx, rx) = oneshot::channel();
        self.pending.lock().unwrap().insert(raft_id.clone(), tx);

        let admission = match &body {
            RequestBody::ChangeReplicas {
                change_type,
                replica,
            } => {
                let kind = match change_type {
                    crate::api::ReplicaChangeType::Add => ConfChangeKind::AddNode,
                    crate::api::ReplicaChangeType::Remove => ConfChangeKind::RemoveNode,
                };
                self.ctx.raft.change_membership(
                    self.range_id,
                    raft_id.clone(),
                    ConfChange {
                        kind,
                        node_id: replica.raft_node_id(),
                    },
                    payload,
                )
            }
            _ => self
                .ctx
                .raft
                .submit_command(self.range_id, raft_id.clone(), payload),
        };

        match admission.await {
            Ok(Ok(())) => {}
            Ok(Err(RaftError::GroupDeleted)) => {
                self.pending.lock().unwrap().remove(&raft_id);
                return Err(RangeError::RangeNotFound {
                    range_id: self.range_id,
                });
            }
            Ok(Err(RaftError::Stopped)) | Err(_) => {
                self.pending.lock().unwrap().remove(&raft_id);
                return Err(RangeError::internal("consensus driver stopped"));
            }
        }
        rx.await
            .map_err(|_| RangeError::internal("apply handle dropped"))?
    }

    /// Fail every pending apply handle; used on range removal.
    pub fn fail_pending(&self, err: RangeError) {
        let mut pending = self.pending.lock().unwrap();
        for (_, tx) in pending.drain() {
            let _ = tx.send(Err(err.clone()));
        }
    }

    // ------------------------------------------------------------------
    // Apply
    // ------------------------------------------------------------------

    /// Apply one committed command, in log order, on the driver task.
    /// Returns follow-up work for the store.
    pub fn apply_committed(
        &self,
        index: u64,
        raft_id: &str,
        command: RaftCommand,
    ) -> Option<ApplyAction> {
        let mut action = None;
        let result = if let Err(err) = self.check_not_corrupt() {
            Err(err)
        } else {
            self.apply_raft_command(index, &command, &mut action)
        };
        if let Err(err) = &result {
            debug!(range_id = self.range_id, error = %err, "command apply failed");
        }
        // Only the proposer holds a handle; everyone else drops the result.
        if let Some(tx) = self.pending.lock().unwrap().remove(raft_id) {
            let _ = tx.send(result);
        }
        action
    }

    fn apply_raft_command(
        &self,
        index: u64,
        command: &RaftCommand,
        action: &mut Option<ApplyAction>,
    ) -> Result<Response, RangeError> {
        let applied = self.applied_index();
        if applied >= index {
            return Err(self.mark_corrupt(
                format!("applied index moved backwards: {applied} >= {index}"),
                true,
            ));
        }
        let req = &command.request;
        let header = &req.header;

        // The proposer must still hold the lease this command was proposed
        // under; a command that lost the lease before apply must not mutate
        // state.
        if !matches!(req.body, RequestBody::LeaderLease { .. }) {
            let lease = self.lease();
            if !lease.covers(header.timestamp)
                || lease.holder != command.origin.raft_node_id()
            {
                let desc = self.desc.read().unwrap();
                return Err(RangeError::NotLeader {
                    leader: desc.replica_by_raft_id(lease.holder).cloned(),
                });
            }
        }

        let mut batch = self.ctx.engine.write_batch();

        // Replay across restarts: an already-recorded command id is not
        // re-executed, but the entry still advances the applied index.
        if let Some(prior) = self.response_cache.get(&batch, header.command_id) {
            self.advance_applied_index(&mut batch, index, None);
            return prior;
        }

        let mut stats = read_stats(&batch, self.range_id);
        let filtered = self
            .ctx
            .command_filter
            .as_ref()
            .and_then(|filter| filter(req));
        let result = match filtered {
            Some(err) => Err(err),
            None => self
                .execute_write_command(&mut batch, &mut stats, req, action)
                .map(|resp_body| Response {
                    timestamp: header.timestamp,
                    body: resp_body,
                }),
        };

        self.response_cache.put(&mut batch, header.command_id, &result);
        self.advance_applied_index(&mut batch, index, Some(stats));
        drop(batch);

        if result.is_ok() && self.holds_lease() && header.key.starts_with(keys::CONFIG_PREFIX) {
            self.maybe_gossip_configs();
        }
        result
    }

    fn execute_write_command(
        &self,
        batch: &mut EngineState,
        stats: &mut MvccStats,
        req: &Request,
        action: &mut Option<ApplyAction>,
    ) -> Result<ResponseBody, RangeError> {
        match &req.body {
            RequestBody::LeaderLease { lease } => self.apply_leader_lease(batch, lease),
            RequestBody::TruncateLog { index } => {
                *action = Some(ApplyAction::TruncateLog { first_kept: *index });
                Ok(ResponseBody::TruncateLog)
            }
            RequestBody::AdminSplit { split_key } => {
                self.apply_admin_split(batch, stats, req, split_key, action)
            }
            RequestBody::AdminMerge => self.apply_admin_merge(batch, stats, req, action),
            RequestBody::ChangeReplicas {
                change_type,
                replica,
            } => self.apply_change_replicas(batch, stats, req, *change_type, *replica),
            _ => commands::execute_write(batch, stats, req),
        }
    }

    fn advance_applied_index(
        &self,
        batch: &mut EngineState,
        index: u64,
        stats: Option<MvccStats>,
    ) {
        batch.sys_put(
            keys::applied_index_key(self.range_id),
            index.to_le_bytes().to_vec(),
        );
        if let Some(stats) = stats {
            write_stats(batch, self.range_id, &stats);
        }
        self.applied_index.store(index, Ordering::SeqCst);
    }

    /// Install a new lease. A lease whose start does not clear the previous
    /// holder's expiration is rejected, except when the same holder extends
    /// its own lease. On a holder change the timestamp-cache low water rises
    /// past the old lease plus the maximum clock offset, and a replica newly
    /// holding the lease re-gossips config records.
    fn apply_leader_lease(
        &self,
        batch: &mut EngineState,
        new_lease: &Lease,
    ) -> Result<ResponseBody, RangeError> {
        let prev = {
            let mut lease = self.lease.lock().unwrap();
            let prev = *lease;
            let same_holder = prev.holder == new_lease.holder;
            if !same_holder && new_lease.start <= prev.expiration {
                return Err(RangeError::LeaseRejected {
                    start: new_lease.start,
                    prev_expiration: prev.expiration,
                });
            }
            *lease = *new_lease;
            prev
        };
        batch.sys_put(
            keys::range_lease_key(self.range_id),
            serde_json::to_vec(new_lease).expect("leases serialize"),
        );
        if prev.holder != new_lease.holder {
            // Nothing is known about reads served by the old holder; every
            // timestamp it could have served must forward later writes.
            let low_water = prev
                .expiration
                .add(self.ctx.max_clock_offset_ns, 0);
            self.ts_cache.lock().unwrap().set_low_water(low_water);
            if new_lease.holder == self.ctx.raft_node_id() {
                self.maybe_gossip_configs();
            }
        }
        Ok(ResponseBody::LeaderLease)
    }

    fn holds_lease(&self) -> bool {
        self.lease().holder == self.ctx.raft_node_id()
    }

    /// Publish config records covered by this range. Called when the replica
    /// newly acquires the lease and after writes under the config prefix.
    pub fn maybe_gossip_configs(&self) {
        let desc = self.descriptor();
        let view = self.ctx.engine.read_view();
        for (info_key, prefix) in keys::CONFIG_GOSSIP_KEYS {
            if !desc.contains_key(prefix) {
                continue;
            }
            match view.mvcc_scan(prefix, &keys::prefix_end(prefix), Timestamp::MAX, None, true, 0)
            {
                Ok(rows) => {
                    let content =
                        serde_json::to_vec(&rows).expect("config rows serialize");
                    self.ctx.gossip.add_info(info_key, content);
                }
                Err(err) => {
                    warn!(range_id = self.range_id, error = %err, "config gossip scan failed")
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Admin commands
    // ------------------------------------------------------------------

    fn write_descriptor(
        &self,
        batch: &mut EngineState,
        stats: &mut MvccStats,
        timestamp: Timestamp,
        desc: &RangeDescriptor,
    ) -> Result<(), RangeError> {
        let bytes = serde_json::to_vec(desc).expect("descriptors serialize");
        batch.sys_put(keys::range_descriptor_key(desc.range_id), bytes.clone());
        batch.mvcc_put(
            stats,
            &keys::range_meta_key(&desc.end_key),
            timestamp,
            Some(bytes),
            None,
        )
    }

    /// Split this range at `split_key`: the left half keeps the range id and
    /// shrinks, the right half starts fresh with the same replica set.
    fn apply_admin_split(
        &self,
        batch: &mut EngineState,
        stats: &mut MvccStats,
        req: &Request,
        split_key: &[u8],
        action: &mut Option<ApplyAction>,
    ) -> Result<ResponseBody, RangeError> {
        let desc = self.descriptor();
        if !desc.contains_key(split_key) || split_key == desc.start_key.as_slice() {
            return Err(RangeError::invalid(format!(
                "split key {split_key:?} is not a valid split point"
            )));
        }
        let new_range_id = split_range_id(&desc, split_key);
        let left = RangeDescriptor {
            range_id: desc.range_id,
            start_key: desc.start_key.clone(),
            end_key: split_key.to_vec(),
            replicas: desc.replicas.clone(),
        };
        let right = RangeDescriptor {
            range_id: new_range_id,
            start_key: split_key.to_vec(),
            end_key: desc.end_key.clone(),
            replicas: desc.replicas.clone(),
        };
        self.write_descriptor(batch, stats, req.header.timestamp, &left)?;
        self.write_descriptor(batch, stats, req.header.timestamp, &right)?;
        *self.desc.write().unwrap() = left.clone();
        *action = Some(ApplyAction::SplitApplied {
            new_desc: right.clone(),
        });
        debug!(
            range_id = self.range_id,
            new_range_id, "applied admin split"
        );
        Ok(ResponseBody::AdminSplit {
            left_range_id: left.range_id,
            right_range_id: right.range_id,
        })
    }

    /// Merge the range immediately to the right back into this one. Merging
    /// the last range is a no-op; the ranges must be collocated on the same
    /// replica set.
    fn apply_admin_merge(
        &self,
        batch: &mut EngineState,
        stats: &mut MvccStats,
        req: &Request,
        action: &mut Option<ApplyAction>,
    ) -> Result<ResponseBody, RangeError> {
        let desc = self.descriptor();
        if desc.end_key == keys::KEY_MAX {
            return Ok(ResponseBody::AdminMerge);
        }
        let right = {
            let meta_start = keys::next_key(&keys::range_meta_key(&desc.end_key));
            let meta_end = keys::prefix_end(keys::META2_PREFIX);
            let mut found = None;
            for key in batch.mvcc_keys_in(&meta_start, &meta_end) {
                if let Some(bytes) = batch.mvcc_get(&key, Timestamp::MAX, None, true)? {
                    found = Some(serde_json::from_slice::<RangeDescriptor>(&bytes).map_err(
                        |err| RangeError::internal(format!("descriptor decode failed: {err}")),
                    )?);
                    break;
                }
            }
            found.ok_or_else(|| {
                RangeError::internal("no right-hand neighbor descriptor found")
            })?
        };
        if right.start_key != desc.end_key {
            return Err(RangeError::internal(
                "right-hand neighbor does not abut this range",
            ));
        }
        let mut left_set: Vec<_> = desc.replicas.iter().map(|r| r.raft_node_id()).collect();
        let mut right_set: Vec<_> = right.replicas.iter().map(|r| r.raft_node_id()).collect();
        left_set.sort_unstable();
        right_set.sort_unstable();
        if left_set != right_set {
            return Err(RangeError::invalid("ranges not collocated"));
        }
        let merged = RangeDescriptor {
            range_id: desc.range_id,
            start_key: desc.start_key.clone(),
            end_key: right.end_key.clone(),
            replicas: desc.replicas.clone(),
        };
        // The old left meta record is superseded; the right one is rewritten
        // to the merged descriptor.
        batch.mvcc_put(
            stats,
            &keys::range_meta_key(&desc.end_key),
            req.header.timestamp,
            None,
            None,
        )?;
        self.write_descriptor(batch, stats, req.header.timestamp, &merged)?;
        batch.sys_delete(&keys::range_descriptor_key(right.range_id));
        *self.desc.write().unwrap() = merged;
        *action = Some(ApplyAction::MergeApplied {
            subsumed_range_id: right.range_id,
        });
        Ok(ResponseBody::AdminMerge)
    }

    fn validate_change_replicas(
        &self,
        change_type: crate::api::ReplicaChangeType,
        replica: &ReplicaDesc,
    ) -> Result<(), RangeError> {
        let desc = self.desc.read().unwrap();
        match change_type {
            crate::api::ReplicaChangeType::Add => {
                if desc.replicas.iter().any(|r| r.node_id == replica.node_id) {
                    return Err(RangeError::invalid(format!(
                        "node {} is already present in range {}",
                        replica.node_id, self.range_id
                    )));
                }
            }
            crate::api::ReplicaChangeType::Remove => {
                if !desc
                    .replicas
                    .iter()
                    .any(|r| r.raft_node_id() == replica.raft_node_id())
                {
                    return Err(RangeError::invalid(format!(
                        "node {} is not present in range {}",
                        replica.node_id, self.range_id
                    )));
                }
            }
        }
        Ok(())
    }

    /// Rewrite the descriptor for a replica addition or removal. The
    /// consensus-level membership change rides in the same log entry.
    fn apply_change_replicas(
        &self,
        batch: &mut EngineState,
        stats: &mut MvccStats,
        req: &Request,
        change_type: crate::api::ReplicaChangeType,
        replica: ReplicaDesc,
    ) -> Result<ResponseBody, RangeError> {
        let mut desc = self.descriptor();
        match change_type {
            crate::api::ReplicaChangeType::Add => {
                if desc.replicas.iter().any(|r| r.node_id == replica.node_id) {
                    return Err(RangeError::invalid(format!(
                        "node {} is already present in range {}",
                        replica.node_id, self.range_id
                    )));
                }
                desc.replicas.push(replica);
            }
            crate::api::ReplicaChangeType::Remove => {
                let before = desc.replicas.len();
                desc.replicas
                    .retain(|r| r.raft_node_id() != replica.raft_node_id());
                if desc.replicas.len() == before {
                    return Err(RangeError::invalid(format!(
                        "node {} is not present in range {}",
                        replica.node_id, self.range_id
                    )));
                }
            }
        }
        self.write_descriptor(batch, stats, req.header.timestamp, &desc)?;
        *self.desc.write().unwrap() = desc;
        Ok(ResponseBody::ChangeReplicas)
    }
}

pub(crate) fn read_stats(engine: &EngineState, range_id: u64) -> MvccStats {
    engine
        .sys_get(&keys::range_stats_key(range_id))
        .and_then(|b| serde_json::from_slice(b).ok())
        .unwrap_or_default()
}

pub(crate) fn write_stats(engine: &mut EngineState, range_id: u64, stats: &MvccStats) {
    engine.sys_put(
        keys::range_stats_key(range_id),
        serde_json::to_vec(stats).expect("stats serialize"),
    );
}

/// Public stats accessor used by the store and tests.
pub fn range_stats(engine: &MemEngine, range_id: u64) -> MvccStats {
    read_stats(&engine.read_view(), range_id)
}

/// Deterministic id for the right-hand side of a split. Every replica applies
/// the same command, so the id must derive from replicated state alone.
fn split_range_id(desc: &RangeDescriptor, split_key: &[u8]) -> u64 {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};
    let mut hasher = DefaultHasher::new();
    desc.range_id.hash(&mut hasher);
    split_key.hash(&mut hasher);
    // Stay clear of small hand-assigned range ids.
    hasher.finish() | (1 << 32)
}
