//! The store: a local engine hosting many range replicas.
//!
//! `Store` constructs and owns both sides of the replica/consensus coupling:
//! it implements `CommandApplier` (consumed by the driver) and hands each
//! `Range` the `MultiRaft` proposer handle, so neither layer owns the other.
//! It also consumes the driver's event stream, acknowledging membership
//! changes and routing committed commands' follow-up work (splits, merges,
//! log truncation).

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tracing::{debug, warn};

use stratum_raft::raft::{
    CommandApplier, Config as RaftConfig, ConfState, EventDemux, GroupId, MemStorage, MultiRaft,
    Snapshot, Storage, Ticker, Transport,
};

use crate::api::{RaftCommand, RangeDescriptor, ReplicaDesc, Request, Response};
use crate::clock::Clock;
use crate::engine::MemEngine;
use crate::error::RangeError;
use crate::gossip::Gossip;
use crate::keys;
use crate::range::{
    ApplyAction, CommandFilter, Range, StoreContext, DEFAULT_LEADER_LEASE_DURATION_NS,
};

#[derive(Clone)]
pub struct StoreConfig {
    pub node_id: u64,
    pub store_id: u64,
    pub lease_duration_ns: i64,
    pub max_clock_offset_ns: i64,
    pub election_timeout_ticks: usize,
    pub heartbeat_interval_ticks: usize,
    /// Test hook consulted before command execution.
    pub command_filter: Option<CommandFilter>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig {
            node_id: 1,
            store_id: 1,
            lease_duration_ns: DEFAULT_LEADER_LEASE_DURATION_NS,
            max_clock_offset_ns: 0,
            election_timeout_ticks: 10,
            heartbeat_interval_ticks: 3,
            command_filter: None,
        }
    }
}

pub struct Store {
    ctx: Arc<StoreContext>,
    ranges: RwLock<HashMap<u64, Arc<Range>>>,
}

impl Store {
    /// Start a store node: boot the consensus driver on `transport`, wire the
    /// applier, and spawn the event consumer.
    pub fn start(
        config: StoreConfig,
        clock: Clock,
        transport: Arc<dyn Transport>,
        gossip: Arc<dyn Gossip>,
        ticker: Ticker,
    ) -> anyhow::Result<Arc<Store>> {
        let engine = Arc::new(MemEngine::new());
        let raft_storage = Arc::new(MemStorage::new());
        let replica = ReplicaDesc::new(config.node_id, config.store_id);
        let raft_config = RaftConfig {
            node_id: replica.raft_node_id(),
            election_timeout_ticks: config.election_timeout_ticks,
            heartbeat_interval_ticks: config.heartbeat_interval_ticks,
            ..RaftConfig::default()
        };
        let (raft, events) = MultiRaft::start(
            raft_config,
            transport,
            raft_storage.clone() as Arc<dyn Storage>,
            ticker,
        )?;
        let ctx = Arc::new(StoreContext {
            node_id: config.node_id,
            store_id: config.store_id,
            clock,
            engine,
            raft,
            raft_storage,
            gossip,
            lease_duration_ns: config.lease_duration_ns,
            max_clock_offset_ns: config.max_clock_offset_ns,
            command_filter: config.command_filter,
        });
        let store = Arc::new(Store {
            ctx,
            ranges: RwLock::new(HashMap::new()),
        });
        store.ctx.raft.set_applier(store.clone());
        store.clone().spawn_event_consumer(EventDemux::start(events));
        Ok(store)
    }

    /// Acknowledge membership changes and log the rest. Without this loop
    /// committed conf changes would never take effect.
    fn spawn_event_consumer(self: Arc<Self>, demux: EventDemux) {
        let EventDemux {
            mut leader_election,
            mut command_committed,
            mut membership_change,
        } = demux;
        tokio::spawn(async move {
            while let Some(event) = membership_change.recv().await {
                debug!(
                    group_id = event.group_id,
                    node_id = event.node_id,
                    "membership change committed"
                );
                event.callback.call(Ok(()));
            }
        });
        tokio::spawn(async move {
            while let Some(event) = leader_election.recv().await {
                debug!(
                    group_id = event.group_id,
                    leader = event.leader,
                    term = event.term,
                    "leader elected"
                );
            }
        });
        tokio::spawn(async move {
            // Commands are applied through the applier; the event stream just
            // needs draining.
            while command_committed.recv().await.is_some() {}
        });
    }

    pub fn replica(&self) -> ReplicaDesc {
        ReplicaDesc::new(self.ctx.node_id, self.ctx.store_id)
    }

    pub fn clock(&self) -> &Clock {
        &self.ctx.clock
    }

    pub fn engine(&self) -> &Arc<MemEngine> {
        &self.ctx.engine
    }

    pub fn raft_storage(&self) -> &Arc<MemStorage> {
        &self.ctx.raft_storage
    }

    pub fn stop(&self) {
        self.ctx.raft.stop();
    }

    /// Create a range from a descriptor: persist it, seed the consensus
    /// group's membership, and start the replica. The descriptor must name
    /// this store as a member.
    pub async fn bootstrap_range(&self, desc: RangeDescriptor) -> anyhow::Result<Arc<Range>> {
        anyhow::ensure!(
            desc.replica_for_store(self.ctx.store_id).is_some(),
            "descriptor does not include this store"
        );
        let now = self.ctx.clock.now();
        {
            let mut batch = self.ctx.engine.write_batch();
            let bytes = serde_json::to_vec(&desc)?;
            batch.sys_put(keys::range_descriptor_key(desc.range_id), bytes.clone());
            let mut stats = crate::range::read_stats(&batch, desc.range_id);
            batch
                .mvcc_put(
                    &mut stats,
                    &keys::range_meta_key(&desc.end_key),
                    now,
                    Some(bytes),
                    None,
                )
                .map_err(|err| anyhow::anyhow!("meta record write failed: {err}"))?;
            crate::range::write_stats(&mut batch, desc.range_id, &stats);
        }
        let nodes: Vec<u64> = desc.replicas.iter().map(|r| r.raft_node_id()).collect();
        self.ctx.raft_storage.group(desc.range_id).apply_snapshot(Snapshot {
            index: 0,
            term: 0,
            conf_state: ConfState { nodes },
            data: Vec::new(),
        });
        let range = Range::new(self.ctx.clone(), desc.clone());
        self.ranges
            .write()
            .unwrap()
            .insert(desc.range_id, range.clone());
        self.ctx.raft.create_group(desc.range_id).await?;
        Ok(range)
    }

    pub fn range(&self, range_id: u64) -> Result<Arc<Range>, RangeError> {
        self.ranges
            .read()
            .unwrap()
            .get(&range_id)
            .cloned()
            .ok_or(RangeError::RangeNotFound { range_id })
    }

    /// Route a command to its range. Zero timestamps are filled from the
    /// store clock; explicit timestamps advance it (hybrid-logical update).
    pub async fn send(&self, mut req: Request) -> Result<Response, RangeError> {
        if req.header.timestamp.is_zero() {
            req.header.timestamp = self.ctx.clock.now();
        } else {
            self.ctx.clock.update(req.header.timestamp);
        }
        let range = self.range(req.header.range_id)?;
        range.send(req).await
    }

    /// Drop a range replica: fail its pending applies, discard its response
    /// cache, and tear down its consensus group.
    pub fn remove_range(&self, range_id: u64) {
        let Some(range) = self.ranges.write().unwrap().remove(&range_id) else {
            return;
        };
        range.fail_pending(RangeError::RangeNotFound { range_id });
        {
            let mut batch = self.ctx.engine.write_batch();
            crate::response_cache::ResponseCache::new(range_id).clear(&mut batch);
            batch.sys_delete(&keys::range_descriptor_key(range_id));
        }
        self.ctx.raft.remove_group_background(range_id);
        self.ctx.raft_storage.remove_group(range_id);
        debug!(range_id, "removed range");
    }

    /// Bring up the right-hand replica produced by an applied split.
    fn finish_split(&self, new_desc: RangeDescriptor) {
        let range_id = new_desc.range_id;
        if self.ranges.read().unwrap().contains_key(&range_id) {
            return;
        }
        let nodes: Vec<u64> = new_desc.replicas.iter().map(|r| r.raft_node_id()).collect();
        self.ctx.raft_storage.group(range_id).apply_snapshot(Snapshot {
            index: 0,
            term: 0,
            conf_state: ConfState { nodes },
            data: Vec::new(),
        });
        let range = Range::new(self.ctx.clone(), new_desc);
        self.ranges.write().unwrap().insert(range_id, range);
        self.ctx.raft.create_group_background(range_id);
    }
}

impl CommandApplier for Store {
    fn apply_command(&self, group_id: GroupId, index: u64, command_id: &str, payload: &[u8]) {
        let Ok(range) = self.range(group_id) else {
            debug!(group_id, "dropping committed command for unknown range");
            return;
        };
        let command: RaftCommand = match serde_json::from_slice(payload) {
            Ok(command) => command,
            Err(err) => {
                // A command that cannot be decoded can never be applied;
                // this replica has diverged.
                range.mark_corrupt(format!("command decode failed: {err}"), false);
                return;
            }
        };
        match range.apply_committed(index, command_id, command) {
            Some(ApplyAction::SplitApplied { new_desc }) => self.finish_split(new_desc),
            Some(ApplyAction::MergeApplied { subsumed_range_id }) => {
                self.remove_range(subsumed_range_id)
            }
            Some(ApplyAction::TruncateLog { first_kept }) => {
                if let Err(err) = self
                    .ctx
                    .raft_storage
                    .group(group_id)
                    .compact(first_kept)
                {
                    warn!(group_id, first_kept, error = %err, "raft log compaction failed");
                }
                self.ctx.raft.truncate_log(group_id, first_kept);
            }
            None => {}
        }
    }
}
