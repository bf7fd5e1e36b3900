//! Shared harness for multiraft integration tests.

#![allow(dead_code)]

use std::sync::Arc;

use stratum_raft::raft::{
    manual_ticker, BlockableStorage, Config, ConfState, EventDemux, HardState, LeaderElectionEvent,
    LocalTransport, ManualTicker, MemStorage, MultiRaft, NodeId, Snapshot,
};

/// One in-process cluster: a driver per node over a shared local transport,
/// manual tickers, and blockable in-memory storage.
pub struct TestCluster {
    pub transport: Arc<LocalTransport>,
    pub nodes: Vec<MultiRaft>,
    pub tickers: Vec<ManualTicker>,
    pub storages: Vec<Arc<BlockableStorage>>,
    pub mem: Vec<Arc<MemStorage>>,
    pub events: Vec<EventDemux>,
}

/// Best-effort tracing setup; `RUST_LOG` controls verbosity.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

impl TestCluster {
    /// Node ids are 1-based: index `i` hosts node id `i + 1`.
    pub fn new(size: usize) -> Self {
        init_tracing();
        let transport = Arc::new(LocalTransport::new());
        let mut nodes = Vec::new();
        let mut tickers = Vec::new();
        let mut storages = Vec::new();
        let mut mem = Vec::new();
        let mut events = Vec::new();
        for i in 0..size {
            let memory = Arc::new(MemStorage::new());
            let blockable = Arc::new(BlockableStorage::new(memory.clone()));
            let (ticker_handle, ticker) = manual_ticker();
            let config = Config {
                node_id: (i + 1) as NodeId,
                election_timeout_ticks: 2,
                heartbeat_interval_ticks: 1,
                ..Config::default()
            };
            let (node, event_rx) =
                MultiRaft::start(config, transport.clone(), blockable.clone(), ticker)
                    .expect("start multiraft");
            nodes.push(node);
            tickers.push(ticker_handle);
            storages.push(blockable);
            mem.push(memory);
            events.push(EventDemux::start(event_rx));
        }
        TestCluster {
            transport,
            nodes,
            tickers,
            storages,
            mem,
            events,
        }
    }

    pub fn node_id(&self, index: usize) -> NodeId {
        (index + 1) as NodeId
    }

    /// Replicate a group across `num_replicas` members starting at
    /// `first_node`, seeding each member's storage with committed hard state
    /// and a snapshot naming the full membership.
    pub async fn create_group(&self, group_id: u64, first_node: usize, num_replicas: usize) {
        let replica_ids: Vec<NodeId> = (0..num_replicas)
            .map(|i| self.node_id(first_node + i))
            .collect();
        for i in 0..num_replicas {
            let index = first_node + i;
            let group_storage = self.mem[index].group(group_id);
            group_storage.set_hard_state(HardState {
                term: 5,
                vote: 0,
                commit: 10,
            });
            group_storage.apply_snapshot(Snapshot {
                index: 10,
                term: 5,
                conf_state: ConfState {
                    nodes: replica_ids.clone(),
                },
                data: Vec::new(),
            });
            self.nodes[index]
                .create_group(group_id)
                .await
                .expect("create group");
        }
    }

    /// Start an election on the given node without waiting for the outcome.
    pub fn trigger_election(&self, index: usize, group_id: u64) {
        self.nodes[index].campaign(group_id);
    }

    /// Wait for the next leader election event observed by a node.
    pub async fn wait_for_election(&mut self, index: usize) -> LeaderElectionEvent {
        self.events[index]
            .leader_election
            .recv()
            .await
            .expect("leader election channel closed")
    }

    /// Trigger an election and wait for every member to observe it.
    pub async fn elect(&mut self, leader_index: usize, group_id: u64, members: &[usize]) {
        self.trigger_election(leader_index, group_id);
        let leader_id = self.node_id(leader_index);
        for member in members {
            let event = self.wait_for_election(*member).await;
            assert_eq!(
                event.leader, leader_id,
                "wrong leader elected on node index {member}: {event:?}"
            );
            assert_eq!(event.group_id, group_id, "unexpected group: {event:?}");
        }
    }
}

/// Unique command ids for test proposals.
pub fn make_command_id() -> String {
    use rand::Rng;
    let mut rng = rand::thread_rng();
    (0..8).map(|_| rng.gen_range(b'a'..=b'z') as char).collect()
}
