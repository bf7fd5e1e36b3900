//! Shared types for the raft consensus layer.
//!
//! These types are kept in a small, dependency-light module because they are
//! used by the group state machine, the driver, and the storage/transport
//! layers alike.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};

/// Logical identifier for a raft group. One group per range.
pub type GroupId = u64;
/// Logical node identifier within a group. Zero is reserved for "no node".
pub type NodeId = u64;

/// Sentinel leader value while no leader is known.
pub const NO_LEADER: NodeId = 0;

/// Durable per-group consensus state. Must be persisted before any message
/// that reflects it is sent.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HardState {
    pub term: u64,
    pub vote: NodeId,
    pub commit: u64,
}

/// Kind of a replicated log entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryKind {
    /// An opaque application command (or a leader no-op when the payload is
    /// empty).
    Normal,
    /// A single-step membership change; the payload may carry an
    /// application-level command applied alongside the change.
    ConfChange,
}

/// One replicated log entry.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    pub term: u64,
    pub index: u64,
    pub kind: EntryKind,
    /// Client-chosen identifier used to route commit notifications back to
    /// the proposer. Empty for leader no-op entries.
    pub command_id: String,
    pub payload: Vec<u8>,
    /// Present iff `kind == EntryKind::ConfChange`.
    pub conf_change: Option<ConfChange>,
}

/// Membership of a group at a point in the log.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfState {
    pub nodes: Vec<NodeId>,
}

/// Point-in-time state transfer used to initialize or catch up a replica.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub index: u64,
    pub term: u64,
    pub conf_state: ConfState,
    pub data: Vec<u8>,
}

impl Snapshot {
    pub fn is_empty(&self) -> bool {
        self.index == 0
    }
}

/// Direction of a single-step membership change.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfChangeKind {
    AddNode,
    RemoveNode,
}

/// A single-step membership change proposal.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfChange {
    pub kind: ConfChangeKind,
    pub node_id: NodeId,
}

/// The consensus wire vocabulary: votes, appends, and snapshots.
///
/// Appends double as heartbeats (an empty `Append` probes and transmits the
/// commit index) and as retransmissions. Proposals from a non-leader replica
/// are forwarded to the known leader as `Propose`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    Vote {
        term: u64,
        last_log_index: u64,
        last_log_term: u64,
    },
    VoteResp {
        term: u64,
        granted: bool,
    },
    Append {
        term: u64,
        prev_index: u64,
        prev_term: u64,
        entries: Vec<Entry>,
        commit: u64,
    },
    AppendResp {
        term: u64,
        /// Highest matching index when accepted; the follower's last index
        /// hint when rejected.
        index: u64,
        rejected: bool,
    },
    Snap {
        term: u64,
        snapshot: Snapshot,
    },
    Propose {
        kind: EntryKind,
        command_id: String,
        payload: Vec<u8>,
        conf_change: Option<ConfChange>,
    },
}

/// A routed consensus message, addressed by `(to, group_id)`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RaftMessage {
    pub group_id: GroupId,
    pub from: NodeId,
    pub to: NodeId,
    pub message: Message,
}

/// State read back from storage when a group is created.
#[derive(Clone, Debug, Default)]
pub struct InitialState {
    pub hard_state: HardState,
    pub snapshot: Option<Snapshot>,
    pub entries: Vec<Entry>,
}

/// Error for raft log reads below the compaction floor.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogError {
    /// The requested entries have been compacted away.
    Unavailable,
}

impl fmt::Display for LogError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogError::Unavailable => write!(f, "requested log entries are unavailable"),
        }
    }
}

impl std::error::Error for LogError {}

/// Durable storage for one group.
///
/// Groups keep their working log in memory and treat storage as the
/// durability sink: `initial_state` is read once at group creation, after
/// which the driver only writes. Persistence acks gate message sending and
/// entry application, so a slow `persist` stalls only its own group.
#[async_trait]
pub trait GroupStorage: Send + Sync + 'static {
    fn initial_state(&self) -> anyhow::Result<InitialState>;

    async fn persist(
        &self,
        hard_state: Option<HardState>,
        entries: &[Entry],
        snapshot: Option<&Snapshot>,
    ) -> anyhow::Result<()>;
}

/// Factory for per-group storage.
pub trait Storage: Send + Sync + 'static {
    fn group_storage(&self, group_id: GroupId) -> Arc<dyn GroupStorage>;
}

/// Callback handed to consumers of committed committed-entry state; the
/// driver applies committed commands through this seam.
pub trait CommandApplier: Send + Sync + 'static {
    /// Apply one committed command. `index` is the raft log index of the
    /// entry; `command_id` is never empty. Called on the driver task, in log
    /// order within a group.
    fn apply_command(&self, group_id: GroupId, index: u64, command_id: &str, payload: &[u8]);
}

/// One-shot acknowledgement for a committed membership change. The driver
/// does not update its conf state until the callback is invoked.
pub struct MembershipCallback {
    tx: Option<oneshot::Sender<anyhow::Result<()>>>,
}

impl MembershipCallback {
    pub(crate) fn new(tx: oneshot::Sender<anyhow::Result<()>>) -> Self {
        Self { tx: Some(tx) }
    }

    /// Invoke the callback. Consumes the callback so it can fire only once.
    pub fn call(mut self, result: anyhow::Result<()>) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(result);
        }
    }
}

impl fmt::Debug for MembershipCallback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("MembershipCallback")
    }
}

/// Fired when the committed term of a group advances while a leader is
/// known, i.e. when a newly elected leader commits its first entry. The
/// reported term is that committing entry's term.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LeaderElectionEvent {
    pub group_id: GroupId,
    pub leader: NodeId,
    pub term: u64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommandCommittedEvent {
    pub group_id: GroupId,
    pub command_id: String,
    pub payload: Vec<u8>,
}

/// A committed membership change. The callback must be invoked exactly once;
/// the driver waits for it before updating conf state locally.
#[derive(Debug)]
pub struct MembershipChangeEvent {
    pub group_id: GroupId,
    pub command_id: String,
    pub kind: ConfChangeKind,
    pub node_id: NodeId,
    pub callback: MembershipCallback,
}

/// Events emitted by the driver for consumers and tests.
#[derive(Debug)]
pub enum Event {
    LeaderElection(LeaderElectionEvent),
    CommandCommitted(CommandCommittedEvent),
    MembershipChangeCommitted(MembershipChangeEvent),
}

/// Errors surfaced on proposal channels.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RaftError {
    /// The target group does not exist, or was removed while the proposal
    /// was in flight. Proposals failing this way are retryable.
    GroupDeleted,
    /// The driver has shut down.
    Stopped,
}

impl fmt::Display for RaftError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RaftError::GroupDeleted => write!(f, "raft group deleted"),
            RaftError::Stopped => write!(f, "multiraft driver stopped"),
        }
    }
}

impl std::error::Error for RaftError {}

/// Driver configuration. Tick cadence is owned by the caller through the
/// `Ticker`, which keeps tests deterministic.
#[derive(Clone, Debug)]
pub struct Config {
    pub node_id: NodeId,
    /// Ticks of silence before a follower campaigns. The effective timeout
    /// is randomized in `[election_timeout_ticks, 2 * election_timeout_ticks)`.
    pub election_timeout_ticks: usize,
    /// Ticks between leader append/heartbeat broadcasts.
    pub heartbeat_interval_ticks: usize,
    /// Cap on entries shipped in a single append.
    pub max_entries_per_append: usize,
    /// Capacity of the driver's event channel.
    pub event_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            node_id: 0,
            election_timeout_ticks: 10,
            heartbeat_interval_ticks: 3,
            max_entries_per_append: 64,
            event_capacity: 1024,
        }
    }
}

/// Source of driver clock ticks.
pub struct Ticker {
    pub(crate) rx: mpsc::UnboundedReceiver<()>,
}

/// Test handle that advances a `Ticker` by hand.
#[derive(Clone)]
pub struct ManualTicker {
    tx: mpsc::UnboundedSender<()>,
}

impl ManualTicker {
    pub fn tick(&self) {
        let _ = self.tx.send(());
    }

    pub fn tick_n(&self, n: usize) {
        for _ in 0..n {
            self.tick();
        }
    }
}

/// Build a manually driven ticker pair for tests.
pub fn manual_ticker() -> (ManualTicker, Ticker) {
    let (tx, rx) = mpsc::unbounded_channel();
    (ManualTicker { tx }, Ticker { rx })
}

/// Build a wall-clock ticker firing every `period`.
pub fn interval_ticker(period: Duration) -> Ticker {
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            if tx.send(()).is_err() {
                return;
            }
        }
    });
    Ticker { rx }
}
