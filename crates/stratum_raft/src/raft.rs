//! Raft module wiring.
//!
//! `group` contains the single-group consensus state machine, `state` holds
//! the in-memory log, `driver` multiplexes many groups over one transport on
//! a single actor task, and `types` defines the shared message/trait
//! contracts (storage, transport, applier, events).

mod demux;
mod driver;
mod group;
mod state;
mod storage;
mod transport;
mod types;

pub use demux::EventDemux;
pub use driver::MultiRaft;
pub use group::{Group, Ready};
pub use state::RaftLog;
pub use storage::{BlockableStorage, MemGroupStorage, MemStorage};
pub use transport::{LocalTransport, Transport};
pub use types::{
    interval_ticker, manual_ticker, CommandApplier, CommandCommittedEvent, ConfChange,
    ConfChangeKind, ConfState, Config, Entry, EntryKind, Event, GroupId, GroupStorage, HardState,
    InitialState, LeaderElectionEvent, LogError, ManualTicker, MembershipCallback,
    MembershipChangeEvent, Message, NodeId, RaftError, RaftMessage, Snapshot, Storage, Ticker,
    NO_LEADER,
};
