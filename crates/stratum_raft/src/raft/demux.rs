//! Event demultiplexer.
//!
//! Splits the driver's single event stream into per-kind channels so
//! consumers can wait on exactly the events they care about. Per-kind
//! buffers are bounded; informational events are dropped when a consumer
//! stops draining, while membership events (which carry a callback the
//! driver waits on) always block until delivered.

use tokio::sync::mpsc;
use tracing::warn;

use crate::raft::types::{
    CommandCommittedEvent, Event, LeaderElectionEvent, MembershipChangeEvent,
};

const DEMUX_BUFFER: usize = 256;

pub struct EventDemux {
    pub leader_election: mpsc::Receiver<LeaderElectionEvent>,
    pub command_committed: mpsc::Receiver<CommandCommittedEvent>,
    pub membership_change: mpsc::Receiver<MembershipChangeEvent>,
}

impl EventDemux {
    /// Start routing `events` into per-kind channels.
    pub fn start(mut events: mpsc::Receiver<Event>) -> Self {
        let (le_tx, leader_election) = mpsc::channel(DEMUX_BUFFER);
        let (cc_tx, command_committed) = mpsc::channel(DEMUX_BUFFER);
        let (mc_tx, membership_change) = mpsc::channel(DEMUX_BUFFER);
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match event {
                    Event::LeaderElection(event) => {
                        if le_tx.try_send(event).is_err() {
                            warn!("dropping leader election event: consumer not draining");
                        }
                    }
                    Event::CommandCommitted(event) => {
                        if cc_tx.try_send(event).is_err() {
                            warn!("dropping command committed event: consumer not draining");
                        }
                    }
                    Event::MembershipChangeCommitted(event) => {
                        // The driver is waiting on this event's callback;
                        // dropping it would wedge the group.
                        if mc_tx.send(event).await.is_err() {
                            return;
                        }
                    }
                }
            }
        });
        EventDemux {
            leader_election,
            command_committed,
            membership_change,
        }
    }
}
