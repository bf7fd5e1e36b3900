//! Single-group consensus state machine.
//!
//! A `Group` holds the raft roles, the in-memory log, and per-peer
//! replication progress for one consensus group. It is a pure state machine:
//! inputs arrive through `step`/`tick`/`propose`, outputs accumulate in a
//! `Ready` that the driver drains, persists, and transmits. Nothing here does
//! IO.

use std::collections::HashMap;

use rand::Rng;
use tracing::{debug, trace};

use crate::raft::state::RaftLog;
use crate::raft::types::{
    ConfChange, ConfChangeKind, ConfState, Entry, EntryKind, HardState, InitialState, Message,
    NodeId, RaftMessage, Snapshot, NO_LEADER,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Role {
    Follower,
    Candidate,
    Leader,
}

/// Leader-side view of one follower's log position.
#[derive(Clone, Copy, Debug, Default)]
struct Progress {
    matched: u64,
    next: u64,
}

/// Accumulated output of the state machine since the last drain.
///
/// The driver must persist `hard_state`/`entries`/`snapshot` before sending
/// `messages` or handing `committed` to the application.
#[derive(Debug, Default)]
pub struct Ready {
    pub hard_state: Option<HardState>,
    pub entries: Vec<Entry>,
    pub snapshot: Option<Snapshot>,
    pub committed: Vec<Entry>,
    pub messages: Vec<RaftMessage>,
    pub leader: NodeId,
}

impl Ready {
    pub fn needs_persist(&self) -> bool {
        self.hard_state.is_some() || !self.entries.is_empty() || self.snapshot.is_some()
    }
}

pub struct Group {
    group_id: u64,
    node_id: NodeId,
    term: u64,
    vote: NodeId,
    role: Role,
    leader: NodeId,
    log: RaftLog,
    nodes: Vec<NodeId>,
    progress: HashMap<NodeId, Progress>,
    votes_granted: HashMap<NodeId, bool>,
    election_elapsed: usize,
    heartbeat_elapsed: usize,
    randomized_election_timeout: usize,
    election_timeout: usize,
    heartbeat_interval: usize,
    max_entries_per_append: usize,
    msgs: Vec<RaftMessage>,
    prev_hard_state: HardState,
    pending_snapshot: Option<Snapshot>,
    latest_snapshot: Option<Snapshot>,
}

impl Group {
    pub fn new(
        group_id: u64,
        node_id: NodeId,
        election_timeout: usize,
        heartbeat_interval: usize,
        max_entries_per_append: usize,
        initial: &InitialState,
    ) -> Self {
        let log = RaftLog::from_initial_state(initial);
        let nodes = initial
            .snapshot
            .as_ref()
            .map(|s| s.conf_state.nodes.clone())
            .unwrap_or_default();
        let prev_hard_state = HardState {
            term: initial.hard_state.term,
            vote: initial.hard_state.vote,
            commit: log.commit_index(),
        };
        let mut group = Group {
            group_id,
            node_id,
            term: initial.hard_state.term,
            vote: initial.hard_state.vote,
            role: Role::Follower,
            leader: NO_LEADER,
            log,
            nodes,
            progress: HashMap::new(),
            votes_granted: HashMap::new(),
            election_elapsed: 0,
            heartbeat_elapsed: 0,
            randomized_election_timeout: 0,
            election_timeout: election_timeout.max(1),
            heartbeat_interval: heartbeat_interval.max(1),
            max_entries_per_append: max_entries_per_append.max(1),
            msgs: Vec::new(),
            prev_hard_state,
            pending_snapshot: None,
            latest_snapshot: initial.snapshot.clone(),
        };
        group.reset_randomized_election_timeout();
        // A group bootstrapped with a single voter elects itself without
        // waiting for a tick.
        if group.nodes == [node_id] {
            group.campaign();
        }
        group
    }

    pub fn leader(&self) -> NodeId {
        self.leader
    }

    pub fn is_leader(&self) -> bool {
        self.role == Role::Leader
    }

    pub fn term(&self) -> u64 {
        self.term
    }

    pub fn nodes(&self) -> &[NodeId] {
        &self.nodes
    }

    pub fn last_index(&self) -> u64 {
        self.log.last_index()
    }

    fn quorum(&self) -> usize {
        self.nodes.len() / 2 + 1
    }

    fn hard_state(&self) -> HardState {
        HardState {
            term: self.term,
            vote: self.vote,
            commit: self.log.commit_index(),
        }
    }

    fn conf_state(&self) -> ConfState {
        ConfState {
            nodes: self.nodes.clone(),
        }
    }

    fn reset_randomized_election_timeout(&mut self) {
        self.randomized_election_timeout =
            self.election_timeout + rand::thread_rng().gen_range(0..self.election_timeout);
    }

    fn send(&mut self, to: NodeId, message: Message) {
        self.msgs.push(RaftMessage {
            group_id: self.group_id,
            from: self.node_id,
            to,
            message,
        });
    }

    fn peers(&self) -> Vec<NodeId> {
        self.nodes
            .iter()
            .copied()
            .filter(|id| *id != self.node_id)
            .collect()
    }

    // ------------------------------------------------------------------
    // Role transitions
    // ------------------------------------------------------------------

    fn become_follower(&mut self, term: u64, leader: NodeId) {
        if term > self.term {
            self.vote = NO_LEADER;
        }
        self.term = term;
        self.role = Role::Follower;
        self.leader = leader;
        self.election_elapsed = 0;
        self.votes_granted.clear();
        self.reset_randomized_election_timeout();
    }

    /// Start an election: bump the term, vote for self, solicit votes.
    pub fn campaign(&mut self) {
        if !self.nodes.contains(&self.node_id) {
            return;
        }
        self.role = Role::Candidate;
        self.term += 1;
        self.vote = self.node_id;
        self.leader = NO_LEADER;
        self.election_elapsed = 0;
        self.reset_randomized_election_timeout();
        self.votes_granted.clear();
        self.votes_granted.insert(self.node_id, true);
        debug!(group_id = self.group_id, node_id = self.node_id, term = self.term, "campaigning");
        if self.count_granted() >= self.quorum() {
            self.become_leader();
            return;
        }
        let (last_log_index, last_log_term) = (self.log.last_index(), self.log.last_term());
        for peer in self.peers() {
            self.send(
                peer,
                Message::Vote {
                    term: self.term,
                    last_log_index,
                    last_log_term,
                },
            );
        }
    }

    fn count_granted(&self) -> usize {
        self.votes_granted.values().filter(|g| **g).count()
    }

    fn become_leader(&mut self) {
        debug_assert_ne!(self.role, Role::Leader);
        self.role = Role::Leader;
        self.leader = self.node_id;
        self.heartbeat_elapsed = 0;
        self.votes_granted.clear();
        let last = self.log.last_index();
        self.progress.clear();
        for node in self.nodes.clone() {
            self.progress.insert(
                node,
                Progress {
                    matched: if node == self.node_id { last } else { 0 },
                    next: last + 1,
                },
            );
        }
        debug!(group_id = self.group_id, node_id = self.node_id, term = self.term, "became leader");
        // A new leader commits an entry of its own term to conclude the
        // election; this no-op is that entry.
        self.append_entries(vec![(EntryKind::Normal, String::new(), Vec::new(), None)]);
    }

    // ------------------------------------------------------------------
    // Proposals and log replication
    // ------------------------------------------------------------------

    /// Append proposals as leader. Returns false when this node is not the
    /// leader; the driver then forwards or queues the proposal.
    pub fn propose(
        &mut self,
        kind: EntryKind,
        command_id: String,
        payload: Vec<u8>,
        conf_change: Option<ConfChange>,
    ) -> bool {
        if self.role != Role::Leader {
            return false;
        }
        self.append_entries(vec![(kind, command_id, payload, conf_change)]);
        true
    }

    fn append_entries(
        &mut self,
        proposals: Vec<(EntryKind, String, Vec<u8>, Option<ConfChange>)>,
    ) {
        let mut index = self.log.last_index();
        let term = self.term;
        let entries: Vec<Entry> = proposals
            .into_iter()
            .map(|(kind, command_id, payload, conf_change)| {
                index += 1;
                Entry {
                    term,
                    index,
                    kind,
                    command_id,
                    payload,
                    conf_change,
                }
            })
            .collect();
        self.log.append(entries);
        if let Some(pr) = self.progress.get_mut(&self.node_id) {
            pr.matched = self.log.last_index();
            pr.next = pr.matched + 1;
        }
        // Single-voter groups commit immediately; otherwise ship the new
        // entries to every follower.
        self.maybe_commit();
        self.bcast_append();
    }

    fn send_append(&mut self, to: NodeId) {
        let pr = match self.progress.get(&to) {
            Some(pr) => *pr,
            None => return,
        };
        if pr.next < self.log.first_index() {
            // Follower is behind the compaction floor; only a snapshot can
            // catch it up.
            let snapshot = self
                .latest_snapshot
                .clone()
                .filter(|s| s.index + 1 >= self.log.first_index())
                .unwrap_or_else(|| Snapshot {
                    index: self.log.first_index() - 1,
                    term: self.log.term(self.log.first_index() - 1).unwrap_or(0),
                    conf_state: self.conf_state(),
                    data: Vec::new(),
                });
            let term = self.term;
            self.send(to, Message::Snap { term, snapshot });
            return;
        }
        let prev_index = pr.next - 1;
        let prev_term = match self.log.term(prev_index) {
            Ok(term) => term,
            Err(_) => return,
        };
        let entries = self
            .log
            .slice(pr.next, self.log.last_index() + 1, self.max_entries_per_append)
            .unwrap_or_default();
        let (term, commit) = (self.term, self.log.commit_index());
        self.send(
            to,
            Message::Append {
                term,
                prev_index,
                prev_term,
                entries,
                commit,
            },
        );
    }

    fn bcast_append(&mut self) {
        for peer in self.peers() {
            self.send_append(peer);
        }
    }

    /// Advance the commit index to the highest entry of the current term
    /// replicated on a quorum.
    fn maybe_commit(&mut self) -> bool {
        if self.role != Role::Leader {
            return false;
        }
        let mut matches: Vec<u64> = self
            .nodes
            .iter()
            .map(|id| {
                if *id == self.node_id {
                    self.log.last_index()
                } else {
                    self.progress.get(id).map(|p| p.matched).unwrap_or(0)
                }
            })
            .collect();
        matches.sort_unstable_by(|a, b| b.cmp(a));
        let candidate = matches[self.quorum() - 1];
        if candidate > self.log.commit_index()
            && self.log.term(candidate).map(|t| t == self.term).unwrap_or(false)
        {
            self.log.commit_to(candidate);
            // Propagate the new commit index without waiting for the next
            // heartbeat tick.
            self.bcast_append();
            return true;
        }
        false
    }

    // ------------------------------------------------------------------
    // Message handling
    // ------------------------------------------------------------------

    pub fn step(&mut self, from: NodeId, message: Message) {
        let msg_term = match &message {
            Message::Vote { term, .. }
            | Message::VoteResp { term, .. }
            | Message::Append { term, .. }
            | Message::AppendResp { term, .. }
            | Message::Snap { term, .. } => *term,
            Message::Propose { .. } => self.term,
        };
        if msg_term > self.term {
            let leader = match message {
                Message::Append { .. } | Message::Snap { .. } => from,
                _ => NO_LEADER,
            };
            self.become_follower(msg_term, leader);
        } else if msg_term < self.term {
            match message {
                Message::Vote { .. } => {
                    let term = self.term;
                    self.send(from, Message::VoteResp { term, granted: false });
                }
                Message::Append { .. } => {
                    // Tell the stale leader about the newer term.
                    let (term, index) = (self.term, self.log.last_index());
                    self.send(
                        from,
                        Message::AppendResp {
                            term,
                            index,
                            rejected: true,
                        },
                    );
                }
                _ => {}
            }
            return;
        }

        match message {
            Message::Vote {
                last_log_index,
                last_log_term,
                ..
            } => {
                let can_vote = self.vote == NO_LEADER || self.vote == from;
                let up_to_date = last_log_term > self.log.last_term()
                    || (last_log_term == self.log.last_term()
                        && last_log_index >= self.log.last_index());
                let granted = can_vote && up_to_date;
                if granted {
                    self.vote = from;
                    self.election_elapsed = 0;
                }
                let term = self.term;
                self.send(from, Message::VoteResp { term, granted });
            }
            Message::VoteResp { granted, .. } => {
                if self.role == Role::Candidate {
                    self.votes_granted.insert(from, granted);
                    if self.count_granted() >= self.quorum() {
                        self.become_leader();
                    }
                }
            }
            Message::Append {
                prev_index,
                prev_term,
                entries,
                commit,
                ..
            } => {
                if self.role != Role::Follower {
                    self.become_follower(self.term, from);
                }
                self.leader = from;
                self.election_elapsed = 0;
                let term = self.term;
                match self.log.maybe_append(prev_index, prev_term, entries, commit) {
                    Some(last) => self.send(
                        from,
                        Message::AppendResp {
                            term,
                            index: last,
                            rejected: false,
                        },
                    ),
                    None => {
                        let index = self.log.last_index();
                        self.send(
                            from,
                            Message::AppendResp {
                                term,
                                index,
                                rejected: true,
                            },
                        );
                    }
                }
            }
            Message::AppendResp {
                index, rejected, ..
            } => {
                if self.role != Role::Leader {
                    return;
                }
                let next = match self.progress.get_mut(&from) {
                    Some(pr) => {
                        if rejected {
                            pr.next = pr.next.saturating_sub(1).min(index + 1).max(1);
                        } else {
                            pr.matched = pr.matched.max(index);
                            pr.next = pr.matched + 1;
                        }
                        pr.next
                    }
                    None => return,
                };
                if rejected {
                    trace!(group_id = self.group_id, peer = from, next, "append rejected, probing");
                    self.send_append(from);
                } else {
                    let behind = next <= self.log.last_index();
                    if !self.maybe_commit() && behind {
                        self.send_append(from);
                    }
                }
            }
            Message::Snap { snapshot, .. } => {
                if self.role != Role::Follower {
                    self.become_follower(self.term, from);
                }
                self.leader = from;
                self.election_elapsed = 0;
                let term = self.term;
                if snapshot.index <= self.log.commit_index() {
                    let index = self.log.commit_index();
                    self.send(
                        from,
                        Message::AppendResp {
                            term,
                            index,
                            rejected: false,
                        },
                    );
                    return;
                }
                self.log.restore(&snapshot);
                self.nodes = snapshot.conf_state.nodes.clone();
                let index = snapshot.index;
                self.latest_snapshot = Some(snapshot.clone());
                self.pending_snapshot = Some(snapshot);
                self.send(
                    from,
                    Message::AppendResp {
                        term,
                        index,
                        rejected: false,
                    },
                );
            }
            Message::Propose {
                kind,
                command_id,
                payload,
                conf_change,
            } => {
                // Forwarded proposal; only meaningful on the leader. A
                // non-leader recipient drops it and the proposer retries.
                if self.role == Role::Leader {
                    self.propose(kind, command_id, payload, conf_change);
                }
            }
        }
    }

    /// Advance the group's logical clock by one tick.
    pub fn tick(&mut self) {
        if self.role == Role::Leader {
            self.heartbeat_elapsed += 1;
            if self.heartbeat_elapsed >= self.heartbeat_interval {
                self.heartbeat_elapsed = 0;
                self.bcast_append();
            }
        } else {
            self.election_elapsed += 1;
            if self.election_elapsed >= self.randomized_election_timeout {
                self.election_elapsed = 0;
                self.campaign();
            }
        }
    }

    /// Apply a committed, acknowledged membership change to the group's
    /// configuration.
    pub fn apply_conf_change(&mut self, change: &ConfChange) {
        match change.kind {
            ConfChangeKind::AddNode => {
                if !self.nodes.contains(&change.node_id) {
                    self.nodes.push(change.node_id);
                    if self.role == Role::Leader {
                        self.progress.insert(
                            change.node_id,
                            Progress {
                                matched: 0,
                                next: self.log.last_index() + 1,
                            },
                        );
                        self.send_append(change.node_id);
                    }
                }
            }
            ConfChangeKind::RemoveNode => {
                self.nodes.retain(|id| *id != change.node_id);
                self.progress.remove(&change.node_id);
                // Quorum may have shrunk.
                self.maybe_commit();
            }
        }
    }

    /// Truncate the in-memory log below `first_kept`.
    pub fn compact(&mut self, first_kept: u64) {
        let _ = self.log.compact(first_kept);
    }

    // ------------------------------------------------------------------
    // Ready production
    // ------------------------------------------------------------------

    pub fn has_ready(&self) -> bool {
        !self.msgs.is_empty()
            || self.pending_snapshot.is_some()
            || self.log.has_unstable()
            || self.log.has_next_committed()
            || self.hard_state() != self.prev_hard_state
    }

    pub fn take_ready(&mut self) -> Ready {
        let hard_state = self.hard_state();
        let ready = Ready {
            hard_state: (hard_state != self.prev_hard_state).then_some(hard_state),
            snapshot: self.pending_snapshot.take(),
            entries: self.log.unstable(),
            committed: self.log.next_committed(),
            messages: std::mem::take(&mut self.msgs),
            leader: self.leader,
        };
        self.prev_hard_state = hard_state;
        ready
    }
}
