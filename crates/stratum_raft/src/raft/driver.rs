//! Multi-group consensus driver.
//!
//! A single actor task owns every group's state machine and multiplexes one
//! transport. Ticks, proposals, incoming messages, persistence acks, and
//! membership callbacks all funnel through the same loop, so no two of
//! `tick`/`step`/`propose`/ready-processing for a group ever run in parallel.
//!
//! Persistence is per group: each group has a writer task that applies write
//! work in order and acks back to the driver. While a group's write is
//! outstanding its inputs are backlogged, keeping every other group live even
//! when one group's storage stalls.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, warn};

use crate::raft::group::Group;
use crate::raft::transport::Transport;
use crate::raft::types::{
    CommandApplier, CommandCommittedEvent, ConfChange, Config, Entry, EntryKind, Event, GroupId,
    GroupStorage, HardState, LeaderElectionEvent, MembershipCallback, MembershipChangeEvent,
    Message, NodeId, RaftError, RaftMessage, Snapshot, Storage, Ticker, NO_LEADER,
};

/// Cloneable handle to a running driver.
#[derive(Clone)]
pub struct MultiRaft {
    node_id: NodeId,
    tx: mpsc::UnboundedSender<DriverRequest>,
}

enum DriverRequest {
    SetApplier(Arc<dyn CommandApplier>),
    CreateGroup {
        group_id: GroupId,
        ack: oneshot::Sender<anyhow::Result<()>>,
    },
    RemoveGroup {
        group_id: GroupId,
        ack: oneshot::Sender<anyhow::Result<()>>,
    },
    Submit {
        group_id: GroupId,
        kind: EntryKind,
        command_id: String,
        payload: Vec<u8>,
        conf_change: Option<ConfChange>,
        done: oneshot::Sender<Result<(), RaftError>>,
    },
    Campaign {
        group_id: GroupId,
    },
    TruncateLog {
        group_id: GroupId,
        first_kept: u64,
    },
    Stop,
}

/// Inputs deferred while a group has a write or membership callback
/// outstanding.
enum GroupInput {
    Msg(RaftMessage),
    Submit {
        kind: EntryKind,
        command_id: String,
        payload: Vec<u8>,
        conf_change: Option<ConfChange>,
        done: oneshot::Sender<Result<(), RaftError>>,
    },
    Campaign,
    Tick,
    Truncate(u64),
}

struct Proposal {
    kind: EntryKind,
    command_id: String,
    payload: Vec<u8>,
    conf_change: Option<ConfChange>,
}

struct WriteWork {
    hard_state: Option<HardState>,
    entries: Vec<Entry>,
    snapshot: Option<Snapshot>,
}

struct WriteDone {
    group_id: GroupId,
    epoch: u64,
    result: anyhow::Result<()>,
}

struct ConfDone {
    group_id: GroupId,
    epoch: u64,
    result: anyhow::Result<()>,
}

/// Portion of a `Ready` that must wait for persistence.
struct PendingReady {
    messages: Vec<RaftMessage>,
    committed: Vec<Entry>,
}

struct WaitingConf {
    change: Option<ConfChange>,
    command_id: String,
}

struct GroupState {
    raft: Group,
    epoch: u64,
    writer_tx: mpsc::UnboundedSender<WriteWork>,
    writing: bool,
    pending_ready: Option<PendingReady>,
    backlog: VecDeque<GroupInput>,
    apply_queue: VecDeque<Entry>,
    waiting_conf: Option<WaitingConf>,
    pending: HashMap<String, Vec<oneshot::Sender<Result<(), RaftError>>>>,
    unproposed: VecDeque<Proposal>,
    committed_term: u64,
}

impl GroupState {
    fn busy(&self) -> bool {
        self.writing || self.waiting_conf.is_some()
    }

    fn fail_pending(&mut self, err: RaftError) {
        for input in self.backlog.drain(..) {
            if let GroupInput::Submit { done, .. } = input {
                let _ = done.send(Err(err));
            }
        }
        for (_, waiters) in self.pending.drain() {
            for done in waiters {
                let _ = done.send(Err(err));
            }
        }
        self.unproposed.clear();
    }
}

impl MultiRaft {
    /// Start a driver for this node. Returns the handle and the event stream;
    /// the stream must be drained (directly or via `EventDemux`) or the
    /// driver will eventually suspend on a full event buffer.
    pub fn start(
        config: Config,
        transport: Arc<dyn Transport>,
        storage: Arc<dyn Storage>,
        ticker: Ticker,
    ) -> anyhow::Result<(MultiRaft, mpsc::Receiver<Event>)> {
        anyhow::ensure!(config.node_id != NO_LEADER, "node id must be non-zero");
        let incoming = transport.listen(config.node_id)?;
        let (event_tx, event_rx) = mpsc::channel(config.event_capacity.max(1));
        let (tx, requests) = mpsc::unbounded_channel();
        let (write_done_tx, write_done_rx) = mpsc::unbounded_channel();
        let (conf_done_tx, conf_done_rx) = mpsc::unbounded_channel();
        let node_id = config.node_id;
        let driver = Driver {
            node_id,
            config,
            transport,
            storage,
            applier: None,
            groups: HashMap::new(),
            requests,
            incoming,
            incoming_open: true,
            ticker,
            ticker_open: true,
            event_tx,
            write_done_tx,
            write_done_rx,
            conf_done_tx,
            conf_done_rx,
            epoch_counter: 0,
        };
        tokio::spawn(driver.run());
        Ok((MultiRaft { node_id, tx }, event_rx))
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// Install the committed-command applier. Must happen before the first
    /// group is created if committed entries are to be applied.
    pub fn set_applier(&self, applier: Arc<dyn CommandApplier>) {
        let _ = self.tx.send(DriverRequest::SetApplier(applier));
    }

    /// Create a group, reading its initial state from storage. Idempotent.
    pub async fn create_group(&self, group_id: GroupId) -> anyhow::Result<()> {
        let (ack, rx) = oneshot::channel();
        self.tx
            .send(DriverRequest::CreateGroup { group_id, ack })
            .map_err(|_| anyhow::anyhow!("multiraft driver stopped"))?;
        rx.await
            .map_err(|_| anyhow::anyhow!("multiraft driver stopped"))?
    }

    /// Remove a group, failing its in-flight proposals with `GroupDeleted`.
    pub async fn remove_group(&self, group_id: GroupId) -> anyhow::Result<()> {
        let (ack, rx) = oneshot::channel();
        self.tx
            .send(DriverRequest::RemoveGroup { group_id, ack })
            .map_err(|_| anyhow::anyhow!("multiraft driver stopped"))?;
        rx.await
            .map_err(|_| anyhow::anyhow!("multiraft driver stopped"))?
    }

    /// Fire-and-forget group creation, for use inside apply paths.
    pub fn create_group_background(&self, group_id: GroupId) {
        let (ack, _rx) = oneshot::channel();
        let _ = self.tx.send(DriverRequest::CreateGroup { group_id, ack });
    }

    /// Fire-and-forget group removal, for use inside apply paths.
    pub fn remove_group_background(&self, group_id: GroupId) {
        let (ack, _rx) = oneshot::channel();
        let _ = self.tx.send(DriverRequest::RemoveGroup { group_id, ack });
    }

    /// Submit a command. The returned channel yields `Ok(())` once the
    /// command commits locally, or an error permitting retry.
    pub fn submit_command(
        &self,
        group_id: GroupId,
        command_id: String,
        payload: Vec<u8>,
    ) -> oneshot::Receiver<Result<(), RaftError>> {
        self.submit(group_id, EntryKind::Normal, command_id, payload, None)
    }

    /// Propose a membership change, optionally carrying an application
    /// command applied alongside it.
    pub fn change_membership(
        &self,
        group_id: GroupId,
        command_id: String,
        change: ConfChange,
        payload: Vec<u8>,
    ) -> oneshot::Receiver<Result<(), RaftError>> {
        self.submit(
            group_id,
            EntryKind::ConfChange,
            command_id,
            payload,
            Some(change),
        )
    }

    fn submit(
        &self,
        group_id: GroupId,
        kind: EntryKind,
        command_id: String,
        payload: Vec<u8>,
        conf_change: Option<ConfChange>,
    ) -> oneshot::Receiver<Result<(), RaftError>> {
        let (done, rx) = oneshot::channel();
        if let Err(mpsc::error::SendError(req)) = self.tx.send(DriverRequest::Submit {
            group_id,
            kind,
            command_id,
            payload,
            conf_change,
            done,
        }) {
            if let DriverRequest::Submit { done, .. } = req {
                let _ = done.send(Err(RaftError::Stopped));
            }
        }
        rx
    }

    /// Force an election in the given group.
    pub fn campaign(&self, group_id: GroupId) {
        let _ = self.tx.send(DriverRequest::Campaign { group_id });
    }

    /// Discard the group's in-memory log below `first_kept`.
    pub fn truncate_log(&self, group_id: GroupId, first_kept: u64) {
        let _ = self.tx.send(DriverRequest::TruncateLog {
            group_id,
            first_kept,
        });
    }

    pub fn stop(&self) {
        let _ = self.tx.send(DriverRequest::Stop);
    }
}

struct Driver {
    node_id: NodeId,
    config: Config,
    transport: Arc<dyn Transport>,
    storage: Arc<dyn Storage>,
    applier: Option<Arc<dyn CommandApplier>>,
    groups: HashMap<GroupId, GroupState>,
    requests: mpsc::UnboundedReceiver<DriverRequest>,
    incoming: mpsc::UnboundedReceiver<RaftMessage>,
    incoming_open: bool,
    ticker: Ticker,
    ticker_open: bool,
    event_tx: mpsc::Sender<Event>,
    write_done_tx: mpsc::UnboundedSender<WriteDone>,
    write_done_rx: mpsc::UnboundedReceiver<WriteDone>,
    conf_done_tx: mpsc::UnboundedSender<ConfDone>,
    conf_done_rx: mpsc::UnboundedReceiver<ConfDone>,
    epoch_counter: u64,
}

impl Driver {
    async fn run(mut self) {
        loop {
            tokio::select! {
                biased;
                done = self.write_done_rx.recv() => {
                    // The driver holds a sender clone, so this never closes.
                    if let Some(done) = done {
                        self.handle_write_done(done).await;
                    }
                }
                done = self.conf_done_rx.recv() => {
                    if let Some(done) = done {
                        self.handle_conf_done(done).await;
                    }
                }
                req = self.requests.recv() => {
                    match req {
                        Some(DriverRequest::Stop) | None => {
                            self.shutdown();
                            return;
                        }
                        Some(req) => self.handle_request(req).await,
                    }
                }
                msg = self.incoming.recv(), if self.incoming_open => {
                    match msg {
                        Some(msg) => self.handle_message(msg).await,
                        None => self.incoming_open = false,
                    }
                }
                tick = self.ticker.rx.recv(), if self.ticker_open => {
                    match tick {
                        Some(()) => self.handle_tick().await,
                        None => self.ticker_open = false,
                    }
                }
            }
        }
    }

    fn shutdown(&mut self) {
        for (_, group) in self.groups.iter_mut() {
            group.fail_pending(RaftError::Stopped);
        }
        self.groups.clear();
        self.transport.stop(self.node_id);
    }

    async fn handle_request(&mut self, req: DriverRequest) {
        match req {
            DriverRequest::SetApplier(applier) => self.applier = Some(applier),
            DriverRequest::CreateGroup { group_id, ack } => {
                let result = self.create_group(group_id);
                let _ = ack.send(result);
                self.advance(group_id).await;
            }
            DriverRequest::RemoveGroup { group_id, ack } => {
                if let Some(mut group) = self.groups.remove(&group_id) {
                    group.fail_pending(RaftError::GroupDeleted);
                    debug!(group_id, "removed raft group");
                }
                let _ = ack.send(Ok(()));
            }
            DriverRequest::Submit {
                group_id,
                kind,
                command_id,
                payload,
                conf_change,
                done,
            } => {
                if !self.groups.contains_key(&group_id) {
                    let _ = done.send(Err(RaftError::GroupDeleted));
                    return;
                }
                self.feed(
                    group_id,
                    GroupInput::Submit {
                        kind,
                        command_id,
                        payload,
                        conf_change,
                        done,
                    },
                )
                .await;
            }
            DriverRequest::Campaign { group_id } => {
                self.feed(group_id, GroupInput::Campaign).await;
            }
            DriverRequest::TruncateLog {
                group_id,
                first_kept,
            } => {
                self.feed(group_id, GroupInput::Truncate(first_kept)).await;
            }
            DriverRequest::Stop => unreachable!("handled by the run loop"),
        }
    }

    fn create_group(&mut self, group_id: GroupId) -> anyhow::Result<()> {
        if self.groups.contains_key(&group_id) {
            // Create/remove/create cycles hit this path; matching state makes
            // creation a no-op.
            return Ok(());
        }
        let storage = self.storage.group_storage(group_id);
        let initial = storage.initial_state()?;
        let raft = Group::new(
            group_id,
            self.node_id,
            self.config.election_timeout_ticks,
            self.config.heartbeat_interval_ticks,
            self.config.max_entries_per_append,
            &initial,
        );
        self.epoch_counter += 1;
        let epoch = self.epoch_counter;
        let writer_tx = spawn_writer(group_id, epoch, storage, self.write_done_tx.clone());
        self.groups.insert(
            group_id,
            GroupState {
                raft,
                epoch,
                writer_tx,
                writing: false,
                pending_ready: None,
                backlog: VecDeque::new(),
                apply_queue: VecDeque::new(),
                waiting_conf: None,
                pending: HashMap::new(),
                unproposed: VecDeque::new(),
                committed_term: initial.hard_state.term,
            },
        );
        debug!(group_id, node_id = self.node_id, "created raft group");
        Ok(())
    }

    async fn handle_message(&mut self, msg: RaftMessage) {
        // Groups are created on demand for incoming messages; this is how a
        // replica learns about a group it was just added to.
        if !self.groups.contains_key(&msg.group_id) {
            if let Err(err) = self.create_group(msg.group_id) {
                warn!(group_id = msg.group_id, error = ?err, "failed to create group on demand");
                return;
            }
        }
        let group_id = msg.group_id;
        self.feed(group_id, GroupInput::Msg(msg)).await;
    }

    async fn handle_tick(&mut self) {
        let ids: Vec<GroupId> = self.groups.keys().copied().collect();
        for group_id in ids {
            self.feed(group_id, GroupInput::Tick).await;
        }
    }

    /// Queue one input for a group and drive it as far as possible.
    async fn feed(&mut self, group_id: GroupId, input: GroupInput) {
        let Some(group) = self.groups.get_mut(&group_id) else {
            if let GroupInput::Submit { done, .. } = input {
                let _ = done.send(Err(RaftError::GroupDeleted));
            }
            return;
        };
        group.backlog.push_back(input);
        self.advance(group_id).await;
    }

    /// Drive a group until it blocks on a write, a membership callback, or
    /// runs out of work.
    async fn advance(&mut self, group_id: GroupId) {
        enum Step {
            Input(GroupInput),
            Propose(Proposal),
            Write(WriteWork),
            Rest(PendingReady),
            Apply,
            Done,
        }
        loop {
            let step = {
                let Some(group) = self.groups.get_mut(&group_id) else {
                    return;
                };
                if group.busy() {
                    return;
                }
                if !group.apply_queue.is_empty() {
                    Step::Apply
                } else if let Some(input) = group.backlog.pop_front() {
                    Step::Input(input)
                } else if group.raft.leader() != NO_LEADER && !group.unproposed.is_empty() {
                    Step::Propose(group.unproposed.pop_front().expect("non-empty"))
                } else if group.raft.has_ready() {
                    let ready = group.raft.take_ready();
                    let rest = PendingReady {
                        messages: ready.messages,
                        committed: ready.committed,
                    };
                    if ready.hard_state.is_some()
                        || !ready.entries.is_empty()
                        || ready.snapshot.is_some()
                    {
                        group.writing = true;
                        group.pending_ready = Some(rest);
                        Step::Write(WriteWork {
                            hard_state: ready.hard_state,
                            entries: ready.entries,
                            snapshot: ready.snapshot,
                        })
                    } else {
                        Step::Rest(rest)
                    }
                } else {
                    Step::Done
                }
            };
            match step {
                Step::Input(input) => self.apply_input(group_id, input),
                Step::Propose(proposal) => self.try_propose(group_id, proposal),
                Step::Write(work) => {
                    if let Some(group) = self.groups.get(&group_id) {
                        if group.writer_tx.send(work).is_err() {
                            error!(group_id, "group writer task is gone");
                        }
                    }
                }
                Step::Rest(rest) => self.process_rest(group_id, rest).await,
                Step::Apply => self.drain_apply(group_id).await,
                Step::Done => return,
            }
        }
    }

    fn apply_input(&mut self, group_id: GroupId, input: GroupInput) {
        let Some(group) = self.groups.get_mut(&group_id) else {
            return;
        };
        match input {
            GroupInput::Msg(msg) => group.raft.step(msg.from, msg.message),
            GroupInput::Tick => group.raft.tick(),
            GroupInput::Campaign => group.raft.campaign(),
            GroupInput::Truncate(first_kept) => group.raft.compact(first_kept),
            GroupInput::Submit {
                kind,
                command_id,
                payload,
                conf_change,
                done,
            } => {
                group
                    .pending
                    .entry(command_id.clone())
                    .or_default()
                    .push(done);
                self.try_propose(
                    group_id,
                    Proposal {
                        kind,
                        command_id,
                        payload,
                        conf_change,
                    },
                );
            }
        }
    }

    fn try_propose(&mut self, group_id: GroupId, proposal: Proposal) {
        let Some(group) = self.groups.get_mut(&group_id) else {
            return;
        };
        if group.raft.is_leader() {
            group.raft.propose(
                proposal.kind,
                proposal.command_id,
                proposal.payload,
                proposal.conf_change,
            );
            return;
        }
        let leader = group.raft.leader();
        if leader == NO_LEADER {
            // Held until an election resolves.
            group.unproposed.push_back(proposal);
            return;
        }
        let msg = RaftMessage {
            group_id,
            from: self.node_id,
            to: leader,
            message: Message::Propose {
                kind: proposal.kind,
                command_id: proposal.command_id,
                payload: proposal.payload,
                conf_change: proposal.conf_change,
            },
        };
        if let Err(err) = self.transport.send(msg) {
            debug!(group_id, error = ?err, "failed to forward proposal to leader");
        }
    }

    async fn handle_write_done(&mut self, done: WriteDone) {
        let rest = {
            let Some(group) = self.groups.get_mut(&done.group_id) else {
                return;
            };
            if group.epoch != done.epoch {
                return;
            }
            group.writing = false;
            if let Err(err) = done.result {
                // Losing durable state mid-flight leaves the group unusable;
                // fail its callers and take it out of service.
                error!(group_id = done.group_id, error = ?err, "raft storage write failed");
                group.fail_pending(RaftError::GroupDeleted);
                self.groups.remove(&done.group_id);
                return;
            }
            group.pending_ready.take()
        };
        if let Some(rest) = rest {
            self.process_rest(done.group_id, rest).await;
        }
        self.advance(done.group_id).await;
    }

    /// Post-persistence half of ready processing: transmit messages, emit the
    /// election event if the committed term advanced, and hand committed
    /// entries to the apply queue.
    async fn process_rest(&mut self, group_id: GroupId, rest: PendingReady) {
        for msg in rest.messages {
            if let Err(err) = self.transport.send(msg) {
                debug!(group_id, error = ?err, "dropping outbound raft message");
            }
        }
        if rest.committed.is_empty() {
            return;
        }
        let last_term = rest.committed.last().expect("non-empty").term;
        let election = {
            let Some(group) = self.groups.get_mut(&group_id) else {
                return;
            };
            let leader = group.raft.leader();
            let fire = last_term > group.committed_term && leader != NO_LEADER;
            if fire {
                group.committed_term = last_term;
            }
            group.apply_queue.extend(rest.committed);
            fire.then_some(leader)
        };
        if let Some(leader) = election {
            self.emit(Event::LeaderElection(LeaderElectionEvent {
                group_id,
                leader,
                term: last_term,
            }))
            .await;
        }
        self.drain_apply(group_id).await;
    }

    /// Apply queued committed entries in order, pausing at membership
    /// changes until their callback completes.
    async fn drain_apply(&mut self, group_id: GroupId) {
        loop {
            let (entry, waiters) = {
                let Some(group) = self.groups.get_mut(&group_id) else {
                    return;
                };
                if group.waiting_conf.is_some() {
                    return;
                }
                let Some(entry) = group.apply_queue.pop_front() else {
                    return;
                };
                let waiters = group.pending.remove(&entry.command_id);
                (entry, waiters)
            };
            match entry.kind {
                EntryKind::Normal => {
                    if entry.command_id.is_empty() {
                        // Leader no-op.
                        continue;
                    }
                    if let Some(applier) = self.applier.clone() {
                        applier.apply_command(
                            group_id,
                            entry.index,
                            &entry.command_id,
                            &entry.payload,
                        );
                    }
                    self.emit(Event::CommandCommitted(CommandCommittedEvent {
                        group_id,
                        command_id: entry.command_id,
                        payload: entry.payload,
                    }))
                    .await;
                    for done in waiters.unwrap_or_default() {
                        let _ = done.send(Ok(()));
                    }
                }
                EntryKind::ConfChange => {
                    let change = entry.conf_change.clone();
                    let Some(conf) = change else {
                        warn!(group_id, index = entry.index, "conf change entry without change");
                        continue;
                    };
                    // Commands riding on the change apply with it.
                    if !entry.command_id.is_empty() && !entry.payload.is_empty() {
                        if let Some(applier) = self.applier.clone() {
                            applier.apply_command(
                                group_id,
                                entry.index,
                                &entry.command_id,
                                &entry.payload,
                            );
                        }
                    }
                    let epoch = {
                        let Some(group) = self.groups.get_mut(&group_id) else {
                            return;
                        };
                        // Waiters resolve when the callback completes.
                        if let Some(waiters) = waiters {
                            group
                                .pending
                                .insert(entry.command_id.clone(), waiters);
                        }
                        group.waiting_conf = Some(WaitingConf {
                            change: Some(conf.clone()),
                            command_id: entry.command_id.clone(),
                        });
                        group.epoch
                    };
                    let (tx, rx) = oneshot::channel();
                    let conf_done_tx = self.conf_done_tx.clone();
                    tokio::spawn(async move {
                        // A dropped callback counts as acceptance; refusing
                        // forever would wedge the group.
                        let result = rx.await.unwrap_or(Ok(()));
                        let _ = conf_done_tx.send(ConfDone {
                            group_id,
                            epoch,
                            result,
                        });
                    });
                    self.emit(Event::MembershipChangeCommitted(MembershipChangeEvent {
                        group_id,
                        command_id: entry.command_id,
                        kind: conf.kind,
                        node_id: conf.node_id,
                        callback: MembershipCallback::new(tx),
                    }))
                    .await;
                    return;
                }
            }
        }
    }

    async fn handle_conf_done(&mut self, done: ConfDone) {
        let waiters = {
            let Some(group) = self.groups.get_mut(&done.group_id) else {
                return;
            };
            if group.epoch != done.epoch {
                return;
            }
            let Some(mut waiting) = group.waiting_conf.take() else {
                return;
            };
            match done.result {
                Ok(()) => {
                    if let Some(change) = waiting.change.take() {
                        group.raft.apply_conf_change(&change);
                    }
                }
                Err(err) => {
                    warn!(group_id = done.group_id, error = ?err, "membership change refused by consumer");
                }
            }
            group.pending.remove(&waiting.command_id)
        };
        for done_tx in waiters.unwrap_or_default() {
            let _ = done_tx.send(Ok(()));
        }
        self.drain_apply(done.group_id).await;
        self.advance(done.group_id).await;
    }

    async fn emit(&self, event: Event) {
        // Bounded channel: a consumer that stops draining eventually
        // suspends the driver rather than growing memory without bound.
        let _ = self.event_tx.send(event).await;
    }
}

fn spawn_writer(
    group_id: GroupId,
    epoch: u64,
    storage: Arc<dyn GroupStorage>,
    done_tx: mpsc::UnboundedSender<WriteDone>,
) -> mpsc::UnboundedSender<WriteWork> {
    let (tx, mut rx) = mpsc::unbounded_channel::<WriteWork>();
    tokio::spawn(async move {
        while let Some(work) = rx.recv().await {
            let result = storage
                .persist(work.hard_state, &work.entries, work.snapshot.as_ref())
                .await;
            if done_tx
                .send(WriteDone {
                    group_id,
                    epoch,
                    result,
                })
                .is_err()
            {
                return;
            }
        }
    });
    tx
}
