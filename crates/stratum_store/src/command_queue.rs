//! Command queue: interval-based serialization of overlapping commands.
//!
//! Every admitted command occupies its key span while in flight. A new
//! command collects the wait set of earlier conflicting entries (writes
//! conflict with any overlap, reads only with writes) and may proceed once
//! all of them complete. Completion is signaled by dropping the entry's
//! channel sender, so cancellation and normal completion release waiters the
//! same way. Per-key FIFO among conflicting commands falls out of wait-set
//! collection order.

use tokio::sync::watch;

/// A queued command's span.
#[derive(Debug)]
struct QueueEntry {
    id: u64,
    start: Vec<u8>,
    end: Vec<u8>,
    read_only: bool,
    done: watch::Sender<()>,
}

/// The set of channels a new command must wait on before executing.
#[derive(Debug, Default)]
pub struct WaitSet {
    waiters: Vec<watch::Receiver<()>>,
}

impl WaitSet {
    pub fn is_empty(&self) -> bool {
        self.waiters.is_empty()
    }

    pub fn len(&self) -> usize {
        self.waiters.len()
    }

    /// Wait until every conflicting entry has been removed.
    pub async fn wait(self) {
        for mut rx in self.waiters {
            // The sender dropping (entry removed) ends the wait.
            while rx.changed().await.is_ok() {}
        }
    }
}

#[derive(Debug, Default)]
pub struct CommandQueue {
    next_id: u64,
    entries: Vec<QueueEntry>,
}

fn overlaps(a_start: &[u8], a_end: &[u8], b_start: &[u8], b_end: &[u8]) -> bool {
    a_start < b_end && b_start < a_end
}

impl CommandQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enter the queue with `[start, end)`. Returns the entry id (for
    /// `remove`) and the wait set of earlier conflicting commands.
    pub fn add(&mut self, start: &[u8], end: &[u8], read_only: bool) -> (u64, WaitSet) {
        let mut wait = WaitSet::default();
        for entry in &self.entries {
            if !overlaps(&entry.start, &entry.end, start, end) {
                continue;
            }
            // Reads conflict only with writes; writes conflict with anything.
            if read_only && entry.read_only {
                continue;
            }
            wait.waiters.push(entry.done.subscribe());
        }
        self.next_id += 1;
        let id = self.next_id;
        let (done, _) = watch::channel(());
        self.entries.push(QueueEntry {
            id,
            start: start.to_vec(),
            end: end.to_vec(),
            read_only,
            done,
        });
        (id, wait)
    }

    /// Remove an entry, releasing everything waiting on it.
    pub fn remove(&mut self, id: u64) {
        self.entries.retain(|e| e.id != id);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
