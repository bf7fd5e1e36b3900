//! In-memory raft log for a single group.
//!
//! The log owns the window of entries above the compaction floor plus the
//! commit/apply/stabilize cursors. Storage durability is handled by the
//! driver; this structure is the group's working view.

use crate::raft::types::{Entry, InitialState, LogError, Snapshot};

/// The replicated log plus its progress cursors.
///
/// Entry `entries[i]` always has index `truncated_index + 1 + i`. The term of
/// the entry at the compaction floor is retained so consistency checks keep
/// working against the first live entry.
#[derive(Debug)]
pub struct RaftLog {
    truncated_index: u64,
    truncated_term: u64,
    entries: Vec<Entry>,
    /// Highest index known committed.
    commit: u64,
    /// Highest index handed to the application.
    applied: u64,
    /// Highest index handed to persistence.
    stable: u64,
}

impl RaftLog {
    pub fn from_initial_state(state: &InitialState) -> Self {
        let (truncated_index, truncated_term) = match &state.snapshot {
            Some(snap) => (snap.index, snap.term),
            None => (0, 0),
        };
        let entries: Vec<Entry> = state
            .entries
            .iter()
            .filter(|e| e.index > truncated_index)
            .cloned()
            .collect();
        let last = truncated_index + entries.len() as u64;
        let commit = state.hard_state.commit.max(truncated_index).min(last);
        RaftLog {
            truncated_index,
            truncated_term,
            entries,
            commit,
            // Entries at or below the snapshot index are already reflected in
            // the application state.
            applied: truncated_index,
            // Initial entries came from storage and are durable already.
            stable: last,
        }
    }

    pub fn first_index(&self) -> u64 {
        self.truncated_index + 1
    }

    pub fn last_index(&self) -> u64 {
        self.truncated_index + self.entries.len() as u64
    }

    pub fn last_term(&self) -> u64 {
        self.entries
            .last()
            .map(|e| e.term)
            .unwrap_or(self.truncated_term)
    }

    pub fn commit_index(&self) -> u64 {
        self.commit
    }

    pub fn term(&self, index: u64) -> Result<u64, LogError> {
        if index == self.truncated_index {
            return Ok(self.truncated_term);
        }
        if index < self.truncated_index || index > self.last_index() {
            return Err(LogError::Unavailable);
        }
        Ok(self.entries[(index - self.truncated_index - 1) as usize].term)
    }

    fn matches(&self, index: u64, term: u64) -> bool {
        self.term(index).map(|t| t == term).unwrap_or(false)
    }

    /// Entries in `[lo, hi)`, bounded to `max` items.
    pub fn slice(&self, lo: u64, hi: u64, max: usize) -> Result<Vec<Entry>, LogError> {
        if lo <= self.truncated_index || hi > self.last_index() + 1 || lo > hi {
            return Err(LogError::Unavailable);
        }
        let start = (lo - self.truncated_index - 1) as usize;
        let end = (hi - self.truncated_index - 1) as usize;
        Ok(self.entries[start..end]
            .iter()
            .take(max)
            .cloned()
            .collect())
    }

    /// Leader-side append of freshly proposed entries. Index and term must
    /// already be assigned by the caller.
    pub fn append(&mut self, entries: Vec<Entry>) {
        debug_assert!(entries
            .first()
            .map(|e| e.index == self.last_index() + 1)
            .unwrap_or(true));
        self.entries.extend(entries);
    }

    /// Follower-side conditional append. Returns the last new index on
    /// success, `None` when the predecessor check fails.
    pub fn maybe_append(
        &mut self,
        prev_index: u64,
        prev_term: u64,
        entries: Vec<Entry>,
        leader_commit: u64,
    ) -> Option<u64> {
        if prev_index < self.truncated_index || !self.matches(prev_index, prev_term) {
            return None;
        }
        let mut last_new = prev_index + entries.len() as u64;
        for entry in entries {
            if self.matches(entry.index, entry.term) {
                continue;
            }
            // First divergence: drop our conflicting suffix and take the
            // leader's entries from here on.
            if entry.index <= self.last_index() {
                self.entries
                    .truncate((entry.index - self.truncated_index - 1) as usize);
                self.stable = self.stable.min(entry.index - 1);
            }
            debug_assert_eq!(entry.index, self.last_index() + 1);
            self.entries.push(entry);
        }
        last_new = last_new.max(self.truncated_index);
        self.commit = self.commit.max(leader_commit.min(last_new));
        Some(last_new)
    }

    /// Advance the commit cursor; never regresses.
    pub fn commit_to(&mut self, index: u64) {
        self.commit = self.commit.max(index.min(self.last_index()));
    }

    /// Committed entries not yet applied; advances the applied cursor.
    pub fn next_committed(&mut self) -> Vec<Entry> {
        if self.applied >= self.commit {
            return Vec::new();
        }
        let lo = (self.applied - self.truncated_index) as usize;
        let hi = (self.commit - self.truncated_index) as usize;
        let out: Vec<Entry> = self.entries[lo..hi].to_vec();
        self.applied = self.commit;
        out
    }

    /// Entries not yet handed to persistence; advances the stable cursor.
    pub fn unstable(&mut self) -> Vec<Entry> {
        if self.stable >= self.last_index() {
            return Vec::new();
        }
        let lo = (self.stable - self.truncated_index) as usize;
        let out: Vec<Entry> = self.entries[lo..].to_vec();
        self.stable = self.last_index();
        out
    }

    pub fn has_unstable(&self) -> bool {
        self.stable < self.last_index()
    }

    pub fn has_next_committed(&self) -> bool {
        self.applied < self.commit
    }

    /// Discard entries with index < `first_kept`, preserving the truncated
    /// entry's term. Compaction never reaches past the applied cursor.
    pub fn compact(&mut self, first_kept: u64) -> Result<(), LogError> {
        let first_kept = first_kept.min(self.applied + 1);
        if first_kept <= self.first_index() {
            return Ok(());
        }
        if first_kept > self.last_index() + 1 {
            return Err(LogError::Unavailable);
        }
        let new_truncated = first_kept - 1;
        self.truncated_term = self.term(new_truncated).map_err(|_| LogError::Unavailable)?;
        self.entries
            .drain(..(new_truncated - self.truncated_index) as usize);
        self.truncated_index = new_truncated;
        Ok(())
    }

    /// Replace the log wholesale with a snapshot.
    pub fn restore(&mut self, snapshot: &Snapshot) {
        self.truncated_index = snapshot.index;
        self.truncated_term = snapshot.term;
        self.entries.clear();
        self.commit = snapshot.index;
        self.applied = snapshot.index;
        self.stable = snapshot.index;
    }
}
