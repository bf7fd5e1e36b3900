//! In-memory group storage and the blockable decorator used to exercise
//! slow-persistence scenarios.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::watch;

use crate::raft::types::{
    Entry, GroupId, GroupStorage, HardState, InitialState, LogError, Snapshot, Storage,
};

#[derive(Debug, Default)]
struct MemGroupInner {
    hard_state: HardState,
    snapshot: Option<Snapshot>,
    truncated_index: u64,
    truncated_term: u64,
    entries: Vec<Entry>,
}

impl MemGroupInner {
    fn first_index(&self) -> u64 {
        self.truncated_index + 1
    }

    fn last_index(&self) -> u64 {
        self.truncated_index + self.entries.len() as u64
    }
}

/// Durable-state stand-in for one group: hard state, log entries, and the
/// latest snapshot, all behind one mutex.
#[derive(Debug, Default)]
pub struct MemGroupStorage {
    inner: Mutex<MemGroupInner>,
}

impl MemGroupStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_hard_state(&self, hard_state: HardState) {
        self.inner.lock().unwrap().hard_state = hard_state;
    }

    pub fn hard_state(&self) -> HardState {
        self.inner.lock().unwrap().hard_state
    }

    /// Install a snapshot, resetting the log to start after it.
    pub fn apply_snapshot(&self, snapshot: Snapshot) {
        let mut inner = self.inner.lock().unwrap();
        inner.truncated_index = snapshot.index;
        inner.truncated_term = snapshot.term;
        inner.entries.clear();
        inner.snapshot = Some(snapshot);
    }

    pub fn snapshot(&self) -> Option<Snapshot> {
        self.inner.lock().unwrap().snapshot.clone()
    }

    pub fn first_index(&self) -> u64 {
        self.inner.lock().unwrap().first_index()
    }

    pub fn last_index(&self) -> u64 {
        self.inner.lock().unwrap().last_index()
    }

    /// Stored entries in `[lo, hi)`.
    pub fn entries(&self, lo: u64, hi: u64) -> Result<Vec<Entry>, LogError> {
        let inner = self.inner.lock().unwrap();
        if lo <= inner.truncated_index || hi > inner.last_index() + 1 || lo > hi {
            return Err(LogError::Unavailable);
        }
        let start = (lo - inner.truncated_index - 1) as usize;
        let end = (hi - inner.truncated_index - 1) as usize;
        Ok(inner.entries[start..end].to_vec())
    }

    pub fn term(&self, index: u64) -> Result<u64, LogError> {
        let inner = self.inner.lock().unwrap();
        if index == inner.truncated_index {
            return Ok(inner.truncated_term);
        }
        if index < inner.truncated_index || index > inner.last_index() {
            return Err(LogError::Unavailable);
        }
        Ok(inner.entries[(index - inner.truncated_index - 1) as usize].term)
    }

    /// Discard entries with index < `first_kept`, preserving the truncated
    /// entry's term.
    pub fn compact(&self, first_kept: u64) -> Result<(), LogError> {
        let mut inner = self.inner.lock().unwrap();
        if first_kept <= inner.first_index() {
            return Ok(());
        }
        if first_kept > inner.last_index() + 1 {
            return Err(LogError::Unavailable);
        }
        let new_truncated = first_kept - 1;
        inner.truncated_term =
            inner.entries[(new_truncated - inner.truncated_index - 1) as usize].term;
        let drop_n = (new_truncated - inner.truncated_index) as usize;
        inner.entries.drain(..drop_n);
        inner.truncated_index = new_truncated;
        Ok(())
    }

    fn append(&self, entries: &[Entry]) {
        if entries.is_empty() {
            return;
        }
        let mut inner = self.inner.lock().unwrap();
        let first_new = entries[0].index;
        if first_new <= inner.truncated_index {
            return;
        }
        // Overwrite any conflicting suffix.
        if first_new <= inner.last_index() {
            let keep = (first_new - inner.truncated_index - 1) as usize;
            inner.entries.truncate(keep);
        }
        inner.entries.extend_from_slice(entries);
    }
}

#[async_trait]
impl GroupStorage for MemGroupStorage {
    fn initial_state(&self) -> anyhow::Result<InitialState> {
        let inner = self.inner.lock().unwrap();
        Ok(InitialState {
            hard_state: inner.hard_state,
            snapshot: inner.snapshot.clone(),
            entries: inner.entries.clone(),
        })
    }

    async fn persist(
        &self,
        hard_state: Option<HardState>,
        entries: &[Entry],
        snapshot: Option<&Snapshot>,
    ) -> anyhow::Result<()> {
        if let Some(snapshot) = snapshot {
            self.apply_snapshot(snapshot.clone());
        }
        self.append(entries);
        if let Some(hard_state) = hard_state {
            self.set_hard_state(hard_state);
        }
        Ok(())
    }
}

/// Process-wide in-memory storage: one `MemGroupStorage` per group, created
/// on demand.
#[derive(Debug, Default)]
pub struct MemStorage {
    groups: Mutex<HashMap<GroupId, Arc<MemGroupStorage>>>,
}

impl MemStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn group(&self, group_id: GroupId) -> Arc<MemGroupStorage> {
        self.groups
            .lock()
            .unwrap()
            .entry(group_id)
            .or_default()
            .clone()
    }

    pub fn remove_group(&self, group_id: GroupId) {
        self.groups.lock().unwrap().remove(&group_id);
    }
}

impl Storage for MemStorage {
    fn group_storage(&self, group_id: GroupId) -> Arc<dyn GroupStorage> {
        self.group(group_id)
    }
}

/// Storage decorator whose persistence can be gated shut. While blocked,
/// `persist` calls suspend; the driver keeps other groups live in the
/// meantime.
pub struct BlockableStorage {
    inner: Arc<dyn Storage>,
    gate: watch::Sender<bool>,
}

impl BlockableStorage {
    pub fn new(inner: Arc<dyn Storage>) -> Self {
        let (gate, _) = watch::channel(false);
        Self { inner, gate }
    }

    pub fn block(&self) {
        let _ = self.gate.send(true);
    }

    pub fn unblock(&self) {
        let _ = self.gate.send(false);
    }
}

impl Storage for BlockableStorage {
    fn group_storage(&self, group_id: GroupId) -> Arc<dyn GroupStorage> {
        Arc::new(BlockableGroupStorage {
            inner: self.inner.group_storage(group_id),
            gate: self.gate.subscribe(),
        })
    }
}

struct BlockableGroupStorage {
    inner: Arc<dyn GroupStorage>,
    gate: watch::Receiver<bool>,
}

#[async_trait]
impl GroupStorage for BlockableGroupStorage {
    fn initial_state(&self) -> anyhow::Result<InitialState> {
        self.inner.initial_state()
    }

    async fn persist(
        &self,
        hard_state: Option<HardState>,
        entries: &[Entry],
        snapshot: Option<&Snapshot>,
    ) -> anyhow::Result<()> {
        let mut gate = self.gate.clone();
        gate.wait_for(|blocked| !*blocked)
            .await
            .map_err(|_| anyhow::anyhow!("storage gate closed"))?;
        self.inner.persist(hard_state, entries, snapshot).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raft::types::EntryKind;
    use std::time::Duration;

    fn entry(term: u64, index: u64) -> Entry {
        Entry {
            term,
            index,
            kind: EntryKind::Normal,
            command_id: String::new(),
            payload: Vec::new(),
            conf_change: None,
        }
    }

    #[tokio::test]
    async fn persist_and_read_back() {
        let storage = MemStorage::new();
        let group = storage.group(1);
        group
            .persist(
                Some(HardState {
                    term: 2,
                    vote: 1,
                    commit: 2,
                }),
                &[entry(1, 1), entry(2, 2)],
                None,
            )
            .await
            .unwrap();
        assert_eq!(group.last_index(), 2);
        let state = group.initial_state().unwrap();
        assert_eq!(state.hard_state.term, 2);
        assert_eq!(state.entries.len(), 2);
    }

    #[tokio::test]
    async fn compact_semantics() {
        let storage = MemStorage::new();
        let group = storage.group(1);
        let entries: Vec<Entry> = (1..=10).map(|i| entry(1, i)).collect();
        group.persist(None, &entries, None).await.unwrap();

        group.compact(6).unwrap();
        assert_eq!(group.first_index(), 6);
        assert_eq!(group.entries(6, 10).unwrap().len(), 4);
        assert!(group.entries(5, 10).is_err());
        // The truncated entry's term is still available; older terms are gone.
        assert_eq!(group.term(5).unwrap(), 1);
        assert!(group.term(4).is_err());
    }

    #[tokio::test]
    async fn blockable_storage_gates_persistence() {
        let storage = Arc::new(MemStorage::new());
        let blockable = Arc::new(BlockableStorage::new(storage.clone()));
        blockable.block();
        let group = blockable.group_storage(1);

        let handle = tokio::spawn(async move { group.persist(None, &[entry(1, 1)], None).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!handle.is_finished());
        assert_eq!(storage.group(1).last_index(), 0);

        blockable.unblock();
        handle.await.unwrap().unwrap();
        assert_eq!(storage.group(1).last_index(), 1);
    }
}
