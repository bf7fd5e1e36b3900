//! MVCC-facing storage adapter.
//!
//! `MemEngine` provides versioned reads and writes at a timestamp, intent
//! records for transactional writes, an associative merge operator, and a
//! separate plain keyspace for range-local bookkeeping. All mutation for one
//! apply happens under a single write guard, which is what makes the
//! response-cache/applied-index/stats updates atomic with the command's MVCC
//! effects.

use std::collections::BTreeMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde::{Deserialize, Serialize};

use crate::api::KeyValue;
use crate::clock::Timestamp;
use crate::error::RangeError;
use crate::txn::{Intent, Transaction, TxnStatus};

/// Range-scoped MVCC statistics, updated inside each apply batch.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MvccStats {
    pub key_count: i64,
    pub key_bytes: i64,
    pub val_count: i64,
    pub val_bytes: i64,
    pub live_count: i64,
    pub intent_count: i64,
}

/// Version history of one key. The provisional version of an open intent
/// lives in `versions` at the intent's timestamp.
#[derive(Debug, Default)]
struct KeyHistory {
    intent: Option<Transaction>,
    /// `None` values are deletion tombstones.
    versions: BTreeMap<Timestamp, Option<Vec<u8>>>,
}

impl KeyHistory {
    fn latest_committed(&self, ts: Timestamp) -> Option<(&Timestamp, &Option<Vec<u8>>)> {
        let intent_ts = self.intent.as_ref().map(|t| t.timestamp);
        self.versions
            .range(..=ts)
            .rev()
            .find(|(version_ts, _)| Some(**version_ts) != intent_ts)
    }
}

#[derive(Debug, Default)]
pub struct EngineState {
    mvcc: BTreeMap<Vec<u8>, KeyHistory>,
    sys: BTreeMap<Vec<u8>, Vec<u8>>,
}

/// In-memory engine. One `RwLock` guards both keyspaces; a write guard spans
/// an entire apply batch.
#[derive(Debug, Default)]
pub struct MemEngine {
    state: RwLock<EngineState>,
}

impl MemEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn read_view(&self) -> RwLockReadGuard<'_, EngineState> {
        self.state.read().unwrap()
    }

    /// Begin an atomic batch; everything done through the guard commits
    /// together when it drops.
    pub fn write_batch(&self) -> RwLockWriteGuard<'_, EngineState> {
        self.state.write().unwrap()
    }
}

impl EngineState {
    // ------------------------------------------------------------------
    // MVCC reads
    // ------------------------------------------------------------------

    /// Read the newest visible value for `key` at `ts`. A transaction reads
    /// its own provisional writes; everyone else encountering an intent at or
    /// below `ts` gets a `WriteIntent` error unless `inconsistent`, which
    /// reads the newest committed version instead.
    pub fn mvcc_get(
        &self,
        key: &[u8],
        ts: Timestamp,
        txn: Option<&Transaction>,
        inconsistent: bool,
    ) -> Result<Option<Vec<u8>>, RangeError> {
        let Some(history) = self.mvcc.get(key) else {
            return Ok(None);
        };
        if let Some(intent) = &history.intent {
            if intent.timestamp <= ts {
                if txn.map(|t| t.id) == Some(intent.id) {
                    return Ok(history
                        .versions
                        .get(&intent.timestamp)
                        .cloned()
                        .flatten());
                }
                if !inconsistent {
                    return Err(RangeError::WriteIntent {
                        intents: vec![Intent {
                            key: key.to_vec(),
                            txn: intent.clone(),
                        }],
                    });
                }
            }
        }
        Ok(history.latest_committed(ts).and_then(|(_, v)| v.clone()))
    }

    /// Committed value and open-intent parts of one key, for callers that
    /// handle intents themselves (range lookup).
    pub fn mvcc_get_parts(
        &self,
        key: &[u8],
        ts: Timestamp,
    ) -> (Option<Vec<u8>>, Option<(Option<Vec<u8>>, Transaction)>) {
        let Some(history) = self.mvcc.get(key) else {
            return (None, None);
        };
        let committed = history.latest_committed(ts).and_then(|(_, v)| v.clone());
        let intent = history
            .intent
            .as_ref()
            .filter(|intent| intent.timestamp <= ts)
            .map(|intent| {
                (
                    history
                        .versions
                        .get(&intent.timestamp)
                        .cloned()
                        .flatten(),
                    intent.clone(),
                )
            });
        (committed, intent)
    }

    /// Keys with any version in `[start, end)`.
    pub fn mvcc_keys_in(&self, start: &[u8], end: &[u8]) -> Vec<Vec<u8>> {
        self.mvcc
            .range(start.to_vec()..end.to_vec())
            .map(|(k, _)| k.clone())
            .collect()
    }

    /// Scan visible values in `[start, end)` at `ts`, up to `max` rows
    /// (0 = unlimited). Consistent scans fail with every intent found in the
    /// span.
    pub fn mvcc_scan(
        &self,
        start: &[u8],
        end: &[u8],
        ts: Timestamp,
        txn: Option<&Transaction>,
        inconsistent: bool,
        max: u64,
    ) -> Result<Vec<KeyValue>, RangeError> {
        let mut rows = Vec::new();
        let mut intents = Vec::new();
        for (key, history) in self.mvcc.range(start.to_vec()..end.to_vec()) {
            if max != 0 && rows.len() as u64 >= max {
                break;
            }
            if let Some(intent) = &history.intent {
                let own = txn.map(|t| t.id) == Some(intent.id);
                if intent.timestamp <= ts && !own && !inconsistent {
                    intents.push(Intent {
                        key: key.clone(),
                        txn: intent.clone(),
                    });
                    continue;
                }
                if intent.timestamp <= ts && own {
                    if let Some(value) =
                        history.versions.get(&intent.timestamp).cloned().flatten()
                    {
                        rows.push(KeyValue {
                            key: key.clone(),
                            value,
                        });
                    }
                    continue;
                }
            }
            if let Some(value) = history.latest_committed(ts).and_then(|(_, v)| v.clone()) {
                rows.push(KeyValue {
                    key: key.clone(),
                    value,
                });
            }
        }
        if !intents.is_empty() {
            return Err(RangeError::WriteIntent { intents });
        }
        Ok(rows)
    }

    // ------------------------------------------------------------------
    // MVCC writes
    // ------------------------------------------------------------------

    /// Write `value` (or a tombstone) at `ts`. A transactional write lays an
    /// intent; rewrites by the same transaction replace their provisional
    /// version.
    pub fn mvcc_put(
        &mut self,
        stats: &mut MvccStats,
        key: &[u8],
        ts: Timestamp,
        value: Option<Vec<u8>>,
        txn: Option<&Transaction>,
    ) -> Result<(), RangeError> {
        if !self.mvcc.contains_key(key) {
            stats.key_count += 1;
            stats.key_bytes += key.len() as i64;
        }
        let history = self.mvcc.entry(key.to_vec()).or_default();
        let was_live = history
            .latest_committed(Timestamp::MAX)
            .map(|(_, v)| v.is_some())
            .unwrap_or(false);
        match (&history.intent, txn) {
            (Some(intent), Some(txn)) if intent.id == txn.id => {
                // Same-txn rewrite: the provisional version moves to the new
                // timestamp (restarts and pushes both land here).
                if let Some(old) = history.versions.remove(&intent.timestamp) {
                    stats.val_count -= 1;
                    stats.val_bytes -= old.map(|v| v.len() as i64).unwrap_or(0);
                }
                let mut meta = txn.clone();
                meta.timestamp = ts;
                history.intent = Some(meta);
            }
            (Some(intent), _) => {
                return Err(RangeError::WriteIntent {
                    intents: vec![Intent {
                        key: key.to_vec(),
                        txn: intent.clone(),
                    }],
                });
            }
            (None, Some(txn)) => {
                let mut meta = txn.clone();
                meta.timestamp = ts;
                history.intent = Some(meta);
                stats.intent_count += 1;
            }
            (None, None) => {}
        }
        stats.val_count += 1;
        stats.val_bytes += value.as_ref().map(|v| v.len() as i64).unwrap_or(0);
        // Provisional writes do not count as live until their txn commits.
        if txn.is_none() {
            let is_live = value.is_some();
            if is_live && !was_live {
                stats.live_count += 1;
            } else if !is_live && was_live {
                stats.live_count -= 1;
            }
        }
        history.versions.insert(ts, value);
        Ok(())
    }

    /// Associative merge: append `value` to the accumulated bytes at `key`.
    /// Merges bypass versioning; the accumulator lives below every read
    /// timestamp.
    pub fn mvcc_merge(&mut self, stats: &mut MvccStats, key: &[u8], value: &[u8]) {
        if !self.mvcc.contains_key(key) {
            stats.key_count += 1;
            stats.key_bytes += key.len() as i64;
        }
        let history = self.mvcc.entry(key.to_vec()).or_default();
        let slot = history.versions.entry(Timestamp::ZERO).or_insert_with(|| {
            stats.val_count += 1;
            stats.live_count += 1;
            Some(Vec::new())
        });
        match slot {
            Some(existing) => existing.extend_from_slice(value),
            None => *slot = Some(value.to_vec()),
        }
        stats.val_bytes += value.len() as i64;
    }

    /// Rewrite the intent at `key` owned by `txn` according to the txn's
    /// status: commit makes it visible (at the possibly-pushed timestamp),
    /// abort removes it, pending slides its timestamp forward.
    pub fn mvcc_resolve_intent(
        &mut self,
        stats: &mut MvccStats,
        key: &[u8],
        txn: &Transaction,
    ) {
        let Some(history) = self.mvcc.get_mut(key) else {
            return;
        };
        let Some(intent) = history.intent.clone() else {
            return;
        };
        if intent.id != txn.id {
            return;
        }
        match txn.status {
            TxnStatus::Committed => {
                let was_live = history
                    .latest_committed(Timestamp::MAX)
                    .map(|(_, v)| v.is_some())
                    .unwrap_or(false);
                let mut is_live = false;
                if let Some(value) = history.versions.remove(&intent.timestamp) {
                    is_live = value.is_some();
                    history.versions.insert(txn.timestamp.max(intent.timestamp), value);
                }
                history.intent = None;
                stats.intent_count -= 1;
                if is_live && !was_live {
                    stats.live_count += 1;
                } else if !is_live && was_live {
                    stats.live_count -= 1;
                }
            }
            TxnStatus::Aborted => {
                if let Some(value) = history.versions.remove(&intent.timestamp) {
                    stats.val_count -= 1;
                    stats.val_bytes -= value.as_ref().map(|v| v.len() as i64).unwrap_or(0);
                }
                history.intent = None;
                stats.intent_count -= 1;
            }
            TxnStatus::Pending => {
                if txn.timestamp > intent.timestamp {
                    if let Some(value) = history.versions.remove(&intent.timestamp) {
                        history.versions.insert(txn.timestamp, value);
                    }
                    let mut meta = intent;
                    meta.timestamp = txn.timestamp;
                    history.intent = Some(meta);
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Range-local keyspace
    // ------------------------------------------------------------------

    pub fn sys_get(&self, key: &[u8]) -> Option<&Vec<u8>> {
        self.sys.get(key)
    }

    pub fn sys_put(&mut self, key: Vec<u8>, value: Vec<u8>) {
        self.sys.insert(key, value);
    }

    pub fn sys_delete(&mut self, key: &[u8]) {
        self.sys.remove(key);
    }

    /// Drop every sys record under `prefix`.
    pub fn sys_clear_prefix(&mut self, prefix: &[u8]) {
        let keys: Vec<Vec<u8>> = self
            .sys
            .range(prefix.to_vec()..crate::keys::prefix_end(prefix))
            .map(|(k, _)| k.clone())
            .collect();
        for key in keys {
            self.sys.remove(&key);
        }
    }
}
