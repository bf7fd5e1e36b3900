//! Transaction records and conflict rules.
//!
//! A transaction record lives under a key derived from the txn's initial key
//! and id. Record mutations are monotonic in epoch and, within an epoch,
//! monotonic in timestamp; pushes resolve conflicts between transactions by
//! priority, age, and heartbeat liveness.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::clock::Timestamp;

/// Interval at which a live transaction coordinator heartbeats its record.
pub const DEFAULT_HEARTBEAT_INTERVAL_NS: i64 = 5_000_000_000;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxnStatus {
    Pending,
    Committed,
    Aborted,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Isolation {
    Serializable,
    Snapshot,
}

/// Kinds of transaction pushes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PushTxnType {
    /// Move the pushee's timestamp past the pusher's (read/write conflict).
    PushTimestamp,
    /// Abort the pushee (write/write conflict).
    AbortTxn,
    /// Clean up a suspected-abandoned txn; only wins on heartbeat timeout.
    CleanupTxn,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: Uuid,
    pub name: String,
    pub key: Vec<u8>,
    pub epoch: i32,
    pub priority: i32,
    pub isolation: Isolation,
    pub status: TxnStatus,
    pub timestamp: Timestamp,
    pub last_heartbeat: Option<Timestamp>,
}

impl Transaction {
    pub fn new(
        name: &str,
        key: &[u8],
        user_priority: i32,
        isolation: Isolation,
        timestamp: Timestamp,
    ) -> Self {
        Transaction {
            id: Uuid::new_v4(),
            name: name.to_string(),
            key: key.to_vec(),
            epoch: 0,
            priority: user_priority.max(1),
            isolation,
            status: TxnStatus::Pending,
            timestamp,
            last_heartbeat: None,
        }
    }

    /// Fold a newer view of the same transaction into this record: epoch and
    /// timestamp only move forward, backwards updates are silently ignored.
    pub fn upgrade(&mut self, other: &Transaction) {
        if other.epoch > self.epoch {
            self.epoch = other.epoch;
        }
        if other.timestamp > self.timestamp {
            self.timestamp = other.timestamp;
        }
        if other.priority > self.priority {
            self.priority = other.priority;
        }
    }

    /// Whether the record's coordinator is presumed dead: no heartbeat within
    /// twice the heartbeat interval of `now`. The record's own timestamp
    /// stands in for a heartbeat that was never written.
    pub fn heartbeat_expired(&self, now: Timestamp) -> bool {
        let base = self.last_heartbeat.unwrap_or(self.timestamp);
        base.add(2 * DEFAULT_HEARTBEAT_INTERVAL_NS, 0) < now
    }
}

/// A provisional MVCC write owned by a transaction.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Intent {
    pub key: Vec<u8>,
    pub txn: Transaction,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn txn_at(ts: Timestamp) -> Transaction {
        Transaction::new("test", b"a", 1, Isolation::Serializable, ts)
    }

    #[test]
    fn upgrade_is_forward_only() {
        let mut record = txn_at(Timestamp::new(2, 0));
        record.epoch = 1;

        let mut newer = record.clone();
        newer.epoch = 0;
        newer.timestamp = Timestamp::new(1, 0);
        record.upgrade(&newer);
        assert_eq!(record.epoch, 1);
        assert_eq!(record.timestamp, Timestamp::new(2, 0));

        newer.epoch = 2;
        newer.timestamp = Timestamp::new(3, 0);
        record.upgrade(&newer);
        assert_eq!(record.epoch, 2);
        assert_eq!(record.timestamp, Timestamp::new(3, 0));
    }

    #[test]
    fn heartbeat_expiry_is_strict() {
        let ns = DEFAULT_HEARTBEAT_INTERVAL_NS;
        let mut record = txn_at(Timestamp::new(0, 0));
        record.last_heartbeat = Some(Timestamp::new(1, 0));
        assert!(!record.heartbeat_expired(Timestamp::new(2 * ns + 1, 0)));
        assert!(record.heartbeat_expired(Timestamp::new(2 * ns + 2, 0)));

        // Without a heartbeat, the txn timestamp is the liveness base.
        let record = txn_at(Timestamp::new(0, 1));
        assert!(!record.heartbeat_expired(Timestamp::new(2 * ns, 0)));
        assert!(record.heartbeat_expired(Timestamp::new(2 * ns + 1, 0)));
    }
}
