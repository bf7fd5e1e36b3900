//! Command request/response envelope.
//!
//! Every client command is a `Request`: a header carrying routing, timestamp,
//! txn, idempotence id, and consistency mode, plus one body variant per
//! operation. Bodies are an exhaustive tagged union so a new request kind
//! cannot silently bypass admission checks.

use serde::{Deserialize, Serialize};

use crate::clock::Timestamp;
use crate::keys;
use crate::txn::{PushTxnType, Transaction};

/// Identity of one replica: a `(node_id, store_id)` pair. Packed into a
/// single integer to index consensus peers.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReplicaDesc {
    pub node_id: u64,
    pub store_id: u64,
}

impl ReplicaDesc {
    pub fn new(node_id: u64, store_id: u64) -> Self {
        ReplicaDesc { node_id, store_id }
    }

    /// The packed consensus peer id.
    pub fn raft_node_id(&self) -> u64 {
        (self.node_id << 32) | (self.store_id & 0xffff_ffff)
    }

    pub fn from_raft_node_id(raft_node_id: u64) -> Self {
        ReplicaDesc {
            node_id: raft_node_id >> 32,
            store_id: raft_node_id & 0xffff_ffff,
        }
    }
}

/// Descriptor of one range: a contiguous key interval and its replica set.
/// Immutable within an epoch; replaced atomically on split/merge/membership
/// change.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RangeDescriptor {
    pub range_id: u64,
    pub start_key: Vec<u8>,
    pub end_key: Vec<u8>,
    pub replicas: Vec<ReplicaDesc>,
}

impl RangeDescriptor {
    pub fn contains_key(&self, key: &[u8]) -> bool {
        key >= self.start_key.as_slice() && key < self.end_key.as_slice()
    }

    /// Whether `[start, end)` lies entirely inside the range. An empty `end`
    /// means a point request at `start`.
    pub fn contains_key_range(&self, start: &[u8], end: &[u8]) -> bool {
        if end.is_empty() {
            return self.contains_key(start);
        }
        start >= self.start_key.as_slice() && end <= self.end_key.as_slice() && start <= end
    }

    pub fn replica_for_store(&self, store_id: u64) -> Option<&ReplicaDesc> {
        self.replicas.iter().find(|r| r.store_id == store_id)
    }

    pub fn replica_by_raft_id(&self, raft_node_id: u64) -> Option<&ReplicaDesc> {
        self.replicas
            .iter()
            .find(|r| r.raft_node_id() == raft_node_id)
    }
}

/// Time-bounded authorization for one replica to serve reads and propose
/// writes. Leases for the same range never overlap across holders.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub start: Timestamp,
    pub expiration: Timestamp,
    /// Packed replica id of the holder.
    pub holder: u64,
}

impl Lease {
    /// Whether the lease authorizes commands at `timestamp`.
    pub fn covers(&self, timestamp: Timestamp) -> bool {
        timestamp >= self.start && timestamp < self.expiration
    }
}

/// Client-chosen idempotence id. A zero id opts out of the response cache.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CommandId {
    pub wall_time: i64,
    pub random: i64,
}

impl CommandId {
    pub fn is_empty(&self) -> bool {
        self.wall_time == 0 && self.random == 0
    }

    pub fn random() -> Self {
        CommandId {
            wall_time: 1,
            random: rand::random::<i64>(),
        }
    }

    /// Stable string form used as the consensus-level command id.
    pub fn key(&self) -> String {
        format!("{:x}.{:x}", self.wall_time, self.random)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReadConsistency {
    #[default]
    Consistent,
    Inconsistent,
    Consensus,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RequestHeader {
    pub range_id: u64,
    /// Addressed replica; only the store id participates in routing.
    pub replica: ReplicaDesc,
    pub key: Vec<u8>,
    /// Empty for point requests.
    pub end_key: Vec<u8>,
    pub timestamp: Timestamp,
    pub txn: Option<Transaction>,
    pub command_id: CommandId,
    pub read_consistency: ReadConsistency,
    pub user_priority: i32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplicaChangeType {
    Add,
    Remove,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum RequestBody {
    Get,
    Put {
        value: Vec<u8>,
    },
    ConditionalPut {
        value: Vec<u8>,
        /// `None` demands that no value exist.
        exp_value: Option<Vec<u8>>,
    },
    Increment {
        increment: i64,
    },
    Delete,
    Scan {
        max_results: u64,
    },
    EndTransaction {
        commit: bool,
    },
    HeartbeatTxn,
    PushTxn {
        pushee: Transaction,
        push_type: PushTxnType,
        /// Pusher-supplied wall clock reading used for liveness checks.
        now: Timestamp,
    },
    ResolveIntent,
    ResolveIntentRange,
    Merge {
        value: Vec<u8>,
    },
    RangeLookup {
        max_ranges: u64,
        ignore_intents: bool,
    },
    TruncateLog {
        index: u64,
    },
    AdminSplit {
        split_key: Vec<u8>,
    },
    AdminMerge,
    LeaderLease {
        lease: Lease,
    },
    ChangeReplicas {
        change_type: ReplicaChangeType,
        replica: ReplicaDesc,
    },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub header: RequestHeader,
    pub body: RequestBody,
}

impl Request {
    /// Read-only commands execute locally under the lease and never propose.
    pub fn is_read_only(&self) -> bool {
        matches!(
            self.body,
            RequestBody::Get | RequestBody::Scan { .. } | RequestBody::RangeLookup { .. }
        )
    }

    /// Admin commands are routed outside the regular read/write paths.
    pub fn is_admin(&self) -> bool {
        matches!(
            self.body,
            RequestBody::AdminSplit { .. }
                | RequestBody::AdminMerge
                | RequestBody::ChangeReplicas { .. }
        )
    }

    /// The key span this command owns while queued: `[key, end_key)`, with
    /// point requests widened to a single-key span.
    pub fn span(&self) -> (Vec<u8>, Vec<u8>) {
        let start = self.header.key.clone();
        let end = if self.header.end_key.is_empty() {
            keys::next_key(&start)
        } else {
            self.header.end_key.clone()
        };
        (start, end)
    }

    pub fn txn_id(&self) -> Option<uuid::Uuid> {
        self.header.txn.as_ref().map(|t| t.id)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyValue {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum ResponseBody {
    Get {
        value: Option<Vec<u8>>,
    },
    Put,
    ConditionalPut,
    Increment {
        new_value: i64,
    },
    Delete,
    Scan {
        rows: Vec<KeyValue>,
    },
    EndTransaction {
        txn: Transaction,
    },
    HeartbeatTxn {
        txn: Transaction,
    },
    PushTxn {
        pushee_txn: Transaction,
    },
    ResolveIntent,
    ResolveIntentRange,
    Merge,
    RangeLookup {
        ranges: Vec<RangeDescriptor>,
    },
    TruncateLog,
    AdminSplit {
        left_range_id: u64,
        right_range_id: u64,
    },
    AdminMerge,
    LeaderLease,
    ChangeReplicas,
}

/// Reply to a command. `timestamp` is the (possibly forwarded) execution
/// timestamp.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub timestamp: Timestamp,
    pub body: ResponseBody,
}

/// The unit proposed into consensus: the originating replica (for the
/// apply-time lease guard) plus the full request.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RaftCommand {
    pub origin: ReplicaDesc,
    pub request: Request,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replica_id_packs_and_unpacks() {
        let replica = ReplicaDesc::new(3, 7);
        let packed = replica.raft_node_id();
        assert_eq!(packed, (3 << 32) | 7);
        assert_eq!(ReplicaDesc::from_raft_node_id(packed), replica);
    }

    #[test]
    fn descriptor_bounds() {
        let desc = RangeDescriptor {
            range_id: 1,
            start_key: b"b".to_vec(),
            end_key: b"m".to_vec(),
            replicas: vec![ReplicaDesc::new(1, 1)],
        };
        assert!(desc.contains_key(b"b"));
        assert!(desc.contains_key(b"c"));
        assert!(!desc.contains_key(b"m"));
        assert!(!desc.contains_key(b"a"));
        assert!(desc.contains_key_range(b"b", b"m"));
        assert!(!desc.contains_key_range(b"a", b"c"));
        assert!(!desc.contains_key_range(b"c", b"z"));
        // Point request form.
        assert!(desc.contains_key_range(b"c", b""));
    }

    #[test]
    fn lease_coverage_is_half_open() {
        let lease = Lease {
            start: Timestamp::new(10, 0),
            expiration: Timestamp::new(20, 0),
            holder: 1,
        };
        assert!(!lease.covers(Timestamp::new(9, 9)));
        assert!(lease.covers(Timestamp::new(10, 0)));
        assert!(lease.covers(Timestamp::new(19, i32::MAX)));
        assert!(!lease.covers(Timestamp::new(20, 0)));
    }

    #[test]
    fn command_id_zero_is_empty() {
        assert!(CommandId::default().is_empty());
        assert!(!CommandId::random().is_empty());
    }
}
