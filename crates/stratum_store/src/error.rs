//! Wire-level error taxonomy.
//!
//! These errors cross process boundaries and are stored verbatim in the
//! response cache so a retried command replays the original outcome, which is
//! why the enum is serializable rather than an opaque error chain.
//!
//! Routing errors (`NotLeader`, `RangeKeyMismatch`, `RangeNotFound`) tell the
//! client to retry elsewhere; transactional errors (`TransactionRetry`,
//! `TransactionAborted`, `TransactionPush`, `WriteIntent`) tell it to retry
//! the transaction; validation errors surface as-is; `ReplicaCorruption` is
//! sticky and fatal for the replica.

use serde::{Deserialize, Serialize};

use crate::api::ReplicaDesc;
use crate::clock::Timestamp;
use crate::txn::{Intent, Transaction};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, thiserror::Error)]
pub enum RangeError {
    #[error("not leader; lease holder is {leader:?}")]
    NotLeader { leader: Option<ReplicaDesc> },

    #[error("key range outside the bounds of range {range_id}")]
    RangeKeyMismatch { range_id: u64 },

    #[error("range {range_id} was not found")]
    RangeNotFound { range_id: u64 },

    #[error("conflicting write intents")]
    WriteIntent { intents: Vec<Intent> },

    #[error("retry txn {}", txn_label(.txn))]
    TransactionRetry { txn: Transaction },

    #[error("failed to push txn {}", txn_label(.pushee))]
    TransactionPush { pushee: Transaction },

    #[error("txn aborted {}", txn_label(.txn))]
    TransactionAborted { txn: Transaction },

    #[error("txn {}: {msg}", txn_label(.txn))]
    TransactionStatus { txn: Transaction, msg: String },

    #[error("unexpected value: {actual:?}")]
    ConditionFailed { actual: Option<Vec<u8>> },

    #[error("lease rejected: proposed start {start} <= previous expiration {prev_expiration}")]
    LeaseRejected {
        start: Timestamp,
        prev_expiration: Timestamp,
    },

    #[error("replica corruption (processed={processed}): {msg}")]
    ReplicaCorruption { processed: bool, msg: String },

    /// Argument mismatches and consistency-mode violations.
    #[error("{msg}")]
    Invalid { msg: String },

    /// Decode failures and other non-routable internal errors.
    #[error("{msg}")]
    Internal { msg: String },
}

impl RangeError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        RangeError::Invalid { msg: msg.into() }
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        RangeError::Internal { msg: msg.into() }
    }
}

fn txn_label(txn: &Transaction) -> String {
    format!("\"{}\" id={}", txn.name, txn.id)
}
