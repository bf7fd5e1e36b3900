//! Command execution against the MVCC engine.
//!
//! Read-only commands run against a read view on the serving replica; write
//! commands run inside the apply batch on every replica. Both paths share
//! the request envelope, so execution here never consults replica state
//! beyond the engine.

use rand::Rng;

use crate::api::{RangeDescriptor, Request, RequestBody, ResponseBody};
use crate::clock::Timestamp;
use crate::engine::{EngineState, MvccStats};
use crate::error::RangeError;
use crate::keys;
use crate::txn::{PushTxnType, Transaction, TxnStatus};

fn inconsistent(req: &Request) -> bool {
    matches!(
        req.header.read_consistency,
        crate::api::ReadConsistency::Inconsistent
    )
}

/// Execute a read-only command against a consistent view of the engine.
pub fn execute_read(engine: &EngineState, req: &Request) -> Result<ResponseBody, RangeError> {
    match &req.body {
        RequestBody::Get => {
            let value = engine.mvcc_get(
                &req.header.key,
                req.header.timestamp,
                req.header.txn.as_ref(),
                inconsistent(req),
            )?;
            Ok(ResponseBody::Get { value })
        }
        RequestBody::Scan { max_results } => {
            let (start, end) = req.span();
            let rows = engine.mvcc_scan(
                &start,
                &end,
                req.header.timestamp,
                req.header.txn.as_ref(),
                inconsistent(req),
                *max_results,
            )?;
            Ok(ResponseBody::Scan { rows })
        }
        RequestBody::RangeLookup {
            max_ranges,
            ignore_intents,
        } => range_lookup(engine, req, *max_ranges, *ignore_intents),
        other => Err(RangeError::internal(format!(
            "{other:?} is not a read-only command"
        ))),
    }
}

/// Execute a mutating command inside the apply batch.
pub fn execute_write(
    engine: &mut EngineState,
    stats: &mut MvccStats,
    req: &Request,
) -> Result<ResponseBody, RangeError> {
    let ts = req.header.timestamp;
    let txn = req.header.txn.as_ref();
    match &req.body {
        RequestBody::Put { value } => {
            engine.mvcc_put(stats, &req.header.key, ts, Some(value.clone()), txn)?;
            Ok(ResponseBody::Put)
        }
        RequestBody::ConditionalPut { value, exp_value } => {
            let actual = engine.mvcc_get(&req.header.key, ts, txn, false)?;
            if actual != *exp_value {
                return Err(RangeError::ConditionFailed { actual });
            }
            engine.mvcc_put(stats, &req.header.key, ts, Some(value.clone()), txn)?;
            Ok(ResponseBody::ConditionalPut)
        }
        RequestBody::Increment { increment } => {
            let current = match engine.mvcc_get(&req.header.key, ts, txn, false)? {
                None => 0,
                Some(bytes) => i64::from_le_bytes(bytes.try_into().map_err(|_| {
                    RangeError::invalid("increment on a non-integer value")
                })?),
            };
            let new_value = current.wrapping_add(*increment);
            engine.mvcc_put(
                stats,
                &req.header.key,
                ts,
                Some(new_value.to_le_bytes().to_vec()),
                txn,
            )?;
            Ok(ResponseBody::Increment { new_value })
        }
        RequestBody::Delete => {
            engine.mvcc_put(stats, &req.header.key, ts, None, txn)?;
            Ok(ResponseBody::Delete)
        }
        RequestBody::Merge { value } => {
            engine.mvcc_merge(stats, &req.header.key, value);
            Ok(ResponseBody::Merge)
        }
        RequestBody::EndTransaction { commit } => end_transaction(engine, req, *commit),
        RequestBody::HeartbeatTxn => heartbeat_txn(engine, req),
        RequestBody::PushTxn {
            pushee,
            push_type,
            now,
        } => push_txn(engine, req, pushee, *push_type, *now),
        RequestBody::ResolveIntent => {
            let txn = txn.ok_or_else(|| {
                RangeError::invalid("ResolveIntent requires a transaction")
            })?;
            engine.mvcc_resolve_intent(stats, &req.header.key, txn);
            Ok(ResponseBody::ResolveIntent)
        }
        RequestBody::ResolveIntentRange => {
            let txn = txn.ok_or_else(|| {
                RangeError::invalid("ResolveIntentRange requires a transaction")
            })?;
            let (start, end) = req.span();
            for key in engine.mvcc_keys_in(&start, &end) {
                engine.mvcc_resolve_intent(stats, &key, txn);
            }
            Ok(ResponseBody::ResolveIntentRange)
        }
        other => Err(RangeError::internal(format!(
            "{other:?} is not executed through the command layer"
        ))),
    }
}

// ---------------------------------------------------------------------
// Transaction records
// ---------------------------------------------------------------------

fn read_txn_record(engine: &EngineState, key: &[u8], id: uuid::Uuid) -> Option<Transaction> {
    let bytes = engine.sys_get(&keys::transaction_key(key, id))?;
    serde_json::from_slice(bytes).ok()
}

fn write_txn_record(engine: &mut EngineState, record: &Transaction) {
    let key = keys::transaction_key(&record.key, record.id);
    let bytes = serde_json::to_vec(record).expect("txn records serialize");
    engine.sys_put(key, bytes);
}

/// Commit or abort a transaction record.
///
/// The record only ever moves forward: regressions in epoch or timestamp are
/// errors, and a SERIALIZABLE commit whose timestamp was pushed past the
/// txn's own must retry. SNAPSHOT commits at the pushed timestamp, and an
/// abort always succeeds.
fn end_transaction(
    engine: &mut EngineState,
    req: &Request,
    commit: bool,
) -> Result<ResponseBody, RangeError> {
    let txn = req
        .header
        .txn
        .as_ref()
        .ok_or_else(|| RangeError::invalid("EndTransaction requires a transaction"))?;
    let existing = read_txn_record(engine, &txn.key, txn.id);
    let mut record = existing.clone().unwrap_or_else(|| txn.clone());
    if let Some(existing) = existing {
        match existing.status {
            TxnStatus::Committed => {
                return Err(RangeError::TransactionStatus {
                    txn: record,
                    msg: "already committed".into(),
                });
            }
            TxnStatus::Aborted => {
                return Err(RangeError::TransactionAborted { txn: record });
            }
            TxnStatus::Pending => {}
        }
        if txn.epoch < existing.epoch {
            return Err(RangeError::TransactionStatus {
                txn: record,
                msg: format!("epoch regression: {}", txn.epoch),
            });
        }
        if existing.timestamp < txn.timestamp {
            // The record is only ever pushed forward; a record behind its own
            // transaction means someone rewrote history.
            return Err(RangeError::TransactionStatus {
                txn: record,
                msg: format!("timestamp regression: {}", existing.timestamp),
            });
        }
    }
    record.upgrade(txn);
    record.timestamp.forward(req.header.timestamp);
    if commit {
        if record.isolation == crate::txn::Isolation::Serializable
            && record.timestamp != txn.timestamp
        {
            return Err(RangeError::TransactionRetry { txn: record });
        }
        record.status = TxnStatus::Committed;
    } else {
        record.status = TxnStatus::Aborted;
    }
    write_txn_record(engine, &record);
    Ok(ResponseBody::EndTransaction { txn: record })
}

/// Create or refresh a PENDING transaction record's liveness.
fn heartbeat_txn(engine: &mut EngineState, req: &Request) -> Result<ResponseBody, RangeError> {
    let txn = req
        .header
        .txn
        .as_ref()
        .ok_or_else(|| RangeError::invalid("HeartbeatTxn requires a transaction"))?;
    let mut record = read_txn_record(engine, &txn.key, txn.id).unwrap_or_else(|| txn.clone());
    if record.status == TxnStatus::Pending {
        record.upgrade(txn);
        let mut beat = record.last_heartbeat.unwrap_or(Timestamp::ZERO);
        beat.forward(req.header.timestamp);
        record.last_heartbeat = Some(beat);
        write_txn_record(engine, &record);
    }
    Ok(ResponseBody::HeartbeatTxn { txn: record })
}

/// Resolve a conflict with another transaction's record.
///
/// An ended pushee is returned as-is. Otherwise the stored record is
/// upgraded with the pusher's (forward-only) view of the pushee, and the
/// pusher wins on priority, on age at equal priority, or unconditionally if
/// the pushee's coordinator stopped heartbeating. `CleanupTxn` only ever
/// wins on the liveness path.
fn push_txn(
    engine: &mut EngineState,
    req: &Request,
    pushee: &Transaction,
    push_type: PushTxnType,
    now: Timestamp,
) -> Result<ResponseBody, RangeError> {
    if req.header.key != pushee.key {
        return Err(RangeError::invalid(format!(
            "request key {:?} should match pushee txn key {:?}",
            req.header.key, pushee.key
        )));
    }
    let mut record = read_txn_record(engine, &pushee.key, pushee.id).unwrap_or_else(|| pushee.clone());
    if record.status != TxnStatus::Pending {
        // Already ended; nothing to contend with.
        return Ok(ResponseBody::PushTxn { pushee_txn: record });
    }
    record.upgrade(pushee);

    // The pusher may not be transactional; synthesize its priority and
    // timestamp from the header in that case.
    let (pusher_priority, pusher_ts) = match &req.header.txn {
        Some(pusher) => (pusher.priority, pusher.timestamp),
        None => (req.header.user_priority.max(1), req.header.timestamp),
    };

    if push_type == PushTxnType::PushTimestamp && pusher_ts < record.timestamp {
        // Already sufficiently pushed.
        return Ok(ResponseBody::PushTxn { pushee_txn: record });
    }

    let pusher_wins = if record.heartbeat_expired(now) {
        true
    } else if push_type == PushTxnType::CleanupTxn {
        false
    } else if pusher_priority != record.priority {
        pusher_priority > record.priority
    } else {
        pusher_ts < record.timestamp
    };
    if !pusher_wins {
        return Err(RangeError::TransactionPush { pushee: record });
    }

    match push_type {
        PushTxnType::PushTimestamp => {
            record.timestamp = pusher_ts.next();
        }
        PushTxnType::AbortTxn | PushTxnType::CleanupTxn => {
            record.status = TxnStatus::Aborted;
        }
    }
    write_txn_record(engine, &record);
    Ok(ResponseBody::PushTxn { pushee_txn: record })
}

// ---------------------------------------------------------------------
// Range lookup
// ---------------------------------------------------------------------

/// Return up to `max_ranges` descriptors from the meta2 records at or after
/// the lookup key.
fn range_lookup(
    engine: &EngineState,
    req: &Request,
    max_ranges: u64,
    ignore_intents: bool,
) -> Result<ResponseBody, RangeError> {
    if max_ranges == 0 {
        return Err(RangeError::invalid("RangeLookup requires max_ranges >= 1"));
    }
    let consistent = !inconsistent(req);
    if ignore_intents && consistent {
        return Err(RangeError::invalid(
            "can not read consistently and skip intents",
        ));
    }
    // Addressing reads always want the newest record.
    let ts = Timestamp::MAX;
    let scan_start = {
        let mut start = keys::next_key(&req.header.key);
        if start.as_slice() < keys::META2_PREFIX {
            start = keys::META2_PREFIX.to_vec();
        }
        start
    };
    let scan_end = keys::prefix_end(keys::META2_PREFIX);

    let mut ranges = Vec::new();
    for key in engine.mvcc_keys_in(&scan_start, &scan_end) {
        if ranges.len() as u64 >= max_ranges {
            break;
        }
        let bytes = if consistent {
            engine.mvcc_get(&key, ts, req.header.txn.as_ref(), false)?
        } else {
            let (committed, intent) = engine.mvcc_get_parts(&key, ts);
            match intent {
                Some((provisional, _txn)) if ignore_intents => {
                    // A dangling intent leaves two plausible descriptors;
                    // return a random choice of old or new.
                    if rand::thread_rng().gen_bool(0.5) {
                        provisional
                    } else {
                        committed
                    }
                }
                _ => committed,
            }
        };
        let Some(bytes) = bytes else {
            continue;
        };
        let desc: RangeDescriptor = serde_json::from_slice(&bytes).map_err(|err| {
            RangeError::internal(format!("range descriptor decode failed: {err}"))
        })?;
        ranges.push(desc);
    }
    if ranges.is_empty() {
        return Err(RangeError::invalid(format!(
            "no ranges found at or after key {:?}",
            req.header.key
        )));
    }
    Ok(ResponseBody::RangeLookup { ranges })
}
