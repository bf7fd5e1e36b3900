//! Admission-pipeline behavior: leases, timestamp cache, command queue,
//! response cache, consistency modes, and the corruption latch.

mod common;

use std::sync::mpsc as std_mpsc;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use common::*;
use stratum_raft::raft::CommandApplier;
use stratum_store::api::{
    Lease, RaftCommand, ReadConsistency, ReplicaDesc, RequestBody, ResponseBody,
};
use stratum_store::clock::Timestamp;
use stratum_store::error::RangeError;
use stratum_store::keys;
use stratum_store::range::DEFAULT_LEADER_LEASE_DURATION_NS;
use stratum_store::txn::Isolation;

fn ts(wall: i64) -> Timestamp {
    Timestamp::new(wall, 0)
}

#[tokio::test]
async fn write_then_read_roundtrip() {
    let tc = TestContext::start().await;
    tc.send(put_args(b"a", b"value")).await.unwrap();
    let resp = tc.send(get_args(b"a")).await.unwrap();
    assert_eq!(
        resp.body,
        ResponseBody::Get {
            value: Some(b"value".to_vec())
        }
    );
}

/// The first command acquires a lease covering its timestamp, expiring one
/// lease duration past the clock reading.
#[tokio::test]
async fn first_command_acquires_lease() {
    for req in [get_args(b"a"), put_args(b"b", b"1")] {
        let tc = TestContext::start().await;
        tc.manual.set(DEFAULT_LEADER_LEASE_DURATION_NS + 1000);
        let mut req = req;
        req.header.timestamp = tc.clock.now();
        tc.send(req.clone()).await.unwrap();

        let lease = tc.range.lease();
        assert!(lease.covers(req.header.timestamp), "lease {lease:?}");
        assert_eq!(lease.holder, ReplicaDesc::new(1, 1).raft_node_id());
        assert!(lease.expiration.wall_time >= req.header.timestamp.wall_time);
    }
}

/// A lease held by another replica redirects instead of serving.
#[tokio::test]
async fn not_leader_redirect() {
    let tc = TestContext::start().await;
    let now = tc.clock.now();
    tc.set_lease(Lease {
        start: now.next(),
        expiration: now.add(10_000_000_000, 0),
        holder: ReplicaDesc::new(2, 2).raft_node_id(),
    })
    .await
    .unwrap();

    let mut req = get_args(b"a");
    req.header.timestamp = tc.clock.now();
    let err = tc.send(req).await.unwrap_err();
    assert!(matches!(err, RangeError::NotLeader { .. }), "got {err:?}");
}

/// Reads and writes land in the timestamp cache; a later write below a
/// read's timestamp is forwarded one logical tick past it.
#[tokio::test]
async fn timestamp_cache_forwards_writes() {
    let tc = TestContext::start().await;
    let mut read = get_args(b"a");
    read.header.timestamp = ts(2_000_000_000);
    tc.send(read).await.unwrap();

    let (r, w) = tc.range.ts_cache_max(b"a", b"", None);
    assert_eq!(r, ts(2_000_000_000));
    assert_eq!(w.wall_time, 0, "writes should not be recorded by a read");

    let mut write = put_args(b"a", b"v");
    write.header.timestamp = ts(1_000_000_000);
    let resp = tc.send(write).await.unwrap();
    assert_eq!(resp.timestamp, ts(2_000_000_000).next());

    // Another key is untouched by the cache.
    let mut write = put_args(b"b", b"v");
    write.header.timestamp = ts(1_500_000_000);
    let resp = tc.send(write).await.unwrap();
    assert_eq!(resp.timestamp, ts(1_500_000_000));
}

/// Inconsistent reads bypass the timestamp cache entirely.
#[tokio::test]
async fn inconsistent_reads_skip_timestamp_cache() {
    let tc = TestContext::start().await;
    let mut read = get_args(b"a");
    read.header.timestamp = ts(2_000_000_000);
    read.header.read_consistency = ReadConsistency::Inconsistent;
    tc.send(read).await.unwrap();

    let mut write = put_args(b"a", b"v");
    write.header.timestamp = ts(1_000_000_000);
    let resp = tc.send(write).await.unwrap();
    assert_eq!(resp.timestamp, ts(1_000_000_000), "write must not be forwarded");
}

/// Failed commands leave no timestamp-cache entry behind.
#[tokio::test]
async fn no_timestamp_cache_update_on_failure() {
    let tc = TestContext::start().await;
    let mut cput = request(
        b"a",
        RequestBody::ConditionalPut {
            value: b"v".to_vec(),
            exp_value: Some(b"missing".to_vec()),
        },
    );
    cput.header.timestamp = ts(2_000_000_000);
    assert!(tc.send(cput).await.is_err());

    let mut write = put_args(b"a", b"v");
    write.header.timestamp = ts(1_000_000_000);
    let resp = tc.send(write).await.unwrap();
    assert_eq!(resp.timestamp, ts(1_000_000_000));
}

/// A transaction does not forward its own writes off its own reads.
#[tokio::test]
async fn no_timestamp_increment_within_txn() {
    let tc = TestContext::start().await;
    let txn = tc.new_txn("test", b"a");

    let mut read = get_args(b"a");
    read.header.txn = Some(txn.clone());
    read.header.timestamp = txn.timestamp;
    tc.send(read).await.unwrap();

    let mut write = put_args(b"a", b"v");
    write.header.txn = Some(txn.clone());
    write.header.timestamp = txn.timestamp;
    let resp = tc.send(write).await.unwrap();
    assert_eq!(resp.timestamp, txn.timestamp);
}

/// Re-submitting a command id returns the original reply without
/// re-executing; corrupting the stored entry surfaces a decode error.
#[tokio::test]
async fn response_cache_idempotence_and_decode_error() {
    let tc = TestContext::start().await;
    let id = command_id();
    let mut inc = increment_args(b"a", 1);
    inc.header.command_id = id;
    let resp = tc.send(inc.clone()).await.unwrap();
    assert_eq!(resp.body, ResponseBody::Increment { new_value: 1 });

    // Replayed: the original reply, not a second increment.
    let resp = tc.send(inc.clone()).await.unwrap();
    assert_eq!(resp.body, ResponseBody::Increment { new_value: 1 });
    let resp = tc.send(get_args(b"a")).await.unwrap();
    assert_eq!(
        resp.body,
        ResponseBody::Get {
            value: Some(1i64.to_le_bytes().to_vec())
        }
    );

    // Corrupt the stored entry; the next replay must fail, not re-execute.
    {
        let mut batch = tc.store.engine().write_batch();
        batch.sys_put(
            keys::response_cache_key(RANGE_ID, id.wall_time, id.random),
            b"garbage".to_vec(),
        );
    }
    let err = tc.send(inc).await.unwrap_err();
    assert!(matches!(err, RangeError::Internal { .. }), "got {err:?}");
    let resp = tc.send(get_args(b"a")).await.unwrap();
    assert_eq!(
        resp.body,
        ResponseBody::Get {
            value: Some(1i64.to_le_bytes().to_vec())
        }
    );
}

/// Errors are cached too: a replayed command id returns the stored error
/// verbatim.
#[tokio::test]
async fn response_cache_replays_stored_errors() {
    let tc = TestContext::start().await;
    let id = command_id();
    let mut cput = request(
        b"a",
        RequestBody::ConditionalPut {
            value: b"v".to_vec(),
            exp_value: Some(b"missing".to_vec()),
        },
    );
    cput.header.command_id = id;
    let first = tc.send(cput.clone()).await.unwrap_err();
    let second = tc.send(cput).await.unwrap_err();
    assert_eq!(first, second);
    assert!(matches!(first, RangeError::ConditionFailed { .. }));
}

/// Lease transfers clear the timestamp cache by raising its low water to the
/// previous lease's expiration plus the maximum clock offset. Renewals by
/// the same holder preserve cache contents.
#[tokio::test]
async fn lease_transfer_bumps_ts_cache_low_water() {
    let max_offset = 250_000_000i64;
    let tc = TestContext::start_with(
        stratum_store::store::StoreConfig {
            max_clock_offset_ns: max_offset,
            ..Default::default()
        },
        None,
    )
    .await;
    tc.manual.set(DEFAULT_LEADER_LEASE_DURATION_NS + 1);
    let now = ts(DEFAULT_LEADER_LEASE_DURATION_NS + 1);
    let me = ReplicaDesc::new(1, 1).raft_node_id();
    let other = ReplicaDesc::new(2, 2).raft_node_id();

    let sec = 1_000_000_000i64;
    // Fresh grant to self.
    tc.set_lease(Lease {
        start: now,
        expiration: now.add(10 * sec, 0),
        holder: me,
    })
    .await
    .unwrap();
    let (base, _) = tc.range.ts_cache_max(b"a", b"", None);

    // Renewal preserves the cache.
    tc.set_lease(Lease {
        start: now.add(15 * sec, 0),
        expiration: now.add(30 * sec, 0),
        holder: me,
    })
    .await
    .unwrap();
    assert_eq!(tc.range.ts_cache_max(b"a", b"", None).0, base);

    // Renewal with a shorter expiration still preserves it.
    tc.set_lease(Lease {
        start: now.add(16 * sec, 0),
        expiration: now.add(25 * sec, 0),
        holder: me,
    })
    .await
    .unwrap();
    assert_eq!(tc.range.ts_cache_max(b"a", b"", None).0, base);

    // Lease moves to another replica.
    tc.set_lease(Lease {
        start: now.add(29 * sec, 0),
        expiration: now.add(50 * sec, 0),
        holder: other,
    })
    .await
    .unwrap();

    // And back to us: everything the other holder might have served is
    // fenced off.
    tc.set_lease(Lease {
        start: now.add(60 * sec, 0),
        expiration: now.add(70 * sec, 0),
        holder: me,
    })
    .await
    .unwrap();
    let (low, _) = tc.range.ts_cache_max(b"a", b"", None);
    assert_eq!(low, now.add(50 * sec + max_offset, 0));
}

/// A command whose proposer no longer holds the lease at apply time is
/// refused and must not mutate state.
#[tokio::test]
async fn apply_refuses_commands_from_non_holders() {
    let tc = TestContext::start().await;
    // Establish our own lease and applied index baseline.
    tc.send(put_args(b"base", b"1")).await.unwrap();
    let applied = tc.range.applied_index();

    let mut req = put_args(b"stale", b"boom");
    req.header.timestamp = tc.clock.now();
    let command = RaftCommand {
        origin: ReplicaDesc::new(2, 2),
        request: req,
    };
    let payload = serde_json::to_vec(&command).unwrap();
    tc.store
        .apply_command(RANGE_ID, applied + 1, "stale-cmd", &payload);

    assert_eq!(tc.range.applied_index(), applied, "refusal must not apply");
    let resp = tc.send(get_args(b"stale")).await.unwrap();
    assert_eq!(resp.body, ResponseBody::Get { value: None });
}

/// An applied index that moves backwards marks the replica corrupt; further
/// commands fail with the sticky error.
#[tokio::test]
async fn applied_index_regression_marks_replica_corrupt() {
    let tc = TestContext::start().await;
    tc.send(put_args(b"test", b"value")).await.unwrap();
    let applied = tc.range.applied_index();
    assert!(applied > 0);

    let mut req = put_args(b"test", b"value2");
    req.header.timestamp = tc.clock.now();
    let command = RaftCommand {
        origin: ReplicaDesc::new(1, 1),
        request: req,
    };
    let payload = serde_json::to_vec(&command).unwrap();
    // Replayed at an index at or below the applied index: corruption.
    tc.store.apply_command(RANGE_ID, applied, "replayed", &payload);

    let err = tc.send(put_args(b"test", b"value3")).await.unwrap_err();
    let text = err.to_string();
    assert!(
        text.contains("replica corruption (processed=true)"),
        "unexpected error: {text}"
    );
}

/// The applied index advances monotonically, one step per applied command.
#[tokio::test]
async fn applied_index_advances() {
    let tc = TestContext::start().await;
    let mut applied = 0;
    let mut sum = 0;
    for i in 1..=10 {
        let resp = tc.send(increment_args(b"a", i)).await.unwrap();
        sum += i;
        assert_eq!(resp.body, ResponseBody::Increment { new_value: sum });
        let now_applied = tc.range.applied_index();
        assert!(now_applied > applied, "applied index did not advance");
        applied = now_applied;
    }
}

/// Requests outside the range's bounds fail with RangeKeyMismatch.
#[tokio::test]
async fn range_bounds_are_checked() {
    let tc = TestContext::start().await;
    let err = tc.send(get_args(keys::KEY_MAX)).await.unwrap_err();
    assert!(matches!(err, RangeError::RangeKeyMismatch { .. }));

    let mut scan = scan_args(b"b", b"a");
    scan.header.end_key = b"a".to_vec();
    let err = tc.send(scan).await.unwrap_err();
    assert!(matches!(err, RangeError::RangeKeyMismatch { .. }));
}

/// CONSENSUS reads are rejected at admission; inconsistent reads inside a
/// transaction are rejected too.
#[tokio::test]
async fn read_consistency_modes() {
    let tc = TestContext::start().await;

    let mut req = get_args(b"a");
    req.header.read_consistency = ReadConsistency::Consensus;
    assert!(tc.send(req).await.is_err());

    let mut req = get_args(b"a");
    req.header.read_consistency = ReadConsistency::Inconsistent;
    req.header.txn = Some(tc.new_txn("test", b"a"));
    assert!(tc.send(req).await.is_err());

    let mut req = get_args(b"a");
    req.header.read_consistency = ReadConsistency::Inconsistent;
    tc.send(req).await.unwrap();
}

/// Overlapping commands execute in queue order: a write waits for a blocked
/// read to finish; an inconsistent read bypasses the queue.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn command_queue_serializes_overlaps() {
    let (release_tx, release_rx) = std_mpsc::channel::<()>();
    let release_rx = Mutex::new(release_rx);
    let blocked = Arc::new(std::sync::atomic::AtomicBool::new(false));
    let blocked_in_filter = blocked.clone();
    let filter: stratum_store::range::CommandFilter = Arc::new(move |req| {
        if matches!(req.body, RequestBody::Get) && req.header.key == b"queued" {
            blocked_in_filter.store(true, std::sync::atomic::Ordering::SeqCst);
            let _ = release_rx.lock().unwrap().recv();
        }
        None
    });
    let tc = Arc::new(TestContext::start_with(Default::default(), Some(filter)).await);
    tc.send(put_args(b"queued", b"old")).await.unwrap();

    let reader = {
        let tc = tc.clone();
        tokio::spawn(async move { tc.send(get_args(b"queued")).await })
    };
    while !blocked.load(std::sync::atomic::Ordering::SeqCst) {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    // The overlapping write must wait behind the read.
    let writer = {
        let tc = tc.clone();
        tokio::spawn(async move { tc.send(put_args(b"queued", b"new")).await })
    };
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert!(!writer.is_finished(), "write should wait in the command queue");

    // An inconsistent read bypasses the queue entirely.
    let mut bypass = get_args(b"other");
    bypass.header.read_consistency = ReadConsistency::Inconsistent;
    tokio::time::timeout(Duration::from_secs(1), tc.send(bypass))
        .await
        .expect("inconsistent read must not queue")
        .unwrap();

    release_tx.send(()).unwrap();
    let read = reader.await.unwrap().unwrap();
    assert_eq!(
        read.body,
        ResponseBody::Get {
            value: Some(b"old".to_vec())
        }
    );
    writer.await.unwrap().unwrap();
    let resp = tc.send(get_args(b"queued")).await.unwrap();
    assert_eq!(
        resp.body,
        ResponseBody::Get {
            value: Some(b"new".to_vec())
        }
    );
}

/// Merge accumulates values with the engine's merge operator.
#[tokio::test]
async fn internal_merge() {
    let tc = TestContext::start().await;
    for part in [b"a".as_slice(), b"b", b"c", b"d"] {
        tc.send(request(
            b"mergedkey",
            RequestBody::Merge {
                value: part.to_vec(),
            },
        ))
        .await
        .unwrap();
    }
    let resp = tc.send(get_args(b"mergedkey")).await.unwrap();
    assert_eq!(
        resp.body,
        ResponseBody::Get {
            value: Some(b"abcd".to_vec())
        }
    );
}

/// TruncateLog discards the log prefix while preserving the truncated
/// entry's term.
#[tokio::test]
async fn internal_truncate_log() {
    let tc = TestContext::start().await;
    let group = tc.store.raft_storage().group(RANGE_ID);
    let mut indexes = Vec::new();
    for i in 0..10 {
        tc.send(increment_args(b"a", i)).await.unwrap();
        indexes.push(group.last_index());
    }

    tc.send(request(
        b"a",
        RequestBody::TruncateLog { index: indexes[5] },
    ))
    .await
    .unwrap();

    assert_eq!(group.first_index(), indexes[5]);
    let entries = group.entries(indexes[5], indexes[9]).unwrap();
    assert_eq!(entries.len() as u64, indexes[9] - indexes[5]);
    assert!(group.entries(indexes[4], indexes[9]).is_err());
    // The truncated entry's term survives; older terms are gone.
    assert!(group.term(indexes[5] - 1).unwrap() > 0);
    assert!(group.term(indexes[5] - 2).is_err());
}

/// Writes under the config prefix re-gossip configs while this replica
/// holds the lease, and a lease newly acquired gossips again.
#[tokio::test]
async fn config_gossip_on_write_and_lease() {
    let tc = TestContext::start().await;
    let mut key = keys::CONFIG_PERMISSION_PREFIX.to_vec();
    key.extend_from_slice(b"/db1");
    tc.send(put_args(&key, b"{\"read\":[\"root\"]}"))
        .await
        .unwrap();
    assert!(
        tc.gossip
            .keys()
            .iter()
            .any(|k| k == "configs.permissions"),
        "config write should gossip: {:?}",
        tc.gossip.keys()
    );

    // Hand the lease away and back; re-acquisition re-gossips. The clock
    // must first pass the lease acquired by the config write above.
    tc.gossip.clear();
    tc.manual.set(2 * DEFAULT_LEADER_LEASE_DURATION_NS);
    let now = tc.clock.now();
    let me = ReplicaDesc::new(1, 1).raft_node_id();
    let other = ReplicaDesc::new(2, 2).raft_node_id();
    tc.set_lease(Lease {
        start: now.next(),
        expiration: now.add(1_000_000, 0),
        holder: other,
    })
    .await
    .unwrap();
    assert!(tc.gossip.keys().is_empty());
    tc.set_lease(Lease {
        start: now.add(2_000_000, 0),
        expiration: now.add(3_000_000, 0),
        holder: me,
    })
    .await
    .unwrap();
    assert!(
        tc.gossip.keys().iter().any(|k| k == "configs.permissions"),
        "lease acquisition should gossip configs"
    );
}

/// Scans return visible rows in order and respect transaction visibility.
#[tokio::test]
async fn scan_and_delete() {
    let tc = TestContext::start().await;
    for (k, v) in [(b"a", b"1"), (b"b", b"2"), (b"c", b"3")] {
        tc.send(put_args(k, v)).await.unwrap();
    }
    tc.send(delete_args(b"b")).await.unwrap();
    let resp = tc.send(scan_args(b"a", b"z")).await.unwrap();
    match resp.body {
        ResponseBody::Scan { rows } => {
            let keys: Vec<&[u8]> = rows.iter().map(|r| r.key.as_slice()).collect();
            assert_eq!(keys, vec![b"a".as_slice(), b"c"]);
        }
        other => panic!("expected scan rows, got {other:?}"),
    }
}

/// Writes at a timestamp below an open intent conflict with it.
#[tokio::test]
async fn reads_above_intents_conflict() {
    let tc = TestContext::start().await;
    let txn = tc.new_txn("writer", b"k");
    let mut put = put_args(b"k", b"provisional");
    put.header.txn = Some(txn.clone());
    put.header.timestamp = txn.timestamp;
    tc.send(put).await.unwrap();

    let mut read = get_args(b"k");
    read.header.timestamp = txn.timestamp.next();
    let err = tc.send(read).await.unwrap_err();
    assert!(matches!(err, RangeError::WriteIntent { .. }), "got {err:?}");

    // The writing transaction reads its own intent.
    let mut read = get_args(b"k");
    read.header.txn = Some(txn.clone());
    read.header.timestamp = txn.timestamp;
    let resp = tc.send(read).await.unwrap();
    assert_eq!(
        resp.body,
        ResponseBody::Get {
            value: Some(b"provisional".to_vec())
        }
    );
}

/// Range-local MVCC stats reflect applied writes.
#[tokio::test]
async fn stats_track_mutations() {
    let tc = TestContext::start().await;
    let base = stratum_store::range::range_stats(tc.store.engine(), RANGE_ID);

    tc.send(put_args(b"stats-a", b"value-1")).await.unwrap();
    let after_put = stratum_store::range::range_stats(tc.store.engine(), RANGE_ID);
    assert_eq!(after_put.key_count, base.key_count + 1);
    assert_eq!(after_put.live_count, base.live_count + 1);
    assert!(after_put.val_bytes > base.val_bytes);

    let txn = tc.new_txn("writer", b"stats-b");
    let mut put = put_args(b"stats-b", b"provisional");
    put.header.txn = Some(txn.clone());
    put.header.timestamp = txn.timestamp;
    tc.send(put).await.unwrap();
    let after_txn = stratum_store::range::range_stats(tc.store.engine(), RANGE_ID);
    assert_eq!(after_txn.intent_count, after_put.intent_count + 1);

    tc.send(delete_args(b"stats-a")).await.unwrap();
    let after_delete = stratum_store::range::range_stats(tc.store.engine(), RANGE_ID);
    assert_eq!(after_delete.live_count, after_put.live_count - 1);
}

/// Serializable isolation marker used by txn helpers compiles into requests.
#[tokio::test]
async fn txn_requests_roundtrip() {
    let tc = TestContext::start().await;
    let txn = tc.new_txn("t", b"a");
    assert_eq!(txn.isolation, Isolation::Serializable);
    let mut put = put_args(b"a", b"v");
    put.header.txn = Some(txn.clone());
    put.header.timestamp = txn.timestamp;
    tc.send(put).await.unwrap();
}
