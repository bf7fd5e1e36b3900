//! Shared harness for store integration tests: a single-node store over a
//! local transport with a manual clock, plus request builders.

#![allow(dead_code)]

use std::sync::Arc;

use stratum_raft::raft::{manual_ticker, LocalTransport, ManualTicker};
use stratum_store::api::{
    CommandId, Lease, RangeDescriptor, ReadConsistency, ReplicaDesc, Request, RequestBody,
    RequestHeader, Response,
};
use stratum_store::clock::{Clock, ManualClock, Timestamp};
use stratum_store::error::RangeError;
use stratum_store::gossip::RecordingGossip;
use stratum_store::keys;
use stratum_store::range::{CommandFilter, Range};
use stratum_store::store::{Store, StoreConfig};
use stratum_store::txn::{Isolation, PushTxnType, Transaction};

pub const RANGE_ID: u64 = 1;

pub struct TestContext {
    pub store: Arc<Store>,
    pub range: Arc<Range>,
    pub manual: Arc<ManualClock>,
    pub clock: Clock,
    pub gossip: Arc<RecordingGossip>,
    pub ticker: ManualTicker,
}

/// Best-effort tracing setup; `RUST_LOG` controls verbosity.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

impl TestContext {
    pub async fn start() -> Self {
        Self::start_with(StoreConfig::default(), None).await
    }

    pub async fn start_with(mut config: StoreConfig, filter: Option<CommandFilter>) -> Self {
        init_tracing();
        let manual = Arc::new(ManualClock::new(0));
        let clock = Clock::new(manual.clone());
        let gossip = Arc::new(RecordingGossip::new());
        let transport = Arc::new(LocalTransport::new());
        let (ticker, ticker_rx) = manual_ticker();
        config.command_filter = filter.or(config.command_filter.take());
        let store = Store::start(
            config,
            clock.clone(),
            transport,
            gossip.clone(),
            ticker_rx,
        )
        .expect("store start");
        let range = store
            .bootstrap_range(RangeDescriptor {
                range_id: RANGE_ID,
                start_key: keys::KEY_MIN.to_vec(),
                end_key: keys::KEY_MAX.to_vec(),
                replicas: vec![ReplicaDesc::new(1, 1)],
            })
            .await
            .expect("bootstrap range");
        TestContext {
            store,
            range,
            manual,
            clock,
            gossip,
            ticker,
        }
    }

    pub async fn send(&self, req: Request) -> Result<Response, RangeError> {
        self.store.send(req).await
    }

    /// Grant a lease by proposing it directly, the way internal acquisition
    /// does.
    pub async fn set_lease(&self, lease: Lease) -> Result<Response, RangeError> {
        let mut req = request(b"", RequestBody::LeaderLease { lease });
        req.header.timestamp = self.clock.now();
        self.send(req).await
    }

    pub fn new_txn(&self, name: &str, key: &[u8]) -> Transaction {
        Transaction::new(name, key, 1, Isolation::Serializable, self.clock.now())
    }
}

pub fn header(key: &[u8]) -> RequestHeader {
    RequestHeader {
        range_id: RANGE_ID,
        replica: ReplicaDesc::new(1, 1),
        key: key.to_vec(),
        end_key: Vec::new(),
        timestamp: Timestamp::ZERO,
        txn: None,
        command_id: CommandId::default(),
        read_consistency: ReadConsistency::Consistent,
        user_priority: 1,
    }
}

pub fn request(key: &[u8], body: RequestBody) -> Request {
    Request {
        header: header(key),
        body,
    }
}

pub fn get_args(key: &[u8]) -> Request {
    request(key, RequestBody::Get)
}

pub fn put_args(key: &[u8], value: &[u8]) -> Request {
    request(
        key,
        RequestBody::Put {
            value: value.to_vec(),
        },
    )
}

pub fn increment_args(key: &[u8], increment: i64) -> Request {
    request(key, RequestBody::Increment { increment })
}

pub fn delete_args(key: &[u8]) -> Request {
    request(key, RequestBody::Delete)
}

pub fn scan_args(start: &[u8], end: &[u8]) -> Request {
    let mut req = request(start, RequestBody::Scan { max_results: 0 });
    req.header.end_key = end.to_vec();
    req
}

pub fn end_txn_args(txn: &Transaction, commit: bool) -> Request {
    let mut req = request(&txn.key.clone(), RequestBody::EndTransaction { commit });
    req.header.txn = Some(txn.clone());
    req.header.timestamp = txn.timestamp;
    req
}

pub fn heartbeat_args(txn: &Transaction) -> Request {
    let mut req = request(&txn.key.clone(), RequestBody::HeartbeatTxn);
    req.header.txn = Some(txn.clone());
    req.header.timestamp = txn.timestamp;
    req
}

pub fn push_txn_args(pusher: &Transaction, pushee: &Transaction, push_type: PushTxnType) -> Request {
    let mut req = request(
        &pushee.key.clone(),
        RequestBody::PushTxn {
            pushee: pushee.clone(),
            push_type,
            now: pusher.timestamp,
        },
    );
    req.header.txn = Some(pusher.clone());
    req.header.timestamp = pusher.timestamp;
    req
}

/// A fresh command id that participates in the response cache.
pub fn command_id() -> CommandId {
    CommandId::random()
}
