//! Key-space layout.
//!
//! The MVCC key space holds user keys plus addressable system records (meta2
//! range descriptors and config records) under the `\x00` system prefix, so
//! they sort before user data and can carry intents like any other key.
//! Range-local bookkeeping (applied index, stats, lease, response cache, txn
//! records) lives in a separate non-MVCC keyspace and is written atomically
//! with each apply batch.

use uuid::Uuid;

/// Smallest possible key.
pub const KEY_MIN: &[u8] = b"";
/// Largest possible key; no user key may start with `0xff 0xff`.
pub const KEY_MAX: &[u8] = &[0xff, 0xff];

/// Prefix of addressable system records in the MVCC key space.
pub const SYSTEM_PREFIX: &[u8] = b"\x00";
/// Prefix of meta2 range-addressing records.
pub const META2_PREFIX: &[u8] = b"\x00meta2";
/// Prefix covering every config record.
pub const CONFIG_PREFIX: &[u8] = b"\x00config/";

/// The config record classes gossiped by the lease holder.
pub const CONFIG_ACCOUNTING_PREFIX: &[u8] = b"\x00config/accounting";
pub const CONFIG_PERMISSION_PREFIX: &[u8] = b"\x00config/permissions";
pub const CONFIG_ZONE_PREFIX: &[u8] = b"\x00config/zones";

/// Gossip info keys for the config classes, in prefix order.
pub const CONFIG_GOSSIP_KEYS: [(&str, &[u8]); 3] = [
    ("configs.accounting", CONFIG_ACCOUNTING_PREFIX),
    ("configs.permissions", CONFIG_PERMISSION_PREFIX),
    ("configs.zones", CONFIG_ZONE_PREFIX),
];

/// The key immediately after `key`: its single-key span end.
pub fn next_key(key: &[u8]) -> Vec<u8> {
    let mut next = key.to_vec();
    next.push(0);
    next
}

/// The exclusive upper bound of every key starting with `prefix`.
pub fn prefix_end(prefix: &[u8]) -> Vec<u8> {
    let mut end = prefix.to_vec();
    while let Some(last) = end.last_mut() {
        if *last < u8::MAX {
            *last += 1;
            return end;
        }
        end.pop();
    }
    KEY_MAX.to_vec()
}

/// Meta2 record key addressing the range that ends at `end_key`.
pub fn range_meta_key(end_key: &[u8]) -> Vec<u8> {
    let mut key = META2_PREFIX.to_vec();
    key.extend_from_slice(end_key);
    key
}

// ---------------------------------------------------------------------
// Range-local (non-MVCC) keys. Composite parts are length-prefixed with
// big-endian fixed-width integers so encoded keys sort like their parts.
// ---------------------------------------------------------------------

fn local_key(range_id: u64, suffix: &[u8]) -> Vec<u8> {
    let mut key = Vec::with_capacity(8 + suffix.len());
    key.extend_from_slice(&range_id.to_be_bytes());
    key.extend_from_slice(suffix);
    key
}

pub fn applied_index_key(range_id: u64) -> Vec<u8> {
    local_key(range_id, b"applied-index")
}

pub fn range_stats_key(range_id: u64) -> Vec<u8> {
    local_key(range_id, b"stats")
}

pub fn range_lease_key(range_id: u64) -> Vec<u8> {
    local_key(range_id, b"lease")
}

pub fn range_descriptor_key(range_id: u64) -> Vec<u8> {
    local_key(range_id, b"descriptor")
}

/// Prefix of every response-cache entry for a range; entries are discarded
/// wholesale on range removal.
pub fn response_cache_prefix(range_id: u64) -> Vec<u8> {
    local_key(range_id, b"respcache-")
}

pub fn response_cache_key(range_id: u64, wall_time: i64, random: i64) -> Vec<u8> {
    let mut key = response_cache_prefix(range_id);
    key.extend_from_slice(&wall_time.to_be_bytes());
    key.extend_from_slice(&random.to_be_bytes());
    key
}

/// Key of a transaction record, derived from the txn's initial key + id.
pub fn transaction_key(key: &[u8], id: Uuid) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + key.len() + 4 + 16);
    out.extend_from_slice(b"txn-");
    out.extend_from_slice(&(key.len() as u32).to_be_bytes());
    out.extend_from_slice(key);
    out.extend_from_slice(id.as_bytes());
    out
}
