//! Timestamp cache.
//!
//! Records the maximum timestamp at which key spans were recently read or
//! written, so later writes can be forwarded past earlier reads (and writes)
//! instead of invalidating them. A low-water mark bounds every span the cache
//! may have forgotten: entries are GC'd by age and the low water rises to
//! cover them.

use uuid::Uuid;

use crate::clock::Timestamp;

/// Entries older than this window (against the newest timestamp seen) are
/// eligible for GC.
pub const MIN_TS_CACHE_WINDOW_NS: i64 = 10_000_000_000;

#[derive(Clone, Debug)]
struct CacheEntry {
    start: Vec<u8>,
    end: Vec<u8>,
    timestamp: Timestamp,
    txn_id: Option<Uuid>,
    read: bool,
}

#[derive(Debug)]
pub struct TsCache {
    low_water: Timestamp,
    latest: Timestamp,
    entries: Vec<CacheEntry>,
}

fn overlaps(a_start: &[u8], a_end: &[u8], b_start: &[u8], b_end: &[u8]) -> bool {
    a_start < b_end && b_start < a_end
}

impl TsCache {
    /// The low-water mark starts at the clock reading when the cache is
    /// created; nothing can have been read below it on this replica.
    pub fn new(low_water: Timestamp) -> Self {
        TsCache {
            low_water,
            latest: low_water,
            entries: Vec::new(),
        }
    }

    pub fn low_water(&self) -> Timestamp {
        self.low_water
    }

    /// Record a read or write of `[start, end)` at `timestamp`.
    pub fn add(
        &mut self,
        start: &[u8],
        end: &[u8],
        timestamp: Timestamp,
        txn_id: Option<Uuid>,
        read: bool,
    ) {
        self.latest.forward(timestamp);
        self.gc();
        if timestamp <= self.low_water {
            // Already covered by the floor.
            return;
        }
        self.entries.push(CacheEntry {
            start: start.to_vec(),
            end: end.to_vec(),
            timestamp,
            txn_id,
            read,
        });
    }

    /// Maximum read and write timestamps overlapping `[start, end)`.
    /// Entries tagged with `txn_id` are excluded so a transaction does not
    /// push its own writes. The low-water mark floors both results.
    pub fn get_max(
        &self,
        start: &[u8],
        end: &[u8],
        txn_id: Option<Uuid>,
    ) -> (Timestamp, Timestamp) {
        let mut max_read = self.low_water;
        let mut max_write = self.low_water;
        for entry in &self.entries {
            if !overlaps(&entry.start, &entry.end, start, end) {
                continue;
            }
            if txn_id.is_some() && entry.txn_id == txn_id {
                continue;
            }
            if entry.read {
                max_read.forward(entry.timestamp);
            } else {
                max_write.forward(entry.timestamp);
            }
        }
        (max_read, max_write)
    }

    /// Raise the floor; entries at or below it become redundant.
    pub fn set_low_water(&mut self, low_water: Timestamp) {
        self.low_water.forward(low_water);
        self.latest.forward(low_water);
        self.entries.retain(|e| e.timestamp > self.low_water);
    }

    /// Drop entries older than the cache window. The low water rises to the
    /// newest evicted timestamp, so a forgotten entry can only make later
    /// writes more conservative, never less.
    fn gc(&mut self) {
        let horizon = self.latest.wall_time - MIN_TS_CACHE_WINDOW_NS;
        if horizon <= self.low_water.wall_time {
            return;
        }
        let mut new_low = self.low_water;
        self.entries.retain(|e| {
            if e.timestamp.wall_time < horizon {
                new_low.forward(e.timestamp);
                false
            } else {
                true
            }
        });
        self.low_water = new_low;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(wall: i64) -> Timestamp {
        Timestamp::new(wall, 0)
    }

    #[test]
    fn reads_and_writes_are_tracked_separately() {
        let mut cache = TsCache::new(ts(0));
        cache.add(b"a", b"a\x00", ts(10), None, true);
        cache.add(b"b", b"b\x00", ts(20), None, false);

        let (r, w) = cache.get_max(b"a", b"a\x00", None);
        assert_eq!((r, w), (ts(10), ts(0)));
        let (r, w) = cache.get_max(b"b", b"b\x00", None);
        assert_eq!((r, w), (ts(0), ts(20)));
        // Unknown keys fall back to the low water mark.
        let (r, w) = cache.get_max(b"c", b"c\x00", None);
        assert_eq!((r, w), (ts(0), ts(0)));
    }

    #[test]
    fn span_overlap() {
        let mut cache = TsCache::new(ts(0));
        cache.add(b"b", b"f", ts(7), None, true);
        let (r, _) = cache.get_max(b"a", b"c", None);
        assert_eq!(r, ts(7));
        let (r, _) = cache.get_max(b"f", b"g", None);
        assert_eq!(r, ts(0), "end key is exclusive");
    }

    #[test]
    fn own_txn_entries_are_excluded() {
        let id = Uuid::new_v4();
        let mut cache = TsCache::new(ts(0));
        cache.add(b"a", b"a\x00", ts(10), Some(id), true);

        let (r, _) = cache.get_max(b"a", b"a\x00", Some(id));
        assert_eq!(r, ts(0));
        let (r, _) = cache.get_max(b"a", b"a\x00", Some(Uuid::new_v4()));
        assert_eq!(r, ts(10));
        let (r, _) = cache.get_max(b"a", b"a\x00", None);
        assert_eq!(r, ts(10));
    }

    #[test]
    fn low_water_floors_everything() {
        let mut cache = TsCache::new(ts(5));
        let (r, w) = cache.get_max(b"a", b"b", None);
        assert_eq!((r, w), (ts(5), ts(5)));
        cache.set_low_water(ts(50));
        let (r, w) = cache.get_max(b"a", b"b", None);
        assert_eq!((r, w), (ts(50), ts(50)));
        // Low water never regresses.
        cache.set_low_water(ts(20));
        assert_eq!(cache.low_water(), ts(50));
    }

    #[test]
    fn gc_raises_the_low_water() {
        let mut cache = TsCache::new(ts(0));
        cache.add(b"a", b"a\x00", ts(1), None, true);
        // An entry far in the future evicts the old one.
        cache.add(b"b", b"b\x00", ts(1 + 2 * MIN_TS_CACHE_WINDOW_NS), None, true);
        let (r, _) = cache.get_max(b"a", b"a\x00", None);
        // The evicted read is still covered by the raised floor.
        assert_eq!(r, ts(1));
    }
}
