//! Hybrid logical clock.
//!
//! Timestamps order events across the cluster: the wall component tracks
//! physical time, the logical component disambiguates events sharing a wall
//! tick. The clock never runs backwards even if its wall source does.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// A hybrid logical timestamp, ordered lexicographically by
/// `(wall_time, logical)`.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Timestamp {
    /// Nanoseconds since the unix epoch.
    pub wall_time: i64,
    pub logical: i32,
}

impl Timestamp {
    pub const ZERO: Timestamp = Timestamp {
        wall_time: 0,
        logical: 0,
    };

    pub const MAX: Timestamp = Timestamp {
        wall_time: i64::MAX,
        logical: i32::MAX,
    };

    pub fn new(wall_time: i64, logical: i32) -> Self {
        Timestamp { wall_time, logical }
    }

    pub fn is_zero(&self) -> bool {
        *self == Timestamp::ZERO
    }

    /// The smallest timestamp greater than this one.
    pub fn next(&self) -> Timestamp {
        if self.logical == i32::MAX {
            Timestamp {
                wall_time: self.wall_time + 1,
                logical: 0,
            }
        } else {
            Timestamp {
                wall_time: self.wall_time,
                logical: self.logical + 1,
            }
        }
    }

    /// This timestamp advanced by a wall/logical delta.
    pub fn add(&self, wall_time: i64, logical: i32) -> Timestamp {
        Timestamp {
            wall_time: self.wall_time + wall_time,
            logical: self.logical + logical,
        }
    }

    /// In-place maximum.
    pub fn forward(&mut self, other: Timestamp) {
        if other > *self {
            *self = other;
        }
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{:09},{}", self.wall_time / 1_000_000_000, self.wall_time % 1_000_000_000, self.logical)
    }
}

/// Source of wall time for a `Clock`.
pub trait WallClock: Send + Sync + 'static {
    fn now_ns(&self) -> i64;
}

/// Wall source backed by the system clock.
#[derive(Debug, Default)]
pub struct SystemClock;

impl WallClock for SystemClock {
    fn now_ns(&self) -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos().min(i64::MAX as u128) as i64)
            .unwrap_or(0)
    }
}

/// Settable wall source for tests.
#[derive(Debug, Default)]
pub struct ManualClock {
    now_ns: AtomicI64,
}

impl ManualClock {
    pub fn new(now_ns: i64) -> Self {
        ManualClock {
            now_ns: AtomicI64::new(now_ns),
        }
    }

    pub fn set(&self, now_ns: i64) {
        self.now_ns.store(now_ns, Ordering::SeqCst);
    }

    pub fn increment(&self, delta_ns: i64) {
        self.now_ns.fetch_add(delta_ns, Ordering::SeqCst);
    }
}

impl WallClock for ManualClock {
    fn now_ns(&self) -> i64 {
        self.now_ns.load(Ordering::SeqCst)
    }
}

/// The hybrid logical clock: monotonic reads over a possibly non-monotonic
/// wall source, with a bounded-offset guarantee expressed by `max_offset`.
#[derive(Clone)]
pub struct Clock {
    wall: Arc<dyn WallClock>,
    max_offset_ns: i64,
    state: Arc<Mutex<Timestamp>>,
}

impl Clock {
    pub fn new(wall: Arc<dyn WallClock>) -> Self {
        Clock {
            wall,
            max_offset_ns: 0,
            state: Arc::new(Mutex::new(Timestamp::ZERO)),
        }
    }

    pub fn system() -> Self {
        Clock::new(Arc::new(SystemClock))
    }

    /// Maximum clock skew assumed between nodes, in nanoseconds.
    pub fn max_offset_ns(&self) -> i64 {
        self.max_offset_ns
    }

    pub fn set_max_offset_ns(&mut self, max_offset_ns: i64) {
        self.max_offset_ns = max_offset_ns;
    }

    /// Read and advance the clock.
    pub fn now(&self) -> Timestamp {
        let physical = self.wall.now_ns();
        let mut state = self.state.lock().unwrap();
        if physical > state.wall_time {
            *state = Timestamp::new(physical, 0);
        } else {
            *state = state.next();
        }
        *state
    }

    /// The last timestamp handed out, without advancing.
    pub fn last(&self) -> Timestamp {
        *self.state.lock().unwrap()
    }

    /// Fold a remote timestamp into the clock so later reads stay ahead of
    /// everything this node has observed.
    pub fn update(&self, remote: Timestamp) -> Timestamp {
        let physical = self.wall.now_ns();
        let mut state = self.state.lock().unwrap();
        let mut next = *state;
        next.forward(remote);
        if physical > next.wall_time {
            next = Timestamp::new(physical, 0);
        } else {
            next = next.next();
        }
        *state = next;
        next
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timestamp_ordering() {
        let a = Timestamp::new(1, 0);
        let b = Timestamp::new(1, 1);
        let c = Timestamp::new(2, 0);
        assert!(a < b && b < c);
        assert_eq!(a.next(), b);
        assert!(Timestamp::ZERO.is_zero());
    }

    #[test]
    fn clock_is_monotonic_over_a_frozen_wall_source() {
        let manual = Arc::new(ManualClock::new(100));
        let clock = Clock::new(manual.clone());
        let first = clock.now();
        let second = clock.now();
        assert!(second > first);
        assert_eq!(second.wall_time, 100);

        manual.set(200);
        let third = clock.now();
        assert_eq!(third, Timestamp::new(200, 0));
    }

    #[test]
    fn update_folds_remote_timestamps() {
        let manual = Arc::new(ManualClock::new(10));
        let clock = Clock::new(manual);
        let seen = clock.update(Timestamp::new(500, 3));
        assert!(seen > Timestamp::new(500, 3));
        assert!(clock.now() > Timestamp::new(500, 3));
    }
}
