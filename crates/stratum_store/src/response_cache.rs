//! Per-range idempotence store.
//!
//! Replies (and errors) are recorded under `(range_id, command_id)` inside
//! the same engine batch that applies the command, so a re-delivered command
//! id replays the original outcome instead of re-executing. A corrupted entry
//! surfaces as a decode error rather than silently re-executing.

use serde::{Deserialize, Serialize};

use crate::api::{CommandId, Response};
use crate::engine::EngineState;
use crate::error::RangeError;
use crate::keys;

/// Serialized form of a cached outcome.
#[derive(Clone, Debug, Serialize, Deserialize)]
struct CachedOutcome {
    result: Result<Response, RangeError>,
}

/// Handle scoped to one range's slice of the cache.
#[derive(Clone, Copy, Debug)]
pub struct ResponseCache {
    range_id: u64,
}

impl ResponseCache {
    pub fn new(range_id: u64) -> Self {
        ResponseCache { range_id }
    }

    /// Look up a prior outcome. Zero command ids never hit the cache.
    pub fn get(
        &self,
        engine: &EngineState,
        command_id: CommandId,
    ) -> Option<Result<Response, RangeError>> {
        if command_id.is_empty() {
            return None;
        }
        let key = keys::response_cache_key(self.range_id, command_id.wall_time, command_id.random);
        let bytes = engine.sys_get(&key)?;
        match serde_json::from_slice::<CachedOutcome>(bytes) {
            Ok(outcome) => Some(outcome.result),
            Err(err) => Some(Err(RangeError::internal(format!(
                "response cache decode failed for command {}: {err}",
                command_id.key()
            )))),
        }
    }

    /// Record an outcome; must be called inside the apply batch.
    pub fn put(
        &self,
        engine: &mut EngineState,
        command_id: CommandId,
        result: &Result<Response, RangeError>,
    ) {
        if command_id.is_empty() {
            return;
        }
        let key = keys::response_cache_key(self.range_id, command_id.wall_time, command_id.random);
        let outcome = CachedOutcome {
            result: result.clone(),
        };
        let bytes = serde_json::to_vec(&outcome).expect("response cache entries serialize");
        engine.sys_put(key, bytes);
    }

    /// Discard the whole range's cache; used when the range is removed.
    pub fn clear(&self, engine: &mut EngineState) {
        engine.sys_clear_prefix(&keys::response_cache_prefix(self.range_id));
    }
}
