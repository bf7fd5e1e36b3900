//! Gossip seam.
//!
//! Cluster metadata distribution is an external collaborator; the store only
//! needs a handle to publish config records when a replica acquires the
//! lease covering them. Tests inject a recording implementation.

use std::sync::Mutex;

pub trait Gossip: Send + Sync + 'static {
    /// Publish `content` under `key`, replacing any prior value.
    fn add_info(&self, key: &str, content: Vec<u8>);
}

/// Discards everything; the default for stores without a gossip network.
#[derive(Debug, Default)]
pub struct NullGossip;

impl Gossip for NullGossip {
    fn add_info(&self, _key: &str, _content: Vec<u8>) {}
}

/// Records published infos for assertions.
#[derive(Debug, Default)]
pub struct RecordingGossip {
    infos: Mutex<Vec<(String, Vec<u8>)>>,
}

impl RecordingGossip {
    pub fn new() -> Self {
        Self::default()
    }

    /// All recorded `(key, content)` pairs, in publish order.
    pub fn infos(&self) -> Vec<(String, Vec<u8>)> {
        self.infos.lock().unwrap().clone()
    }

    pub fn keys(&self) -> Vec<String> {
        self.infos
            .lock()
            .unwrap()
            .iter()
            .map(|(k, _)| k.clone())
            .collect()
    }

    pub fn clear(&self) {
        self.infos.lock().unwrap().clear();
    }
}

impl Gossip for RecordingGossip {
    fn add_info(&self, key: &str, content: Vec<u8>) {
        self.infos.lock().unwrap().push((key.to_string(), content));
    }
}
