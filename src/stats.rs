//! Per-source key/value statistics store.
//!
//! Stand-in seam for the external stats aggregator. The metadata builder
//! reads stream facts (`server_name`, `ice-samplerate`, ...) from here and
//! stamps `title` / `metadata_url` / `metadata_updated` back, all under
//! the store's own lock so listeners never observe a half-written update.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

/// Lock-stamped key/value store shared by one source and its observers.
#[derive(Debug, Default)]
pub struct Stats {
    inner: Mutex<HashMap<String, String>>,
}

impl Stats {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets `key` to `value`, replacing any previous value.
    pub fn set(&self, key: &str, value: &str) {
        let mut map = self.inner.lock().expect("stats lock poisoned");
        map.insert(key.to_string(), value.to_string());
    }

    /// Stamps `key` with the current unix time in seconds.
    pub fn set_time(&self, key: &str) {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        self.set(key, &now.to_string());
    }

    /// Fetches a copy of the value for `key`.
    pub fn retrieve(&self, key: &str) -> Option<String> {
        let map = self.inner.lock().expect("stats lock poisoned");
        map.get(key).cloned()
    }

    /// Removes `key` from the store.
    pub fn remove(&self, key: &str) {
        let mut map = self.inner.lock().expect("stats lock poisoned");
        map.remove(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_and_retrieve_round_trip() {
        let stats = Stats::new();
        stats.set("server_name", "test radio");
        assert_eq!(stats.retrieve("server_name").as_deref(), Some("test radio"));
        stats.set("server_name", "renamed");
        assert_eq!(stats.retrieve("server_name").as_deref(), Some("renamed"));
        stats.remove("server_name");
        assert!(stats.retrieve("server_name").is_none());
    }

    #[test]
    fn time_stamp_parses_as_seconds() {
        let stats = Stats::new();
        stats.set_time("metadata_updated");
        let stamp = stats.retrieve("metadata_updated").unwrap();
        assert!(stamp.parse::<u64>().unwrap() > 0);
    }
}
