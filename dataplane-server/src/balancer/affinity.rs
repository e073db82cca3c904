//! Session/client affinity: once a key first routes to an
//! endpoint, subsequent requests stick to it until the window expires or
//! the endpoint is no longer available.

use std::time::{Duration, Instant};

use dashmap::DashMap;

pub struct AffinityTable {
    window: Duration,
    bindings: DashMap<String, (String, Instant)>,
}

impl AffinityTable {
    pub fn new(window: Duration) -> Self {
        Self { window, bindings: DashMap::new() }
    }

    pub fn get(&self, key: &str) -> Option<String> {
        let entry = self.bindings.get(key)?;
        let (endpoint_id, bound_at) = entry.value().clone();
        if bound_at.elapsed() > self.window {
            drop(entry);
            self.bindings.remove(key);
            return None;
        }
        Some(endpoint_id)
    }

    pub fn bind(&self, key: &str, endpoint_id: &str) {
        self.bindings.insert(key.to_string(), (endpoint_id.to_string(), Instant::now()));
    }

    pub fn clear(&self, key: &str) {
        self.bindings.remove(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn binding_sticks_within_window() {
        let t = AffinityTable::new(Duration::from_secs(60));
        t.bind("session-1", "db2");
        assert_eq!(t.get("session-1"), Some("db2".to_string()));
    }

    #[test]
    fn binding_expires_after_window() {
        let t = AffinityTable::new(Duration::from_millis(1));
        t.bind("session-1", "db2");
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(t.get("session-1"), None);
    }
}
