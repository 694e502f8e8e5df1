//! Short-lived entity guards
//!
//! Two of these maps shield the engine from double-applying its own work:
//! one marks entities freshly written locally so a concurrent pull does not
//! revert them, the other marks entities just applied by the realtime path
//! so a near-simultaneous poll result is dropped.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use tidemark_domain::constants::RECENT_GUARD_TTL_MS;

/// Entity-id set with per-entry expiry.
pub struct RecentGuard {
    ttl: Duration,
    entries: Mutex<HashMap<String, Instant>>,
}

impl RecentGuard {
    /// Guard with the engine's standard 2 s window.
    pub fn new() -> Self {
        Self::with_ttl(Duration::from_millis(RECENT_GUARD_TTL_MS))
    }

    /// Guard with a custom window; used by tests.
    pub fn with_ttl(ttl: Duration) -> Self {
        Self { ttl, entries: Mutex::new(HashMap::new()) }
    }

    /// Record an entity as recently touched.
    pub fn mark(&self, entity_id: &str) {
        self.entries.lock().insert(entity_id.to_string(), Instant::now());
    }

    /// Whether the entity is inside the guard window. Expired entries are
    /// pruned on the way through.
    pub fn contains(&self, entity_id: &str) -> bool {
        let mut entries = self.entries.lock();
        match entries.get(entity_id) {
            Some(at) if at.elapsed() < self.ttl => true,
            Some(_) => {
                entries.remove(entity_id);
                false
            }
            None => false,
        }
    }

    /// Live entry count after pruning expired ones.
    pub fn len(&self) -> usize {
        let mut entries = self.entries.lock();
        let ttl = self.ttl;
        entries.retain(|_, at| at.elapsed() < ttl);
        entries.len()
    }

    /// Whether the guard holds no live entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every entry.
    pub fn clear(&self) {
        self.entries.lock().clear();
    }
}

impl Default for RecentGuard {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn marked_entities_are_guarded() {
        let guard = RecentGuard::new();
        guard.mark("e-1");

        assert!(guard.contains("e-1"));
        assert!(!guard.contains("e-2"));
        assert_eq!(guard.len(), 1);
    }

    #[test]
    fn entries_expire_after_ttl() {
        let guard = RecentGuard::with_ttl(Duration::from_millis(20));
        guard.mark("e-1");
        assert!(guard.contains("e-1"));

        std::thread::sleep(Duration::from_millis(30));

        assert!(!guard.contains("e-1"));
        assert!(guard.is_empty());
    }

    #[test]
    fn clear_removes_everything() {
        let guard = RecentGuard::new();
        guard.mark("e-1");
        guard.mark("e-2");

        guard.clear();

        assert!(guard.is_empty());
    }
}
