//! Short-lived keyed stores for QR payloads and auth sessions.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;

/// Concurrent map whose entries expire `ttl` after insertion.
///
/// Expired entries are invisible to [`get`](Self::get) right away and are
/// dropped from memory on [`sweep`](Self::sweep).
#[derive(Debug, Clone)]
pub struct TtlStore<V> {
    ttl: Duration,
    entries: Arc<Mutex<HashMap<String, (Instant, V)>>>,
}

impl<V: Clone> TtlStore<V> {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<String, (Instant, V)>> {
        match self.entries.lock() {
            Ok(map) => map,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn insert(&self, key: impl Into<String>, value: V) {
        let expires = Instant::now() + self.ttl;
        self.entries().insert(key.into(), (expires, value));
    }

    pub fn get(&self, key: &str) -> Option<V> {
        let now = Instant::now();
        self.entries()
            .get(key)
            .filter(|(expires, _)| *expires > now)
            .map(|(_, value)| value.clone())
    }

    pub fn remove(&self, key: &str) -> Option<V> {
        let now = Instant::now();
        self.entries()
            .remove(key)
            .filter(|(expires, _)| *expires > now)
            .map(|(_, value)| value)
    }

    /// Drops expired entries and returns how many went.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries();
        let before = entries.len();
        entries.retain(|_, (expires, _)| *expires > now);
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn entries_expire_and_sweep() {
        let store = TtlStore::new(Duration::from_secs(100));
        store.insert("qr", "payload".to_string());
        assert_eq!(store.get("qr").as_deref(), Some("payload"));

        tokio::time::advance(Duration::from_secs(50)).await;
        store.insert("late", "other".to_string());
        assert_eq!(store.sweep(), 0);

        tokio::time::advance(Duration::from_secs(51)).await;
        assert!(store.get("qr").is_none());
        assert_eq!(store.len(), 2);
        assert_eq!(store.sweep(), 1);
        assert_eq!(store.get("late").as_deref(), Some("other"));
    }

    #[tokio::test(start_paused = true)]
    async fn remove_ignores_expired() {
        let store = TtlStore::new(Duration::from_secs(1));
        store.insert("a", 1u32);
        assert_eq!(store.remove("a"), Some(1));
        store.insert("b", 2u32);
        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(store.remove("b"), None);
        assert!(store.is_empty());
    }
}
