use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::OwnedMutexGuard;

/// Keyed async mutex serializing writers per identity.
///
/// Claim creation, revocation and transition planning for one DID run one
/// at a time; different DIDs never contend.
#[derive(Debug, Default, Clone)]
pub struct IdentityLocks {
    inner: Arc<Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>>,
}

impl IdentityLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Waits for and returns the guard of `identifier`.
    pub async fn lock(&self, identifier: &str) -> OwnedMutexGuard<()> {
        let entry = {
            // A poisoned map only means another thread panicked while
            // inserting; the map itself is still usable.
            let mut map = match self.inner.lock() {
                Ok(map) => map,
                Err(poisoned) => poisoned.into_inner(),
            };
            map.entry(identifier.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone()
        };
        entry.lock_owned().await
    }

    /// Number of identities that have taken a lock so far.
    pub fn len(&self) -> usize {
        match self.inner.lock() {
            Ok(map) => map.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn same_identity_is_serialized() {
        let locks = IdentityLocks::new();
        let guard = locks.lock("did:a").await;

        let contender = locks.clone();
        let waiter = tokio::spawn(async move {
            let _g = contender.lock("did:a").await;
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished(), "second writer should wait");
        drop(guard);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should finish after release")
            .expect("task should not panic");
    }

    #[tokio::test]
    async fn different_identities_do_not_contend() {
        let locks = IdentityLocks::new();
        let _a = locks.lock("did:a").await;
        let b = tokio::time::timeout(Duration::from_millis(100), locks.lock("did:b")).await;
        assert!(b.is_ok());
        assert_eq!(locks.len(), 2);
    }
}
