//! Lease-based distributed lock
//!
//! Mutual exclusion built from two store primitives: create-if-absent plants
//! the lock, and a compare-and-swap guarded by the holder's own identifier
//! re-asserts it while refreshing the lease. Whichever process keeps the
//! lock on the service's `master` key is the one allowed to run the
//! scheduler loop; letting the lease lapse hands the role over.
//!
//! `Error::LockInUse` is the expected steady state for every other process,
//! not a failure.

use crate::common::{Error, Result};
use crate::store::KvStore;
use std::sync::Arc;

/// Handle on one contender's view of a lease lock.
#[derive(Clone)]
pub struct DistributedLock {
    store: Arc<dyn KvStore>,
    namespace: String,
    identifier: String,
    lease_secs: u64,
}

impl DistributedLock {
    pub fn new(
        store: Arc<dyn KvStore>,
        namespace: impl Into<String>,
        identifier: impl Into<String>,
        lease_secs: u64,
    ) -> Self {
        Self {
            store,
            namespace: namespace.into(),
            identifier: identifier.into(),
            lease_secs,
        }
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    /// Acquire or renew the lock, refreshing its lease.
    ///
    /// Safe to call repeatedly; the holder renews, everyone else gets
    /// `Error::LockInUse`. Store failures other than the compare losing
    /// propagate unchanged.
    pub async fn acquire(&self) -> Result<()> {
        match self
            .store
            .create(&self.namespace, &self.identifier, Some(self.lease_secs))
            .await
        {
            // Planted fresh or already present; the swap below decides
            // ownership either way.
            Ok(()) | Err(Error::KeyExists(_)) => {}
            Err(e) => {
                tracing::warn!("lock create failed: {}", e);
                return Err(e);
            }
        }

        match self
            .store
            .compare_and_swap(
                &self.namespace,
                &self.identifier,
                &self.identifier,
                Some(self.lease_secs),
            )
            .await
        {
            Ok(()) => Ok(()),
            Err(Error::CompareFailed(_)) => Err(Error::LockInUse),
            Err(e) => {
                tracing::warn!("lock swap failed: {}", e);
                Err(e)
            }
        }
    }

    /// Release a held lock.
    ///
    /// Re-acquires first to prove ownership, then deletes guarded by the
    /// identifier; a lock held by someone else is never evicted.
    pub async fn release(&self) -> Result<()> {
        self.acquire().await?;
        self.store
            .compare_and_delete(&self.namespace, &self.identifier)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn lock(store: &Arc<MemoryStore>, id: &str) -> DistributedLock {
        DistributedLock::new(store.clone() as Arc<dyn KvStore>, "/svc/master", id, 5)
    }

    #[tokio::test]
    async fn test_acquire_and_renew() {
        let store = Arc::new(MemoryStore::new());
        let mine = lock(&store, "id-1");
        mine.acquire().await.unwrap();
        // Renewal by the holder succeeds and refreshes the lease.
        mine.acquire().await.unwrap();
    }

    #[tokio::test]
    async fn test_contender_sees_lock_in_use() {
        let store = Arc::new(MemoryStore::new());
        lock(&store, "id-1").acquire().await.unwrap();

        let theirs = lock(&store, "id-2");
        assert!(matches!(theirs.acquire().await, Err(Error::LockInUse)));
    }

    #[tokio::test]
    async fn test_release_hands_over() {
        let store = Arc::new(MemoryStore::new());
        let mine = lock(&store, "id-1");
        mine.acquire().await.unwrap();
        mine.release().await.unwrap();

        lock(&store, "id-2").acquire().await.unwrap();
    }

    #[tokio::test]
    async fn test_release_of_foreign_lock_fails_safely() {
        let store = Arc::new(MemoryStore::new());
        lock(&store, "id-1").acquire().await.unwrap();

        assert!(matches!(
            lock(&store, "id-2").release().await,
            Err(Error::LockInUse)
        ));
        // The rightful holder still renews fine.
        lock(&store, "id-1").acquire().await.unwrap();
    }
}
