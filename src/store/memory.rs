//! In-memory coordination store
//!
//! Behaves like the etcd backend, lease expiry included, without leaving the
//! process. Tests inject it wherever an `Arc<dyn KvStore>` is expected; the
//! agent's what-if mode could run against it end to end.

use crate::common::{Error, Result};
use crate::store::client::{BoxFuture, KvEntry, KvStore};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
struct MemEntry {
    value: String,
    expires_at: Option<Instant>,
}

impl MemEntry {
    fn expired(&self) -> bool {
        self.expires_at.is_some_and(|at| Instant::now() >= at)
    }

    fn remaining_secs(&self) -> Option<i64> {
        self.expires_at
            .map(|at| at.saturating_duration_since(Instant::now()).as_secs() as i64)
    }
}

/// In-process [`KvStore`] with real TTL expiry.
#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, MemEntry>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn purge(entries: &mut HashMap<String, MemEntry>) {
        entries.retain(|_, e| !e.expired());
    }

    fn subtree_prefix(key: &str) -> String {
        format!("{}/", key.trim_end_matches('/'))
    }

    fn insert(
        entries: &mut HashMap<String, MemEntry>,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) {
        entries.insert(
            key.to_string(),
            MemEntry {
                value: value.to_string(),
                expires_at: ttl.map(|t| Instant::now() + t),
            },
        );
    }

    fn set_sync(&self, key: &str, value: &str, ttl: Option<Duration>) {
        let mut entries = self.entries.lock().unwrap();
        Self::purge(&mut entries);
        Self::insert(&mut entries, key, value, ttl);
    }

    fn create_sync(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        let mut entries = self.entries.lock().unwrap();
        Self::purge(&mut entries);
        if entries.contains_key(key) {
            return Err(Error::KeyExists(key.to_string()));
        }
        Self::insert(&mut entries, key, value, ttl);
        Ok(())
    }

    fn cas_sync(
        &self,
        key: &str,
        prev_value: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<()> {
        let mut entries = self.entries.lock().unwrap();
        Self::purge(&mut entries);
        match entries.get(key) {
            None => Err(Error::KeyNotFound(key.to_string())),
            Some(e) if e.value != prev_value => Err(Error::CompareFailed(key.to_string())),
            Some(_) => {
                Self::insert(&mut entries, key, value, ttl);
                Ok(())
            }
        }
    }

    fn cad_sync(&self, key: &str, prev_value: &str) -> Result<()> {
        let mut entries = self.entries.lock().unwrap();
        Self::purge(&mut entries);
        match entries.get(key) {
            None => Err(Error::KeyNotFound(key.to_string())),
            Some(e) if e.value != prev_value => Err(Error::CompareFailed(key.to_string())),
            Some(_) => {
                entries.remove(key);
                Ok(())
            }
        }
    }

    fn get_sync(&self, key: &str, recursive: bool) -> Result<Vec<KvEntry>> {
        let mut entries = self.entries.lock().unwrap();
        Self::purge(&mut entries);

        if let Some(e) = entries.get(key) {
            return Ok(vec![KvEntry {
                key: key.to_string(),
                value: e.value.clone(),
                ttl: e.remaining_secs(),
            }]);
        }

        let prefix = Self::subtree_prefix(key);
        let mut found: Vec<KvEntry> = entries
            .iter()
            .filter(|(k, _)| k.starts_with(&prefix))
            .map(|(k, e)| KvEntry {
                key: k.clone(),
                value: e.value.clone(),
                ttl: e.remaining_secs(),
            })
            .collect();
        found.sort_by(|a, b| a.key.cmp(&b.key));

        if found.is_empty() {
            return Err(Error::KeyNotFound(key.to_string()));
        }
        if !recursive {
            // Non-recursive directory reads still list direct children,
            // matching the etcd v2 listing shape the repositories rely on.
            found.retain(|e| !e.key[prefix.len()..].contains('/'));
        }
        Ok(found)
    }

    fn delete_sync(&self, key: &str, recursive: bool) -> Result<()> {
        let mut entries = self.entries.lock().unwrap();
        Self::purge(&mut entries);
        if entries.remove(key).is_some() {
            return Ok(());
        }
        if recursive {
            let prefix = Self::subtree_prefix(key);
            let before = entries.len();
            entries.retain(|k, _| !k.starts_with(&prefix));
            if entries.len() < before {
                return Ok(());
            }
        }
        Err(Error::KeyNotFound(key.to_string()))
    }
}

impl KvStore for MemoryStore {
    fn get<'a>(&'a self, key: &'a str, recursive: bool) -> BoxFuture<'a, Result<Vec<KvEntry>>> {
        Box::pin(async move { self.get_sync(key, recursive) })
    }

    fn set<'a>(
        &'a self,
        key: &'a str,
        value: &'a str,
        ttl: Option<u64>,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            self.set_sync(key, value, ttl.map(Duration::from_secs));
            Ok(())
        })
    }

    fn create<'a>(
        &'a self,
        key: &'a str,
        value: &'a str,
        ttl: Option<u64>,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move { self.create_sync(key, value, ttl.map(Duration::from_secs)) })
    }

    fn compare_and_swap<'a>(
        &'a self,
        key: &'a str,
        prev_value: &'a str,
        value: &'a str,
        ttl: Option<u64>,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            self.cas_sync(key, prev_value, value, ttl.map(Duration::from_secs))
        })
    }

    fn compare_and_delete<'a>(
        &'a self,
        key: &'a str,
        prev_value: &'a str,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move { self.cad_sync(key, prev_value) })
    }

    fn delete<'a>(&'a self, key: &'a str, recursive: bool) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move { self.delete_sync(key, recursive) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_set_get_roundtrip() {
        let store = MemoryStore::new();
        store.set("/a/b", "hello", None).await.unwrap();
        let got = store.get("/a/b", false).await.unwrap();
        assert_eq!(got[0].value, "hello");
        assert_eq!(got[0].ttl, None);
    }

    #[tokio::test]
    async fn test_recursive_get_lists_subtree() {
        let store = MemoryStore::new();
        store.set("/base/states/n1", "1", None).await.unwrap();
        store.set("/base/states/n2", "2", None).await.unwrap();
        store.set("/base/announcements/n1", "x", None).await.unwrap();

        let got = store.get("/base/states", true).await.unwrap();
        assert_eq!(got.len(), 2);
        assert_eq!(got[0].leaf(), "n1");
        assert_eq!(got[1].leaf(), "n2");
    }

    #[tokio::test]
    async fn test_missing_key_not_found() {
        let store = MemoryStore::new();
        assert!(matches!(
            store.get("/nope", true).await,
            Err(Error::KeyNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_create_respects_existing() {
        let store = MemoryStore::new();
        store.create("/lock", "me", Some(5)).await.unwrap();
        assert!(matches!(
            store.create("/lock", "you", Some(5)).await,
            Err(Error::KeyExists(_))
        ));
    }

    #[tokio::test]
    async fn test_cas_guards_value() {
        let store = MemoryStore::new();
        store.set("/lock", "me", None).await.unwrap();
        assert!(matches!(
            store.compare_and_swap("/lock", "you", "you", None).await,
            Err(Error::CompareFailed(_))
        ));
        store
            .compare_and_swap("/lock", "me", "me", Some(5))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_cad_guards_value() {
        let store = MemoryStore::new();
        store.set("/lock", "me", None).await.unwrap();
        assert!(matches!(
            store.compare_and_delete("/lock", "you").await,
            Err(Error::CompareFailed(_))
        ));
        store.compare_and_delete("/lock", "me").await.unwrap();
        assert!(store.get("/lock", false).await.is_err());
    }

    #[tokio::test]
    async fn test_recursive_delete() {
        let store = MemoryStore::new();
        store.set("/base/states/n1", "1", None).await.unwrap();
        store.set("/base/states/n2", "2", None).await.unwrap();
        store.delete("/base/states", true).await.unwrap();
        assert!(store.get("/base/states", true).await.is_err());
    }

    #[test]
    fn test_lease_expiry() {
        let store = MemoryStore::new();
        store.set_sync("/a", "1", Some(Duration::from_millis(30)));
        assert!(store.get_sync("/a", false).is_ok());
        std::thread::sleep(Duration::from_millis(60));
        assert!(matches!(
            store.get_sync("/a", false),
            Err(Error::KeyNotFound(_))
        ));
    }

    #[test]
    fn test_expired_key_can_be_recreated() {
        let store = MemoryStore::new();
        store.set_sync("/lock", "me", Some(Duration::from_millis(20)));
        std::thread::sleep(Duration::from_millis(50));
        assert!(store
            .create_sync("/lock", "you", Some(Duration::from_secs(5)))
            .is_ok());
    }
}
