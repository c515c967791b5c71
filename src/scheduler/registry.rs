//! Announcement and state repositories
//!
//! Both live under the service base path: `announcements/<sessionID>` holds
//! the lease-backed liveness records nodes publish about themselves,
//! `states/<sessionID>` holds the reconciled records the scheduler writes
//! back. Announcements are read-only input to reconciliation; the state
//! subtree is its output and the sole channel agents learn their desired
//! state from.

use crate::common::{Error, Result};
use crate::scheduler::state::NodeState;
use crate::store::KvStore;
use std::collections::HashMap;
use std::sync::Arc;

/// Store-backed access to one service's announcement and state subtrees.
#[derive(Clone)]
pub struct ClusterRegistry {
    store: Arc<dyn KvStore>,
    base: String,
    announcement_ttl_secs: u64,
    state_ttl_secs: u64,
}

impl ClusterRegistry {
    pub fn new(
        store: Arc<dyn KvStore>,
        base: impl Into<String>,
        announcement_ttl_secs: u64,
        state_ttl_secs: u64,
    ) -> Self {
        Self {
            store,
            base: base.into(),
            announcement_ttl_secs,
            state_ttl_secs,
        }
    }

    pub fn base(&self) -> &str {
        &self.base
    }

    /// Key of the scheduler lock for this service.
    pub fn lock_key(&self) -> String {
        format!("{}/master", self.base)
    }

    fn announcements_key(&self) -> String {
        format!("{}/announcements", self.base)
    }

    fn states_key(&self) -> String {
        format!("{}/states", self.base)
    }

    async fn read_records(&self, key: &str) -> Result<HashMap<String, NodeState>> {
        let entries = match self.store.get(key, true).await {
            Ok(entries) => entries,
            // An empty subtree and a missing one mean the same thing here.
            Err(Error::KeyNotFound(_)) => return Ok(HashMap::new()),
            Err(e) => return Err(e),
        };

        let mut records = HashMap::new();
        for entry in entries {
            let state: NodeState = serde_json::from_str(&entry.value)?;
            records.insert(entry.leaf().to_string(), state);
        }
        Ok(records)
    }

    /// Live announcements, keyed by session ID.
    pub async fn announcements(&self) -> Result<HashMap<String, NodeState>> {
        self.read_records(&self.announcements_key()).await
    }

    /// Persisted states, keyed by session ID.
    pub async fn states(&self) -> Result<HashMap<String, NodeState>> {
        self.read_records(&self.states_key()).await
    }

    /// Publish a node's announcement under its session ID with the heartbeat
    /// lease.
    pub async fn announce(&self, state: &NodeState) -> Result<()> {
        let key = format!("{}/{}", self.announcements_key(), state.session_id);
        let value = serde_json::to_string(state)?;
        self.store
            .set(&key, &value, Some(self.announcement_ttl_secs))
            .await
    }

    /// Persist the full reconciled state set, one record per session ID.
    pub async fn save_states(&self, states: &HashMap<String, NodeState>) -> Result<()> {
        for state in states.values() {
            let key = format!("{}/{}", self.states_key(), state.session_id);
            let value = serde_json::to_string(state)?;
            self.store
                .set(&key, &value, Some(self.state_ttl_secs))
                .await?;
        }
        Ok(())
    }

    /// Drop the whole state subtree. Missing subtree is fine.
    pub async fn clear_states(&self) -> Result<()> {
        match self.store.delete(&self.states_key(), true).await {
            Ok(()) | Err(Error::KeyNotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Drop the whole announcement subtree. Missing subtree is fine.
    pub async fn clear_announcements(&self) -> Result<()> {
        match self.store.delete(&self.announcements_key(), true).await {
            Ok(()) | Err(Error::KeyNotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::state::STATE_NEW;
    use crate::store::MemoryStore;

    fn registry() -> ClusterRegistry {
        ClusterRegistry::new(Arc::new(MemoryStore::new()), "/services/test", 5, 13)
    }

    #[tokio::test]
    async fn test_empty_subtrees_read_as_empty_maps() {
        let reg = registry();
        assert!(reg.announcements().await.unwrap().is_empty());
        assert!(reg.states().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_announce_roundtrip() {
        let reg = registry();
        let ann = NodeState::announcement("10.0.0.1", "s-1");
        reg.announce(&ann).await.unwrap();

        let got = reg.announcements().await.unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got["s-1"], ann);
    }

    #[tokio::test]
    async fn test_save_states_keyed_by_session() {
        let reg = registry();
        let mut states = HashMap::new();
        let mut a = NodeState::announcement("10.0.0.1", "s-1");
        a.desired_state = STATE_NEW.to_string();
        states.insert("s-1".to_string(), a.clone());
        reg.save_states(&states).await.unwrap();

        let got = reg.states().await.unwrap();
        assert_eq!(got["s-1"], a);
    }

    #[tokio::test]
    async fn test_clear_is_idempotent() {
        let reg = registry();
        reg.clear_states().await.unwrap();
        let ann = NodeState::announcement("10.0.0.1", "s-1");
        reg.announce(&ann).await.unwrap();
        reg.clear_announcements().await.unwrap();
        assert!(reg.announcements().await.unwrap().is_empty());
        reg.clear_announcements().await.unwrap();
    }

    #[tokio::test]
    async fn test_lock_key() {
        assert_eq!(registry().lock_key(), "/services/test/master");
    }
}
