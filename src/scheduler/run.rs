//! Scheduler loop
//!
//! Two states: running and stopped. Runs only inside the process currently
//! holding the scheduler lock; the lock-renewal task owns the other end of
//! the stop channel and cancels the loop the moment renewal fails.
//!
//! Every tick is a fresh, fully replacing read-modify-write of the state
//! subtree. Nothing is cached between ticks; concurrent writers and partial
//! views are tolerated by recomputing from scratch.

use crate::common::config::SchedulerConfig;
use crate::common::{now_nanos, Result};
use crate::scheduler::master::{find_master, select_master};
use crate::scheduler::reconcile::reconcile;
use crate::scheduler::registry::ClusterRegistry;
use std::time::Duration;
use tokio::sync::watch;

/// Periodic reconcile → select → persist driver.
pub struct Scheduler {
    registry: ClusterRegistry,
    interval: Duration,
    master_lease_margin: Duration,
}

impl Scheduler {
    pub fn new(registry: ClusterRegistry, config: &SchedulerConfig) -> Self {
        Self {
            registry,
            interval: config.interval(),
            master_lease_margin: config.master_lease_margin(),
        }
    }

    /// One reconciliation pass over fresh snapshots.
    ///
    /// The elected master's lease deadline is pushed to one tick plus the
    /// margin ahead, which is what makes its leadership sticky: the same
    /// loop that could demote it keeps it alive instead.
    pub async fn tick(&self) -> Result<()> {
        let announcements = self.registry.announcements().await?;
        let states = self.registry.states().await?;

        let states = reconcile(&announcements, states);
        let mut states = select_master(states);

        let deadline = now_nanos() + (self.interval + self.master_lease_margin).as_nanos() as i64;
        if let Some(master) = states.values_mut().find(|state| state.master) {
            master.ttl = deadline;
        }

        self.registry.save_states(&states).await
    }

    /// Run ticks until `stop` fires.
    ///
    /// A failed tick is logged and retried on the next one; transient store
    /// trouble must not cost the process its scheduling role. Only the lock
    /// caller decides that, by cancelling.
    pub async fn run(self, mut stop: watch::Receiver<bool>) {
        tracing::info!(
            "scheduler running over {} every {:?}",
            self.registry.base(),
            self.interval
        );
        loop {
            if let Err(e) = self.tick().await {
                tracing::warn!("scheduling tick failed: {}", e);
            }

            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {}
                _ = stop.changed() => {
                    tracing::info!("stopping scheduling");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::state::{NodeState, STATE_NEW};
    use crate::store::{KvStore, MemoryStore};
    use std::sync::Arc;

    fn scheduler() -> Scheduler {
        let store = Arc::new(MemoryStore::new()) as Arc<dyn KvStore>;
        let registry = ClusterRegistry::new(store, "/services/test", 5, 13);
        Scheduler::new(registry, &SchedulerConfig::default())
    }

    #[tokio::test]
    async fn test_tick_reconciles_and_elects() {
        let sched = scheduler();
        for (ip, session) in [("10.0.0.1", "s-1"), ("10.0.0.2", "s-2")] {
            sched
                .registry
                .announce(&NodeState::announcement(ip, session))
                .await
                .unwrap();
        }

        sched.tick().await.unwrap();

        let states = sched.registry.states().await.unwrap();
        assert_eq!(states.len(), 2);
        assert_eq!(states.values().filter(|s| s.master).count(), 1);
        for state in states.values() {
            assert_eq!(state.desired_state, STATE_NEW);
        }

        let master = states.values().find(|s| s.master).unwrap();
        assert!(master.ttl > now_nanos());
    }

    #[tokio::test]
    async fn test_tick_on_empty_service_is_a_noop() {
        let sched = scheduler();
        sched.tick().await.unwrap();
        assert!(sched.registry.states().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_run_stops_on_signal() {
        let sched = scheduler();
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(sched.run(rx));

        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("scheduler did not stop")
            .unwrap();
    }
}
