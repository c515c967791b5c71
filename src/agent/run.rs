//! Node agent loop
//!
//! Each node runs exactly one agent. Every heartbeat it publishes a
//! lease-backed announcement, reads the state record the reconciler wrote
//! for its session, and closes the gap between the desired lifecycle phase
//! and the one it has actually achieved by driving the cluster's
//! administrative API. When the fleet has no master at all, agents race for
//! the scheduler lock; the winner hosts the scheduler loop until its lease
//! renewal fails.

use crate::agent::cluster_client::ClusterApi;
use crate::common::config::Config;
use crate::common::{retry_with_backoff, Error, Result};
use crate::scheduler::lock::DistributedLock;
use crate::scheduler::master::find_master;
use crate::scheduler::registry::ClusterRegistry;
use crate::scheduler::run::Scheduler;
use crate::scheduler::state::{NodeState, STATE_CLUSTERED, STATE_EMPTY, STATE_NEW};
use crate::store::KvStore;
use rand::Rng;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// A held scheduler role: the stop handle shared with the renewal task, and
/// whether the role is still live.
struct SchedulerRole {
    active: Arc<AtomicBool>,
    stop: Arc<watch::Sender<bool>>,
}

/// Per-node control loop.
pub struct Agent {
    registry: ClusterRegistry,
    cluster: ClusterApi,
    lock: DistributedLock,
    config: Config,
    session_id: String,
    ip_address: String,
    /// Self-observed lifecycle phase, announced every heartbeat
    state: String,
    role: Option<SchedulerRole>,
}

impl Agent {
    pub fn new(store: Arc<dyn KvStore>, config: Config, ip_address: String) -> Result<Self> {
        let session_id = uuid::Uuid::new_v4().to_string();
        let registry = ClusterRegistry::new(
            store.clone(),
            config.store.service_path.clone(),
            config.agent.announcement_ttl_secs,
            config.scheduler.state_ttl(),
        );
        let lock = DistributedLock::new(
            store,
            registry.lock_key(),
            session_id.clone(),
            config.scheduler.lock_lease_secs,
        );
        let cluster = ClusterApi::new(config.cluster.clone())?;
        Ok(Self {
            registry,
            cluster,
            lock,
            config,
            session_id,
            ip_address,
            state: STATE_EMPTY.to_string(),
            role: None,
        })
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn registry(&self) -> &ClusterRegistry {
        &self.registry
    }

    /// The liveness record this node publishes about itself. Carries the
    /// self-observed state; never a desired state, which only the
    /// reconciler writes.
    fn announcement(&self) -> NodeState {
        let mut ann = NodeState::announcement(self.ip_address.clone(), self.session_id.clone());
        ann.state = self.state.clone();
        ann
    }

    /// One heartbeat: converge toward the desired state, then announce.
    ///
    /// The announcement goes out even when convergence failed, so the
    /// node's lease stays alive while it retries.
    pub async fn tick(&mut self) -> Result<()> {
        let converged = self.converge().await;
        let announced = self.registry.announce(&self.announcement()).await;
        converged.and(announced)
    }

    async fn converge(&mut self) -> Result<()> {
        let states = self.registry.states().await?;
        match find_master(&states) {
            None => self.try_acquire_scheduler_role().await,
            Some(master) => {
                let master = master.clone();
                let Some(my_state) = states.get(&self.session_id) else {
                    tracing::debug!("no reconciled state yet for session {}", self.session_id);
                    return Ok(());
                };
                if my_state.desired_state == self.state {
                    return Ok(());
                }
                let desired = my_state.desired_state.clone();
                tracing::info!(
                    "desired state: {:?} - current state: {:?}",
                    desired,
                    self.state
                );
                self.apply_desired_state(&desired, &master).await
            }
        }
    }

    /// Dispatch on the reconciler-assigned phase. The master never drives
    /// itself through the cluster API; it is definitionally already a
    /// member, so it just confirms.
    async fn apply_desired_state(&mut self, desired: &str, master: &NodeState) -> Result<()> {
        match desired {
            STATE_NEW => {
                if master.ip_address == self.ip_address {
                    tracing::info!("already master, no action required");
                } else if self.config.agent.what_if {
                    tracing::info!("what-if: would join cluster under {}", master.ip_address);
                } else {
                    tracing::info!("adding server to cluster under {}", master.ip_address);
                    let already = self
                        .cluster
                        .add_node(&master.ip_address, &self.ip_address)
                        .await?;
                    if already {
                        tracing::info!("already part of cluster");
                    }
                }
                self.state = desired.to_string();
                Ok(())
            }
            STATE_CLUSTERED => {
                if master.ip_address == self.ip_address {
                    tracing::info!("already master, no action required");
                } else if self.config.agent.what_if {
                    tracing::info!("what-if: would rebalance with {}", master.ip_address);
                } else {
                    self.cluster
                        .rebalance(&master.ip_address, &self.ip_address)
                        .await?;
                }
                self.state = desired.to_string();
                Ok(())
            }
            other => Err(Error::Protocol(format!(
                "no transition defined for desired state {:?}",
                other
            ))),
        }
    }

    /// Race for the scheduler lock when the fleet has no master. Losing is
    /// the normal outcome for all but one process.
    async fn try_acquire_scheduler_role(&mut self) -> Result<()> {
        if let Some(role) = &self.role {
            if role.active.load(Ordering::SeqCst) {
                // Still holding the role; the scheduler just has not
                // elected a master yet.
                return Ok(());
            }
            self.role = None;
        }

        // Splay the acquisition attempts so a fresh fleet does not hammer
        // the lock key in lockstep.
        let splay_ms: u64 = rand::thread_rng().gen_range(0..250);
        tokio::time::sleep(Duration::from_millis(splay_ms)).await;

        match self.lock.acquire().await {
            Ok(()) => {
                self.start_scheduler_role();
                Ok(())
            }
            Err(Error::LockInUse) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Spawn the scheduler loop plus the renewal task that keeps (or
    /// forfeits) the mandate to run it.
    fn start_scheduler_role(&mut self) {
        tracing::info!("acquired scheduler lock, starting scheduler");
        let (stop_tx, stop_rx) = watch::channel(false);
        let stop = Arc::new(stop_tx);
        let active = Arc::new(AtomicBool::new(true));

        let sched = Scheduler::new(self.registry.clone(), &self.config.scheduler);
        tokio::spawn(sched.run(stop_rx));

        let lock = self.lock.clone();
        let cluster = self.cluster.clone();
        let ip = self.ip_address.clone();
        let renew_period = Duration::from_secs(self.config.scheduler.lock_renew_secs);
        let auto_failover = if self.config.agent.what_if {
            None
        } else {
            self.config.agent.auto_failover_timeout_secs
        };
        let task_active = active.clone();
        let task_stop = stop.clone();
        let mut task_stop_rx = stop.subscribe();

        tokio::spawn(async move {
            let mut failover_set = auto_failover.is_none();
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(renew_period) => {}
                    _ = task_stop_rx.changed() => break,
                }

                if let Err(e) = lock.acquire().await {
                    // Lost the lease; the scheduler must not keep running
                    // without the mandate.
                    tracing::warn!("scheduler lock renewal failed: {}", e);
                    task_active.store(false, Ordering::SeqCst);
                    let _ = task_stop.send(true);
                    break;
                }

                if !failover_set {
                    if let Some(timeout) = auto_failover {
                        match retry_with_backoff(
                            || cluster.set_auto_failover(&ip, timeout),
                            3,
                            Duration::from_millis(500),
                        )
                        .await
                        {
                            Ok(()) => {
                                tracing::info!("auto-failover enabled ({}s)", timeout);
                                failover_set = true;
                            }
                            Err(e) => tracing::warn!("enabling auto-failover failed: {}", e),
                        }
                    }
                }
            }
        });

        self.role = Some(SchedulerRole { active, stop });
    }

    /// Run heartbeats until `shutdown` fires, then leave the cluster
    /// gracefully.
    ///
    /// Only protocol violations and non-retryable store errors abort the
    /// loop; everything else is retried next heartbeat.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        tracing::info!(
            "agent running: machine {} session {}",
            self.ip_address,
            self.session_id
        );
        loop {
            match self.tick().await {
                Ok(()) => {}
                Err(e) if e.is_fatal() => {
                    tracing::error!("fatal agent error: {}", e);
                    return Err(e);
                }
                Err(e) => tracing::warn!("agent tick failed: {}", e),
            }

            tokio::select! {
                _ = tokio::time::sleep(self.config.agent.heartbeat()) => {}
                _ = shutdown.changed() => break,
            }
        }
        self.shutdown().await;
        Ok(())
    }

    /// Orderly exit: drain, give up any scheduler role, then fail this node
    /// over against the current master. The node is leaving regardless, so
    /// failures here are logged rather than propagated.
    async fn shutdown(&mut self) {
        tracing::info!("shutting down, draining for {:?}", self.config.agent.drain());
        tokio::time::sleep(self.config.agent.drain()).await;

        if let Some(role) = self.role.take() {
            let _ = role.stop.send(true);
            if role.active.load(Ordering::SeqCst) {
                if let Err(e) = self.lock.release().await {
                    tracing::debug!("scheduler lock release failed: {}", e);
                }
            }
        }

        let states = match self.registry.states().await {
            Ok(states) => states,
            Err(e) => {
                tracing::error!("reading states for shutdown failover failed: {}", e);
                return;
            }
        };
        let master = match find_master(&states) {
            Some(master) => master.clone(),
            None => {
                tracing::error!("no master to fail over against");
                return;
            }
        };

        if self.config.agent.what_if {
            tracing::info!(
                "what-if: would fail over {} via {}",
                self.ip_address,
                master.ip_address
            );
            return;
        }

        tracing::info!("failing over via master {}", master.ip_address);
        let cluster = self.cluster.clone();
        let failed_over = retry_with_backoff(
            || cluster.graceful_failover(&master.ip_address, &self.ip_address),
            3,
            Duration::from_secs(1),
        )
        .await;
        match failed_over {
            Ok(()) => tracing::info!("failed over cleanly"),
            Err(e) => {
                tracing::error!("shutdown failover failed: {}", e);
                return;
            }
        }

        if self.config.agent.rebalance_on_exit {
            if let Err(e) = self
                .cluster
                .rebalance(&master.ip_address, &self.ip_address)
                .await
            {
                tracing::error!("shutdown rebalance failed: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use std::collections::HashMap;

    fn what_if_config() -> Config {
        let mut config = Config::default();
        config.agent.what_if = true;
        config
    }

    fn agent(store: &Arc<MemoryStore>, ip: &str) -> Agent {
        Agent::new(store.clone() as Arc<dyn KvStore>, what_if_config(), ip.to_string()).unwrap()
    }

    fn master_record(ip: &str, session: &str) -> NodeState {
        let mut record = NodeState::announcement(ip, session);
        record.master = true;
        record.state = STATE_CLUSTERED.to_string();
        record.desired_state = STATE_CLUSTERED.to_string();
        record.ttl = crate::common::now_nanos() + 60_000_000_000;
        record
    }

    async fn seed_states(agent: &Agent, states: &HashMap<String, NodeState>) {
        agent.registry().save_states(states).await.unwrap();
    }

    #[tokio::test]
    async fn test_announces_self_observed_state() {
        let store = Arc::new(MemoryStore::new());
        let mut agent = agent(&store, "10.0.0.9");
        agent.tick().await.unwrap();

        let announcements = agent.registry().announcements().await.unwrap();
        let mine = &announcements[agent.session_id()];
        assert_eq!(mine.ip_address, "10.0.0.9");
        assert_eq!(mine.state, STATE_EMPTY);
        assert_eq!(mine.desired_state, STATE_EMPTY);
        assert!(!mine.master);
    }

    #[tokio::test]
    async fn test_converges_in_what_if_mode() {
        let store = Arc::new(MemoryStore::new());
        let mut agent = agent(&store, "10.0.0.9");

        let mut states = HashMap::new();
        states.insert("m-1".to_string(), master_record("10.0.0.1", "m-1"));
        let mut mine = NodeState::announcement("10.0.0.9", agent.session_id());
        mine.desired_state = STATE_NEW.to_string();
        states.insert(agent.session_id().to_string(), mine);
        seed_states(&agent, &states).await;

        agent.tick().await.unwrap();

        let announcements = agent.registry().announcements().await.unwrap();
        assert_eq!(announcements[agent.session_id()].state, STATE_NEW);
    }

    #[tokio::test]
    async fn test_master_confirms_without_cluster_call() {
        let store = Arc::new(MemoryStore::new());
        let mut agent = agent(&store, "10.0.0.1");

        // This node's own record is the master record.
        let mut states = HashMap::new();
        let mut mine = master_record("10.0.0.1", agent.session_id());
        mine.state = STATE_EMPTY.to_string();
        mine.desired_state = STATE_NEW.to_string();
        states.insert(agent.session_id().to_string(), mine);
        seed_states(&agent, &states).await;

        agent.tick().await.unwrap();
        let announcements = agent.registry().announcements().await.unwrap();
        assert_eq!(announcements[agent.session_id()].state, STATE_NEW);
    }

    #[tokio::test]
    async fn test_unknown_desired_state_is_fatal() {
        let store = Arc::new(MemoryStore::new());
        let mut agent = agent(&store, "10.0.0.9");

        let mut states = HashMap::new();
        states.insert("m-1".to_string(), master_record("10.0.0.1", "m-1"));
        let mut mine = NodeState::announcement("10.0.0.9", agent.session_id());
        mine.desired_state = "frozen".to_string();
        states.insert(agent.session_id().to_string(), mine);
        seed_states(&agent, &states).await;

        let err = agent.tick().await.unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn test_masterless_fleet_elects_one_scheduler() {
        let store = Arc::new(MemoryStore::new());
        let mut first = agent(&store, "10.0.0.1");
        let mut second = agent(&store, "10.0.0.2");

        first.tick().await.unwrap();
        second.tick().await.unwrap();

        // Exactly one of them holds the lock.
        let lock_key = first.registry().lock_key();
        let entries = store.get(&lock_key, false).await.unwrap();
        let holder = &entries[0].value;
        assert!(holder == first.session_id() || holder == second.session_id());
        assert_eq!(
            (first.role.is_some() as usize) + (second.role.is_some() as usize),
            1
        );
    }
}
