//! End-to-end lifecycle tests over the in-memory store
//!
//! Drives real agents (in what-if mode) and a real scheduler tick-by-tick,
//! with a hand-announced seed master so the flow is deterministic: no
//! background tasks, no clocks, every step explicit.

use nodeherd::agent::Agent;
use nodeherd::common::config::SchedulerConfig;
use nodeherd::common::{now_nanos, Config};
use nodeherd::scheduler::state::{NodeState, STATE_CLUSTERED, STATE_EMPTY, STATE_NEW};
use nodeherd::scheduler::{ClusterRegistry, Scheduler};
use nodeherd::store::{KvStore, MemoryStore};
use std::collections::HashMap;
use std::sync::Arc;

const BASE: &str = "/services/test";

struct Fixture {
    store: Arc<MemoryStore>,
    registry: ClusterRegistry,
    scheduler: Scheduler,
}

fn fixture() -> Fixture {
    let store = Arc::new(MemoryStore::new());
    let registry = ClusterRegistry::new(store.clone() as Arc<dyn KvStore>, BASE, 5, 13);
    let scheduler = Scheduler::new(registry.clone(), &SchedulerConfig::default());
    Fixture {
        store,
        registry,
        scheduler,
    }
}

fn what_if_config() -> Config {
    let mut config = Config::default();
    config.store.service_path = BASE.to_string();
    config.agent.what_if = true;
    config
}

fn agent(fx: &Fixture, ip: &str) -> Agent {
    Agent::new(fx.store.clone() as Arc<dyn KvStore>, what_if_config(), ip.to_string()).unwrap()
}

/// Announce and persist a converged master node so agents never find the
/// fleet masterless.
async fn seed_master(fx: &Fixture) -> NodeState {
    let mut announcement = NodeState::announcement("10.0.0.1", "m-1");
    announcement.state = STATE_CLUSTERED.to_string();
    fx.registry.announce(&announcement).await.unwrap();

    let mut record = announcement.clone();
    record.master = true;
    record.desired_state = STATE_CLUSTERED.to_string();
    record.ttl = now_nanos() + 60_000_000_000;

    let mut states = HashMap::new();
    states.insert("m-1".to_string(), record.clone());
    fx.registry.save_states(&states).await.unwrap();
    record
}

/// Keep the seed master's announcement fresh between scheduler ticks.
async fn reannounce_master(fx: &Fixture) {
    let mut announcement = NodeState::announcement("10.0.0.1", "m-1");
    announcement.state = STATE_CLUSTERED.to_string();
    fx.registry.announce(&announcement).await.unwrap();
}

#[tokio::test]
async fn test_two_nodes_join_and_converge() {
    let fx = fixture();
    seed_master(&fx).await;
    let mut a1 = agent(&fx, "10.0.0.2");
    let mut a2 = agent(&fx, "10.0.0.3");

    // Heartbeat 1: both announce fresh; the scheduler creates their records.
    a1.tick().await.unwrap();
    a2.tick().await.unwrap();
    fx.scheduler.tick().await.unwrap();

    let states = fx.registry.states().await.unwrap();
    assert_eq!(states.len(), 3);
    for session in [a1.session_id(), a2.session_id()] {
        assert_eq!(states[session].state, STATE_EMPTY);
        assert_eq!(states[session].desired_state, STATE_NEW);
        assert!(!states[session].master);
    }

    // Heartbeat 2: agents join (what-if) and confirm "new"; the scheduler
    // advances them to "clustered".
    a1.tick().await.unwrap();
    a2.tick().await.unwrap();
    reannounce_master(&fx).await;
    fx.scheduler.tick().await.unwrap();

    let states = fx.registry.states().await.unwrap();
    for session in [a1.session_id(), a2.session_id()] {
        assert_eq!(states[session].desired_state, STATE_CLUSTERED);
    }

    // Heartbeat 3: agents rebalance (what-if) and confirm "clustered".
    a1.tick().await.unwrap();
    a2.tick().await.unwrap();
    reannounce_master(&fx).await;
    fx.scheduler.tick().await.unwrap();

    let states = fx.registry.states().await.unwrap();
    for session in [a1.session_id(), a2.session_id()] {
        assert_eq!(states[session].state, STATE_CLUSTERED);
        assert_eq!(states[session].desired_state, STATE_CLUSTERED);
    }
    assert_eq!(states.values().filter(|s| s.master).count(), 1);
    assert!(states["m-1"].master);
}

#[tokio::test]
async fn test_vanished_node_is_evicted() {
    let fx = fixture();
    seed_master(&fx).await;
    let mut a1 = agent(&fx, "10.0.0.2");

    a1.tick().await.unwrap();
    fx.scheduler.tick().await.unwrap();
    assert_eq!(fx.registry.states().await.unwrap().len(), 2);

    // The node crashes: its announcement lease lapses (modeled by deleting
    // the key) while its state record lingers.
    let key = format!("{}/announcements/{}", BASE, a1.session_id());
    fx.store.delete(&key, false).await.unwrap();
    reannounce_master(&fx).await;
    fx.scheduler.tick().await.unwrap();

    let states = fx.registry.states().await.unwrap();
    assert_eq!(states.len(), 1);
    assert!(states.contains_key("m-1"));
}

#[tokio::test]
async fn test_restarted_node_relearns_lifecycle() {
    let fx = fixture();
    seed_master(&fx).await;

    // First incarnation converges fully.
    let mut first = agent(&fx, "10.0.0.2");
    for _ in 0..3 {
        first.tick().await.unwrap();
        reannounce_master(&fx).await;
        fx.scheduler.tick().await.unwrap();
    }
    let states = fx.registry.states().await.unwrap();
    assert_eq!(states[first.session_id()].state, STATE_CLUSTERED);

    // The process restarts: a new session announces from the same address,
    // the old announcement disappears.
    let key = format!("{}/announcements/{}", BASE, first.session_id());
    fx.store.delete(&key, false).await.unwrap();
    let mut second = agent(&fx, "10.0.0.2");
    second.tick().await.unwrap();
    reannounce_master(&fx).await;
    fx.scheduler.tick().await.unwrap();

    let states = fx.registry.states().await.unwrap();
    assert!(!states.contains_key(first.session_id()));
    let reborn = &states[second.session_id()];
    assert_eq!(reborn.state, STATE_EMPTY);
    assert_eq!(reborn.desired_state, STATE_NEW);
    assert!(!reborn.master);
}

#[tokio::test]
async fn test_expired_master_is_replaced() {
    let fx = fixture();
    seed_master(&fx).await;
    let mut a1 = agent(&fx, "10.0.0.2");

    a1.tick().await.unwrap();
    fx.scheduler.tick().await.unwrap();

    // Push the incumbent's lease deadline into the past by hand.
    let mut states = fx.registry.states().await.unwrap();
    states.get_mut("m-1").unwrap().ttl = now_nanos() - 1;
    fx.registry.save_states(&states).await.unwrap();

    reannounce_master(&fx).await;
    a1.tick().await.unwrap();
    fx.scheduler.tick().await.unwrap();

    let states = fx.registry.states().await.unwrap();
    assert!(!states["m-1"].master);
    assert!(states[a1.session_id()].master);
    assert_eq!(states.values().filter(|s| s.master).count(), 1);

    // And the fresh master's lease was extended past now.
    assert!(states[a1.session_id()].ttl > now_nanos());
}
