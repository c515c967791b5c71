//! Per-node agent
//!
//! The agent is responsible for:
//! - Announcing this node's liveness every heartbeat
//! - Converging the node toward its reconciler-assigned desired state by
//!   driving the database's administrative HTTP API
//! - Racing for the scheduler role when no master exists
//! - Gracefully failing the node over on shutdown

pub mod cluster_client;
pub mod run;

pub use cluster_client::ClusterApi;
pub use run::Agent;
