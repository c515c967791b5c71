//! # nodeherd
//!
//! Self-forming database cluster coordination:
//! - Nodes announce liveness into an etcd-like coordination store
//! - A lease lock elects the one process that runs the reconciler
//! - The reconciler computes a desired lifecycle state per node and keeps
//!   exactly one node marked master
//! - Each node's agent converges itself by calling the database's own
//!   administrative HTTP API, and fails itself over gracefully on shutdown
//!
//! ## Architecture
//!
//! ```text
//!                ┌──────────────────────────────┐
//!                │     Coordination store       │
//!                │  announcements/<sessionID>   │
//!                │  states/<sessionID>          │
//!                │  master            (lock)    │
//!                └───▲──────────┬─────────▲─────┘
//!          announce  │          │ read    │ persist
//!                    │          ▼         │
//!  ┌─────────────────┴──┐   ┌─────────────┴──────────┐
//!  │  Agent (per node)  │   │  Scheduler (one/fleet) │
//!  │  announce + apply  │   │  reconcile + select    │
//!  │  desired state     │   │  master, extend lease  │
//!  └─────────┬──────────┘   └────────────────────────┘
//!            │ add / rebalance / failover
//!            ▼
//!  ┌────────────────────┐
//!  │  Database admin    │
//!  │  HTTP endpoint     │
//!  └────────────────────┘
//! ```
//!
//! ## Usage
//!
//! ### Run the per-node agent
//! ```bash
//! nodeherd-agent run \
//!   --service-path /services/dbarray \
//!   --etcd http://127.0.0.1:2379 \
//!   --heartbeat 3
//! ```
//!
//! ### Run a standalone scheduler
//! ```bash
//! nodeherd-sched run \
//!   --service-path /services/dbarray \
//!   --etcd http://127.0.0.1:2379 \
//!   --interval 10
//! ```

pub mod agent;
pub mod common;
pub mod scheduler;
pub mod store;

// Re-export commonly used types
pub use common::{Config, Error, Result};
pub use scheduler::Scheduler;
pub use store::{EtcdStore, KvStore, MemoryStore};

/// Current version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Build info
pub const BUILD_INFO: &str = concat!(env!("CARGO_PKG_VERSION"), " (", env!("CARGO_PKG_NAME"), ")");
