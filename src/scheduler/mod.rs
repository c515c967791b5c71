//! Reconciliation engine
//!
//! The scheduler side of nodeherd: the node lifecycle state machine
//! ([`reconcile`]), data-plane master election ([`select_master`]), the
//! store-backed repositories both read from and write to, the lease lock that
//! decides which process gets to run the loop, and the loop itself.
//!
//! Two elections live here and stay independent: [`lock::DistributedLock`]
//! elects the *process* that runs the scheduler, [`master::select_master`]
//! elects the *data-plane* master record.

pub mod lock;
pub mod master;
pub mod reconcile;
pub mod registry;
pub mod run;
pub mod state;

pub use lock::DistributedLock;
pub use master::{find_master, select_master};
pub use reconcile::reconcile;
pub use registry::ClusterRegistry;
pub use run::Scheduler;
pub use state::NodeState;
