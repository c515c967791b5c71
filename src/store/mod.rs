//! Coordination store access
//!
//! The store is the only channel between nodes: a hierarchical key space with
//! per-key TTL leases and atomic compare operations. [`KvStore`] is the
//! injection seam; [`EtcdStore`] talks to a real etcd-like service and
//! [`MemoryStore`] is its in-process twin for tests and what-if runs.

pub mod client;
pub mod memory;

pub use client::{EtcdStore, KvEntry, KvStore};
pub use memory::MemoryStore;
