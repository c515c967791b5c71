//! Node lifecycle records
//!
//! A [`NodeState`] is the unit of persisted truth, one per node incarnation.
//! The same shape serves as the announcement a node publishes about itself;
//! an announcement self-reports `state` but never carries an authoritative
//! `desired_state` (only the reconciler writes that, into the state
//! repository).

use serde::{Deserialize, Serialize};

/// Lifecycle phase of a node that has announced but not yet been told
/// anything.
pub const STATE_EMPTY: &str = "";
/// Node should be (or has been) added to the cluster under the master.
pub const STATE_NEW: &str = "new";
/// Node is a fully rebalanced cluster member.
pub const STATE_CLUSTERED: &str = "clustered";
/// Terminal marker. Declared for wire compatibility; no reconciler
/// transition produces it.
pub const STATE_DELETED: &str = "deleted";

/// Persisted lifecycle record for one node incarnation.
///
/// Lifecycle values are plain strings on the wire; unknown values are
/// carried through rather than rejected, and the agent treats any value it
/// has no transition for as a protocol violation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeState {
    /// Network identity of the machine
    pub ip_address: String,

    /// Opaque identifier minted fresh each process start; distinguishes
    /// incarnations of the same address
    #[serde(rename = "sessionID")]
    pub session_id: String,

    /// At most one expiry-live record carries this across a consistent
    /// snapshot
    pub master: bool,

    /// Last phase the node itself confirmed
    pub state: String,

    /// Phase the reconciler wants the node to reach
    pub desired_state: String,

    /// Absolute nanosecond deadline bounding the master role; meaningless
    /// while `master` is false
    pub ttl: i64,
}

impl NodeState {
    /// Fresh announcement for a node that has not achieved anything yet.
    pub fn announcement(ip_address: impl Into<String>, session_id: impl Into<String>) -> Self {
        Self {
            ip_address: ip_address.into(),
            session_id: session_id.into(),
            master: false,
            state: STATE_EMPTY.to_string(),
            desired_state: STATE_EMPTY.to_string(),
            ttl: 0,
        }
    }
}

impl std::fmt::Display for NodeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "IP:{}, ID:{}, IsMaster:{}, State:{:?}, DesiredState:{:?}",
            self.ip_address, self.session_id, self.master, self.state, self.desired_state
        )
    }
}
