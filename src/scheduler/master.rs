//! Data-plane master selection
//!
//! Runs over the snapshot the reconciler just produced. Leadership is
//! sticky: a master whose lease deadline is still ahead keeps the role, so
//! the election costs nothing on the steady-state tick. Only expiry (or the
//! absence of any master) triggers a change, and the choice among candidates
//! is deliberately arbitrary.

use crate::common::now_nanos;
use crate::scheduler::state::NodeState;
use std::collections::HashMap;

/// The current master record, if any.
pub fn find_master(states: &HashMap<String, NodeState>) -> Option<&NodeState> {
    states.values().find(|state| state.master)
}

/// Guarantee at most one live master, electing a new one when the incumbent's
/// lease deadline has passed.
///
/// An expired incumbent is demoted in the same pass that promotes its
/// replacement. When every record is an expired master there is no candidate
/// to promote and the snapshot is returned unchanged.
pub fn select_master(mut states: HashMap<String, NodeState>) -> HashMap<String, NodeState> {
    if states.is_empty() {
        return states;
    }

    let now = now_nanos();
    let mut expired_key: Option<String> = None;
    let mut candidate_key: Option<String> = None;

    for (key, state) in &states {
        if state.master {
            if now > state.ttl {
                tracing::info!("master lease reached for {}", state.ip_address);
                expired_key = Some(key.clone());
            } else {
                // Live incumbent keeps the role.
                return states;
            }
        } else {
            candidate_key = Some(key.clone());
        }
    }

    if let Some(key) = candidate_key {
        if let Some(state) = states.get_mut(&key) {
            state.master = true;
        }
        if let Some(key) = expired_key {
            if let Some(state) = states.get_mut(&key) {
                state.master = false;
            }
        }
    }

    states
}
