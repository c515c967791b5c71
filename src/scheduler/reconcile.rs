//! State reconciliation
//!
//! A pure reduction over two snapshots: the live announcements and the
//! previously persisted states. No I/O, no side effects; the scheduler loop
//! persists whatever comes back. Calling it twice over unchanged inputs is a
//! no-op, which is what makes the loop restart-safe.

use crate::common::now_nanos;
use crate::scheduler::state::{NodeState, STATE_CLUSTERED, STATE_EMPTY, STATE_NEW};
use std::collections::HashMap;

/// Compute the next persisted-state set from the current announcements and
/// states.
///
/// Transitions are monotonic and gated on the state a node itself announced,
/// so at most one forward step fires per record per call:
/// `"" → new → clustered`. A changed session ID means the node process
/// restarted; its record restarts the lifecycle. Records whose announcement
/// lease lapsed are evicted; that is the only death detection there is.
pub fn reconcile(
    announcements: &HashMap<String, NodeState>,
    mut states: HashMap<String, NodeState>,
) -> HashMap<String, NodeState> {
    for (key, announcement) in announcements {
        match states.get_mut(key) {
            Some(state) if state.session_id == announcement.session_id => {
                if state.desired_state == STATE_NEW && announcement.state == STATE_NEW {
                    state.desired_state = STATE_CLUSTERED.to_string();
                }
                if state.desired_state == STATE_CLUSTERED
                    && announcement.state == STATE_CLUSTERED
                {
                    state.state = STATE_CLUSTERED.to_string();
                }
            }
            Some(state) => {
                // Same record key, different incarnation: restart the
                // lifecycle under the new session.
                tracing::info!("resetting node {}", key);
                state.state = STATE_NEW.to_string();
                state.desired_state = STATE_NEW.to_string();
                state.session_id = announcement.session_id.clone();
            }
            None => {
                tracing::info!("no state for node {}, creating", key);
                states.insert(
                    key.clone(),
                    NodeState {
                        ip_address: announcement.ip_address.clone(),
                        session_id: announcement.session_id.clone(),
                        master: false,
                        state: STATE_EMPTY.to_string(),
                        desired_state: STATE_NEW.to_string(),
                        ttl: now_nanos(),
                    },
                );
            }
        }
    }

    // Absence of a lease-backed announcement is the sole eviction signal.
    states.retain(|key, _| announcements.contains_key(key));

    states
}
