//! Container state machine.
//!
//! Operations move a container along the edges of [`successors`] through
//! [`transition`]. Reconciliation derives the status from live kernel facts
//! with [`observe`] instead, and may land anywhere.

use berth_common::types::ContainerStatus;

use crate::error::{Result, RuntimeError};

/// States reachable from `status` through an operation.
#[must_use]
pub const fn successors(status: ContainerStatus) -> &'static [ContainerStatus] {
    use ContainerStatus::{Created, Paused, Restored, Running, Stopped};
    match status {
        Created => &[Running, Paused, Stopped, Created],
        Running => &[Paused, Stopped, Running],
        Paused => &[Running, Stopped, Paused],
        Stopped => &[Running, Restored],
        Restored => &[Running, Stopped],
    }
}

/// Returns `true` if `from -> to` is an allowed edge.
#[must_use]
pub fn can_transition(from: ContainerStatus, to: ContainerStatus) -> bool {
    successors(from).contains(&to)
}

/// Validates `current -> requested` and returns the new status.
///
/// # Errors
///
/// Returns [`RuntimeError::StateTransition`] for a disallowed edge.
pub fn transition(current: ContainerStatus, requested: ContainerStatus) -> Result<ContainerStatus> {
    if can_transition(current, requested) {
        Ok(requested)
    } else {
        Err(RuntimeError::StateTransition { current, requested })
    }
}

/// Live facts about a container, gathered during reconciliation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Observation {
    /// The cgroup freezer reports frozen.
    pub frozen: bool,
    /// The init process exists, matches its fingerprint, and is not a
    /// zombie.
    pub init_alive: bool,
    /// The exec gate FIFO is present.
    pub gate_exists: bool,
}

/// Derives the status from `facts`. The checks are ordered: a frozen
/// cgroup is paused even before the program was released, and a dead init
/// is stopped even if its gate file was left behind.
#[must_use]
pub const fn observe(facts: Observation) -> ContainerStatus {
    if facts.frozen {
        ContainerStatus::Paused
    } else if !facts.init_alive {
        ContainerStatus::Stopped
    } else if facts.gate_exists {
        ContainerStatus::Created
    } else {
        ContainerStatus::Running
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ContainerStatus::{Created, Paused, Restored, Running, Stopped};

    const ALL: [ContainerStatus; 5] = [Created, Running, Paused, Stopped, Restored];

    #[test]
    fn table_edges_succeed_and_others_fail() {
        let allowed = [
            (Created, Running),
            (Created, Paused),
            (Created, Stopped),
            (Created, Created),
            (Running, Paused),
            (Running, Stopped),
            (Running, Running),
            (Paused, Running),
            (Paused, Stopped),
            (Paused, Paused),
            (Stopped, Running),
            (Stopped, Restored),
            (Restored, Running),
            (Restored, Stopped),
        ];
        for from in ALL {
            for to in ALL {
                let result = transition(from, to);
                if allowed.contains(&(from, to)) {
                    assert_eq!(result.expect("allowed edge"), to);
                } else {
                    assert!(
                        matches!(
                            result,
                            Err(RuntimeError::StateTransition { current, requested })
                                if current == from && requested == to
                        ),
                        "{from} -> {to} should be rejected"
                    );
                }
            }
        }
    }

    #[test]
    fn stopped_cannot_pause_or_self_loop() {
        assert!(!can_transition(Stopped, Paused));
        assert!(!can_transition(Stopped, Stopped));
        assert!(!can_transition(Restored, Restored));
    }

    #[test]
    fn freezer_wins_over_everything() {
        let facts = Observation {
            frozen: true,
            init_alive: true,
            gate_exists: true,
        };
        assert_eq!(observe(facts), Paused);
    }

    #[test]
    fn dead_init_is_stopped_even_with_gate() {
        let facts = Observation {
            frozen: false,
            init_alive: false,
            gate_exists: true,
        };
        assert_eq!(observe(facts), Stopped);
    }

    #[test]
    fn gate_distinguishes_created_from_running() {
        let mut facts = Observation {
            frozen: false,
            init_alive: true,
            gate_exists: true,
        };
        assert_eq!(observe(facts), Created);
        facts.gate_exists = false;
        assert_eq!(observe(facts), Running);
    }
}
