//! Resource lifecycle as seen from one invocation.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The four lifecycle operations a resource supports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Create,
    Read,
    Update,
    Delete,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Create => "create",
            Operation::Read => "read",
            Operation::Update => "update",
            Operation::Delete => "delete",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether the remote entity exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceLifecycle {
    Absent,
    Present,
}

impl ResourceLifecycle {
    /// State after `operation` completed successfully. `found` is what the
    /// trailing read observed; a read that finds nothing forces `Absent`
    /// whatever was assumed before.
    pub fn after(self, operation: Operation, found: bool) -> Self {
        match operation {
            Operation::Delete => ResourceLifecycle::Absent,
            Operation::Create | Operation::Read | Operation::Update => {
                if found {
                    ResourceLifecycle::Present
                } else {
                    ResourceLifecycle::Absent
                }
            }
        }
    }
}

/// Result of a read: the refreshed state, or confirmation that the entity
/// does not exist and its identity should be cleared.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadOutcome<S> {
    Present(S),
    Absent,
}

impl<S> ReadOutcome<S> {
    pub fn is_present(&self) -> bool {
        matches!(self, ReadOutcome::Present(_))
    }

    pub fn lifecycle(&self) -> ResourceLifecycle {
        if self.is_present() {
            ResourceLifecycle::Present
        } else {
            ResourceLifecycle::Absent
        }
    }

    pub fn into_state(self) -> Option<S> {
        match self {
            ReadOutcome::Present(state) => Some(state),
            ReadOutcome::Absent => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_can_force_absent_from_present() {
        let state = ResourceLifecycle::Absent.after(Operation::Create, true);
        assert_eq!(state, ResourceLifecycle::Present);
        let state = state.after(Operation::Update, true);
        assert_eq!(state, ResourceLifecycle::Present);
        assert_eq!(
            state.after(Operation::Read, false),
            ResourceLifecycle::Absent
        );
        assert_eq!(
            state.after(Operation::Delete, true),
            ResourceLifecycle::Absent
        );
    }

    #[test]
    fn outcome_maps_to_lifecycle() {
        assert_eq!(
            ReadOutcome::Present("repo").lifecycle(),
            ResourceLifecycle::Present
        );
        assert_eq!(
            ReadOutcome::<&str>::Absent.lifecycle(),
            ResourceLifecycle::Absent
        );
        assert_eq!(ReadOutcome::Present(3).into_state(), Some(3));
    }
}
