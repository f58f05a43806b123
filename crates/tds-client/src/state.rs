//! Connection lifecycle state.
//!
//! ## State Transitions
//!
//! ```text
//! Created -> Ready      (login completed)
//! Ready -> Draining     (close requested; queued operations still run)
//! Draining -> Completed (queue empty; transport shut down)
//! any -> Completed      (fault)
//! ```
//!
//! `Completed` is terminal.

use std::fmt;

/// Runtime state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ConnectionState {
    /// Transport open, login not finished.
    #[default]
    Created,
    /// Accepting operations.
    Ready,
    /// Closing: no new operations, queued ones run to completion.
    Draining,
    /// Closed or faulted.
    Completed,
}

impl ConnectionState {
    /// Check if new operations can be admitted.
    #[must_use]
    pub fn is_ready(self) -> bool {
        matches!(self, Self::Ready)
    }

    /// Check if the state is terminal.
    #[must_use]
    pub fn is_completed(self) -> bool {
        matches!(self, Self::Completed)
    }

    /// Check whether `next` is a legal successor.
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Created, Self::Ready)
                | (Self::Ready, Self::Draining)
                | (Self::Created | Self::Ready | Self::Draining, Self::Completed)
        )
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Created => "created",
            Self::Ready => "ready",
            Self::Draining => "draining",
            Self::Completed => "completed",
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transitions() {
        use ConnectionState::*;
        assert!(Created.can_transition_to(Ready));
        assert!(Ready.can_transition_to(Draining));
        assert!(Draining.can_transition_to(Completed));
        assert!(Ready.can_transition_to(Completed));
        assert!(!Completed.can_transition_to(Ready));
        assert!(!Draining.can_transition_to(Ready));
        assert!(!Created.can_transition_to(Draining));
    }

    #[test]
    fn test_display() {
        assert_eq!(ConnectionState::Draining.to_string(), "draining");
        assert!(ConnectionState::Ready.is_ready());
        assert!(ConnectionState::Completed.is_completed());
    }
}
