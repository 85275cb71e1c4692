//! Daemon state definitions.

use serde::Serialize;

/// Daemon operational state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DaemonState {
    /// Daemon is built but the refresh loop is not running.
    Starting,
    /// Refresh loop is running.
    Running,
    /// Refresh loop is being stopped.
    ShuttingDown,
    /// Daemon is stopped.
    Stopped,
}

impl DaemonState {
    /// Check if the daemon is operational.
    pub fn is_operational(&self) -> bool {
        matches!(self, DaemonState::Running)
    }

    /// Check if the daemon is in a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, DaemonState::Stopped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_predicates() {
        assert!(DaemonState::Running.is_operational());
        assert!(!DaemonState::ShuttingDown.is_operational());
        assert!(DaemonState::Stopped.is_terminal());
        assert!(!DaemonState::Starting.is_terminal());
    }
}
