//! Relay state machine primitives
//!
//! The lifecycle state is read by every worker thread and written by the
//! manager and the setup path. Plain acquire/release load/store is all it
//! needs; there are no compound updates anywhere in the lifecycle.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;

/// Lifecycle states of the relay manager
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RelayState {
    /// Nothing running; registries mutable
    Idle = 0,
    /// Control bring-up in progress
    Setup = 1,
    /// Pipelines live
    Relaying = 2,
    /// Ordered teardown in progress
    Stopping = 3,
    /// Stop was requested mid-setup; the setup path drives teardown
    SetupAbort = 4,
    /// Torn down after a bus reset; registries mutable, relaying restartable
    Reset = 5,
}

impl RelayState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RelayState::Idle => "IDLE",
            RelayState::Setup => "SETUP",
            RelayState::Relaying => "RELAYING",
            RelayState::Stopping => "STOPPING",
            RelayState::SetupAbort => "SETUP_ABORT",
            RelayState::Reset => "RESET",
        }
    }

    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => RelayState::Setup,
            2 => RelayState::Relaying,
            3 => RelayState::Stopping,
            4 => RelayState::SetupAbort,
            5 => RelayState::Reset,
            _ => RelayState::Idle,
        }
    }
}

impl fmt::Display for RelayState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Shared lifecycle state cell
#[derive(Debug)]
pub struct StateCell(AtomicU8);

impl StateCell {
    pub fn new(state: RelayState) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    pub fn load(&self) -> RelayState {
        RelayState::from_u8(self.0.load(Ordering::Acquire))
    }

    pub fn store(&self, state: RelayState) {
        self.0.store(state as u8, Ordering::Release);
    }
}

/// Cooperative stop flag shared between a worker and the manager
#[derive(Debug, Clone, Default)]
pub struct StopFlag(Arc<AtomicBool>);

impl StopFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_display() {
        assert_eq!(RelayState::Idle.to_string(), "IDLE");
        assert_eq!(RelayState::SetupAbort.to_string(), "SETUP_ABORT");
    }

    #[test]
    fn test_state_cell_roundtrip() {
        let cell = StateCell::new(RelayState::Idle);
        assert_eq!(cell.load(), RelayState::Idle);
        cell.store(RelayState::Relaying);
        assert_eq!(cell.load(), RelayState::Relaying);
    }

    #[test]
    fn test_stop_flag_shared() {
        let flag = StopFlag::new();
        let clone = flag.clone();
        assert!(!clone.is_set());
        flag.set();
        assert!(clone.is_set());
    }
}
