//! Relay error types

use crate::proxy::ProxyError;
use crate::state::RelayState;
use thiserror::Error;

/// Errors surfaced by the relay manager's lifecycle operations
#[derive(Debug, Error)]
pub enum RelayError {
    /// A lifecycle entry point was invoked in the wrong state
    #[error("{operation} not permitted in state {state}")]
    InvalidState {
        operation: &'static str,
        state: RelayState,
    },

    /// Plugin loading never provided the named proxy
    #[error("No {0} proxy loaded")]
    MissingProxy(&'static str),

    #[error("Proxy error: {0}")]
    Proxy(#[from] ProxyError),

    #[error("Descriptor model error: {0}")]
    Model(#[from] usb::ModelError),

    #[error("Configuration error: {0}")]
    Config(String),
}

/// Type alias for relay results
pub type Result<T> = std::result::Result<T, RelayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = RelayError::InvalidState {
            operation: "start_control_relaying",
            state: RelayState::Relaying,
        };
        let msg = format!("{}", err);
        assert!(msg.contains("start_control_relaying"));
        assert!(msg.contains("RELAYING"));
    }
}
