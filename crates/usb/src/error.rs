//! Descriptor model error types

use thiserror::Error;

/// Errors produced while parsing raw descriptors or resolving the model
#[derive(Debug, Error)]
pub enum ModelError {
    /// Descriptor blob shorter than the structure requires
    #[error("Truncated descriptor: needed {needed} bytes, got {available}")]
    Truncated { needed: usize, available: usize },

    /// bDescriptorType did not match the expected type
    #[error("Unexpected descriptor type: expected {expected:#04x}, got {actual:#04x}")]
    UnexpectedType { expected: u8, actual: u8 },

    /// Descriptor stream placed an endpoint before any interface
    #[error("Endpoint descriptor outside of an interface")]
    OrphanEndpoint,

    /// Configuration lookup by bConfigurationValue failed
    #[error("No configuration with value {value}")]
    UnknownConfiguration { value: u8 },

    /// Device exposes no configurations at all
    #[error("Device has no configurations")]
    NoConfigurations,
}

/// Type alias for model results
pub type Result<T> = std::result::Result<T, ModelError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ModelError::Truncated {
            needed: 18,
            available: 9,
        };
        let msg = format!("{}", err);
        assert!(msg.contains("Truncated"));
        assert!(msg.contains("18"));

        let err = ModelError::UnexpectedType {
            expected: 0x01,
            actual: 0x02,
        };
        assert!(format!("{}", err).contains("0x02"));
    }
}
