//! Error Types
//!
//! Each layer owns its own error enum; [`RelayError`] ties them together for
//! the places (handlers, startup) that can fail for more than one reason.
//!
//! Only [`RelayError::Config`] and [`RelayError::AuthFailure`] are fatal, and
//! both can only occur during startup. Everything else is recovered at the
//! scope of the single in-flight event.

use thiserror::Error;

use crate::assistant::AssistantError;
use crate::config::ConfigError;
use crate::session::StoreError;
use crate::transport::TransportError;

/// Umbrella error for the relay
#[derive(Debug, Error)]
pub enum RelayError {
    /// Missing or malformed startup configuration
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Missing or rejected credential at startup
    #[error("Authentication failed: {0}")]
    AuthFailure(String),

    /// A persistence operation failed
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The assistant call failed
    #[error(transparent)]
    Assistant(#[from] AssistantError),

    /// The homeserver transport failed
    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl RelayError {
    /// Whether this error must stop the process
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Config(_) | Self::AuthFailure(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_startup_errors_are_fatal() {
        assert!(RelayError::AuthFailure("no token".into()).is_fatal());
        assert!(RelayError::Config(ConfigError::ValidationError("x".into())).is_fatal());
        assert!(!RelayError::Store(StoreError::Unavailable("disk".into())).is_fatal());
        assert!(!RelayError::Assistant(AssistantError::RateLimited).is_fatal());
        assert!(!RelayError::Transport(TransportError::ConnectionClosed).is_fatal());
    }
}
