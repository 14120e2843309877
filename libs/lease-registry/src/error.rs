//! Error types for lease registry operations.
//!
//! Input validation is kept apart from store failures so the gateway can
//! answer "bad request" without ever touching the store, and so a store that
//! is down or slow is never reported as an unknown credential.

use std::time::Duration;

use credential_store::ParseSerialError;
use thiserror::Error;

use crate::form::MAX_REMOTE_PORT;

/// Client input that failed validation. Raised before any store access.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("missing required field {0}")]
    Missing(&'static str),

    #[error("{field} is not a valid IP address: {value:?}")]
    InvalidAddr { field: &'static str, value: String },

    #[error("remote_port must be an integer in 0..={MAX_REMOTE_PORT}, got {0:?}")]
    InvalidPort(String),

    #[error("invalid serial number: {0}")]
    Serial(#[from] ParseSerialError),
}

/// Failure talking to the credential store.
#[derive(Debug, Error)]
pub enum RegistryError<E> {
    #[error("credential store error")]
    Store(#[source] E),

    #[error("credential store did not answer within {0:?}")]
    Timeout(Duration),
}

impl<E> RegistryError<E> {
    /// the store was reachable but too slow, as opposed to failing outright
    pub fn is_timeout(&self) -> bool {
        matches!(self, RegistryError::Timeout(_))
    }
}
