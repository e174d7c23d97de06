//! Identity provider capability.
//!
//! Credential verification is delegated to an external provider. This layer
//! only needs a yes/no answer with the user id on success.

use crate::errors::StateError;
use secrecy::SecretString;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum IdentityError {
    /// Credentials were checked and rejected.
    #[error("invalid credentials")]
    InvalidCredentials,

    /// The provider could not be reached or failed.
    #[error("identity provider unavailable: {0}")]
    Unavailable(String),
}

impl From<IdentityError> for StateError {
    fn from(err: IdentityError) -> Self {
        match err {
            IdentityError::InvalidCredentials => {
                StateError::Unauthorized("invalid credentials".to_string())
            }
            // Not a store fault, but the client sees the same "try again later"
            IdentityError::Unavailable(msg) => {
                StateError::StoreUnavailable(format!("identity provider: {msg}"))
            }
        }
    }
}

/// Verifies credentials (enables mocking).
#[async_trait::async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Verify `email`/`password` and return the user id.
    async fn authenticate(
        &self,
        email: &str,
        password: &SecretString,
    ) -> Result<String, IdentityError>;
}
