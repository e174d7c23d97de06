//! Identity provider mock and data fixtures.

use secrecy::{ExposeSecret, SecretString};
use state_service::identity::{IdentityError, IdentityProvider};
use state_service::session::SessionClaims;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Password accepted for users added with [`StaticIdentityProvider::with_user`].
pub const TEST_PASSWORD: &str = "correct horse battery staple";

/// In-memory identity provider with a fixed user table.
#[derive(Default)]
pub struct StaticIdentityProvider {
    users: HashMap<String, (String, String)>,
    unavailable: bool,
    call_count: AtomicUsize,
}

impl StaticIdentityProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `email` with [`TEST_PASSWORD`] and the given user id.
    pub fn with_user(self, email: &str, user_id: &str) -> Self {
        self.with_credentials(email, TEST_PASSWORD, user_id)
    }

    pub fn with_credentials(mut self, email: &str, password: &str, user_id: &str) -> Self {
        self.users.insert(
            email.to_string(),
            (password.to_string(), user_id.to_string()),
        );
        self
    }

    /// Provider that fails every call as unreachable.
    pub fn unavailable() -> Self {
        Self {
            unavailable: true,
            ..Self::default()
        }
    }

    /// Number of `authenticate` calls made.
    pub fn call_count(&self) -> usize {
        self.call_count.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl IdentityProvider for StaticIdentityProvider {
    async fn authenticate(
        &self,
        email: &str,
        password: &SecretString,
    ) -> Result<String, IdentityError> {
        self.call_count.fetch_add(1, Ordering::SeqCst);

        if self.unavailable {
            return Err(IdentityError::Unavailable(
                "static provider configured as unavailable".to_string(),
            ));
        }

        match self.users.get(email) {
            Some((expected, user_id)) if expected == password.expose_secret() => {
                Ok(user_id.clone())
            }
            _ => Err(IdentityError::InvalidCredentials),
        }
    }
}

/// Wrap a password literal.
pub fn password(value: &str) -> SecretString {
    SecretString::from(value.to_string())
}

/// Claims for `user_id` with a derived email and a role claim.
pub fn user_claims(user_id: &str) -> SessionClaims {
    SessionClaims::new(user_id)
        .with_email(format!("{user_id}@example.com"))
        .with_claim("role", serde_json::json!("member"))
}

/// Media task payload referencing an uploaded file.
pub fn media_payload(file_id: &str) -> serde_json::Value {
    serde_json::json!({
        "file_id": file_id,
        "content_type": "image/png",
    })
}
