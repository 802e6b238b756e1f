//! Request authentication.

use std::collections::HashMap;

use axum::http::{HeaderMap, header};

use crate::error::AuthError;

/// The caller, as established by an [`Authenticator`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthUser {
    pub user_id: String,
}

/// Resolves request headers to a user.
pub trait Authenticator: Send + Sync {
    fn authenticate(&self, headers: &HeaderMap) -> Result<AuthUser, AuthError>;
}

/// Fixed table of bearer tokens.
pub struct StaticTokenAuthenticator {
    tokens: HashMap<String, String>,
}

impl StaticTokenAuthenticator {
    /// `tokens` maps token → user id.
    pub fn new(tokens: HashMap<String, String>) -> Self {
        Self { tokens }
    }
}

impl Authenticator for StaticTokenAuthenticator {
    fn authenticate(&self, headers: &HeaderMap) -> Result<AuthUser, AuthError> {
        let raw = headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .ok_or(AuthError::Unauthorized)?;
        let token = raw.strip_prefix("Bearer ").unwrap_or(raw).trim();

        self.tokens
            .get(token)
            .map(|user_id| AuthUser {
                user_id: user_id.clone(),
            })
            .ok_or(AuthError::Unauthorized)
    }
}
