//! Connection authentication
//!
//! Consulted once per connection, before a session exists. A rejected
//! connection is closed with `CLOSE_AUTH_FAILED` and never reaches the
//! state machine.

use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::SessionError;

/// Credentials presented when a connection opens
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Credentials {
    /// Bearer token from the `token` query parameter
    pub token: Option<String>,
}

/// Authenticated owner of a session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserIdentity {
    pub user_id: String,
}

#[async_trait::async_trait]
pub trait Authenticator: Send + Sync {
    async fn authenticate(&self, credentials: &Credentials) -> Result<UserIdentity, SessionError>;
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ClaimUserId {
    Number(i64),
    Text(String),
}

#[derive(Debug, Deserialize)]
struct AccessClaims {
    user_id: Option<ClaimUserId>,
}

/// Validates HS256 access tokens carrying a `user_id` claim
pub struct JwtAuthenticator {
    key: DecodingKey,
    validation: Validation,
}

impl JwtAuthenticator {
    pub fn new(secret: &str) -> Self {
        Self {
            key: DecodingKey::from_secret(secret.as_bytes()),
            validation: Validation::new(Algorithm::HS256),
        }
    }
}

#[async_trait::async_trait]
impl Authenticator for JwtAuthenticator {
    async fn authenticate(&self, credentials: &Credentials) -> Result<UserIdentity, SessionError> {
        let token = credentials
            .token
            .as_deref()
            .filter(|t| !t.is_empty())
            .ok_or_else(|| SessionError::Auth("missing token".to_string()))?;

        let data = decode::<AccessClaims>(token, &self.key, &self.validation).map_err(|e| {
            warn!("JWT authentication error: {}", e);
            SessionError::Auth(format!("invalid token: {}", e))
        })?;

        let user_id = match data.claims.user_id {
            Some(ClaimUserId::Number(id)) => id.to_string(),
            Some(ClaimUserId::Text(id)) if !id.is_empty() => id,
            _ => return Err(SessionError::Auth("token has no user_id".to_string())),
        };

        Ok(UserIdentity { user_id })
    }
}

/// Admits everyone as the `local` user; for development setups
pub struct OpenAuthenticator;

#[async_trait::async_trait]
impl Authenticator for OpenAuthenticator {
    async fn authenticate(&self, _credentials: &Credentials) -> Result<UserIdentity, SessionError> {
        Ok(UserIdentity {
            user_id: "local".to_string(),
        })
    }
}
