//! Bearer-token owner sessions.
//!
//! Tokens are HS256 JWTs whose `sub` is the owner id. The `system` claim
//! additionally allows acting on the shared scope.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    async_trait,
    extract::FromRequestParts,
    http::{header::AUTHORIZATION, request::Parts},
};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::db::OwnerScope;
use crate::routes::{ApiError, AppState};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// Owner id
    pub sub: String,
    /// Expiration, unix seconds
    pub exp: u64,
    #[serde(default)]
    pub system: bool,
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("Missing authorization")]
    Missing,
    #[error("Invalid or expired token")]
    Invalid,
    #[error("Shared scope requires a system session")]
    Forbidden,
}

pub struct AuthKeys {
    encoding: EncodingKey,
    decoding: DecodingKey,
    validation: Validation,
}

impl AuthKeys {
    pub fn new(secret: &str) -> Self {
        let mut validation = Validation::default();
        validation.validate_exp = true;

        Self {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            validation,
        }
    }

    pub fn issue(&self, owner: &str, ttl: Duration, system: bool) -> anyhow::Result<String> {
        let exp = chrono::Utc::now().timestamp() as u64 + ttl.as_secs();
        let claims = Claims {
            sub: owner.to_string(),
            exp,
            system,
        };
        Ok(encode(&Header::default(), &claims, &self.encoding)?)
    }

    pub fn verify(&self, token: &str) -> Result<Claims, AuthError> {
        let data = decode::<Claims>(token, &self.decoding, &self.validation).map_err(|e| {
            debug!("JWT validation failed: {}", e);
            AuthError::Invalid
        })?;
        if data.claims.sub.trim().is_empty() {
            return Err(AuthError::Invalid);
        }
        Ok(data.claims)
    }
}

/// An authenticated owner.
#[derive(Debug, Clone)]
pub struct OwnerSession(pub Claims);

impl OwnerSession {
    pub fn scope(&self) -> OwnerScope {
        OwnerScope::user(self.0.sub.clone())
    }

    pub fn require_system(&self) -> Result<(), AuthError> {
        if self.0.system {
            Ok(())
        } else {
            Err(AuthError::Forbidden)
        }
    }
}

#[async_trait]
impl FromRequestParts<Arc<AppState>> for OwnerSession {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let token = parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("Bearer "))
            .ok_or(AuthError::Missing)?;

        let claims = state.auth.verify(token.trim())?;
        Ok(OwnerSession(claims))
    }
}
