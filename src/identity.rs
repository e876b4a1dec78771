//! Resolving a connection to a user id before it may do anything.

use async_trait::async_trait;
use axum::http::{header, HeaderMap};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;

/// Cookie and query parameter carrying the token.
pub const TOKEN_NAME: &str = "token";

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("no token provided")]
    MissingToken,

    #[error("token is not valid: {0}")]
    InvalidToken(String),
}

/// Turns a bearer token into a stable user id.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    async fn resolve(&self, token: &str) -> Result<String, AuthError>;
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Claims {
    user_id: String,
    exp: u64,
}

/// HS256 tokens carrying a `userId` claim.
pub struct JwtIdentity {
    encoding: EncodingKey,
    decoding: DecodingKey,
    validation: Validation,
}

impl JwtIdentity {
    pub fn new(secret: &str) -> Self {
        Self {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            validation: Validation::new(Algorithm::HS256),
        }
    }

    /// Sign a token for `user_id` valid for `ttl`.
    pub fn issue(&self, user_id: &str, ttl: Duration) -> Result<String, AuthError> {
        let exp = SystemTime::now()
            .checked_add(ttl)
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map_or(0, |d| d.as_secs());
        let claims = Claims {
            user_id: user_id.to_string(),
            exp,
        };
        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)
            .map_err(|e| AuthError::InvalidToken(e.to_string()))
    }
}

#[async_trait]
impl IdentityProvider for JwtIdentity {
    async fn resolve(&self, token: &str) -> Result<String, AuthError> {
        let data = decode::<Claims>(token, &self.decoding, &self.validation)
            .map_err(|e| AuthError::InvalidToken(e.to_string()))?;
        if data.claims.user_id.is_empty() {
            return Err(AuthError::InvalidToken("empty userId".to_string()));
        }
        Ok(data.claims.user_id)
    }
}

/// Find the token on a request: `token` cookie, then bearer header, then
/// `token` query parameter.
pub fn extract_token(headers: &HeaderMap, query: Option<&str>) -> Option<String> {
    cookie_token(headers)
        .or_else(|| bearer_token(headers))
        .or_else(|| query.and_then(query_token))
}

fn cookie_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(name, value)| *name == TOKEN_NAME && !value.is_empty())
        .map(|(_, value)| value.to_string())
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_string)
}

fn query_token(query: &str) -> Option<String> {
    query
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(name, value)| *name == TOKEN_NAME && !value.is_empty())
        .map(|(_, value)| value.to_string())
}
