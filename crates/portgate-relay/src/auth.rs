//! Principal resolution
//!
//! Registration carries an opaque bearer token; a resolver turns it into a
//! principal name or rejects it. Two resolvers are provided: a static
//! token table for small deployments and an HS256 JWT validator. A relay
//! configured with an empty static table refuses every registration.

use async_trait::async_trait;
use chrono::Utc;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("invalid or unknown token")]
    Unauthorized,

    #[error("token expired")]
    Expired,
}

/// Turns bearer tokens into principal names.
#[async_trait]
pub trait ResolvePrincipal: Send + Sync {
    async fn resolve(&self, token: &str) -> Result<String, AuthError>;
}

/// Fixed token table. Empty means deny everything.
#[derive(Debug, Default)]
pub struct StaticTokenResolver {
    tokens: HashMap<String, String>,
}

impl StaticTokenResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, token: impl Into<String>, principal: impl Into<String>) {
        self.tokens.insert(token.into(), principal.into());
    }

    /// Build from CLI-style specs: `"principal:token"` or a bare token,
    /// which maps to the `default` principal. The first colon splits.
    pub fn from_specs<I, S>(specs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut resolver = Self::new();
        for spec in specs {
            match spec.as_ref().split_once(':') {
                Some((principal, token)) => resolver.insert(token, principal),
                None => resolver.insert(spec.as_ref(), "default"),
            }
        }
        resolver
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

#[async_trait]
impl ResolvePrincipal for StaticTokenResolver {
    async fn resolve(&self, token: &str) -> Result<String, AuthError> {
        self.tokens
            .get(token)
            .cloned()
            .ok_or(AuthError::Unauthorized)
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    sub: String,
    exp: i64,
    iat: i64,
}

/// Validates HS256 JWTs; the `sub` claim becomes the principal.
pub struct JwtResolver {
    decoding_key: DecodingKey,
    validation: Validation,
}

impl JwtResolver {
    pub fn new(secret: &[u8]) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_aud = false;
        Self {
            decoding_key: DecodingKey::from_secret(secret),
            validation,
        }
    }

    /// Mint a token for `principal`, valid for `validity`.
    pub fn issue(
        secret: &[u8],
        principal: &str,
        validity: chrono::Duration,
    ) -> Result<String, jsonwebtoken::errors::Error> {
        let now = Utc::now();
        let claims = Claims {
            sub: principal.to_string(),
            exp: (now + validity).timestamp(),
            iat: now.timestamp(),
        };
        encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(secret),
        )
    }
}

#[async_trait]
impl ResolvePrincipal for JwtResolver {
    async fn resolve(&self, token: &str) -> Result<String, AuthError> {
        match decode::<Claims>(token, &self.decoding_key, &self.validation) {
            Ok(data) => Ok(data.claims.sub),
            Err(e) => match e.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => Err(AuthError::Expired),
                _ => Err(AuthError::Unauthorized),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_static_resolver_hit_and_miss() {
        let mut resolver = StaticTokenResolver::new();
        resolver.insert("secret-token", "alice");

        assert_eq!(resolver.resolve("secret-token").await.unwrap(), "alice");
        assert_eq!(
            resolver.resolve("wrong").await.unwrap_err(),
            AuthError::Unauthorized
        );
    }

    #[tokio::test]
    async fn test_empty_table_denies_all() {
        let resolver = StaticTokenResolver::new();
        assert!(resolver.resolve("anything").await.is_err());
    }

    #[tokio::test]
    async fn test_from_specs() {
        let resolver =
            StaticTokenResolver::from_specs(["alice:tok-a", "bob:tok-b", "bare-token"]);
        assert_eq!(resolver.len(), 3);
        assert_eq!(resolver.resolve("tok-a").await.unwrap(), "alice");
        assert_eq!(resolver.resolve("tok-b").await.unwrap(), "bob");
        assert_eq!(resolver.resolve("bare-token").await.unwrap(), "default");
    }

    #[tokio::test]
    async fn test_jwt_round_trip() {
        let secret = b"test-secret";
        let token =
            JwtResolver::issue(secret, "carol", chrono::Duration::minutes(5)).unwrap();

        let resolver = JwtResolver::new(secret);
        assert_eq!(resolver.resolve(&token).await.unwrap(), "carol");
    }

    #[tokio::test]
    async fn test_jwt_expired() {
        let secret = b"test-secret";
        let token =
            JwtResolver::issue(secret, "carol", chrono::Duration::minutes(-5)).unwrap();

        let resolver = JwtResolver::new(secret);
        assert_eq!(resolver.resolve(&token).await.unwrap_err(), AuthError::Expired);
    }

    #[tokio::test]
    async fn test_jwt_wrong_secret() {
        let token =
            JwtResolver::issue(b"secret-one", "carol", chrono::Duration::minutes(5)).unwrap();

        let resolver = JwtResolver::new(b"secret-two");
        assert_eq!(
            resolver.resolve(&token).await.unwrap_err(),
            AuthError::Unauthorized
        );
    }

    #[tokio::test]
    async fn test_jwt_garbage_token() {
        let resolver = JwtResolver::new(b"secret");
        assert!(resolver.resolve("not-a-jwt").await.is_err());
    }
}
