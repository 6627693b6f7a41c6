use axum::http::{header, HeaderMap};
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::Deserialize;
use thiserror::Error;

use crate::protocol::ResourceId;

pub const DEFAULT_AUTH_COOKIE: &str = "access_token";

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("no credential supplied")]
    MissingCredential,
    #[error("token validation failed: {0}")]
    InvalidToken(#[from] jsonwebtoken::errors::Error),
    #[error("token missing identity claim")]
    MissingIdentity,
}

impl AuthError {
    /// Close-frame reason sent to the peer.
    pub fn close_reason(&self) -> &'static str {
        match self {
            AuthError::MissingCredential => "unauthorized: no credential",
            AuthError::InvalidToken(_) | AuthError::MissingIdentity => {
                "unauthorized: invalid or expired credential"
            }
        }
    }

    pub fn metric_label(&self) -> &'static str {
        match self {
            AuthError::MissingCredential => "missing_credential",
            AuthError::InvalidToken(_) => "invalid_token",
            AuthError::MissingIdentity => "missing_identity",
        }
    }
}

/// Identity claims accepted from the token issuer. The first present of
/// `sub`, `userId`, `id` names the principal.
#[derive(Debug, Deserialize)]
struct IdentityClaims {
    #[serde(default)]
    sub: Option<ResourceId>,
    #[serde(default, rename = "userId")]
    user_id: Option<ResourceId>,
    #[serde(default)]
    id: Option<ResourceId>,
}

impl IdentityClaims {
    fn identity(self) -> Option<String> {
        [self.sub, self.user_id, self.id]
            .into_iter()
            .flatten()
            .find(|id| !id.is_blank())
            .map(|id| id.to_string())
    }
}

/// Verifies HS256 session tokens issued by the REST backend.
#[derive(Clone)]
pub struct CredentialVerifier {
    key: DecodingKey,
    validation: Validation,
    cookie_name: String,
}

impl CredentialVerifier {
    pub fn new(secret: &[u8], cookie_name: impl Into<String>) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_aud = false;
        Self {
            key: DecodingKey::from_secret(secret),
            validation,
            cookie_name: cookie_name.into(),
        }
    }

    pub fn cookie_name(&self) -> &str {
        &self.cookie_name
    }

    /// Reads the token from the auth cookie, falling back to a bearer header.
    pub fn extract_credential(&self, headers: &HeaderMap) -> Option<String> {
        cookie_value(headers, &self.cookie_name).or_else(|| bearer_token(headers))
    }

    pub fn verify(&self, token: &str) -> Result<String, AuthError> {
        let data = decode::<IdentityClaims>(token, &self.key, &self.validation)?;
        data.claims.identity().ok_or(AuthError::MissingIdentity)
    }

    pub fn authenticate(&self, headers: &HeaderMap) -> Result<String, AuthError> {
        let token = self
            .extract_credential(headers)
            .ok_or(AuthError::MissingCredential)?;
        self.verify(&token)
    }
}

pub fn cookie_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(';'))
        .filter_map(|pair| {
            let (key, value) = pair.trim().split_once('=')?;
            (key.trim() == name).then(|| value.trim().trim_matches('"').to_string())
        })
        .find(|value| !value.is_empty())
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.trim().split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = token.trim();
    (!token.is_empty()).then(|| token.to_string())
}
