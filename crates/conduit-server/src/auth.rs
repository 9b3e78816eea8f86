//! Handshake authentication: HS256 bearer tokens.
//!
//! The token is taken from `Authorization: Bearer …` or a `token` query
//! parameter and must carry `sub`, `org`, `role` and `exp`. A rejected
//! token never reaches the connection registry.

use axum::http::HeaderMap;
use axum::http::header::AUTHORIZATION;
use conduit_protocol::Role;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde::{Deserialize, Serialize};

/// Handshake failures. All of them map to HTTP 401.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    /// No bearer credential on the request.
    #[error("missing bearer token")]
    MissingToken,
    /// Signature, expiry or issuer check failed.
    #[error("invalid token: {0}")]
    InvalidToken(#[from] jsonwebtoken::errors::Error),
    /// The `role` claim is not a known role.
    #[error("unknown role: {0}")]
    UnknownRole(String),
    /// `sub` or `org` is empty.
    #[error("token is missing the {0} claim")]
    EmptyClaim(&'static str),
}

/// JWT claims accepted at the handshake.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    /// User id.
    pub sub: String,
    /// Organization id.
    pub org: String,
    /// Role wire name, e.g. `DEVELOPER`.
    pub role: String,
    /// Expiry, Unix seconds.
    pub exp: u64,
    /// Issuer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iss: Option<String>,
}

/// Identity established by a verified token.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AuthContext {
    /// Authenticated user.
    pub user_id: String,
    /// User's organization.
    pub organization_id: String,
    /// User's role.
    pub role: Role,
}

/// Verifies (and, for tooling and tests, issues) HS256 tokens.
#[derive(Clone)]
pub struct TokenVerifier {
    decoding: DecodingKey,
    encoding: EncodingKey,
    validation: Validation,
}

impl std::fmt::Debug for TokenVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenVerifier").finish_non_exhaustive()
    }
}

impl TokenVerifier {
    /// Verifier for `secret`, optionally enforcing the `iss` claim.
    pub fn new(secret: &str, issuer: Option<&str>) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_required_spec_claims(&["exp", "sub"]);
        if let Some(iss) = issuer {
            validation.set_issuer(&[iss]);
        }
        Self {
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            validation,
        }
    }

    /// Verify a token and resolve the caller's identity.
    pub fn verify(&self, token: &str) -> Result<AuthContext, AuthError> {
        let data = decode::<Claims>(token, &self.decoding, &self.validation)?;
        let claims = data.claims;
        if claims.sub.is_empty() {
            return Err(AuthError::EmptyClaim("sub"));
        }
        if claims.org.is_empty() {
            return Err(AuthError::EmptyClaim("org"));
        }
        let role = Role::parse(&claims.role).ok_or_else(|| AuthError::UnknownRole(claims.role.clone()))?;
        Ok(AuthContext {
            user_id: claims.sub,
            organization_id: claims.org,
            role,
        })
    }

    /// Verify the bearer credential carried by a handshake request.
    pub fn authenticate(&self, headers: &HeaderMap, query: Option<&str>) -> Result<AuthContext, AuthError> {
        let token = bearer_token(headers, query).ok_or(AuthError::MissingToken)?;
        self.verify(&token)
    }

    /// Sign claims with this verifier's secret.
    pub fn issue(&self, claims: &Claims) -> Result<String, AuthError> {
        Ok(encode(&Header::new(Algorithm::HS256), claims, &self.encoding)?)
    }
}

/// Bearer token from the `Authorization` header, else the `token` query
/// parameter.
pub fn bearer_token(headers: &HeaderMap, query: Option<&str>) -> Option<String> {
    let from_header = headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty());
    if let Some(token) = from_header {
        return Some(token.to_owned());
    }
    query?
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(k, _)| *k == "token")
        .map(|(_, v)| v.to_owned())
        .filter(|t| !t.is_empty())
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
