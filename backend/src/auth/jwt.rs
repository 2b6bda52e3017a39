use jsonwebtoken::{decode, errors::ErrorKind, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("No authentication token provided")]
    MissingToken,
    #[error("Authentication token has expired")]
    Expired,
    #[error("Invalid token: {0}")]
    Invalid(String),
    #[error("Token payload is missing a subject")]
    InvalidPayload,
}

impl From<jsonwebtoken::errors::Error> for AuthError {
    fn from(err: jsonwebtoken::errors::Error) -> Self {
        match err.kind() {
            ErrorKind::ExpiredSignature => Self::Expired,
            _ => Self::Invalid(err.to_string()),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    #[serde(alias = "userId")]
    pub sub: String, // Subject (user ID)
    #[serde(default)]
    pub roles: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exp: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iat: Option<i64>,
}

/// Identity attached to a socket once its token checks out
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub user_id: String,
    pub roles: HashSet<String>,
}

/// Verifies bearer tokens against the shared secret. Tokens are minted
/// elsewhere; this side only checks them.
#[derive(Clone)]
pub struct TokenVerifier {
    key: DecodingKey,
    validation: Validation,
}

impl TokenVerifier {
    pub fn new(secret: &str) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        // exp is validated when present but not required
        validation.required_spec_claims = HashSet::new();
        validation.leeway = 5;

        Self {
            key: DecodingKey::from_secret(secret.as_bytes()),
            validation,
        }
    }

    pub fn verify(&self, token: Option<&str>) -> Result<Principal, AuthError> {
        let token = token
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .ok_or(AuthError::MissingToken)?;

        let data = decode::<Claims>(token, &self.key, &self.validation)?;
        let claims = data.claims;

        if claims.sub.trim().is_empty() {
            return Err(AuthError::InvalidPayload);
        }

        Ok(Principal {
            user_id: claims.sub,
            roles: claims.roles.into_iter().collect(),
        })
    }
}

impl std::fmt::Debug for TokenVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenVerifier")
            .field("algorithms", &self.validation.algorithms)
            .finish_non_exhaustive()
    }
}

/// Pick the bearer token from the handshake auth field, falling back to the
/// `Authorization` header. A leading `Bearer` scheme is stripped from
/// either; a scheme with no credentials counts as no token.
pub fn extract_bearer(auth_field: Option<&str>, authorization: Option<&str>) -> Option<String> {
    auth_field
        .filter(|t| !t.trim().is_empty())
        .or(authorization)
        .map(|raw| strip_scheme(raw.trim_start()).trim().to_string())
        .filter(|t| !t.is_empty())
}

fn strip_scheme(raw: &str) -> &str {
    match raw.strip_prefix("Bearer") {
        Some(rest) if rest.is_empty() || rest.starts_with(char::is_whitespace) => rest,
        _ => raw,
    }
}
