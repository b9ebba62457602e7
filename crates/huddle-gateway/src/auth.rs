//! Handshake authentication
//!
//! The bearer credential is checked once, while the WebSocket upgrade is
//! still pending. A rejected handshake never becomes a connection, and an
//! admitted connection keeps its identity until it closes.

use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request};
use tokio_tungstenite::tungstenite::http::{header, StatusCode};

/// Query parameters that may carry the credential, in lookup order
const CREDENTIAL_PARAMS: &[&str] = &["token", "auth"];

/// A verified user identity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    pub user_id: String,
    pub display_name: String,
}

impl Identity {
    pub fn new(user_id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            display_name: display_name.into(),
        }
    }
}

/// Turns a bearer credential into a verified identity
pub trait IdentityVerifier: Send + Sync {
    fn verify(&self, credential: &str) -> Result<Identity, AuthError>;
}

/// Authentication errors. Never sent to clients.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum AuthError {
    #[error("Missing credential")]
    Missing,
    #[error("Credential expired")]
    Expired,
    #[error("Invalid credential: {0}")]
    Invalid(String),
}

/// JWT claims issued by the identity service
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// User ID
    pub sub: String,
    /// Display name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Expiry, seconds since the epoch
    pub exp: i64,
}

/// Verifies HS256 tokens signed with a shared secret
#[derive(Clone)]
pub struct JwtVerifier {
    key: DecodingKey,
    validation: Validation,
}

impl JwtVerifier {
    pub fn new(secret: &[u8]) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_required_spec_claims(&["exp", "sub"]);
        Self {
            key: DecodingKey::from_secret(secret),
            validation,
        }
    }
}

impl fmt::Debug for JwtVerifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JwtVerifier")
            .field("algorithms", &self.validation.algorithms)
            .finish_non_exhaustive()
    }
}

impl IdentityVerifier for JwtVerifier {
    fn verify(&self, credential: &str) -> Result<Identity, AuthError> {
        let data = decode::<Claims>(credential, &self.key, &self.validation).map_err(|e| {
            match e.kind() {
                ErrorKind::ExpiredSignature => AuthError::Expired,
                _ => AuthError::Invalid(e.to_string()),
            }
        })?;

        let Claims { sub, name, .. } = data.claims;
        if sub.trim().is_empty() {
            return Err(AuthError::Invalid("empty subject".to_string()));
        }
        let display_name = name
            .filter(|name| !name.trim().is_empty())
            .unwrap_or_else(|| sub.clone());
        Ok(Identity::new(sub, display_name))
    }
}

/// Fixed token table, for development and tests
#[derive(Debug, Clone, Default)]
pub struct StaticTokenVerifier {
    tokens: HashMap<String, Identity>,
}

impl StaticTokenVerifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_token(mut self, token: impl Into<String>, identity: Identity) -> Self {
        self.tokens.insert(token.into(), identity);
        self
    }
}

impl FromIterator<(String, Identity)> for StaticTokenVerifier {
    fn from_iter<I: IntoIterator<Item = (String, Identity)>>(iter: I) -> Self {
        Self {
            tokens: iter.into_iter().collect(),
        }
    }
}

impl IdentityVerifier for StaticTokenVerifier {
    fn verify(&self, credential: &str) -> Result<Identity, AuthError> {
        self.tokens
            .get(credential)
            .cloned()
            .ok_or_else(|| AuthError::Invalid("unknown token".to_string()))
    }
}

/// Strip an optional `Bearer ` prefix; blank credentials count as missing
pub fn strip_bearer(raw: &str) -> Option<&str> {
    let raw = raw.trim();
    let token = raw.strip_prefix("Bearer ").unwrap_or(raw).trim();
    (!token.is_empty()).then_some(token)
}

/// Find the credential in the `Authorization` header or the query string
pub fn extract_credential(request: &Request) -> Option<String> {
    let from_header = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(strip_bearer);
    if let Some(token) = from_header {
        return Some(token.to_string());
    }

    let query = request.uri().query()?;
    let params: Vec<(String, String)> = url::form_urlencoded::parse(query.as_bytes())
        .into_owned()
        .collect();
    CREDENTIAL_PARAMS.iter().find_map(|name| {
        params
            .iter()
            .find(|(key, _)| key == name)
            .and_then(|(_, value)| strip_bearer(value))
            .map(str::to_string)
    })
}

/// Admits or refuses pending connections
#[derive(Clone)]
pub struct AuthInterceptor {
    verifier: Arc<dyn IdentityVerifier>,
}

impl fmt::Debug for AuthInterceptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthInterceptor").finish_non_exhaustive()
    }
}

impl AuthInterceptor {
    pub fn new(verifier: Arc<dyn IdentityVerifier>) -> Self {
        Self { verifier }
    }

    /// Verify the handshake request
    pub fn admit(&self, request: &Request) -> Result<Identity, AuthError> {
        let credential = extract_credential(request).ok_or(AuthError::Missing)?;
        self.verifier.verify(&credential)
    }
}

/// Opaque refusal sent in place of the upgrade response
pub fn unauthorized() -> ErrorResponse {
    error_response(StatusCode::UNAUTHORIZED, "Unauthorized")
}

pub(crate) fn error_response(status: StatusCode, body: &str) -> ErrorResponse {
    let mut response = ErrorResponse::new(Some(body.to_string()));
    *response.status_mut() = status;
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};

    const SECRET: &[u8] = b"test-secret";

    fn token(claims: &Claims, secret: &[u8]) -> String {
        encode(&Header::default(), claims, &EncodingKey::from_secret(secret)).unwrap()
    }

    fn claims(sub: &str, name: Option<&str>, ttl_secs: i64) -> Claims {
        Claims {
            sub: sub.to_string(),
            name: name.map(str::to_string),
            exp: chrono::Utc::now().timestamp() + ttl_secs,
        }
    }

    fn request(uri: &str, authorization: Option<&str>) -> Request {
        let mut builder = Request::builder().uri(uri);
        if let Some(value) = authorization {
            builder = builder.header(header::AUTHORIZATION, value);
        }
        builder.body(()).unwrap()
    }

    #[test]
    fn test_strip_bearer() {
        assert_eq!(strip_bearer("Bearer abc"), Some("abc"));
        assert_eq!(strip_bearer("abc"), Some("abc"));
        assert_eq!(strip_bearer("  Bearer  abc "), Some("abc"));
        assert_eq!(strip_bearer("Bearer "), None);
        assert_eq!(strip_bearer(""), None);
    }

    #[test]
    fn test_extract_from_header_first() {
        let req = request("/?token=from-query", Some("Bearer from-header"));
        assert_eq!(extract_credential(&req).as_deref(), Some("from-header"));
    }

    #[test]
    fn test_extract_from_query() {
        let req = request("/socket?token=abc.def", None);
        assert_eq!(extract_credential(&req).as_deref(), Some("abc.def"));

        let req = request("/socket?room=1&auth=Bearer%20xyz", None);
        assert_eq!(extract_credential(&req).as_deref(), Some("xyz"));

        let req = request("/socket?room=1", None);
        assert_eq!(extract_credential(&req), None);
    }

    #[test]
    fn test_jwt_verifier_accepts_valid_token() {
        let verifier = JwtVerifier::new(SECRET);
        let identity = verifier
            .verify(&token(&claims("u-1", Some("Alice"), 3600), SECRET))
            .unwrap();
        assert_eq!(identity, Identity::new("u-1", "Alice"));

        let identity = verifier
            .verify(&token(&claims("u-2", None, 3600), SECRET))
            .unwrap();
        assert_eq!(identity.display_name, "u-2");
    }

    #[test]
    fn test_jwt_verifier_rejects_bad_tokens() {
        let verifier = JwtVerifier::new(SECRET);

        assert_eq!(
            verifier.verify(&token(&claims("u-1", None, -3600), SECRET)),
            Err(AuthError::Expired)
        );
        assert!(matches!(
            verifier.verify(&token(&claims("u-1", None, 3600), b"other-secret")),
            Err(AuthError::Invalid(_))
        ));
        assert!(matches!(verifier.verify("not-a-jwt"), Err(AuthError::Invalid(_))));
    }

    #[test]
    fn test_interceptor_admits_or_refuses() {
        let verifier = StaticTokenVerifier::new().with_token("t-1", Identity::new("u-1", "One"));
        let interceptor = AuthInterceptor::new(Arc::new(verifier));

        let admitted = interceptor.admit(&request("/", Some("Bearer t-1"))).unwrap();
        assert_eq!(admitted.user_id, "u-1");

        assert_eq!(interceptor.admit(&request("/", None)), Err(AuthError::Missing));
        assert!(matches!(
            interceptor.admit(&request("/", Some("Bearer t-2"))),
            Err(AuthError::Invalid(_))
        ));
    }

    #[test]
    fn test_unauthorized_is_opaque() {
        let response = unauthorized();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(response.body().as_deref(), Some("Unauthorized"));
    }
}
