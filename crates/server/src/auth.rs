// JWT authentication for live sessions and occurrence handling
// Decision: HS256 with a shared secret; tokens are issued by the external identity service
// Decision: Browsers cannot set headers on EventSource, so `?token=` is accepted as a fallback

use std::sync::Arc;

use axum::{
    async_trait,
    extract::{FromRef, FromRequestParts, Query},
    http::{header, request::Parts, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use chrono::Utc;
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use vigil_pipeline::{SessionRole, SessionScope};

/// Authentication error
#[derive(Debug, Clone, Serialize)]
pub struct AuthError {
    pub error: String,
    #[serde(skip)]
    pub status: StatusCode,
}

impl AuthError {
    pub fn unauthorized(message: &str) -> Self {
        Self {
            error: message.to_string(),
            status: StatusCode::UNAUTHORIZED,
        }
    }

    pub fn forbidden(message: &str) -> Self {
        Self {
            error: message.to_string(),
            status: StatusCode::FORBIDDEN,
        }
    }
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        (self.status, Json(self)).into_response()
    }
}

/// Claims carried by access tokens
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    /// User id
    pub sub: Uuid,
    pub role: String,
    pub tenant_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hospital_id: Option<Uuid>,
    pub exp: i64,
    #[serde(default)]
    pub iat: i64,
}

#[derive(Clone)]
pub struct JwtVerifier {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
}

impl JwtVerifier {
    pub fn new(secret: &str) -> Self {
        Self {
            encoding_key: EncodingKey::from_secret(secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
        }
    }

    /// Validate a token and turn its claims into a session scope
    pub fn verify(&self, token: &str) -> Result<SessionScope, AuthError> {
        let data = decode::<Claims>(token, &self.decoding_key, &Validation::default())
            .map_err(|e| {
                tracing::debug!(error = %e, "Rejected access token");
                AuthError::unauthorized("Invalid or expired token")
            })?;
        scope_from_claims(&data.claims)
    }

    /// Sign a token for the given scope (development tooling and tests)
    pub fn issue(&self, scope: &SessionScope, ttl: chrono::Duration) -> Result<String, AuthError> {
        let now = Utc::now();
        let claims = Claims {
            sub: scope.user_id,
            role: scope.role.to_string(),
            tenant_id: scope.tenant_id,
            hospital_id: scope.hospital_id,
            exp: (now + ttl).timestamp(),
            iat: now.timestamp(),
        };
        encode(&Header::default(), &claims, &self.encoding_key).map_err(|e| {
            tracing::error!(error = %e, "Failed to sign token");
            AuthError {
                error: "Failed to sign token".to_string(),
                status: StatusCode::INTERNAL_SERVER_ERROR,
            }
        })
    }
}

fn scope_from_claims(claims: &Claims) -> Result<SessionScope, AuthError> {
    let role: SessionRole = claims
        .role
        .parse()
        .map_err(|_| AuthError::forbidden("Unknown role"))?;
    if role == SessionRole::Operator && claims.hospital_id.is_none() {
        return Err(AuthError::forbidden("Operators must be bound to a hospital"));
    }
    Ok(SessionScope {
        user_id: claims.sub,
        role,
        tenant_id: claims.tenant_id,
        hospital_id: claims.hospital_id,
    })
}

#[derive(Debug, Deserialize)]
struct TokenQuery {
    token: Option<String>,
}

fn bearer_token(parts: &Parts) -> Option<String> {
    parts
        .headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn query_token(parts: &Parts) -> Option<String> {
    Query::<TokenQuery>::try_from_uri(&parts.uri)
        .ok()
        .and_then(|Query(q)| q.token)
        .filter(|v| !v.is_empty())
}

/// Authenticated caller, extracted from the bearer header or `?token=`
#[derive(Debug, Clone)]
pub struct AuthUser(pub SessionScope);

impl AuthUser {
    /// Whether the caller may see or act on a hospital's occurrences
    pub fn can_access(&self, tenant_id: Uuid, hospital_id: Uuid) -> bool {
        let scope = &self.0;
        scope.tenant_id == tenant_id && scope.hospital_id.map_or(true, |h| h == hospital_id)
    }
}

#[async_trait]
impl<S> FromRequestParts<S> for AuthUser
where
    Arc<JwtVerifier>: FromRef<S>,
    S: Send + Sync,
{
    type Rejection = AuthError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let verifier = Arc::<JwtVerifier>::from_ref(state);
        let token = bearer_token(parts)
            .or_else(|| query_token(parts))
            .ok_or_else(|| AuthError::unauthorized("Missing access token"))?;
        verifier.verify(&token).map(AuthUser)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scope(role: SessionRole, hospital_id: Option<Uuid>) -> SessionScope {
        SessionScope {
            user_id: Uuid::now_v7(),
            role,
            tenant_id: Uuid::now_v7(),
            hospital_id,
        }
    }

    #[test]
    fn test_issue_and_verify() {
        let verifier = JwtVerifier::new("secret");
        let original = scope(SessionRole::Operator, Some(Uuid::now_v7()));
        let token = verifier.issue(&original, chrono::Duration::minutes(5)).unwrap();
        assert_eq!(verifier.verify(&token).unwrap(), original);
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let token = JwtVerifier::new("a")
            .issue(&scope(SessionRole::Manager, None), chrono::Duration::minutes(5))
            .unwrap();
        let err = JwtVerifier::new("b").verify(&token).unwrap_err();
        assert_eq!(err.status, StatusCode::UNAUTHORIZED);
    }

    #[test]
    fn test_expired_rejected() {
        let verifier = JwtVerifier::new("secret");
        let token = verifier
            .issue(&scope(SessionRole::Manager, None), chrono::Duration::minutes(-10))
            .unwrap();
        assert!(verifier.verify(&token).is_err());
    }

    #[test]
    fn test_operator_requires_hospital() {
        let verifier = JwtVerifier::new("secret");
        let token = verifier
            .issue(&scope(SessionRole::Operator, None), chrono::Duration::minutes(5))
            .unwrap();
        let err = verifier.verify(&token).unwrap_err();
        assert_eq!(err.status, StatusCode::FORBIDDEN);
    }

    #[test]
    fn test_access_check() {
        let s = scope(SessionRole::Operator, Some(Uuid::now_v7()));
        let user = AuthUser(s.clone());
        assert!(user.can_access(s.tenant_id, s.hospital_id.unwrap()));
        assert!(!user.can_access(s.tenant_id, Uuid::now_v7()));
        assert!(!user.can_access(Uuid::now_v7(), s.hospital_id.unwrap()));

        let manager = AuthUser(scope(SessionRole::Manager, None));
        assert!(manager.can_access(manager.0.tenant_id, Uuid::now_v7()));
    }
}
