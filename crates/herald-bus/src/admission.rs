//! Admission check for the push endpoint.
//!
//! A channel is only opened for a request carrying a valid admin session.
//! The token is read from `Authorization: Bearer <token>` first, then from
//! the session cookie. Refusals surface as [`BusError::AdmissionDenied`],
//! which the hub turns into a 401 before any frame is written.

use axum::http::{header, HeaderMap};
use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, TokenData, Validation};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::AuthSettings;
use crate::error::{BusError, BusResult};

/// Role required to open the admin channel.
pub const ADMIN_ROLE: &str = "admin";

/// Session token claims.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionClaims {
    /// Subject (admin user id)
    pub sub: String,

    /// Role of the session owner
    pub role: String,

    /// Issued at (Unix timestamp)
    pub iat: i64,

    /// Expiration (Unix timestamp)
    pub exp: i64,

    /// Session ID, one per login
    pub sid: String,
}

/// An admitted admin session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdmittedSession {
    pub session_id: String,
    pub user_id: String,
}

/// Decides whether a request may open a push channel.
pub trait AdmissionCheck: Send + Sync {
    fn admit(&self, headers: &HeaderMap) -> BusResult<AdmittedSession>;
}

// =============================================================================
// JWT Admission
// =============================================================================

/// HS256 session token verifier (and issuer, for dev tooling and tests).
pub struct JwtAdmission {
    secret: String,
    cookie_name: String,
    lifetime_secs: i64,
}

impl JwtAdmission {
    pub fn new(secret: impl Into<String>, cookie_name: impl Into<String>, lifetime_secs: i64) -> Self {
        JwtAdmission {
            secret: secret.into(),
            cookie_name: cookie_name.into(),
            lifetime_secs,
        }
    }

    pub fn from_settings(settings: &AuthSettings) -> Self {
        Self::new(
            settings.jwt_secret.clone(),
            settings.session_cookie.clone(),
            settings.session_lifetime_secs,
        )
    }

    /// Issue a session token.
    pub fn issue(&self, user_id: &str, role: &str) -> BusResult<String> {
        let now = Utc::now();
        let exp = now + Duration::seconds(self.lifetime_secs);

        let claims = SessionClaims {
            sub: user_id.to_string(),
            role: role.to_string(),
            iat: now.timestamp(),
            exp: exp.timestamp(),
            sid: Uuid::new_v4().to_string(),
        };

        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(self.secret.as_bytes()),
        )
        .map_err(|e| BusError::Serialization(format!("Failed to issue session token: {}", e)))
    }

    /// Validate and decode a token.
    pub fn validate(&self, token: &str) -> BusResult<SessionClaims> {
        let token_data: TokenData<SessionClaims> = decode(
            token,
            &DecodingKey::from_secret(self.secret.as_bytes()),
            &Validation::default(),
        )?;

        Ok(token_data.claims)
    }

    fn token_from<'a>(&self, headers: &'a HeaderMap) -> Option<&'a str> {
        headers
            .get(header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(extract_bearer_token)
            .or_else(|| {
                headers
                    .get_all(header::COOKIE)
                    .iter()
                    .filter_map(|value| value.to_str().ok())
                    .find_map(|cookies| extract_cookie(cookies, &self.cookie_name))
            })
    }
}

impl AdmissionCheck for JwtAdmission {
    fn admit(&self, headers: &HeaderMap) -> BusResult<AdmittedSession> {
        let token = self
            .token_from(headers)
            .ok_or_else(|| BusError::AdmissionDenied("missing session".into()))?;

        let claims = self.validate(token)?;
        if claims.role != ADMIN_ROLE {
            return Err(BusError::AdmissionDenied(format!(
                "role '{}' may not open the admin channel",
                claims.role
            )));
        }

        Ok(AdmittedSession {
            session_id: claims.sid,
            user_id: claims.sub,
        })
    }
}

/// Extract bearer token from authorization header.
pub fn extract_bearer_token(auth_header: &str) -> Option<&str> {
    auth_header
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|token| !token.is_empty())
}

/// Extract a named cookie from a `Cookie` header value.
pub fn extract_cookie<'a>(cookies: &'a str, name: &str) -> Option<&'a str> {
    cookies.split(';').find_map(|pair| {
        let (key, value) = pair.trim().split_once('=')?;
        (key == name && !value.is_empty()).then_some(value)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn admission() -> JwtAdmission {
        JwtAdmission::new("test-secret", "admin_session", 3600)
    }

    fn headers(name: header::HeaderName, value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(name, HeaderValue::from_str(value).unwrap());
        headers
    }

    #[test]
    fn test_bearer_token_admits_admin() {
        let admission = admission();
        let token = admission.issue("user-1", ADMIN_ROLE).unwrap();

        let session = admission
            .admit(&headers(header::AUTHORIZATION, &format!("Bearer {}", token)))
            .unwrap();

        assert_eq!(session.user_id, "user-1");
        assert!(!session.session_id.is_empty());
    }

    #[test]
    fn test_cookie_admits_admin() {
        let admission = admission();
        let token = admission.issue("user-2", ADMIN_ROLE).unwrap();
        let cookie = format!("theme=dark; admin_session={}; lang=en", token);

        let session = admission.admit(&headers(header::COOKIE, &cookie)).unwrap();
        assert_eq!(session.user_id, "user-2");
    }

    #[test]
    fn test_missing_session_is_denied() {
        let result = admission().admit(&HeaderMap::new());
        assert!(matches!(result, Err(BusError::AdmissionDenied(_))));
    }

    #[test]
    fn test_non_admin_role_is_denied() {
        let admission = admission();
        let token = admission.issue("user-3", "customer").unwrap();

        let result = admission.admit(&headers(header::AUTHORIZATION, &format!("Bearer {}", token)));
        assert!(matches!(result, Err(BusError::AdmissionDenied(_))));
    }

    #[test]
    fn test_expired_token_is_denied() {
        // Well past the validator's default leeway.
        let admission = JwtAdmission::new("test-secret", "admin_session", -600);
        let token = admission.issue("user-4", ADMIN_ROLE).unwrap();

        let err = admission.validate(&token).unwrap_err();
        assert!(err.to_string().contains("expired"));
    }

    #[test]
    fn test_foreign_signature_is_denied() {
        let token = JwtAdmission::new("other-secret", "admin_session", 3600)
            .issue("user-5", ADMIN_ROLE)
            .unwrap();

        assert!(admission().validate(&token).is_err());
    }

    #[test]
    fn test_extract_helpers() {
        assert_eq!(extract_bearer_token("Bearer abc"), Some("abc"));
        assert_eq!(extract_bearer_token("Basic abc"), None);
        assert_eq!(extract_bearer_token("Bearer "), None);

        assert_eq!(extract_cookie("a=1; b=2", "b"), Some("2"));
        assert_eq!(extract_cookie("a=1; b=", "b"), None);
        assert_eq!(extract_cookie("ab=1", "a"), None);
    }
}
