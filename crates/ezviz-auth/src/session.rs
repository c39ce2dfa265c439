//! Authenticated session state

use crate::error::AuthError;
use chrono::{DateTime, Duration, TimeZone, Utc};
use jsonwebtoken::{decode, decode_header, DecodingKey, Validation};
use serde::Deserialize;

/// Claims carried in the session token (a JWT issued at login)
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SessionClaims {
    /// Signature value required by the relay token endpoint
    #[serde(default)]
    pub s: Option<String>,
    /// Expiry as unix seconds
    #[serde(default)]
    pub exp: Option<i64>,
}

/// A logged-in session
#[derive(Debug, Clone)]
pub struct AuthSession {
    /// Vendor session id, sent as `sessionId`
    pub token: String,
    pub issued_at: DateTime<Utc>,
    /// Base URL of the regional API that issued the token
    pub api_url: String,
    /// Relay token server discovered after login
    pub auth_addr: String,
    expires_at: Option<DateTime<Utc>>,
}

impl AuthSession {
    pub fn new(token: String, api_url: String, auth_addr: String) -> Self {
        let expires_at = decode_claims(&token)
            .ok()
            .and_then(|claims| claims.exp)
            .and_then(|exp| Utc.timestamp_opt(exp, 0).single());

        Self {
            token,
            issued_at: Utc::now(),
            api_url,
            auth_addr,
            expires_at,
        }
    }

    pub fn with_issued_at(mut self, issued_at: DateTime<Utc>) -> Self {
        self.issued_at = issued_at;
        self
    }

    pub fn claims(&self) -> Result<SessionClaims, AuthError> {
        decode_claims(&self.token)
    }

    /// The `s` claim, required to request relay tokens
    pub fn sign(&self) -> Result<String, AuthError> {
        self.claims()?
            .s
            .filter(|s| !s.is_empty())
            .ok_or_else(|| AuthError::InvalidResponse("No 's' field in session claims".into()))
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.expires_at
    }

    /// A session is expired once its `exp` claim has passed, or once it is
    /// older than `max_age`, whichever comes first
    pub fn is_expired(&self, now: DateTime<Utc>, max_age: Duration) -> bool {
        if let Some(expires_at) = self.expires_at {
            if now >= expires_at {
                return true;
            }
        }
        now - self.issued_at >= max_age
    }
}

/// Read the claims without verifying the signature. The key is vendor-held;
/// expiry is checked by [`AuthSession::is_expired`] instead.
fn decode_claims(token: &str) -> Result<SessionClaims, AuthError> {
    let header = decode_header(token)
        .map_err(|e| AuthError::InvalidResponse(format!("Session token is not a JWT: {}", e)))?;

    let mut validation = Validation::new(header.alg);
    validation.insecure_disable_signature_validation();
    validation.validate_exp = false;
    validation.validate_aud = false;
    validation.required_spec_claims.clear();

    decode::<SessionClaims>(token, &DecodingKey::from_secret(&[]), &validation)
        .map(|data| data.claims)
        .map_err(|e| AuthError::InvalidResponse(format!("Invalid JWT claims: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};
    use serde_json::json;

    /// Signed with a key the client never sees
    fn test_token(claims: &serde_json::Value) -> String {
        encode(
            &Header::default(),
            claims,
            &EncodingKey::from_secret(b"vendor-secret"),
        )
        .unwrap()
    }

    #[test]
    fn test_sign_claim() {
        let token = test_token(&json!({ "s": "abc123", "exp": 4102444800i64 }));
        let session = AuthSession::new(token, "https://api".into(), "https://auth".into());

        assert_eq!(session.sign().unwrap(), "abc123");
        assert_eq!(session.expires_at().unwrap().timestamp(), 4102444800);
    }

    #[test]
    fn test_missing_sign_claim() {
        let token = test_token(&json!({ "exp": 1 }));
        let session = AuthSession::new(token, String::new(), String::new());
        assert!(matches!(session.sign(), Err(AuthError::InvalidResponse(_))));
    }

    #[test]
    fn test_claims_without_expiry_or_with_audience() {
        let token = test_token(&json!({ "s": "abc", "aud": "ezviz", "iss": "vendor" }));
        let session = AuthSession::new(token, String::new(), String::new());

        assert_eq!(session.sign().unwrap(), "abc");
        assert!(session.expires_at().is_none());
    }

    #[test]
    fn test_non_jwt_token() {
        let session = AuthSession::new("opaque".into(), String::new(), String::new());
        assert!(session.sign().is_err());
        assert!(session.expires_at().is_none());
    }

    #[test]
    fn test_expiry_by_claim() {
        let now = Utc::now();
        let token = test_token(&json!({ "s": "x", "exp": now.timestamp() - 10 }));
        let session = AuthSession::new(token, String::new(), String::new());

        assert!(session.is_expired(now, Duration::hours(6)));
    }

    #[test]
    fn test_expiry_by_age() {
        let now = Utc::now();
        let session = AuthSession::new("opaque".into(), String::new(), String::new())
            .with_issued_at(now - Duration::hours(7));

        assert!(session.is_expired(now, Duration::hours(6)));
        assert!(!session.is_expired(now - Duration::hours(2), Duration::hours(6)));
    }
}
