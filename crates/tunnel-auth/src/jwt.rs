//! Session token issuance and validation for authenticated control connections.

use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Claims carried in the session token returned in `HandshakeResp`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JwtClaims {
    /// Subject: the authenticated client id.
    pub sub: String,
    pub iat: i64,
    pub exp: i64,
    pub iss: String,
}

impl JwtClaims {
    pub fn new(client_id: String, issuer: String, validity: Duration) -> Self {
        let now = Utc::now();
        Self {
            sub: client_id,
            iat: now.timestamp(),
            exp: (now + validity).timestamp(),
            iss: issuer,
        }
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        DateTime::from_timestamp(self.exp, 0).unwrap_or_else(Utc::now)
    }

    pub fn is_expired(&self) -> bool {
        Utc::now().timestamp() > self.exp
    }
}

#[derive(Debug, Error)]
pub enum JwtError {
    #[error("JWT encoding error: {0}")]
    EncodingError(#[from] jsonwebtoken::errors::Error),
    #[error("token expired")]
    TokenExpired,
}

/// Issues and validates HMAC-SHA256 session tokens with a shared server secret.
pub struct JwtValidator {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    validation: Validation,
    issuer: String,
}

impl JwtValidator {
    pub fn new(secret: &[u8], issuer: impl Into<String>) -> Self {
        let issuer = issuer.into();
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;
        validation.set_issuer(&[issuer.clone()]);

        Self {
            encoding_key: EncodingKey::from_secret(secret),
            decoding_key: DecodingKey::from_secret(secret),
            validation,
            issuer,
        }
    }

    pub fn issue(&self, client_id: &str, validity: Duration) -> Result<(String, DateTime<Utc>), JwtError> {
        let claims = JwtClaims::new(client_id.to_string(), self.issuer.clone(), validity);
        let expires_at = claims.expires_at();
        let header = Header::new(Algorithm::HS256);
        let token = encode(&header, &claims, &self.encoding_key)?;
        Ok((token, expires_at))
    }

    pub fn validate(&self, token: &str) -> Result<JwtClaims, JwtError> {
        let data = decode::<JwtClaims>(token, &self.decoding_key, &self.validation)?;
        if data.claims.is_expired() {
            return Err(JwtError::TokenExpired);
        }
        Ok(data.claims)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &[u8] = b"test_secret_key_1234567890";

    #[test]
    fn issues_and_validates_a_token() {
        let validator = JwtValidator::new(SECRET, "tunnel-fabric");
        let (token, expires_at) = validator.issue("client-1", Duration::hours(1)).unwrap();
        let claims = validator.validate(&token).unwrap();
        assert_eq!(claims.sub, "client-1");
        assert_eq!(claims.expires_at().timestamp(), expires_at.timestamp());
    }

    #[test]
    fn expired_token_is_rejected() {
        let validator = JwtValidator::new(SECRET, "tunnel-fabric");
        let (token, _) = validator.issue("client-2", Duration::seconds(-10)).unwrap();
        assert!(matches!(validator.validate(&token), Err(JwtError::TokenExpired)));
    }

    #[test]
    fn token_from_a_different_secret_is_rejected() {
        let issuer = JwtValidator::new(SECRET, "tunnel-fabric");
        let (token, _) = issuer.issue("client-3", Duration::hours(1)).unwrap();
        let other = JwtValidator::new(b"a different secret entirely", "tunnel-fabric");
        assert!(other.validate(&token).is_err());
    }
}
