//! Manage json web tokens.

use std::time::Duration;

use chrono::Utc;
use jsonwebtoken::{
    Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode,
};
use serde::{Deserialize, Serialize};

use crate::error::{Result, ServerError};

const DEFAULT_AUDIENCE: &str = "lexica";
/// Lifetime of an access token.
pub const ACCESS_LIFETIME: Duration = Duration::from_secs(60 * 60 * 24 * 7);

/// What a token may be used for.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Purpose {
    /// Authenticates API calls; the subject is the user ID.
    #[default]
    Access,
    /// Confirms an email address; the subject is the email.
    VerifyEmail,
    /// Allows a password reset; the subject is the email.
    ResetPassword,
}

/// Pieces of information asserted on a JWT.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Claims {
    /// Recipients that the JWT is intended for.
    pub aud: String,
    /// Identifies the expiration time on or after which the JWT must not be
    /// accepted for processing.
    pub exp: u64,
    /// Identifies the time at which the JWT was issued.
    pub iat: u64,
    /// Identifies the organization that issued the JWT.
    pub iss: String,
    /// User ID or email, depending on the purpose.
    pub sub: String,
    pub purpose: Purpose,
}

/// Manage JWT tokens.
#[derive(Clone)]
pub struct TokenManager {
    algorithm: Algorithm,
    encoding: EncodingKey,
    decoding: DecodingKey,
    name: String,
    audience: String,
}

impl TokenManager {
    /// Create a new [`TokenManager`] signing with HMAC-SHA256.
    pub fn new(name: &str, secret: impl AsRef<[u8]>) -> Self {
        Self {
            algorithm: Algorithm::HS256,
            encoding: EncodingKey::from_secret(secret.as_ref()),
            decoding: DecodingKey::from_secret(secret.as_ref()),
            name: name.to_owned(),
            audience: DEFAULT_AUDIENCE.to_string(),
        }
    }

    /// Create a new [`jsonwebtoken`].
    pub fn create(
        &self,
        subject: &str,
        purpose: Purpose,
        lifetime: Duration,
    ) -> Result<String> {
        let time = Utc::now().timestamp().max(0) as u64;
        let claims = Claims {
            aud: self.audience.clone(),
            exp: time + lifetime.as_secs(),
            iat: time,
            iss: self.name.clone(),
            sub: subject.to_owned(),
            purpose,
        };

        self.sign(&claims)
    }

    fn sign(&self, claims: &Claims) -> Result<String> {
        Ok(encode(&Header::new(self.algorithm), claims, &self.encoding)?)
    }

    /// Create an access token for a user.
    pub fn access(&self, user_id: i64) -> Result<String> {
        self.create(&user_id.to_string(), Purpose::Access, ACCESS_LIFETIME)
    }

    /// Decode and check a token, including its purpose.
    pub fn decode(&self, token: &str, purpose: Purpose) -> Result<Claims> {
        let mut validation = Validation::new(self.algorithm);
        validation.set_audience(&[&self.audience]);
        validation.set_issuer(&[&self.name]);

        let claims = decode::<Claims>(token, &self.decoding, &validation)?.claims;

        if claims.purpose != purpose {
            return Err(ServerError::InvalidToken);
        }

        Ok(claims)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_access_round() {
        let manager = TokenManager::new("http://localhost:8888/", "secret");
        let token = manager.access(42).unwrap();

        let claims = manager.decode(&token, Purpose::Access).unwrap();
        assert_eq!(claims.sub, "42");
        assert_eq!(claims.exp - claims.iat, ACCESS_LIFETIME.as_secs());
    }

    #[test]
    fn test_purpose_mismatch() {
        let manager = TokenManager::new("http://localhost:8888/", "secret");
        let token = manager
            .create("a@b.c", Purpose::VerifyEmail, Duration::from_secs(60))
            .unwrap();

        assert!(matches!(
            manager.decode(&token, Purpose::ResetPassword),
            Err(ServerError::InvalidToken)
        ));
        assert!(manager.decode(&token, Purpose::VerifyEmail).is_ok());
    }

    #[test]
    fn test_rejections() {
        let manager = TokenManager::new("http://localhost:8888/", "secret");
        let other = TokenManager::new("http://localhost:8888/", "another");

        let token = manager.access(1).unwrap();
        assert!(other.decode(&token, Purpose::Access).is_err());

        let now = Utc::now().timestamp() as u64;
        let expired = manager
            .sign(&Claims {
                aud: DEFAULT_AUDIENCE.into(),
                exp: now - 3600,
                iat: now - 7200,
                iss: "http://localhost:8888/".into(),
                sub: "1".into(),
                purpose: Purpose::Access,
            })
            .unwrap();
        assert!(manager.decode(&expired, Purpose::Access).is_err());
    }
}
