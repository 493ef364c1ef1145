//! JWT Authentication
//!
//! Validates the bearer token presented at connection time and extracts the
//! caller's identity from its claims.

use async_trait::async_trait;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::Deserialize;
use uuid::Uuid;

use crate::config::JwtSettings;
use crate::domain::{Authenticator, Identity};
use crate::shared::error::GatewayError;

/// JWT claims expected on gateway tokens.
#[derive(Debug, Deserialize)]
struct Claims {
    /// User id
    sub: String,
    /// Display name, echoed on authored events
    username: String,
    /// Expiration timestamp
    #[allow(dead_code)]
    exp: usize,
}

pub struct JwtAuthenticator {
    decoding_key: DecodingKey,
    validation: Validation,
}

impl JwtAuthenticator {
    pub fn new(settings: &JwtSettings) -> Self {
        Self {
            decoding_key: DecodingKey::from_secret(settings.secret.as_bytes()),
            validation: Validation::new(Algorithm::HS256),
        }
    }
}

#[async_trait]
impl Authenticator for JwtAuthenticator {
    async fn authenticate(&self, token: &str) -> Result<Identity, GatewayError> {
        let data = decode::<Claims>(token, &self.decoding_key, &self.validation).map_err(|err| {
            match err.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => {
                    GatewayError::Unauthorized("token expired".into())
                }
                _ => GatewayError::Unauthorized("invalid token".into()),
            }
        })?;

        let user_id = Uuid::parse_str(&data.claims.sub)
            .map_err(|_| GatewayError::Unauthorized("malformed subject claim".into()))?;

        Ok(Identity {
            user_id,
            username: data.claims.username,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use jsonwebtoken::{encode, EncodingKey, Header};
    use serde::Serialize;

    const SECRET: &str = "test-secret-key-of-sufficient-length";

    #[derive(Serialize)]
    struct TestClaims {
        sub: String,
        username: String,
        exp: usize,
    }

    fn authenticator() -> JwtAuthenticator {
        JwtAuthenticator::new(&JwtSettings { secret: SECRET.into() })
    }

    fn token(sub: &str, exp_offset_secs: i64) -> String {
        let claims = TestClaims {
            sub: sub.to_string(),
            username: "alice".to_string(),
            exp: (Utc::now().timestamp() + exp_offset_secs) as usize,
        };
        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(SECRET.as_bytes()),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn valid_token_yields_identity() {
        let user = Uuid::new_v4();
        let identity = authenticator()
            .authenticate(&token(&user.to_string(), 3600))
            .await
            .unwrap();
        assert_eq!(identity.user_id, user);
        assert_eq!(identity.username, "alice");
    }

    #[tokio::test]
    async fn expired_token_is_rejected() {
        let err = authenticator()
            .authenticate(&token(&Uuid::new_v4().to_string(), -3600))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "unauthorized");
    }

    #[tokio::test]
    async fn non_uuid_subject_is_rejected() {
        let err = authenticator()
            .authenticate(&token("not-a-uuid", 3600))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "unauthorized");
    }

    #[tokio::test]
    async fn garbage_token_is_rejected() {
        let err = authenticator().authenticate("garbage").await.unwrap_err();
        assert_eq!(err.code(), "unauthorized");
    }
}
