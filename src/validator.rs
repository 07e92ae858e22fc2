use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::Deserialize;

use crate::{context::ClaimSet, error::TokenError};

/// Decodes and verifies a bearer credential into a claim set
pub trait TokenValidator: Send + Sync {
    fn validate(&self, token: &str) -> std::result::Result<ClaimSet, TokenError>;
}

/// Wire shape of the JWT payload. `exp` is checked by `jsonwebtoken` itself.
#[derive(Debug, Deserialize)]
struct JwtClaims {
    #[serde(default)]
    sub: String,
    #[serde(default)]
    roles: Vec<String>,
    #[serde(default)]
    permissions: Vec<String>,
}

/// HMAC-SHA256 shared-secret JWT validator
pub struct JwtValidator {
    key: DecodingKey,
    validation: Validation,
}

impl JwtValidator {
    pub fn new(secret: &str) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;

        Self {
            key: DecodingKey::from_secret(secret.as_bytes()),
            validation,
        }
    }
}

impl TokenValidator for JwtValidator {
    fn validate(&self, token: &str) -> std::result::Result<ClaimSet, TokenError> {
        // The auth stage logs the outcome
        let data = decode::<JwtClaims>(token, &self.key, &self.validation)?;

        let claims = data.claims;
        if claims.sub.is_empty() {
            return Err(TokenError::MissingSubject);
        }

        Ok(ClaimSet {
            subject: claims.sub,
            roles: claims.roles,
            permissions: claims.permissions,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};
    use serde_json::json;

    const SECRET: &str = "test_secret_key_32_chars_long!!";

    fn sign(payload: serde_json::Value, secret: &str) -> String {
        encode(
            &Header::default(),
            &payload,
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap()
    }

    fn in_one_hour() -> i64 {
        chrono::Utc::now().timestamp() + 3600
    }

    #[test]
    fn test_valid_token() {
        let token = sign(
            json!({
                "sub": "u1",
                "roles": ["admin"],
                "permissions": ["orders:read"],
                "exp": in_one_hour(),
            }),
            SECRET,
        );

        let claims = JwtValidator::new(SECRET).validate(&token).unwrap();
        assert_eq!(claims.subject, "u1");
        assert_eq!(claims.roles, vec!["admin".to_string()]);
        assert_eq!(claims.permissions, vec!["orders:read".to_string()]);
    }

    #[test]
    fn test_missing_lists_default_to_empty() {
        let token = sign(json!({ "sub": "u1", "exp": in_one_hour() }), SECRET);
        let claims = JwtValidator::new(SECRET).validate(&token).unwrap();
        assert!(claims.roles.is_empty());
        assert!(claims.permissions.is_empty());
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let token = sign(json!({ "sub": "u1", "exp": in_one_hour() }), "another_secret");
        assert!(matches!(
            JwtValidator::new(SECRET).validate(&token),
            Err(TokenError::Jwt(_))
        ));
    }

    #[test]
    fn test_expired_token_rejected() {
        let expired = chrono::Utc::now().timestamp() - 3600;
        let token = sign(json!({ "sub": "u1", "exp": expired }), SECRET);
        assert!(JwtValidator::new(SECRET).validate(&token).is_err());
    }

    #[test]
    fn test_missing_subject_rejected() {
        let token = sign(json!({ "exp": in_one_hour() }), SECRET);
        assert!(matches!(
            JwtValidator::new(SECRET).validate(&token),
            Err(TokenError::MissingSubject)
        ));
    }

    #[test]
    fn test_garbage_rejected() {
        assert!(JwtValidator::new(SECRET).validate("abc.def.ghi").is_err());
    }
}
