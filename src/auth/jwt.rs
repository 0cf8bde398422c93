use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

use crate::{
    auth::PrincipalResolver,
    errors::{AppError, Result},
    models::{Principal, UserId},
};

#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String, // User ID
    pub username: String,
    pub exp: i64,
    pub iat: i64,
}

pub struct JwtService {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    access_token_duration: Duration,
}

impl JwtService {
    pub fn new(secret: &str, access_token_duration: Duration) -> Self {
        Self {
            encoding_key: EncodingKey::from_secret(secret.as_ref()),
            decoding_key: DecodingKey::from_secret(secret.as_ref()),
            access_token_duration,
        }
    }

    pub fn generate_access_token(
        &self,
        user_id: UserId,
        username: &str,
    ) -> Result<(String, DateTime<Utc>)> {
        let now = Utc::now();
        let expires_at = now + self.access_token_duration;
        let claims = Claims {
            sub: user_id.to_string(),
            username: username.to_string(),
            exp: expires_at.timestamp(),
            iat: now.timestamp(),
        };

        let token = encode(&Header::default(), &claims, &self.encoding_key)
            .map_err(|e| AppError::Auth(format!("Failed to generate access token: {}", e)))?;

        Ok((token, expires_at))
    }

    pub fn verify_token(&self, token: &str) -> Result<Claims> {
        let token_data = decode::<Claims>(token, &self.decoding_key, &Validation::default())
            .map_err(|_| AppError::Auth("Invalid or expired token".to_string()))?;

        Ok(token_data.claims)
    }
}

impl PrincipalResolver for JwtService {
    fn resolve(&self, token: &str) -> Result<Principal> {
        let claims = self.verify_token(token)?;
        let user_id = UserId::parse(&claims.sub)
            .map_err(|_| AppError::Auth("Invalid token claims".to_string()))?;

        Ok(Principal {
            user_id,
            username: claims.username,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_jwt_generation_and_resolution() {
        let jwt_service = JwtService::new("test-secret", Duration::minutes(30));
        let user_id = UserId::new();

        let (token, expires_at) = jwt_service.generate_access_token(user_id, "alice").unwrap();
        assert!(expires_at > Utc::now());

        let principal = jwt_service.resolve(&token).unwrap();
        assert_eq!(principal.user_id, user_id);
        assert_eq!(principal.username, "alice");
    }

    #[test]
    fn test_rejects_foreign_and_expired_tokens() {
        let issuer = JwtService::new("one-secret", Duration::minutes(30));
        let verifier = JwtService::new("other-secret", Duration::minutes(30));
        let (token, _) = issuer.generate_access_token(UserId::new(), "alice").unwrap();
        assert!(verifier.resolve(&token).is_err());

        // Past the default 60s leeway.
        let expired = JwtService::new("one-secret", Duration::minutes(-5));
        let (token, _) = expired.generate_access_token(UserId::new(), "alice").unwrap();
        assert!(issuer.resolve(&token).is_err());

        assert!(issuer.resolve("not-a-token").is_err());
    }
}
