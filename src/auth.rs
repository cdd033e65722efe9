use std::time::Duration;

use bcrypt::{hash, verify};
use chrono::Utc;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};

use crate::config::AuthConfig;
use crate::error::{AppError, AppResult};
use crate::models::{AuthPayload, TokenAudience, User};

/// Signed token plus its lifetime in seconds.
#[derive(Debug, Clone)]
pub struct IssuedToken {
    pub token: String,
    pub expires_in: u64,
}

/// Password hashing and HS256 token minting. Built once from config and
/// shared through the app state.
#[derive(Clone)]
pub struct Authenticator {
    encoding: EncodingKey,
    decoding: DecodingKey,
    session_ttl: Duration,
    custom_token_ttl: Duration,
    bcrypt_cost: u32,
}

impl Authenticator {
    pub fn new(config: &AuthConfig) -> Self {
        Self {
            encoding: EncodingKey::from_secret(config.jwt_secret.as_bytes()),
            decoding: DecodingKey::from_secret(config.jwt_secret.as_bytes()),
            session_ttl: config.session_ttl,
            custom_token_ttl: config.custom_token_ttl,
            bcrypt_cost: config.bcrypt_cost,
        }
    }

    pub fn hash_password(&self, password: &str) -> AppResult<String> {
        Ok(hash(password, self.bcrypt_cost)?)
    }

    pub fn verify_password(&self, password: &str, hash: &str) -> bool {
        verify(password, hash).unwrap_or(false)
    }

    pub fn issue(&self, user: &User, audience: TokenAudience) -> AppResult<IssuedToken> {
        let ttl = match audience {
            TokenAudience::Session => self.session_ttl,
            TokenAudience::Store => self.custom_token_ttl,
        };
        let iat = Utc::now().timestamp().max(0) as usize;
        let claims = AuthPayload {
            sub: user.email.clone(),
            role: user.role,
            community_id: user.community_id.clone(),
            aud: audience.as_str().to_string(),
            iat,
            exp: iat + ttl.as_secs() as usize,
        };
        let token = encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)?;
        Ok(IssuedToken {
            token,
            expires_in: ttl.as_secs(),
        })
    }

    pub fn validate(&self, token: &str, audience: TokenAudience) -> AppResult<AuthPayload> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_audience(&[audience.as_str()]);
        decode::<AuthPayload>(token, &self.decoding, &validation)
            .map(|data| data.claims)
            .map_err(|e| AppError::Unauthorized(format!("Invalid token: {e}")))
    }
}

/// Pull the token out of an `Authorization: Bearer ...` header value.
pub fn bearer_token(header: &str) -> Option<&str> {
    header
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::models::Role;

    fn authenticator() -> Authenticator {
        let mut config = AppConfig::default().auth;
        config.bcrypt_cost = 4;
        Authenticator::new(&config)
    }

    fn user() -> User {
        let now = Utc::now();
        User {
            email: "ana@example.com".into(),
            name: None,
            role: Role::Resident,
            community_id: Some("c1".into()),
            profile_completed: false,
            flat_number: None,
            phone: None,
            deleted: false,
            deleted_at: None,
            deleted_by: None,
            access_code_used: None,
            password_hash: String::new(),
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn password_round_trip() {
        let auth = authenticator();
        let hashed = auth.hash_password("hunter22").unwrap();
        assert!(auth.verify_password("hunter22", &hashed));
        assert!(!auth.verify_password("hunter23", &hashed));
    }

    #[test]
    fn tokens_are_bound_to_their_audience() {
        let auth = authenticator();
        let store = auth.issue(&user(), TokenAudience::Store).unwrap();
        let claims = auth.validate(&store.token, TokenAudience::Store).unwrap();
        assert_eq!(claims.sub, "ana@example.com");
        assert_eq!(claims.community_id.as_deref(), Some("c1"));

        let err = auth.validate(&store.token, TokenAudience::Session).unwrap_err();
        assert!(matches!(err, AppError::Unauthorized(_)));
    }

    #[test]
    fn parses_bearer_header() {
        assert_eq!(bearer_token("Bearer abc"), Some("abc"));
        assert_eq!(bearer_token("Basic abc"), None);
        assert_eq!(bearer_token("Bearer "), None);
    }
}
