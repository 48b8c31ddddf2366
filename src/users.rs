use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::errors::{KaminoError, KaminoResult};

/// Who is calling. Produced once per request by the session layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub username: String,
    pub is_admin: bool,
}

impl Identity {
    pub fn new(username: impl Into<String>, is_admin: bool) -> Self {
        Self {
            username: username.into(),
            is_admin,
        }
    }

    pub fn admin(username: impl Into<String>) -> Self {
        Self::new(username, true)
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    #[serde(default)]
    pub admin: bool,
    pub exp: usize,
}

/// Signs and checks HS256 session tokens.
#[derive(Clone)]
pub struct TokenAuthority {
    encoding: EncodingKey,
    decoding: DecodingKey,
    ttl_secs: u64,
}

impl TokenAuthority {
    pub fn new(secret: &str, ttl_secs: u64) -> Self {
        Self {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            ttl_secs,
        }
    }

    pub fn issue(&self, identity: &Identity) -> KaminoResult<String> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_err(|e| KaminoError::Config(e.to_string()))?
            .as_secs();
        let claims = Claims {
            sub: identity.username.clone(),
            admin: identity.is_admin,
            exp: (now + self.ttl_secs) as usize,
        };
        encode(&Header::default(), &claims, &self.encoding)
            .map_err(|e| KaminoError::Config(format!("signing token: {}", e)))
    }

    pub fn verify(&self, token: &str) -> KaminoResult<Identity> {
        let data = decode::<Claims>(token, &self.decoding, &Validation::default())
            .map_err(|e| KaminoError::Authorization(format!("invalid session token: {}", e)))?;
        if data.claims.sub.trim().is_empty() {
            return Err(KaminoError::Authorization("token has no subject".to_string()));
        }
        Ok(Identity::new(data.claims.sub, data.claims.admin))
    }
}
