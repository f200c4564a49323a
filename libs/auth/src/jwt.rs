use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use omc_core::{Error, Result};
use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

/// Claims carried by the short-lived tokens handed to browser clients for
/// the WebSocket upgrade (and by API identities generally).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionClaims {
    pub sub: Uuid,
    pub org: Uuid,
    pub exp: i64,
    pub iat: i64,
}

impl SessionClaims {
    pub fn new(user_id: Uuid, org_id: Uuid, ttl: Duration) -> Self {
        let now = OffsetDateTime::now_utc();
        Self {
            sub: user_id,
            org: org_id,
            iat: now.unix_timestamp(),
            exp: (now + ttl).unix_timestamp(),
        }
    }
}

/// HS256 signer/verifier over the boot-time JWT secret.
#[derive(Clone)]
pub struct TokenSigner {
    encoding: EncodingKey,
    decoding: DecodingKey,
}

impl TokenSigner {
    pub fn hs256(secret: &str) -> Result<Self> {
        if secret.is_empty() {
            return Err(Error::internal("JWT secret missing"));
        }
        Ok(Self {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
        })
    }

    pub fn sign(&self, claims: &SessionClaims) -> Result<String> {
        encode(&Header::new(Algorithm::HS256), claims, &self.encoding)
            .map_err(|err| Error::internal("token signing failed").with_source(err))
    }

    pub fn verify(&self, token: &str) -> Result<SessionClaims> {
        let validation = Validation::new(Algorithm::HS256);
        decode::<SessionClaims>(token, &self.decoding, &validation)
            .map(|data| data.claims)
            .map_err(|err| Error::unauthenticated("invalid token").with_source(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hs256_roundtrip() {
        let signer = TokenSigner::hs256("top-secret").expect("signer");
        let claims = SessionClaims::new(Uuid::new_v4(), Uuid::new_v4(), Duration::minutes(5));
        let token = signer.sign(&claims).expect("token");
        let verified = signer.verify(&token).expect("verified");
        assert_eq!(verified.sub, claims.sub);
        assert_eq!(verified.org, claims.org);
    }

    #[test]
    fn wrong_secret_fails_verification() {
        let signer = TokenSigner::hs256("secret-a").expect("signer");
        let other = TokenSigner::hs256("secret-b").expect("signer");
        let claims = SessionClaims::new(Uuid::new_v4(), Uuid::new_v4(), Duration::minutes(5));
        let token = signer.sign(&claims).expect("token");
        assert!(other.verify(&token).is_err());
    }

    #[test]
    fn expired_token_is_rejected() {
        let signer = TokenSigner::hs256("top-secret").expect("signer");
        let claims = SessionClaims::new(Uuid::new_v4(), Uuid::new_v4(), Duration::minutes(-10));
        let token = signer.sign(&claims).expect("token");
        assert!(signer.verify(&token).is_err());
    }
}
