//! Session token codec
//!
//! Tokens are HS256 JWTs carrying `{iat, exp, jti, user}` where `user` is an
//! [`AccountProjection`]. Because the codec only accepts that projection type,
//! a password hash can never end up inside a token.
//!
//! Parsing verifies the signature but NOT the expiry; callers check
//! [`SessionClaims::is_expired`] themselves so that an expired token can still
//! be attributed to an account (sign-out, refresh diagnostics).

use std::sync::Arc;

use jsonwebtoken::{decode, decode_header, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::store::AccountProjection;

#[derive(Debug, thiserror::Error)]
pub enum JwtError {
    #[error("failed to sign token: {0}")]
    Encoding(#[from] jsonwebtoken::errors::Error),
}

/// Decoded contents of a session token
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionClaims {
    /// Issued at (unix seconds)
    pub iat: i64,
    /// Expires at (unix seconds)
    pub exp: i64,
    /// Unique per token so two tokens minted in the same second differ
    pub jti: Uuid,
    pub user: AccountProjection,
}

impl SessionClaims {
    /// Expired once the current whole second reaches `exp`
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(now_secs())
    }

    pub fn is_expired_at(&self, now: i64) -> bool {
        self.exp <= now
    }
}

/// Current unix time, floored to whole seconds
pub fn now_secs() -> i64 {
    OffsetDateTime::now_utc().unix_timestamp()
}

struct SigningKey {
    kid: String,
    encoding: EncodingKey,
    decoding: DecodingKey,
}

impl SigningKey {
    fn new(secret: &str, kid: &str) -> Self {
        Self {
            kid: kid.to_string(),
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
        }
    }
}

/// Issues and parses session tokens.
///
/// Constructed once at startup and shared; cloning is cheap.
#[derive(Clone)]
pub struct JwtManager {
    active: Arc<SigningKey>,
    /// Key retired by the last rotation, still accepted for parsing
    previous: Option<Arc<SigningKey>>,
    validation: Validation,
}

impl JwtManager {
    pub fn new(secret: &str, key_id: &str) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = false;
        validation.required_spec_claims.clear();

        Self {
            active: Arc::new(SigningKey::new(secret, key_id)),
            previous: None,
            validation,
        }
    }

    /// A manager that issues with the new key and still parses tokens signed
    /// by the current one.
    pub fn rotated(&self, secret: &str, key_id: &str) -> Self {
        Self {
            active: Arc::new(SigningKey::new(secret, key_id)),
            previous: Some(self.active.clone()),
            validation: self.validation.clone(),
        }
    }

    pub fn key_id(&self) -> &str {
        &self.active.kid
    }

    /// Sign a token for `user` that expires `duration_secs` from now
    pub fn issue(&self, user: &AccountProjection, duration_secs: u64) -> Result<String, JwtError> {
        let iat = now_secs();
        let exp = iat.saturating_add(i64::try_from(duration_secs).unwrap_or(i64::MAX));

        let claims = SessionClaims {
            iat,
            exp,
            jti: Uuid::new_v4(),
            user: user.clone(),
        };

        let mut header = Header::new(Algorithm::HS256);
        header.kid = Some(self.active.kid.clone());

        Ok(encode(&header, &claims, &self.active.encoding)?)
    }

    /// Verify structure and signature. Absent, malformed, forged and
    /// unknown-key tokens all yield `None`.
    pub fn parse(&self, token: &str) -> Option<SessionClaims> {
        if token.is_empty() {
            return None;
        }

        let header = decode_header(token).ok()?;
        let key = match header.kid.as_deref() {
            None => &self.active,
            Some(kid) if kid == self.active.kid => &self.active,
            Some(kid) => self.previous.as_ref().filter(|k| k.kid == kid)?,
        };

        decode::<SessionClaims>(token, &key.decoding, &self.validation)
            .map(|data| data.claims)
            .ok()
    }
}
