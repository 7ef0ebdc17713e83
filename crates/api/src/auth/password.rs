//! Password hashing with Argon2id

use std::sync::OnceLock;

use argon2::{
    password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Algorithm, Argon2, Params, Version,
};

use crate::error::{ApiError, ApiResult};

#[derive(Debug, thiserror::Error)]
pub enum PasswordError {
    #[error("failed to hash password: {0}")]
    Hash(argon2::password_hash::Error),
}

fn hasher() -> Argon2<'static> {
    // Minimum cost keeps the test suite fast; production uses the OWASP defaults
    #[cfg(test)]
    let params = Params::new(1024, 1, 1, None).unwrap_or_default();
    #[cfg(not(test))]
    let params = Params::default();

    Argon2::new(Algorithm::Argon2id, Version::V0x13, params)
}

/// Hash a password into a PHC string
pub fn hash_password(password: &str) -> Result<String, PasswordError> {
    let salt_bytes: [u8; 16] = rand::random();
    let salt = SaltString::encode_b64(&salt_bytes).map_err(PasswordError::Hash)?;

    hasher()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(PasswordError::Hash)
}

/// Check a password against a stored PHC string. Malformed hashes never match.
pub fn verify_password(password: &str, hash: &str) -> bool {
    let Ok(parsed) = PasswordHash::new(hash) else {
        return false;
    };
    hasher()
        .verify_password(password.as_bytes(), &parsed)
        .is_ok()
}

/// A real hash of a random password, verified against when the account does
/// not exist so unknown logins cost the same as wrong passwords.
pub fn dummy_hash() -> &'static str {
    static DUMMY: OnceLock<String> = OnceLock::new();
    DUMMY.get_or_init(|| {
        let random: [u8; 24] = rand::random();
        let password: String = random.iter().map(|b| format!("{b:02x}")).collect();
        hash_password(&password).unwrap_or_default()
    })
}

/// [`hash_password`] on the blocking pool
pub async fn hash_password_blocking(password: String) -> ApiResult<String> {
    tokio::task::spawn_blocking(move || hash_password(&password))
        .await
        .map_err(|e| ApiError::Internal(format!("password hashing task failed: {e}")))?
        .map_err(|e| ApiError::Internal(e.to_string()))
}

/// [`verify_password`] on the blocking pool
pub async fn verify_password_blocking(password: String, hash: String) -> ApiResult<bool> {
    tokio::task::spawn_blocking(move || verify_password(&password, &hash))
        .await
        .map_err(|e| ApiError::Internal(format!("password verification task failed: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_and_verify() {
        let hash = hash_password("pw123").unwrap();
        assert!(hash.starts_with("$argon2id$"));
        assert!(verify_password("pw123", &hash));
        assert!(!verify_password("pw124", &hash));
    }

    #[test]
    fn test_same_password_gets_distinct_salts() {
        let a = hash_password("pw123").unwrap();
        let b = hash_password("pw123").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_malformed_hash_never_matches() {
        assert!(!verify_password("pw123", ""));
        assert!(!verify_password("pw123", "plaintext"));
    }

    #[test]
    fn test_dummy_hash_is_stable_and_rejects_guesses() {
        let first = dummy_hash();
        assert!(first.starts_with("$argon2id$"));
        assert_eq!(first, dummy_hash());
        assert!(!verify_password("", first));
        assert!(!verify_password("pw123", first));
    }

    #[tokio::test]
    async fn test_blocking_wrappers() {
        let hash = hash_password_blocking("pw123".to_string()).await.unwrap();
        assert!(verify_password_blocking("pw123".to_string(), hash.clone())
            .await
            .unwrap());
        assert!(!verify_password_blocking("nope".to_string(), hash)
            .await
            .unwrap());
    }
}
