//! Configuration management

use std::env;

/// Minimum signing secret length in bytes (HS256 key)
const MIN_JWT_SECRET_LEN: usize = 32;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    Missing(&'static str),
    #[error("Invalid value for {name}: {reason}")]
    Invalid { name: &'static str, reason: String },
}

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    /// Server bind address
    pub bind_address: String,
    /// Postgres URL; `None` runs against the in-memory store
    pub database_url: Option<String>,
    /// HS256 signing secret for session tokens
    pub jwt_secret: String,
    /// `kid` stamped into issued tokens
    pub jwt_key_id: String,
    /// Access token lifetime in seconds
    pub access_token_ttl_secs: u64,
    /// Refresh token lifetime in seconds
    pub refresh_token_ttl_secs: u64,
    /// Pending verification lifetime in seconds (0 = never expires)
    pub verification_code_ttl_secs: u64,
    /// Origin of the web app, used for verification links
    pub public_base_url: String,
    /// Resend API key; emails are only logged when absent
    pub resend_api_key: Option<String>,
    /// Sender address for verification emails
    pub email_from: String,
    /// CORS allowlist
    pub allowed_origins: Vec<String>,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        let jwt_secret = env::var("JWT_SECRET").map_err(|_| ConfigError::Missing("JWT_SECRET"))?;
        if jwt_secret.len() < MIN_JWT_SECRET_LEN {
            return Err(ConfigError::Invalid {
                name: "JWT_SECRET",
                reason: format!("must be at least {MIN_JWT_SECRET_LEN} bytes"),
            });
        }

        Ok(Self {
            bind_address: env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0:8080".to_string()),
            database_url: non_empty("DATABASE_URL"),
            jwt_secret,
            jwt_key_id: env::var("JWT_KEY_ID").unwrap_or_else(|_| "primary".to_string()),
            access_token_ttl_secs: parse_secs("ACCESS_TOKEN_DURATION", 15 * 60)?,
            refresh_token_ttl_secs: parse_secs("REFRESH_TOKEN_DURATION", 7 * 24 * 3600)?,
            verification_code_ttl_secs: parse_secs("VERIFICATION_CODE_TTL", 24 * 3600)?,
            public_base_url: env::var("PUBLIC_BASE_URL")
                .unwrap_or_else(|_| "http://localhost:3000".to_string())
                .trim_end_matches('/')
                .to_string(),
            resend_api_key: non_empty("RESEND_API_KEY"),
            email_from: env::var("EMAIL_FROM")
                .unwrap_or_else(|_| "onboarding@resend.dev".to_string()),
            allowed_origins: env::var("ALLOWED_ORIGINS")
                .unwrap_or_else(|_| "http://localhost:3000,http://127.0.0.1:3000".to_string())
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
        })
    }
}

fn non_empty(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn parse_secs(name: &'static str, default: u64) -> Result<u64, ConfigError> {
    match env::var(name) {
        Ok(raw) => raw.trim().parse().map_err(|_| ConfigError::Invalid {
            name,
            reason: format!("expected whole seconds, got {raw:?}"),
        }),
        Err(_) => Ok(default),
    }
}
