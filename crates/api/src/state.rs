//! Application state

use reqwest::Client;
use std::sync::Arc;

use crate::{
    auth::JwtManager,
    config::Config,
    email::{LogMailer, ResendMailer, VerificationMailer},
    store::CredentialStore,
};

/// Durations and link settings the auth engine needs at request time
#[derive(Debug, Clone)]
pub struct AuthSettings {
    pub access_token_ttl_secs: u64,
    pub refresh_token_ttl_secs: u64,
    /// 0 disables verification code expiry
    pub verification_code_ttl_secs: u64,
    /// Verification links are `<verify_url_base>/<code>`
    pub verify_url_base: String,
    /// Mark session cookies `Secure`; on when the app is served over https
    pub secure_cookies: bool,
}

impl AuthSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            access_token_ttl_secs: config.access_token_ttl_secs,
            refresh_token_ttl_secs: config.refresh_token_ttl_secs,
            verification_code_ttl_secs: config.verification_code_ttl_secs,
            verify_url_base: format!("{}/auth/verify-email", config.public_base_url),
            secure_cookies: config.public_base_url.starts_with("https://"),
        }
    }
}

/// Everything the auth engine and its middleware depend on
#[derive(Clone)]
pub struct AuthState {
    pub store: Arc<dyn CredentialStore>,
    pub jwt_manager: JwtManager,
    pub mailer: Arc<dyn VerificationMailer>,
    pub settings: AuthSettings,
}

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub auth: AuthState,
}

impl AppState {
    pub fn new(config: Config, store: Arc<dyn CredentialStore>) -> Self {
        let jwt_manager = JwtManager::new(&config.jwt_secret, &config.jwt_key_id);
        tracing::info!(kid = %jwt_manager.key_id(), "Session token signing key loaded");

        let mailer: Arc<dyn VerificationMailer> = match &config.resend_api_key {
            Some(api_key) => {
                tracing::info!(from = %config.email_from, "Verification emails enabled via Resend");
                Arc::new(ResendMailer::new(
                    Client::new(),
                    api_key.clone(),
                    config.email_from.clone(),
                ))
            }
            None => {
                tracing::warn!(
                    "Verification emails not configured (missing RESEND_API_KEY), links will be logged"
                );
                Arc::new(LogMailer)
            }
        };

        let auth = AuthState {
            store,
            jwt_manager,
            mailer,
            settings: AuthSettings::from_config(&config),
        };

        Self { config, auth }
    }

    /// Get auth state for handlers and middleware
    pub fn auth_state(&self) -> AuthState {
        self.auth.clone()
    }
}
