//! Verification email delivery
//!
//! Sends through the Resend HTTP API when an API key is configured, otherwise
//! logs the verification link so local setups still work end to end.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde_json::json;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::RetryIf;

const RESEND_API_URL: &str = "https://api.resend.com";

/// Retries after the first attempt for transient failures
const DEFAULT_MAX_RETRIES: usize = 3;

/// Per attempt. Four attempts plus backoff stay under the store's commit hook limit.
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(8);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerificationEmail {
    pub to: String,
    pub display_name: String,
    pub code: String,
    /// Full link the recipient follows to verify
    pub link: String,
}

#[derive(Debug, thiserror::Error)]
pub enum EmailError {
    #[error("email transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("email provider rejected the message ({status}): {body}")]
    Rejected { status: StatusCode, body: String },
}

impl EmailError {
    /// Network failures, rate limiting and 5xx responses are worth retrying
    fn is_transient(&self) -> bool {
        match self {
            EmailError::Transport(_) => true,
            EmailError::Rejected { status, .. } => {
                status.is_server_error() || *status == StatusCode::TOO_MANY_REQUESTS
            }
        }
    }
}

#[async_trait]
pub trait VerificationMailer: Send + Sync {
    async fn send_verification(&self, email: &VerificationEmail) -> Result<(), EmailError>;
}

/// Resend (https://resend.com) backed mailer
#[derive(Clone)]
pub struct ResendMailer {
    client: Client,
    api_key: String,
    from: String,
    base_url: String,
    max_retries: usize,
    request_timeout: Duration,
}

impl ResendMailer {
    pub fn new(client: Client, api_key: impl Into<String>, from: impl Into<String>) -> Self {
        Self {
            client,
            api_key: api_key.into(),
            from: from.into(),
            base_url: RESEND_API_URL.to_string(),
            max_retries: DEFAULT_MAX_RETRIES,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    /// Point the mailer at a different API origin
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn with_max_retries(mut self, max_retries: usize) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    async fn send_once(&self, payload: &serde_json::Value) -> Result<(), EmailError> {
        let response = self
            .client
            .post(format!("{}/emails", self.base_url))
            .bearer_auth(&self.api_key)
            .timeout(self.request_timeout)
            .json(payload)
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        let body = response.text().await.unwrap_or_default();
        tracing::warn!(status = %status, body = %body, "Resend rejected verification email");
        Err(EmailError::Rejected { status, body })
    }
}

#[async_trait]
impl VerificationMailer for ResendMailer {
    async fn send_verification(&self, email: &VerificationEmail) -> Result<(), EmailError> {
        let payload = json!({
            "from": self.from,
            "to": [email.to],
            "subject": "Verify your email address",
            "html": render_verification_html(email),
        });

        // 100ms, 200ms, 400ms ... capped at 2s
        let strategy = ExponentialBackoff::from_millis(2)
            .factor(50)
            .max_delay(Duration::from_secs(2))
            .map(jitter)
            .take(self.max_retries);

        RetryIf::spawn(
            strategy,
            || self.send_once(&payload),
            |e: &EmailError| e.is_transient(),
        )
        .await?;

        tracing::info!(to = %email.to, "Verification email sent");
        Ok(())
    }
}

/// Mailer used when no provider is configured
#[derive(Debug, Clone, Default)]
pub struct LogMailer;

#[async_trait]
impl VerificationMailer for LogMailer {
    async fn send_verification(&self, email: &VerificationEmail) -> Result<(), EmailError> {
        tracing::info!(
            to = %email.to,
            link = %email.link,
            "Email delivery not configured, logging verification link instead"
        );
        Ok(())
    }
}

fn render_verification_html(email: &VerificationEmail) -> String {
    format!(
        concat!(
            "<h1>Auth Sandbox</h1>",
            "<h2>Hi {name},</h2>",
            "<p>Please click the link below to verify your email address <em>{to}</em>.</p>",
            "<p><a href=\"{link}\">Verify Your Email</a></p>",
        ),
        name = escape_html(&email.display_name),
        to = escape_html(&email.to),
        link = escape_html(&email.link),
    )
}

fn escape_html(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}
