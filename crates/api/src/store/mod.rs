//! Credential store
//!
//! Durable records for accounts, pending email verifications and sessions.
//! The engine only talks to the [`CredentialStore`] trait; a Postgres
//! implementation backs production and an in-memory one backs local runs
//! and tests.
//!
//! Every operation that writes more than one row is a single trait method so
//! that callers can never observe (or cause) a half-applied write.

mod memory;
mod postgres;

pub use memory::MemoryCredentialStore;
pub use postgres::PgCredentialStore;

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

/// A persisted account. Holds the password hash, so it is never serialized.
#[derive(Clone, sqlx::FromRow)]
pub struct Account {
    pub id: Uuid,
    pub email: String,
    pub username: String,
    pub full_name: Option<String>,
    pub password_hash: String,
    pub verified: bool,
    pub created_at: OffsetDateTime,
}

impl Account {
    /// The client-safe view of this account
    pub fn projection(&self) -> AccountProjection {
        AccountProjection {
            id: self.id,
            email: self.email.clone(),
            username: self.username.clone(),
            full_name: self.full_name.clone(),
            verified: self.verified,
        }
    }
}

impl fmt::Debug for Account {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Account")
            .field("id", &self.id)
            .field("email", &self.email)
            .field("username", &self.username)
            .field("full_name", &self.full_name)
            .field("password_hash", &"<redacted>")
            .field("verified", &self.verified)
            .field("created_at", &self.created_at)
            .finish()
    }
}

/// Account fields that may leave the server: embedded in tokens and returned
/// by the API. There is deliberately no password field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountProjection {
    pub id: Uuid,
    pub email: String,
    pub username: String,
    pub full_name: Option<String>,
    pub verified: bool,
}

/// Row returned by the account listing
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct AccountSummary {
    pub id: Uuid,
    pub email: String,
    pub username: String,
    pub full_name: Option<String>,
    pub verified: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

impl From<&Account> for AccountSummary {
    fn from(account: &Account) -> Self {
        Self {
            id: account.id,
            email: account.email.clone(),
            username: account.username.clone(),
            full_name: account.full_name.clone(),
            verified: account.verified,
            created_at: account.created_at,
        }
    }
}

/// Input for account creation; the identifier and timestamp are assigned by the store
#[derive(Clone)]
pub struct NewAccount {
    pub email: String,
    pub username: String,
    pub full_name: Option<String>,
    pub password_hash: String,
}

#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct PendingVerification {
    pub account_id: Uuid,
    pub code: String,
    pub created_at: OffsetDateTime,
}

/// The single active token pair of an account
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct Session {
    pub account_id: Uuid,
    pub access_token: String,
    pub refresh_token: String,
    pub refresh_expires_at: OffsetDateTime,
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("unique constraint violated: {0}")]
    Conflict(String),
    #[error("write aborted before commit: {0}")]
    Aborted(String),
    #[error("database error: {0}")]
    Database(sqlx::Error),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        if let Some(db) = err.as_database_error() {
            if db.is_unique_violation() {
                let constraint = db.constraint().unwrap_or("unique").to_string();
                return StoreError::Conflict(constraint);
            }
        }
        StoreError::Database(err)
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Work that must succeed before a transactional write is committed.
///
/// Runs after the rows are written and before commit. An `Err` rolls the
/// write back. The hook must not call back into the store.
pub type BeforeCommit<'a> = BoxFuture<'a, Result<(), String>>;

/// Upper bound on a `BeforeCommit` hook. Verification emails retry with
/// per-request timeouts that fit well inside it.
pub const DEFAULT_COMMIT_HOOK_TIMEOUT: Duration = Duration::from_secs(45);

/// Await `hook` for at most `limit`. A failure or timeout becomes `Aborted`.
pub(crate) async fn run_before_commit(hook: BeforeCommit<'_>, limit: Duration) -> StoreResult<()> {
    match tokio::time::timeout(limit, hook).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(reason)) => Err(StoreError::Aborted(reason)),
        Err(_) => {
            tracing::warn!(limit_ms = limit.as_millis() as u64, "before-commit hook timed out");
            Err(StoreError::Aborted(format!(
                "before-commit hook timed out after {}ms",
                limit.as_millis()
            )))
        }
    }
}

#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn find_account_by_id(&self, id: Uuid) -> StoreResult<Option<Account>>;

    async fn find_account_by_email(&self, email: &str) -> StoreResult<Option<Account>>;

    async fn find_account_by_username(&self, username: &str) -> StoreResult<Option<Account>>;

    /// Sign-in lookup: matches either the email or the username, preferring
    /// an email match when both exist.
    async fn find_account_by_login(&self, email_or_username: &str)
        -> StoreResult<Option<Account>>;

    /// All accounts ordered by creation time
    async fn list_accounts(&self) -> StoreResult<Vec<AccountSummary>>;

    /// Insert an account together with its pending verification code.
    ///
    /// `before_commit` runs with a time limit and without blocking readers
    /// or unrelated writers.
    async fn create_account_with_verification(
        &self,
        account: NewAccount,
        code: &str,
        before_commit: BeforeCommit<'_>,
    ) -> StoreResult<Account>;

    async fn find_pending_verification(&self, code: &str)
        -> StoreResult<Option<PendingVerification>>;

    async fn find_pending_verification_for_account(
        &self,
        account_id: Uuid,
    ) -> StoreResult<Option<PendingVerification>>;

    /// Swap an unverified account's pending code for a new one.
    ///
    /// Returns `None` if the account does not exist or is already verified.
    async fn replace_verification_code(
        &self,
        account_id: Uuid,
        code: &str,
        before_commit: BeforeCommit<'_>,
    ) -> StoreResult<Option<PendingVerification>>;

    /// Delete the pending row for `code` and mark its account verified.
    ///
    /// Returns `None` if no pending row matched. Only one concurrent caller
    /// can consume a given code.
    async fn consume_verification(&self, code: &str) -> StoreResult<Option<Account>>;

    async fn find_session_by_account(&self, account_id: Uuid) -> StoreResult<Option<Session>>;

    async fn find_session_by_access_token(&self, token: &str) -> StoreResult<Option<Session>>;

    async fn find_session_by_refresh_token(&self, token: &str) -> StoreResult<Option<Session>>;

    /// Insert or replace the session keyed by account. Last writer wins.
    async fn upsert_session(&self, session: &Session) -> StoreResult<()>;

    /// Returns whether a row was deleted
    async fn delete_session(&self, account_id: Uuid) -> StoreResult<bool>;

    /// Remove pending verifications created before `created_before` along with
    /// their (still unverified) accounts. Returns the number of accounts removed.
    async fn purge_expired_verifications(&self, created_before: OffsetDateTime)
        -> StoreResult<u64>;

    /// Remove sessions whose refresh token expired at or before `now`
    async fn purge_expired_sessions(&self, now: OffsetDateTime) -> StoreResult<u64>;
}
