//! Shared fixtures for unit tests

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use reqwest::StatusCode;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::{
    auth::JwtManager,
    email::{EmailError, VerificationEmail, VerificationMailer},
    state::{AuthSettings, AuthState},
    store::{
        Account, AccountSummary, BeforeCommit, CredentialStore, MemoryCredentialStore,
        NewAccount, PendingVerification, Session, StoreError, StoreResult,
    },
    validation::{SignInRequest, SignUpRequest},
};

pub(crate) const TEST_SECRET: &str = "test-jwt-secret-key-for-testing-only";

/// Captures every verification email instead of sending it
#[derive(Default)]
pub(crate) struct RecordingMailer {
    sent: Mutex<Vec<VerificationEmail>>,
}

impl RecordingMailer {
    pub(crate) fn sent(&self) -> Vec<VerificationEmail> {
        self.sent.lock().unwrap().clone()
    }

    pub(crate) fn last_code(&self) -> Option<String> {
        self.sent.lock().unwrap().last().map(|e| e.code.clone())
    }
}

#[async_trait]
impl VerificationMailer for RecordingMailer {
    async fn send_verification(&self, email: &VerificationEmail) -> Result<(), EmailError> {
        self.sent.lock().unwrap().push(email.clone());
        Ok(())
    }
}

/// Provider outage
pub(crate) struct FailingMailer;

#[async_trait]
impl VerificationMailer for FailingMailer {
    async fn send_verification(&self, _email: &VerificationEmail) -> Result<(), EmailError> {
        Err(EmailError::Rejected {
            status: StatusCode::SERVICE_UNAVAILABLE,
            body: "provider unavailable".to_string(),
        })
    }
}

/// Provider that accepts the request and never answers
pub(crate) struct HangingMailer;

#[async_trait]
impl VerificationMailer for HangingMailer {
    async fn send_verification(&self, _email: &VerificationEmail) -> Result<(), EmailError> {
        std::future::pending().await
    }
}

pub(crate) fn settings() -> AuthSettings {
    AuthSettings {
        access_token_ttl_secs: 900,
        refresh_token_ttl_secs: 604_800,
        verification_code_ttl_secs: 86_400,
        verify_url_base: "http://localhost:3000/auth/verify-email".to_string(),
        secure_cookies: false,
    }
}

pub(crate) struct TestEnv {
    pub state: AuthState,
    pub store: Arc<MemoryCredentialStore>,
    pub mailer: Arc<RecordingMailer>,
}

pub(crate) fn test_env() -> TestEnv {
    test_env_with(settings())
}

pub(crate) fn test_env_with(settings: AuthSettings) -> TestEnv {
    test_env_with_store(settings, MemoryCredentialStore::new())
}

pub(crate) fn test_env_with_store(settings: AuthSettings, store: MemoryCredentialStore) -> TestEnv {
    let store = Arc::new(store);
    let mailer = Arc::new(RecordingMailer::default());
    let state = auth_state(store.clone(), mailer.clone(), settings);

    TestEnv {
        state,
        store,
        mailer,
    }
}

pub(crate) fn auth_state(
    store: Arc<dyn CredentialStore>,
    mailer: Arc<dyn VerificationMailer>,
    settings: AuthSettings,
) -> AuthState {
    AuthState {
        store,
        jwt_manager: JwtManager::new(TEST_SECRET, "primary"),
        mailer,
        settings,
    }
}

pub(crate) fn sign_up_request(email: &str, username: &str, password: &str) -> SignUpRequest {
    SignUpRequest {
        email: email.to_string(),
        username: username.to_string(),
        password: password.to_string(),
        full_name: None,
    }
}

pub(crate) fn sign_in_request(email_or_username: &str, password: &str) -> SignInRequest {
    SignInRequest {
        email_or_username: email_or_username.to_string(),
        password: password.to_string(),
    }
}

/// Memory store that reports verification code collisions on demand.
///
/// Each counter is the number of upcoming calls that collide.
#[derive(Default)]
pub(crate) struct CodeCollisionStore {
    inner: MemoryCredentialStore,
    /// `find_pending_verification` reports the code as already pending
    pub taken_lookups: AtomicUsize,
    /// `create_account_with_verification` hits the code unique constraint
    pub create_conflicts: AtomicUsize,
    /// `replace_verification_code` hits the code unique constraint
    pub replace_conflicts: AtomicUsize,
    looked_up: Mutex<Vec<String>>,
    written: Mutex<Vec<String>>,
}

impl CodeCollisionStore {
    /// Codes passed to `find_pending_verification`, in order
    pub(crate) fn looked_up(&self) -> Vec<String> {
        self.looked_up.lock().unwrap().clone()
    }

    /// Codes passed to the create and replace writes, in order
    pub(crate) fn written(&self) -> Vec<String> {
        self.written.lock().unwrap().clone()
    }
}

fn take_one(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

fn code_conflict() -> StoreError {
    StoreError::Conflict("pending_verifications_code_key".to_string())
}

#[async_trait]
impl CredentialStore for CodeCollisionStore {
    async fn find_account_by_id(&self, id: Uuid) -> StoreResult<Option<Account>> {
        self.inner.find_account_by_id(id).await
    }

    async fn find_account_by_email(&self, email: &str) -> StoreResult<Option<Account>> {
        self.inner.find_account_by_email(email).await
    }

    async fn find_account_by_username(&self, username: &str) -> StoreResult<Option<Account>> {
        self.inner.find_account_by_username(username).await
    }

    async fn find_account_by_login(
        &self,
        email_or_username: &str,
    ) -> StoreResult<Option<Account>> {
        self.inner.find_account_by_login(email_or_username).await
    }

    async fn list_accounts(&self) -> StoreResult<Vec<AccountSummary>> {
        self.inner.list_accounts().await
    }

    async fn create_account_with_verification(
        &self,
        account: NewAccount,
        code: &str,
        before_commit: BeforeCommit<'_>,
    ) -> StoreResult<Account> {
        self.written.lock().unwrap().push(code.to_string());
        if take_one(&self.create_conflicts) {
            return Err(code_conflict());
        }
        self.inner
            .create_account_with_verification(account, code, before_commit)
            .await
    }

    async fn find_pending_verification(
        &self,
        code: &str,
    ) -> StoreResult<Option<PendingVerification>> {
        self.looked_up.lock().unwrap().push(code.to_string());
        if take_one(&self.taken_lookups) {
            return Ok(Some(PendingVerification {
                account_id: Uuid::new_v4(),
                code: code.to_string(),
                created_at: OffsetDateTime::now_utc(),
            }));
        }
        self.inner.find_pending_verification(code).await
    }

    async fn find_pending_verification_for_account(
        &self,
        account_id: Uuid,
    ) -> StoreResult<Option<PendingVerification>> {
        self.inner
            .find_pending_verification_for_account(account_id)
            .await
    }

    async fn replace_verification_code(
        &self,
        account_id: Uuid,
        code: &str,
        before_commit: BeforeCommit<'_>,
    ) -> StoreResult<Option<PendingVerification>> {
        self.written.lock().unwrap().push(code.to_string());
        if take_one(&self.replace_conflicts) {
            return Err(code_conflict());
        }
        self.inner
            .replace_verification_code(account_id, code, before_commit)
            .await
    }

    async fn consume_verification(&self, code: &str) -> StoreResult<Option<Account>> {
        self.inner.consume_verification(code).await
    }

    async fn find_session_by_account(&self, account_id: Uuid) -> StoreResult<Option<Session>> {
        self.inner.find_session_by_account(account_id).await
    }

    async fn find_session_by_access_token(&self, token: &str) -> StoreResult<Option<Session>> {
        self.inner.find_session_by_access_token(token).await
    }

    async fn find_session_by_refresh_token(&self, token: &str) -> StoreResult<Option<Session>> {
        self.inner.find_session_by_refresh_token(token).await
    }

    async fn upsert_session(&self, session: &Session) -> StoreResult<()> {
        self.inner.upsert_session(session).await
    }

    async fn delete_session(&self, account_id: Uuid) -> StoreResult<bool> {
        self.inner.delete_session(account_id).await
    }

    async fn purge_expired_verifications(
        &self,
        created_before: OffsetDateTime,
    ) -> StoreResult<u64> {
        self.inner.purge_expired_verifications(created_before).await
    }

    async fn purge_expired_sessions(&self, now: OffsetDateTime) -> StoreResult<u64> {
        self.inner.purge_expired_sessions(now).await
    }
}
