//! Postgres credential store
//!
//! Schema lives in `crates/shared/migrations`. Multi-row writes run inside a
//! single transaction so readers see either both rows or neither.

use std::time::Duration;

use async_trait::async_trait;
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use super::{
    run_before_commit, Account, AccountSummary, BeforeCommit, CredentialStore, NewAccount,
    PendingVerification, Session, StoreResult, DEFAULT_COMMIT_HOOK_TIMEOUT,
};

const ACCOUNT_COLUMNS: &str =
    "id, email, username, full_name, password_hash, verified, created_at";

#[derive(Clone)]
pub struct PgCredentialStore {
    pool: PgPool,
    /// Bounds how long a hook can hold a transaction (and its connection) open
    commit_hook_timeout: Duration,
}

impl PgCredentialStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            commit_hook_timeout: DEFAULT_COMMIT_HOOK_TIMEOUT,
        }
    }

    pub fn with_commit_hook_timeout(mut self, timeout: Duration) -> Self {
        self.commit_hook_timeout = timeout;
        self
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl CredentialStore for PgCredentialStore {
    async fn find_account_by_id(&self, id: Uuid) -> StoreResult<Option<Account>> {
        let account = sqlx::query_as::<_, Account>(&format!(
            "SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(account)
    }

    async fn find_account_by_email(&self, email: &str) -> StoreResult<Option<Account>> {
        let account = sqlx::query_as::<_, Account>(&format!(
            "SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE email = $1"
        ))
        .bind(email)
        .fetch_optional(&self.pool)
        .await?;

        Ok(account)
    }

    async fn find_account_by_username(&self, username: &str) -> StoreResult<Option<Account>> {
        let account = sqlx::query_as::<_, Account>(&format!(
            "SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE username = $1"
        ))
        .bind(username)
        .fetch_optional(&self.pool)
        .await?;

        Ok(account)
    }

    async fn find_account_by_login(
        &self,
        email_or_username: &str,
    ) -> StoreResult<Option<Account>> {
        let account = sqlx::query_as::<_, Account>(&format!(
            r#"
            SELECT {ACCOUNT_COLUMNS}
            FROM accounts
            WHERE email = $1 OR username = $1
            ORDER BY (email = $1) DESC
            LIMIT 1
            "#
        ))
        .bind(email_or_username)
        .fetch_optional(&self.pool)
        .await?;

        Ok(account)
    }

    async fn list_accounts(&self) -> StoreResult<Vec<AccountSummary>> {
        let accounts = sqlx::query_as::<_, AccountSummary>(
            r#"
            SELECT id, email, username, full_name, verified, created_at
            FROM accounts
            ORDER BY created_at ASC, id ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(accounts)
    }

    async fn create_account_with_verification(
        &self,
        account: NewAccount,
        code: &str,
        before_commit: BeforeCommit<'_>,
    ) -> StoreResult<Account> {
        let mut tx = self.pool.begin().await?;

        let created = sqlx::query_as::<_, Account>(&format!(
            r#"
            INSERT INTO accounts (id, email, username, full_name, password_hash)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING {ACCOUNT_COLUMNS}
            "#
        ))
        .bind(Uuid::new_v4())
        .bind(&account.email)
        .bind(&account.username)
        .bind(&account.full_name)
        .bind(&account.password_hash)
        .fetch_one(&mut *tx)
        .await?;

        sqlx::query("INSERT INTO pending_verifications (account_id, code) VALUES ($1, $2)")
            .bind(created.id)
            .bind(code)
            .execute(&mut *tx)
            .await?;

        if let Err(e) = run_before_commit(before_commit, self.commit_hook_timeout).await {
            tx.rollback().await?;
            return Err(e);
        }

        tx.commit().await?;
        Ok(created)
    }

    async fn find_pending_verification(
        &self,
        code: &str,
    ) -> StoreResult<Option<PendingVerification>> {
        let pending = sqlx::query_as::<_, PendingVerification>(
            "SELECT account_id, code, created_at FROM pending_verifications WHERE code = $1",
        )
        .bind(code)
        .fetch_optional(&self.pool)
        .await?;

        Ok(pending)
    }

    async fn find_pending_verification_for_account(
        &self,
        account_id: Uuid,
    ) -> StoreResult<Option<PendingVerification>> {
        let pending = sqlx::query_as::<_, PendingVerification>(
            "SELECT account_id, code, created_at FROM pending_verifications WHERE account_id = $1",
        )
        .bind(account_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(pending)
    }

    async fn replace_verification_code(
        &self,
        account_id: Uuid,
        code: &str,
        before_commit: BeforeCommit<'_>,
    ) -> StoreResult<Option<PendingVerification>> {
        let mut tx = self.pool.begin().await?;

        // Row lock keeps a concurrent verification from flipping the flag underneath us
        let unverified: Option<(bool,)> =
            sqlx::query_as("SELECT verified FROM accounts WHERE id = $1 FOR UPDATE")
                .bind(account_id)
                .fetch_optional(&mut *tx)
                .await?;

        if !matches!(unverified, Some((false,))) {
            tx.rollback().await?;
            return Ok(None);
        }

        let pending = sqlx::query_as::<_, PendingVerification>(
            r#"
            INSERT INTO pending_verifications (account_id, code)
            VALUES ($1, $2)
            ON CONFLICT (account_id)
            DO UPDATE SET code = EXCLUDED.code, created_at = NOW()
            RETURNING account_id, code, created_at
            "#,
        )
        .bind(account_id)
        .bind(code)
        .fetch_one(&mut *tx)
        .await?;

        if let Err(e) = run_before_commit(before_commit, self.commit_hook_timeout).await {
            tx.rollback().await?;
            return Err(e);
        }

        tx.commit().await?;
        Ok(Some(pending))
    }

    async fn consume_verification(&self, code: &str) -> StoreResult<Option<Account>> {
        let mut tx = self.pool.begin().await?;

        // DELETE first: a concurrent consumer blocks on the row and then sees nothing
        let account_id: Option<Uuid> = sqlx::query_scalar(
            "DELETE FROM pending_verifications WHERE code = $1 RETURNING account_id",
        )
        .bind(code)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(account_id) = account_id else {
            tx.rollback().await?;
            return Ok(None);
        };

        let account = sqlx::query_as::<_, Account>(&format!(
            "UPDATE accounts SET verified = TRUE WHERE id = $1 RETURNING {ACCOUNT_COLUMNS}"
        ))
        .bind(account_id)
        .fetch_optional(&mut *tx)
        .await?;

        if account.is_none() {
            tx.rollback().await?;
            return Ok(None);
        }

        tx.commit().await?;
        Ok(account)
    }

    async fn find_session_by_account(&self, account_id: Uuid) -> StoreResult<Option<Session>> {
        let session = sqlx::query_as::<_, Session>(
            r#"
            SELECT account_id, access_token, refresh_token, refresh_expires_at
            FROM sessions
            WHERE account_id = $1
            "#,
        )
        .bind(account_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(session)
    }

    async fn find_session_by_access_token(&self, token: &str) -> StoreResult<Option<Session>> {
        let session = sqlx::query_as::<_, Session>(
            r#"
            SELECT account_id, access_token, refresh_token, refresh_expires_at
            FROM sessions
            WHERE access_token = $1
            "#,
        )
        .bind(token)
        .fetch_optional(&self.pool)
        .await?;

        Ok(session)
    }

    async fn find_session_by_refresh_token(&self, token: &str) -> StoreResult<Option<Session>> {
        let session = sqlx::query_as::<_, Session>(
            r#"
            SELECT account_id, access_token, refresh_token, refresh_expires_at
            FROM sessions
            WHERE refresh_token = $1
            "#,
        )
        .bind(token)
        .fetch_optional(&self.pool)
        .await?;

        Ok(session)
    }

    async fn upsert_session(&self, session: &Session) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO sessions (account_id, access_token, refresh_token, refresh_expires_at, updated_at)
            VALUES ($1, $2, $3, $4, NOW())
            ON CONFLICT (account_id)
            DO UPDATE SET
                access_token = EXCLUDED.access_token,
                refresh_token = EXCLUDED.refresh_token,
                refresh_expires_at = EXCLUDED.refresh_expires_at,
                updated_at = NOW()
            "#,
        )
        .bind(session.account_id)
        .bind(&session.access_token)
        .bind(&session.refresh_token)
        .bind(session.refresh_expires_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn delete_session(&self, account_id: Uuid) -> StoreResult<bool> {
        let rows_affected = sqlx::query("DELETE FROM sessions WHERE account_id = $1")
            .bind(account_id)
            .execute(&self.pool)
            .await?
            .rows_affected();

        Ok(rows_affected > 0)
    }

    async fn purge_expired_verifications(
        &self,
        created_before: OffsetDateTime,
    ) -> StoreResult<u64> {
        // Deleting the account cascades to its pending row and any session
        let rows_affected = sqlx::query(
            r#"
            DELETE FROM accounts
            WHERE verified = FALSE
              AND id IN (
                SELECT account_id FROM pending_verifications WHERE created_at < $1
              )
            "#,
        )
        .bind(created_before)
        .execute(&self.pool)
        .await?
        .rows_affected();

        Ok(rows_affected)
    }

    async fn purge_expired_sessions(&self, now: OffsetDateTime) -> StoreResult<u64> {
        let rows_affected = sqlx::query("DELETE FROM sessions WHERE refresh_expires_at <= $1")
            .bind(now)
            .execute(&self.pool)
            .await?
            .rows_affected();

        Ok(rows_affected)
    }
}
