//! In-memory credential store
//!
//! All tables sit behind one `RwLock`, held only for short synchronous
//! sections. Writers with a `before_commit` hook are serialized on a separate
//! mutex: they check constraints, run the hook with no table lock held, then
//! re-check and insert every row under one write lock. Readers never see a
//! half-applied write, and a slow hook only delays other hooked writers.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use time::OffsetDateTime;
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

use super::{
    run_before_commit, Account, AccountSummary, BeforeCommit, CredentialStore, NewAccount,
    PendingVerification, Session, StoreError, StoreResult, DEFAULT_COMMIT_HOOK_TIMEOUT,
};

#[derive(Default)]
struct Tables {
    accounts: HashMap<Uuid, Account>,
    /// Keyed by verification code
    pending: HashMap<String, PendingVerification>,
    /// Keyed by account id
    sessions: HashMap<Uuid, Session>,
}

impl Tables {
    fn pending_for_account(&self, account_id: Uuid) -> Option<&PendingVerification> {
        self.pending.values().find(|p| p.account_id == account_id)
    }

    fn is_unverified(&self, account_id: Uuid) -> bool {
        self.accounts
            .get(&account_id)
            .is_some_and(|account| !account.verified)
    }

    fn check_code_free(&self, code: &str) -> StoreResult<()> {
        if self.pending.contains_key(code) {
            return Err(StoreError::Conflict("pending_verifications_code_key".to_string()));
        }
        Ok(())
    }

    fn check_new_account(&self, account: &NewAccount, code: &str) -> StoreResult<()> {
        if self.accounts.values().any(|a| a.email == account.email) {
            return Err(StoreError::Conflict("accounts_email_key".to_string()));
        }
        if self.accounts.values().any(|a| a.username == account.username) {
            return Err(StoreError::Conflict("accounts_username_key".to_string()));
        }
        self.check_code_free(code)
    }
}

pub struct MemoryCredentialStore {
    tables: RwLock<Tables>,
    /// Serializes writers that run a `before_commit` hook
    hooked_writes: Mutex<()>,
    commit_hook_timeout: Duration,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self {
            tables: RwLock::new(Tables::default()),
            hooked_writes: Mutex::new(()),
            commit_hook_timeout: DEFAULT_COMMIT_HOOK_TIMEOUT,
        }
    }

    pub fn with_commit_hook_timeout(mut self, timeout: Duration) -> Self {
        self.commit_hook_timeout = timeout;
        self
    }
}

impl Default for MemoryCredentialStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CredentialStore for MemoryCredentialStore {
    async fn find_account_by_id(&self, id: Uuid) -> StoreResult<Option<Account>> {
        Ok(self.tables.read().await.accounts.get(&id).cloned())
    }

    async fn find_account_by_email(&self, email: &str) -> StoreResult<Option<Account>> {
        let tables = self.tables.read().await;
        Ok(tables.accounts.values().find(|a| a.email == email).cloned())
    }

    async fn find_account_by_username(&self, username: &str) -> StoreResult<Option<Account>> {
        let tables = self.tables.read().await;
        Ok(tables
            .accounts
            .values()
            .find(|a| a.username == username)
            .cloned())
    }

    async fn find_account_by_login(
        &self,
        email_or_username: &str,
    ) -> StoreResult<Option<Account>> {
        let tables = self.tables.read().await;
        let by_email = tables
            .accounts
            .values()
            .find(|a| a.email == email_or_username);
        let found = by_email.or_else(|| {
            tables
                .accounts
                .values()
                .find(|a| a.username == email_or_username)
        });
        Ok(found.cloned())
    }

    async fn list_accounts(&self) -> StoreResult<Vec<AccountSummary>> {
        let tables = self.tables.read().await;
        let mut accounts: Vec<AccountSummary> =
            tables.accounts.values().map(AccountSummary::from).collect();
        accounts.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(accounts)
    }

    async fn create_account_with_verification(
        &self,
        account: NewAccount,
        code: &str,
        before_commit: BeforeCommit<'_>,
    ) -> StoreResult<Account> {
        let _serial = self.hooked_writes.lock().await;

        self.tables.read().await.check_new_account(&account, code)?;

        run_before_commit(before_commit, self.commit_hook_timeout).await?;

        let mut tables = self.tables.write().await;
        tables.check_new_account(&account, code)?;

        let now = OffsetDateTime::now_utc();
        let created = Account {
            id: Uuid::new_v4(),
            email: account.email,
            username: account.username,
            full_name: account.full_name,
            password_hash: account.password_hash,
            verified: false,
            created_at: now,
        };

        tables.pending.insert(
            code.to_string(),
            PendingVerification {
                account_id: created.id,
                code: code.to_string(),
                created_at: now,
            },
        );
        tables.accounts.insert(created.id, created.clone());

        Ok(created)
    }

    async fn find_pending_verification(
        &self,
        code: &str,
    ) -> StoreResult<Option<PendingVerification>> {
        Ok(self.tables.read().await.pending.get(code).cloned())
    }

    async fn find_pending_verification_for_account(
        &self,
        account_id: Uuid,
    ) -> StoreResult<Option<PendingVerification>> {
        let tables = self.tables.read().await;
        Ok(tables.pending_for_account(account_id).cloned())
    }

    async fn replace_verification_code(
        &self,
        account_id: Uuid,
        code: &str,
        before_commit: BeforeCommit<'_>,
    ) -> StoreResult<Option<PendingVerification>> {
        let _serial = self.hooked_writes.lock().await;

        {
            let tables = self.tables.read().await;
            if !tables.is_unverified(account_id) {
                return Ok(None);
            }
            tables.check_code_free(code)?;
        }

        run_before_commit(before_commit, self.commit_hook_timeout).await?;

        let mut tables = self.tables.write().await;
        // Verified or purged while the hook ran
        if !tables.is_unverified(account_id) {
            return Ok(None);
        }
        tables.check_code_free(code)?;

        let previous = tables.pending_for_account(account_id).map(|p| p.code.clone());
        if let Some(previous) = previous {
            tables.pending.remove(&previous);
        }

        let pending = PendingVerification {
            account_id,
            code: code.to_string(),
            created_at: OffsetDateTime::now_utc(),
        };
        tables.pending.insert(code.to_string(), pending.clone());

        Ok(Some(pending))
    }

    async fn consume_verification(&self, code: &str) -> StoreResult<Option<Account>> {
        let mut tables = self.tables.write().await;

        let Some(account_id) = tables.pending.get(code).map(|p| p.account_id) else {
            return Ok(None);
        };
        let Some(account) = tables.accounts.get_mut(&account_id) else {
            return Ok(None);
        };

        account.verified = true;
        let verified = account.clone();
        tables.pending.remove(code);

        Ok(Some(verified))
    }

    async fn find_session_by_account(&self, account_id: Uuid) -> StoreResult<Option<Session>> {
        Ok(self.tables.read().await.sessions.get(&account_id).cloned())
    }

    async fn find_session_by_access_token(&self, token: &str) -> StoreResult<Option<Session>> {
        let tables = self.tables.read().await;
        Ok(tables
            .sessions
            .values()
            .find(|s| s.access_token == token)
            .cloned())
    }

    async fn find_session_by_refresh_token(&self, token: &str) -> StoreResult<Option<Session>> {
        let tables = self.tables.read().await;
        Ok(tables
            .sessions
            .values()
            .find(|s| s.refresh_token == token)
            .cloned())
    }

    async fn upsert_session(&self, session: &Session) -> StoreResult<()> {
        let mut tables = self.tables.write().await;
        tables.sessions.insert(session.account_id, session.clone());
        Ok(())
    }

    async fn delete_session(&self, account_id: Uuid) -> StoreResult<bool> {
        Ok(self
            .tables
            .write()
            .await
            .sessions
            .remove(&account_id)
            .is_some())
    }

    async fn purge_expired_verifications(
        &self,
        created_before: OffsetDateTime,
    ) -> StoreResult<u64> {
        let mut tables = self.tables.write().await;

        let expired: Vec<(String, Uuid)> = tables
            .pending
            .values()
            .filter(|p| p.created_at < created_before)
            .map(|p| (p.code.clone(), p.account_id))
            .collect();

        let mut removed = 0;
        for (code, account_id) in expired {
            tables.pending.remove(&code);
            if tables
                .accounts
                .get(&account_id)
                .is_some_and(|a| !a.verified)
            {
                tables.accounts.remove(&account_id);
                tables.sessions.remove(&account_id);
                removed += 1;
            }
        }

        Ok(removed)
    }

    async fn purge_expired_sessions(&self, now: OffsetDateTime) -> StoreResult<u64> {
        let mut tables = self.tables.write().await;
        let before = tables.sessions.len();
        tables.sessions.retain(|_, s| s.refresh_expires_at > now);
        Ok((before - tables.sessions.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;
    use std::sync::Arc;
    use time::Duration;
    use tokio::sync::oneshot;

    fn new_account(email: &str, username: &str) -> NewAccount {
        NewAccount {
            email: email.to_string(),
            username: username.to_string(),
            full_name: None,
            password_hash: "hash".to_string(),
        }
    }

    fn ok_hook() -> BeforeCommit<'static> {
        async { Ok(()) }.boxed()
    }

    #[tokio::test]
    async fn test_create_account_writes_account_and_code_together() {
        let store = MemoryCredentialStore::new();
        let account = store
            .create_account_with_verification(new_account("a@x.com", "a"), "code-1", ok_hook())
            .await
            .unwrap();

        assert!(!account.verified);
        let pending = store.find_pending_verification("code-1").await.unwrap().unwrap();
        assert_eq!(pending.account_id, account.id);
    }

    #[tokio::test]
    async fn test_failed_hook_leaves_no_rows() {
        let store = MemoryCredentialStore::new();
        let result = store
            .create_account_with_verification(
                new_account("a@x.com", "a"),
                "code-1",
                async { Err("smtp down".to_string()) }.boxed(),
            )
            .await;

        assert!(matches!(result, Err(StoreError::Aborted(_))));
        assert!(store.find_account_by_email("a@x.com").await.unwrap().is_none());
        assert!(store.find_pending_verification("code-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_duplicate_username_is_conflict() {
        let store = MemoryCredentialStore::new();
        store
            .create_account_with_verification(new_account("a@x.com", "a"), "c1", ok_hook())
            .await
            .unwrap();

        let result = store
            .create_account_with_verification(new_account("b@x.com", "a"), "c2", ok_hook())
            .await;
        assert!(matches!(result, Err(StoreError::Conflict(_))));
    }

    #[tokio::test]
    async fn test_consume_verification_only_once() {
        let store = MemoryCredentialStore::new();
        store
            .create_account_with_verification(new_account("a@x.com", "a"), "c1", ok_hook())
            .await
            .unwrap();

        let first = store.consume_verification("c1").await.unwrap();
        assert!(first.is_some_and(|a| a.verified));
        assert!(store.consume_verification("c1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_login_lookup_prefers_email_match() {
        let store = MemoryCredentialStore::new();
        let by_username = store
            .create_account_with_verification(new_account("z@x.com", "b@x.com"), "c1", ok_hook())
            .await
            .unwrap();
        let by_email = store
            .create_account_with_verification(new_account("b@x.com", "b"), "c2", ok_hook())
            .await
            .unwrap();

        let found = store.find_account_by_login("b@x.com").await.unwrap().unwrap();
        assert_eq!(found.id, by_email.id);
        let found = store.find_account_by_login("z@x.com").await.unwrap().unwrap();
        assert_eq!(found.id, by_username.id);
    }

    #[tokio::test]
    async fn test_upsert_session_replaces_previous_row() {
        let store = MemoryCredentialStore::new();
        let account_id = Uuid::new_v4();
        let expires = OffsetDateTime::now_utc() + Duration::hours(1);

        for n in 0..2 {
            store
                .upsert_session(&Session {
                    account_id,
                    access_token: format!("a{n}"),
                    refresh_token: format!("r{n}"),
                    refresh_expires_at: expires,
                })
                .await
                .unwrap();
        }

        assert!(store.find_session_by_refresh_token("r0").await.unwrap().is_none());
        let current = store.find_session_by_account(account_id).await.unwrap().unwrap();
        assert_eq!(current.refresh_token, "r1");
    }

    #[tokio::test]
    async fn test_purge_expired_verifications_removes_unverified_accounts() {
        let store = MemoryCredentialStore::new();
        let stale = store
            .create_account_with_verification(new_account("a@x.com", "a"), "c1", ok_hook())
            .await
            .unwrap();

        let removed = store
            .purge_expired_verifications(OffsetDateTime::now_utc() + Duration::seconds(1))
            .await
            .unwrap();

        assert_eq!(removed, 1);
        assert!(store.find_account_by_id(stale.id).await.unwrap().is_none());
        assert!(store.find_pending_verification("c1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_purge_expired_sessions() {
        let store = MemoryCredentialStore::new();
        let now = OffsetDateTime::now_utc();
        let live = Uuid::new_v4();
        let dead = Uuid::new_v4();

        for (account_id, expires) in [(live, now + Duration::hours(1)), (dead, now)] {
            store
                .upsert_session(&Session {
                    account_id,
                    access_token: account_id.to_string(),
                    refresh_token: account_id.to_string(),
                    refresh_expires_at: expires,
                })
                .await
                .unwrap();
        }

        assert_eq!(store.purge_expired_sessions(now).await.unwrap(), 1);
        assert!(store.find_session_by_account(live).await.unwrap().is_some());
        assert!(store.find_session_by_account(dead).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_hung_hook_times_out_and_leaves_no_rows() {
        let store = MemoryCredentialStore::new()
            .with_commit_hook_timeout(std::time::Duration::from_millis(50));

        let result = store
            .create_account_with_verification(
                new_account("a@x.com", "a"),
                "c1",
                std::future::pending::<Result<(), String>>().boxed(),
            )
            .await;

        assert!(matches!(result, Err(StoreError::Aborted(_))));
        assert!(store.find_account_by_email("a@x.com").await.unwrap().is_none());
        assert!(store.find_pending_verification("c1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_store_stays_available_while_hook_runs() {
        let store = Arc::new(MemoryCredentialStore::new());
        let (entered_tx, entered_rx) = oneshot::channel::<()>();
        let (release_tx, release_rx) = oneshot::channel::<()>();

        let writer = {
            let store = store.clone();
            tokio::spawn(async move {
                let hook = async move {
                    let _ = entered_tx.send(());
                    release_rx.await.map_err(|e| e.to_string())
                }
                .boxed();
                store
                    .create_account_with_verification(new_account("a@x.com", "a"), "c1", hook)
                    .await
            })
        };
        entered_rx.await.unwrap();

        let other = Uuid::new_v4();
        tokio::time::timeout(std::time::Duration::from_secs(2), async {
            store
                .upsert_session(&Session {
                    account_id: other,
                    access_token: "a".to_string(),
                    refresh_token: "r".to_string(),
                    refresh_expires_at: OffsetDateTime::now_utc() + Duration::hours(1),
                })
                .await
                .unwrap();
            assert!(store.find_session_by_access_token("a").await.unwrap().is_some());
            // Not visible until the hook succeeds
            assert!(store.find_account_by_email("a@x.com").await.unwrap().is_none());
        })
        .await
        .expect("store blocked while a before-commit hook was pending");

        release_tx.send(()).unwrap();
        let account = writer.await.unwrap().unwrap();
        assert!(store.find_account_by_id(account.id).await.unwrap().is_some());
        assert!(store.find_pending_verification("c1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_replace_code_after_verification_during_hook_is_noop() {
        let store = Arc::new(MemoryCredentialStore::new());
        let account = store
            .create_account_with_verification(new_account("a@x.com", "a"), "c1", ok_hook())
            .await
            .unwrap();

        let (entered_tx, entered_rx) = oneshot::channel::<()>();
        let (release_tx, release_rx) = oneshot::channel::<()>();
        let writer = {
            let store = store.clone();
            tokio::spawn(async move {
                let hook = async move {
                    let _ = entered_tx.send(());
                    release_rx.await.map_err(|e| e.to_string())
                }
                .boxed();
                store.replace_verification_code(account.id, "c2", hook).await
            })
        };
        entered_rx.await.unwrap();

        assert!(store.consume_verification("c1").await.unwrap().is_some());
        release_tx.send(()).unwrap();

        assert!(writer.await.unwrap().unwrap().is_none());
        assert!(store.find_pending_verification("c2").await.unwrap().is_none());
    }
}
