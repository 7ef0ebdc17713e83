//! Email verification workflow
//!
//! An account starts `Pending` (unverified, exactly one pending code) and
//! becomes `Verified` once its code is consumed. The account and its code are
//! written in one store transaction, and the verification email is sent from
//! inside that transaction: if delivery fails nothing is persisted.

use futures::FutureExt;
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use super::password;
use crate::{
    email::{EmailError, VerificationEmail},
    error::{ApiError, ApiResult},
    state::AuthState,
    store::{Account, AccountProjection, NewAccount, PendingVerification, StoreError},
    validation::SignUpRequest,
};

/// Constraint reported when a freshly generated code collides at insert time
const CODE_UNIQUE_CONSTRAINT: &str = "pending_verifications_code_key";

/// Register a new, unverified account and email it a verification link.
pub async fn sign_up(state: &AuthState, request: SignUpRequest) -> ApiResult<AccountProjection> {
    let candidate = request.validate().map_err(ApiError::Validation)?;

    if state
        .store
        .find_account_by_email(&candidate.email)
        .await?
        .is_some()
    {
        tracing::debug!(email = %candidate.email, "sign_up: email already registered");
        return Err(ApiError::DuplicateAccount);
    }
    if state
        .store
        .find_account_by_username(&candidate.username)
        .await?
        .is_some()
    {
        tracing::debug!(username = %candidate.username, "sign_up: username already registered");
        return Err(ApiError::DuplicateAccount);
    }

    let password_hash = password::hash_password_blocking(candidate.password).await?;
    let display_name = candidate
        .full_name
        .clone()
        .unwrap_or_else(|| candidate.username.clone());

    loop {
        let code = unique_code(state).await?;
        let email = verification_email(state, &candidate.email, &display_name, &code);
        let new_account = NewAccount {
            email: candidate.email.clone(),
            username: candidate.username.clone(),
            full_name: candidate.full_name.clone(),
            password_hash: password_hash.clone(),
        };

        let mut delivery_error = None;
        let send = async {
            state
                .mailer
                .send_verification(&email)
                .await
                .map_err(|e| record_delivery_error(&mut delivery_error, e))
        }
        .boxed();

        let created = state
            .store
            .create_account_with_verification(new_account, &code, send)
            .await;

        match created {
            Ok(account) => {
                tracing::info!(
                    user_id = %account.id,
                    username = %account.username,
                    "Account created, verification pending"
                );
                return Ok(account.projection());
            }
            // Another sign-up claimed the same code between the check and the insert
            Err(StoreError::Conflict(constraint)) if constraint == CODE_UNIQUE_CONSTRAINT => {
                tracing::warn!("sign_up: verification code collision, regenerating");
                continue;
            }
            Err(StoreError::Conflict(_)) => return Err(ApiError::DuplicateAccount),
            Err(StoreError::Aborted(reason)) => {
                return Err(aborted_to_api_error(delivery_error, reason))
            }
            Err(e) => return Err(e.into()),
        }
    }
}

/// Consume a verification code and mark its account verified.
///
/// Unknown, already consumed and expired codes all fail with `InvalidCode`.
pub async fn complete_verification(state: &AuthState, code: &str) -> ApiResult<AccountProjection> {
    let Some(pending) = state.store.find_pending_verification(code).await? else {
        return Err(ApiError::InvalidCode);
    };

    if is_code_expired(&pending, state.settings.verification_code_ttl_secs, OffsetDateTime::now_utc()) {
        tracing::info!(user_id = %pending.account_id, "Verification code expired");
        return Err(ApiError::InvalidCode);
    }

    // A concurrent request may have consumed the code since the lookup
    let account: Account = state
        .store
        .consume_verification(code)
        .await?
        .ok_or(ApiError::InvalidCode)?;

    tracing::info!(user_id = %account.id, "Email verified");
    Ok(account.projection())
}

/// Replace the pending code of an unverified account and send a fresh email.
///
/// Succeeds silently for unknown and already verified addresses so the
/// endpoint cannot be used to probe which emails are registered.
pub async fn resend_verification(state: &AuthState, email: &str) -> ApiResult<()> {
    let Some(account) = state.store.find_account_by_email(email).await? else {
        tracing::debug!("resend_verification: no account for address");
        return Ok(());
    };
    if account.verified {
        tracing::debug!(user_id = %account.id, "resend_verification: already verified");
        return Ok(());
    }

    let display_name = account
        .full_name
        .clone()
        .unwrap_or_else(|| account.username.clone());

    loop {
        let code = unique_code(state).await?;
        let message = verification_email(state, &account.email, &display_name, &code);

        let mut delivery_error = None;
        let send = async {
            state
                .mailer
                .send_verification(&message)
                .await
                .map_err(|e| record_delivery_error(&mut delivery_error, e))
        }
        .boxed();

        let replaced = state
            .store
            .replace_verification_code(account.id, &code, send)
            .await;

        match replaced {
            Ok(Some(_)) => {
                tracing::info!(user_id = %account.id, "Verification code reissued");
                return Ok(());
            }
            // Verified (or removed) since the lookup
            Ok(None) => return Ok(()),
            Err(StoreError::Conflict(constraint)) if constraint == CODE_UNIQUE_CONSTRAINT => {
                tracing::warn!("resend_verification: verification code collision, regenerating");
                continue;
            }
            Err(StoreError::Aborted(reason)) => {
                return Err(aborted_to_api_error(delivery_error, reason))
            }
            Err(e) => return Err(e.into()),
        }
    }
}

/// A fresh code that no currently pending verification uses
async fn unique_code(state: &AuthState) -> ApiResult<String> {
    loop {
        let code = Uuid::new_v4().to_string();
        if state.store.find_pending_verification(&code).await?.is_none() {
            return Ok(code);
        }
        tracing::warn!("Generated verification code already pending, regenerating");
    }
}

fn verification_email(
    state: &AuthState,
    to: &str,
    display_name: &str,
    code: &str,
) -> VerificationEmail {
    VerificationEmail {
        to: to.to_string(),
        display_name: display_name.to_string(),
        code: code.to_string(),
        link: format!("{}/{}", state.settings.verify_url_base, code),
    }
}

fn record_delivery_error(slot: &mut Option<EmailError>, err: EmailError) -> String {
    let message = err.to_string();
    *slot = Some(err);
    message
}

fn aborted_to_api_error(delivery_error: Option<EmailError>, reason: String) -> ApiError {
    match delivery_error {
        Some(err) => ApiError::EmailDelivery(err),
        None => ApiError::Internal(reason),
    }
}

/// A TTL of zero means codes never expire
pub(crate) fn is_code_expired(
    pending: &PendingVerification,
    ttl_secs: u64,
    now: OffsetDateTime,
) -> bool {
    if ttl_secs == 0 {
        return false;
    }
    let ttl = Duration::seconds(i64::try_from(ttl_secs).unwrap_or(i64::MAX));
    pending.created_at.saturating_add(ttl) <= now
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pending(created_at: OffsetDateTime) -> PendingVerification {
        PendingVerification {
            account_id: Uuid::new_v4(),
            code: "c1".to_string(),
            created_at,
        }
    }

    #[test]
    fn test_code_expiry() {
        let now = OffsetDateTime::now_utc();

        assert!(!is_code_expired(&pending(now), 60, now));
        assert!(!is_code_expired(&pending(now - Duration::seconds(59)), 60, now));
        assert!(is_code_expired(&pending(now - Duration::seconds(60)), 60, now));
    }

    #[test]
    fn test_zero_ttl_never_expires() {
        let now = OffsetDateTime::now_utc();
        assert!(!is_code_expired(&pending(now - Duration::days(365)), 0, now));
    }

    #[test]
    fn test_aborted_without_delivery_error_is_internal() {
        assert!(matches!(
            aborted_to_api_error(None, "boom".to_string()),
            ApiError::Internal(_)
        ));
    }
}
