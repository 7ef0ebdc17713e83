//! Session registry
//!
//! Each account has at most one session row holding its current access and
//! refresh token. Signing in (or refreshing) overwrites that row, so any
//! earlier refresh token stops working immediately and any earlier access
//! token fails the authorize stage's session lookup.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use super::{
    jwt::now_secs,
    middleware::{authorize, TokenSlot},
    password,
};
use crate::{
    error::{ApiError, ApiResult},
    state::AuthState,
    store::{Account, AccountProjection, Session},
    validation::SignInRequest,
};

/// Access and refresh token handed to a client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
}

/// Verify credentials and start a new session, replacing any existing one.
pub async fn sign_in(state: &AuthState, request: SignInRequest) -> ApiResult<TokenPair> {
    let credentials = request.validate().map_err(ApiError::Validation)?;

    let account = state
        .store
        .find_account_by_login(&credentials.email_or_username)
        .await?;

    // Unknown accounts still pay for a hash verification
    let stored_hash = account
        .as_ref()
        .map(|a| a.password_hash.clone())
        .unwrap_or_else(|| password::dummy_hash().to_string());
    let password_ok =
        password::verify_password_blocking(credentials.password, stored_hash).await?;

    let account = match account {
        Some(account) if password_ok => account,
        _ => {
            tracing::info!("sign_in: invalid credentials");
            return Err(ApiError::InvalidCredentials);
        }
    };

    let pair = issue_session(state, &account).await?;
    tracing::info!(user_id = %account.id, verified = account.verified, "Signed in");
    Ok(pair)
}

/// End the session named by `access_token`.
///
/// Absent, malformed and forged tokens are a successful no-op. An expired but
/// authentic token still signs its account out.
pub async fn sign_out(state: &AuthState, access_token: Option<&str>) -> ApiResult<()> {
    let Some(claims) = access_token.and_then(|t| state.jwt_manager.parse(t)) else {
        tracing::debug!("sign_out: no decodable access token, nothing to do");
        return Ok(());
    };

    let user_id = claims.user.id;
    if state.store.delete_session(user_id).await? {
        tracing::info!(user_id = %user_id, "Signed out");
    }
    Ok(())
}

/// The account behind an access token, after the authorize stage accepts it
pub async fn get_session(
    state: &AuthState,
    access_token: Option<&str>,
) -> ApiResult<AccountProjection> {
    let slot = TokenSlot::decode(access_token.map(str::to_string), &state.jwt_manager);
    authorize(state, &slot).await.map(|auth_user| auth_user.user)
}

/// Mint a token pair for `account` and make it the account's only session
pub(crate) async fn issue_session(state: &AuthState, account: &Account) -> ApiResult<TokenPair> {
    let projection = account.projection();
    let settings = &state.settings;

    let access_token = state
        .jwt_manager
        .issue(&projection, settings.access_token_ttl_secs)
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    let refresh_token = state
        .jwt_manager
        .issue(&projection, settings.refresh_token_ttl_secs)
        .map_err(|e| ApiError::Internal(e.to_string()))?;

    let refresh_expires_at = expires_at(settings.refresh_token_ttl_secs);

    state
        .store
        .upsert_session(&Session {
            account_id: account.id,
            access_token: access_token.clone(),
            refresh_token: refresh_token.clone(),
            refresh_expires_at,
        })
        .await?;

    Ok(TokenPair {
        access_token,
        refresh_token,
    })
}

/// 9999-12-31T23:59:59Z
const MAX_TIMESTAMP: i64 = 253_402_300_799;

fn expires_at(ttl_secs: u64) -> OffsetDateTime {
    let exp = now_secs()
        .saturating_add(i64::try_from(ttl_secs).unwrap_or(i64::MAX))
        .min(MAX_TIMESTAMP);
    OffsetDateTime::from_unix_timestamp(exp).unwrap_or(OffsetDateTime::now_utc())
}
