//! Refresh protocol

use super::sessions::{issue_session, TokenPair};
use crate::{
    error::{ApiError, ApiResult},
    state::AuthState,
};

/// Exchange the account's current refresh token for a new token pair.
///
/// Only the refresh token stored in the account's session row is accepted; a
/// token replaced by a later sign-in or refresh is rejected as invalid. The
/// session is overwritten on success (last writer wins).
pub async fn refresh_session(state: &AuthState, refresh_token: Option<&str>) -> ApiResult<TokenPair> {
    let Some(refresh_token) = refresh_token.filter(|t| !t.is_empty()) else {
        return Err(ApiError::BadRequest("Refresh token not provided"));
    };

    let Some(session) = state
        .store
        .find_session_by_refresh_token(refresh_token)
        .await?
    else {
        tracing::debug!("refresh: no session holds this refresh token");
        return Err(ApiError::BadRequest("Invalid refresh token"));
    };

    let expired = state
        .jwt_manager
        .parse(&session.refresh_token)
        .map_or(true, |claims| claims.is_expired());
    if expired {
        tracing::info!(user_id = %session.account_id, "refresh: refresh token expired");
        return Err(ApiError::BadRequest("Refresh token expired"));
    }

    // Mint from the stored account so profile changes reach the new tokens
    let Some(account) = state.store.find_account_by_id(session.account_id).await? else {
        tracing::warn!(user_id = %session.account_id, "refresh: session without account");
        return Err(ApiError::BadRequest("Invalid refresh token"));
    };

    let pair = issue_session(state, &account).await?;
    tracing::debug!(user_id = %account.id, "Session refreshed");
    Ok(pair)
}
