//! Account listing

use axum::{
    extract::{Extension, State},
    Json,
};

use crate::{auth::AuthUser, error::ApiResult, state::AppState, store::AccountSummary};

/// All accounts, oldest first. Password hashes never leave the store layer.
pub async fn list_users(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
) -> ApiResult<Json<Vec<AccountSummary>>> {
    let accounts = state.auth.store.list_accounts().await?;
    tracing::debug!(
        user_id = %auth_user.user.id,
        count = accounts.len(),
        "Listed accounts"
    );
    Ok(Json(accounts))
}
