//! HTTP routes

mod auth;
mod users;

use axum::{
    middleware,
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};

use crate::{
    auth::{decode_tokens, require_auth},
    state::AppState,
};

/// Build the application router.
///
/// Every route goes through the decode stage; `/auth/session` and `/users`
/// additionally require an authorized session.
pub fn create_router(state: AppState) -> Router {
    let auth_state = state.auth_state();

    let protected = Router::new()
        .route("/auth/session", get(auth::session))
        .route("/users", get(users::list_users))
        .route_layer(middleware::from_fn_with_state(
            auth_state.clone(),
            require_auth,
        ));

    Router::new()
        .route("/health", get(health))
        .route("/auth/sign-up", post(auth::sign_up))
        .route("/auth/verify-email/{code}", get(auth::verify_email))
        .route(
            "/auth/resend-verification",
            post(auth::resend_verification),
        )
        .route("/auth/sign-in", post(auth::sign_in))
        .route("/auth/sign-out", post(auth::sign_out))
        .route("/auth/refresh", post(auth::refresh))
        .merge(protected)
        .layer(middleware::from_fn_with_state(auth_state, decode_tokens))
        .with_state(state)
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok", "version": env!("CARGO_PKG_VERSION") }))
}
