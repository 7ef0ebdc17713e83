//! Sign-up, verification and session routes
//!
//! Token pairs are returned in the body and also set as HttpOnly cookies, so
//! both header-based and browser clients work against the same endpoints.

use axum::{
    extract::{Extension, Path, State},
    http::{header::SET_COOKIE, StatusCode},
    response::{AppendHeaders, IntoResponse},
    Json,
};
use serde::Deserialize;
use serde_json::json;

use crate::{
    auth::{
        self,
        middleware::{ACCESS_TOKEN_COOKIE, REFRESH_TOKEN_COOKIE},
        AuthUser, RequestTokens, TokenPair,
    },
    error::ApiResult,
    state::{AppState, AuthSettings},
    store::AccountProjection,
    validation::{SignInRequest, SignUpRequest},
};

#[derive(Debug, Deserialize)]
pub struct ResendVerificationRequest {
    pub email: String,
}

pub async fn sign_up(
    State(state): State<AppState>,
    Json(request): Json<SignUpRequest>,
) -> ApiResult<impl IntoResponse> {
    auth::sign_up(&state.auth, request).await?;

    Ok((
        StatusCode::CREATED,
        Json(json!({ "message": "Account created, check your email to verify it" })),
    ))
}

pub async fn verify_email(
    State(state): State<AppState>,
    Path(code): Path<String>,
) -> ApiResult<Json<AccountProjection>> {
    let account = auth::complete_verification(&state.auth, &code).await?;
    Ok(Json(account))
}

pub async fn resend_verification(
    State(state): State<AppState>,
    Json(request): Json<ResendVerificationRequest>,
) -> ApiResult<impl IntoResponse> {
    auth::resend_verification(&state.auth, &request.email).await?;

    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "message": "If the address is awaiting verification, a new email is on its way" })),
    ))
}

pub async fn sign_in(
    State(state): State<AppState>,
    Json(request): Json<SignInRequest>,
) -> ApiResult<impl IntoResponse> {
    let pair = auth::sign_in(&state.auth, request).await?;
    let cookies = session_cookies(&pair, &state.auth.settings);
    Ok((AppendHeaders(cookies), Json(pair)))
}

pub async fn sign_out(
    State(state): State<AppState>,
    Extension(tokens): Extension<RequestTokens>,
) -> ApiResult<impl IntoResponse> {
    auth::sign_out(&state.auth, tokens.access.raw.as_deref()).await?;

    Ok((
        StatusCode::NO_CONTENT,
        AppendHeaders([
            (SET_COOKIE, expired_cookie(ACCESS_TOKEN_COOKIE)),
            (SET_COOKIE, expired_cookie(REFRESH_TOKEN_COOKIE)),
        ]),
    ))
}

pub async fn session(Extension(auth_user): Extension<AuthUser>) -> Json<AccountProjection> {
    Json(auth_user.user)
}

pub async fn refresh(
    State(state): State<AppState>,
    Extension(tokens): Extension<RequestTokens>,
) -> ApiResult<impl IntoResponse> {
    let pair = auth::refresh_session(&state.auth, tokens.refresh.raw.as_deref()).await?;
    let cookies = session_cookies(&pair, &state.auth.settings);
    Ok((AppendHeaders(cookies), Json(pair)))
}

fn session_cookies(pair: &TokenPair, settings: &AuthSettings) -> [(axum::http::HeaderName, String); 2] {
    let secure = settings.secure_cookies;
    [
        (
            SET_COOKIE,
            cookie(ACCESS_TOKEN_COOKIE, &pair.access_token, settings.access_token_ttl_secs, secure),
        ),
        (
            SET_COOKIE,
            cookie(REFRESH_TOKEN_COOKIE, &pair.refresh_token, settings.refresh_token_ttl_secs, secure),
        ),
    ]
}

fn cookie(name: &str, value: &str, max_age_secs: u64, secure: bool) -> String {
    let mut cookie = format!("{name}={value}; Path=/; HttpOnly; SameSite=Lax; Max-Age={max_age_secs}");
    if secure {
        cookie.push_str("; Secure");
    }
    cookie
}

fn expired_cookie(name: &str) -> String {
    format!("{name}=; Path=/; HttpOnly; SameSite=Lax; Max-Age=0")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cookie_attributes() {
        let plain = cookie("access-token", "abc", 900, false);
        assert_eq!(plain, "access-token=abc; Path=/; HttpOnly; SameSite=Lax; Max-Age=900");
        assert!(cookie("access-token", "abc", 900, true).ends_with("; Secure"));
        assert!(expired_cookie("refresh-token").contains("Max-Age=0"));
    }

    #[test]
    fn test_session_cookies_follow_secure_setting() {
        let pair = TokenPair {
            access_token: "a".to_string(),
            refresh_token: "r".to_string(),
        };
        let mut settings = AuthSettings {
            access_token_ttl_secs: 900,
            refresh_token_ttl_secs: 604_800,
            verification_code_ttl_secs: 86_400,
            // An https verification link alone does not switch cookies to Secure
            verify_url_base: "https://auth.example.com/auth/verify-email".to_string(),
            secure_cookies: false,
        };
        assert!(session_cookies(&pair, &settings)
            .iter()
            .all(|(_, c)| !c.contains("Secure")));

        settings.secure_cookies = true;
        let cookies = session_cookies(&pair, &settings);
        assert!(cookies[0].1.starts_with("access-token=a;"));
        assert!(cookies[1].1.contains("Max-Age=604800"));
        assert!(cookies.iter().all(|(_, c)| c.ends_with("; Secure")));
    }
}
