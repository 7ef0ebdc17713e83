//! Authentication middleware for Axum
//!
//! Two stages:
//! - [`decode_tokens`] reads the access and refresh tokens from the request
//!   (header or cookie), decodes each one and stores both raw and decoded
//!   forms as [`RequestTokens`]. Missing or undecodable tokens are recorded,
//!   never rejected.
//! - [`require_auth`] additionally runs [`authorize`] and, on success, inserts
//!   the [`AuthUser`] handlers rely on.

use axum::{
    extract::{Request, State},
    http::{
        header::{AUTHORIZATION, COOKIE},
        HeaderMap,
    },
    middleware::Next,
    response::{IntoResponse, Response},
};

use super::jwt::{JwtManager, SessionClaims};
use crate::{
    error::{ApiError, ApiResult},
    state::AuthState,
    store::AccountProjection,
};

pub const ACCESS_TOKEN_COOKIE: &str = "access-token";
pub const REFRESH_TOKEN_COOKIE: &str = "refresh-token";
pub const REFRESH_TOKEN_HEADER: &str = "x-refresh-token";

/// One token as found on the request
#[derive(Debug, Clone, Default)]
pub struct TokenSlot {
    pub raw: Option<String>,
    /// `None` when absent, malformed or signed with an unknown key
    pub decoded: Option<SessionClaims>,
}

impl TokenSlot {
    pub fn decode(raw: Option<String>, jwt_manager: &JwtManager) -> Self {
        let raw = raw.filter(|t| !t.is_empty());
        let decoded = raw.as_deref().and_then(|t| jwt_manager.parse(t));
        Self { raw, decoded }
    }
}

/// Both session tokens carried by a request
#[derive(Debug, Clone, Default)]
pub struct RequestTokens {
    pub access: TokenSlot,
    pub refresh: TokenSlot,
}

/// Authenticated caller, inserted by [`require_auth`]
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub user: AccountProjection,
    /// Access token expiry (unix seconds)
    pub expires_at: i64,
}

fn extract_cookie(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|h| h.to_str().ok())
        .flat_map(|cookies| cookies.split(';'))
        .find_map(|cookie| {
            let (key, value) = cookie.trim().split_once('=')?;
            (key == name).then(|| value.to_string())
        })
}

/// Bearer header first, then the `access-token` cookie
fn extract_access_token(headers: &HeaderMap) -> Option<String> {
    if let Some(header) = headers.get(AUTHORIZATION).and_then(|h| h.to_str().ok()) {
        if let Some(token) = header.strip_prefix("Bearer ") {
            return Some(token.trim().to_string());
        }
    }

    extract_cookie(headers, ACCESS_TOKEN_COOKIE)
}

/// `X-Refresh-Token` header first, then the `refresh-token` cookie
fn extract_refresh_token(headers: &HeaderMap) -> Option<String> {
    if let Some(token) = headers
        .get(REFRESH_TOKEN_HEADER)
        .and_then(|h| h.to_str().ok())
    {
        return Some(token.trim().to_string());
    }

    extract_cookie(headers, REFRESH_TOKEN_COOKIE)
}

pub fn extract_tokens(headers: &HeaderMap, jwt_manager: &JwtManager) -> RequestTokens {
    RequestTokens {
        access: TokenSlot::decode(extract_access_token(headers), jwt_manager),
        refresh: TokenSlot::decode(extract_refresh_token(headers), jwt_manager),
    }
}

/// Check the access token against the session registry.
///
/// The session lookup comes before the expiry check so that tokens from a
/// signed-out or superseded session are reported as invalid, not expired.
pub async fn authorize(state: &AuthState, access: &TokenSlot) -> ApiResult<AuthUser> {
    let Some(raw) = access.raw.as_deref() else {
        return Err(ApiError::Unauthorized("Access token not provided"));
    };

    if state
        .store
        .find_session_by_access_token(raw)
        .await?
        .is_none()
    {
        return Err(ApiError::Unauthorized("Invalid access token"));
    }

    match &access.decoded {
        Some(claims) if !claims.is_expired() => Ok(AuthUser {
            user: claims.user.clone(),
            expires_at: claims.exp,
        }),
        _ => Err(ApiError::Unauthorized("Access token expired")),
    }
}

/// Middleware that decodes session tokens without enforcing anything
pub async fn decode_tokens(
    State(auth_state): State<AuthState>,
    mut request: Request,
    next: Next,
) -> Response {
    let tokens = extract_tokens(request.headers(), &auth_state.jwt_manager);
    tracing::debug!(
        has_access = tokens.access.raw.is_some(),
        access_decoded = tokens.access.decoded.is_some(),
        has_refresh = tokens.refresh.raw.is_some(),
        "decode_tokens"
    );
    request.extensions_mut().insert(tokens);
    next.run(request).await
}

/// Middleware that requires an authorized session
pub async fn require_auth(
    State(auth_state): State<AuthState>,
    mut request: Request,
    next: Next,
) -> Response {
    let path = request.uri().path().to_string();

    // Reuse the decode stage's work when it already ran
    let tokens = match request.extensions().get::<RequestTokens>() {
        Some(tokens) => tokens.clone(),
        None => extract_tokens(request.headers(), &auth_state.jwt_manager),
    };

    match authorize(&auth_state, &tokens.access).await {
        Ok(auth_user) => {
            tracing::debug!(
                path = %path,
                user_id = %auth_user.user.id,
                "require_auth: authentication successful"
            );
            request.extensions_mut().insert(tokens);
            request.extensions_mut().insert(auth_user);
            next.run(request).await
        }
        Err(err) => {
            tracing::info!(path = %path, error = %err, "require_auth: authentication failed");
            err.into_response()
        }
    }
}
