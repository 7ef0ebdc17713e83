//! Client-side refresh policy
//!
//! Refreshing rotates the session row, so two independent refreshes for the
//! same account lock each other out: whichever writes second wins and the
//! other caller's fresh pair is already dead. [`RefreshCoordinator`] is the
//! single in-flight guard a client shares across its concurrent requests.
//!
//! ```text
//!   Idle --refresh--> Refreshing --ok--> Idle
//!                          |
//!                          +--rejected--> Failed --install--> Idle
//! ```

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{broadcast, Mutex};

use super::{refresh::refresh_session, sessions::TokenPair};
use crate::{
    error::{ApiError, ApiResult},
    state::AuthState,
};

const SESSION_ENDED: &str = "Session expired, sign in again";

/// Whatever can exchange a refresh token for a new pair: the engine in
/// process, or an HTTP client talking to `/auth/refresh`.
#[async_trait]
pub trait TokenRefresher: Send + Sync {
    async fn refresh(&self, refresh_token: &str) -> ApiResult<TokenPair>;
}

#[async_trait]
impl TokenRefresher for AuthState {
    async fn refresh(&self, refresh_token: &str) -> ApiResult<TokenPair> {
        refresh_session(self, Some(refresh_token)).await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshState {
    Idle,
    Refreshing,
    /// The server rejected the refresh token; nothing is retried until new
    /// tokens are installed.
    Failed,
}

/// Outcome shared with every caller waiting on one refresh
#[derive(Debug, Clone)]
enum RefreshFailure {
    /// Refresh token rejected; the session is over
    Rejected,
    /// Transient failure; the next attempt may succeed
    Unavailable(String),
}

type RefreshOutcome = Result<TokenPair, RefreshFailure>;

impl RefreshFailure {
    fn into_api_error(self) -> ApiError {
        match self {
            RefreshFailure::Rejected => ApiError::Unauthorized(SESSION_ENDED),
            RefreshFailure::Unavailable(msg) => ApiError::Internal(msg),
        }
    }
}

struct Inner {
    tokens: Option<TokenPair>,
    state: RefreshState,
    in_flight: Option<broadcast::Sender<RefreshOutcome>>,
}

/// Shares one token pair and at most one in-flight refresh among all of a
/// client's concurrent requests. Cloning shares the same guard.
#[derive(Clone)]
pub struct RefreshCoordinator {
    refresher: Arc<dyn TokenRefresher>,
    inner: Arc<Mutex<Inner>>,
}

impl RefreshCoordinator {
    pub fn new(refresher: Arc<dyn TokenRefresher>, tokens: Option<TokenPair>) -> Self {
        Self {
            refresher,
            inner: Arc::new(Mutex::new(Inner {
                tokens,
                state: RefreshState::Idle,
                in_flight: None,
            })),
        }
    }

    pub async fn state(&self) -> RefreshState {
        self.inner.lock().await.state
    }

    pub async fn tokens(&self) -> Option<TokenPair> {
        self.inner.lock().await.tokens.clone()
    }

    /// Replace the held pair (after sign-in) and leave any failed state
    pub async fn install(&self, tokens: TokenPair) {
        let mut inner = self.inner.lock().await;
        inner.tokens = Some(tokens);
        if inner.state == RefreshState::Failed {
            inner.state = RefreshState::Idle;
        }
    }

    /// Forget the held pair (after sign-out)
    pub async fn clear(&self) {
        let mut inner = self.inner.lock().await;
        inner.tokens = None;
        if inner.state == RefreshState::Failed {
            inner.state = RefreshState::Idle;
        }
    }

    /// Obtain a pair newer than the one whose refresh token is `stale`.
    ///
    /// Concurrent callers share a single refresh. A caller arriving after the
    /// pair already moved on gets the current pair without another round trip.
    pub async fn refresh(&self, stale: &str) -> ApiResult<TokenPair> {
        let mut rx = {
            let mut inner = self.inner.lock().await;
            match inner.state {
                RefreshState::Failed => return Err(ApiError::Unauthorized(SESSION_ENDED)),
                RefreshState::Refreshing => match &inner.in_flight {
                    Some(tx) => {
                        tracing::debug!("Joining in-flight session refresh");
                        tx.subscribe()
                    }
                    None => return Err(ApiError::Internal("refresh state lost".to_string())),
                },
                RefreshState::Idle => {
                    let refresh_token = match &inner.tokens {
                        None => return Err(ApiError::Unauthorized("Access token not provided")),
                        Some(current) if current.refresh_token != stale => {
                            return Ok(current.clone())
                        }
                        Some(current) => current.refresh_token.clone(),
                    };

                    let (tx, rx) = broadcast::channel(1);
                    inner.in_flight = Some(tx);
                    inner.state = RefreshState::Refreshing;
                    tracing::debug!("Starting session refresh");

                    // Run detached so a cancelled caller cannot strand the
                    // coordinator in `Refreshing`
                    tokio::spawn(Self::run_refresh(
                        self.refresher.clone(),
                        self.inner.clone(),
                        refresh_token,
                    ));
                    rx
                }
            }
        };

        match rx.recv().await {
            Ok(outcome) => outcome.map_err(RefreshFailure::into_api_error),
            Err(_) => Err(ApiError::Internal("session refresh was dropped".to_string())),
        }
    }

    async fn run_refresh(
        refresher: Arc<dyn TokenRefresher>,
        inner: Arc<Mutex<Inner>>,
        refresh_token: String,
    ) {
        let outcome = match refresher.refresh(&refresh_token).await {
            Ok(pair) => Ok(pair),
            Err(ApiError::BadRequest(reason)) | Err(ApiError::Unauthorized(reason)) => {
                tracing::info!(reason, "Session refresh rejected");
                Err(RefreshFailure::Rejected)
            }
            Err(e) => {
                tracing::warn!(error = %e, "Session refresh failed");
                Err(RefreshFailure::Unavailable(e.to_string()))
            }
        };

        let mut inner = inner.lock().await;
        match &outcome {
            Ok(pair) => {
                inner.tokens = Some(pair.clone());
                inner.state = RefreshState::Idle;
            }
            Err(RefreshFailure::Rejected) => inner.state = RefreshState::Failed,
            Err(RefreshFailure::Unavailable(_)) => inner.state = RefreshState::Idle,
        }
        if let Some(tx) = inner.in_flight.take() {
            // Ignore send errors - every waiter may have gone away
            let _ = tx.send(outcome);
        }
    }

    /// Run `op` with the current pair; on `Unauthorized`, refresh once and
    /// retry once.
    pub async fn call<T, F, Fut>(&self, op: F) -> ApiResult<T>
    where
        F: Fn(TokenPair) -> Fut,
        Fut: Future<Output = ApiResult<T>>,
    {
        let Some(tokens) = self.tokens().await else {
            return Err(ApiError::Unauthorized("Access token not provided"));
        };

        match op(tokens.clone()).await {
            Err(ApiError::Unauthorized(reason)) => {
                tracing::debug!(reason, "Request unauthorized, refreshing session");
                let fresh = self.refresh(&tokens.refresh_token).await?;
                op(fresh).await
            }
            other => other,
        }
    }
}
