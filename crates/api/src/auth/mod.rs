//! Authentication and session lifecycle

pub mod client;
pub mod jwt;
pub mod middleware;
pub mod password;
pub mod refresh;
pub mod sessions;
pub mod verification;

pub use client::{RefreshCoordinator, RefreshState, TokenRefresher};
pub use jwt::{JwtError, JwtManager, SessionClaims};
pub use middleware::{
    authorize, decode_tokens, require_auth, AuthUser, RequestTokens, TokenSlot,
};
pub use password::{dummy_hash, hash_password, verify_password, PasswordError};
pub use refresh::refresh_session;
pub use sessions::{get_session, sign_in, sign_out, TokenPair};
pub use verification::{complete_verification, resend_verification, sign_up};
