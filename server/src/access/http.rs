//! HTTP middleware for access control.

use axum::{http::Request, middleware::Next, response::Response};
use tokio::sync::OnceCell;
use uuid::Uuid;
use vault_token::{util::parse_authorization_header, Token};

use crate::error::{ServerError, ServerResult};
use crate::{RequestState, State};

/// Auth state for a single request.
#[derive(Debug)]
pub struct AuthState {
    /// The verified token, if the caller presented a valid one.
    pub token: OnceCell<Token>,
}

impl AuthState {
    pub fn new() -> Self {
        Self {
            token: OnceCell::new(),
        }
    }

    /// Returns the authenticated user's ID, if any.
    pub fn owner(&self) -> Option<Uuid> {
        self.token.get().and_then(|token| token.owner().ok())
    }

    /// Returns the authenticated user's ID, or `Auth` if unauthenticated.
    pub fn require_owner(&self) -> ServerResult<Uuid> {
        self.owner().ok_or(ServerError::Auth)
    }
}

impl Default for AuthState {
    fn default() -> Self {
        Self::new()
    }
}

/// Verifies the bearer token, if any, and stashes it on the request state.
///
/// Missing or malformed tokens are not rejected here — that only happens
/// once a handler actually requires an authenticated owner.
pub async fn apply_auth<B>(req: Request<B>, next: Next<B>) -> Response {
    let token: Option<Token> = req
        .headers()
        .get("Authorization")
        .and_then(|bytes| bytes.to_str().ok())
        .and_then(parse_authorization_header)
        .and_then(|jwt| {
            let state = req.extensions().get::<State>().unwrap();
            let res_token = Token::from_jwt_hs256(&jwt, &state.config.jwt.decoding_key());
            if let Err(e) = &res_token {
                tracing::debug!("Ignoring bad JWT token: {}", e);
            }
            res_token.ok()
        });

    if let Some(token) = token {
        let req_state = req.extensions().get::<RequestState>().unwrap();
        let _ = req_state.auth.token.set(token);
        tracing::trace!("Added valid token");
    }

    next.run(req).await
}
