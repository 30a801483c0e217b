//! Authentication for the socket endpoint and the admin routes.
//!
//! The hub never decides who a caller is. The application implements
//! [`TokenValidator`] on its state, and [`WsAuth`] runs it for every request,
//! reading the token from `Authorization: Bearer <token>` or, since browsers
//! cannot set headers on a WebSocket handshake, from `?token=<token>`.
//!
//! ## Example
//!
//! ```rust,ignore
//! #[derive(Debug, Clone)]
//! struct Member {
//!     id: String,
//!     active: bool,
//! }
//!
//! impl Identity for Member {
//!     fn user_id(&self) -> UserId {
//!         self.id.clone()
//!     }
//!     fn is_active(&self) -> bool {
//!         self.active
//!     }
//! }
//!
//! #[async_trait]
//! impl TokenValidator for AppState {
//!     type User = Member;
//!     type Error = std::io::Error;
//!
//!     async fn validate_token(&self, token: &str) -> Result<Self::User, Self::Error> {
//!         self.sessions.lookup(token).await
//!     }
//! }
//!
//! async fn ws_route(WsAuth(member): WsAuth<Member>) -> Response {
//!     // ...
//! }
//! ```

use crate::error::ApiError;
use async_trait::async_trait;
use axum::{
    extract::{FromRequestParts, Query},
    http::{HeaderMap, header::AUTHORIZATION, request::Parts},
};
use serde::Deserialize;
use tracing::debug;

/// Implemented by the application state to turn a token into a user.
#[async_trait]
pub trait TokenValidator {
    /// The authenticated user. Usually also implements
    /// [`Identity`](crate::ws::types::Identity).
    type User: Send + Sync + 'static;
    /// The error type returned on validation failure.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Validates a token string and returns a user on success.
    ///
    /// # Arguments
    /// * `token` - The token string extracted from the request.
    async fn validate_token(&self, token: &str) -> Result<Self::User, Self::Error>;
}

/// Extractor holding the validated user of type `U`.
///
/// Rejects with `401 Unauthorized` when the token is missing or invalid.
#[derive(Debug)]
pub struct WsAuth<U>(pub U)
where
    U: Send + Sync + 'static;

#[derive(Deserialize)]
struct TokenQuery {
    token: String,
}

impl<S, U> FromRequestParts<S> for WsAuth<U>
where
    S: TokenValidator<User = U> + Send + Sync + 'static,
    U: Send + Sync + 'static,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let token = match get_token_from_headers(&parts.headers) {
            Some(token) => Some(token),
            None => Query::<TokenQuery>::from_request_parts(parts, state)
                .await
                .ok()
                .map(|Query(q)| q.token),
        };

        let Some(token) = token.filter(|t| !t.is_empty()) else {
            return Err(ApiError::unauthorized("missing authentication token"));
        };

        match state.validate_token(&token).await {
            Ok(user) => Ok(WsAuth(user)),
            Err(e) => {
                debug!("Token validation failed: {}", e);
                Err(ApiError::unauthorized("invalid authentication token"))
            }
        }
    }
}

fn get_token_from_headers(headers: &HeaderMap) -> Option<String> {
    headers
        .get(AUTHORIZATION)
        .and_then(|header| header.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(|token| token.trim().to_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::{Request, StatusCode};

    #[derive(Debug, thiserror::Error)]
    #[error("unknown token")]
    struct UnknownToken;

    struct Sessions;

    #[async_trait]
    impl TokenValidator for Sessions {
        type User = String;
        type Error = UnknownToken;

        async fn validate_token(&self, token: &str) -> Result<String, UnknownToken> {
            match token {
                "alice-token" => Ok("alice".to_string()),
                _ => Err(UnknownToken),
            }
        }
    }

    fn parts(uri: &str, bearer: Option<&str>) -> Parts {
        let mut builder = Request::builder().uri(uri);
        if let Some(token) = bearer {
            builder = builder.header(AUTHORIZATION, format!("Bearer {token}"));
        }
        builder.body(()).unwrap().into_parts().0
    }

    #[test]
    fn reads_bearer_header() {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, "Bearer abc".parse().unwrap());
        assert_eq!(get_token_from_headers(&headers).as_deref(), Some("abc"));

        headers.insert(AUTHORIZATION, "Basic abc".parse().unwrap());
        assert_eq!(get_token_from_headers(&headers), None);
    }

    #[tokio::test]
    async fn accepts_header_or_query_token() {
        let mut from_header = parts("/ws", Some("alice-token"));
        let WsAuth(user) = WsAuth::<String>::from_request_parts(&mut from_header, &Sessions)
            .await
            .unwrap();
        assert_eq!(user, "alice");

        let mut from_query = parts("/ws?token=alice-token", None);
        let WsAuth(user) = WsAuth::<String>::from_request_parts(&mut from_query, &Sessions)
            .await
            .unwrap();
        assert_eq!(user, "alice");
    }

    #[tokio::test]
    async fn rejects_missing_or_unknown_token() {
        let mut missing = parts("/ws", None);
        let err = WsAuth::<String>::from_request_parts(&mut missing, &Sessions)
            .await
            .unwrap_err();
        assert_eq!(err.status, StatusCode::UNAUTHORIZED);

        let mut unknown = parts("/ws?token=mallory", None);
        let err = WsAuth::<String>::from_request_parts(&mut unknown, &Sessions)
            .await
            .unwrap_err();
        assert_eq!(err.status, StatusCode::UNAUTHORIZED);
        assert_eq!(err.message, "invalid authentication token");
    }
}
