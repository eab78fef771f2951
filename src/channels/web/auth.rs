//! Bearer-token authentication for the dashboard API.

use std::sync::Arc;

use axum::{
    extract::{Request, State},
    http::{StatusCode, header},
    middleware::Next,
    response::{IntoResponse, Response},
};
use secrecy::{ExposeSecret, SecretString};
use subtle::ConstantTimeEq;

/// Shared auth state. `None` means no token is configured and every API call is refused.
#[derive(Clone)]
pub struct AuthState {
    pub token: Option<Arc<SecretString>>,
}

impl AuthState {
    pub fn new(token: Option<SecretString>) -> Self {
        Self {
            token: token.map(Arc::new),
        }
    }

    fn accepts(&self, presented: &str) -> bool {
        match &self.token {
            Some(expected) => {
                let expected = expected.expose_secret().as_bytes();
                !expected.is_empty() && bool::from(expected.ct_eq(presented.as_bytes()))
            }
            None => false,
        }
    }
}

pub async fn auth_middleware(
    State(auth): State<AuthState>,
    request: Request,
    next: Next,
) -> Response {
    let presented = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim);

    match presented {
        Some(token) if auth.accepts(token) => next.run(request).await,
        _ => {
            tracing::debug!(path = %request.uri().path(), "Rejected unauthenticated API request");
            (StatusCode::UNAUTHORIZED, "unauthorized").into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use secrecy::SecretString;

    use super::AuthState;

    #[test]
    fn only_the_configured_token_is_accepted() {
        let auth = AuthState::new(Some(SecretString::from("s3cret".to_string())));
        assert!(auth.accepts("s3cret"));
        assert!(!auth.accepts("s3cre"));
        assert!(!auth.accepts(""));

        let locked = AuthState::new(None);
        assert!(!locked.accepts("anything"));
        let empty = AuthState::new(Some(SecretString::from(String::new())));
        assert!(!empty.accepts(""));
    }
}
