//! Integration management HTTP API.
//!
//! Routes:
//! - `GET    /api/integrations` - providers with per-user connection status
//! - `GET    /api/integrations/:provider/requirements` - how to authorize
//! - `GET    /api/integrations/:provider/oauth/start` - redirect to consent
//! - `GET    /api/integrations/:provider/oauth/callback` - finish OAuth
//! - `POST   /api/integrations/:provider/authorize` - submit key/password
//! - `POST   /api/integrations/:provider/test` - verify stored credentials
//! - `DELETE /api/integrations/:provider` - deauthorize
//!
//! Caller identity comes from a bearer token; with auth disabled every
//! request acts as the default user.

mod integrations;
mod oauth;
mod state_manager;

pub use state_manager::{run_state_cleanup, PendingAuth, StateManager};

use crate::error::Error;
use crate::manager::{HttpOptions, ModuleManager};
use crate::provider::ProviderRegistry;
use crate::store::CredentialStore;
use axum::{
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{delete, get, post},
    Router,
};
use serde::Serialize;
use std::sync::Arc;

/// User assumed when auth is disabled.
const DEFAULT_USER: &str = "default";

/// Shared state for all integration API handlers.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<CredentialStore>,
    pub registry: Arc<ProviderRegistry>,
    pub state_manager: StateManager,
    pub http: HttpOptions,
    pub callback_base_url: String,
    pub auth_enabled: bool,
}

impl AppState {
    /// Builds the manager for one (provider, user) pair, or `None` for an
    /// unknown provider.
    fn manager(&self, provider: &str, user_id: &str) -> Option<ModuleManager> {
        let descriptor = self.registry.get(provider)?.clone();
        let redirect_uri = format!(
            "{}/api/integrations/{}/oauth/callback",
            self.callback_base_url, descriptor.name
        );
        Some(ModuleManager::new(
            descriptor,
            Arc::clone(&self.store),
            user_id,
            &redirect_uri,
            self.http.clone(),
        ))
    }

    /// Resolves the calling user from the Authorization header.
    fn user_from_headers(&self, headers: &HeaderMap) -> Result<String, AppError> {
        if !self.auth_enabled {
            return Ok(DEFAULT_USER.to_string());
        }
        extract_bearer_token(headers)
            .map_err(|reason| AppError::Unauthorized(format!("Invalid token: {}", reason)))
    }
}

/// Extracts the bearer token from `Authorization: Bearer <token>`.
fn extract_bearer_token(headers: &HeaderMap) -> Result<String, String> {
    let header = headers
        .get("authorization")
        .ok_or_else(|| "authorization header not provided".to_string())?
        .to_str()
        .map_err(|_| "authorization header is not valid UTF-8".to_string())?;

    let mut parts = header.splitn(2, ' ');
    let scheme = parts.next().unwrap_or_default();
    let token = parts.next().unwrap_or_default().trim();

    if !scheme.eq_ignore_ascii_case("bearer") {
        return Err("expected 'Bearer <token>'".to_string());
    }
    if token.is_empty() {
        return Err("token is empty".to_string());
    }
    Ok(token.to_string())
}

/// Error payload returned by every handler.
#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

/// HTTP-mapped application errors.
pub enum AppError {
    BadRequest(String),
    Unauthorized(String),
    NotFound(String),
    Conflict(String),
    ServerError(String),
    BadGateway(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            AppError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, msg),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            AppError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            AppError::ServerError(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
            AppError::BadGateway(msg) => (StatusCode::BAD_GATEWAY, msg),
        };
        (status, Json(ErrorResponse { error: message })).into_response()
    }
}

impl From<Error> for AppError {
    fn from(err: Error) -> Self {
        match &err {
            Error::Validation(_) => AppError::BadRequest(err.to_string()),
            Error::Conflict { .. } => AppError::Conflict(err.to_string()),
            Error::CredentialNotFound { .. } => AppError::NotFound(err.to_string()),
            Error::Fetch(_) | Error::Refresh(_) | Error::Transport { .. } => {
                AppError::BadGateway(err.to_string())
            }
            Error::Internal(_) => AppError::ServerError(err.to_string()),
        }
    }
}

/// Assembles the integration API router.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/api/integrations", get(integrations::list_integrations))
        .route(
            "/api/integrations/:provider/requirements",
            get(integrations::authorization_requirements),
        )
        .route(
            "/api/integrations/:provider/authorize",
            post(integrations::authorize),
        )
        .route(
            "/api/integrations/:provider/test",
            post(integrations::test_auth),
        )
        .route(
            "/api/integrations/:provider",
            delete(integrations::deauthorize),
        )
        .route(
            "/api/integrations/:provider/oauth/start",
            get(oauth::oauth_start),
        )
        .route(
            "/api/integrations/:provider/oauth/callback",
            get(oauth::oauth_callback),
        )
        .with_state(Arc::new(state))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bearer_token_extraction() {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", "Bearer user-token-1".parse().unwrap());
        assert_eq!(extract_bearer_token(&headers).unwrap(), "user-token-1");
    }

    #[test]
    fn bearer_scheme_is_case_insensitive() {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", "bearer tok".parse().unwrap());
        assert_eq!(extract_bearer_token(&headers).unwrap(), "tok");
    }

    #[test]
    fn missing_or_malformed_headers_are_rejected() {
        assert!(extract_bearer_token(&HeaderMap::new()).is_err());

        let mut headers = HeaderMap::new();
        headers.insert("authorization", "Basic dXNlcg==".parse().unwrap());
        assert!(extract_bearer_token(&headers).is_err());

        let mut headers = HeaderMap::new();
        headers.insert("authorization", "Bearer ".parse().unwrap());
        assert!(extract_bearer_token(&headers).is_err());
    }
}
