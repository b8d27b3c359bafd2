//! OAuth 2.0 authorization-code flow endpoints.
//!
//! 1. `GET /api/integrations/:provider/oauth/start` - issue CSRF state,
//!    redirect the user to the provider's consent page
//! 2. User authorizes on the provider's site
//! 3. `GET /api/integrations/:provider/oauth/callback` - validate state,
//!    exchange the code, reconcile Credential and Entity records

use super::{AppError, AppState};
use crate::auth::{AuthKind, CallbackData};
use serde_json::Value;
use axum::{
    extract::{Path, Query, State},
    http::HeaderMap,
    response::{Json, Redirect},
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Provider callback query parameters.
#[derive(Deserialize)]
pub struct OAuthCallback {
    code: Option<String>,
    state: Option<String>,
    error: Option<String>,
    error_description: Option<String>,
}

#[derive(Serialize)]
pub struct OAuthSuccessResponse {
    pub success: bool,
    pub provider: String,
    pub credential_id: String,
    pub entity_id: String,
}

/// GET /api/integrations/:provider/oauth/start
///
/// Issues a single-use CSRF state bound to the caller and redirects to the
/// provider's consent URL.
pub async fn oauth_start(
    State(state): State<Arc<AppState>>,
    Path(provider): Path<String>,
    headers: HeaderMap,
) -> Result<Redirect, AppError> {
    debug!(provider = %provider, "OAuth start requested");

    let user_id = state.user_from_headers(&headers)?;
    let manager = state
        .manager(&provider, &user_id)
        .ok_or_else(|| AppError::NotFound(format!("Provider '{}' not found", provider)))?;

    if manager.kind() != AuthKind::OAuth2 {
        return Err(AppError::BadRequest(format!(
            "Provider '{}' does not use the OAuth flow",
            provider
        )));
    }

    let csrf_state = state.state_manager.issue(&provider, &user_id);
    let requirements = manager.authorization_requirements(Some(&csrf_state));
    let consent_url = requirements.url.ok_or_else(|| {
        AppError::ServerError(format!("No consent URL configured for '{}'", provider))
    })?;

    info!(
        provider = %provider,
        user_id = %user_id,
        "Redirecting to OAuth provider"
    );
    Ok(Redirect::temporary(&consent_url))
}

/// GET /api/integrations/:provider/oauth/callback
///
/// Validates the CSRF state (single-use), exchanges the authorization code,
/// and runs find-or-create reconciliation.
pub async fn oauth_callback(
    State(state): State<Arc<AppState>>,
    Path(provider): Path<String>,
    Query(callback): Query<OAuthCallback>,
) -> Result<Json<OAuthSuccessResponse>, AppError> {
    debug!(provider = %provider, "OAuth callback received");

    if let Some(error) = callback.error {
        let description = callback
            .error_description
            .unwrap_or_else(|| "no description".to_string());
        warn!(
            provider = %provider,
            error = %error,
            description = %description,
            "OAuth authorization rejected by provider"
        );
        return Err(AppError::BadRequest(format!(
            "OAuth authorization failed: {} - {}",
            error, description
        )));
    }

    let code = callback
        .code
        .ok_or_else(|| AppError::BadRequest("Missing 'code' parameter".to_string()))?;
    let csrf_state = callback
        .state
        .ok_or_else(|| AppError::BadRequest("Missing 'state' parameter".to_string()))?;

    let pending = state.state_manager.claim(&csrf_state).ok_or_else(|| {
        warn!(provider = %provider, "Invalid or expired OAuth state");
        AppError::Unauthorized(
            "Invalid or expired OAuth state (possible CSRF attack)".to_string(),
        )
    })?;

    if pending.provider != provider {
        warn!(
            expected = %pending.provider,
            actual = %provider,
            "OAuth state bound to a different provider"
        );
        return Err(AppError::BadRequest("Provider mismatch".to_string()));
    }

    let manager = state
        .manager(&provider, &pending.user_id)
        .ok_or_else(|| AppError::NotFound(format!("Provider '{}' not found", provider)))?;

    let mut data = serde_json::Map::new();
    data.insert("code".to_string(), Value::String(code));
    let outcome = manager
        .process_authorization_callback(&CallbackData { data })
        .await
        .map_err(AppError::from)?;

    info!(
        provider = %provider,
        user_id = %pending.user_id,
        credential_id = %outcome.credential_id,
        "OAuth flow completed"
    );

    Ok(Json(OAuthSuccessResponse {
        success: true,
        provider,
        credential_id: outcome.credential_id,
        entity_id: outcome.entity_id,
    }))
}
