//! Integration management handlers: listing, requirements, credential
//! submission, auth testing, deauthorization.

use super::{AppError, AppState};
use crate::auth::{AuthKind, AuthorizationRequirements, CallbackData};
use crate::manager::{AuthorizationOutcome, IntegrationStatus};
use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::Json,
};
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, warn};

/// One entry in the `GET /api/integrations` response.
#[derive(Serialize)]
pub struct IntegrationInfo {
    pub provider: String,
    pub display_name: String,
    #[serde(rename = "type")]
    pub kind: AuthKind,
    pub status: IntegrationStatus,
    pub entities: Vec<EntityInfo>,
}

#[derive(Serialize)]
pub struct EntityInfo {
    pub id: String,
    pub external_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

#[derive(Serialize)]
pub struct IntegrationListResponse {
    pub integrations: Vec<IntegrationInfo>,
}

/// GET /api/integrations
///
/// Lists every configured provider with the caller's connection status and
/// known entities.
pub async fn list_integrations(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<IntegrationListResponse>, AppError> {
    let user_id = state.user_from_headers(&headers)?;

    let mut integrations = Vec::new();
    for descriptor in state.registry.descriptors() {
        let manager = match state.manager(&descriptor.name, &user_id) {
            Some(manager) => manager,
            None => continue,
        };

        let status = manager.status().map_err(AppError::from)?;
        let entities = manager
            .entities()
            .map_err(AppError::from)?
            .into_iter()
            .map(|entity| EntityInfo {
                id: entity.id,
                external_id: entity.external_id,
                name: entity.name,
            })
            .collect();

        integrations.push(IntegrationInfo {
            provider: descriptor.name.clone(),
            display_name: descriptor.display_name.clone(),
            kind: descriptor.kind(),
            status,
            entities,
        });
    }

    Ok(Json(IntegrationListResponse { integrations }))
}

/// GET /api/integrations/:provider/requirements
///
/// Describes how to authorize: a consent URL (with a freshly-issued CSRF
/// state) for OAuth providers, a form schema otherwise.
pub async fn authorization_requirements(
    State(state): State<Arc<AppState>>,
    Path(provider): Path<String>,
    headers: HeaderMap,
) -> Result<Json<AuthorizationRequirements>, AppError> {
    let user_id = state.user_from_headers(&headers)?;
    let manager = state
        .manager(&provider, &user_id)
        .ok_or_else(|| AppError::NotFound(format!("Provider '{}' not found", provider)))?;

    let csrf_state = match manager.kind() {
        AuthKind::OAuth2 => Some(state.state_manager.issue(&provider, &user_id)),
        _ => None,
    };

    Ok(Json(
        manager.authorization_requirements(csrf_state.as_deref()),
    ))
}

/// POST /api/integrations/:provider/authorize
///
/// Accepts submitted credentials (API key, username/password - or an OAuth
/// code relayed by a trusted frontend) and runs the authorization callback.
pub async fn authorize(
    State(state): State<Arc<AppState>>,
    Path(provider): Path<String>,
    headers: HeaderMap,
    Json(params): Json<CallbackData>,
) -> Result<(StatusCode, Json<AuthorizationOutcome>), AppError> {
    let user_id = state.user_from_headers(&headers)?;
    let manager = state
        .manager(&provider, &user_id)
        .ok_or_else(|| AppError::NotFound(format!("Provider '{}' not found", provider)))?;

    let outcome = manager
        .process_authorization_callback(&params)
        .await
        .map_err(AppError::from)?;

    info!(
        user_id = %user_id,
        provider = %provider,
        credential_id = %outcome.credential_id,
        "Integration authorized"
    );

    Ok((StatusCode::CREATED, Json(outcome)))
}

#[derive(Serialize)]
pub struct TestAuthResponse {
    pub valid: bool,
}

/// POST /api/integrations/:provider/test
///
/// Runs one cheap authenticated call. Always answers 200 with a boolean -
/// auth failures are a result, not an error.
pub async fn test_auth(
    State(state): State<Arc<AppState>>,
    Path(provider): Path<String>,
    headers: HeaderMap,
) -> Result<Json<TestAuthResponse>, AppError> {
    let user_id = state.user_from_headers(&headers)?;
    let manager = state
        .manager(&provider, &user_id)
        .ok_or_else(|| AppError::NotFound(format!("Provider '{}' not found", provider)))?;

    let valid = manager.test_auth().await;
    if !valid {
        warn!(user_id = %user_id, provider = %provider, "Auth test failed");
    }
    Ok(Json(TestAuthResponse { valid }))
}

/// DELETE /api/integrations/:provider
///
/// Deauthorizes the integration. Idempotent: deleting an already-absent
/// credential still answers 204.
pub async fn deauthorize(
    State(state): State<Arc<AppState>>,
    Path(provider): Path<String>,
    headers: HeaderMap,
) -> Result<StatusCode, AppError> {
    let user_id = state.user_from_headers(&headers)?;
    let manager = state
        .manager(&provider, &user_id)
        .ok_or_else(|| AppError::NotFound(format!("Provider '{}' not found", provider)))?;

    manager.deauthorize().await.map_err(AppError::from)?;

    info!(user_id = %user_id, provider = %provider, "Integration deauthorized");
    Ok(StatusCode::NO_CONTENT)
}
