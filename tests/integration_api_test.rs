// Integration tests for the management API router

use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use std::sync::Arc;
use tether::api::{create_router, AppState, StateManager};
use tether::auth::TokenSet;
use tether::manager::HttpOptions;
use tether::provider::{IdentitySource, ProviderAuth, ProviderDescriptor, ProviderRegistry};
use tether::store::CredentialStore;
use tower::ServiceExt;

fn api_key_provider(name: &str) -> ProviderDescriptor {
    ProviderDescriptor {
        name: name.to_string(),
        display_name: "Clubhouse".to_string(),
        base_url: "https://api.clubhouse.example".to_string(),
        auth: ProviderAuth::ApiKey {
            header: tether::auth::ApiKeyHeader::Bearer,
        },
        identity: IdentitySource::CallbackField {
            field: "subdomain".to_string(),
        },
        probe_path: "/account".to_string(),
        backoff_schedule: None,
    }
}

fn oauth_provider(name: &str) -> ProviderDescriptor {
    ProviderDescriptor {
        name: name.to_string(),
        display_name: "HubStack".to_string(),
        base_url: "https://api.hubstack.example".to_string(),
        auth: ProviderAuth::OAuth2 {
            auth_url: "https://hubstack.example/oauth/authorize".to_string(),
            token_url: "https://hubstack.example/oauth/token".to_string(),
            scopes: vec!["read".to_string()],
            client_id: "cid".to_string(),
            client_secret: "secret".to_string(),
            credential_style: Default::default(),
        },
        identity: IdentitySource::Endpoint {
            path: "/me".to_string(),
            id_pointer: "/id".to_string(),
            name_pointer: None,
        },
        probe_path: "/me".to_string(),
        backoff_schedule: None,
    }
}

fn create_test_app(
    providers: Vec<ProviderDescriptor>,
    auth_enabled: bool,
) -> (Router, Arc<CredentialStore>) {
    let store = Arc::new(
        CredentialStore::new(":memory:", &BASE64.encode([0u8; 32])).unwrap(),
    );
    let state = AppState {
        store: Arc::clone(&store),
        registry: Arc::new(ProviderRegistry::new(providers).unwrap()),
        state_manager: StateManager::new(600),
        http: HttpOptions::default(),
        callback_base_url: "http://localhost:3000".to_string(),
        auth_enabled,
    };
    (create_router(state), store)
}

async fn body_json(response: axum::response::Response) -> serde_json::Value {
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&body).unwrap()
}

#[tokio::test]
async fn list_integrations_with_empty_registry() {
    let (app, _store) = create_test_app(vec![], false);

    let response = app
        .oneshot(
            Request::builder()
                .uri("/api/integrations")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["integrations"].as_array().unwrap().len(), 0);
}

#[tokio::test]
async fn list_integrations_reports_status_per_provider() {
    let (app, store) = create_test_app(
        vec![api_key_provider("clubhouse"), oauth_provider("hubstack")],
        false,
    );

    // Seed a connected clubhouse credential + entity for the default user
    let credential = store
        .create_credential(
            "default",
            "clubhouse",
            "acme",
            &TokenSet::from_access_token("sk_live"),
        )
        .unwrap();
    store
        .create_entity("default", "clubhouse", "acme", Some("Acme"), Some(&credential.id))
        .unwrap();

    let response = app
        .oneshot(
            Request::builder()
                .uri("/api/integrations")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    let integrations = json["integrations"].as_array().unwrap();
    assert_eq!(integrations.len(), 2);

    // Sorted by name: clubhouse first
    assert_eq!(integrations[0]["provider"], "clubhouse");
    assert_eq!(integrations[0]["type"], "api_key");
    assert_eq!(integrations[0]["status"], "active");
    assert_eq!(integrations[0]["entities"][0]["external_id"], "acme");
    assert_eq!(integrations[0]["entities"][0]["name"], "Acme");

    assert_eq!(integrations[1]["provider"], "hubstack");
    assert_eq!(integrations[1]["type"], "oauth2");
    assert_eq!(integrations[1]["status"], "unauthenticated");
}

#[tokio::test]
async fn requirements_for_api_key_provider_return_a_form_schema() {
    let (app, _store) = create_test_app(vec![api_key_provider("clubhouse")], false);

    let response = app
        .oneshot(
            Request::builder()
                .uri("/api/integrations/clubhouse/requirements")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["type"], "api_key");
    assert!(json.get("url").is_none());
    assert_eq!(json["data"]["required"][0], "api_key");
}

#[tokio::test]
async fn requirements_for_oauth_provider_include_consent_url_with_state() {
    let (app, _store) = create_test_app(vec![oauth_provider("hubstack")], false);

    let response = app
        .oneshot(
            Request::builder()
                .uri("/api/integrations/hubstack/requirements")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["type"], "oauth2");
    let url = json["url"].as_str().unwrap();
    assert!(url.starts_with("https://hubstack.example/oauth/authorize?"));
    assert!(url.contains("state="));
}

#[tokio::test]
async fn unknown_provider_is_404() {
    let (app, _store) = create_test_app(vec![], false);

    let response = app
        .oneshot(
            Request::builder()
                .uri("/api/integrations/nonesuch/requirements")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn authorize_then_deauthorize_round_trip() {
    let (app, store) = create_test_app(vec![api_key_provider("clubhouse")], false);

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/integrations/clubhouse/authorize")
                .header("content-type", "application/json")
                .body(Body::from(
                    r#"{"data":{"api_key":"sk_live_123","subdomain":"acme"}}"#,
                ))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::CREATED);
    let json = body_json(response).await;
    let credential_id = json["credential_id"].as_str().unwrap().to_string();
    assert!(!credential_id.is_empty());
    assert_eq!(json["type"], "api_key");

    assert!(store.get_credential(&credential_id).unwrap().is_some());

    // Deauthorize
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("DELETE")
                .uri("/api/integrations/clubhouse")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    assert!(store.get_credential(&credential_id).unwrap().is_none());

    // Idempotent: a second delete also answers 204
    let response = app
        .oneshot(
            Request::builder()
                .method("DELETE")
                .uri("/api/integrations/clubhouse")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
}

#[tokio::test]
async fn authorize_with_missing_fields_is_400() {
    let (app, _store) = create_test_app(vec![api_key_provider("clubhouse")], false);

    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/integrations/clubhouse/authorize")
                .header("content-type", "application/json")
                .body(Body::from(r#"{"data":{"subdomain":"acme"}}"#))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let json = body_json(response).await;
    assert!(json["error"].as_str().unwrap().contains("api_key"));
}

#[tokio::test]
async fn oauth_callback_with_unknown_state_is_401() {
    let (app, _store) = create_test_app(vec![oauth_provider("hubstack")], false);

    let response = app
        .oneshot(
            Request::builder()
                .uri("/api/integrations/hubstack/oauth/callback?code=abc&state=forged")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn oauth_start_on_non_oauth_provider_is_400() {
    let (app, _store) = create_test_app(vec![api_key_provider("clubhouse")], false);

    let response = app
        .oneshot(
            Request::builder()
                .uri("/api/integrations/clubhouse/oauth/start")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn oauth_start_redirects_to_the_consent_url() {
    let (app, _store) = create_test_app(vec![oauth_provider("hubstack")], false);

    let response = app
        .oneshot(
            Request::builder()
                .uri("/api/integrations/hubstack/oauth/start")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::TEMPORARY_REDIRECT);
    let location = response
        .headers()
        .get("location")
        .unwrap()
        .to_str()
        .unwrap();
    assert!(location.starts_with("https://hubstack.example/oauth/authorize?"));
    assert!(location.contains("state="));
    assert!(location.contains("redirect_uri=http%3A%2F%2Flocalhost%3A3000%2Fapi%2Fintegrations%2Fhubstack%2Foauth%2Fcallback"));
}

#[tokio::test]
async fn bearer_token_is_required_when_auth_is_enabled() {
    let (app, _store) = create_test_app(vec![api_key_provider("clubhouse")], true);

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/api/integrations")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let response = app
        .oneshot(
            Request::builder()
                .uri("/api/integrations")
                .header("authorization", "Bearer user-42")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn users_are_isolated_from_each_other() {
    let (app, store) = create_test_app(vec![api_key_provider("clubhouse")], true);

    store
        .create_credential(
            "user-a",
            "clubhouse",
            "acme",
            &TokenSet::from_access_token("sk_live"),
        )
        .unwrap();

    // user-a sees the connection
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/api/integrations")
                .header("authorization", "Bearer user-a")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    let json = body_json(response).await;
    assert_eq!(json["integrations"][0]["status"], "active");

    // user-b does not
    let response = app
        .oneshot(
            Request::builder()
                .uri("/api/integrations")
                .header("authorization", "Bearer user-b")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    let json = body_json(response).await;
    assert_eq!(json["integrations"][0]["status"], "unauthenticated");
}
