use anyhow::{Context, Result};
use std::sync::Arc;
use tether::api::{create_router, run_state_cleanup, AppState, StateManager};
use tether::config::{self, TetherConfig};
use tether::provider::ProviderRegistry;
use tether::store::CredentialStore;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing subscriber
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tether=info".into()),
        )
        .init();

    info!("Tether starting...");

    // Load configuration
    let config_path =
        std::env::var("TETHER_CONFIG").unwrap_or_else(|_| "tether.toml".to_string());
    let config = if std::path::Path::new(&config_path).exists() {
        config::load_config(&config_path)
            .map_err(|e| anyhow::anyhow!("Failed to load config '{}': {}", config_path, e))?
    } else {
        warn!(path = %config_path, "Config file not found, using defaults");
        TetherConfig::default()
    };

    // The master key never lives in the config file
    let encryption_key = std::env::var("TETHER_ENCRYPTION_KEY")
        .context("TETHER_ENCRYPTION_KEY is required (base64-encoded 32-byte key)")?;

    let store = Arc::new(
        CredentialStore::new(&config.store.db_path, &encryption_key)
            .context("Failed to open credential store")?,
    );

    let registry = Arc::new(
        ProviderRegistry::new(config.providers.clone()).context("Invalid provider table")?,
    );
    if registry.is_empty() {
        warn!("No providers configured - the integration list will be empty");
    }

    // CSRF states: 10-minute validity, purged every minute
    let state_manager = StateManager::new(600);
    tokio::spawn(run_state_cleanup(state_manager.clone(), 60));

    let provider_count = registry.len();
    let app = create_router(AppState {
        store,
        registry,
        state_manager,
        http: config.http.options(),
        callback_base_url: config.server.callback_base_url.clone(),
        auth_enabled: config.server.auth_enabled,
    })
    .layer(CorsLayer::permissive());

    let listener = tokio::net::TcpListener::bind(&config.server.bind_addr)
        .await
        .with_context(|| format!("Failed to bind {}", config.server.bind_addr))?;

    info!(
        addr = %config.server.bind_addr,
        providers = provider_count,
        auth_enabled = config.server.auth_enabled,
        "Tether API listening"
    );

    axum::serve(listener, app).await.context("Server error")?;

    Ok(())
}
