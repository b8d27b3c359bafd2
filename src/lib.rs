// Integration management HTTP API
pub mod api;

// Auth strategies (OAuth2, API key, password)
pub mod auth;

// Configuration
pub mod config;

// Error taxonomy
pub mod error;

// Module manager: callbacks, reconciliation, lifecycle
pub mod manager;

// Typed auth-event notification channel
pub mod notify;

// Provider descriptor table
pub mod provider;

// HTTP execution with auth injection and refresh-and-retry
pub mod requester;

// Encrypted credential & entity storage
pub mod store;

pub use error::{Error, FetchError, RefreshError};
