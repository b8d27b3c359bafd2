//! Encrypted persistence for credential and entity records.
//!
//! The store is the single shared mutable resource of the system. It is an
//! opaque record store by contract: `create` / `get` / `find` / `update` /
//! `delete`, each one atomic, no transactions across calls, and no opinion
//! about key uniqueness - reconciliation lives above it.
//!
//! # Security
//! - Secret bundles are encrypted at rest with AES-256-GCM
//! - Each bundle is sealed under a unique nonce
//! - The 32-byte master key arrives from the environment and stays in memory

mod encryption;
mod sqlite;

pub use encryption::SecretCipher;
pub use sqlite::CredentialStore;

use crate::auth::TokenSet;
use chrono::{DateTime, Utc};
use serde::Serialize;

/// Persisted secret bundle for one external account of one local user.
///
/// Lifecycle: created on the first successful authorization callback,
/// mutated on every token refresh, flipped invalid when a refresh fails,
/// deleted on deauthorization.
#[derive(Clone, Debug, Serialize)]
pub struct CredentialRecord {
    pub id: String,
    pub user_id: String,
    pub provider: String,
    /// Provider-side account identifier.
    pub external_id: String,
    /// Decrypted secret bundle. Skipped on serialization so records can be
    /// returned from API handlers without leaking tokens.
    #[serde(skip_serializing)]
    pub secrets: TokenSet,
    pub auth_is_valid: bool,
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Persisted representation of the remote business object an integration
/// acts on behalf of (an organization, workspace, account).
///
/// Decoupled from [`CredentialRecord`]: the entity references a credential
/// by id but does not own its lifecycle, and it survives deauthorization
/// with the reference cleared.
#[derive(Clone, Debug, Serialize)]
pub struct EntityRecord {
    pub id: String,
    pub user_id: String,
    pub provider: String,
    pub external_id: String,
    pub name: Option<String>,
    pub credential_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
