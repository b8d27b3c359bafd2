//! Typed auth-event notification channel.
//!
//! The requester signals credential lifecycle events through an explicit
//! observer interface instead of string event names and runtime type
//! checks: token refreshed, token deauthorized by the provider, or auth
//! material found invalid. The production observer ([`CredentialSync`])
//! writes each event through to the one matching stored credential.

use crate::auth::TokenSet;
use crate::error::{Error, RecordKind};
use crate::store::{CredentialRecord, CredentialStore};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info};

/// Credential lifecycle events emitted by the requester.
#[derive(Clone, Debug, PartialEq)]
pub enum AuthEvent {
    /// A refresh produced a new token set that must be persisted.
    TokenUpdated(TokenSet),
    /// The provider reported the grant itself as revoked.
    TokenDeauthorized,
    /// Auth material was rejected and could not be refreshed.
    InvalidAuth,
}

/// Receives credential lifecycle events.
///
/// Implemented by the module manager (persist / deauthorize / invalidate)
/// and by [`CredentialSync`] for requesters wired directly to the store.
#[async_trait]
pub trait AuthObserver: Send + Sync {
    async fn on_token_updated(&self, tokens: &TokenSet) -> Result<(), Error>;
    async fn on_deauthorized(&self) -> Result<(), Error>;
    async fn on_invalid_auth(&self) -> Result<(), Error>;

    /// Dispatches an event to the matching handler.
    async fn notify(&self, event: &AuthEvent) -> Result<(), Error> {
        match event {
            AuthEvent::TokenUpdated(tokens) => self.on_token_updated(tokens).await,
            AuthEvent::TokenDeauthorized => self.on_deauthorized().await,
            AuthEvent::InvalidAuth => self.on_invalid_auth().await,
        }
    }
}

/// Store-backed observer scoped to one credential lookup key.
///
/// Token updates and invalidations require *exactly one* matching
/// credential - zero or multiple matches indicate data corruption and are
/// raised, never patched over. Deauthorization is the one exception: it is
/// cleanup and must succeed (idempotently) even over corrupt data, so it
/// removes every match.
pub struct CredentialSync {
    store: Arc<CredentialStore>,
    user_id: String,
    provider: String,
    external_id: Option<String>,
}

impl CredentialSync {
    pub fn new(
        store: Arc<CredentialStore>,
        user_id: impl Into<String>,
        provider: impl Into<String>,
        external_id: Option<String>,
    ) -> Self {
        Self {
            store,
            user_id: user_id.into(),
            provider: provider.into(),
            external_id,
        }
    }

    /// The single credential this observer is allowed to touch.
    fn matching_credential(&self) -> Result<CredentialRecord, Error> {
        let mut matches = self.store.find_credentials(
            &self.user_id,
            &self.provider,
            self.external_id.as_deref(),
        )?;
        match matches.len() {
            1 => Ok(matches.remove(0)),
            0 => Err(Error::CredentialNotFound {
                user_id: self.user_id.clone(),
                provider: self.provider.clone(),
            }),
            n => Err(Error::Conflict {
                kind: RecordKind::Credential,
                user_id: self.user_id.clone(),
                provider: self.provider.clone(),
                external_id: self.external_id.clone(),
                matches: n,
            }),
        }
    }
}

#[async_trait]
impl AuthObserver for CredentialSync {
    async fn on_token_updated(&self, tokens: &TokenSet) -> Result<(), Error> {
        let credential = self.matching_credential()?;
        self.store.update_credential_secrets(&credential.id, tokens)?;
        info!(
            user_id = %self.user_id,
            provider = %self.provider,
            credential_id = %credential.id,
            "Persisted refreshed tokens"
        );
        Ok(())
    }

    async fn on_deauthorized(&self) -> Result<(), Error> {
        let matches = self.store.find_credentials(
            &self.user_id,
            &self.provider,
            self.external_id.as_deref(),
        )?;
        for credential in &matches {
            self.store.delete_credential(&credential.id)?;
        }

        let entities = self.store.find_entities(
            &self.user_id,
            &self.provider,
            self.external_id.as_deref(),
        )?;
        for entity in &entities {
            if entity.credential_id.is_some() {
                self.store.link_entity_credential(&entity.id, None)?;
            }
        }

        info!(
            user_id = %self.user_id,
            provider = %self.provider,
            removed = matches.len(),
            "Deauthorized credential"
        );
        Ok(())
    }

    async fn on_invalid_auth(&self) -> Result<(), Error> {
        let credential = self.matching_credential()?;
        self.store.set_credential_validity(&credential.id, false)?;
        info!(
            user_id = %self.user_id,
            provider = %self.provider,
            credential_id = %credential.id,
            "Marked credential invalid"
        );
        Ok(())
    }
}

/// Observer for requesters that have no stored credential yet (identity
/// probes during authorization). Events are logged and dropped.
pub struct DiscardObserver;

#[async_trait]
impl AuthObserver for DiscardObserver {
    async fn on_token_updated(&self, _tokens: &TokenSet) -> Result<(), Error> {
        debug!("Discarding token-updated event (no credential bound)");
        Ok(())
    }

    async fn on_deauthorized(&self) -> Result<(), Error> {
        debug!("Discarding deauthorized event (no credential bound)");
        Ok(())
    }

    async fn on_invalid_auth(&self) -> Result<(), Error> {
        debug!("Discarding invalid-auth event (no credential bound)");
        Ok(())
    }
}
