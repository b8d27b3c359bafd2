//! Module manager - binds one provider descriptor, auth strategy, and the
//! credential store for one local user.
//!
//! The manager drives the credential lifecycle: it describes how to prompt
//! for authorization, consumes the provider callback (acquiring tokens and
//! find-or-create reconciling Credential and Entity records), verifies
//! stored credentials, reacts to requester notifications, and deauthorizes.
//!
//! Find-or-create semantics are strict: zero matches create, one match is
//! reused, more than one is a data-integrity violation and is raised -
//! never resolved by picking the first.

use crate::auth::{
    AuthKind, AuthSession, AuthStrategy, AuthorizationRequirements, CallbackData, TokenSet,
};
use crate::error::{Error, RecordKind};
use crate::notify::{AuthEvent, AuthObserver, CredentialSync, DiscardObserver};
use crate::provider::{IdentitySource, ProviderDescriptor};
use crate::requester::{default_backoff_schedule, RequestOptions, Requester, DEFAULT_TIMEOUT};
use crate::store::{CredentialRecord, CredentialStore, EntityRecord};
use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};

/// HTTP behavior shared by all managers. The provider descriptor may
/// override the backoff schedule.
#[derive(Clone, Debug)]
pub struct HttpOptions {
    pub timeout: Duration,
    pub backoff: Vec<Duration>,
}

impl Default for HttpOptions {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            backoff: default_backoff_schedule(),
        }
    }
}

/// Lifecycle state of one (user, provider) integration, derived from store
/// contents rather than tracked separately.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IntegrationStatus {
    /// No credential stored.
    Unauthenticated,
    /// Credential stored and believed valid.
    Active,
    /// Credential stored but marked invalid (refresh or auth test failed).
    Invalid,
}

/// Result of a processed authorization callback.
#[derive(Clone, Debug, Serialize)]
pub struct AuthorizationOutcome {
    pub credential_id: String,
    pub entity_id: String,
    #[serde(rename = "type")]
    pub kind: AuthKind,
}

/// Orchestrates the credential lifecycle for one (user, provider) pair.
pub struct ModuleManager {
    descriptor: ProviderDescriptor,
    strategy: AuthStrategy,
    store: Arc<CredentialStore>,
    user_id: String,
    timeout: Duration,
    backoff: Vec<Duration>,
    /// External account id, pinned once known (after a callback or a
    /// credential load) so lookups stay scoped to one account.
    external_id: Mutex<Option<String>>,
    /// Live requester, rebuilt on authorization and cleared on deauthorize.
    requester: Mutex<Option<Arc<Requester>>>,
}

impl ModuleManager {
    pub fn new(
        descriptor: ProviderDescriptor,
        store: Arc<CredentialStore>,
        user_id: impl Into<String>,
        redirect_uri: &str,
        http: HttpOptions,
    ) -> Self {
        let strategy = descriptor.strategy(redirect_uri);
        let backoff = descriptor.backoff(&http.backoff);
        Self {
            descriptor,
            strategy,
            store,
            user_id: user_id.into(),
            timeout: http.timeout,
            backoff,
            external_id: Mutex::new(None),
            requester: Mutex::new(None),
        }
    }

    pub fn provider(&self) -> &str {
        &self.descriptor.name
    }

    pub fn kind(&self) -> AuthKind {
        self.strategy.kind()
    }

    /// Describes how the caller should prompt for credentials: a consent
    /// URL for OAuth providers (carrying `state` when given), a form schema
    /// otherwise. Pure - no store access, never fails.
    pub fn authorization_requirements(&self, state: Option<&str>) -> AuthorizationRequirements {
        self.strategy.authorization_requirements(state)
    }

    /// Consumes the provider's authorization callback.
    ///
    /// Drives the strategy to obtain tokens, resolves the external account
    /// identity, then find-or-create reconciles the Credential and Entity
    /// records and rebuilds the live requester.
    pub async fn process_authorization_callback(
        &self,
        params: &CallbackData,
    ) -> Result<AuthorizationOutcome, Error> {
        let tokens = self.strategy.acquire(params).await?;
        let (external_id, name) = self.resolve_identity(&tokens, params).await?;
        *self.external_id.lock().unwrap() = Some(external_id.clone());

        let credential = self.reconcile_credential(&external_id, &tokens)?;
        let entity = self.reconcile_entity(&external_id, name.as_deref(), &credential.id)?;
        self.install_requester(&tokens)?;

        info!(
            user_id = %self.user_id,
            provider = %self.descriptor.name,
            external_id = %external_id,
            credential_id = %credential.id,
            entity_id = %entity.id,
            "Authorization callback processed"
        );

        Ok(AuthorizationOutcome {
            credential_id: credential.id,
            entity_id: entity.id,
            kind: self.strategy.kind(),
        })
    }

    /// Issues one cheap authenticated call against the provider's probe
    /// endpoint. Returns validity as a boolean and never fails: auth
    /// failures flip `auth_is_valid` on the stored credential instead.
    pub async fn test_auth(&self) -> bool {
        match self.probe().await {
            Ok(()) => true,
            Err(err) => {
                debug!(
                    user_id = %self.user_id,
                    provider = %self.descriptor.name,
                    error = %err,
                    "Auth test failed"
                );
                if err.is_auth_failure() {
                    self.mark_invalid_best_effort();
                }
                false
            }
        }
    }

    /// Reacts to a requester-emitted lifecycle event.
    ///
    /// Token updates and invalidations require exactly one matching
    /// credential - zero or multiple matches are defects and are raised.
    pub async fn receive_notification(&self, event: AuthEvent) -> Result<(), Error> {
        match event {
            AuthEvent::TokenUpdated(tokens) => {
                self.credential_sync().on_token_updated(&tokens).await
            }
            AuthEvent::InvalidAuth => self.credential_sync().on_invalid_auth().await,
            AuthEvent::TokenDeauthorized => self.deauthorize().await,
        }
    }

    /// Clears the live requester, deletes matching credentials, and
    /// detaches entity references. Entities survive. Idempotent - repeated
    /// calls are safe no-ops.
    pub async fn deauthorize(&self) -> Result<(), Error> {
        *self.requester.lock().unwrap() = None;
        self.credential_sync().on_deauthorized().await
    }

    /// Lifecycle state derived from stored records.
    pub fn status(&self) -> Result<IntegrationStatus, Error> {
        let matches = self.store.find_credentials(
            &self.user_id,
            &self.descriptor.name,
            self.pinned_external_id().as_deref(),
        )?;
        Ok(if matches.is_empty() {
            IntegrationStatus::Unauthenticated
        } else if matches.iter().all(|credential| credential.auth_is_valid) {
            IntegrationStatus::Active
        } else {
            IntegrationStatus::Invalid
        })
    }

    /// Entities recorded for this integration.
    pub fn entities(&self) -> Result<Vec<EntityRecord>, Error> {
        Ok(self.store.find_entities(
            &self.user_id,
            &self.descriptor.name,
            self.pinned_external_id().as_deref(),
        )?)
    }

    /// The live requester, building one from the stored credential when
    /// none is cached. Requires exactly one matching credential.
    pub async fn requester(&self) -> Result<Arc<Requester>, Error> {
        if let Some(requester) = self.requester.lock().unwrap().clone() {
            return Ok(requester);
        }

        let credential = self.lookup_credential()?;
        *self.external_id.lock().unwrap() = Some(credential.external_id.clone());
        self.install_requester(&credential.secrets)
    }

    // -----------------------------------------------------------------------
    // Reconciliation
    // -----------------------------------------------------------------------

    fn reconcile_credential(
        &self,
        external_id: &str,
        tokens: &TokenSet,
    ) -> Result<CredentialRecord, Error> {
        let mut matches = self.store.find_credentials(
            &self.user_id,
            &self.descriptor.name,
            Some(external_id),
        )?;

        match matches.len() {
            0 => {
                let created = self.store.create_credential(
                    &self.user_id,
                    &self.descriptor.name,
                    external_id,
                    tokens,
                )?;
                debug!(credential_id = %created.id, "Created credential");
                Ok(created)
            }
            1 => {
                let mut existing = matches.remove(0);
                self.store.update_credential_secrets(&existing.id, tokens)?;
                existing.secrets = tokens.clone();
                existing.auth_is_valid = true;
                existing.expires_at = tokens.expires_at;
                debug!(credential_id = %existing.id, "Reusing credential");
                Ok(existing)
            }
            n => Err(Error::Conflict {
                kind: RecordKind::Credential,
                user_id: self.user_id.clone(),
                provider: self.descriptor.name.clone(),
                external_id: Some(external_id.to_string()),
                matches: n,
            }),
        }
    }

    fn reconcile_entity(
        &self,
        external_id: &str,
        name: Option<&str>,
        credential_id: &str,
    ) -> Result<EntityRecord, Error> {
        let mut matches =
            self.store
                .find_entities(&self.user_id, &self.descriptor.name, Some(external_id))?;

        match matches.len() {
            0 => {
                let created = self.store.create_entity(
                    &self.user_id,
                    &self.descriptor.name,
                    external_id,
                    name,
                    Some(credential_id),
                )?;
                debug!(entity_id = %created.id, "Created entity");
                Ok(created)
            }
            1 => {
                let mut existing = matches.remove(0);
                self.store
                    .link_entity_credential(&existing.id, Some(credential_id))?;
                existing.credential_id = Some(credential_id.to_string());
                if let Some(name) = name {
                    if existing.name.as_deref() != Some(name) {
                        self.store.update_entity_name(&existing.id, name)?;
                        existing.name = Some(name.to_string());
                    }
                }
                debug!(entity_id = %existing.id, "Reusing entity");
                Ok(existing)
            }
            n => Err(Error::Conflict {
                kind: RecordKind::Entity,
                user_id: self.user_id.clone(),
                provider: self.descriptor.name.clone(),
                external_id: Some(external_id.to_string()),
                matches: n,
            }),
        }
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    /// Resolves the external account identifier (and display name) for
    /// freshly-acquired tokens, per the provider descriptor.
    async fn resolve_identity(
        &self,
        tokens: &TokenSet,
        params: &CallbackData,
    ) -> Result<(String, Option<String>), Error> {
        match &self.descriptor.identity {
            IdentitySource::CallbackField { field } => {
                Ok((params.require(field)?.to_string(), None))
            }
            IdentitySource::Endpoint {
                path,
                id_pointer,
                name_pointer,
            } => {
                // No credential exists yet, so lifecycle events have nowhere
                // to land - probe with a discard observer.
                let requester = self.build_requester(tokens, Arc::new(DiscardObserver))?;
                let body = requester
                    .request(&self.descriptor.endpoint(path), RequestOptions::get())
                    .await?;
                let external_id = pointer_string(&body, id_pointer).ok_or_else(|| {
                    Error::validation(format!(
                        "identity response has no usable value at '{}'",
                        id_pointer
                    ))
                })?;
                let name = name_pointer
                    .as_ref()
                    .and_then(|pointer| pointer_string(&body, pointer));
                Ok((external_id, name))
            }
        }
    }

    async fn probe(&self) -> Result<(), Error> {
        let requester = self.requester().await?;
        requester
            .request_raw(
                &self.descriptor.endpoint(&self.descriptor.probe_path),
                RequestOptions::get(),
            )
            .await?;
        Ok(())
    }

    /// Best-effort `auth_is_valid = false` write-back; the requester's
    /// observer has usually done this already.
    fn mark_invalid_best_effort(&self) {
        match self.lookup_credential() {
            Ok(credential) => {
                if let Err(err) = self.store.set_credential_validity(&credential.id, false) {
                    warn!(
                        provider = %self.descriptor.name,
                        error = %err,
                        "Failed to mark credential invalid"
                    );
                }
            }
            Err(err) => debug!(
                provider = %self.descriptor.name,
                error = %err,
                "Skipping invalid-auth write-back"
            ),
        }
    }

    /// The single credential this manager operates on.
    fn lookup_credential(&self) -> Result<CredentialRecord, Error> {
        let external_id = self.pinned_external_id();
        let mut matches = self.store.find_credentials(
            &self.user_id,
            &self.descriptor.name,
            external_id.as_deref(),
        )?;
        match matches.len() {
            1 => Ok(matches.remove(0)),
            0 => Err(Error::CredentialNotFound {
                user_id: self.user_id.clone(),
                provider: self.descriptor.name.clone(),
            }),
            n => Err(Error::Conflict {
                kind: RecordKind::Credential,
                user_id: self.user_id.clone(),
                provider: self.descriptor.name.clone(),
                external_id,
                matches: n,
            }),
        }
    }

    fn pinned_external_id(&self) -> Option<String> {
        self.external_id.lock().unwrap().clone()
    }

    fn credential_sync(&self) -> CredentialSync {
        CredentialSync::new(
            Arc::clone(&self.store),
            self.user_id.clone(),
            self.descriptor.name.clone(),
            self.pinned_external_id(),
        )
    }

    fn build_requester(
        &self,
        tokens: &TokenSet,
        observer: Arc<dyn AuthObserver>,
    ) -> Result<Requester, Error> {
        Requester::with_options(
            self.strategy.clone(),
            AuthSession::new(tokens),
            observer,
            self.timeout,
            self.backoff.clone(),
        )
    }

    fn install_requester(&self, tokens: &TokenSet) -> Result<Arc<Requester>, Error> {
        let observer = Arc::new(self.credential_sync());
        let requester = Arc::new(self.build_requester(tokens, observer)?);
        *self.requester.lock().unwrap() = Some(Arc::clone(&requester));
        Ok(requester)
    }
}

/// Managers receive requester events directly when wired as observers.
#[async_trait]
impl AuthObserver for ModuleManager {
    async fn on_token_updated(&self, tokens: &TokenSet) -> Result<(), Error> {
        self.receive_notification(AuthEvent::TokenUpdated(tokens.clone()))
            .await
    }

    async fn on_deauthorized(&self) -> Result<(), Error> {
        self.receive_notification(AuthEvent::TokenDeauthorized).await
    }

    async fn on_invalid_auth(&self) -> Result<(), Error> {
        self.receive_notification(AuthEvent::InvalidAuth).await
    }
}

/// Reads a string out of a JSON body at `pointer`, accepting numeric ids.
fn pointer_string(body: &Value, pointer: &str) -> Option<String> {
    match body.pointer(pointer)? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}
