//! Pluggable auth strategies for provider integrations.
//!
//! A single [`AuthStrategy`] value (tagged union) covers the three ways
//! providers authenticate - OAuth 2.0 authorization-code, static API key,
//! and password grant - so the requester and manager are written once and
//! parameterized per provider instead of subclassed per auth type.
//!
//! Strategies own the *mechanics* of obtaining and refreshing tokens. They
//! never touch persistence: acquired tokens are returned to the caller and
//! refreshed tokens are written into the requester's in-memory
//! [`AuthSession`]; durable storage is the manager's job.

mod grant;

pub mod api_key;
pub mod oauth2;
pub mod password;

pub use api_key::{ApiKeyHeader, ApiKeyStrategy};
pub use oauth2::{ClientCredentialStyle, OAuth2Config, OAuth2Strategy};
pub use password::{PasswordConfig, PasswordStrategy};

use crate::error::{Error, RefreshError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

/// Which auth mechanism a provider uses.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthKind {
    #[serde(rename = "oauth2")]
    OAuth2,
    ApiKey,
    Password,
}

impl std::fmt::Display for AuthKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuthKind::OAuth2 => write!(f, "oauth2"),
            AuthKind::ApiKey => write!(f, "api_key"),
            AuthKind::Password => write!(f, "password"),
        }
    }
}

/// A bundle of secrets for one external account.
///
/// This is the provider-defined shape persisted (encrypted) on a credential
/// record: access token, optional refresh token, expiry, plus any extra
/// fields the token endpoint returned (instance URLs, granted scopes, ...).
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct TokenSet {
    /// Working secret sent on API requests (access token or API key).
    pub access_token: String,

    /// Refresh token, when the grant produced one.
    #[serde(default)]
    pub refresh_token: Option<String>,

    /// When the access token expires (UTC).
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,

    /// Additional provider fields from the token response, kept opaque.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub extra: Map<String, Value>,
}

impl TokenSet {
    /// Token set holding a single non-expiring secret (API keys).
    pub fn from_access_token(token: impl Into<String>) -> Self {
        Self {
            access_token: token.into(),
            refresh_token: None,
            expires_at: None,
            extra: Map::new(),
        }
    }
}

/// Live working tokens for one requester instance.
///
/// Transient - never persisted, never shared between requesters. The
/// `generation` counter increments on every applied refresh so concurrent
/// callers can tell whether the token they saw fail has already been
/// replaced by someone else's refresh.
#[derive(Clone, Debug)]
pub struct AuthSession {
    access_token: Option<String>,
    refresh_token: Option<String>,
    expires_at: Option<DateTime<Utc>>,
    generation: u64,
}

impl AuthSession {
    pub fn new(tokens: &TokenSet) -> Self {
        Self {
            access_token: Some(tokens.access_token.clone()),
            refresh_token: tokens.refresh_token.clone(),
            expires_at: tokens.expires_at,
            generation: 0,
        }
    }

    pub fn access_token(&self) -> Option<&str> {
        self.access_token.as_deref()
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.expires_at
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Removes and returns the refresh token.
    ///
    /// Refresh grants take the token out of the session *before* the network
    /// call, so a failed grant can never be retried with the same token.
    pub fn take_refresh_token(&mut self) -> Option<String> {
        self.refresh_token.take()
    }

    /// Installs a freshly-acquired token set and bumps the generation.
    pub fn apply(&mut self, tokens: &TokenSet) {
        self.access_token = Some(tokens.access_token.clone());
        self.refresh_token = tokens.refresh_token.clone();
        self.expires_at = tokens.expires_at;
        self.generation += 1;
    }
}

/// Authorization callback payload, from a browser redirect or a submitted
/// credential form: `{ "data": { "code": ..., "api_key": ..., ... } }`.
///
/// The shape varies per strategy; each strategy extracts only the fields it
/// declares required.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct CallbackData {
    #[serde(default)]
    pub data: Map<String, Value>,
}

impl CallbackData {
    pub fn field(&self, name: &str) -> Option<&str> {
        self.data.get(name).and_then(Value::as_str)
    }

    /// Returns the named field or an [`Error::Validation`] naming it.
    pub fn require(&self, name: &str) -> Result<&str, Error> {
        self.field(name)
            .filter(|value| !value.is_empty())
            .ok_or_else(|| Error::validation(format!("missing required field '{}'", name)))
    }
}

/// How a caller should prompt the user for credentials.
///
/// OAuth providers yield a consent URL to redirect to; API-key and password
/// providers yield a JSON-schema form description instead.
#[derive(Clone, Debug, Serialize)]
pub struct AuthorizationRequirements {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(rename = "type")]
    pub kind: AuthKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// Auth mechanics for one provider.
#[derive(Clone, Debug)]
pub enum AuthStrategy {
    OAuth2(OAuth2Strategy),
    ApiKey(ApiKeyStrategy),
    Password(PasswordStrategy),
}

impl AuthStrategy {
    pub fn kind(&self) -> AuthKind {
        match self {
            AuthStrategy::OAuth2(_) => AuthKind::OAuth2,
            AuthStrategy::ApiKey(_) => AuthKind::ApiKey,
            AuthStrategy::Password(_) => AuthKind::Password,
        }
    }

    /// Whether this strategy can recover from an expired token at all.
    /// API keys cannot - their failures escalate directly to invalid-auth.
    pub fn is_refreshable(&self) -> bool {
        !matches!(self, AuthStrategy::ApiKey(_))
    }

    /// Appends the auth header for the session's working token.
    pub fn apply_headers(
        &self,
        session: &AuthSession,
        headers: &mut Vec<(String, String)>,
    ) -> Result<(), Error> {
        let token = session
            .access_token()
            .ok_or_else(|| Error::validation("auth session holds no working token"))?;
        let (name, value) = match self {
            AuthStrategy::OAuth2(_) | AuthStrategy::Password(_) => {
                ("Authorization".to_string(), format!("Bearer {}", token))
            }
            AuthStrategy::ApiKey(strategy) => strategy.header_pair(token),
        };
        headers.push((name, value));
        Ok(())
    }

    /// Describes how to prompt for credentials. Pure - no side effects.
    pub fn authorization_requirements(&self, state: Option<&str>) -> AuthorizationRequirements {
        match self {
            AuthStrategy::OAuth2(strategy) => AuthorizationRequirements {
                url: Some(strategy.authorization_uri(state)),
                kind: AuthKind::OAuth2,
                data: None,
            },
            AuthStrategy::ApiKey(_) => AuthorizationRequirements {
                url: None,
                kind: AuthKind::ApiKey,
                data: Some(json!({
                    "type": "object",
                    "required": ["api_key"],
                    "properties": {
                        "api_key": { "type": "string", "title": "API key" }
                    }
                })),
            },
            AuthStrategy::Password(_) => AuthorizationRequirements {
                url: None,
                kind: AuthKind::Password,
                data: Some(json!({
                    "type": "object",
                    "required": ["username", "password"],
                    "properties": {
                        "username": { "type": "string", "title": "Username" },
                        "password": { "type": "string", "title": "Password", "format": "password" }
                    }
                })),
            },
        }
    }

    /// Obtains a token set from the authorization callback payload
    /// (authorization code, submitted API key, or username/password).
    pub async fn acquire(&self, params: &CallbackData) -> Result<TokenSet, Error> {
        match self {
            AuthStrategy::OAuth2(strategy) => {
                let code = params.require("code")?;
                strategy.exchange_code(code).await
            }
            AuthStrategy::ApiKey(_) => {
                let key = params.require("api_key")?;
                Ok(TokenSet::from_access_token(key))
            }
            AuthStrategy::Password(strategy) => {
                let username = params.require("username")?;
                let password = params.require("password")?;
                strategy.password_grant(username, password).await
            }
        }
    }

    /// Performs the refresh grant against the session's refresh token and
    /// installs the result into the session.
    ///
    /// The refresh token is consumed up front; a failed grant leaves the
    /// session without one, so the same token is never presented twice.
    /// Providers that do not rotate refresh tokens keep the consumed one.
    pub async fn refresh(&self, session: &mut AuthSession) -> Result<TokenSet, Error> {
        let no_token = || RefreshError::new(None, None, "no refresh token available");

        let (result, consumed) = match self {
            AuthStrategy::ApiKey(_) => {
                return Err(
                    RefreshError::new(None, None, "api-key auth is not refreshable").into(),
                )
            }
            AuthStrategy::OAuth2(strategy) => {
                let token = session.take_refresh_token().ok_or_else(no_token)?;
                (strategy.refresh_grant(&token).await, token)
            }
            AuthStrategy::Password(strategy) => {
                let token = session.take_refresh_token().ok_or_else(no_token)?;
                (strategy.refresh_grant(&token).await, token)
            }
        };

        let mut tokens = result?;
        // Provider did not rotate: keep the token that just worked.
        if tokens.refresh_token.is_none() {
            tokens.refresh_token = Some(consumed);
        }
        session.apply(&tokens);
        Ok(tokens)
    }
}
