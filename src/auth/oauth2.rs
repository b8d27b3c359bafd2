//! OAuth 2.0 authorization-code strategy.
//!
//! Builds the provider consent URL, exchanges authorization codes for
//! tokens, and runs refresh-token grants. Client credentials ride either in
//! the form body or in a Basic authorization header, depending on the
//! provider.

use super::grant::{self, GrantFailure};
use super::TokenSet;
use crate::error::{Error, FetchError, RefreshError};
use serde::{Deserialize, Serialize};

/// How the client id/secret are presented to the token endpoint.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientCredentialStyle {
    /// `client_id` / `client_secret` fields in the form body.
    #[default]
    BodyFields,
    /// `Authorization: Basic base64(client_id:client_secret)` header.
    BasicHeader,
}

/// OAuth 2.0 endpoints and client registration for one provider.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OAuth2Config {
    /// Authorization (consent) endpoint URL.
    pub auth_url: String,

    /// Token exchange endpoint URL.
    pub token_url: String,

    /// Requested scopes, joined with spaces on the consent URL.
    #[serde(default)]
    pub scopes: Vec<String>,

    /// Client ID from the provider app registration.
    pub client_id: String,

    /// Client secret. Never logged.
    pub client_secret: String,

    /// Redirect URI registered with the provider.
    pub redirect_uri: String,

    /// Where client credentials go on token endpoint calls.
    #[serde(default)]
    pub credential_style: ClientCredentialStyle,
}

#[derive(Clone)]
pub struct OAuth2Strategy {
    http: reqwest::Client,
    config: OAuth2Config,
}

impl std::fmt::Debug for OAuth2Strategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Skips the config so the client secret can never end up in logs.
        f.debug_struct("OAuth2Strategy")
            .field("auth_url", &self.config.auth_url)
            .field("token_url", &self.config.token_url)
            .field("client_id", &self.config.client_id)
            .finish_non_exhaustive()
    }
}

impl OAuth2Strategy {
    pub fn new(config: OAuth2Config) -> Self {
        Self {
            http: reqwest::Client::new(),
            config,
        }
    }

    pub fn config(&self) -> &OAuth2Config {
        &self.config
    }

    /// Builds the consent URL, percent-encoding every parameter.
    pub fn authorization_uri(&self, state: Option<&str>) -> String {
        let scopes = self.config.scopes.join(" ");
        let mut url = format!(
            "{}?client_id={}&redirect_uri={}&scope={}&response_type=code",
            self.config.auth_url,
            urlencoding::encode(&self.config.client_id),
            urlencoding::encode(&self.config.redirect_uri),
            urlencoding::encode(&scopes),
        );
        if let Some(state) = state {
            url.push_str("&state=");
            url.push_str(&urlencoding::encode(state));
        }
        url
    }

    /// Exchanges an authorization code for a token set.
    pub async fn exchange_code(&self, code: &str) -> Result<TokenSet, Error> {
        let form = self.grant_form(&[
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", &self.config.redirect_uri),
        ]);

        grant::request_token(&self.http, &self.config.token_url, &form, self.basic_auth())
            .await
            .map_err(|failure| self.exchange_failure(failure))
    }

    /// Runs the refresh-token grant. Failures surface as [`RefreshError`]
    /// so the requester can translate them into invalid-auth (or
    /// deauthorized, for `invalid_grant`).
    pub async fn refresh_grant(&self, refresh_token: &str) -> Result<TokenSet, Error> {
        let form = self.grant_form(&[
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
        ]);

        grant::request_token(&self.http, &self.config.token_url, &form, self.basic_auth())
            .await
            .map_err(|failure| refresh_failure(failure))
    }

    /// Form fields for a grant, with client credentials appended when the
    /// provider expects them in the body.
    fn grant_form<'a>(&'a self, base: &[(&'a str, &'a str)]) -> Vec<(&'a str, &'a str)> {
        let mut form: Vec<(&str, &str)> = base.to_vec();
        if self.config.credential_style == ClientCredentialStyle::BodyFields {
            form.push(("client_id", &self.config.client_id));
            form.push(("client_secret", &self.config.client_secret));
        }
        form
    }

    fn basic_auth(&self) -> Option<(&str, &str)> {
        match self.config.credential_style {
            ClientCredentialStyle::BasicHeader => {
                Some((&self.config.client_id, &self.config.client_secret))
            }
            ClientCredentialStyle::BodyFields => None,
        }
    }

    fn exchange_failure(&self, failure: GrantFailure) -> Error {
        match failure {
            GrantFailure::Endpoint { status, body, .. } => FetchError {
                resource: self.config.token_url.clone(),
                method: "POST".to_string(),
                status: Some(status),
                body,
            }
            .into(),
            GrantFailure::Transport(source) => Error::Transport {
                resource: self.config.token_url.clone(),
                source,
            },
            GrantFailure::Malformed(detail) => Error::validation(detail),
        }
    }
}

/// Maps a grant failure into [`RefreshError`], preserving the OAuth error
/// code for revocation detection.
pub(super) fn refresh_failure(failure: GrantFailure) -> Error {
    match failure {
        GrantFailure::Endpoint { status, code, body } => {
            RefreshError::new(Some(status), code, body).into()
        }
        GrantFailure::Transport(source) => {
            RefreshError::new(None, None, source.to_string()).into()
        }
        GrantFailure::Malformed(detail) => RefreshError::new(None, None, detail).into(),
    }
}
