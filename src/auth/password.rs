//! Password (resource-owner credentials) strategy.
//!
//! Exchanges a username/password pair for an access/refresh token pair via
//! the provider token endpoint. Refresh behaves exactly like OAuth2.

use super::grant::{self, GrantFailure};
use super::oauth2::refresh_failure;
use super::TokenSet;
use crate::error::{Error, FetchError};
use serde::{Deserialize, Serialize};

/// Token endpoint and optional client registration for a password-grant
/// provider.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PasswordConfig {
    /// Token endpoint URL.
    pub token_url: String,

    /// Client ID, when the provider requires one on the grant.
    #[serde(default)]
    pub client_id: Option<String>,
}

#[derive(Clone, Debug)]
pub struct PasswordStrategy {
    http: reqwest::Client,
    config: PasswordConfig,
}

impl PasswordStrategy {
    pub fn new(config: PasswordConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            config,
        }
    }

    /// Exchanges username+password for a token set.
    pub async fn password_grant(&self, username: &str, password: &str) -> Result<TokenSet, Error> {
        let mut form: Vec<(&str, &str)> = vec![
            ("grant_type", "password"),
            ("username", username),
            ("password", password),
        ];
        if let Some(client_id) = &self.config.client_id {
            form.push(("client_id", client_id));
        }

        grant::request_token(&self.http, &self.config.token_url, &form, None)
            .await
            .map_err(|failure| match failure {
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
            })
    }

    /// Refresh-token grant; same contract as the OAuth2 strategy.
    pub async fn refresh_grant(&self, refresh_token: &str) -> Result<TokenSet, Error> {
        let mut form: Vec<(&str, &str)> = vec![
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
        ];
        if let Some(client_id) = &self.config.client_id {
            form.push(("client_id", client_id));
        }

        grant::request_token(&self.http, &self.config.token_url, &form, None)
            .await
            .map_err(refresh_failure)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;

    #[tokio::test]
    async fn password_grant_posts_credentials_as_form() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/token")
            .match_body(Matcher::AllOf(vec![
                Matcher::UrlEncoded("grant_type".into(), "password".into()),
                Matcher::UrlEncoded("username".into(), "alice".into()),
                Matcher::UrlEncoded("password".into(), "hunter2".into()),
                Matcher::UrlEncoded("client_id".into(), "cid".into()),
            ]))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"access_token":"t1","refresh_token":"r1"}"#)
            .create_async()
            .await;

        let strategy = PasswordStrategy::new(PasswordConfig {
            token_url: format!("{}/token", server.url()),
            client_id: Some("cid".to_string()),
        });

        let tokens = strategy.password_grant("alice", "hunter2").await.unwrap();
        assert_eq!(tokens.access_token, "t1");
        assert_eq!(tokens.refresh_token, Some("r1".to_string()));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn rejected_credentials_surface_the_status() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/token")
            .with_status(401)
            .with_body(r#"{"error":"invalid_client"}"#)
            .create_async()
            .await;

        let strategy = PasswordStrategy::new(PasswordConfig {
            token_url: format!("{}/token", server.url()),
            client_id: None,
        });

        match strategy.password_grant("alice", "wrong").await {
            Err(Error::Fetch(fetch)) => assert_eq!(fetch.status, Some(401)),
            other => panic!("expected fetch error, got {:?}", other),
        }
        mock.assert_async().await;
    }
}
