//! Provider descriptor table.
//!
//! One parameterized core serves every provider; what varies per provider
//! lives here as configuration: auth endpoints and client registration,
//! where the external account identity comes from, which endpoint is cheap
//! enough to probe for `test_auth`, and an optional rate-limit backoff
//! override. Descriptors are declared in the config file - constructors
//! never reach into the process environment.

use crate::auth::{
    ApiKeyHeader, ApiKeyStrategy, AuthKind, AuthStrategy, ClientCredentialStyle, OAuth2Config,
    OAuth2Strategy, PasswordConfig, PasswordStrategy,
};
use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Auth mechanism and registration for one provider.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProviderAuth {
    #[serde(rename = "oauth2")]
    OAuth2 {
        auth_url: String,
        token_url: String,
        #[serde(default)]
        scopes: Vec<String>,
        client_id: String,
        client_secret: String,
        #[serde(default)]
        credential_style: ClientCredentialStyle,
    },
    ApiKey {
        #[serde(default)]
        header: ApiKeyHeader,
    },
    Password {
        token_url: String,
        #[serde(default)]
        client_id: Option<String>,
    },
}

/// Where the external account identifier comes from during authorization.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum IdentitySource {
    /// Probe an authenticated endpoint with the fresh token and read the
    /// account id (and optionally a display name) via JSON pointers.
    Endpoint {
        path: String,
        id_pointer: String,
        #[serde(default)]
        name_pointer: Option<String>,
    },
    /// Take the account id from a declared callback/form field
    /// (e.g. `subdomain` for providers without an identity endpoint).
    CallbackField { field: String },
}

/// Everything the core needs to know about one provider.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProviderDescriptor {
    /// Lowercase identifier used in routes and storage keys.
    pub name: String,

    /// Human-readable name shown in integration listings.
    pub display_name: String,

    /// API base URL; paths from this descriptor are joined onto it.
    pub base_url: String,

    pub auth: ProviderAuth,

    pub identity: IdentitySource,

    /// Cheap authenticated endpoint used to verify stored credentials.
    pub probe_path: String,

    /// Rate-limit backoff override in seconds; the global schedule applies
    /// when absent.
    #[serde(default)]
    pub backoff_schedule: Option<Vec<u64>>,
}

impl ProviderDescriptor {
    pub fn kind(&self) -> AuthKind {
        match self.auth {
            ProviderAuth::OAuth2 { .. } => AuthKind::OAuth2,
            ProviderAuth::ApiKey { .. } => AuthKind::ApiKey,
            ProviderAuth::Password { .. } => AuthKind::Password,
        }
    }

    /// Builds the concrete auth strategy for this provider.
    ///
    /// `redirect_uri` is the OAuth callback URL this deployment answers on;
    /// unused by the other auth kinds.
    pub fn strategy(&self, redirect_uri: &str) -> AuthStrategy {
        match &self.auth {
            ProviderAuth::OAuth2 {
                auth_url,
                token_url,
                scopes,
                client_id,
                client_secret,
                credential_style,
            } => AuthStrategy::OAuth2(OAuth2Strategy::new(OAuth2Config {
                auth_url: auth_url.clone(),
                token_url: token_url.clone(),
                scopes: scopes.clone(),
                client_id: client_id.clone(),
                client_secret: client_secret.clone(),
                redirect_uri: redirect_uri.to_string(),
                credential_style: *credential_style,
            })),
            ProviderAuth::ApiKey { header } => {
                AuthStrategy::ApiKey(ApiKeyStrategy::new(header.clone()))
            }
            ProviderAuth::Password {
                token_url,
                client_id,
            } => AuthStrategy::Password(PasswordStrategy::new(PasswordConfig {
                token_url: token_url.clone(),
                client_id: client_id.clone(),
            })),
        }
    }

    /// Joins a path onto the provider base URL.
    pub fn endpoint(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }

    /// Backoff schedule for this provider, or the given default.
    pub fn backoff(&self, default: &[Duration]) -> Vec<Duration> {
        match &self.backoff_schedule {
            Some(seconds) => seconds.iter().map(|s| Duration::from_secs(*s)).collect(),
            None => default.to_vec(),
        }
    }
}

/// Lookup table of configured providers.
pub struct ProviderRegistry {
    providers: HashMap<String, ProviderDescriptor>,
}

impl ProviderRegistry {
    /// Builds a registry, rejecting duplicate provider names.
    pub fn new(descriptors: Vec<ProviderDescriptor>) -> Result<Self> {
        let mut providers = HashMap::new();
        for descriptor in descriptors {
            let name = descriptor.name.clone();
            if providers.insert(name.clone(), descriptor).is_some() {
                bail!("Duplicate provider descriptor '{}'", name);
            }
        }
        Ok(Self { providers })
    }

    pub fn get(&self, name: &str) -> Option<&ProviderDescriptor> {
        self.providers.get(name)
    }

    /// Provider names in stable (sorted) order, for listings.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.providers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Descriptors in stable (sorted-by-name) order, for listings.
    pub fn descriptors(&self) -> Vec<&ProviderDescriptor> {
        let mut descriptors: Vec<&ProviderDescriptor> = self.providers.values().collect();
        descriptors.sort_unstable_by(|a, b| a.name.cmp(&b.name));
        descriptors
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn oauth_descriptor(name: &str) -> ProviderDescriptor {
        ProviderDescriptor {
            name: name.to_string(),
            display_name: "Test Provider".to_string(),
            base_url: "https://api.example.com/".to_string(),
            auth: ProviderAuth::OAuth2 {
                auth_url: "https://example.com/oauth/authorize".to_string(),
                token_url: "https://example.com/oauth/token".to_string(),
                scopes: vec!["read".to_string()],
                client_id: "cid".to_string(),
                client_secret: "secret".to_string(),
                credential_style: ClientCredentialStyle::BodyFields,
            },
            identity: IdentitySource::Endpoint {
                path: "/me".to_string(),
                id_pointer: "/id".to_string(),
                name_pointer: Some("/login".to_string()),
            },
            probe_path: "/me".to_string(),
            backoff_schedule: None,
        }
    }

    #[test]
    fn descriptor_from_toml() {
        let toml = r#"
            name = "clubhouse"
            display_name = "Clubhouse"
            base_url = "https://api.clubhouse.example"
            probe_path = "/v1/account"

            [auth]
            type = "api_key"
            header = { custom = "X-API-Key" }

            [identity]
            source = "callback_field"
            field = "subdomain"
        "#;
        let descriptor: ProviderDescriptor = toml::from_str(toml).unwrap();
        assert_eq!(descriptor.name, "clubhouse");
        assert_eq!(descriptor.kind(), AuthKind::ApiKey);
        assert!(matches!(
            descriptor.identity,
            IdentitySource::CallbackField { ref field } if field == "subdomain"
        ));
    }

    #[test]
    fn oauth_descriptor_from_toml_with_backoff_override() {
        let toml = r#"
            name = "github"
            display_name = "GitHub"
            base_url = "https://api.github.com"
            probe_path = "/user"
            backoff_schedule = [1, 3]

            [auth]
            type = "oauth2"
            auth_url = "https://github.com/login/oauth/authorize"
            token_url = "https://github.com/login/oauth/access_token"
            scopes = ["repo", "read:user"]
            client_id = "cid"
            client_secret = "secret"

            [identity]
            source = "endpoint"
            path = "/user"
            id_pointer = "/id"
            name_pointer = "/login"
        "#;
        let descriptor: ProviderDescriptor = toml::from_str(toml).unwrap();
        assert_eq!(descriptor.kind(), AuthKind::OAuth2);

        let backoff = descriptor.backoff(&[Duration::from_secs(9)]);
        assert_eq!(backoff, vec![Duration::from_secs(1), Duration::from_secs(3)]);

        let default = oauth_descriptor("x").backoff(&[Duration::from_secs(9)]);
        assert_eq!(default, vec![Duration::from_secs(9)]);
    }

    #[test]
    fn endpoint_joins_without_duplicate_slashes() {
        let descriptor = oauth_descriptor("github");
        assert_eq!(descriptor.endpoint("/me"), "https://api.example.com/me");
        assert_eq!(descriptor.endpoint("me"), "https://api.example.com/me");
    }

    #[test]
    fn strategy_matches_auth_kind() {
        let descriptor = oauth_descriptor("github");
        let strategy = descriptor.strategy("http://localhost:3000/callback");
        assert_eq!(strategy.kind(), AuthKind::OAuth2);
        assert!(strategy.is_refreshable());
    }

    #[test]
    fn registry_rejects_duplicates() {
        let result =
            ProviderRegistry::new(vec![oauth_descriptor("github"), oauth_descriptor("github")]);
        assert!(result.is_err());

        let registry =
            ProviderRegistry::new(vec![oauth_descriptor("github"), oauth_descriptor("gitlab")])
                .unwrap();
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.names(), vec!["github", "gitlab"]);
        assert!(registry.get("github").is_some());
        assert!(registry.get("bitbucket").is_none());
    }
}
