//! Static API-key strategy.
//!
//! Stateless: the key submitted at authorization time is the working token,
//! injected on every request either as a bearer credential or under a
//! provider-specific header. There are no refresh semantics - a rejected
//! key escalates straight to invalid-auth.

use serde::{Deserialize, Serialize};

/// Where the key goes on outbound requests.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApiKeyHeader {
    /// `Authorization: Bearer <key>`.
    #[default]
    Bearer,
    /// Custom header carrying the bare key, e.g. `X-API-Key`.
    Custom(String),
}

#[derive(Clone, Debug)]
pub struct ApiKeyStrategy {
    header: ApiKeyHeader,
}

impl ApiKeyStrategy {
    pub fn new(header: ApiKeyHeader) -> Self {
        Self { header }
    }

    /// Header name/value pair carrying the key.
    pub fn header_pair(&self, key: &str) -> (String, String) {
        match &self.header {
            ApiKeyHeader::Bearer => ("Authorization".to_string(), format!("Bearer {}", key)),
            ApiKeyHeader::Custom(name) => (name.clone(), key.to_string()),
        }
    }
}
