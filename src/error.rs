//! Error taxonomy for the integration core.
//!
//! Callers need to tell apart unrecoverable HTTP failures, failed token
//! refreshes, reconciliation ambiguity, and plain misuse - each gets its own
//! variant instead of an opaque string.

use thiserror::Error;

/// A non-2xx HTTP response from a provider, carrying enough context to
/// diagnose without leaking secrets (resource URL and status, never headers
/// or tokens).
#[derive(Debug, Error)]
pub struct FetchError {
    /// Target URL of the failed request.
    pub resource: String,
    /// HTTP method as sent.
    pub method: String,
    /// Response status, or `None` when the request timed out.
    pub status: Option<u16>,
    /// Raw response body (truncated by the requester, may be empty).
    pub body: String,
}

impl std::fmt::Display for FetchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {} failed", self.method, self.resource)?;
        match self.status {
            Some(status) => write!(f, " with status {}", status)?,
            None => write!(f, " (timed out)")?,
        }
        if !self.body.is_empty() {
            write!(f, ": {}", self.body)?;
        }
        Ok(())
    }
}

/// A failed refresh-token / password re-grant attempt.
///
/// Carries the OAuth error code when the token endpoint supplied one, so the
/// requester can distinguish an explicitly revoked grant (`invalid_grant`)
/// from a transient failure.
#[derive(Debug, Error)]
pub struct RefreshError {
    /// HTTP status of the token endpoint response, if one was received.
    pub status: Option<u16>,
    /// OAuth error code from the response body (`invalid_grant`, ...).
    pub code: Option<String>,
    /// Human-readable detail.
    pub message: String,
}

impl std::fmt::Display for RefreshError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "token refresh failed")?;
        if let Some(code) = &self.code {
            write!(f, " ({})", code)?;
        }
        write!(f, ": {}", self.message)
    }
}

impl RefreshError {
    pub fn new(status: Option<u16>, code: Option<String>, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
        }
    }

    /// True when the provider reported the grant itself as revoked, which is
    /// a deauthorization signal rather than an ordinary auth failure.
    pub fn is_revoked(&self) -> bool {
        self.code.as_deref() == Some("invalid_grant")
    }
}

/// Record kinds subject to find-or-create reconciliation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordKind {
    Credential,
    Entity,
}

impl std::fmt::Display for RecordKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RecordKind::Credential => write!(f, "credential"),
            RecordKind::Entity => write!(f, "entity"),
        }
    }
}

/// Errors surfaced by the credential lifecycle core.
#[derive(Debug, Error)]
pub enum Error {
    /// Unrecoverable HTTP failure (4xx other than a refreshable 401, or
    /// 401/5xx after the single refresh attempt was exhausted).
    #[error(transparent)]
    Fetch(#[from] FetchError),

    /// Token refresh or re-grant failed.
    #[error(transparent)]
    Refresh(#[from] RefreshError),

    /// Find-or-create found more than one record for a supposedly-unique
    /// key. Never auto-resolved.
    #[error("{matches} {kind} records match user '{user_id}' provider '{provider}' (external id {external_id:?}), expected at most one")]
    Conflict {
        kind: RecordKind,
        user_id: String,
        provider: String,
        external_id: Option<String>,
        matches: usize,
    },

    /// A required constructor or callback parameter is missing or malformed.
    #[error("validation failed: {0}")]
    Validation(String),

    /// No stored credential matches the lookup key where exactly one was
    /// required.
    #[error("no credential found for user '{user_id}' provider '{provider}'")]
    CredentialNotFound { user_id: String, provider: String },

    /// Network-level failure before any HTTP status was produced (DNS,
    /// connection refused). Timeouts are reported as [`FetchError`] with no
    /// status instead, since they take the refresh-eligible path.
    #[error("request to {resource} failed: {source}")]
    Transport {
        resource: String,
        #[source]
        source: reqwest::Error,
    },

    /// Persistence or other internal failure.
    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl Error {
    pub fn validation(message: impl Into<String>) -> Self {
        Error::Validation(message.into())
    }

    /// True for failures that indicate the stored auth material is bad
    /// (as opposed to transport trouble or caller misuse).
    pub fn is_auth_failure(&self) -> bool {
        match self {
            Error::Refresh(_) => true,
            Error::Fetch(fetch) => matches!(fetch.status, None | Some(401) | Some(500..)),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fetch_error_display_includes_status_and_resource() {
        let err = FetchError {
            resource: "https://api.example.com/user".to_string(),
            method: "GET".to_string(),
            status: Some(403),
            body: "forbidden".to_string(),
        };
        let text = err.to_string();
        assert!(text.contains("403"));
        assert!(text.contains("https://api.example.com/user"));
    }

    #[test]
    fn fetch_error_display_marks_timeouts() {
        let err = FetchError {
            resource: "https://api.example.com/user".to_string(),
            method: "GET".to_string(),
            status: None,
            body: String::new(),
        };
        assert!(err.to_string().contains("timed out"));
    }

    #[test]
    fn invalid_grant_is_revoked() {
        let err = RefreshError::new(Some(400), Some("invalid_grant".to_string()), "revoked");
        assert!(err.is_revoked());

        let err = RefreshError::new(Some(503), None, "try later");
        assert!(!err.is_revoked());
    }

    #[test]
    fn auth_failure_classification() {
        let fetch = |status| {
            Error::Fetch(FetchError {
                resource: "r".to_string(),
                method: "GET".to_string(),
                status,
                body: String::new(),
            })
        };
        assert!(fetch(Some(401)).is_auth_failure());
        assert!(fetch(Some(502)).is_auth_failure());
        assert!(fetch(None).is_auth_failure());
        assert!(!fetch(Some(404)).is_auth_failure());
        assert!(!Error::validation("missing api_key").is_auth_failure());
    }
}
