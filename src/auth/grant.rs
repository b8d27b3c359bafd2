//! Form-encoded token endpoint plumbing shared by the OAuth2 and password
//! strategies.

use crate::auth::TokenSet;
use chrono::{Duration, Utc};
use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::debug;

/// Successful token endpoint response (RFC 6749 §5.1), with any
/// non-standard fields captured verbatim.
#[derive(Deserialize, Debug)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
    #[serde(default)]
    token_type: Option<String>,
    #[serde(flatten)]
    extra: Map<String, Value>,
}

/// Failure outcome of a token endpoint call, kept low-level so each caller
/// can map it into the right error kind (fetch failure for first-time
/// grants, refresh failure for refresh grants).
#[derive(Debug)]
pub(super) enum GrantFailure {
    /// The endpoint answered with a non-2xx status. `code` is the OAuth
    /// error code when the body carried one.
    Endpoint {
        status: u16,
        code: Option<String>,
        body: String,
    },
    /// The call never produced a response.
    Transport(reqwest::Error),
    /// 2xx response whose body was not a usable token payload.
    Malformed(String),
}

/// POSTs a form-encoded grant to `token_url` and parses the token response.
///
/// Client credentials go either into the form (already present in `form`)
/// or into a Basic authorization header, per the caller.
pub(super) async fn request_token(
    http: &reqwest::Client,
    token_url: &str,
    form: &[(&str, &str)],
    basic_auth: Option<(&str, &str)>,
) -> Result<TokenSet, GrantFailure> {
    let grant_type = form
        .iter()
        .find(|(key, _)| *key == "grant_type")
        .map(|(_, value)| *value)
        .unwrap_or("unknown");
    debug!(token_url = %token_url, grant_type = %grant_type, "Requesting token grant");

    let mut request = http
        .post(token_url)
        .header("Accept", "application/json")
        .form(form);
    if let Some((client_id, client_secret)) = basic_auth {
        request = request.basic_auth(client_id, Some(client_secret));
    }

    let response = request.send().await.map_err(GrantFailure::Transport)?;
    let status = response.status();
    let body = response.text().await.map_err(GrantFailure::Transport)?;

    if !status.is_success() {
        return Err(GrantFailure::Endpoint {
            status: status.as_u16(),
            code: extract_oauth_error_code(&body),
            body,
        });
    }

    let parsed: TokenResponse = serde_json::from_str(&body)
        .map_err(|e| GrantFailure::Malformed(format!("unparseable token response: {}", e)))?;

    debug!(
        has_refresh_token = parsed.refresh_token.is_some(),
        expires_in = ?parsed.expires_in,
        token_type = ?parsed.token_type,
        "Token grant succeeded"
    );

    let expires_at = parsed
        .expires_in
        .map(|seconds| Utc::now() + Duration::seconds(seconds));

    Ok(TokenSet {
        access_token: parsed.access_token,
        refresh_token: parsed.refresh_token,
        expires_at,
        extra: parsed.extra,
    })
}

/// Pulls the OAuth `error` code out of an error body.
///
/// Providers answer with JSON per RFC 6749 §5.2, but a few (GitHub among
/// them) use form encoding - try both.
fn extract_oauth_error_code(body: &str) -> Option<String> {
    #[derive(Deserialize)]
    struct OAuthErrorBody {
        error: String,
    }

    if let Ok(parsed) = serde_json::from_str::<OAuthErrorBody>(body) {
        return Some(parsed.error);
    }
    serde_urlencoded::from_str::<Vec<(String, String)>>(body)
        .ok()?
        .into_iter()
        .find(|(key, _)| key == "error")
        .map(|(_, value)| value)
}
