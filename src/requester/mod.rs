//! HTTP execution with auth injection and transparent auth recovery.
//!
//! The [`Requester`] is the single place provider calls go through. It owns
//! the live [`AuthSession`], injects auth headers via the configured
//! strategy, retries rate-limited calls per a bounded backoff schedule, and
//! on auth failure performs at most one refresh-and-retry cycle before
//! surfacing a [`FetchError`]. Lifecycle outcomes (token refreshed, token
//! revoked, auth invalid) are reported through the observer seam.

use crate::auth::{AuthSession, AuthStrategy};
use crate::error::{Error, FetchError};
use crate::notify::AuthObserver;
use reqwest::Method;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Default per-request timeout. Timeouts are treated like 5xx responses:
/// refresh-eligible once, then surfaced.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Maximum response body length carried on a [`FetchError`].
const ERROR_BODY_LIMIT: usize = 2048;

/// Default rate-limit backoff schedule.
pub fn default_backoff_schedule() -> Vec<Duration> {
    vec![
        Duration::from_secs(1),
        Duration::from_secs(3),
        Duration::from_secs(10),
    ]
}

/// Options for one HTTP call.
#[derive(Clone, Debug)]
pub struct RequestOptions {
    pub method: Method,
    pub headers: Vec<(String, String)>,
    /// Query pairs, percent-encoded onto the URL.
    pub query: Vec<(String, String)>,
    /// JSON body.
    pub body: Option<Value>,
}

impl RequestOptions {
    pub fn new(method: Method) -> Self {
        Self {
            method,
            headers: Vec::new(),
            query: Vec::new(),
            body: None,
        }
    }

    pub fn get() -> Self {
        Self::new(Method::GET)
    }

    pub fn post(body: Value) -> Self {
        let mut options = Self::new(Method::POST);
        options.body = Some(body);
        options
    }

    pub fn query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }
}

/// A completed HTTP exchange: status plus the full body.
#[derive(Clone, Debug)]
pub struct HttpResponse {
    pub status: u16,
    pub body: String,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Parses the body as JSON. An empty body parses as `null`.
    pub fn json(&self) -> Result<Value, Error> {
        if self.body.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&self.body)
            .map_err(|e| Error::validation(format!("response body is not valid JSON: {}", e)))
    }
}

/// Outcome of an auth-recovery attempt.
enum Recovery {
    /// A usable token is in place (own refresh, or a concurrent caller's) -
    /// retry the original request once.
    Retried,
    /// No recovery possible; the failure stands.
    Failed,
}

/// Executes provider HTTP calls for exactly one credential.
///
/// The session is exclusively owned - requesters are never shared across
/// users. Concurrent calls through the *same* requester are safe: refresh
/// runs under the session lock and late callers detect (via the session
/// generation) that the token they saw fail was already replaced.
pub struct Requester {
    http: reqwest::Client,
    strategy: AuthStrategy,
    session: Mutex<AuthSession>,
    backoff: Vec<Duration>,
    observer: Arc<dyn AuthObserver>,
}

impl Requester {
    pub fn new(
        strategy: AuthStrategy,
        session: AuthSession,
        observer: Arc<dyn AuthObserver>,
    ) -> Result<Self, Error> {
        Self::with_options(
            strategy,
            session,
            observer,
            DEFAULT_TIMEOUT,
            default_backoff_schedule(),
        )
    }

    pub fn with_options(
        strategy: AuthStrategy,
        session: AuthSession,
        observer: Arc<dyn AuthObserver>,
        timeout: Duration,
        backoff: Vec<Duration>,
    ) -> Result<Self, Error> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Internal(anyhow::anyhow!("failed to build HTTP client: {}", e)))?;
        Ok(Self {
            http,
            strategy,
            session: Mutex::new(session),
            backoff,
            observer,
        })
    }

    /// Issues the call and parses the JSON body.
    pub async fn request(&self, url: &str, options: RequestOptions) -> Result<Value, Error> {
        self.request_raw(url, options).await?.json()
    }

    /// GET convenience wrapper.
    pub async fn get(&self, url: &str) -> Result<Value, Error> {
        self.request(url, RequestOptions::get()).await
    }

    /// Issues the call and returns the raw response.
    ///
    /// Behavior per attempt:
    /// - 2xx → returned
    /// - 429 → sleep per the backoff schedule, retry; schedule exhausted →
    ///   [`FetchError`]
    /// - 401 / ≥500 / timeout → one refresh-and-retry cycle if the strategy
    ///   allows, otherwise (or on a second failure) an invalid-auth
    ///   notification and [`FetchError`]
    /// - other ≥400 → [`FetchError`] immediately
    pub async fn request_raw(
        &self,
        url: &str,
        options: RequestOptions,
    ) -> Result<HttpResponse, Error> {
        let target = append_query(url, &options.query)?;
        let mut attempt: usize = 0;
        let mut refreshed = false;

        loop {
            let (generation, outcome) = self.send_once(&target, &options).await?;

            match outcome {
                Ok(response) if response.is_success() => {
                    debug!(url = %target, status = response.status, "Request succeeded");
                    return Ok(response);
                }
                Ok(response) if response.status == 429 => {
                    if attempt < self.backoff.len() {
                        let delay = self.backoff[attempt];
                        debug!(
                            url = %target,
                            attempt,
                            delay_ms = delay.as_millis() as u64,
                            "Rate limited, backing off"
                        );
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                        continue;
                    }
                    // Schedule exhausted - handled like any other client error
                    return Err(self.fetch_error(&target, &options, Some(response)));
                }
                Ok(response) if response.status == 401 || response.status >= 500 => {
                    match self.recover_auth(generation, refreshed).await {
                        Recovery::Retried => {
                            refreshed = true;
                            attempt += 1;
                        }
                        Recovery::Failed => {
                            return Err(self.fetch_error(&target, &options, Some(response)))
                        }
                    }
                }
                Ok(response) => {
                    return Err(self.fetch_error(&target, &options, Some(response)));
                }
                Err(err) if err.is_timeout() => {
                    // Same treatment as a 5xx response
                    match self.recover_auth(generation, refreshed).await {
                        Recovery::Retried => {
                            refreshed = true;
                            attempt += 1;
                        }
                        Recovery::Failed => return Err(self.fetch_error(&target, &options, None)),
                    }
                }
                Err(err) => {
                    return Err(Error::Transport {
                        resource: target.clone(),
                        source: err,
                    });
                }
            }
        }
    }

    /// Sends one HTTP request with the session's current auth header.
    ///
    /// The auth header and generation are snapshotted under the session lock
    /// so the generation always matches the token actually sent.
    async fn send_once(
        &self,
        url: &str,
        options: &RequestOptions,
    ) -> Result<(u64, Result<HttpResponse, reqwest::Error>), Error> {
        let (auth_headers, generation) = {
            let session = self.session.lock().await;
            let mut headers = Vec::new();
            self.strategy.apply_headers(&session, &mut headers)?;
            (headers, session.generation())
        };

        let mut request = self.http.request(options.method.clone(), url);
        for (name, value) in &options.headers {
            request = request.header(name.as_str(), value.as_str());
        }
        for (name, value) in &auth_headers {
            request = request.header(name.as_str(), value.as_str());
        }
        if let Some(body) = &options.body {
            request = request.json(body);
        }

        let outcome = match request.send().await {
            Ok(response) => {
                let status = response.status().as_u16();
                match response.text().await {
                    Ok(body) => Ok(HttpResponse { status, body }),
                    Err(err) => Err(err),
                }
            }
            Err(err) => Err(err),
        };

        Ok((generation, outcome))
    }

    /// Tries to put a usable token in place after an auth failure.
    ///
    /// Runs under the session lock so concurrent callers against this
    /// requester never fire duplicate refresh grants: whoever wins the lock
    /// refreshes, everyone else sees the bumped generation and just retries.
    async fn recover_auth(&self, observed_generation: u64, already_refreshed: bool) -> Recovery {
        if !self.strategy.is_refreshable() || already_refreshed {
            self.emit_invalid_auth().await;
            return Recovery::Failed;
        }

        let mut session = self.session.lock().await;
        if session.generation() != observed_generation {
            // A concurrent caller already refreshed the token we saw fail.
            debug!("Skipping refresh, session already rotated");
            return Recovery::Retried;
        }

        match self.strategy.refresh(&mut session).await {
            Ok(tokens) => {
                drop(session);
                if let Err(err) = self.observer.on_token_updated(&tokens).await {
                    warn!(error = %err, "Token-updated notification failed");
                }
                Recovery::Retried
            }
            Err(err) => {
                drop(session);
                let revoked = matches!(&err, Error::Refresh(refresh) if refresh.is_revoked());
                warn!(error = %err, revoked, "Token refresh failed");
                if revoked {
                    if let Err(err) = self.observer.on_deauthorized().await {
                        warn!(error = %err, "Deauthorized notification failed");
                    }
                } else {
                    self.emit_invalid_auth().await;
                }
                Recovery::Failed
            }
        }
    }

    async fn emit_invalid_auth(&self) {
        if let Err(err) = self.observer.on_invalid_auth().await {
            warn!(error = %err, "Invalid-auth notification failed");
        }
    }

    fn fetch_error(
        &self,
        url: &str,
        options: &RequestOptions,
        response: Option<HttpResponse>,
    ) -> Error {
        Error::Fetch(FetchError {
            resource: url.to_string(),
            method: options.method.to_string(),
            status: response.as_ref().map(|r| r.status),
            body: response
                .map(|r| truncate_body(r.body))
                .unwrap_or_default(),
        })
    }
}

/// Percent-encodes query pairs onto the URL.
fn append_query(url: &str, query: &[(String, String)]) -> Result<String, Error> {
    if query.is_empty() {
        return Ok(url.to_string());
    }
    let encoded = serde_urlencoded::to_string(query)
        .map_err(|e| Error::validation(format!("unencodable query parameters: {}", e)))?;
    let separator = if url.contains('?') { '&' } else { '?' };
    Ok(format!("{}{}{}", url, separator, encoded))
}

fn truncate_body(body: String) -> String {
    if body.len() <= ERROR_BODY_LIMIT {
        return body;
    }
    body.chars().take(ERROR_BODY_LIMIT).collect()
}
