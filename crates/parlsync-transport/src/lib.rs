//! Outbound HTTP for parlsync: retry combinator, authenticated transport client and egress proxies.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::time::Duration;

use reqwest::header::{HeaderName, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{error, info_span, warn, Instrument};

mod proxy;

pub use proxy::{
    parse_proxy_list, HttpProxyProbe, Proxy, ProxyKind, ProxyPool, ProxyPoolError, ProxyProbe,
    UnknownProxyKind,
};
pub use reqwest::Method;

pub const CRATE_NAME: &str = "parlsync-transport";

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Delays applied before each attempt; the schedule length is the attempt budget.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetrySchedule {
    delays: Vec<Duration>,
}

impl Default for RetrySchedule {
    fn default() -> Self {
        Self::from_secs(&[0, 15, 30])
    }
}

impl RetrySchedule {
    /// An empty list collapses to a single immediate attempt.
    pub fn new(delays: Vec<Duration>) -> Self {
        if delays.is_empty() {
            return Self::single();
        }
        Self { delays }
    }

    pub fn from_secs(secs: &[u64]) -> Self {
        Self::new(secs.iter().copied().map(Duration::from_secs).collect())
    }

    pub fn single() -> Self {
        Self {
            delays: vec![Duration::ZERO],
        }
    }

    pub fn attempts(&self) -> usize {
        self.delays.len()
    }

    pub fn delay_before(&self, attempt_index: usize) -> Duration {
        self.delays.get(attempt_index).copied().unwrap_or_default()
    }
}

/// Errors that must surface immediately instead of consuming the retry budget.
pub trait RetryClassify {
    fn is_fatal(&self) -> bool {
        false
    }
}

#[derive(Debug, Clone)]
pub struct RetryOutcome<T> {
    pub value: T,
    pub attempts: usize,
    /// `false` when the budget ran out and `value` is the last non-final result.
    pub accepted: bool,
}

/// Invoke `op` until it yields a value `is_final` accepts, following `schedule`.
///
/// Fatal errors are returned on the spot. Once the budget is spent the last error is returned,
/// or the last value with `accepted == false`.
pub async fn call_with_retries<T, E, F, Fut, P>(
    schedule: &RetrySchedule,
    label: &str,
    mut op: F,
    is_final: P,
) -> Result<RetryOutcome<T>, E>
where
    F: FnMut(usize) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: Fn(&T) -> bool,
    E: RetryClassify + fmt::Display,
    T: fmt::Debug,
{
    let total = schedule.attempts();
    let mut attempt = 0;
    loop {
        let delay = schedule.delay_before(attempt);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        attempt += 1;
        let attempts_left = total.saturating_sub(attempt);

        match op(attempt).await {
            Ok(value) if is_final(&value) => {
                return Ok(RetryOutcome {
                    value,
                    attempts: attempt,
                    accepted: true,
                })
            }
            Err(err) if err.is_fatal() => {
                warn!(label, attempt, attempts_left, error = %err, "attempt failed on fatal error");
                return Err(err);
            }
            Ok(value) => {
                warn!(label, attempt, attempts_left, value = ?value, "attempt returned non-final value");
                if attempts_left == 0 {
                    error!(label, attempts = attempt, "all attempts failed");
                    return Ok(RetryOutcome {
                        value,
                        attempts: attempt,
                        accepted: false,
                    });
                }
            }
            Err(err) => {
                warn!(label, attempt, attempts_left, error = %err, "attempt failed");
                if attempts_left == 0 {
                    error!(label, attempts = attempt, "all attempts failed");
                    return Err(err);
                }
            }
        }
    }
}

/// Credential shape injected into every request; one per client.
#[derive(Clone, PartialEq, Eq, Default)]
pub enum Auth {
    #[default]
    None,
    /// `Authorization: ApiKey <key>`
    ApiKey(String),
    /// `Authorization: Bearer <token>`
    Bearer(String),
    Basic {
        username: String,
        password: String,
    },
    /// Basic auth with the token as user name and an empty password.
    TokenAsUser(String),
}

impl fmt::Debug for Auth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let shape = match self {
            Auth::None => "None",
            Auth::ApiKey(_) => "ApiKey(..)",
            Auth::Bearer(_) => "Bearer(..)",
            Auth::Basic { .. } => "Basic(..)",
            Auth::TokenAsUser(_) => "TokenAsUser(..)",
        };
        f.write_str(shape)
    }
}

#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub base_url: String,
    pub auth: Auth,
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub retry: RetrySchedule,
}

impl TransportConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            auth: Auth::None,
            timeout: DEFAULT_TIMEOUT,
            user_agent: None,
            retry: RetrySchedule::default(),
        }
    }

    pub fn with_auth(mut self, auth: Auth) -> Self {
        self.auth = auth;
        self
    }

    pub fn with_retry(mut self, retry: RetrySchedule) -> Self {
        self.retry = retry;
        self
    }
}

/// One request, relative to the client's base URL.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestSpec {
    pub method: Method,
    pub path: String,
    pub headers: Vec<(String, String)>,
    pub query: Vec<(String, String)>,
    pub body: Option<JsonValue>,
    pub timeout: Option<Duration>,
    pub content_type: Option<String>,
    /// Statuses accepted even when they would otherwise be retried.
    pub final_codes: Vec<u16>,
    /// Statuses retried even though they are below 500.
    pub retry_codes: Vec<u16>,
    pub disable_retry: bool,
}

impl RequestSpec {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            headers: Vec::new(),
            query: Vec::new(),
            body: None,
            timeout: None,
            content_type: None,
            final_codes: Vec::new(),
            retry_codes: Vec::new(),
            disable_retry: false,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn json_body(mut self, body: JsonValue) -> Self {
        self.body = Some(body);
        self
    }

    pub fn content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn final_codes(mut self, codes: &[u16]) -> Self {
        self.final_codes = codes.to_vec();
        self
    }

    pub fn retry_codes(mut self, codes: &[u16]) -> Self {
        self.retry_codes = codes.to_vec();
        self
    }

    pub fn without_retry(mut self) -> Self {
        self.disable_retry = true;
        self
    }

    /// Replace every value of `key`, or append it when absent.
    pub fn set_query(&mut self, key: &str, value: impl Into<String>) {
        self.query.retain(|(k, _)| k != key);
        self.query.push((key.to_string(), value.into()));
    }

    pub fn query_value(&self, key: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn is_response_final(&self, status: u16) -> bool {
        if self.final_codes.contains(&status) {
            return true;
        }
        if self.retry_codes.contains(&status) {
            return false;
        }
        status < 500
    }
}

#[derive(Clone)]
pub struct TransportResponse {
    pub status: u16,
    pub url: String,
    pub body: Vec<u8>,
}

impl fmt::Debug for TransportResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportResponse")
            .field("status", &self.status)
            .field("url", &self.url)
            .field("body_len", &self.body.len())
            .finish()
    }
}

impl TransportResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.body)
    }

    pub fn error_for_status(self) -> Result<Self, TransportError> {
        if self.is_success() {
            Ok(self)
        } else {
            Err(TransportError::Status {
                status: self.status,
                url: self.url,
            })
        }
    }
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("proxy failure via {proxy}: {source}")]
    Proxy {
        proxy: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("request timed out: {0}")]
    Timeout(#[source] reqwest::Error),
    #[error("connection failed: {0}")]
    Connect(#[source] reqwest::Error),
    #[error("request failed: {0}")]
    Request(#[source] reqwest::Error),
    #[error("http status {status} for {url}")]
    Status { status: u16, url: String },
    #[error("http status {status} for {url} after {attempts} attempts")]
    RetriesExhausted {
        status: u16,
        url: String,
        attempts: usize,
    },
    #[error("building http client: {0}")]
    Build(#[source] reqwest::Error),
    #[error("invalid header {name}: {message}")]
    InvalidHeader { name: String, message: String },
}

impl TransportError {
    /// Network-level failures that rotating the egress proxy may cure.
    pub fn is_network(&self) -> bool {
        matches!(
            self,
            TransportError::Proxy { .. } | TransportError::Timeout(_) | TransportError::Connect(_)
        )
    }

    fn from_reqwest(err: reqwest::Error, proxy: Option<&Proxy>) -> Self {
        match proxy {
            Some(proxy) if err.is_connect() => TransportError::Proxy {
                proxy: proxy.url(),
                source: err,
            },
            _ if err.is_timeout() => TransportError::Timeout(err),
            _ if err.is_connect() => TransportError::Connect(err),
            _ => TransportError::Request(err),
        }
    }
}

impl RetryClassify for TransportError {
    fn is_fatal(&self) -> bool {
        matches!(self, TransportError::Proxy { .. })
    }
}

/// Issues single requests against one base URL with auth injection and the retry schedule.
#[derive(Debug)]
pub struct TransportClient {
    config: TransportConfig,
    clients: Mutex<HashMap<Option<String>, reqwest::Client>>,
}

impl TransportClient {
    pub fn new(config: TransportConfig) -> Self {
        Self {
            config,
            clients: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    pub fn base_url(&self) -> &str {
        &self.config.base_url
    }

    pub fn url_for(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            return path.to_string();
        }
        format!(
            "{}/{}",
            self.config.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }

    async fn client_for(&self, proxy: Option<&Proxy>) -> Result<reqwest::Client, TransportError> {
        let key = proxy.map(Proxy::url);
        let mut clients = self.clients.lock().await;
        if let Some(client) = clients.get(&key) {
            return Ok(client.clone());
        }

        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(self.config.timeout);
        if let Some(user_agent) = &self.config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        if let Some(proxy) = proxy {
            builder = builder
                .proxy(reqwest::Proxy::all(proxy.url()).map_err(TransportError::Build)?)
                .danger_accept_invalid_certs(true);
        }
        let client = builder.build().map_err(TransportError::Build)?;
        clients.insert(key, client.clone());
        Ok(client)
    }

    fn prepare(
        &self,
        client: &reqwest::Client,
        url: &str,
        spec: &RequestSpec,
    ) -> Result<reqwest::RequestBuilder, TransportError> {
        let mut request = client.request(spec.method.clone(), url).query(&spec.query);

        for (name, value) in &spec.headers {
            let name = HeaderName::from_bytes(name.as_bytes()).map_err(|e| {
                TransportError::InvalidHeader {
                    name: name.clone(),
                    message: e.to_string(),
                }
            })?;
            let value = HeaderValue::from_str(value).map_err(|e| TransportError::InvalidHeader {
                name: name.to_string(),
                message: e.to_string(),
            })?;
            request = request.header(name, value);
        }
        if let Some(content_type) = &spec.content_type {
            request = request.header(CONTENT_TYPE, content_type.as_str());
        }

        request = match &self.config.auth {
            Auth::None => request,
            Auth::ApiKey(key) => request.header(AUTHORIZATION, format!("ApiKey {key}")),
            Auth::Bearer(token) => request.bearer_auth(token),
            Auth::Basic { username, password } => request.basic_auth(username, Some(password)),
            Auth::TokenAsUser(token) => request.basic_auth(token, Some("")),
        };

        if let Some(timeout) = spec.timeout {
            request = request.timeout(timeout);
        }
        if let Some(body) = &spec.body {
            request = request.json(body);
        }
        Ok(request)
    }

    async fn send_once(
        &self,
        client: &reqwest::Client,
        url: &str,
        spec: &RequestSpec,
        proxy: Option<&Proxy>,
    ) -> Result<TransportResponse, TransportError> {
        let response = self
            .prepare(client, url, spec)?
            .send()
            .await
            .map_err(|e| TransportError::from_reqwest(e, proxy))?;
        let status = response.status().as_u16();
        let final_url = response.url().to_string();
        let body = response
            .bytes()
            .await
            .map_err(|e| TransportError::from_reqwest(e, proxy))?
            .to_vec();
        Ok(TransportResponse {
            status,
            url: final_url,
            body,
        })
    }

    /// Execute `spec`, retrying per the configured schedule unless the spec disables it.
    ///
    /// Proxy failures are returned immediately. A response that is still not final after the
    /// last attempt becomes [`TransportError::RetriesExhausted`]; final non-2xx responses are
    /// returned as-is for the caller to judge.
    pub async fn execute(
        &self,
        spec: &RequestSpec,
        proxy: Option<&Proxy>,
    ) -> Result<TransportResponse, TransportError> {
        let client = self.client_for(proxy).await?;
        let url = self.url_for(&spec.path);
        let span = info_span!(
            "http_fetch",
            method = %spec.method,
            url = %url,
            proxy = proxy.map(|p| p.endpoint.as_str()).unwrap_or("-"),
        );

        async {
            if spec.disable_retry {
                return self.send_once(&client, &url, spec, proxy).await;
            }

            let client = &client;
            let url = url.as_str();
            let outcome = call_with_retries(
                &self.config.retry,
                url,
                move |_attempt| self.send_once(client, url, spec, proxy),
                |response: &TransportResponse| spec.is_response_final(response.status),
            )
            .await?;

            if outcome.accepted {
                Ok(outcome.value)
            } else {
                Err(TransportError::RetriesExhausted {
                    status: outcome.value.status,
                    url: outcome.value.url,
                    attempts: outcome.attempts,
                })
            }
        }
        .instrument(span)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[derive(Debug)]
    struct FakeError(bool);

    impl fmt::Display for FakeError {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "fake error (fatal={})", self.0)
        }
    }

    impl RetryClassify for FakeError {
        fn is_fatal(&self) -> bool {
            self.0
        }
    }

    fn fast_schedule() -> RetrySchedule {
        RetrySchedule::from_secs(&[0, 0, 0])
    }

    fn client_for(server: &MockServer, auth: Auth) -> TransportClient {
        TransportClient::new(
            TransportConfig::new(server.uri())
                .with_auth(auth)
                .with_retry(fast_schedule()),
        )
    }

    #[test]
    fn default_schedule_is_three_attempts() {
        let schedule = RetrySchedule::default();
        assert_eq!(schedule.attempts(), 3);
        assert_eq!(schedule.delay_before(0), Duration::ZERO);
        assert_eq!(schedule.delay_before(2), Duration::from_secs(30));
        assert_eq!(RetrySchedule::new(Vec::new()).attempts(), 1);
    }

    #[test]
    fn response_finality_honors_overrides() {
        let spec = RequestSpec::get("/x").final_codes(&[503]).retry_codes(&[429]);
        assert!(spec.is_response_final(404));
        assert!(spec.is_response_final(503));
        assert!(!spec.is_response_final(429));
        assert!(!spec.is_response_final(500));
    }

    #[tokio::test]
    async fn combinator_stops_at_fatal_error() {
        let calls = AtomicUsize::new(0);
        let result = call_with_retries(
            &fast_schedule(),
            "fatal",
            |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<u16, _>(FakeError(true)) }
            },
            |_| true,
        )
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn combinator_recovers_after_transient_errors() {
        let outcome = call_with_retries(
            &fast_schedule(),
            "flaky",
            |attempt| async move {
                if attempt < 3 {
                    Err(FakeError(false))
                } else {
                    Ok(200u16)
                }
            },
            |status| *status < 500,
        )
        .await
        .expect("third attempt succeeds");
        assert_eq!(outcome.value, 200);
        assert_eq!(outcome.attempts, 3);
        assert!(outcome.accepted);
    }

    #[tokio::test]
    async fn always_503_makes_exactly_three_attempts() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/drucksache"))
            .respond_with(ResponseTemplate::new(503))
            .expect(3)
            .mount(&server)
            .await;

        let client = client_for(&server, Auth::None);
        let err = client
            .execute(&RequestSpec::get("/api/v1/drucksache"), None)
            .await
            .expect_err("503 is never final");
        match err {
            TransportError::RetriesExhausted {
                status, attempts, ..
            } => {
                assert_eq!(status, 503);
                assert_eq!(attempts, 3);
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[tokio::test]
    async fn disabled_retry_sends_once_and_returns_response() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .expect(1)
            .mount(&server)
            .await;

        let client = client_for(&server, Auth::None);
        let response = client
            .execute(&RequestSpec::get("/count").without_retry(), None)
            .await
            .expect("single attempt");
        assert_eq!(response.status, 503);
        assert!(response.error_for_status().is_err());
    }

    #[tokio::test]
    async fn final_404_is_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .expect(1)
            .mount(&server)
            .await;

        let client = client_for(&server, Auth::None);
        let response = client
            .execute(&RequestSpec::get("/missing"), None)
            .await
            .expect("404 is final");
        assert_eq!(response.status, 404);
    }

    #[tokio::test]
    async fn api_key_header_and_query_are_sent() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/vorgang"))
            .and(header("Authorization", "ApiKey secret"))
            .and(query_param("f.vorgang", "42"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"numFound": 1})))
            .expect(1)
            .mount(&server)
            .await;

        let client = client_for(&server, Auth::ApiKey("secret".into()));
        let response = client
            .execute(&RequestSpec::get("api/v1/vorgang").query("f.vorgang", "42"), None)
            .await
            .expect("request succeeds");
        let body: JsonValue = response.json().expect("json body");
        assert_eq!(body["numFound"], 1);
    }

    #[tokio::test]
    async fn basic_auth_shapes_are_sent() {
        let server = MockServer::start().await;
        // "token:" base64-encoded.
        Mock::given(method("GET"))
            .and(header("Authorization", "Basic dG9rZW46"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let client = client_for(&server, Auth::TokenAsUser("token".into()));
        client
            .execute(&RequestSpec::get("/"), None)
            .await
            .expect("token-as-user request");
    }

    #[test]
    fn set_query_replaces_existing_values() {
        let mut spec = RequestSpec::get("/").query("cursor", "a").query("f.id", "1");
        spec.set_query("cursor", "b");
        assert_eq!(spec.query_value("cursor"), Some("b"));
        assert_eq!(spec.query.len(), 2);
    }
}
