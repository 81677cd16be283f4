use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::seq::IndexedRandom;
use rand::SeedableRng;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::{RequestSpec, RetrySchedule, TransportClient, TransportConfig, TransportError};

/// Egress protocol, chosen once per run for the whole list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ProxyKind {
    #[default]
    Http,
    Socks4,
    Socks5,
}

impl ProxyKind {
    pub fn scheme(&self) -> &'static str {
        match self {
            ProxyKind::Http => "http",
            ProxyKind::Socks4 => "socks4",
            ProxyKind::Socks5 => "socks5",
        }
    }
}

#[derive(Debug, Error)]
#[error("unknown proxy kind `{0}` (expected http, socks4 or socks5)")]
pub struct UnknownProxyKind(String);

impl FromStr for ProxyKind {
    type Err = UnknownProxyKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "http" | "https" => Ok(ProxyKind::Http),
            "socks4" => Ok(ProxyKind::Socks4),
            "socks5" => Ok(ProxyKind::Socks5),
            other => Err(UnknownProxyKind(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Proxy {
    /// `host:port`
    pub endpoint: String,
    pub kind: ProxyKind,
}

impl Proxy {
    pub fn new(endpoint: impl Into<String>, kind: ProxyKind) -> Self {
        Self {
            endpoint: endpoint.into(),
            kind,
        }
    }

    pub fn url(&self) -> String {
        format!("{}://{}", self.kind.scheme(), self.endpoint)
    }
}

impl fmt::Display for Proxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.url())
    }
}

/// One `host:port` per non-empty line; `#` starts a comment line.
pub fn parse_proxy_list(body: &str, kind: ProxyKind) -> Vec<Proxy> {
    body.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(|line| Proxy::new(line, kind))
        .collect()
}

#[derive(Debug, Error)]
pub enum ProxyPoolError {
    #[error("proxy pool exhausted ({original} proxies tried)")]
    Exhausted { original: usize },
    #[error("fetching proxy list from {url}: {source}")]
    ListFetch {
        url: String,
        #[source]
        source: TransportError,
    },
}

/// Health check applied to a candidate before it is handed out.
#[async_trait]
pub trait ProxyProbe: Send + Sync {
    async fn probe(&self, proxy: &Proxy) -> bool;
}

/// Accepts a proxy when every target answers below 500 through it.
#[derive(Debug)]
pub struct HttpProxyProbe {
    targets: Vec<String>,
    client: TransportClient,
}

impl HttpProxyProbe {
    pub fn new(targets: Vec<String>) -> Self {
        Self::with_settings(targets, Duration::from_secs(10), RetrySchedule::single())
    }

    pub fn with_settings(targets: Vec<String>, timeout: Duration, retry: RetrySchedule) -> Self {
        let mut config = TransportConfig::new("").with_retry(retry);
        config.timeout = timeout;
        Self {
            targets,
            client: TransportClient::new(config),
        }
    }
}

#[async_trait]
impl ProxyProbe for HttpProxyProbe {
    async fn probe(&self, proxy: &Proxy) -> bool {
        for target in &self.targets {
            match self.client.execute(&RequestSpec::get(target.as_str()), Some(proxy)).await {
                Ok(response) if response.status < 500 => {
                    debug!(proxy = %proxy, target, status = response.status, "proxy reached target");
                }
                Ok(response) => {
                    debug!(proxy = %proxy, target, status = response.status, "proxy probe got server error");
                    return false;
                }
                Err(err) => {
                    debug!(proxy = %proxy, target, error = %err, "proxy probe failed");
                    return false;
                }
            }
        }
        true
    }
}

struct PoolState {
    working: Vec<Proxy>,
    current: Option<Proxy>,
    rng: StdRng,
}

/// Run-scoped set of egress proxies with random rotation and eviction of failures.
pub struct ProxyPool {
    original: Vec<Proxy>,
    probe: Arc<dyn ProxyProbe>,
    state: Mutex<PoolState>,
}

impl fmt::Debug for ProxyPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyPool")
            .field("original", &self.original.len())
            .finish_non_exhaustive()
    }
}

impl ProxyPool {
    pub fn new(proxies: Vec<Proxy>, probe: Arc<dyn ProxyProbe>) -> Self {
        Self::with_rng(proxies, probe, StdRng::from_os_rng())
    }

    pub fn with_seed(proxies: Vec<Proxy>, probe: Arc<dyn ProxyProbe>, seed: u64) -> Self {
        Self::with_rng(proxies, probe, StdRng::seed_from_u64(seed))
    }

    fn with_rng(proxies: Vec<Proxy>, probe: Arc<dyn ProxyProbe>, rng: StdRng) -> Self {
        Self {
            original: proxies.clone(),
            probe,
            state: Mutex::new(PoolState {
                working: proxies,
                current: None,
                rng,
            }),
        }
    }

    /// Fetch the list once and build a pool over it.
    pub async fn from_list_url(
        client: &TransportClient,
        list_url: &str,
        kind: ProxyKind,
        probe: Arc<dyn ProxyProbe>,
    ) -> Result<Self, ProxyPoolError> {
        let fetch_error = |source| ProxyPoolError::ListFetch {
            url: list_url.to_string(),
            source,
        };
        let response = client
            .execute(&RequestSpec::get(list_url), None)
            .await
            .and_then(|r| r.error_for_status())
            .map_err(fetch_error)?;
        let proxies = parse_proxy_list(&response.text(), kind);
        info!(url = list_url, proxies = proxies.len(), "loaded proxy list");
        Ok(Self::new(proxies, probe))
    }

    pub fn original_len(&self) -> usize {
        self.original.len()
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.working.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn current(&self) -> Option<Proxy> {
        self.state.lock().await.current.clone()
    }

    /// The proxy in use, or a freshly sampled one when none is selected yet.
    pub async fn get_proxy(&self, test: bool) -> Result<Proxy, ProxyPoolError> {
        let mut guard = self.state.lock().await;
        if let Some(current) = &guard.current {
            return Ok(current.clone());
        }
        self.select(&mut guard, false, test).await
    }

    /// Replace the current proxy, evicting it first when `drop_current`.
    pub async fn rotate(&self, drop_current: bool, test: bool) -> Result<Proxy, ProxyPoolError> {
        let mut guard = self.state.lock().await;
        self.select(&mut guard, drop_current, test).await
    }

    async fn select(
        &self,
        state: &mut PoolState,
        drop_current: bool,
        test: bool,
    ) -> Result<Proxy, ProxyPoolError> {
        if let Some(previous) = state.current.take() {
            if drop_current {
                state.working.retain(|p| p != &previous);
                warn!(proxy = %previous, remaining = state.working.len(), "dropped proxy from pool");
            }
        }

        loop {
            let candidate = state
                .working
                .choose(&mut state.rng)
                .cloned()
                .ok_or(ProxyPoolError::Exhausted {
                    original: self.original.len(),
                })?;

            if !test || self.probe.probe(&candidate).await {
                debug!(proxy = %candidate, "selected proxy");
                state.current = Some(candidate.clone());
                return Ok(candidate);
            }

            state.working.retain(|p| p != &candidate);
            warn!(proxy = %candidate, remaining = state.working.len(), "proxy rejected by health check");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;
    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    struct RejectingProbe {
        rejected: Vec<String>,
        probed: StdMutex<Vec<String>>,
    }

    impl RejectingProbe {
        fn new(rejected: &[&str]) -> Self {
            Self {
                rejected: rejected.iter().map(|s| s.to_string()).collect(),
                probed: StdMutex::new(Vec::new()),
            }
        }

        fn probed(&self) -> Vec<String> {
            self.probed.lock().expect("probe log").clone()
        }
    }

    #[async_trait]
    impl ProxyProbe for RejectingProbe {
        async fn probe(&self, proxy: &Proxy) -> bool {
            self.probed
                .lock()
                .expect("probe log")
                .push(proxy.endpoint.clone());
            !self.rejected.contains(&proxy.endpoint)
        }
    }

    fn three_proxies() -> Vec<Proxy> {
        parse_proxy_list("10.0.0.1:8080\n10.0.0.2:8080\n\n10.0.0.3:8080\n", ProxyKind::Http)
    }

    #[test]
    fn proxy_list_parsing_skips_blank_and_comment_lines() {
        let proxies = parse_proxy_list("# fresh\n1.2.3.4:1080\r\n  \n5.6.7.8:1080", ProxyKind::Socks5);
        assert_eq!(proxies.len(), 2);
        assert_eq!(proxies[0].url(), "socks5://1.2.3.4:1080");
        assert_eq!("SOCKS4".parse::<ProxyKind>().unwrap(), ProxyKind::Socks4);
    }

    /// First seed whose initial draw from `proxies` lands on `endpoint`.
    fn seed_drawing_first(proxies: &[Proxy], endpoint: &str) -> u64 {
        (0..256)
            .find(|seed| {
                let mut rng = StdRng::seed_from_u64(*seed);
                proxies.choose(&mut rng).map(|p| p.endpoint.as_str()) == Some(endpoint)
            })
            .expect("some seed draws the endpoint first")
    }

    #[tokio::test]
    async fn tested_proxy_is_never_the_failing_one() {
        let seed = seed_drawing_first(&three_proxies(), "10.0.0.1:8080");
        let probe = Arc::new(RejectingProbe::new(&["10.0.0.1:8080"]));
        let pool = ProxyPool::with_seed(three_proxies(), probe.clone(), seed);

        let proxy = pool.get_proxy(true).await.expect("two healthy proxies remain");
        assert_ne!(proxy.endpoint, "10.0.0.1:8080");
        assert_eq!(probe.probed()[0], "10.0.0.1:8080");
        assert_eq!(pool.len().await, 2);
        assert_eq!(pool.current().await, Some(proxy));
    }

    #[tokio::test]
    async fn get_proxy_keeps_current_until_rotation() {
        let probe = Arc::new(RejectingProbe::new(&[]));
        let pool = ProxyPool::with_seed(three_proxies(), probe, 7);

        let first = pool.get_proxy(false).await.expect("proxy");
        assert_eq!(pool.get_proxy(false).await.expect("proxy"), first);

        let second = pool.rotate(true, false).await.expect("rotated");
        assert_ne!(second, first);
        assert_eq!(pool.len().await, 2);
        assert_eq!(pool.original_len(), 3);
    }

    #[tokio::test]
    async fn pool_fails_when_every_candidate_is_rejected() {
        let probe = Arc::new(RejectingProbe::new(&[
            "10.0.0.1:8080",
            "10.0.0.2:8080",
            "10.0.0.3:8080",
        ]));
        let pool = ProxyPool::with_seed(three_proxies(), probe, 1);

        let err = pool.get_proxy(true).await.expect_err("no healthy proxy");
        assert!(matches!(err, ProxyPoolError::Exhausted { original: 3 }));
        assert!(pool.is_empty().await);
    }

    #[tokio::test]
    async fn proxy_list_is_loaded_from_url() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("1.1.1.1:3128\n2.2.2.2:3128\n"))
            .mount(&server)
            .await;

        let client = TransportClient::new(TransportConfig::new(server.uri()));
        let pool = ProxyPool::from_list_url(
            &client,
            &format!("{}/proxies.txt", server.uri()),
            ProxyKind::Http,
            Arc::new(RejectingProbe::new(&[])),
        )
        .await
        .expect("list loads");
        assert_eq!(pool.original_len(), 2);
    }
}
