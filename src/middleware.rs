//! Middleware implementation for reqwest.

use crate::ban::{BanPolicy, DefaultBanPolicy};
use crate::config::ProxyPoolConfig;
use crate::error::ConfigError;
use crate::maintenance::MaintenanceHandle;
use crate::pool::ProxyPool;
use crate::proxy::ProxyRef;
use crate::rotator::{Outcome, Rotator};
use crate::slots::SlotDelays;

use anyhow::anyhow;
use async_trait::async_trait;
use governor::{DefaultKeyedRateLimiter, Quota, RateLimiter};
use log::{debug, info, warn};
use reqwest_middleware::{Error, Middleware, Next, Result};
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Middleware that sends every request through a proxy picked from a rotating pool.
#[derive(Clone)]
pub struct ProxyPoolMiddleware {
    rotator: Rotator,
    delays: Arc<SlotDelays>,
    limiter: Arc<DefaultKeyedRateLimiter<String>>,
    ban_policy: Arc<dyn BanPolicy>,
    request_timeout: Duration,
    _maintenance: Arc<MaintenanceHandle>,
}

impl ProxyPoolMiddleware {
    /// Create a new proxy pool middleware with the given configuration.
    ///
    /// Starts the reanimation and stats timers, so this must be called from within a
    /// tokio runtime. The timers stop when the last clone of the middleware is dropped.
    pub fn new(config: ProxyPoolConfig) -> std::result::Result<Self, ConfigError> {
        let pool = Arc::new(ProxyPool::from_config(&config)?);
        let delays = Arc::new(SlotDelays::new());

        let rps = NonZeroU32::new(config.max_requests_per_second.ceil() as u32)
            .unwrap_or(NonZeroU32::MIN);
        let limiter = Arc::new(RateLimiter::keyed(Quota::per_second(rps)));

        let maintenance = MaintenanceHandle::start(
            Arc::clone(&pool),
            Arc::clone(&delays),
            config.reanimate_interval,
            config.log_stats_interval,
        );
        info!("Proxy pool middleware initialized: {}", pool);

        Ok(Self {
            rotator: Rotator::new(pool, &config),
            delays,
            limiter,
            ban_policy: Arc::new(DefaultBanPolicy),
            request_timeout: config.request_timeout,
            _maintenance: Arc::new(maintenance),
        })
    }

    /// Replace the default ban detection rules.
    pub fn with_ban_policy(mut self, policy: impl BanPolicy + 'static) -> Self {
        self.ban_policy = Arc::new(policy);
        self
    }

    /// The underlying pool.
    pub fn pool(&self) -> &Arc<ProxyPool> {
        self.rotator.pool()
    }

    fn client_for(&self, proxy: &ProxyRef) -> reqwest::Result<reqwest::Client> {
        reqwest::Client::builder()
            .proxy(proxy.to_reqwest_proxy()?)
            .timeout(self.request_timeout)
            .build()
    }
}

#[async_trait]
impl Middleware for ProxyPoolMiddleware {
    async fn handle(
        &self,
        req: reqwest::Request,
        _extensions: &mut http::Extensions,
        _next: Next<'_>,
    ) -> Result<reqwest::Response> {
        let mut budget = self.rotator.retry_budget();

        loop {
            let proxy = self.rotator.acquire().map_err(|e| {
                warn!("No proxy available: {}", self.pool());
                Error::Middleware(anyhow!(e))
            })?;

            let proxied_request = req.try_clone().ok_or_else(|| {
                Error::Middleware(anyhow!(
                    "Request object is not cloneable. Are you passing a streaming body?"
                        .to_string()
                ))
            })?;

            debug!("Using proxy: {} (attempt {})", proxy, budget.retries() + 1);
            self.limiter.until_key_ready(&proxy.slot_key().to_string()).await;

            let client = match self.client_for(&proxy) {
                Ok(client) => client,
                Err(e) => {
                    warn!("Failed to build client with proxy {}: {}", proxy, e);
                    if !self.ban_policy.error_is_ban(&e) {
                        return Err(Error::Reqwest(e));
                    }
                    self.rotator.report(&proxy, Outcome::Ban);
                    if budget.try_retry() {
                        continue;
                    }
                    return Err(Error::Reqwest(e));
                }
            };

            let start = Instant::now();
            match client.execute(proxied_request).await {
                Ok(response) => {
                    self.delays.record(proxy.slot_key(), start.elapsed());

                    let status = response.status();
                    // Only a declared zero length counts; chunked bodies are not buffered.
                    let body_empty = response.content_length() == Some(0);
                    if !self.ban_policy.response_is_ban(status, body_empty) {
                        self.rotator.report(&proxy, Outcome::Success { cached: false });
                        return Ok(response);
                    }

                    warn!("Ban detected through proxy {}: status {}", proxy, status);
                    self.rotator.report(&proxy, Outcome::Ban);
                    if !budget.try_retry() {
                        return Ok(response);
                    }
                }
                Err(err) => {
                    warn!(
                        "Request failed with proxy {} (attempt {}): {}",
                        proxy,
                        budget.retries() + 1,
                        err
                    );
                    if !self.ban_policy.error_is_ban(&err) {
                        return Err(Error::Reqwest(err));
                    }
                    self.rotator.report(&proxy, Outcome::Ban);
                    if !budget.try_retry() {
                        return Err(Error::Reqwest(err));
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::NoProxyAvailable;
    use crate::proxy::ProxyStatus;
    use reqwest_middleware::ClientBuilder;
    use std::net::SocketAddr;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Minimal HTTP proxy answering every request with the same status.
    async fn spawn_proxy(status_line: &'static str, body: &'static str) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let mut request: Vec<u8> = Vec::new();
                    let mut chunk = [0u8; 1024];
                    while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                        match socket.read(&mut chunk).await {
                            Ok(0) | Err(_) => return,
                            Ok(n) => request.extend_from_slice(&chunk[..n]),
                        }
                    }
                    let response = format!(
                        "HTTP/1.1 {status_line}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                        body.len()
                    );
                    let _ = socket.write_all(response.as_bytes()).await;
                    let _ = socket.shutdown().await;
                });
            }
        });
        addr
    }

    fn config(proxies: Vec<String>, retries: usize, close: bool) -> ProxyPoolConfig {
        ProxyPoolConfig::builder()
            .proxies(proxies)
            .page_retry_times(retries)
            .close_on_exhaustion(close)
            .reanimate_interval(Duration::from_secs(60))
            .log_stats_interval(Duration::ZERO)
            .max_requests_per_second(1000.0)
            .request_timeout(Duration::from_secs(5))
            .seed(17)
            .build()
    }

    fn status_of(middleware: &ProxyPoolMiddleware, url: &str) -> ProxyStatus {
        let pool = middleware.pool();
        pool.get(pool.find(url).unwrap().id()).unwrap().status()
    }

    #[tokio::test]
    async fn test_bans_rotate_to_working_proxy() {
        let _ = env_logger::builder().is_test(true).try_init();
        let good = format!("http://{}", spawn_proxy("200 OK", "ok").await);
        let bad = format!("http://{}", spawn_proxy("403 Forbidden", "banned").await);

        let middleware =
            ProxyPoolMiddleware::new(config(vec![good.clone(), bad.clone()], 5, true)).unwrap();
        let client = ClientBuilder::new(reqwest::Client::new())
            .with(middleware.clone())
            .build();

        for _ in 0..10 {
            let response = client.get("http://example.invalid/").send().await.unwrap();
            assert_eq!(response.status(), reqwest::StatusCode::OK);
            assert_eq!(response.text().await.unwrap(), "ok");
        }

        assert_eq!(status_of(&middleware, &good), ProxyStatus::Good);
        assert_ne!(status_of(&middleware, &bad), ProxyStatus::Good);
        assert!(middleware.pool().status_counts().dead <= 1);
    }

    #[tokio::test]
    async fn test_spent_budget_returns_banned_response() {
        let first = format!("http://{}", spawn_proxy("403 Forbidden", "banned").await);
        let second = format!("http://{}", spawn_proxy("503 Service Unavailable", "busy").await);

        let middleware = ProxyPoolMiddleware::new(config(vec![first, second], 1, true)).unwrap();
        let client = ClientBuilder::new(reqwest::Client::new())
            .with(middleware.clone())
            .build();

        let response = client.get("http://example.invalid/").send().await.unwrap();
        let status = response.status();
        assert!(status == reqwest::StatusCode::FORBIDDEN || status.is_server_error());
        assert_eq!(middleware.pool().status_counts().dead, 2);

        let err = client.get("http://example.invalid/").send().await.unwrap_err();
        match err {
            Error::Middleware(e) => {
                assert_eq!(
                    e.downcast_ref::<NoProxyAvailable>(),
                    Some(&NoProxyAvailable::Exhausted)
                );
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_connection_errors_kill_proxy() {
        let closed = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap()
        };
        let url = format!("http://{closed}");

        let middleware = ProxyPoolMiddleware::new(config(vec![url.clone()], 3, true)).unwrap();
        let client = ClientBuilder::new(reqwest::Client::new())
            .with(middleware.clone())
            .build();

        assert!(client.get("http://example.invalid/").send().await.is_err());
        assert_eq!(status_of(&middleware, &url), ProxyStatus::Dead);
    }

    #[tokio::test]
    async fn test_exhausted_pool_resets_when_not_closing() {
        let bad = format!("http://{}", spawn_proxy("429 Too Many Requests", "slow down").await);

        let middleware = ProxyPoolMiddleware::new(config(vec![bad.clone()], 2, false)).unwrap();
        let client = ClientBuilder::new(reqwest::Client::new())
            .with(middleware.clone())
            .build();

        let response = client.get("http://example.invalid/").send().await.unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(status_of(&middleware, &bad), ProxyStatus::Dead);
        let pool = middleware.pool();
        let record = pool.get(pool.find(&bad).unwrap().id()).unwrap();
        assert_eq!(record.backoff().attempts(), 1);
    }

    #[tokio::test]
    async fn test_empty_ok_response_is_a_ban() {
        let empty = format!("http://{}", spawn_proxy("200 OK", "").await);

        let middleware = ProxyPoolMiddleware::new(config(vec![empty.clone()], 0, true)).unwrap();
        let client = ClientBuilder::new(reqwest::Client::new())
            .with(middleware.clone())
            .build();

        let response = client.get("http://example.invalid/").send().await.unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::OK);
        assert_eq!(status_of(&middleware, &empty), ProxyStatus::Dead);
    }

    struct NeverBan;

    impl BanPolicy for NeverBan {
        fn response_is_ban(&self, _status: reqwest::StatusCode, _body_empty: bool) -> bool {
            false
        }

        fn error_is_ban(&self, _err: &reqwest::Error) -> bool {
            false
        }
    }

    #[tokio::test]
    async fn test_ban_policy_decides_on_client_failures() {
        let unusable = "ftp://127.0.0.1:1".to_string();

        let middleware = ProxyPoolMiddleware::new(config(vec![unusable.clone()], 3, true))
            .unwrap()
            .with_ban_policy(NeverBan);
        let client = ClientBuilder::new(reqwest::Client::new())
            .with(middleware.clone())
            .build();

        assert!(client.get("http://example.invalid/").send().await.is_err());
        assert_eq!(status_of(&middleware, &unusable), ProxyStatus::Unchecked);
        assert_eq!(middleware.pool().status_counts().dead, 0);
    }

    #[tokio::test]
    async fn test_invalid_config_is_rejected() {
        let result = ProxyPoolMiddleware::new(config(Vec::new(), 1, false));
        assert!(matches!(result, Err(ConfigError::EmptyProxyList)));
    }
}
