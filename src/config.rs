//! Configuration for the proxy pool.

use crate::backoff::BackoffPolicy;

use std::time::Duration;

/// Configuration for the proxy pool and the request router around it.
#[derive(Debug, Clone)]
pub struct ProxyPoolConfig {
    /// Raw proxy strings; a missing scheme defaults to `http://`.
    pub proxies: Vec<String>,
    /// Quarantine length after the first ban.
    pub backoff_base: Duration,
    /// Longest quarantine.
    pub backoff_cap: Duration,
    /// Randomize quarantine lengths below the exponential bound.
    pub backoff_jitter: bool,
    /// Interval between reanimation sweeps.
    pub reanimate_interval: Duration,
    /// Interval between pool stats log lines; zero disables them.
    pub log_stats_interval: Duration,
    /// Number of times a request is retried with a different proxy.
    pub page_retry_times: usize,
    /// Stop instead of resetting the pool when every proxy is dead.
    pub close_on_exhaustion: bool,
    /// Maximum requests per second per routing slot.
    pub max_requests_per_second: f64,
    /// Timeout for requests sent through a proxy.
    pub request_timeout: Duration,
    /// Seed for the pool's random source.
    pub seed: Option<u64>,
}

impl ProxyPoolConfig {
    /// Create a new configuration builder.
    pub fn builder() -> ProxyPoolConfigBuilder {
        ProxyPoolConfigBuilder::new()
    }

    /// Backoff bounds shared by every proxy of the pool.
    pub fn backoff_policy(&self) -> BackoffPolicy {
        BackoffPolicy {
            base: self.backoff_base,
            cap: self.backoff_cap,
            jitter: self.backoff_jitter,
        }
    }
}

/// Builder for `ProxyPoolConfig`.
pub struct ProxyPoolConfigBuilder {
    proxies: Vec<String>,
    backoff_base: Option<Duration>,
    backoff_cap: Option<Duration>,
    backoff_jitter: Option<bool>,
    reanimate_interval: Option<Duration>,
    log_stats_interval: Option<Duration>,
    page_retry_times: Option<usize>,
    close_on_exhaustion: Option<bool>,
    max_requests_per_second: Option<f64>,
    request_timeout: Option<Duration>,
    seed: Option<u64>,
}

impl ProxyPoolConfigBuilder {
    /// Create a new builder with default values.
    pub fn new() -> Self {
        Self {
            proxies: Vec::new(),
            backoff_base: None,
            backoff_cap: None,
            backoff_jitter: None,
            reanimate_interval: None,
            log_stats_interval: None,
            page_retry_times: None,
            close_on_exhaustion: None,
            max_requests_per_second: None,
            request_timeout: None,
            seed: None,
        }
    }

    /// Set the proxies to rotate through.
    pub fn proxies(mut self, proxies: Vec<impl Into<String>>) -> Self {
        self.proxies = proxies.into_iter().map(Into::into).collect();
        self
    }

    /// Set the base backoff time.
    pub fn backoff_base(mut self, base: Duration) -> Self {
        self.backoff_base = Some(base);
        self
    }

    /// Set the backoff time cap.
    pub fn backoff_cap(mut self, cap: Duration) -> Self {
        self.backoff_cap = Some(cap);
        self
    }

    /// Enable or disable jitter on backoff times.
    pub fn backoff_jitter(mut self, jitter: bool) -> Self {
        self.backoff_jitter = Some(jitter);
        self
    }

    /// Set the interval between reanimation sweeps.
    pub fn reanimate_interval(mut self, interval: Duration) -> Self {
        self.reanimate_interval = Some(interval);
        self
    }

    /// Set the interval between stats log lines.
    pub fn log_stats_interval(mut self, interval: Duration) -> Self {
        self.log_stats_interval = Some(interval);
        self
    }

    /// Set the number of times to retry a request with different proxies.
    pub fn page_retry_times(mut self, count: usize) -> Self {
        self.page_retry_times = Some(count);
        self
    }

    /// Stop with an error instead of resetting the pool when no proxy is alive.
    pub fn close_on_exhaustion(mut self, close: bool) -> Self {
        self.close_on_exhaustion = Some(close);
        self
    }

    /// Set the maximum requests per second per routing slot.
    pub fn max_requests_per_second(mut self, rps: f64) -> Self {
        self.max_requests_per_second = Some(rps);
        self
    }

    /// Set the timeout for proxied requests.
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    /// Seed the pool's random source.
    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Build the configuration.
    pub fn build(self) -> ProxyPoolConfig {
        ProxyPoolConfig {
            proxies: self.proxies,
            backoff_base: self.backoff_base.unwrap_or(Duration::from_secs(300)),
            backoff_cap: self.backoff_cap.unwrap_or(Duration::from_secs(3600)),
            backoff_jitter: self.backoff_jitter.unwrap_or(true),
            reanimate_interval: self.reanimate_interval.unwrap_or(Duration::from_secs(5)),
            log_stats_interval: self.log_stats_interval.unwrap_or(Duration::from_secs(30)),
            page_retry_times: self.page_retry_times.unwrap_or(5),
            close_on_exhaustion: self.close_on_exhaustion.unwrap_or(false),
            max_requests_per_second: self.max_requests_per_second.unwrap_or(5.0),
            request_timeout: self.request_timeout.unwrap_or(Duration::from_secs(30)),
            seed: self.seed,
        }
    }
}

impl Default for ProxyPoolConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
