//! Proxy records and their health states.

use crate::backoff::{BackoffPolicy, ExponentialBackoff};
use crate::error::ConfigError;

use log::debug;
use rand::Rng;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Instant;
use url::Url;

/// Health of a proxy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProxyStatus {
    /// The proxy has not been used yet, or the pool was reset.
    Unchecked,
    /// The last request through the proxy succeeded.
    Good,
    /// The proxy was banned and is quarantined until its backoff elapses.
    Dead,
    /// The quarantine elapsed; the proxy is usable again until the next outcome.
    Reanimated,
}

impl ProxyStatus {
    /// Whether proxies in this state may be selected.
    pub fn is_eligible(self) -> bool {
        self != ProxyStatus::Dead
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ProxyStatus::Unchecked => "unchecked",
            ProxyStatus::Good => "good",
            ProxyStatus::Dead => "dead",
            ProxyStatus::Reanimated => "reanimated",
        }
    }
}

impl fmt::Display for ProxyStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stable index of a proxy inside its pool, assigned at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProxyId(pub(crate) usize);

impl ProxyId {
    pub fn index(self) -> usize {
        self.0
    }
}

/// Immutable handle to a selected proxy, handed to callers of the pool.
///
/// Equality is by id only, which is equivalent to equality by URL within a pool.
#[derive(Debug, Clone)]
pub struct ProxyRef {
    id: ProxyId,
    url: Arc<str>,
    slot_key: Arc<str>,
}

impl ProxyRef {
    pub fn id(&self) -> ProxyId {
        self.id
    }

    /// The proxy URL (e.g. "http://10.0.0.1:3128").
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Key grouping requests by physical proxy.
    pub fn slot_key(&self) -> &str {
        &self.slot_key
    }

    /// Convert the proxy URL to a reqwest::Proxy.
    pub fn to_reqwest_proxy(&self) -> Result<reqwest::Proxy, reqwest::Error> {
        reqwest::Proxy::all(&*self.url)
    }
}

impl PartialEq for ProxyRef {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for ProxyRef {}

impl fmt::Display for ProxyRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.url)
    }
}

/// Representation of a proxy server and its health.
#[derive(Debug, Clone)]
pub struct Proxy {
    id: ProxyId,
    url: Arc<str>,
    slot_key: Arc<str>,
    /// The current status of the proxy.
    pub(crate) status: ProxyStatus,
    /// Quarantine schedule, owned by this proxy alone.
    pub(crate) backoff: ExponentialBackoff,
    /// Weight for random selection, refreshed by each reanimation sweep.
    pub(crate) weight: f64,
}

impl Proxy {
    /// Build a proxy from an already normalized URL.
    ///
    /// All proxies sharing a hostname share a slot, except `localhost` where the port
    /// is part of the slot so local test proxies stay apart.
    pub(crate) fn parse(
        id: ProxyId,
        url: String,
        backoff: BackoffPolicy,
    ) -> Result<Self, ConfigError> {
        let parsed = Url::parse(&url).map_err(|source| ConfigError::InvalidProxy {
            proxy: url.clone(),
            source,
        })?;
        let host = match parsed.host_str() {
            Some(host) if !host.is_empty() => host,
            _ => return Err(ConfigError::MissingHost { proxy: url }),
        };

        let slot_key = if host == "localhost" {
            match parsed.port_or_known_default() {
                Some(port) => format!("{host}:{port}"),
                None => host.to_string(),
            }
        } else {
            host.to_string()
        };

        Ok(Self {
            id,
            url: url.into(),
            slot_key: slot_key.into(),
            status: ProxyStatus::Unchecked,
            backoff: ExponentialBackoff::new(backoff),
            weight: 1.0,
        })
    }

    pub fn id(&self) -> ProxyId {
        self.id
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn slot_key(&self) -> &str {
        &self.slot_key
    }

    pub fn status(&self) -> ProxyStatus {
        self.status
    }

    pub fn backoff(&self) -> &ExponentialBackoff {
        &self.backoff
    }

    pub fn weight(&self) -> f64 {
        self.weight
    }

    pub fn to_ref(&self) -> ProxyRef {
        ProxyRef {
            id: self.id,
            url: Arc::clone(&self.url),
            slot_key: Arc::clone(&self.slot_key),
        }
    }

    /// Mark as unchecked and forget past failures.
    pub(crate) fn reset(&mut self) {
        self.status = ProxyStatus::Unchecked;
        self.backoff.reset();
    }

    /// Mark as dead. Returns true if the selection index must be rebuilt.
    ///
    /// A proxy that is already dead keeps its current quarantine.
    pub(crate) fn mark_dead<R: Rng + ?Sized>(&mut self, now: Instant, rng: &mut R) -> bool {
        if self.status == ProxyStatus::Dead {
            debug!("Proxy <{}> is DEAD", self.url);
            return false;
        }

        debug!("{} proxy became DEAD: <{}>", self.status, self.url);
        self.status = ProxyStatus::Dead;
        self.backoff.trigger(now, rng);
        true
    }

    /// Mark as good. Returns true if the selection index must be rebuilt.
    pub(crate) fn mark_good(&mut self) -> bool {
        if self.status == ProxyStatus::Good {
            return false;
        }

        debug!("Proxy <{}> is GOOD", self.url);
        self.status = ProxyStatus::Good;
        self.backoff.reset();
        true
    }

    /// Move a dead proxy to reanimated once its quarantine is over.
    pub(crate) fn reanimate(&mut self, now: Instant) -> bool {
        let ready = self.backoff.ready_at().is_some_and(|at| at <= now);
        if self.status == ProxyStatus::Dead && ready {
            self.status = ProxyStatus::Reanimated;
            true
        } else {
            false
        }
    }
}

impl PartialEq for Proxy {
    fn eq(&self, other: &Self) -> bool {
        self.url == other.url
    }
}

impl Eq for Proxy {}

impl Hash for Proxy {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.url.hash(state);
    }
}

/// Strip surrounding whitespace and add `http://` to entries lacking a scheme.
pub(crate) fn normalize(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.contains("://") {
        trimmed.to_string()
    } else if let Some(rest) = trimmed.strip_prefix("//") {
        format!("http://{rest}")
    } else {
        format!("http://{trimmed}")
    }
}
