//! Error types for the rotating-proxy-pool crate.

use std::time::Duration;
use thiserror::Error;

/// Error raised while building a pool from its configuration.
///
/// No partial pool is ever created: one bad entry fails the whole build.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("proxy list is empty")]
    EmptyProxyList,
    #[error("invalid proxy {proxy:?}: {source}")]
    InvalidProxy {
        proxy: String,
        #[source]
        source: url::ParseError,
    },
    #[error("proxy {proxy:?} has no hostname")]
    MissingHost { proxy: String },
    #[error("invalid backoff bounds: base {base:?}, cap {cap:?}")]
    InvalidBackoff { base: Duration, cap: Duration },
}

/// Error returned when no eligible proxy is left in the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum NoProxyAvailable {
    /// Every proxy is dead and the pool is configured to stop.
    #[error("no proxies available")]
    Exhausted,
    /// Every proxy is dead even after marking all of them unchecked again.
    #[error("no proxies available even after a reset")]
    ExhaustedAfterReset,
}
