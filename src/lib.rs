//! # rotating-proxy-pool
//!
//! A rotating proxy pool for crawlers, with a middleware for reqwest.
//!
//! Every request goes through a proxy drawn at random, weighted by how fast its slot has
//! been answering. Banned proxies are quarantined with exponential backoff and brought
//! back by a periodic reanimation sweep.

pub mod backoff;
pub mod ban;
pub mod config;
pub mod error;
pub mod maintenance;
pub mod middleware;
pub mod pool;
pub mod proxy;
pub mod rotator;
pub mod slots;

pub use backoff::{BackoffPolicy, ExponentialBackoff};
pub use ban::{BanPolicy, DefaultBanPolicy};
pub use config::{ProxyPoolConfig, ProxyPoolConfigBuilder};
pub use error::{ConfigError, NoProxyAvailable};
pub use maintenance::MaintenanceHandle;
pub use middleware::ProxyPoolMiddleware;
pub use pool::{ProxyPool, StatusCounts};
pub use proxy::{Proxy, ProxyId, ProxyRef, ProxyStatus};
pub use rotator::{Outcome, RetryBudget, Rotator};
pub use slots::SlotDelays;
