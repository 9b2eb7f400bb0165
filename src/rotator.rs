//! Request-side policy around the pool: which proxy to use, what to do when none is
//! left, and how outcomes and retries are accounted.

use crate::config::ProxyPoolConfig;
use crate::error::NoProxyAvailable;
use crate::pool::ProxyPool;
use crate::proxy::ProxyRef;

use log::{debug, error, warn};
use std::sync::Arc;

/// What happened to a request sent through a proxy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The response was not a ban. Cached responses say nothing about the proxy.
    Success { cached: bool },
    /// The response or error was judged a ban.
    Ban,
}

/// Hands out proxies and feeds request outcomes back into the pool.
#[derive(Clone)]
pub struct Rotator {
    pool: Arc<ProxyPool>,
    close_on_exhaustion: bool,
    page_retry_times: usize,
}

impl Rotator {
    pub fn new(pool: Arc<ProxyPool>, config: &ProxyPoolConfig) -> Self {
        Self {
            pool,
            close_on_exhaustion: config.close_on_exhaustion,
            page_retry_times: config.page_retry_times,
        }
    }

    pub fn pool(&self) -> &Arc<ProxyPool> {
        &self.pool
    }

    /// Pick a proxy for the next request.
    ///
    /// When every proxy is dead, either fail with [`NoProxyAvailable::Exhausted`]
    /// or mark all proxies unchecked and try once more, depending on configuration.
    pub fn acquire(&self) -> Result<ProxyRef, NoProxyAvailable> {
        if let Some(proxy) = self.pool.select_random() {
            return Ok(proxy);
        }

        if self.close_on_exhaustion {
            return Err(NoProxyAvailable::Exhausted);
        }

        warn!("No proxies available; marking all proxies as unchecked");
        self.pool.reset();
        self.pool.select_random().ok_or_else(|| {
            error!("No proxies available even after a reset.");
            NoProxyAvailable::ExhaustedAfterReset
        })
    }

    /// Record the outcome of a request. Returns true if the pool's selection index
    /// was invalidated.
    pub fn report(&self, proxy: &ProxyRef, outcome: Outcome) -> bool {
        match outcome {
            Outcome::Success { cached: true } => false,
            Outcome::Success { cached: false } => self.pool.mark_good(proxy),
            Outcome::Ban => {
                let invalidated = self.pool.mark_dead(proxy);
                debug!("Ban through <{}>, pool now {}", proxy, self.pool);
                invalidated
            }
        }
    }

    /// Fresh retry counter for one logical request.
    pub fn retry_budget(&self) -> RetryBudget {
        RetryBudget::new(self.page_retry_times)
    }
}

/// Counts how many times one logical request was retried with a different proxy.
#[derive(Debug, Clone)]
pub struct RetryBudget {
    retries: usize,
    max_retries: usize,
}

impl RetryBudget {
    pub fn new(max_retries: usize) -> Self {
        Self {
            retries: 0,
            max_retries,
        }
    }

    pub fn retries(&self) -> usize {
        self.retries
    }

    /// Consume one retry. Returns false once the budget is spent, after which the
    /// failure belongs to the request rather than to a proxy.
    pub fn try_retry(&mut self) -> bool {
        self.retries += 1;
        if self.retries <= self.max_retries {
            debug!(
                "Retrying with another proxy (failed {} times, max retries: {})",
                self.retries, self.max_retries
            );
            true
        } else {
            debug!(
                "Gave up retrying (failed {} times with different proxies)",
                self.retries
            );
            false
        }
    }
}
