//! Core proxy pool implementation.

use crate::backoff::BackoffPolicy;
use crate::config::ProxyPoolConfig;
use crate::error::ConfigError;
use crate::proxy::{self, Proxy, ProxyId, ProxyRef, ProxyStatus};

use log::{debug, info, warn};
use parking_lot::{Mutex, RwLock};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::time::{Duration, Instant};

/// Delay assumed for the weight policy when no slot has been observed yet.
const DEFAULT_SLOT_DELAY: Duration = Duration::from_millis(100);

/// Weight multiplier for unchecked proxies relative to the fastest observed slot.
const UNCHECKED_WEIGHT_FACTOR: f64 = 10.0;

/// Number of proxies in each state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatusCounts {
    pub unchecked: usize,
    pub good: usize,
    pub dead: usize,
    pub reanimated: usize,
}

impl StatusCounts {
    pub fn get(&self, status: ProxyStatus) -> usize {
        match status {
            ProxyStatus::Unchecked => self.unchecked,
            ProxyStatus::Good => self.good,
            ProxyStatus::Dead => self.dead,
            ProxyStatus::Reanimated => self.reanimated,
        }
    }

    fn add(&mut self, status: ProxyStatus) {
        match status {
            ProxyStatus::Unchecked => self.unchecked += 1,
            ProxyStatus::Good => self.good += 1,
            ProxyStatus::Dead => self.dead += 1,
            ProxyStatus::Reanimated => self.reanimated += 1,
        }
    }

    /// Proxies that may currently be selected.
    pub fn eligible(&self) -> usize {
        self.unchecked + self.good + self.reanimated
    }
}

struct PoolState {
    proxies: Vec<Proxy>,
    /// Bumped by every mutation that can change eligibility or weights.
    generation: u64,
}

impl PoolState {
    fn invalidate(&mut self) {
        self.generation = self.generation.wrapping_add(1);
    }

    /// The record `proxy` was handed out for, if it belongs to this pool.
    fn record_mut(&mut self, proxy: &ProxyRef) -> Option<&mut Proxy> {
        match self.proxies.get_mut(proxy.id().index()) {
            Some(record) if record.url() == proxy.url() => Some(record),
            _ => {
                warn!("Proxy <{}> was not found in proxies list", proxy);
                None
            }
        }
    }

    fn status_counts(&self) -> StatusCounts {
        let mut counts = StatusCounts::default();
        for proxy in &self.proxies {
            counts.add(proxy.status);
        }
        counts
    }

    fn mean_backoff_amount(&self) -> Duration {
        let (sum, count) = self
            .proxies
            .iter()
            .filter(|p| p.status == ProxyStatus::Dead)
            .fold((0.0, 0u32), |(sum, count), p| {
                (sum + p.backoff.current_amount().as_secs_f64(), count + 1)
            });

        if count == 0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(sum / f64::from(count))
        }
    }
}

/// Eligible proxies paired with cumulative weights, built against one generation.
#[derive(Default)]
struct SelectionIndex {
    generation: Option<u64>,
    ids: Vec<ProxyId>,
    cumulative: Vec<f64>,
    rebuilds: u64,
}

impl SelectionIndex {
    fn refresh(&mut self, state: &PoolState) {
        if self.generation == Some(state.generation) {
            return;
        }

        self.ids.clear();
        self.cumulative.clear();
        let mut total = 0.0;
        for proxy in state.proxies.iter().filter(|p| p.status.is_eligible()) {
            total += proxy.weight;
            self.ids.push(proxy.id());
            self.cumulative.push(total);
        }
        self.generation = Some(state.generation);
        self.rebuilds += 1;
    }

    /// Inverse-CDF draw over the cumulative weights.
    fn draw<R: Rng + ?Sized>(&self, rng: &mut R) -> Option<ProxyId> {
        let total = *self.cumulative.last()?;
        let point = rng.random::<f64>() * total;
        let pos = self
            .cumulative
            .partition_point(|&c| c <= point)
            .min(self.ids.len() - 1);
        Some(self.ids[pos])
    }
}

/// A pool of proxies with weighted random selection and backoff-based quarantine.
///
/// Statuses and weights live behind one `RwLock`. The selection index is cached
/// separately and rebuilt under the read lock whenever its generation is stale, so a
/// rebuild can never observe a half-applied mutation.
pub struct ProxyPool {
    state: RwLock<PoolState>,
    index: Mutex<SelectionIndex>,
    rng: Mutex<StdRng>,
}

impl ProxyPool {
    /// Create a pool from raw proxy strings.
    ///
    /// Entries are trimmed, given an `http://` scheme when they lack one, and
    /// deduplicated. Blank entries are skipped. Any malformed entry fails the build.
    pub fn new<I, S>(proxies: I, backoff: BackoffPolicy) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self::with_rng(proxies, backoff, StdRng::from_os_rng())
    }

    /// Create a pool whose random draws come from `rng`.
    pub fn with_rng<I, S>(proxies: I, backoff: BackoffPolicy, rng: StdRng) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        backoff.validate()?;

        let mut seen = HashSet::new();
        let mut records = Vec::new();
        for raw in proxies {
            let raw = raw.as_ref();
            if raw.trim().is_empty() {
                continue;
            }
            let url = proxy::normalize(raw);
            if !seen.insert(url.clone()) {
                continue;
            }
            records.push(Proxy::parse(ProxyId(records.len()), url, backoff)?);
        }

        if records.is_empty() {
            return Err(ConfigError::EmptyProxyList);
        }
        info!("Proxy pool created with {} unique proxies", records.len());

        Ok(Self {
            state: RwLock::new(PoolState {
                proxies: records,
                generation: 0,
            }),
            index: Mutex::new(SelectionIndex::default()),
            rng: Mutex::new(rng),
        })
    }

    /// Create a pool from the proxy list, backoff bounds and seed of `config`.
    pub fn from_config(config: &ProxyPoolConfig) -> Result<Self, ConfigError> {
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        Self::with_rng(&config.proxies, config.backoff_policy(), rng)
    }

    /// Number of proxies in the pool.
    pub fn len(&self) -> usize {
        self.state.read().proxies.len()
    }

    /// Always false; an empty pool cannot be built.
    pub fn is_empty(&self) -> bool {
        self.state.read().proxies.is_empty()
    }

    /// Snapshot of every proxy, in construction order.
    pub fn proxies(&self) -> Vec<Proxy> {
        self.state.read().proxies.clone()
    }

    /// Snapshot of a single proxy.
    pub fn get(&self, id: ProxyId) -> Option<Proxy> {
        self.state.read().proxies.get(id.index()).cloned()
    }

    /// Look a proxy up by its normalized URL.
    pub fn find(&self, url: &str) -> Option<ProxyRef> {
        let url = proxy::normalize(url);
        self.state
            .read()
            .proxies
            .iter()
            .find(|p| p.url() == url)
            .map(Proxy::to_ref)
    }

    /// Current generation of the pool; changes whenever the selection index is invalidated.
    pub fn generation(&self) -> u64 {
        self.state.read().generation
    }

    /// Draw an eligible proxy with probability proportional to its weight.
    ///
    /// Returns `None` when every proxy is dead.
    pub fn select_random(&self) -> Option<ProxyRef> {
        let state = self.state.read();
        let mut index = self.index.lock();
        index.refresh(&state);
        let id = index.draw(&mut *self.rng.lock())?;
        Some(state.proxies[id.index()].to_ref())
    }

    /// Same as [`select_random`](Self::select_random) with a caller-supplied random source.
    pub fn select_random_with<R: Rng + ?Sized>(&self, rng: &mut R) -> Option<ProxyRef> {
        let state = self.state.read();
        let mut index = self.index.lock();
        index.refresh(&state);
        let id = index.draw(rng)?;
        Some(state.proxies[id.index()].to_ref())
    }

    /// Report a successful request. Returns true if the selection index was invalidated.
    pub fn mark_good(&self, proxy: &ProxyRef) -> bool {
        let mut state = self.state.write();
        let Some(record) = state.record_mut(proxy) else {
            return false;
        };

        let invalidate = record.mark_good();
        if invalidate {
            state.invalidate();
        }
        invalidate
    }

    /// Report a ban. Returns true if the selection index was invalidated.
    ///
    /// Reports against an already dead proxy do not extend its quarantine.
    pub fn mark_dead(&self, proxy: &ProxyRef) -> bool {
        self.mark_dead_at(proxy, Instant::now())
    }

    /// [`mark_dead`](Self::mark_dead) with the quarantine starting at `now`.
    pub fn mark_dead_at(&self, proxy: &ProxyRef, now: Instant) -> bool {
        let mut state = self.state.write();
        let Some(record) = state.record_mut(proxy) else {
            return false;
        };

        let invalidate = record.mark_dead(now, &mut *self.rng.lock());
        if invalidate {
            state.invalidate();
        }
        invalidate
    }

    /// Mark every proxy unchecked and zero every backoff.
    pub fn reset(&self) {
        let mut state = self.state.write();
        for proxy in state.proxies.iter_mut() {
            proxy.reset();
        }
        state.invalidate();
    }

    /// Refresh weights from per-slot delays and revive dead proxies whose backoff elapsed.
    ///
    /// `slot_delays` maps routing slot keys to the current average request delay of that
    /// slot. A zero delay carries no rate information and counts as unobserved.
    /// Returns the number of proxies moved from dead to reanimated.
    pub fn reanimate(&self, slot_delays: &HashMap<String, Duration>) -> usize {
        self.reanimate_at(slot_delays, Instant::now())
    }

    /// [`reanimate`](Self::reanimate) evaluated at `now`.
    pub fn reanimate_at(&self, slot_delays: &HashMap<String, Duration>, now: Instant) -> usize {
        let mut state = self.state.write();

        let delays: Vec<Option<f64>> = state
            .proxies
            .iter()
            .map(|p| {
                slot_delays
                    .get(p.slot_key())
                    .filter(|d| !d.is_zero())
                    .map(Duration::as_secs_f64)
            })
            .collect();

        let known: Vec<f64> = delays.iter().flatten().copied().collect();
        let (mean_delay, min_delay) = if known.is_empty() {
            let default = DEFAULT_SLOT_DELAY.as_secs_f64();
            (default, default)
        } else {
            let mean = known.iter().sum::<f64>() / known.len() as f64;
            let min = known.iter().copied().fold(f64::INFINITY, f64::min);
            (mean, min)
        };
        debug!("Reanimation sweep: mean delay {mean_delay:.3}s, min delay {min_delay:.3}s");

        let mut reanimated = 0;
        for (proxy, delay) in state.proxies.iter_mut().zip(delays) {
            // inverse delay approximates requests per second
            proxy.weight = match delay {
                Some(delay) => 1.0 / delay,
                None if proxy.status == ProxyStatus::Unchecked => {
                    UNCHECKED_WEIGHT_FACTOR / min_delay
                }
                None => 1.0 / mean_delay,
            };

            if proxy.reanimate(now) {
                reanimated += 1;
            }
        }

        state.invalidate();
        reanimated
    }

    /// Number of proxies in each state.
    pub fn status_counts(&self) -> StatusCounts {
        self.state.read().status_counts()
    }

    /// Mean quarantine length of the dead proxies, zero when none are dead.
    pub fn mean_backoff_amount(&self) -> Duration {
        self.state.read().mean_backoff_amount()
    }

    #[cfg(test)]
    fn index_rebuilds(&self) -> u64 {
        self.index.lock().rebuilds
    }
}

impl fmt::Display for ProxyPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (counts, mean_backoff) = {
            let state = self.state.read();
            (state.status_counts(), state.mean_backoff_amount())
        };
        write!(
            f,
            "Proxies(good: {}, dead: {}, unchecked: {}, reanimated: {}, mean backoff amount: {}s)",
            counts.good,
            counts.dead,
            counts.unchecked,
            counts.reanimated,
            mean_backoff.as_secs()
        )
    }
}
