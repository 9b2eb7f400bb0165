//! Per-slot request delay tracking used to weight proxies.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;

/// Running delay estimate for each routing slot.
///
/// Every sample is blended as `(previous + sample) / 2`, so old observations fade
/// quickly and a slot that speeds up is rewarded within a few requests.
#[derive(Debug, Default)]
pub struct SlotDelays {
    delays: Mutex<HashMap<String, Duration>>,
}

impl SlotDelays {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record how long a request through `slot_key` took.
    pub fn record(&self, slot_key: &str, elapsed: Duration) {
        let mut delays = self.delays.lock();
        match delays.get_mut(slot_key) {
            Some(delay) => *delay = (*delay + elapsed) / 2,
            None => {
                delays.insert(slot_key.to_string(), elapsed);
            }
        }
    }

    pub fn get(&self, slot_key: &str) -> Option<Duration> {
        self.delays.lock().get(slot_key).copied()
    }

    /// Copy of the current estimates, as consumed by the reanimation sweep.
    pub fn snapshot(&self) -> HashMap<String, Duration> {
        self.delays.lock().clone()
    }
}
