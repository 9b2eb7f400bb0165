//! Background timers driving the pool: periodic reanimation and stats logging.

use crate::pool::ProxyPool;
use crate::slots::SlotDelays;

use log::{debug, info};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};

/// Running maintenance tasks. Dropping the handle stops them.
pub struct MaintenanceHandle {
    shutdown: watch::Sender<()>,
    tasks: Vec<JoinHandle<()>>,
}

impl MaintenanceHandle {
    /// Start the maintenance tasks on the current tokio runtime.
    ///
    /// The reanimation sweep first runs one interval after start; the stats logger
    /// runs immediately. A zero interval disables the corresponding task.
    pub fn start(
        pool: Arc<ProxyPool>,
        delays: Arc<SlotDelays>,
        reanimate_interval: Duration,
        log_stats_interval: Duration,
    ) -> Self {
        let (shutdown, _) = watch::channel(());
        let mut tasks = Vec::new();

        if !reanimate_interval.is_zero() {
            let pool = Arc::clone(&pool);
            let mut shutdown_rx = shutdown.subscribe();
            tasks.push(tokio::spawn(async move {
                let mut ticker =
                    time::interval_at(Instant::now() + reanimate_interval, reanimate_interval);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        biased;
                        _ = shutdown_rx.changed() => return,
                        _ = ticker.tick() => {
                            let reanimated = pool.reanimate(&delays.snapshot());
                            if reanimated > 0 {
                                debug!("{} proxies moved from 'dead' to 'reanimated'", reanimated);
                            }
                        }
                    }
                }
            }));
        }

        if !log_stats_interval.is_zero() {
            let mut shutdown_rx = shutdown.subscribe();
            tasks.push(tokio::spawn(async move {
                let mut ticker = time::interval(log_stats_interval);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        biased;
                        _ = shutdown_rx.changed() => return,
                        _ = ticker.tick() => info!("{}", pool),
                    }
                }
            }));
        }

        Self { shutdown, tasks }
    }

    /// Ask every task to exit.
    pub fn stop(&self) {
        let _ = self.shutdown.send(());
    }

    /// Whether any task is still running.
    pub fn is_running(&self) -> bool {
        self.tasks.iter().any(|task| !task.is_finished())
    }
}

impl Drop for MaintenanceHandle {
    fn drop(&mut self) {
        self.stop();
        for task in &self.tasks {
            task.abort();
        }
    }
}
