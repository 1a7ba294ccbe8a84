//! A socket timeout alone can not distinguish between an unresponsive peer and a local process
//!  that was too busy to process incoming data in time. A load estimator tells these two
//!  situations apart, allowing timeout handling to hold back while the local process is
//!  overloaded.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
#[cfg(test)] use mockall::automock;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, trace, warn};
use crate::config::LoadEstimatorConfig;

#[cfg_attr(test, automock)]
pub trait LoadEstimator: Send + Sync + 'static {
    /// an estimate between 0.0 (no load) and 1.0 (high load)
    fn load(&self) -> f64;

    fn has_high_load(&self) -> bool;
}

/// Estimates load by running a heartbeat task at a fixed interval, recording the timestamps
///  when it actually ran. If the scheduler is too busy to run it in time, heartbeats go missing,
///  and `load()` returns the fraction of missing heartbeats in the recent history.
///
/// The heartbeat task runs between `start()` and `stop()` and is shared by all protocol
///  instances that were given this estimator.
pub struct SchedulerLoadEstimator {
    config: Arc<LoadEstimatorConfig>,
    /// most recent heartbeat first
    last_runs: Arc<Mutex<VecDeque<Instant>>>,
    sampler_handle: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for SchedulerLoadEstimator {
    fn drop(&mut self) {
        self.stop();
    }
}

impl SchedulerLoadEstimator {
    pub fn new(config: Arc<LoadEstimatorConfig>) -> anyhow::Result<SchedulerLoadEstimator> {
        config.validate()?;

        // start with a full, regular history to avoid a spurious high load initially
        let now = Instant::now();
        let last_runs = (0..config.history_len)
            .map(|i| now.checked_sub(config.sample_interval * i as u32).unwrap_or(now))
            .collect();

        Ok(SchedulerLoadEstimator {
            config,
            last_runs: Arc::new(Mutex::new(last_runs)),
            sampler_handle: Mutex::new(None),
        })
    }

    pub fn start(&self) {
        let mut sampler_handle = self.sampler_handle.lock().unwrap();
        if sampler_handle.is_some() {
            warn!("load estimator is already running");
            return;
        }

        debug!("starting load estimator with interval {:?}", self.config.sample_interval);
        *sampler_handle = Some(tokio::spawn(Self::do_loop(self.config.clone(), self.last_runs.clone())));
    }

    pub fn stop(&self) {
        if let Some(handle) = self.sampler_handle.lock().unwrap().take() {
            debug!("stopping load estimator");
            handle.abort();
        }
    }

    async fn do_loop(config: Arc<LoadEstimatorConfig>, last_runs: Arc<Mutex<VecDeque<Instant>>>) {
        let mut sample_interval = interval_at(Instant::now() + config.sample_interval, config.sample_interval);
        // catching up with a burst of ticks after a stall would hide the stall
        sample_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            sample_interval.tick().await;
            let mut last_runs = last_runs.lock().unwrap();
            last_runs.push_front(Instant::now());
            last_runs.truncate(config.history_len);
        }
    }
}

impl LoadEstimator for SchedulerLoadEstimator {
    fn load(&self) -> f64 {
        let now = Instant::now();
        let history_limit = self.config.sample_interval * (self.config.history_len as u32 + 1);

        let num_recent = self.last_runs.lock().unwrap()
            .iter()
            .filter(|&&t| now.saturating_duration_since(t) <= history_limit)
            .count();

        1.0 - num_recent as f64 / self.config.history_len as f64
    }

    fn has_high_load(&self) -> bool {
        let load = self.load();
        let result = load >= self.config.high_load_threshold;
        if result {
            trace!("high load: {}", load);
        }
        result
    }
}

/// Reports a constant load, e.g. for applications that do not want timeouts to depend on local
///  scheduling delays
pub struct FixedLoadEstimator {
    load: f64,
    high_load_threshold: f64,
}

impl FixedLoadEstimator {
    pub fn new(load: f64) -> FixedLoadEstimator {
        FixedLoadEstimator {
            load: load.clamp(0.0, 1.0),
            high_load_threshold: LoadEstimatorConfig::default().high_load_threshold,
        }
    }

    pub fn no_load() -> FixedLoadEstimator {
        Self::new(0.0)
    }
}

impl LoadEstimator for FixedLoadEstimator {
    fn load(&self) -> f64 {
        self.load
    }

    fn has_high_load(&self) -> bool {
        self.load >= self.high_load_threshold
    }
}
