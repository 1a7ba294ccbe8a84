use std::time::Duration;
use anyhow::bail;

pub struct ProtocolConfig {
    /// An in-order message that was received is acknowledged at the latest after this delay. Any
    ///  outgoing frame carries the current ack, so a separate `Ack` frame is only sent if there
    ///  was no outgoing traffic in the meantime.
    pub ack_delay: Duration,

    /// If the oldest unacknowledged message, the most recently received data and the most
    ///  recently reported timeout are *all* older than this, the socket is reported as timed
    ///  out (unless the local process is under high load, see `LoadEstimator`).
    pub unacknowledged_timeout: Duration,

    /// Interval for sending `KeepAlive` frames to prevent idle connections from being closed by
    ///  network equipment along the route. `None` means no keep-alive frames are sent.
    pub keep_alive_interval: Option<Duration>,

    /// A `ReplayRequest` is sent when a gap in the sequence is detected - but at most once
    ///  per this interval, to avoid a request storm when a burst of messages arrives after a gap
    pub replay_request_min_interval: Duration,

    /// lower bound for the delay before re-checking for a socket timeout
    pub min_timeout_check_delay: Duration,

    /// added to a scheduled ack check so it is sure to fire *after* the ack delay expired
    pub ack_check_slack: Duration,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        ProtocolConfig {
            ack_delay: Duration::from_millis(2000),
            unacknowledged_timeout: Duration::from_millis(20000),
            keep_alive_interval: Some(Duration::from_millis(5000)),
            replay_request_min_interval: Duration::from_millis(10000),
            min_timeout_check_delay: Duration::from_millis(500),
            ack_check_slack: Duration::from_millis(5),
        }
    }
}

impl ProtocolConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.ack_delay.is_zero() {
            bail!("ack delay must be positive");
        }
        if self.unacknowledged_timeout.is_zero() {
            bail!("unacknowledged timeout must be positive");
        }
        if self.keep_alive_interval.is_some_and(|d| d.is_zero()) {
            bail!("keep-alive interval must be positive - use `None` to disable keep-alive");
        }
        if self.min_timeout_check_delay.is_zero() {
            // a zero delay would turn the timeout watchdog into a busy loop under high load
            bail!("minimum timeout check delay must be positive");
        }
        Ok(())
    }
}

pub struct LoadEstimatorConfig {
    /// interval between two heartbeats of the sampling task
    pub sample_interval: Duration,
    /// number of heartbeat timestamps that are retained
    pub history_len: usize,
    /// `load()` values at or above this are reported as high load
    pub high_load_threshold: f64,
}

impl Default for LoadEstimatorConfig {
    fn default() -> Self {
        LoadEstimatorConfig {
            sample_interval: Duration::from_millis(1000),
            history_len: 10,
            high_load_threshold: 0.5,
        }
    }
}

impl LoadEstimatorConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.sample_interval.is_zero() {
            bail!("sample interval must be positive");
        }
        if self.history_len == 0 {
            bail!("load history must contain at least one sample");
        }
        if !(0.0..=1.0).contains(&self.high_load_threshold) {
            bail!("high load threshold must be between 0 and 1, was {}", self.high_load_threshold);
        }
        Ok(())
    }
}
