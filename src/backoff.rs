//! Bounded exponential backoff shared by every readiness wait
//!
//! A probe is polled until it reports success or the deadline passes. The
//! deadline is fixed when the wait begins; failed probes never extend it.

use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Retry schedule for a readiness wait
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    /// Delay after the first failed probe
    pub initial_delay: Duration,
    /// Growth factor applied to the delay after each failed probe
    pub multiplier: f64,
    /// Upper bound for a single delay
    pub max_delay: Duration,
    /// Total time allowed, measured from the start of the wait
    pub timeout: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(200),
            multiplier: 2.0,
            max_delay: Duration::from_secs(5),
            timeout: Duration::from_secs(10),
        }
    }
}

/// Returned when the deadline passes without a successful probe
#[derive(Debug, Clone, PartialEq)]
pub struct Timeout {
    pub elapsed: Duration,
    pub attempts: u32,
    /// The most recent probe failure
    pub last_error: String,
}

impl BackoffPolicy {
    /// Same schedule with a different total timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// The delay that follows `delay` after another failed probe
    pub fn next_delay(&self, delay: Duration) -> Duration {
        let grown = delay.mul_f64(self.multiplier.max(1.0));
        grown.min(self.max_delay)
    }

    /// Poll `probe` until it yields `Ok(true)`.
    ///
    /// `Ok(false)` and `Err(_)` are both treated as "not yet" and absorbed until
    /// the deadline. Sleeps are clipped to the remaining time, so this returns
    /// within `timeout` plus the latency of one probe. On success the number of
    /// probes made is returned.
    pub async fn wait_until<F, Fut>(&self, mut probe: F) -> Result<u32, Timeout>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = anyhow::Result<bool>>,
    {
        let start = Instant::now();
        let deadline = start + self.timeout;
        let mut delay = self.initial_delay.min(self.max_delay);
        let mut attempts = 0u32;

        loop {
            attempts += 1;
            let last_error = match probe().await {
                Ok(true) => return Ok(attempts),
                Ok(false) => "probe reported not ready".to_string(),
                Err(e) => format!("{e:#}"),
            };

            let now = Instant::now();
            if now >= deadline {
                return Err(Timeout {
                    elapsed: now - start,
                    attempts,
                    last_error,
                });
            }

            debug!(attempts, delay_ms = delay.as_millis() as u64, error = %last_error, "Probe failed, backing off");
            tokio::time::sleep(delay.min(deadline - now)).await;
            delay = self.next_delay(delay);
        }
    }
}
