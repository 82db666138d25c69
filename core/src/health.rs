//! Heartbeat supervision
//!
//! The runtime reports a liveness timestamp. A sample older than
//! `stale_after` counts as stale; `stale_threshold` consecutive stale samples
//! fire the recovery action once and reset the count. The loop reads the
//! heartbeat off the async workers under a timeout; a read that hangs is
//! itself a stale sample.

use crate::config::HealthConfig;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HealthError {
    #[error("Heartbeat sample failed: {0}")]
    Sample(String),
}

/// Returns the heartbeat in unix seconds, `None` while no runtime is bound
pub type HeartbeatSource = Arc<dyn Fn() -> Result<Option<f64>, HealthError> + Send + Sync>;

pub type RecoveryAction = Arc<dyn Fn() + Send + Sync>;

/// Outcome of one sampling step
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum HealthVerdict {
    /// Heartbeat unset; the counter was reset
    Uninitialized,
    Healthy,
    Stale { consecutive: u32 },
    /// Threshold reached; recovery was requested
    Recovering,
    /// Sampling failed; the counter was left alone
    Unobservable,
}

pub struct HealthMonitor {
    config: HealthConfig,
    source: HeartbeatSource,
    recovery: RecoveryAction,
    stale_count: AtomicU32,
    sampling: Arc<AtomicBool>,
    running: Mutex<Option<CancellationToken>>,
}

impl HealthMonitor {
    pub fn new(config: HealthConfig, source: HeartbeatSource, recovery: RecoveryAction) -> Self {
        Self {
            config,
            source,
            recovery,
            stale_count: AtomicU32::new(0),
            sampling: Arc::new(AtomicBool::new(false)),
            running: Mutex::new(None),
        }
    }

    pub fn stale_count(&self) -> u32 {
        self.stale_count.load(Ordering::SeqCst)
    }

    /// One sampling step against `now` (unix seconds); reads the source inline
    pub fn check(&self, now: f64) -> HealthVerdict {
        self.evaluate((self.source)(), now)
    }

    /// Sampling step used by the loop. The source runs on a blocking worker
    /// and must answer within `sample_timeout`; a read that does not answer
    /// counts as a stale sample. While a read is still outstanding no second
    /// one is started.
    pub async fn check_bounded(&self) -> HealthVerdict {
        if self.sampling.swap(true, Ordering::SeqCst) {
            return self.count_stale("previous read still outstanding");
        }

        let source = self.source.clone();
        let sampling = self.sampling.clone();
        let worker = tokio::task::spawn_blocking(move || {
            let sample = source();
            sampling.store(false, Ordering::SeqCst);
            sample
        });

        let timeout = self.config.sample_timeout();
        match tokio::time::timeout(timeout, worker).await {
            Ok(Ok(sample)) => self.evaluate(sample, now_secs()),
            Ok(Err(e)) => {
                self.sampling.store(false, Ordering::SeqCst);
                warn!("Heartbeat sampler failed: {}", e);
                HealthVerdict::Unobservable
            }
            Err(_) => {
                warn!("Heartbeat read did not answer within {:?}", timeout);
                self.count_stale("read timed out")
            }
        }
    }

    fn evaluate(&self, sample: Result<Option<f64>, HealthError>, now: f64) -> HealthVerdict {
        let heartbeat = match sample {
            Ok(heartbeat) => heartbeat,
            Err(e) => {
                warn!("Health check could not sample heartbeat: {}", e);
                return HealthVerdict::Unobservable;
            }
        };

        let heartbeat = match heartbeat {
            Some(hb) if hb > 0.0 => hb,
            _ => {
                self.stale_count.store(0, Ordering::SeqCst);
                return HealthVerdict::Uninitialized;
            }
        };

        let age = now - heartbeat;
        if age <= self.config.stale_after().as_secs_f64() {
            self.stale_count.store(0, Ordering::SeqCst);
            return HealthVerdict::Healthy;
        }
        self.count_stale(&format!("{:.0}s old", age))
    }

    fn count_stale(&self, detail: &str) -> HealthVerdict {
        let consecutive = self.stale_count.fetch_add(1, Ordering::SeqCst) + 1;
        if consecutive >= self.config.stale_threshold {
            self.stale_count.store(0, Ordering::SeqCst);
            warn!(
                "Heartbeat stale for {} consecutive checks ({}); requesting recovery",
                consecutive, detail
            );
            (self.recovery)();
            HealthVerdict::Recovering
        } else {
            debug!(
                "Heartbeat stale ({}), {} of {}",
                detail, consecutive, self.config.stale_threshold
            );
            HealthVerdict::Stale { consecutive }
        }
    }

    /// Start periodic sampling on the service scope
    pub fn start(self: &Arc<Self>, parent: &CancellationToken, tracker: &TaskTracker) {
        if !self.config.enabled {
            debug!("Health monitor disabled");
            return;
        }
        let token = {
            let mut running = self.running.lock();
            if running.is_some() {
                return;
            }
            let token = parent.child_token();
            *running = Some(token.clone());
            token
        };
        self.stale_count.store(0, Ordering::SeqCst);

        let monitor = self.clone();
        let period = self.config.interval();
        tracker.spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // First tick completes immediately; the runtime just came up
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = interval.tick() => {
                        monitor.check_bounded().await;
                    }
                }
            }
            debug!("Health monitor loop exited");
        });
        info!("Health monitor started (every {:?})", period);
    }

    pub fn stop(&self) {
        if let Some(token) = self.running.lock().take() {
            token.cancel();
            info!("Health monitor stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.lock().is_some()
    }
}

pub fn now_secs() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}
