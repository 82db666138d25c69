//! Host resource locks
//!
//! Two locks keep the mesh reachable while the host idles: a multicast
//! receive lock (peer discovery on local networks) and a CPU wake lock. The
//! host caps the wake lock's lifetime, so a periodic maintenance tick renews
//! it before the cap and re-acquires anything the host revoked.

use crate::config::LockConfig;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LockError {
    #[error("Failed to acquire {kind} lock: {reason}")]
    Acquire { kind: LockKind, reason: String },

    #[error("Failed to release {kind} lock: {reason}")]
    Release { kind: LockKind, reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockKind {
    Multicast,
    Wake,
}

impl std::fmt::Display for LockKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Multicast => write!(f, "multicast"),
            Self::Wake => write!(f, "wake"),
        }
    }
}

/// One host lock as the platform exposes it
///
/// Errors carry a plain reason; the coordinator attaches the lock kind.
#[cfg_attr(test, mockall::automock)]
pub trait HostLock: Send + Sync {
    /// Acquire, optionally with a host-enforced expiry
    fn acquire(&self, timeout: Option<Duration>) -> Result<(), String>;

    fn release(&self) -> Result<(), String>;

    /// Whether the host still considers the lock held
    fn is_held(&self) -> bool;
}

/// Host locks handed to the service
#[derive(Clone)]
pub struct HostLocks {
    pub multicast: Arc<dyn HostLock>,
    pub wake: Arc<dyn HostLock>,
}

/// No-op lock for hosts without the concept
#[derive(Debug, Default)]
pub struct NoopLock {
    held: std::sync::atomic::AtomicBool,
}

impl HostLock for NoopLock {
    fn acquire(&self, _timeout: Option<Duration>) -> Result<(), String> {
        self.held.store(true, std::sync::atomic::Ordering::SeqCst);
        Ok(())
    }

    fn release(&self) -> Result<(), String> {
        self.held.store(false, std::sync::atomic::Ordering::SeqCst);
        Ok(())
    }

    fn is_held(&self) -> bool {
        self.held.load(std::sync::atomic::Ordering::SeqCst)
    }
}

impl HostLocks {
    pub fn noop() -> Self {
        Self {
            multicast: Arc::new(NoopLock::default()),
            wake: Arc::new(NoopLock::default()),
        }
    }
}

struct TrackedLock {
    kind: LockKind,
    lock: Arc<dyn HostLock>,
    acquired_at: Option<Instant>,
}

impl TrackedLock {
    fn new(kind: LockKind, lock: Arc<dyn HostLock>) -> Self {
        Self {
            kind,
            lock,
            acquired_at: None,
        }
    }

    fn acquire(&mut self, timeout: Option<Duration>, now: Instant) -> Result<(), LockError> {
        self.lock.acquire(timeout).map_err(|reason| LockError::Acquire {
            kind: self.kind,
            reason,
        })?;
        self.acquired_at = Some(now);
        Ok(())
    }

    fn release(&mut self) -> Result<(), LockError> {
        self.acquired_at = None;
        if !self.lock.is_held() {
            return Ok(());
        }
        self.lock.release().map_err(|reason| LockError::Release {
            kind: self.kind,
            reason,
        })
    }
}

struct LockSet {
    multicast: TrackedLock,
    wake: TrackedLock,
}

/// Point-in-time view of the lock set
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockStatus {
    pub multicast_held: bool,
    pub wake_held: bool,
    pub wake_age: Option<Duration>,
}

pub struct ResourceLockCoordinator {
    config: LockConfig,
    locks: Mutex<LockSet>,
}

impl ResourceLockCoordinator {
    pub fn new(config: LockConfig, locks: HostLocks) -> Self {
        Self {
            config,
            locks: Mutex::new(LockSet {
                multicast: TrackedLock::new(LockKind::Multicast, locks.multicast),
                wake: TrackedLock::new(LockKind::Wake, locks.wake),
            }),
        }
    }

    /// Acquire both locks; idempotent, also repairs expired or aging locks
    ///
    /// Both locks are attempted even when the first fails; the first error
    /// is returned.
    pub fn acquire_all(&self) -> Result<(), LockError> {
        self.acquire_all_at(Instant::now())
    }

    fn acquire_all_at(&self, now: Instant) -> Result<(), LockError> {
        let mut set = self.locks.lock();
        let multicast = Self::ensure_multicast(&mut set.multicast, now);
        let wake = self.ensure_wake(&mut set.wake, now);
        multicast.and(wake)
    }

    fn ensure_multicast(tracked: &mut TrackedLock, now: Instant) -> Result<(), LockError> {
        match tracked.acquired_at {
            Some(_) if tracked.lock.is_held() => Ok(()),
            Some(_) => {
                info!("Multicast lock was released by the host; re-acquiring");
                tracked.acquire(None, now)
            }
            None => {
                debug!("Acquiring multicast lock");
                tracked.acquire(None, now)
            }
        }
    }

    fn ensure_wake(&self, tracked: &mut TrackedLock, now: Instant) -> Result<(), LockError> {
        let timeout = self.config.wake_lock_timeout();
        let renew_after = timeout.saturating_sub(self.config.renew_margin());
        match tracked.acquired_at {
            Some(at) if tracked.lock.is_held() => {
                if now.saturating_duration_since(at) < renew_after {
                    return Ok(());
                }
                info!("Renewing wake lock before host expiry");
                if let Err(e) = tracked.release() {
                    warn!("{}", e);
                }
                tracked.acquire(Some(timeout), now)
            }
            Some(_) => {
                info!("Wake lock expired on the host; re-acquiring");
                tracked.acquire(Some(timeout), now)
            }
            None => {
                debug!("Acquiring wake lock ({:?})", timeout);
                tracked.acquire(Some(timeout), now)
            }
        }
    }

    pub fn release_all(&self) -> Result<(), LockError> {
        let mut set = self.locks.lock();
        let multicast = set.multicast.release();
        let wake = set.wake.release();
        info!("Released host locks");
        multicast.and(wake)
    }

    pub fn status(&self) -> LockStatus {
        self.status_at(Instant::now())
    }

    fn status_at(&self, now: Instant) -> LockStatus {
        let set = self.locks.lock();
        LockStatus {
            multicast_held: set.multicast.acquired_at.is_some() && set.multicast.lock.is_held(),
            wake_held: set.wake.acquired_at.is_some() && set.wake.lock.is_held(),
            wake_age: set
                .wake
                .acquired_at
                .map(|at| now.saturating_duration_since(at)),
        }
    }

    /// Periodic refresh on the service scope; failures retry on the next tick
    pub fn spawn_maintenance(self: &Arc<Self>, token: CancellationToken, tracker: &TaskTracker) {
        let coordinator = self.clone();
        let period = self.config.refresh_interval();
        tracker.spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = interval.tick() => {
                        if let Err(e) = coordinator.acquire_all() {
                            warn!("Lock maintenance failed, retrying next tick: {}", e);
                        }
                    }
                }
            }
            debug!("Lock maintenance loop exited");
        });
    }
}
