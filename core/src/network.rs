// Connectivity transitions
//
// Only a move to a different network (or getting a network back after losing
// it) matters: locks are re-acquired on the new interface and the host is told
// so it can re-announce. Capability flicker on the same network is ignored.

use crate::locks::ResourceLockCoordinator;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkSnapshot {
    /// Host-assigned network identity
    pub network_id: String,
    /// `wifi`, `cellular`, `ethernet`, ...
    pub transport: String,
    pub has_internet: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkTransition {
    /// First observation; recorded, nothing triggered
    Baseline,
    Unchanged,
    Changed,
    Lost,
    Regained,
}

impl NetworkTransition {
    pub fn triggers_refresh(&self) -> bool {
        matches!(self, Self::Changed | Self::Regained)
    }
}

pub type NetworkChangedCallback = Arc<dyn Fn(&NetworkSnapshot) -> Result<(), String> + Send + Sync>;

#[derive(Default)]
struct Observed {
    seen: bool,
    network_id: Option<String>,
}

pub struct NetworkChangeCoordinator {
    locks: Arc<ResourceLockCoordinator>,
    on_changed: NetworkChangedCallback,
    observed: Mutex<Observed>,
}

impl NetworkChangeCoordinator {
    pub fn new(locks: Arc<ResourceLockCoordinator>, on_changed: NetworkChangedCallback) -> Self {
        Self {
            locks,
            on_changed,
            observed: Mutex::new(Observed::default()),
        }
    }

    /// Feed one snapshot; `None` means no active network
    pub fn observe(&self, snapshot: Option<&NetworkSnapshot>) -> NetworkTransition {
        let transition = {
            let mut observed = self.observed.lock();
            let next = snapshot.map(|s| s.network_id.clone());
            let transition = if !observed.seen {
                observed.seen = true;
                NetworkTransition::Baseline
            } else {
                match (&observed.network_id, &next) {
                    (Some(_), None) => NetworkTransition::Lost,
                    (None, None) => NetworkTransition::Unchanged,
                    (None, Some(_)) => NetworkTransition::Regained,
                    (Some(old), Some(new)) if old == new => NetworkTransition::Unchanged,
                    (Some(_), Some(_)) => NetworkTransition::Changed,
                }
            };
            observed.network_id = next;
            transition
        };

        match (transition, snapshot) {
            (NetworkTransition::Changed | NetworkTransition::Regained, Some(snapshot)) => {
                info!(
                    "Network {:?} ({}); refreshing locks",
                    transition, snapshot.transport
                );
                if let Err(e) = self.locks.acquire_all() {
                    warn!("Lock refresh after network change failed: {}", e);
                }
                if let Err(e) = (self.on_changed)(snapshot) {
                    warn!("Network change callback failed: {}", e);
                }
            }
            (NetworkTransition::Lost, _) => info!("Network lost"),
            _ => debug!("Network observation: {:?}", transition),
        }
        transition
    }

    /// Observe on a blocking worker: lock refresh and the host callback may
    /// call into the runtime
    async fn observe_blocking(self: &Arc<Self>, snapshot: Option<NetworkSnapshot>) {
        let coordinator = self.clone();
        if let Err(e) =
            tokio::task::spawn_blocking(move || coordinator.observe(snapshot.as_ref())).await
        {
            warn!("Network observation worker failed: {}", e);
        }
    }

    /// Follow a snapshot channel until cancelled or the sender goes away
    pub fn spawn(
        self: &Arc<Self>,
        mut snapshots: watch::Receiver<Option<NetworkSnapshot>>,
        token: CancellationToken,
        tracker: &TaskTracker,
    ) {
        let coordinator = self.clone();
        tracker.spawn(async move {
            let current = snapshots.borrow_and_update().clone();
            coordinator.observe_blocking(current).await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    changed = snapshots.changed() => {
                        if changed.is_err() {
                            debug!("Network snapshot sender dropped");
                            break;
                        }
                        let snapshot = snapshots.borrow_and_update().clone();
                        coordinator.observe_blocking(snapshot).await;
                    }
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LockConfig;
    use crate::locks::HostLocks;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn snapshot(id: &str, internet: bool) -> NetworkSnapshot {
        NetworkSnapshot {
            network_id: id.to_string(),
            transport: "wifi".to_string(),
            has_internet: internet,
        }
    }

    fn coordinator(fail: bool) -> (Arc<NetworkChangeCoordinator>, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let callback: NetworkChangedCallback = Arc::new(move |_snapshot| {
            counter.fetch_add(1, Ordering::SeqCst);
            if fail {
                Err("announce failed".to_string())
            } else {
                Ok(())
            }
        });
        let locks = Arc::new(ResourceLockCoordinator::new(
            LockConfig::default(),
            HostLocks::noop(),
        ));
        (
            Arc::new(NetworkChangeCoordinator::new(locks, callback)),
            calls,
        )
    }

    #[test]
    fn test_transitions() {
        let (coordinator, calls) = coordinator(false);
        let home = snapshot("home", true);
        assert_eq!(coordinator.observe(Some(&home)), NetworkTransition::Baseline);
        assert_eq!(
            coordinator.observe(Some(&snapshot("home", false))),
            NetworkTransition::Unchanged
        );
        assert_eq!(
            coordinator.observe(Some(&snapshot("office", true))),
            NetworkTransition::Changed
        );
        assert_eq!(coordinator.observe(None), NetworkTransition::Lost);
        assert_eq!(coordinator.observe(None), NetworkTransition::Unchanged);
        assert_eq!(
            coordinator.observe(Some(&snapshot("office", true))),
            NetworkTransition::Regained
        );
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_callback_failure_is_contained() {
        let (coordinator, calls) = coordinator(true);
        coordinator.observe(Some(&snapshot("a", true)));
        assert_eq!(
            coordinator.observe(Some(&snapshot("b", true))),
            NetworkTransition::Changed
        );
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_follows_watch_channel() {
        let (coordinator, calls) = coordinator(false);
        let (tx, rx) = watch::channel(Some(snapshot("a", true)));
        let token = CancellationToken::new();
        let tracker = TaskTracker::new();
        coordinator.spawn(rx, token.clone(), &tracker);
        // Let the task record its baseline
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        tx.send_replace(Some(snapshot("b", true)));
        for _ in 0..50 {
            if calls.load(Ordering::SeqCst) == 1 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        token.cancel();
        tracker.close();
        tracker.wait().await;
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_slow_callback_does_not_stall_runtime() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let callback: NetworkChangedCallback = Arc::new(move |_snapshot| {
            std::thread::sleep(std::time::Duration::from_millis(300));
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        let locks = Arc::new(ResourceLockCoordinator::new(
            LockConfig::default(),
            HostLocks::noop(),
        ));
        let coordinator = Arc::new(NetworkChangeCoordinator::new(locks, callback));
        let (tx, rx) = watch::channel(Some(snapshot("a", true)));
        let token = CancellationToken::new();
        let tracker = TaskTracker::new();
        coordinator.spawn(rx, token.clone(), &tracker);
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        tx.send_replace(Some(snapshot("b", true)));
        // Give the watch task a turn to pick up the change
        tokio::task::yield_now().await;
        let started = std::time::Instant::now();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(started.elapsed() < std::time::Duration::from_millis(200));

        for _ in 0..100 {
            if calls.load(Ordering::SeqCst) == 1 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        token.cancel();
        tracker.close();
        tracker.wait().await;
    }
}
