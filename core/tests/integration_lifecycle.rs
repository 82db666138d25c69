//! Supervisor lifecycle: generations, serialization and the shutdown race

mod common;

use common::FakeFactory;
use meshlink_core::config::SupervisorConfig;
use meshlink_core::runtime::RuntimeFactory;
use meshlink_core::state::{ServiceStatus, ShutdownOutcome};
use meshlink_core::supervisor::{RuntimeSupervisor, SupervisorError};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

fn supervisor(factory: &Arc<FakeFactory>, config: SupervisorConfig) -> Arc<RuntimeSupervisor> {
    let factory: Arc<dyn RuntimeFactory> = factory.clone();
    Arc::new(RuntimeSupervisor::new(config, factory))
}

#[tokio::test]
async fn test_generation_is_monotonic() {
    let factory = FakeFactory::new();
    let supervisor = supervisor(&factory, SupervisorConfig::default());

    let mut last = supervisor.generation();
    for _ in 0..4 {
        let init = supervisor.initialize("{}", None).await.unwrap();
        assert!(init.generation > last);
        last = init.generation;
        supervisor.shutdown().await;
        assert_eq!(supervisor.generation(), last);
    }

    // A failed attempt still consumes a generation
    *factory.behaviour.init_error.lock() = Some("boom".to_string());
    assert!(supervisor.initialize("{}", None).await.is_err());
    assert_eq!(supervisor.generation(), last + 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_initialize_calls_never_overlap() {
    let factory = FakeFactory::new();
    *factory.behaviour.init_delay.lock() = Duration::from_millis(30);
    let supervisor = supervisor(&factory, SupervisorConfig::default());

    let tasks: Vec<_> = (0..6)
        .map(|_| {
            let supervisor = supervisor.clone();
            tokio::spawn(async move { supervisor.initialize("{}", None).await })
        })
        .collect();

    let mut generations = Vec::new();
    for task in tasks {
        generations.push(task.await.unwrap().unwrap().generation);
    }
    generations.sort_unstable();
    assert_eq!(generations, vec![1, 2, 3, 4, 5, 6]);
    assert_eq!(
        factory.behaviour.max_concurrent_inits.load(Ordering::SeqCst),
        1
    );
    // Each re-initialize shut down the handle it replaced
    assert_eq!(factory.behaviour.shutdowns.load(Ordering::SeqCst), 5);
    assert_eq!(supervisor.status(), ServiceStatus::Ready);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_stale_shutdown_does_not_clobber_new_generation() {
    let factory = FakeFactory::new();
    let supervisor = supervisor(
        &factory,
        SupervisorConfig {
            shutdown_drain_timeout_ms: 50,
            ..Default::default()
        },
    );
    supervisor.initialize("{}", None).await.unwrap();

    *factory.behaviour.shutdown_delay.lock() = Duration::from_millis(300);
    let shutdown = {
        let supervisor = supervisor.clone();
        tokio::spawn(async move { supervisor.shutdown().await })
    };
    // Let the shutdown capture the handle
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(supervisor.has_shutdown_in_flight());

    *factory.behaviour.shutdown_delay.lock() = Duration::ZERO;
    let init = supervisor.initialize("{}", None).await.unwrap();
    assert_eq!(init.generation, 2);
    assert_eq!(supervisor.status(), ServiceStatus::Ready);

    // The generation-1 completion lands after the new handle is live
    assert_eq!(shutdown.await.unwrap(), ShutdownOutcome::Completed);
    assert_eq!(supervisor.status(), ServiceStatus::Ready);
    assert!(supervisor.is_initialized());
    assert!(!supervisor.has_shutdown_in_flight());
}

#[tokio::test]
async fn test_initialize_waits_for_pending_shutdown() {
    let factory = FakeFactory::new();
    let supervisor = supervisor(&factory, SupervisorConfig::default());
    supervisor.initialize("{}", None).await.unwrap();

    *factory.behaviour.shutdown_delay.lock() = Duration::from_millis(100);
    let shutdown = {
        let supervisor = supervisor.clone();
        tokio::spawn(async move { supervisor.shutdown().await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;

    supervisor.initialize("{}", None).await.unwrap();
    // Drained before the factory was asked for a new handle
    assert_eq!(factory.behaviour.shutdowns.load(Ordering::SeqCst), 1);
    assert_eq!(shutdown.await.unwrap(), ShutdownOutcome::Completed);
    assert_eq!(factory.created(), 2);
}

#[tokio::test]
async fn test_init_timeout_reports_error_status() {
    let factory = FakeFactory::new();
    *factory.behaviour.init_delay.lock() = Duration::from_millis(300);
    let supervisor = supervisor(
        &factory,
        SupervisorConfig {
            init_timeout_ms: 50,
            ..Default::default()
        },
    );

    let err = supervisor.initialize("{}", None).await.unwrap_err();
    assert_eq!(err, SupervisorError::InitTimeout(Duration::from_millis(50)));
    assert_eq!(
        supervisor.status(),
        ServiceStatus::Error("Initialization timed out".to_string())
    );
    assert!(!supervisor.is_initialized());
    assert_eq!(supervisor.with_runtime(|rt| rt.heartbeat()), None);
}

#[tokio::test]
async fn test_init_failure_is_sanitized() {
    let factory = FakeFactory::new();
    *factory.behaviour.init_error.lock() =
        Some("ModuleNotFoundError: No module named 'RNS'".to_string());
    let supervisor = supervisor(&factory, SupervisorConfig::default());

    match supervisor.initialize("{}", None).await {
        Err(SupervisorError::InitFailure(message)) => {
            assert!(!message.contains("RNS"));
            assert_eq!(
                supervisor.status(),
                ServiceStatus::Error(message.clone())
            );
        }
        other => panic!("unexpected result: {:?}", other),
    }
}

#[tokio::test]
async fn test_status_watch_follows_lifecycle() {
    let factory = FakeFactory::new();
    let supervisor = supervisor(&factory, SupervisorConfig::default());
    let mut status = supervisor.subscribe_status();
    assert_eq!(*status.borrow_and_update(), ServiceStatus::Shutdown);

    supervisor.initialize("{}", None).await.unwrap();
    assert!(status.has_changed().unwrap());
    assert_eq!(*status.borrow_and_update(), ServiceStatus::Ready);

    supervisor.shutdown().await;
    assert_eq!(*status.borrow_and_update(), ServiceStatus::Shutdown);
}
