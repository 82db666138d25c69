//! Runtime supervisor
//!
//! Owns the single runtime handle and serializes its lifecycle. Every
//! initialize advances a generation counter; a shutdown is stamped with the
//! generation current when it was issued and may only move the status to
//! `Shutdown` if that generation is still current when it completes. A slow
//! shutdown therefore cannot clobber the state of a newer runtime.

pub mod affinity;
pub mod sanitize;

use crate::config::SupervisorConfig;
use crate::runtime::{MeshRuntime, RuntimeError, RuntimeFactory};
use crate::state::{InFlightShutdown, ServiceState, ServiceStatus, ShutdownOutcome};
use affinity::{panic_message, AffinityError, AffinityExecutor};
use futures::FutureExt;
use parking_lot::Mutex;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

pub use sanitize::sanitize_init_error;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SupervisorError {
    #[error("Runtime initialization timed out after {0:?}")]
    InitTimeout(Duration),

    #[error("Runtime initialization failed: {0}")]
    InitFailure(String),

    #[error("Runtime not initialized")]
    NotInitialized,

    #[error("Runtime error: {0}")]
    Runtime(#[from] RuntimeError),
}

/// Hook run against a fresh handle before its initialize call
///
/// Receives the generation the handle will live in. Push callbacks are
/// registered here so nothing emitted during initialize is lost.
pub type PreInitHook = Box<dyn FnOnce(&dyn MeshRuntime, u64) -> Result<(), RuntimeError> + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InitSuccess {
    pub is_shared_instance: bool,
    pub generation: u64,
}

// ============================================================================
// LIFECYCLE CALLS
// ============================================================================

#[derive(Debug)]
enum CallError {
    TimedOut,
    Panicked(String),
    Unavailable(String),
}

/// Moves blocking native calls off the async workers and bounds them
#[derive(Clone)]
struct CallRunner {
    affinity: Option<Arc<AffinityExecutor>>,
}

impl CallRunner {
    async fn run<T, F>(&self, timeout: Duration, f: F) -> Result<T, CallError>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        match &self.affinity {
            Some(executor) => match tokio::time::timeout(timeout, executor.run(f)).await {
                Err(_) => Err(CallError::TimedOut),
                Ok(Ok(value)) => Ok(value),
                Ok(Err(AffinityError::Panicked(message))) => Err(CallError::Panicked(message)),
                Ok(Err(e)) => Err(CallError::Unavailable(e.to_string())),
            },
            None => match tokio::time::timeout(timeout, tokio::task::spawn_blocking(f)).await {
                Err(_) => Err(CallError::TimedOut),
                Ok(Ok(value)) => Ok(value),
                Ok(Err(join)) if join.is_panic() => {
                    Err(CallError::Panicked(panic_message(join.into_panic().as_ref())))
                }
                Ok(Err(join)) => Err(CallError::Unavailable(join.to_string())),
            },
        }
    }

    async fn shutdown_native(
        &self,
        runtime: Arc<dyn MeshRuntime>,
        timeout: Duration,
    ) -> ShutdownOutcome {
        match self.run(timeout, move || runtime.shutdown()).await {
            Ok(Ok(())) => ShutdownOutcome::Completed,
            Ok(Err(e)) => {
                warn!("Runtime shutdown failed: {}", e);
                ShutdownOutcome::Failed(e.to_string())
            }
            Err(CallError::TimedOut) => {
                warn!("Runtime shutdown timed out after {:?}; abandoning", timeout);
                ShutdownOutcome::TimedOut
            }
            Err(CallError::Panicked(message)) | Err(CallError::Unavailable(message)) => {
                error!("Runtime shutdown aborted: {}", message);
                ShutdownOutcome::Failed(message)
            }
        }
    }
}

enum InitStepError {
    Hook(RuntimeError),
    Init(RuntimeError),
}

// ============================================================================
// SUPERVISOR
// ============================================================================

pub struct RuntimeSupervisor {
    config: SupervisorConfig,
    factory: Arc<dyn RuntimeFactory>,
    state: Arc<Mutex<ServiceState>>,
    lifecycle: tokio::sync::Mutex<()>,
    runner: CallRunner,
}

impl RuntimeSupervisor {
    pub fn new(config: SupervisorConfig, factory: Arc<dyn RuntimeFactory>) -> Self {
        let affinity = config
            .pin_to_affinity_thread
            .then(|| Arc::new(AffinityExecutor::new("meshlink-runtime")));
        Self {
            config,
            factory,
            state: Arc::new(Mutex::new(ServiceState::new())),
            lifecycle: tokio::sync::Mutex::new(()),
            runner: CallRunner { affinity },
        }
    }

    /// Bring up a fresh runtime handle
    ///
    /// Serialized with every other initialize and with shutdown capture. An
    /// in-flight shutdown is awaited first, bounded by the drain timeout.
    pub async fn initialize(
        &self,
        config_json: &str,
        pre_init: Option<PreInitHook>,
    ) -> Result<InitSuccess, SupervisorError> {
        let _lifecycle = self.lifecycle.lock().await;

        let pending = self
            .state
            .lock()
            .shutdown_in_flight
            .as_ref()
            .map(|s| s.completion.clone());
        if let Some(completion) = pending {
            let budget = self.config.shutdown_drain_timeout();
            match tokio::time::timeout(budget, completion).await {
                Ok(outcome) => debug!("In-flight shutdown drained: {:?}", outcome),
                Err(_) => warn!(
                    "In-flight shutdown still running after {:?}; initializing anyway",
                    budget
                ),
            }
        }

        let (generation, previous) = {
            let mut state = self.state.lock();
            state.generation += 1;
            state.set_status(ServiceStatus::Initializing);
            (state.generation, state.runtime.take())
        };
        info!("Initializing runtime (generation {})", generation);

        if let Some(previous) = previous {
            info!("Shutting down previous runtime before re-initializing");
            let outcome = self
                .runner
                .shutdown_native(previous, self.config.shutdown_timeout())
                .await;
            debug!("Previous runtime shutdown: {:?}", outcome);
        }

        let runtime = match self.factory.create() {
            Ok(runtime) => runtime,
            Err(e) => {
                return Err(self.fail_init(SupervisorError::InitFailure(sanitize_init_error(
                    &e.to_string(),
                ))))
            }
        };

        let handle = runtime.clone();
        let config_json = config_json.to_string();
        let timeout = self.config.init_timeout();
        let result = self
            .runner
            .run(timeout, move || {
                if let Some(hook) = pre_init {
                    hook(handle.as_ref(), generation).map_err(InitStepError::Hook)?;
                }
                handle.initialize(&config_json).map_err(InitStepError::Init)
            })
            .await;

        let init = match result {
            Ok(Ok(init)) => init,
            Ok(Err(InitStepError::Hook(e))) => {
                error!("Pre-init hook failed: {}", e);
                return Err(self.fail_init(SupervisorError::InitFailure(sanitize_init_error(
                    &e.to_string(),
                ))));
            }
            Ok(Err(InitStepError::Init(e))) => {
                error!("Runtime initialize failed: {}", e);
                return Err(self.fail_init(SupervisorError::InitFailure(sanitize_init_error(
                    &e.to_string(),
                ))));
            }
            Err(CallError::TimedOut) => {
                error!("Runtime initialize timed out after {:?}", timeout);
                return Err(self.fail_init(SupervisorError::InitTimeout(timeout)));
            }
            Err(CallError::Panicked(message)) | Err(CallError::Unavailable(message)) => {
                error!("Runtime initialize aborted: {}", message);
                return Err(self.fail_init(SupervisorError::InitFailure(sanitize_init_error(
                    &message,
                ))));
            }
        };

        let mut state = self.state.lock();
        state.runtime = Some(runtime);
        state.set_status(ServiceStatus::Ready);
        info!(
            "Runtime ready (generation {}, shared instance: {})",
            generation, init.is_shared_instance
        );
        Ok(InitSuccess {
            is_shared_instance: init.is_shared_instance,
            generation,
        })
    }

    fn fail_init(&self, error: SupervisorError) -> SupervisorError {
        let message = match &error {
            SupervisorError::InitTimeout(_) => "Initialization timed out".to_string(),
            SupervisorError::InitFailure(message) => message.clone(),
            other => sanitize_init_error(&other.to_string()),
        };
        self.state.lock().set_status(ServiceStatus::Error(message));
        error
    }

    /// Shut down the current handle
    ///
    /// The handle is captured and cleared under the lifecycle lock; the native
    /// call runs after the lock is released on its own task, so it completes
    /// even when the caller stops waiting.
    pub async fn shutdown(&self) -> ShutdownOutcome {
        let completion = {
            let _lifecycle = self.lifecycle.lock().await;
            let mut state = self.state.lock();
            match state.runtime.take() {
                None => match &state.shutdown_in_flight {
                    Some(in_flight) => in_flight.completion.clone(),
                    None => {
                        state.set_status(ServiceStatus::Shutdown);
                        return ShutdownOutcome::Idle;
                    }
                },
                Some(runtime) => {
                    let generation = state.generation;
                    state.shutdown_tickets += 1;
                    let ticket = state.shutdown_tickets;
                    info!("Shutting down runtime (generation {})", generation);

                    let task = tokio::spawn(complete_shutdown(
                        self.state.clone(),
                        self.runner.clone(),
                        runtime,
                        generation,
                        ticket,
                        self.config.shutdown_timeout(),
                    ));
                    let completion = async move {
                        task.await
                            .unwrap_or_else(|e| ShutdownOutcome::Failed(e.to_string()))
                    }
                    .boxed()
                    .shared();
                    state.shutdown_in_flight = Some(InFlightShutdown {
                        ticket,
                        completion: completion.clone(),
                    });
                    completion
                }
            }
        };
        completion.await
    }

    /// Run a call against the live handle
    ///
    /// The handle is cloned under the state lock and used outside it.
    pub fn call<T>(
        &self,
        f: impl FnOnce(&dyn MeshRuntime) -> Result<T, RuntimeError>,
    ) -> Result<T, SupervisorError> {
        let runtime = self
            .state
            .lock()
            .runtime
            .clone()
            .ok_or(SupervisorError::NotInitialized)?;
        match catch_unwind(AssertUnwindSafe(|| f(runtime.as_ref()))) {
            Ok(result) => result.map_err(SupervisorError::from),
            Err(panic) => Err(SupervisorError::Runtime(RuntimeError::CallFailed(format!(
                "panicked: {}",
                panic_message(panic.as_ref())
            )))),
        }
    }

    /// Like [`call`](Self::call) with failures logged and flattened to `None`
    pub fn with_runtime<T>(
        &self,
        f: impl FnOnce(&dyn MeshRuntime) -> Result<T, RuntimeError>,
    ) -> Option<T> {
        match self.call(f) {
            Ok(value) => Some(value),
            Err(SupervisorError::NotInitialized) => None,
            Err(e) => {
                warn!("Runtime call failed: {}", e);
                None
            }
        }
    }

    pub fn status(&self) -> ServiceStatus {
        self.state.lock().status.clone()
    }

    pub fn generation(&self) -> u64 {
        self.state.lock().generation
    }

    pub fn is_initialized(&self) -> bool {
        self.state.lock().runtime.is_some()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<ServiceStatus> {
        self.state.lock().subscribe()
    }

    /// Status hint while a restart is being orchestrated
    pub fn mark_connecting(&self) {
        self.state.lock().set_status(ServiceStatus::Connecting);
    }

    pub fn set_conversation_active(&self, active: bool) {
        self.state.lock().conversation_active = active;
    }

    pub fn is_conversation_active(&self) -> bool {
        self.state.lock().conversation_active
    }

    pub fn has_shutdown_in_flight(&self) -> bool {
        self.state.lock().shutdown_in_flight.is_some()
    }
}

async fn complete_shutdown(
    state: Arc<Mutex<ServiceState>>,
    runner: CallRunner,
    runtime: Arc<dyn MeshRuntime>,
    generation: u64,
    ticket: u64,
    timeout: Duration,
) -> ShutdownOutcome {
    let outcome = runner.shutdown_native(runtime, timeout).await;

    let mut state = state.lock();
    if state.generation == generation {
        state.set_status(ServiceStatus::Shutdown);
        info!("Runtime shut down (generation {}): {:?}", generation, outcome);
    } else {
        debug!(
            "Discarding stale shutdown completion (issued at generation {}, now {})",
            generation, state.generation
        );
    }
    if state.shutdown_in_flight.as_ref().map(|s| s.ticket) == Some(ticket) {
        state.shutdown_in_flight = None;
    }
    outcome
}
