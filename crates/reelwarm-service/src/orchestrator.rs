//! Starts heavyweight background services without getting in the way of the first content.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt, Shared};

use crate::boot::{BootPhase, BootPhaseGate};

/// A heavyweight service that is not part of the media pipeline.
#[async_trait]
pub trait ManagedService: Send + Sync + 'static {
    /// Cheap preparation, run at most once.
    async fn prepare(&self);

    /// Starts the service.
    async fn start(&self) -> anyhow::Result<()>;

    async fn stop(&self);
}

/// When a service may be started.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StartGate {
    /// Right away.
    None,
    /// Once the first content is ready, plus `delay`.
    ///
    /// If the first content never becomes ready, the service starts after the configured
    /// `first_content_wait` anyway.
    AfterFirstContentReady { delay: Duration },
}

pub struct ServiceDescriptor {
    pub key: String,
    pub service: Arc<dyn ManagedService>,
    pub gate: StartGate,
}

impl ServiceDescriptor {
    pub fn new(key: impl Into<String>, service: Arc<dyn ManagedService>, gate: StartGate) -> Self {
        Self {
            key: key.into(),
            service,
            gate,
        }
    }
}

impl fmt::Debug for ServiceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceDescriptor")
            .field("key", &self.key)
            .field("gate", &self.gate)
            .finish_non_exhaustive()
    }
}

type PrepareChannel = Shared<BoxFuture<'static, ()>>;
type StartChannel = Shared<BoxFuture<'static, bool>>;

#[derive(Clone)]
struct Registered {
    service: Arc<dyn ManagedService>,
    gate: StartGate,
}

#[derive(Default)]
struct OrchestratorState {
    services: HashMap<String, Registered>,
    /// Running or finished preparations. Entries are never removed.
    prepared: HashMap<String, PrepareChannel>,
    /// Starts in progress.
    starting: HashMap<String, StartChannel>,
    /// Started services, in start order.
    started: Vec<String>,
}

struct Inner {
    gate: Arc<BootPhaseGate>,
    first_content_wait: Duration,
    state: Mutex<OrchestratorState>,
}

/// Starts registered services under their [`StartGate`].
///
/// Each service is prepared at most once and started at most once, regardless of how many
/// callers ask for it concurrently. A failed start is logged, and the service may be started
/// again by a later call.
#[derive(Clone)]
pub struct ServiceOrchestrator {
    inner: Arc<Inner>,
}

impl fmt::Debug for ServiceOrchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.lock();
        f.debug_struct("ServiceOrchestrator")
            .field("registered", &state.services.len())
            .field("started", &state.started)
            .finish()
    }
}

impl ServiceOrchestrator {
    pub fn new(gate: Arc<BootPhaseGate>, first_content_wait: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                gate,
                first_content_wait,
                state: Mutex::default(),
            }),
        }
    }

    /// Registers a service.
    ///
    /// Returns `false` if a service with the same key is already registered, in which case the
    /// registration is ignored.
    pub fn register(&self, descriptor: ServiceDescriptor) -> bool {
        let mut state = self.inner.lock();
        if state.services.contains_key(&descriptor.key) {
            tracing::warn!(service = %descriptor.key, "Service is already registered");
            return false;
        }
        state.services.insert(
            descriptor.key,
            Registered {
                service: descriptor.service,
                gate: descriptor.gate,
            },
        );
        true
    }

    /// Prepares the service `key`, unless it was prepared before.
    ///
    /// Returns `false` for unknown services.
    pub async fn prepare(&self, key: &str) -> bool {
        let channel = {
            let mut state = self.inner.lock();
            Inner::prepare_channel(&mut state, key)
        };
        match channel {
            Some(channel) => {
                channel.await;
                true
            }
            None => {
                tracing::warn!(service = key, "Cannot prepare unknown service");
                false
            }
        }
    }

    /// Starts the service `key`, unless it was started before.
    ///
    /// Joins a start that is in progress. Returns whether the service is started.
    pub async fn ensure_started(&self, key: &str) -> bool {
        let channel = {
            let mut state = self.inner.lock();
            if state.started.iter().any(|started| started == key) {
                return true;
            }
            match state.starting.get(key) {
                Some(channel) => channel.clone(),
                None => {
                    let Some(registered) = state.services.get(key).cloned() else {
                        tracing::warn!(service = key, "Cannot start unknown service");
                        return false;
                    };
                    let channel = Inner::spawn_start(&self.inner, key, registered);
                    state.starting.insert(key.to_owned(), channel.clone());
                    channel
                }
            }
        };
        channel.await
    }

    /// Stops all started services, in reverse start order.
    pub async fn stop_all(&self) {
        let started = std::mem::take(&mut self.inner.lock().started);
        for key in started.into_iter().rev() {
            let service = self
                .inner
                .lock()
                .services
                .get(&key)
                .map(|registered| Arc::clone(&registered.service));
            if let Some(service) = service {
                tracing::info!(service = %key, "Stopping service");
                service.stop().await;
            }
        }
    }

    pub fn is_started(&self, key: &str) -> bool {
        self.inner.lock().started.iter().any(|started| started == key)
    }
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, OrchestratorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn prepare_channel(state: &mut OrchestratorState, key: &str) -> Option<PrepareChannel> {
        if let Some(channel) = state.prepared.get(key) {
            return Some(channel.clone());
        }
        let service = Arc::clone(&state.services.get(key)?.service);
        let service_key = key.to_owned();
        let task = tokio::spawn(async move {
            tracing::debug!(service = %service_key, "Preparing service");
            service.prepare().await;
        });
        let channel = task.map(|_| ()).boxed().shared();
        state.prepared.insert(key.to_owned(), channel.clone());
        Some(channel)
    }

    fn spawn_start(self: &Arc<Self>, key: &str, registered: Registered) -> StartChannel {
        let inner = Arc::clone(self);
        let key = key.to_owned();
        let task = tokio::spawn(async move {
            let prepared = Self::prepare_channel(&mut inner.lock(), &key);
            if let Some(prepared) = prepared {
                prepared.await;
            }

            if let StartGate::AfterFirstContentReady { delay } = registered.gate {
                if !inner
                    .gate
                    .wait_until(BootPhase::FirstContentReady, inner.first_content_wait)
                    .await
                {
                    tracing::info!(service = %key, "First content not ready, starting service anyway");
                }
                tokio::time::sleep(delay).await;
            }

            tracing::info!(service = %key, "Starting service");
            let result = registered.service.start().await;

            let mut state = inner.lock();
            state.starting.remove(&key);
            match result {
                Ok(()) => {
                    state.started.push(key);
                    true
                }
                Err(error) => {
                    let dynerr: &dyn std::error::Error = error.as_ref(); // tracing expects a `&dyn Error`
                    tracing::error!(service = %key, error = dynerr, "Failed to start service");
                    false
                }
            }
        });
        task.map(|started| started.unwrap_or(false)).boxed().shared()
    }
}
