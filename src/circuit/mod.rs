//! The circuit: owner of all units and of the jobs they run.
//!
//! A `Circuit` is a cheap cloneable handle. Units keep a weak reference to
//! it, so dropping every handle releases the whole unit graph.
//!
//! # Lifecycle
//!
//! ```text
//! UnderConstruction -> InitCircuit -> InitUnits -> Running -> ShuttingDown -> Closed
//! ```
//!
//! Phases only advance. [`Circuit::run`] drives the whole sequence and
//! returns every error recorded on the way.
//!
//! Unit handles may be used from any thread or runtime flavor. Event
//! dispatch and change propagation take turns per circuit: an event sent
//! while another thread is dispatching waits for it to finish.

mod config;
mod phase;
mod registry;
mod runner;
mod supervisor;
mod turn;

pub use config::CircuitConfig;
pub use phase::CircuitPhase;
pub use runner::Job;
pub use supervisor::{shield, ServiceHandle, Shielded};

pub(crate) use registry::{check_identifier, validate_unit_name};

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::{CircuitError, CircuitResult, ErrorKind};
use crate::storage::{StateStore, StoredState};
use crate::unit::Block;

use registry::Registry;
use supervisor::ServiceEntry;
use turn::{Turn, TurnLock};

pub(crate) struct CircuitInner {
    config: CircuitConfig,
    phase: watch::Sender<CircuitPhase>,
    registry: Mutex<Registry>,
    errors: Mutex<Vec<CircuitError>>,
    storage: Mutex<Option<Arc<dyn StateStore>>>,
    checkpoint_interval: Mutex<Duration>,
    services: Mutex<Vec<ServiceEntry>>,
    root: CancellationToken,
    started: Mutex<Option<Instant>>,
    turns: TurnLock,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    // units are never called under a circuit lock, a poisoned guard still holds consistent data
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Handle to a circuit.
#[derive(Clone)]
pub struct Circuit {
    inner: Arc<CircuitInner>,
}

impl Default for Circuit {
    fn default() -> Self {
        Self::new()
    }
}

impl Circuit {
    /// Creates a circuit with the default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::build(CircuitConfig::default())
    }

    /// Creates a circuit with a custom configuration.
    ///
    /// # Errors
    /// Returns `InvalidConfig` if the configuration does not validate.
    pub fn with_config(config: CircuitConfig) -> CircuitResult<Self> {
        Ok(Self::build(config.validate()?))
    }

    fn build(config: CircuitConfig) -> Self {
        let (phase, _) = watch::channel(CircuitPhase::UnderConstruction);
        Self {
            inner: Arc::new(CircuitInner {
                checkpoint_interval: Mutex::new(config.checkpoint_interval),
                config,
                phase,
                registry: Mutex::new(Registry::default()),
                errors: Mutex::new(Vec::new()),
                storage: Mutex::new(None),
                services: Mutex::new(Vec::new()),
                root: CancellationToken::new(),
                started: Mutex::new(None),
                turns: TurnLock::default(),
            }),
        }
    }

    pub(crate) fn downgrade(&self) -> Weak<CircuitInner> {
        Arc::downgrade(&self.inner)
    }

    pub(crate) fn upgrade(weak: &Weak<CircuitInner>) -> Option<Self> {
        weak.upgrade().map(|inner| Self { inner })
    }

    /// Returns the configuration.
    #[must_use]
    pub fn config(&self) -> &CircuitConfig {
        &self.inner.config
    }

    /// Returns the current phase.
    #[must_use]
    pub fn phase(&self) -> CircuitPhase {
        *self.inner.phase.borrow()
    }

    /// Subscribes to phase changes.
    #[must_use]
    pub fn subscribe_phase(&self) -> watch::Receiver<CircuitPhase> {
        self.inner.phase.subscribe()
    }

    /// Waits until the circuit reaches `phase` or a later one.
    ///
    /// Returns true if the circuit is exactly in `phase`, false if that
    /// phase was skipped or already left.
    #[allow(clippy::let_and_return)]
    pub async fn wait_for(&self, phase: CircuitPhase) -> bool {
        let mut rx = self.inner.phase.subscribe();
        // the sender lives as long as `self`
        let reached = match rx.wait_for(|current| *current >= phase).await {
            Ok(current) => *current == phase,
            Err(_) => false,
        };
        reached
    }

    /// Waits until no other thread is dispatching events in this circuit.
    ///
    /// Calls from the chain already holding the turn pass through.
    pub(crate) fn take_turn(&self) -> Turn<'_> {
        self.inner.turns.enter()
    }

    /// Advances the phase. Moving backwards or staying is silently ignored.
    pub(crate) fn set_phase(&self, phase: CircuitPhase) -> bool {
        let changed = self.inner.phase.send_if_modified(|current| {
            if phase > *current {
                *current = phase;
                true
            } else {
                false
            }
        });
        if changed {
            tracing::info!(%phase, "circuit phase changed");
            self.publish_phase(phase);
        }
        changed
    }

    fn publish_phase(&self, phase: CircuitPhase) {
        let Some(block) = self.get(registry::PHASE_UNIT).and_then(|u| u.as_block().cloned())
        else {
            return;
        };
        if block.is_initialized() {
            if let Err(err) = block.set_output(phase.name()) {
                tracing::warn!(error = %err, "could not publish the circuit phase");
            }
        }
    }

    /// Returns true once shutdown has begun.
    #[must_use]
    pub fn is_shut_down(&self) -> bool {
        self.phase().is_shut_down()
    }

    /// Returns the time since the runner started, zero before.
    #[must_use]
    pub fn runtime(&self) -> Duration {
        lock(&self.inner.started).map_or(Duration::ZERO, |started| started.elapsed())
    }

    pub(crate) fn mark_started(&self) -> bool {
        let mut started = lock(&self.inner.started);
        if started.is_some() {
            return false;
        }
        *started = Some(Instant::now());
        true
    }

    /// Returns the errors recorded so far, in record order.
    #[must_use]
    pub fn errors(&self) -> Vec<CircuitError> {
        lock(&self.inner.errors).clone()
    }

    /// Records an error unless the same error was recorded before.
    ///
    /// Returns false for a repeated error.
    pub(crate) fn record_error(&self, err: CircuitError) -> bool {
        let mut errors = lock(&self.inner.errors);
        if errors.iter().any(|e| e.id() == err.id()) {
            return false;
        }
        errors.push(err);
        true
    }

    /// Sets the persistent state store and optionally the checkpoint interval.
    ///
    /// # Errors
    /// Returns a phase error once the runner has started.
    pub fn set_persistent_storage(
        &self,
        store: Option<Arc<dyn StateStore>>,
        checkpoint_interval: Option<Duration>,
    ) -> CircuitResult<()> {
        self.check_can_register()?;
        if let Some(interval) = checkpoint_interval {
            if interval.is_zero() {
                return Err(CircuitError::new(ErrorKind::InvalidConfig {
                    reason: "checkpoint interval must be positive".to_string(),
                }));
            }
            *lock(&self.inner.checkpoint_interval) = interval;
        }
        *lock(&self.inner.storage) = store;
        Ok(())
    }

    /// Returns the persistent state store.
    #[must_use]
    pub fn storage(&self) -> Option<Arc<dyn StateStore>> {
        lock(&self.inner.storage).clone()
    }

    pub(crate) fn checkpoint_interval(&self) -> Duration {
        *lock(&self.inner.checkpoint_interval)
    }

    /// Writes a block's state to the store. Failures are logged only.
    pub(crate) fn save_state(&self, block: &Block, now: DateTime<Utc>) {
        let Some(store) = self.storage() else {
            return;
        };
        if !block.is_initialized() {
            tracing::debug!(unit = %block, "not saving undefined state");
            return;
        }
        let result = block
            .export_state()
            .and_then(|state| Ok(store.put(block.key(), StoredState::new(state, now))?));
        match result {
            Ok(()) => tracing::trace!(unit = %block, "state saved"),
            Err(err) => tracing::error!(unit = %block, error = %err, "saving state failed"),
        }
    }

    /// Tears the circuit down for a fresh setup.
    ///
    /// Forgets all units, triggers and recorded errors, and breaks the
    /// links between units.
    ///
    /// # Errors
    /// Returns a phase error while the circuit is running.
    pub fn reset(&self) -> CircuitResult<()> {
        let phase = self.phase();
        if !matches!(phase, CircuitPhase::UnderConstruction | CircuitPhase::Closed) {
            return Err(CircuitError::new(ErrorKind::PhaseViolation {
                phase: phase.to_string(),
                reason: "cannot reset a running circuit".to_string(),
            }));
        }
        let units = {
            let mut registry = lock(&self.inner.registry);
            registry.take_all()
        };
        for unit in &units {
            unit.core().clear_dependents();
        }
        lock(&self.inner.errors).clear();
        tracing::debug!(units = units.len(), "circuit reset");
        Ok(())
    }
}

impl fmt::Debug for Circuit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let registry = lock(&self.inner.registry);
        f.debug_struct("Circuit")
            .field("phase", &self.phase())
            .field("units", &registry.len())
            .field("triggers", &registry.trigger_count())
            .finish()
    }
}
