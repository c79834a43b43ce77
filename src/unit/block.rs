//! Blocks: stateful units driven by events.
//!
//! A block is a generic shell around a [`BlockLogic`] implementation. The
//! shell owns the output, the initializers, the persistence settings and the
//! event dispatch protocol; the logic supplies the event handlers and the
//! lifecycle hooks.

use std::any::Any;
use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::Utc;
use futures::future::BoxFuture;
use tokio::task::AbortHandle;

use crate::circuit::{validate_unit_name, Circuit};
use crate::error::{CircuitError, CircuitResult, ErrorKind};
use crate::init::{self, CheckpointMode, Initializer};
use crate::value::{Output, Value};

use super::dispatch::{handler_table, EventData, HandlerTable, INTROSPECTION_PREFIX};
use super::{propagation, Unit, UnitCore};

/// Behaviour of a block type.
///
/// Only [`TYPE_NAME`](Self::TYPE_NAME) is required. Everything else has a
/// default that makes the corresponding feature unavailable.
///
/// Handlers and hooks take `&self`; a type with mutable internal state keeps
/// it behind a lock or an atomic.
pub trait BlockLogic: Send + Sync + Sized + 'static {
    /// Type name, used in labels and persistence keys.
    const TYPE_NAME: &'static str;
    /// Whether initial values are accepted (see [`init`](Self::init)).
    const ACCEPTS_INITIAL: bool = false;
    /// Whether the state can be exported and restored.
    const PERSISTENT: bool = false;
    /// Whether the type has an asynchronous stop hook.
    const ASYNC_STOP: bool = false;

    /// Registers the event handlers of this type.
    fn handlers(_table: &mut HandlerTable<Self>) {}

    /// Resolves references to other units before anything starts.
    fn pre_init(&self, _block: &Block) -> CircuitResult<()> {
        Ok(())
    }

    /// Applies an initial value.
    fn init(&self, block: &Block, _value: Value) -> CircuitResult<()> {
        Err(unsupported(block, "initial value"))
    }

    /// Fallback when no initializer produced a value.
    ///
    /// The default sets `Null` for types that do not take initial values.
    fn init_default(&self, block: &Block) -> CircuitResult<()> {
        if !Self::ACCEPTS_INITIAL {
            block.set_output(Value::Null)?;
        }
        Ok(())
    }

    /// Called once all units are initialized.
    fn start(&self, _block: &Block) -> CircuitResult<()> {
        Ok(())
    }

    /// Synchronous stop hook.
    fn stop(&self, _block: &Block) -> CircuitResult<()> {
        Ok(())
    }

    /// Asynchronous stop hook, bounded by the block's stop timeout.
    fn astop<'a>(&'a self, _block: &'a Block) -> BoxFuture<'a, CircuitResult<()>> {
        Box::pin(async { Ok(()) })
    }

    /// Final cleanup.
    fn close(&self, _block: &Block) -> CircuitResult<()> {
        Ok(())
    }

    /// Exports the state to be persisted.
    fn export_state(&self, block: &Block) -> CircuitResult<Value> {
        Err(unsupported(block, "persistent state"))
    }

    /// Restores a previously exported state.
    fn restore_state(&self, block: &Block, _state: Value) -> CircuitResult<()> {
        Err(unsupported(block, "persistent state"))
    }

    /// Handles an event type missing from the handler table.
    fn unknown_event(&self, block: &Block, etype: &str, _data: &EventData) -> CircuitResult<Value> {
        Err(CircuitError::new(ErrorKind::UnknownEvent {
            unit: block.to_string(),
            etype: etype.to_string(),
        }))
    }
}

fn unsupported(block: &Block, feature: &str) -> CircuitError {
    CircuitError::new(ErrorKind::Unsupported {
        unit: block.to_string(),
        feature: feature.to_string(),
    })
}

/// Object-safe view of a `BlockLogic` plus its handler table.
trait DynLogic: Send + Sync {
    fn async_stop(&self) -> bool;
    fn dispatch(&self, block: &Block, etype: &str, data: &EventData) -> CircuitResult<Value>;
    fn pre_init(&self, block: &Block) -> CircuitResult<()>;
    fn init(&self, block: &Block, value: Value) -> CircuitResult<()>;
    fn init_default(&self, block: &Block) -> CircuitResult<()>;
    fn start(&self, block: &Block) -> CircuitResult<()>;
    fn stop(&self, block: &Block) -> CircuitResult<()>;
    fn astop<'a>(&'a self, block: &'a Block) -> BoxFuture<'a, CircuitResult<()>>;
    fn close(&self, block: &Block) -> CircuitResult<()>;
    fn export_state(&self, block: &Block) -> CircuitResult<Value>;
    fn restore_state(&self, block: &Block, state: Value) -> CircuitResult<()>;
    fn as_any(&self) -> &dyn Any;
}

struct Adapter<T: BlockLogic> {
    logic: T,
    table: Arc<HandlerTable<T>>,
}

impl<T: BlockLogic> DynLogic for Adapter<T> {
    fn async_stop(&self) -> bool {
        T::ASYNC_STOP
    }

    fn dispatch(&self, block: &Block, etype: &str, data: &EventData) -> CircuitResult<Value> {
        match self.table.get(etype) {
            Some(handler) => handler(&self.logic, block, data),
            None => self.logic.unknown_event(block, etype, data),
        }
    }

    fn pre_init(&self, block: &Block) -> CircuitResult<()> {
        self.logic.pre_init(block)
    }

    fn init(&self, block: &Block, value: Value) -> CircuitResult<()> {
        self.logic.init(block, value)
    }

    fn init_default(&self, block: &Block) -> CircuitResult<()> {
        self.logic.init_default(block)
    }

    fn start(&self, block: &Block) -> CircuitResult<()> {
        self.logic.start(block)
    }

    fn stop(&self, block: &Block) -> CircuitResult<()> {
        self.logic.stop(block)
    }

    fn astop<'a>(&'a self, block: &'a Block) -> BoxFuture<'a, CircuitResult<()>> {
        self.logic.astop(block)
    }

    fn close(&self, block: &Block) -> CircuitResult<()> {
        self.logic.close(block)
    }

    fn export_state(&self, block: &Block) -> CircuitResult<Value> {
        self.logic.export_state(block)
    }

    fn restore_state(&self, block: &Block, state: Value) -> CircuitResult<()> {
        self.logic.restore_state(block, state)
    }

    fn as_any(&self) -> &dyn Any {
        &self.logic
    }
}

/// When a block's state is written to the state store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersistenceMode {
    /// No persistence.
    Off,
    /// Saved at startup checkpoints and at shutdown.
    ShutdownOnly,
    /// Also saved after every successful event.
    Event,
    /// Also saved periodically by the checkpointing service.
    Interval,
}

impl PersistenceMode {
    /// Returns true unless persistence is off.
    #[must_use]
    pub const fn is_enabled(self) -> bool {
        !matches!(self, Self::Off)
    }

    /// Returns true if the state is checkpointed at startup.
    #[must_use]
    pub const fn has_checkpoints(self) -> bool {
        matches!(self, Self::Event | Self::Interval)
    }
}

impl From<CheckpointMode> for PersistenceMode {
    fn from(mode: CheckpointMode) -> Self {
        match mode {
            CheckpointMode::ShutdownOnly => Self::ShutdownOnly,
            CheckpointMode::Event => Self::Event,
            CheckpointMode::Interval => Self::Interval,
        }
    }
}

/// Value validation injected into a block.
///
/// A validator may rewrite the value or reject it with an error.
pub trait Validator: Send + Sync {
    /// Returns the accepted (possibly rewritten) value.
    fn validate(&self, value: &Value) -> CircuitResult<Value>;
}

impl<F> Validator for F
where
    F: Fn(&Value) -> CircuitResult<Value> + Send + Sync,
{
    fn validate(&self, value: &Value) -> CircuitResult<Value> {
        self(value)
    }
}

struct BlockInner {
    core: UnitCore,
    logic: Box<dyn DynLogic>,
    initializers: Vec<Initializer>,
    persistence: Mutex<PersistenceMode>,
    key: String,
    stop_timeout: Option<Duration>,
    always_notify: bool,
    validator: Option<Arc<dyn Validator>>,
    active_events: Mutex<HashSet<String>>,
    init_job: Mutex<Option<AbortHandle>>,
}

/// A stateful unit driven by events.
#[derive(Clone)]
pub struct Block {
    inner: Arc<BlockInner>,
}

/// Builder for [`Block`].
#[must_use]
pub struct BlockBuilder {
    name: String,
    comment: String,
    initializers: Vec<Initializer>,
    stop_timeout: Option<Duration>,
    always_notify: bool,
    validator: Option<Arc<dyn Validator>>,
    reserved: bool,
}

impl BlockBuilder {
    /// Sets a free-text comment.
    pub fn comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = comment.into();
        self
    }

    /// Appends an initializer. Initializers are tried in the order given.
    pub fn initial(mut self, init: impl Into<Initializer>) -> Self {
        self.initializers.push(init.into());
        self
    }

    /// Appends a literal initial value.
    pub fn initial_value(self, value: impl Into<Value>) -> Self {
        self.initial(Initializer::from(value.into()))
    }

    /// Sets the deadline of the asynchronous stop hook.
    pub fn stop_timeout(mut self, timeout: Duration) -> Self {
        self.stop_timeout = Some(timeout);
        self
    }

    /// Propagate every write, even one that does not change the output.
    pub fn always_notify(mut self, enabled: bool) -> Self {
        self.always_notify = enabled;
        self
    }

    /// Sets the value validator.
    pub fn validator(mut self, validator: impl Validator + 'static) -> Self {
        self.validator = Some(Arc::new(validator));
        self
    }

    pub(crate) fn reserved(mut self) -> Self {
        self.reserved = true;
        self
    }

    /// Creates the block and registers it in the circuit.
    ///
    /// # Errors
    /// - Invalid or reserved name, duplicate name
    /// - The circuit does not accept new units any more
    /// - An option not supported by the block type
    pub fn build<T: BlockLogic>(self, circuit: &Circuit, logic: T) -> CircuitResult<Block> {
        validate_unit_name(&self.name, self.reserved)?;
        let label = || format!("<{} {}>", T::TYPE_NAME, self.name);

        let mut restore: Option<CheckpointMode> = None;
        for initializer in &self.initializers {
            if let Some(mode) = initializer.checkpoint_mode() {
                if !T::PERSISTENT {
                    return Err(unsupported_for(label(), "RestoreState initializer"));
                }
                if restore.is_some() {
                    return Err(CircuitError::new(ErrorKind::InvalidConfig {
                        reason: "Multiple RestoreState initializers are not allowed".to_string(),
                    }));
                }
                restore = Some(mode);
            } else if !T::ACCEPTS_INITIAL {
                return Err(unsupported_for(label(), "initial value"));
            }
        }

        let stop_timeout = match self.stop_timeout {
            Some(_) if !T::ASYNC_STOP => {
                return Err(unsupported_for(label(), "stop_timeout"));
            }
            Some(t) => Some(t),
            None if T::ASYNC_STOP => Some(circuit.config().default_stop_timeout),
            None => None,
        };

        let persistence = restore.map_or(PersistenceMode::Off, PersistenceMode::from);
        let block = Block {
            inner: Arc::new(BlockInner {
                key: format!("{}:{}", T::TYPE_NAME, self.name),
                core: UnitCore::new(self.name, self.comment, T::TYPE_NAME, circuit),
                logic: Box::new(Adapter {
                    logic,
                    table: handler_table::<T>(),
                }),
                initializers: self.initializers,
                persistence: Mutex::new(persistence),
                stop_timeout,
                always_notify: self.always_notify,
                validator: self.validator,
                active_events: Mutex::new(HashSet::new()),
                init_job: Mutex::new(None),
            }),
        };
        circuit.register_unit(Unit::Block(block.clone()))?;
        tracing::debug!(unit = %block, ?persistence, "block created");
        Ok(block)
    }
}

fn unsupported_for(unit: String, feature: &str) -> CircuitError {
    CircuitError::new(ErrorKind::Unsupported {
        unit,
        feature: feature.to_string(),
    })
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Removes the event type from the active set when dispatch ends.
struct ActiveEvent<'a> {
    block: &'a Block,
    etype: &'a str,
}

impl Drop for ActiveEvent<'_> {
    fn drop(&mut self) {
        lock(&self.block.inner.active_events).remove(self.etype);
    }
}

impl Block {
    /// Starts building a block named `name`.
    pub fn builder(name: impl Into<String>) -> BlockBuilder {
        BlockBuilder {
            name: name.into(),
            comment: String::new(),
            initializers: Vec::new(),
            stop_timeout: None,
            always_notify: false,
            validator: None,
            reserved: false,
        }
    }

    pub(crate) fn core(&self) -> &UnitCore {
        &self.inner.core
    }

    /// Returns the block name.
    #[must_use]
    pub fn name(&self) -> &str {
        self.inner.core.name()
    }

    /// Returns the comment.
    #[must_use]
    pub fn comment(&self) -> &str {
        self.inner.core.comment()
    }

    /// Returns the block type name.
    #[must_use]
    pub fn type_name(&self) -> &'static str {
        self.inner.core.type_name()
    }

    /// Returns the persistence key, `"<type>:<name>"`.
    #[must_use]
    pub fn key(&self) -> &str {
        &self.inner.key
    }

    /// Returns the circuit, unless it was dropped.
    #[must_use]
    pub fn circuit(&self) -> Option<Circuit> {
        self.inner.core.circuit()
    }

    /// Returns the block logic if it is of type `T`.
    #[must_use]
    pub fn logic<T: BlockLogic>(&self) -> Option<&T> {
        self.inner.logic.as_any().downcast_ref::<T>()
    }

    /// Returns the current output.
    #[must_use]
    pub fn output(&self) -> Output {
        self.inner.core.output()
    }

    /// Returns the previous output.
    #[must_use]
    pub fn previous(&self) -> Output {
        self.inner.core.previous()
    }

    /// Returns true once the block holds a value.
    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.inner.core.is_initialized()
    }

    /// Returns the persistence mode.
    #[must_use]
    pub fn persistence(&self) -> PersistenceMode {
        *lock(&self.inner.persistence)
    }

    pub(crate) fn disable_persistence(&self) {
        *lock(&self.inner.persistence) = PersistenceMode::Off;
    }

    /// Returns the deadline of the asynchronous stop hook, if the type has one.
    #[must_use]
    pub fn stop_timeout(&self) -> Option<Duration> {
        self.inner.stop_timeout
    }

    pub(crate) fn initializers(&self) -> &[Initializer] {
        &self.inner.initializers
    }

    pub(crate) fn has_async_initializers(&self) -> bool {
        self.inner.initializers.iter().any(Initializer::is_async)
    }

    pub(crate) fn has_async_stop(&self) -> bool {
        self.inner.logic.async_stop()
    }

    /// Runs the value through the validator, if any.
    ///
    /// Returns `None` if the validator rejected the value.
    #[must_use]
    pub fn validate(&self, value: Value) -> Option<Value> {
        let Some(validator) = &self.inner.validator else {
            return Some(value);
        };
        match validator.validate(&value) {
            Ok(validated) => {
                if validated != value {
                    tracing::debug!(unit = %self, from = %value, to = %validated, "validator rewrote value");
                }
                Some(validated)
            }
            Err(err) => {
                tracing::debug!(unit = %self, %value, error = %err, "validator rejected value");
                None
            }
        }
    }

    /// Sets the output and propagates the change.
    ///
    /// Returns false if the output did not change. On a change, dependent
    /// formulas are re-evaluated first, then every affected trigger runs
    /// once.
    ///
    /// # Errors
    /// Errors of dependent formulas and triggers; those have already been
    /// reported to the circuit.
    pub fn set_output(&self, value: impl Into<Value>) -> CircuitResult<bool> {
        let circuit = self.circuit();
        let _turn = circuit.as_ref().map(Circuit::take_turn);
        let was_initialized = self.is_initialized();
        let Some(dependents) = self.inner.core.store(value.into(), self.inner.always_notify)
        else {
            return Ok(false);
        };
        if !was_initialized {
            self.cancel_init_job();
        }
        let triggers = propagation::cascade(dependents)?;
        triggers.fire_all()?;
        Ok(true)
    }

    /// Delivers an event and returns the handler's result.
    ///
    /// # Errors
    /// - `InvalidName` for a malformed event type
    /// - `CircuitShutDown` after shutdown, except for `_get_*` events
    /// - `Reentrancy` if handling the same event type on this block sent it
    ///   again; the circuit is aborted as well. Events sent from other
    ///   threads wait until the running one has finished.
    /// - `UnknownEvent` if the type has no handler
    /// - any handler error, annotated with the event context
    pub fn event(&self, etype: &str, data: EventData) -> CircuitResult<Value> {
        crate::circuit::check_identifier(etype, "Event type")?;
        let circuit = self.circuit();
        let introspection = etype.starts_with(INTROSPECTION_PREFIX);
        if !introspection && circuit.as_ref().map_or(true, Circuit::is_shut_down) {
            return Err(CircuitError::new(ErrorKind::CircuitShutDown));
        }
        tracing::debug!(unit = %self, event = etype, data = %data, "got event");

        let _turn = circuit.as_ref().map(Circuit::take_turn);
        if !lock(&self.inner.active_events).insert(etype.to_string()) {
            let err = CircuitError::new(ErrorKind::Reentrancy {
                unit: self.to_string(),
                etype: etype.to_string(),
            });
            if let Some(circuit) = &circuit {
                circuit.abort(err.clone());
            }
            return Err(err);
        }
        let _active = ActiveEvent { block: self, etype };

        if !self.is_initialized() {
            tracing::debug!(unit = %self, "pending event, initializing now");
            init::init_block_sync(self);
        }

        let result = self
            .inner
            .logic
            .dispatch(self, etype, &data)
            .map_err(|err| {
                if err.is_unknown_event() {
                    tracing::debug!(unit = %self, event = etype, "unknown event");
                    err
                } else {
                    err.with_context(format!(
                        "Error occurred in {self} during handling of event '{etype}'; event data was: {data}"
                    ))
                }
            })?;

        if self.persistence() == PersistenceMode::Event && !introspection && self.is_initialized()
        {
            if let Some(circuit) = &circuit {
                circuit.save_state(self, Utc::now());
            }
        }
        tracing::trace!(unit = %self, event = etype, result = %result, "event handled");
        Ok(result)
    }

    pub(crate) fn set_init_job(&self, job: Option<AbortHandle>) {
        *lock(&self.inner.init_job) = job;
    }

    fn cancel_init_job(&self) {
        if let Some(job) = lock(&self.inner.init_job).take() {
            if !job.is_finished() {
                tracing::debug!(unit = %self, "value arrived, cancelling async initializer");
                job.abort();
            }
        }
    }

    pub(crate) fn pre_init(&self) -> CircuitResult<()> {
        self.inner.logic.pre_init(self)
    }

    pub(crate) fn apply_init(&self, value: Value) -> CircuitResult<()> {
        self.inner.logic.init(self, value)
    }

    pub(crate) fn init_default(&self) -> CircuitResult<()> {
        self.inner.logic.init_default(self)
    }

    pub(crate) fn start(&self) -> CircuitResult<()> {
        self.inner.logic.start(self)
    }

    pub(crate) fn stop(&self) -> CircuitResult<()> {
        self.inner.logic.stop(self)
    }

    pub(crate) fn astop(&self) -> BoxFuture<'_, CircuitResult<()>> {
        self.inner.logic.astop(self)
    }

    pub(crate) fn close(&self) -> CircuitResult<()> {
        self.inner.logic.close(self)
    }

    pub(crate) fn export_state(&self) -> CircuitResult<Value> {
        self.inner.logic.export_state(self)
    }

    pub(crate) fn restore_state(&self, state: Value) -> CircuitResult<()> {
        self.inner.logic.restore_state(self, state)
    }
}

impl fmt::Display for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.inner.core.label())
    }
}

impl fmt::Debug for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Block")
            .field("name", &self.name())
            .field("type", &self.type_name())
            .field("output", &self.output())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::init::{InitValue, RestoreState};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Echo;

    impl BlockLogic for Echo {
        const TYPE_NAME: &'static str = "Echo";
        const ACCEPTS_INITIAL: bool = true;

        fn handlers(table: &mut HandlerTable<Self>) {
            table
                .on("put", |_, block, data| {
                    let v = data.require_value()?.clone();
                    block.set_output(v.clone())?;
                    Ok(v)
                })
                .on("again", |_, block, data| block.event("again", data.clone()))
                .on("other", |_, block, _| block.event("put", EventData::from_value(9)))
                .on("fail", |_, _, _| Err(CircuitError::failed("boom")));
        }

        fn init(&self, block: &Block, value: Value) -> CircuitResult<()> {
            block.set_output(value).map(|_| ())
        }
    }

    struct Silent;

    impl BlockLogic for Silent {
        const TYPE_NAME: &'static str = "Silent";
    }

    struct Recorder {
        seen: AtomicUsize,
    }

    impl BlockLogic for Recorder {
        const TYPE_NAME: &'static str = "Recorder";

        fn unknown_event(&self, _: &Block, _: &str, _: &EventData) -> CircuitResult<Value> {
            self.seen.fetch_add(1, Ordering::SeqCst);
            Ok(Value::Null)
        }
    }

    #[test]
    fn test_builder_rejects_unsupported_options() {
        let circuit = Circuit::new();
        let err = Block::builder("s")
            .initial_value(1)
            .build(&circuit, Silent)
            .unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::Unsupported { .. }));

        let err = Block::builder("s")
            .stop_timeout(Duration::from_secs(1))
            .build(&circuit, Silent)
            .unwrap_err();
        assert!(err.to_string().contains("stop_timeout"));

        let err = Block::builder("e")
            .initial(RestoreState::new(CheckpointMode::Event))
            .build(&circuit, Echo)
            .unwrap_err();
        assert!(err.to_string().contains("RestoreState"));

        // failed builds do not register anything
        assert!(circuit.get("s").is_none());
        assert!(circuit.get("e").is_none());
    }

    #[test]
    fn test_builder_rejects_reserved_name() {
        let circuit = Circuit::new();
        let err = Block::builder("_secret").build(&circuit, Silent).unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::ReservedName { .. }));
    }

    #[test]
    fn test_event_initializes_on_demand() {
        let circuit = Circuit::new();
        let block = Block::builder("e")
            .initial(InitValue::new(5))
            .build(&circuit, Echo)
            .unwrap();
        assert!(!block.is_initialized());

        let out = block.event("_get_output", EventData::new()).unwrap();
        assert_eq!(out, Value::Int(5));
        assert_eq!(block.key(), "Echo:e");
    }

    #[test]
    fn test_default_init_sets_null() {
        let circuit = Circuit::new();
        let block = Block::builder("s").build(&circuit, Silent).unwrap();
        block.event("_get_output", EventData::new()).unwrap();
        assert_eq!(block.output(), Output::Defined(Value::Null));
    }

    #[test]
    fn test_unknown_event_is_not_fatal() {
        let circuit = Circuit::new();
        let block = Block::builder("s").build(&circuit, Silent).unwrap();
        let err = block.event("nope", EventData::new()).unwrap_err();
        assert!(err.is_unknown_event());
        assert!(err.context().is_empty());
        assert!(circuit.errors().is_empty());
    }

    #[test]
    fn test_unknown_event_override() {
        let circuit = Circuit::new();
        let block = Block::builder("r")
            .build(
                &circuit,
                Recorder {
                    seen: AtomicUsize::new(0),
                },
            )
            .unwrap();
        block.event("anything", EventData::new()).unwrap();
        block.event("else", EventData::new()).unwrap();
        assert_eq!(block.logic::<Recorder>().unwrap().seen.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_handler_error_is_annotated() {
        let circuit = Circuit::new();
        let block = Block::builder("e").build(&circuit, Echo).unwrap();
        let err = block
            .event("fail", EventData::from_value(1).field("k", "v"))
            .unwrap_err();
        assert!(err.to_string().contains("boom"));
        assert_eq!(err.context().len(), 1);
        assert!(err.context()[0].contains("event 'fail'"));
        assert!(err.context()[0].contains("{evalue: 1, k: \"v\"}"));
    }

    #[test]
    fn test_missing_value() {
        let circuit = Circuit::new();
        let block = Block::builder("e").build(&circuit, Echo).unwrap();
        let err = block.event("put", EventData::new()).unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::MissingEventValue));
    }

    #[test]
    fn test_reentrancy_aborts() {
        let circuit = Circuit::new();
        let block = Block::builder("e")
            .initial_value(0)
            .build(&circuit, Echo)
            .unwrap();
        let err = block.event("again", EventData::new()).unwrap_err();
        assert!(err.is_reentrancy());
        assert_eq!(circuit.errors().len(), 1);
        assert!(circuit.errors()[0].is_reentrancy());
    }

    #[test]
    fn test_nested_event_of_other_type_is_allowed() {
        let circuit = Circuit::new();
        let block = Block::builder("e")
            .initial_value(0)
            .build(&circuit, Echo)
            .unwrap();
        assert_eq!(block.event("other", EventData::new()).unwrap(), Value::Int(9));
        assert_eq!(block.output(), Output::Defined(Value::Int(9)));
    }

    #[test]
    fn test_invalid_event_type() {
        let circuit = Circuit::new();
        let block = Block::builder("e").build(&circuit, Echo).unwrap();
        let err = block.event("bad type", EventData::new()).unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::InvalidName { .. }));
    }

    #[test]
    fn test_validator() {
        let circuit = Circuit::new();
        let block = Block::builder("e")
            .validator(|v: &Value| match v.as_int() {
                Some(i) if i >= 0 => Ok(Value::Int(i.min(10))),
                _ => Err(CircuitError::rejected("negative")),
            })
            .build(&circuit, Echo)
            .unwrap();
        assert_eq!(block.validate(Value::Int(50)), Some(Value::Int(10)));
        assert_eq!(block.validate(Value::Int(-1)), None);
    }
}
