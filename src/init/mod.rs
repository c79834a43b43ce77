//! Block initialization.
//!
//! A block owns an ordered list of initializers, tried until the first one
//! gives the block a value:
//! - synchronous: [`InitValue`], [`InitFunction`], [`RestoreState`]
//! - asynchronous: [`InitTask`], [`InitWait`]
//!
//! A failing initializer is logged and skipped. Every initializer is applied
//! at most once, even when an event forces an early synchronous
//! initialization of a block whose asynchronous initialization is pending.
//! When the list is exhausted without a value, the type's default hook runs.

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::future::{join_all, BoxFuture};
use futures::FutureExt;

use crate::error::{CircuitError, CircuitResult, ErrorKind};
use crate::unit::Block;
use crate::value::Value;

type ValueFn = Arc<dyn Fn() -> CircuitResult<Option<Value>> + Send + Sync>;
type TaskFn = Arc<dyn Fn() -> BoxFuture<'static, CircuitResult<Option<Value>>> + Send + Sync>;

/// Default timeout of [`InitTask`].
pub const DEFAULT_INIT_TIMEOUT: Duration = Duration::from_secs(10);

/// Initialize with a literal value.
pub struct InitValue {
    value: Value,
    applied: AtomicBool,
}

impl InitValue {
    /// Creates the initializer.
    #[must_use]
    pub fn new(value: impl Into<Value>) -> Self {
        Self {
            value: value.into(),
            applied: AtomicBool::new(false),
        }
    }
}

/// Initialize with a computed value; the function may return `None`.
pub struct InitFunction {
    func: ValueFn,
    applied: AtomicBool,
}

impl InitFunction {
    /// Creates the initializer.
    pub fn new<F>(func: F) -> Self
    where
        F: Fn() -> CircuitResult<Option<Value>> + Send + Sync + 'static,
    {
        Self {
            func: Arc::new(func),
            applied: AtomicBool::new(false),
        }
    }
}

/// When a restored block checkpoints its state besides shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CheckpointMode {
    /// Only at shutdown.
    #[default]
    ShutdownOnly,
    /// After every event.
    Event,
    /// Periodically.
    Interval,
}

/// Restore the block from its persisted state.
///
/// Enables persistence for the block. Stored states older than the
/// expiration are ignored.
pub struct RestoreState {
    checkpoints: CheckpointMode,
    expiration: Option<Duration>,
    applied: AtomicBool,
}

impl RestoreState {
    /// Creates the initializer.
    #[must_use]
    pub const fn new(checkpoints: CheckpointMode) -> Self {
        Self {
            checkpoints,
            expiration: None,
            applied: AtomicBool::new(false),
        }
    }

    /// Ignore stored states older than `expiration`.
    #[must_use]
    pub const fn expiration(mut self, expiration: Duration) -> Self {
        self.expiration = Some(expiration);
        self
    }

    fn stored_state(&self, block: &Block) -> Option<Value> {
        let store = block.circuit()?.storage()?;
        let stored = match store.get(block.key()) {
            Ok(Some(stored)) => stored,
            Ok(None) => {
                tracing::debug!(unit = %block, "no saved state was found");
                return None;
            }
            Err(err) => {
                tracing::warn!(unit = %block, error = %err, "state retrieval error");
                return None;
            }
        };
        if let Some(expiration) = self.expiration {
            let age = Utc::now().signed_duration_since(stored.timestamp);
            match age.to_std() {
                Err(_) => tracing::error!(
                    unit = %block,
                    "the timestamp of saved data is in the future, check the system time"
                ),
                Ok(age) if age > expiration => {
                    tracing::debug!(unit = %block, ?age, "the saved state has expired");
                    return None;
                }
                Ok(_) => {}
            }
        }
        Some(stored.state)
    }
}

/// Initialize with a value computed by an async task, bounded by a timeout.
pub struct InitTask {
    task: TaskFn,
    timeout: Duration,
    applied: AtomicBool,
}

impl InitTask {
    /// Creates the initializer with the default timeout.
    pub fn new<F, Fut>(task: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = CircuitResult<Option<Value>>> + Send + 'static,
    {
        Self {
            task: Arc::new(move || task().boxed()),
            timeout: DEFAULT_INIT_TIMEOUT,
            applied: AtomicBool::new(false),
        }
    }

    /// Sets the timeout.
    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Passively wait for the block to be initialized by an event.
pub struct InitWait {
    timeout: Duration,
    applied: AtomicBool,
}

impl InitWait {
    /// Creates the initializer.
    #[must_use]
    pub const fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            applied: AtomicBool::new(false),
        }
    }
}

/// One initialization strategy of a block.
pub enum Initializer {
    /// Literal value.
    Value(InitValue),
    /// Computed value.
    Function(InitFunction),
    /// Persisted state.
    Restore(RestoreState),
    /// Async computed value.
    Task(InitTask),
    /// Wait for an event.
    Wait(InitWait),
}

impl Initializer {
    /// Returns the initializer type name.
    #[must_use]
    pub const fn type_name(&self) -> &'static str {
        match self {
            Self::Value(_) => "InitValue",
            Self::Function(_) => "InitFunction",
            Self::Restore(_) => "RestoreState",
            Self::Task(_) => "InitTask",
            Self::Wait(_) => "InitWait",
        }
    }

    /// Returns true for initializers that suspend.
    #[must_use]
    pub const fn is_async(&self) -> bool {
        matches!(self, Self::Task(_) | Self::Wait(_))
    }

    pub(crate) const fn checkpoint_mode(&self) -> Option<CheckpointMode> {
        match self {
            Self::Restore(r) => Some(r.checkpoints),
            _ => None,
        }
    }

    const fn applied(&self) -> &AtomicBool {
        match self {
            Self::Value(i) => &i.applied,
            Self::Function(i) => &i.applied,
            Self::Restore(i) => &i.applied,
            Self::Task(i) => &i.applied,
            Self::Wait(i) => &i.applied,
        }
    }

    /// Marks the initializer applied; returns false if it already was.
    fn claim(&self) -> bool {
        !self.applied().swap(true, Ordering::AcqRel)
    }

    fn timeout(&self) -> Option<Duration> {
        match self {
            Self::Task(t) => Some(t.timeout),
            Self::Wait(w) => Some(w.timeout),
            _ => None,
        }
    }

    fn apply_sync(&self, block: &Block) {
        if !self.claim() {
            return;
        }
        let name = self.type_name();
        let value = match self {
            Self::Value(i) => Ok(Some(i.value.clone())),
            Self::Function(i) => (i.func)(),
            Self::Restore(r) => {
                if !block.persistence().is_enabled() {
                    return;
                }
                let Some(state) = r.stored_state(block) else {
                    return;
                };
                tracing::debug!(unit = %block, %state, "restoring saved state");
                if let Err(err) = block.restore_state(state) {
                    tracing::error!(unit = %block, error = %err, "RestoreState could not apply the saved state");
                }
                return;
            }
            Self::Task(_) | Self::Wait(_) => return,
        };
        match value {
            Ok(Some(value)) => {
                tracing::debug!(unit = %block, initializer = name, %value, "init value");
                if let Err(err) = block.apply_init(value) {
                    tracing::error!(unit = %block, initializer = name, error = %err, "could not apply the initialization value");
                }
            }
            Ok(None) => {}
            Err(err) => {
                tracing::error!(unit = %block, initializer = name, error = %err, "could not get the initialization value");
            }
        }
    }

    async fn apply_async(&self, block: &Block) {
        if !self.claim() {
            return;
        }
        let name = self.type_name();
        let timeout = self.timeout().unwrap_or(DEFAULT_INIT_TIMEOUT);
        if let Some(circuit) = block.circuit() {
            if timeout >= circuit.config().long_init_timeout {
                tracing::debug!(unit = %block, initializer = name, ?timeout, "long initializer timeout");
            }
        }
        let fut: BoxFuture<'static, CircuitResult<Option<Value>>> = match self {
            Self::Task(t) => (t.task)(),
            Self::Wait(_) => futures::future::pending().boxed(),
            _ => return,
        };

        let job = tokio::spawn(tokio::time::timeout(timeout, fut));
        block.set_init_job(Some(job.abort_handle()));
        let _abort = AbortOnDrop(job.abort_handle());
        if block.is_initialized() {
            // a value arrived before the job handle was published
            job.abort();
        }

        let value = match job.await {
            Ok(Ok(Ok(Some(value)))) => value,
            Ok(Ok(Ok(None))) => return,
            Ok(Ok(Err(err))) => {
                tracing::error!(unit = %block, initializer = name, error = %err, "skipping failed initializer");
                return;
            }
            Ok(Err(_)) => {
                tracing::debug!(unit = %block, initializer = name, "initializer timed out");
                return;
            }
            Err(err) if err.is_cancelled() => {
                tracing::debug!(unit = %block, initializer = name, "initializer cancelled");
                return;
            }
            Err(err) => {
                tracing::error!(unit = %block, initializer = name, error = %err, "initializer task failed");
                return;
            }
        };
        block.set_init_job(None);
        if block.is_initialized() {
            tracing::debug!(
                unit = %block,
                initializer = name,
                "not applying the init value, the block has been initialized in the meantime"
            );
            return;
        }
        tracing::debug!(unit = %block, initializer = name, %value, "init value");
        if let Err(err) = block.apply_init(value) {
            tracing::error!(unit = %block, initializer = name, error = %err, "could not apply the initialization value");
        }
    }
}

impl fmt::Debug for Initializer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.type_name())
    }
}

impl From<Value> for Initializer {
    fn from(value: Value) -> Self {
        Self::Value(InitValue::new(value))
    }
}

impl From<InitValue> for Initializer {
    fn from(i: InitValue) -> Self {
        Self::Value(i)
    }
}

impl From<InitFunction> for Initializer {
    fn from(i: InitFunction) -> Self {
        Self::Function(i)
    }
}

impl From<RestoreState> for Initializer {
    fn from(i: RestoreState) -> Self {
        Self::Restore(i)
    }
}

impl From<InitTask> for Initializer {
    fn from(i: InitTask) -> Self {
        Self::Task(i)
    }
}

impl From<InitWait> for Initializer {
    fn from(i: InitWait) -> Self {
        Self::Wait(i)
    }
}

struct AbortOnDrop(tokio::task::AbortHandle);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

fn run_default(block: &Block) {
    if block.is_initialized() {
        return;
    }
    tracing::debug!(unit = %block, "calling the default initializer");
    if let Err(err) = block.init_default() {
        tracing::error!(unit = %block, error = %err, "default initializer failed");
    }
}

/// Initialize a block with its synchronous initializers only.
pub(crate) fn init_block_sync(block: &Block) {
    for init in block.initializers() {
        if block.is_initialized() {
            return;
        }
        if !init.is_async() {
            init.apply_sync(block);
        }
    }
    run_default(block);
}

/// Initialize a block with all its initializers, in order.
pub(crate) async fn init_block_async(block: &Block) {
    for init in block.initializers() {
        if block.is_initialized() {
            return;
        }
        if init.is_async() {
            init.apply_async(block).await;
        } else {
            init.apply_sync(block);
        }
    }
    run_default(block);
}

/// Initialize blocks: those with synchronous initializers only first, one by
/// one, then the others concurrently.
///
/// # Errors
/// `NotInitialized` naming every block left without a value.
pub(crate) async fn init_blocks(blocks: &[Block]) -> CircuitResult<()> {
    let (async_blocks, sync_blocks): (Vec<&Block>, Vec<&Block>) = blocks
        .iter()
        .filter(|b| !b.is_initialized())
        .partition(|b| b.has_async_initializers());

    if !sync_blocks.is_empty() {
        tracing::debug!(count = sync_blocks.len(), "initializing blocks having sync initializers only");
        for block in sync_blocks {
            init_block_sync(block);
        }
    }
    if !async_blocks.is_empty() {
        tracing::debug!(count = async_blocks.len(), "initializing blocks having async initializers");
        join_all(async_blocks.into_iter().map(init_block_async)).await;
    }

    let missing: Vec<String> = blocks
        .iter()
        .filter(|b| !b.is_initialized())
        .map(|b| b.name().to_string())
        .collect();
    if missing.is_empty() {
        Ok(())
    } else {
        Err(CircuitError::new(ErrorKind::NotInitialized { names: missing }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::unit::BlockLogic;
    use crate::value::Output;
    use crate::Circuit;

    struct Cell;

    impl BlockLogic for Cell {
        const TYPE_NAME: &'static str = "Cell";
        const ACCEPTS_INITIAL: bool = true;

        fn init(&self, block: &Block, value: Value) -> CircuitResult<()> {
            if value.is_null() {
                return Err(CircuitError::rejected("null"));
            }
            block.set_output(value).map(|_| ())
        }
    }

    #[test]
    fn test_first_success_wins() {
        let circuit = Circuit::new();
        let block = Block::builder("c")
            .initial(InitFunction::new(|| Err(CircuitError::failed("no source"))))
            .initial_value(Value::Null)
            .initial_value(0)
            .initial_value(1)
            .build(&circuit, Cell)
            .unwrap();
        init_block_sync(&block);
        assert_eq!(block.output(), Output::Defined(Value::Int(0)));
    }

    #[test]
    fn test_initializer_applied_once() {
        let circuit = Circuit::new();
        let block = Block::builder("c")
            .initial_value(Value::Null)
            .build(&circuit, Cell)
            .unwrap();
        let init = &block.initializers()[0];
        assert!(init.claim());
        assert!(!init.claim());
    }

    #[tokio::test]
    async fn test_all_failing_reports_every_block() {
        let circuit = Circuit::new();
        let a = Block::builder("a")
            .initial_value(Value::Null)
            .build(&circuit, Cell)
            .unwrap();
        let b = Block::builder("b")
            .initial(InitWait::new(Duration::from_millis(10)))
            .build(&circuit, Cell)
            .unwrap();
        let c = Block::builder("c")
            .initial_value(2)
            .build(&circuit, Cell)
            .unwrap();

        let err = init_blocks(&[a, b, c.clone()]).await.unwrap_err();
        assert_eq!(err.to_string(), "Not initialized: a, b");
        assert!(c.is_initialized());
    }

    #[tokio::test]
    async fn test_async_task_initializes() {
        let circuit = Circuit::new();
        let block = Block::builder("t")
            .initial(InitTask::new(|| async { Ok(Some(Value::Int(7))) }))
            .build(&circuit, Cell)
            .unwrap();
        init_blocks(std::slice::from_ref(&block)).await.unwrap();
        assert_eq!(block.output(), Output::Defined(Value::Int(7)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_task_timeout_falls_through() {
        let circuit = Circuit::new();
        let block = Block::builder("t")
            .initial(
                InitTask::new(|| async {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                    Ok(Some(Value::Int(1)))
                })
                .timeout(Duration::from_secs(1)),
            )
            .initial_value(3)
            .build(&circuit, Cell)
            .unwrap();
        init_blocks(std::slice::from_ref(&block)).await.unwrap();
        assert_eq!(block.output(), Output::Defined(Value::Int(3)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_is_cut_short_by_a_value() {
        let circuit = Circuit::new();
        let block = Block::builder("w")
            .initial(InitWait::new(Duration::from_secs(3600)))
            .build(&circuit, Cell)
            .unwrap();
        let started = tokio::time::Instant::now();
        let setter = block.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            setter.set_output(42).unwrap();
        });
        init_blocks(std::slice::from_ref(&block)).await.unwrap();
        assert_eq!(block.output(), Output::Defined(Value::Int(42)));
        assert!(started.elapsed() < Duration::from_secs(1));
    }
}
