//! A small library of ready-made blocks.
//!
//! - [`Memory`]: holds the last accepted value
//! - [`Counter`]: an integer counter, optionally wrapping at a modulo

use crate::error::{CircuitError, CircuitResult, ErrorKind};
use crate::unit::{Block, BlockLogic, EventData, HandlerTable};
use crate::value::Value;

/// Memory cell holding the last stored value.
///
/// Values pass through the block's validator; a rejected value leaves the
/// output unchanged. Events:
/// - `store`: stores the event value and returns whether it was accepted
#[derive(Debug, Clone, Copy, Default)]
pub struct Memory;

impl Memory {
    fn store(block: &Block, value: Value) -> CircuitResult<bool> {
        let Some(value) = block.validate(value) else {
            return Ok(false);
        };
        block.set_output(value)?;
        Ok(true)
    }
}

impl BlockLogic for Memory {
    const TYPE_NAME: &'static str = "Memory";
    const ACCEPTS_INITIAL: bool = true;
    const PERSISTENT: bool = true;

    fn handlers(table: &mut HandlerTable<Self>) {
        table.on("store", |_, block, data| {
            let value = data.require_value()?.clone();
            Memory::store(block, value).map(Value::Bool)
        });
    }

    fn init(&self, block: &Block, value: Value) -> CircuitResult<()> {
        if Self::store(block, value)? {
            Ok(())
        } else {
            Err(CircuitError::rejected("initial value was rejected"))
        }
    }

    fn export_state(&self, block: &Block) -> CircuitResult<Value> {
        block
            .output()
            .into_value()
            .ok_or_else(|| CircuitError::internal("memory has no value to export"))
    }

    fn restore_state(&self, block: &Block, state: Value) -> CircuitResult<()> {
        self.init(block, state)
    }
}

/// Integer counter.
///
/// Events:
/// - `inc`, `dec`: add or subtract the event value (default 1)
/// - `put`: set the count
///
/// All events return the new count. With a modulo the count wraps to
/// `0..modulo`. The counter starts at zero.
#[derive(Debug, Clone, Copy, Default)]
pub struct Counter {
    modulo: Option<i64>,
}

impl Counter {
    /// Creates an unbounded counter.
    #[must_use]
    pub const fn new() -> Self {
        Self { modulo: None }
    }

    /// Creates a counter wrapping at `modulo`.
    ///
    /// # Errors
    /// `InvalidConfig` unless `modulo` is positive.
    pub fn with_modulo(modulo: i64) -> CircuitResult<Self> {
        if modulo <= 0 {
            return Err(CircuitError::new(ErrorKind::InvalidConfig {
                reason: format!("modulo must be positive, got {modulo}"),
            }));
        }
        Ok(Self {
            modulo: Some(modulo),
        })
    }

    fn put(&self, block: &Block, value: i64) -> CircuitResult<Value> {
        let value = self.modulo.map_or(value, |m| value.rem_euclid(m));
        block.set_output(value)?;
        Ok(Value::Int(value))
    }

    fn current(block: &Block) -> i64 {
        block
            .output()
            .value()
            .and_then(Value::as_int)
            .unwrap_or_default()
    }

    fn step(data: &EventData) -> CircuitResult<i64> {
        match data.evalue() {
            None => Ok(1),
            Some(v) => as_count(v),
        }
    }
}

fn as_count(value: &Value) -> CircuitResult<i64> {
    value
        .as_int()
        .ok_or_else(|| CircuitError::failed(format!("expected an integer, got {}", value.type_name())))
}

impl BlockLogic for Counter {
    const TYPE_NAME: &'static str = "Counter";
    const ACCEPTS_INITIAL: bool = true;
    const PERSISTENT: bool = true;

    fn handlers(table: &mut HandlerTable<Self>) {
        table
            .on("inc", |counter, block, data| {
                let step = Counter::step(data)?;
                counter.put(block, Counter::current(block).saturating_add(step))
            })
            .on("dec", |counter, block, data| {
                let step = Counter::step(data)?;
                counter.put(block, Counter::current(block).saturating_sub(step))
            })
            .on("put", |counter, block, data| {
                let value = as_count(data.require_value()?)?;
                counter.put(block, value)
            });
    }

    fn init(&self, block: &Block, value: Value) -> CircuitResult<()> {
        self.put(block, as_count(&value)?).map(|_| ())
    }

    fn init_default(&self, block: &Block) -> CircuitResult<()> {
        self.put(block, 0).map(|_| ())
    }

    fn export_state(&self, block: &Block) -> CircuitResult<Value> {
        Ok(Value::Int(Self::current(block)))
    }

    fn restore_state(&self, block: &Block, state: Value) -> CircuitResult<()> {
        self.init(block, state)
    }
}
