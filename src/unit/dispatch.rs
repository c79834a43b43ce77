//! Event data and per-type handler tables.
//!
//! A block type declares its events by filling a [`HandlerTable`] in
//! [`BlockLogic::handlers`]. The table is built once per type and shared by
//! every block of that type.
//!
//! # Layers
//!
//! Tables are built from the most general layer to the most specific one:
//! 1. Introspection events every block answers (`_get_names`, `_get_output`,
//!    `_get_previous`, `_get_state`)
//! 2. Handlers registered by the block type
//!
//! A later registration under the same event name replaces an earlier one.

use std::any::{Any, TypeId};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, OnceLock, RwLock};

use crate::error::{CircuitError, CircuitResult, ErrorKind};
use crate::value::Value;

use super::{Block, BlockLogic};

/// Prefix of read-only introspection events, accepted even after shutdown.
pub(crate) const INTROSPECTION_PREFIX: &str = "_get_";

/// Data delivered with an event: an optional main value plus named fields.
///
/// # Examples
///
/// ```
/// use kyrocircuit::{EventData, Value};
///
/// let data = EventData::from_value(5).field("source", "api");
/// assert_eq!(data.evalue(), Some(&Value::Int(5)));
/// assert_eq!(data.get("source"), Some(&Value::from("api")));
/// ```
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EventData {
    evalue: Option<Value>,
    fields: BTreeMap<String, Value>,
}

impl EventData {
    /// Creates empty event data.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates event data carrying a main value.
    #[must_use]
    pub fn from_value(value: impl Into<Value>) -> Self {
        Self::new().value(value)
    }

    /// Sets the main value.
    #[must_use]
    pub fn value(mut self, value: impl Into<Value>) -> Self {
        self.evalue = Some(value.into());
        self
    }

    /// Adds a named field.
    #[must_use]
    pub fn field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    /// Adds a named field if a value is present; `None` is dropped.
    ///
    /// Useful for forwarding another unit's output, which may be undefined.
    #[must_use]
    pub fn field_opt(mut self, key: impl Into<String>, value: Option<Value>) -> Self {
        if let Some(v) = value {
            self.fields.insert(key.into(), v);
        }
        self
    }

    /// Returns the main value.
    #[must_use]
    pub const fn evalue(&self) -> Option<&Value> {
        self.evalue.as_ref()
    }

    /// Returns the main value or a `MissingEventValue` error.
    pub fn require_value(&self) -> CircuitResult<&Value> {
        self.evalue
            .as_ref()
            .ok_or_else(|| CircuitError::new(ErrorKind::MissingEventValue))
    }

    /// Returns a named field.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    /// Returns all named fields.
    #[must_use]
    pub const fn fields(&self) -> &BTreeMap<String, Value> {
        &self.fields
    }

    /// Returns true if there is neither a main value nor any field.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.evalue.is_none() && self.fields.is_empty()
    }
}

impl fmt::Display for EventData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("<EMPTY>");
        }
        f.write_str("{")?;
        let mut first = true;
        if let Some(v) = &self.evalue {
            write!(f, "evalue: {v}")?;
            first = false;
        }
        for (k, v) in &self.fields {
            if !first {
                f.write_str(", ")?;
            }
            write!(f, "{k}: {v}")?;
            first = false;
        }
        f.write_str("}")
    }
}

/// An event handler of block type `T`.
pub type Handler<T> = fn(&T, &Block, &EventData) -> CircuitResult<Value>;

/// Event name to handler map of one block type.
pub struct HandlerTable<T> {
    handlers: HashMap<String, Handler<T>>,
}

impl<T: BlockLogic> HandlerTable<T> {
    fn build() -> Self {
        let mut table = Self {
            handlers: HashMap::new(),
        };
        table
            .on("_get_names", get_names::<T>)
            .on("_get_output", get_output::<T>)
            .on("_get_previous", get_previous::<T>)
            .on("_get_state", get_state::<T>);
        T::handlers(&mut table);
        table
    }

    /// Registers a handler, replacing any earlier one for the same event.
    pub fn on(&mut self, etype: &str, handler: Handler<T>) -> &mut Self {
        self.handlers.insert(etype.to_string(), handler);
        self
    }

    /// Returns the handler for an event type.
    #[must_use]
    pub fn get(&self, etype: &str) -> Option<Handler<T>> {
        self.handlers.get(etype).copied()
    }

    /// Returns the supported event types, sorted.
    #[must_use]
    pub fn event_types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }
}

impl<T> fmt::Debug for HandlerTable<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerTable")
            .field("events", &self.handlers.len())
            .finish()
    }
}

type AnyTable = Arc<dyn Any + Send + Sync>;

static HANDLER_TABLES: OnceLock<RwLock<HashMap<TypeId, AnyTable>>> = OnceLock::new();

/// Returns the shared handler table of `T`, building it on first use.
pub(crate) fn handler_table<T: BlockLogic>() -> Arc<HandlerTable<T>> {
    let cache = HANDLER_TABLES.get_or_init(|| RwLock::new(HashMap::new()));
    let key = TypeId::of::<T>();

    if let Ok(guard) = cache.read() {
        if let Some(table) = guard.get(&key).cloned() {
            if let Ok(table) = table.downcast::<HandlerTable<T>>() {
                return table;
            }
        }
    }

    let table = Arc::new(HandlerTable::<T>::build());
    // a poisoned cache only costs a rebuild
    if let Ok(mut guard) = cache.write() {
        let cached = guard
            .entry(key)
            .or_insert_with(|| Arc::clone(&table) as AnyTable)
            .clone();
        if let Ok(cached) = cached.downcast::<HandlerTable<T>>() {
            return cached;
        }
    }
    table
}

fn get_names<T: BlockLogic>(_: &T, block: &Block, _: &EventData) -> CircuitResult<Value> {
    Ok(Value::Structured(serde_json::json!({
        "type": block.type_name(),
        "name": block.name(),
        "comment": block.comment(),
    })))
}

fn not_initialized(block: &Block) -> CircuitError {
    CircuitError::new(ErrorKind::NotInitialized {
        names: vec![block.name().to_string()],
    })
}

fn get_output<T: BlockLogic>(_: &T, block: &Block, _: &EventData) -> CircuitResult<Value> {
    block.output().into_value().ok_or_else(|| not_initialized(block))
}

fn get_previous<T: BlockLogic>(_: &T, block: &Block, _: &EventData) -> CircuitResult<Value> {
    Ok(block.previous().into_value().unwrap_or_default())
}

fn get_state<T: BlockLogic>(logic: &T, block: &Block, _: &EventData) -> CircuitResult<Value> {
    if !T::PERSISTENT {
        return Err(CircuitError::new(ErrorKind::UnknownEvent {
            unit: format!("{} blocks", T::TYPE_NAME),
            etype: "_get_state".to_string(),
        }));
    }
    if !block.is_initialized() {
        return Err(not_initialized(block));
    }
    logic.export_state(block)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Plain;

    impl BlockLogic for Plain {
        const TYPE_NAME: &'static str = "Plain";

        fn handlers(table: &mut HandlerTable<Self>) {
            table.on("ping", |_, _, _| Ok(Value::from("pong")));
        }
    }

    struct Pending;

    impl BlockLogic for Pending {
        const TYPE_NAME: &'static str = "Pending";
        const ACCEPTS_INITIAL: bool = true;
    }

    struct Overriding;

    impl BlockLogic for Overriding {
        const TYPE_NAME: &'static str = "Overriding";

        fn handlers(table: &mut HandlerTable<Self>) {
            table
                .on("_get_output", |_, _, _| Ok(Value::from("hidden")))
                .on("x", |_, _, _| Ok(Value::Int(1)))
                .on("x", |_, _, _| Ok(Value::Int(2)));
        }
    }

    #[test]
    fn test_event_data_fields() {
        let data = EventData::new()
            .field("a", 1)
            .field_opt("b", None)
            .field_opt("c", Some(Value::Bool(true)));
        assert!(data.evalue().is_none());
        assert!(data.get("b").is_none());
        assert_eq!(data.fields().len(), 2);
        assert!(data.require_value().is_err());
        assert_eq!(data.to_string(), "{a: 1, c: true}");
        assert_eq!(EventData::new().to_string(), "<EMPTY>");
        assert_eq!(EventData::from_value(3).to_string(), "{evalue: 3}");
    }

    #[test]
    fn test_table_has_base_layer() {
        let table = handler_table::<Plain>();
        assert_eq!(
            table.event_types(),
            vec!["_get_names", "_get_output", "_get_previous", "_get_state", "ping"]
        );
    }

    #[test]
    fn test_table_is_shared_per_type() {
        let a = handler_table::<Plain>();
        let b = handler_table::<Plain>();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn test_later_registration_wins() {
        let circuit = crate::Circuit::new();
        let block = Block::builder("o").build(&circuit, Overriding).unwrap();
        let table = handler_table::<Overriding>();

        let x = table.get("x").unwrap();
        assert_eq!(x(&Overriding, &block, &EventData::new()).unwrap(), Value::Int(2));
        let out = table.get("_get_output").unwrap();
        assert_eq!(
            out(&Overriding, &block, &EventData::new()).unwrap(),
            Value::from("hidden")
        );
    }

    #[test]
    fn test_undefined_output_is_not_null() {
        let circuit = crate::Circuit::new();
        let pending = Block::builder("p").build(&circuit, Pending).unwrap();
        let err = pending.event("_get_output", EventData::new()).unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::NotInitialized { names } if names == &["p"]));

        let plain = Block::builder("q").build(&circuit, Plain).unwrap();
        assert_eq!(plain.event("_get_output", EventData::new()).unwrap(), Value::Null);
    }
}
