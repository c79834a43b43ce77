//! Circuit units.
//!
//! A unit is a named member of a circuit holding one output:
//! - `Block`: a stateful unit driven by events
//! - `Formula`: a unit whose output is a function of other units' outputs
//!
//! `Trigger` is not a unit; it has neither a name nor an output, it only
//! observes units.
//!
//! Every output change goes through [`UnitCore::store`], which records the
//! new value and hands back the dependents that must react to it.

mod block;
mod dispatch;
mod formula;
mod propagation;

pub use block::{Block, BlockBuilder, BlockLogic, PersistenceMode, Validator};
pub use dispatch::{EventData, Handler, HandlerTable};
pub use formula::{Formula, FormulaBuilder, InputValues, Trigger, TriggerBuilder, TriggerId};

pub(crate) use propagation::TriggerSet;

use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError, Weak};

use crate::circuit::{Circuit, CircuitInner};
use crate::value::{Output, Value};

use formula::{FormulaInner, TriggerInner};

/// Maximal comment length shown in unit labels.
const LABEL_COMMENT_WIDTH: usize = 40;

#[derive(Default)]
struct UnitState {
    output: Output,
    previous: Output,
    formulas: Vec<Weak<FormulaInner>>,
    triggers: Vec<Weak<TriggerInner>>,
}

/// Units reacting to an output change.
pub(crate) struct Dependents {
    pub(crate) formulas: Vec<Formula>,
    pub(crate) triggers: Vec<Trigger>,
}

/// State shared by blocks and formulas.
pub(crate) struct UnitCore {
    name: String,
    comment: String,
    type_name: &'static str,
    label: String,
    circuit: Weak<CircuitInner>,
    state: Mutex<UnitState>,
}

impl UnitCore {
    pub(crate) fn new(
        name: String,
        comment: String,
        type_name: &'static str,
        circuit: &Circuit,
    ) -> Self {
        let label = make_label(type_name, &name, &comment);
        Self {
            name,
            comment,
            type_name,
            label,
            circuit: circuit.downgrade(),
            state: Mutex::new(UnitState::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, UnitState> {
        // no user code runs under this lock, a poisoned guard still holds consistent data
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn comment(&self) -> &str {
        &self.comment
    }

    pub(crate) const fn type_name(&self) -> &'static str {
        self.type_name
    }

    pub(crate) fn label(&self) -> &str {
        &self.label
    }

    pub(crate) fn circuit(&self) -> Option<Circuit> {
        Circuit::upgrade(&self.circuit)
    }

    pub(crate) fn output(&self) -> Output {
        self.lock().output.clone()
    }

    pub(crate) fn previous(&self) -> Output {
        self.lock().previous.clone()
    }

    pub(crate) fn is_initialized(&self) -> bool {
        self.lock().output.is_defined()
    }

    pub(crate) fn add_formula(&self, formula: &Formula) {
        let mut state = self.lock();
        let weak = formula.downgrade();
        if !state.formulas.iter().any(|f| f.ptr_eq(&weak)) {
            state.formulas.push(weak);
        }
    }

    pub(crate) fn add_trigger(&self, trigger: &Trigger) {
        let mut state = self.lock();
        let weak = trigger.downgrade();
        if !state.triggers.iter().any(|t| t.ptr_eq(&weak)) {
            state.triggers.push(weak);
        }
    }

    pub(crate) fn clear_dependents(&self) {
        let mut state = self.lock();
        state.formulas.clear();
        state.triggers.clear();
    }

    /// Record a new output.
    ///
    /// Returns `None` if the value equals the current output, unless
    /// `always_notify` is set; in that case the value becomes both the
    /// current and the previous output and the change is forced.
    pub(crate) fn store(&self, value: Value, always_notify: bool) -> Option<Dependents> {
        let mut state = self.lock();
        if state.output.holds(&value) {
            if !always_notify {
                return None;
            }
            tracing::debug!(unit = %self.label, output = %value, "output unchanged, notifying anyway");
            state.previous = Output::Defined(value);
        } else {
            let previous = std::mem::replace(&mut state.output, Output::Defined(value));
            tracing::debug!(unit = %self.label, from = %previous, to = %state.output, "output changed");
            state.previous = previous;
        }
        Some(Dependents {
            formulas: state.formulas.iter().filter_map(Formula::upgrade).collect(),
            triggers: state.triggers.iter().filter_map(Trigger::upgrade).collect(),
        })
    }
}

fn make_label(type_name: &str, name: &str, comment: &str) -> String {
    if comment.is_empty() {
        return format!("<{type_name} {name}>");
    }
    let short: String = if comment.chars().count() > LABEL_COMMENT_WIDTH {
        let mut s: String = comment.chars().take(LABEL_COMMENT_WIDTH - 3).collect();
        s.push_str("...");
        s
    } else {
        comment.to_string()
    };
    format!("<{type_name} {name} comment='{short}'>")
}

/// A registered block or formula.
#[derive(Clone)]
pub enum Unit {
    /// A block.
    Block(Block),
    /// A formula.
    Formula(Formula),
}

impl Unit {
    pub(crate) fn core(&self) -> &UnitCore {
        match self {
            Self::Block(b) => b.core(),
            Self::Formula(f) => f.core(),
        }
    }

    /// Returns the unit name.
    #[must_use]
    pub fn name(&self) -> &str {
        self.core().name()
    }

    /// Returns the current output.
    #[must_use]
    pub fn output(&self) -> Output {
        self.core().output()
    }

    /// Returns the previous output.
    #[must_use]
    pub fn previous(&self) -> Output {
        self.core().previous()
    }

    /// Returns true once the unit holds a value.
    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.core().is_initialized()
    }

    /// Returns the block, if this unit is one.
    #[must_use]
    pub const fn as_block(&self) -> Option<&Block> {
        match self {
            Self::Block(b) => Some(b),
            Self::Formula(_) => None,
        }
    }

    /// Returns the formula, if this unit is one.
    #[must_use]
    pub const fn as_formula(&self) -> Option<&Formula> {
        match self {
            Self::Formula(f) => Some(f),
            Self::Block(_) => None,
        }
    }

    #[cfg(test)]
    pub(crate) fn same_as(&self, other: &Self) -> bool {
        std::ptr::eq(self.core(), other.core())
    }
}

impl fmt::Display for Unit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.core().label())
    }
}

impl fmt::Debug for Unit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.core().label())
    }
}

impl From<Block> for Unit {
    fn from(b: Block) -> Self {
        Self::Block(b)
    }
}

impl From<Formula> for Unit {
    fn from(f: Formula) -> Self {
        Self::Formula(f)
    }
}

/// Reference to a unit: a handle or a name resolved later.
#[derive(Clone, Debug)]
pub enum UnitRef {
    /// Unit name, resolved by the circuit.
    Name(String),
    /// Already resolved unit.
    Unit(Unit),
}

impl UnitRef {
    /// Returns the referenced name.
    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Self::Name(n) => n,
            Self::Unit(u) => u.name(),
        }
    }
}

impl From<&str> for UnitRef {
    fn from(name: &str) -> Self {
        Self::Name(name.to_string())
    }
}

impl From<String> for UnitRef {
    fn from(name: String) -> Self {
        Self::Name(name)
    }
}

impl From<Unit> for UnitRef {
    fn from(unit: Unit) -> Self {
        Self::Unit(unit)
    }
}

impl From<Block> for UnitRef {
    fn from(b: Block) -> Self {
        Self::Unit(Unit::Block(b))
    }
}

impl From<&Block> for UnitRef {
    fn from(b: &Block) -> Self {
        Self::Unit(Unit::Block(b.clone()))
    }
}

impl From<Formula> for UnitRef {
    fn from(f: Formula) -> Self {
        Self::Unit(Unit::Formula(f))
    }
}

impl From<&Formula> for UnitRef {
    fn from(f: &Formula) -> Self {
        Self::Unit(Unit::Formula(f.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Compile-time test: handles cross tasks
    fn _assert_units_are_shareable() {
        fn is_send_sync<T: Send + Sync>() {}
        is_send_sync::<Unit>();
        is_send_sync::<Trigger>();
        is_send_sync::<UnitRef>();
    }

    #[test]
    fn test_label_shortens_long_comments() {
        assert_eq!(make_label("Memory", "m", ""), "<Memory m>");
        let label = make_label("Memory", "m", &"x".repeat(60));
        assert!(label.ends_with("...'>"));
        assert!(label.len() < 70);
    }

    #[test]
    fn test_store_reports_change_once() {
        let circuit = Circuit::new();
        let core = UnitCore::new("a".into(), String::new(), "Test", &circuit);
        assert!(!core.is_initialized());

        assert!(core.store(Value::Int(1), false).is_some());
        assert!(core.store(Value::Int(1), false).is_none());
        assert_eq!(core.output(), Output::Defined(Value::Int(1)));
        assert_eq!(core.previous(), Output::Undefined);

        assert!(core.store(Value::Int(2), false).is_some());
        assert_eq!(core.previous(), Output::Defined(Value::Int(1)));
    }

    #[test]
    fn test_always_notify_forces_change() {
        let circuit = Circuit::new();
        let core = UnitCore::new("a".into(), String::new(), "Test", &circuit);
        core.store(Value::Int(1), true);
        core.store(Value::Int(2), true);
        assert!(core.store(Value::Int(2), true).is_some());
        assert_eq!(core.output(), Output::Defined(Value::Int(2)));
        assert_eq!(core.previous(), Output::Defined(Value::Int(2)));
    }
}
