//! Formulas and triggers.
//!
//! Both wrap a function over named inputs. Inputs are given as names or
//! handles and resolved during pre-init; resolving also registers the
//! formula or trigger as a dependent of each input.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::circuit::{validate_unit_name, Circuit, CircuitPhase};
use crate::error::{CircuitError, CircuitResult, ErrorKind};
use crate::value::Value;

use super::{propagation, TriggerSet, Unit, UnitCore, UnitRef};

/// Current values of a function's inputs.
#[derive(Debug, Clone, PartialEq)]
pub struct InputValues {
    names: Vec<String>,
    values: Vec<Value>,
}

impl InputValues {
    /// Returns the value of the input named `name`.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.names
            .iter()
            .position(|n| n == name)
            .and_then(|i| self.values.get(i))
    }

    /// Returns the value of the input at `index`, in declaration order.
    #[must_use]
    pub fn at(&self, index: usize) -> Option<&Value> {
        self.values.get(index)
    }

    /// Returns all values in declaration order.
    #[must_use]
    pub fn values(&self) -> &[Value] {
        &self.values
    }

    /// Returns the number of inputs.
    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Returns true if there are no inputs.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

type BoxedFn<R> = Box<dyn Fn(&InputValues) -> CircuitResult<R> + Send + Sync>;

/// A function bound to named inputs.
struct BoundFunction<R> {
    refs: Vec<UnitRef>,
    inputs: OnceLock<Vec<Unit>>,
    func: BoxedFn<R>,
    signature: String,
}

impl<R> BoundFunction<R> {
    fn new(refs: Vec<UnitRef>, func: BoxedFn<R>, owner: &str) -> CircuitResult<Self> {
        if refs.is_empty() {
            return Err(CircuitError::new(ErrorKind::InvalidConfig {
                reason: format!("{owner} function must take at least one input"),
            }));
        }
        let signature = refs.iter().map(UnitRef::name).collect::<Vec<_>>().join(", ");
        Ok(Self {
            refs,
            inputs: OnceLock::new(),
            func,
            signature,
        })
    }

    fn resolve(&self, circuit: &Circuit) -> CircuitResult<&[Unit]> {
        if let Some(inputs) = self.inputs.get() {
            return Ok(inputs.as_slice());
        }
        let resolved = self
            .refs
            .iter()
            .map(|r| circuit.resolve(r.clone()))
            .collect::<CircuitResult<Vec<_>>>()?;
        Ok(self.inputs.get_or_init(|| resolved).as_slice())
    }

    /// Calls the function with current input values.
    ///
    /// Returns `None` while an input has no value; that is legal only
    /// before the circuit runs.
    fn call(&self, owner: &str, circuit: Option<&Circuit>) -> CircuitResult<Option<R>> {
        let Some(inputs) = self.inputs.get() else {
            return Ok(None);
        };
        let mut values = Vec::with_capacity(inputs.len());
        for input in inputs {
            match input.output().into_value() {
                Some(v) => values.push(v),
                None => {
                    let phase = circuit.map_or(CircuitPhase::Closed, Circuit::phase);
                    if phase < CircuitPhase::Running {
                        tracing::trace!(unit = owner, input = input.name(), "input undefined, not calling");
                        return Ok(None);
                    }
                    let err = CircuitError::new(ErrorKind::UndefinedInput {
                        unit: owner.to_string(),
                        input: input.name().to_string(),
                    });
                    report(circuit, &err);
                    return Err(err);
                }
            }
        }
        let args = InputValues {
            names: inputs.iter().map(|u| u.name().to_string()).collect(),
            values,
        };
        tracing::debug!(unit = owner, inputs = ?args.values, "calling function");
        (self.func)(&args).map(Some).map_err(|err| {
            let err = err.with_context(format!("Failed function call originated from {owner}"));
            report(circuit, &err);
            err
        })
    }
}

fn report(circuit: Option<&Circuit>, err: &CircuitError) {
    if let Some(circuit) = circuit {
        circuit.abort(err.clone());
    }
}

pub(crate) struct FormulaInner {
    core: UnitCore,
    function: BoundFunction<Value>,
    evaluating: AtomicBool,
}

/// A unit whose output is computed from other units' outputs.
///
/// The function should be pure: it is called whenever an input changes.
#[derive(Clone)]
pub struct Formula {
    inner: Arc<FormulaInner>,
}

/// Builder for [`Formula`].
#[must_use]
pub struct FormulaBuilder {
    name: String,
    comment: String,
    inputs: Vec<UnitRef>,
}

impl FormulaBuilder {
    /// Sets a free-text comment.
    pub fn comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = comment.into();
        self
    }

    /// Adds an input.
    pub fn input(mut self, input: impl Into<UnitRef>) -> Self {
        self.inputs.push(input.into());
        self
    }

    /// Adds several inputs.
    pub fn inputs<I, R>(mut self, inputs: I) -> Self
    where
        I: IntoIterator<Item = R>,
        R: Into<UnitRef>,
    {
        self.inputs.extend(inputs.into_iter().map(Into::into));
        self
    }

    /// Creates the formula and registers it in the circuit.
    ///
    /// # Errors
    /// Invalid or duplicate name, no inputs, or the circuit no longer
    /// accepts units.
    pub fn build<F>(self, circuit: &Circuit, func: F) -> CircuitResult<Formula>
    where
        F: Fn(&InputValues) -> CircuitResult<Value> + Send + Sync + 'static,
    {
        validate_unit_name(&self.name, false)?;
        let function = BoundFunction::new(self.inputs, Box::new(func), "Formula")?;
        let formula = Formula {
            inner: Arc::new(FormulaInner {
                core: UnitCore::new(self.name, self.comment, "Formula", circuit),
                function,
                evaluating: AtomicBool::new(false),
            }),
        };
        circuit.register_unit(Unit::Formula(formula.clone()))?;
        Ok(formula)
    }
}

/// Clears the evaluating flag when the cascade ends.
struct Evaluating<'a>(&'a AtomicBool);

impl Drop for Evaluating<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl Formula {
    /// Starts building a formula named `name`.
    pub fn builder(name: impl Into<String>) -> FormulaBuilder {
        FormulaBuilder {
            name: name.into(),
            comment: String::new(),
            inputs: Vec::new(),
        }
    }

    pub(crate) fn core(&self) -> &UnitCore {
        &self.inner.core
    }

    pub(crate) fn downgrade(&self) -> Weak<FormulaInner> {
        Arc::downgrade(&self.inner)
    }

    pub(crate) fn upgrade(weak: &Weak<FormulaInner>) -> Option<Self> {
        weak.upgrade().map(|inner| Self { inner })
    }

    /// Returns the formula name.
    #[must_use]
    pub fn name(&self) -> &str {
        self.inner.core.name()
    }

    /// Returns the current output.
    #[must_use]
    pub fn output(&self) -> crate::value::Output {
        self.inner.core.output()
    }

    /// Returns the previous output.
    #[must_use]
    pub fn previous(&self) -> crate::value::Output {
        self.inner.core.previous()
    }

    /// Returns true once the formula holds a value.
    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.inner.core.is_initialized()
    }

    pub(crate) fn pre_init(&self, circuit: &Circuit) -> CircuitResult<()> {
        for input in self.inner.function.resolve(circuit)? {
            input.core().add_formula(self);
        }
        Ok(())
    }

    pub(crate) fn start(&self) -> CircuitResult<()> {
        // triggers are not running yet, the affected set is irrelevant
        self.evaluate().map(|_| ())
    }

    /// Evaluates this formula and, on a change, its dependent formulas.
    ///
    /// Returns the triggers affected by the change.
    pub(crate) fn evaluate(&self) -> CircuitResult<TriggerSet> {
        let circuit = self.inner.core.circuit();
        let _turn = circuit.as_ref().map(Circuit::take_turn);
        if self.inner.evaluating.load(Ordering::Acquire) {
            let err = CircuitError::new(ErrorKind::DependencyCycle {
                unit: self.to_string(),
            });
            report(circuit.as_ref(), &err);
            return Err(err);
        }
        self.inner.evaluating.store(true, Ordering::Release);
        let _guard = Evaluating(&self.inner.evaluating);
        let Some(result) = self.inner.function.call(self.inner.core.label(), circuit.as_ref())?
        else {
            return Ok(TriggerSet::new());
        };
        let Some(dependents) = self.inner.core.store(result, false) else {
            return Ok(TriggerSet::new());
        };
        propagation::cascade(dependents)
    }
}

impl fmt::Display for Formula {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.inner.core.label())
    }
}

impl fmt::Debug for Formula {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Formula")
            .field("name", &self.name())
            .field("inputs", &self.inner.function.signature)
            .field("output", &self.output())
            .finish()
    }
}

/// Unique identifier for a trigger.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TriggerId(Uuid);

impl TriggerId {
    /// Create a new random trigger id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TriggerId {
    fn default() -> Self {
        Self::new()
    }
}

pub(crate) struct TriggerInner {
    id: TriggerId,
    function: BoundFunction<()>,
    enabled: AtomicBool,
    label: String,
    circuit: Weak<crate::circuit::CircuitInner>,
}

/// An anonymous observer running a side-effecting function when any of
/// its inputs changes.
///
/// A trigger is enabled from the start of the circuit until its stop; while
/// disabled it ignores changes.
#[derive(Clone)]
pub struct Trigger {
    inner: Arc<TriggerInner>,
}

/// Builder for [`Trigger`].
#[must_use]
#[derive(Default)]
pub struct TriggerBuilder {
    inputs: Vec<UnitRef>,
}

impl TriggerBuilder {
    /// Adds an input.
    pub fn input(mut self, input: impl Into<UnitRef>) -> Self {
        self.inputs.push(input.into());
        self
    }

    /// Adds several inputs.
    pub fn inputs<I, R>(mut self, inputs: I) -> Self
    where
        I: IntoIterator<Item = R>,
        R: Into<UnitRef>,
    {
        self.inputs.extend(inputs.into_iter().map(Into::into));
        self
    }

    /// Creates the trigger and registers it in the circuit.
    ///
    /// # Errors
    /// No inputs, or the circuit no longer accepts units.
    pub fn build<F>(self, circuit: &Circuit, func: F) -> CircuitResult<Trigger>
    where
        F: Fn(&InputValues) -> CircuitResult<()> + Send + Sync + 'static,
    {
        let function = BoundFunction::new(self.inputs, Box::new(func), "Trigger")?;
        let label = format!("<Trigger for ({})>", function.signature);
        let trigger = Trigger {
            inner: Arc::new(TriggerInner {
                id: TriggerId::new(),
                function,
                enabled: AtomicBool::new(false),
                label,
                circuit: circuit.downgrade(),
            }),
        };
        circuit.register_trigger(trigger.clone())?;
        Ok(trigger)
    }
}

impl Trigger {
    /// Starts building a trigger.
    pub fn builder() -> TriggerBuilder {
        TriggerBuilder::default()
    }

    /// Returns the trigger identity.
    #[must_use]
    pub fn id(&self) -> TriggerId {
        self.inner.id
    }

    /// Returns true between start and stop.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.inner.enabled.load(Ordering::Acquire)
    }

    pub(crate) fn downgrade(&self) -> Weak<TriggerInner> {
        Arc::downgrade(&self.inner)
    }

    pub(crate) fn upgrade(weak: &Weak<TriggerInner>) -> Option<Self> {
        weak.upgrade().map(|inner| Self { inner })
    }

    pub(crate) fn pre_init(&self, circuit: &Circuit) -> CircuitResult<()> {
        for input in self.inner.function.resolve(circuit)? {
            input.core().add_trigger(self);
        }
        Ok(())
    }

    pub(crate) fn start(&self) -> CircuitResult<()> {
        self.inner.enabled.store(true, Ordering::Release);
        self.fire()
    }

    pub(crate) fn stop(&self) {
        self.inner.enabled.store(false, Ordering::Release);
    }

    /// Runs the function unless disabled or an input has no value.
    pub(crate) fn fire(&self) -> CircuitResult<()> {
        if !self.is_enabled() {
            return Ok(());
        }
        let circuit = Circuit::upgrade(&self.inner.circuit);
        let _turn = circuit.as_ref().map(Circuit::take_turn);
        self.inner
            .function
            .call(&self.inner.label, circuit.as_ref())
            .map(|_| ())
    }
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.inner.label)
    }
}

impl fmt::Debug for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Trigger")
            .field("id", &self.inner.id)
            .field("inputs", &self.inner.function.signature)
            .field("enabled", &self.is_enabled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::unit::{Block, BlockLogic};
    use crate::value::Output;
    use std::sync::Mutex;

    struct Cell;

    impl BlockLogic for Cell {
        const TYPE_NAME: &'static str = "Cell";
        const ACCEPTS_INITIAL: bool = true;

        fn init(&self, block: &Block, value: Value) -> CircuitResult<()> {
            block.set_output(value).map(|_| ())
        }
    }

    fn int(v: &InputValues, name: &str) -> i64 {
        v.get(name).and_then(Value::as_int).unwrap_or_default()
    }

    #[test]
    fn test_formula_requires_inputs() {
        let circuit = Circuit::new();
        let err = Formula::builder("f")
            .build(&circuit, |_: &InputValues| Ok(Value::Null))
            .unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::InvalidConfig { .. }));
    }

    #[test]
    fn test_formula_follows_input() {
        let circuit = Circuit::new();
        let a = Block::builder("a").build(&circuit, Cell).unwrap();
        let double = Formula::builder("double")
            .input(&a)
            .build(&circuit, |v: &InputValues| Ok(Value::Int(int(v, "a") * 2)))
            .unwrap();
        double.pre_init(&circuit).unwrap();

        // undefined input before start: no result
        double.start().unwrap();
        assert_eq!(double.output(), Output::Undefined);

        a.set_output(4).unwrap();
        assert_eq!(double.output(), Output::Defined(Value::Int(8)));
        a.set_output(5).unwrap();
        assert_eq!(double.previous(), Output::Defined(Value::Int(8)));
    }

    #[test]
    fn test_disabled_trigger_does_not_fire() {
        let circuit = Circuit::new();
        let a = Block::builder("a").build(&circuit, Cell).unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let trigger = Trigger::builder()
            .input("a")
            .build(&circuit, move |v: &InputValues| {
                sink.lock().unwrap().push(int(v, "a"));
                Ok(())
            })
            .unwrap();
        trigger.pre_init(&circuit).unwrap();

        a.set_output(1).unwrap();
        assert!(seen.lock().unwrap().is_empty());

        trigger.start().unwrap();
        a.set_output(2).unwrap();
        trigger.stop();
        a.set_output(3).unwrap();
        assert_eq!(*seen.lock().unwrap(), vec![1, 2]);
    }

    #[test]
    fn test_trigger_error_aborts() {
        let circuit = Circuit::new();
        let a = Block::builder("a").build(&circuit, Cell).unwrap();
        let trigger = Trigger::builder()
            .input(&a)
            .build(&circuit, |_: &InputValues| Err(CircuitError::failed("side effect failed")))
            .unwrap();
        trigger.pre_init(&circuit).unwrap();
        trigger.start().unwrap();

        let err = a.set_output(1).unwrap_err();
        assert!(err.context()[0].contains("<Trigger for (a)>"));
        assert_eq!(circuit.errors(), vec![err]);
    }

    #[test]
    fn test_input_values_lookup() {
        let args = InputValues {
            names: vec!["x".into(), "y".into()],
            values: vec![Value::Int(1), Value::Bool(true)],
        };
        assert_eq!(args.get("y"), Some(&Value::Bool(true)));
        assert_eq!(args.at(0), Some(&Value::Int(1)));
        assert!(args.get("z").is_none());
        assert_eq!(args.len(), 2);
    }
}
