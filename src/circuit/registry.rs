//! Unit registry: names, registration and lookup.
//!
//! Blocks and formulas share one namespace. Triggers are anonymous and kept
//! in a plain list. Registration order is preserved; the runner walks units
//! in that order.

use std::collections::HashMap;
use std::sync::OnceLock;

use regex::Regex;

use crate::error::{CircuitError, CircuitResult, ErrorKind};
use crate::unit::{Block, Formula, Trigger, Unit, UnitRef};

use super::phase::PhaseMonitor;
use super::{lock, Circuit, CircuitPhase};

/// Name of the reserved unit publishing the circuit phase.
pub(crate) const PHASE_UNIT: &str = "_phase";

const IDENTIFIER_PATTERN: &str = r"^[A-Za-z_][A-Za-z0-9_]*$";

static IDENTIFIER: OnceLock<Regex> = OnceLock::new();

fn identifier_regex() -> CircuitResult<&'static Regex> {
    if let Some(re) = IDENTIFIER.get() {
        return Ok(re);
    }
    let compiled = Regex::new(IDENTIFIER_PATTERN)
        .map_err(|e| CircuitError::internal(format!("invalid identifier pattern: {e}")))?;
    Ok(IDENTIFIER.get_or_init(|| compiled))
}

/// Checks that `name` is an identifier.
pub(crate) fn check_identifier(name: &str, what: &'static str) -> CircuitResult<()> {
    if identifier_regex()?.is_match(name) {
        Ok(())
    } else {
        Err(CircuitError::new(ErrorKind::InvalidName {
            what,
            name: name.to_string(),
        }))
    }
}

/// Checks a block or formula name. Names starting with `_` are reserved.
pub(crate) fn validate_unit_name(name: &str, reserved: bool) -> CircuitResult<()> {
    check_identifier(name, "Block/Formula name")?;
    if name.starts_with('_') && !reserved {
        return Err(CircuitError::new(ErrorKind::ReservedName {
            name: name.to_string(),
        }));
    }
    Ok(())
}

#[derive(Default)]
pub(crate) struct Registry {
    units: Vec<Unit>,
    index: HashMap<String, usize>,
    triggers: Vec<Trigger>,
}

impl Registry {
    fn insert(&mut self, unit: Unit) -> CircuitResult<()> {
        if self.index.contains_key(unit.name()) {
            return Err(CircuitError::new(ErrorKind::DuplicateName {
                name: unit.name().to_string(),
            }));
        }
        self.index.insert(unit.name().to_string(), self.units.len());
        self.units.push(unit);
        Ok(())
    }

    fn get(&self, name: &str) -> Option<&Unit> {
        self.index.get(name).and_then(|&i| self.units.get(i))
    }

    pub(crate) fn len(&self) -> usize {
        self.units.len()
    }

    pub(crate) fn trigger_count(&self) -> usize {
        self.triggers.len()
    }

    pub(crate) fn take_all(&mut self) -> Vec<Unit> {
        self.index.clear();
        self.triggers.clear();
        std::mem::take(&mut self.units)
    }

    fn unique_name(&self, prefix: &str) -> String {
        let delim = if prefix.ends_with('_') { "" } else { "_" };
        let mut num = self.index.keys().filter(|n| n.starts_with(prefix)).count();
        loop {
            let name = format!("{prefix}{delim}{num}");
            if !self.index.contains_key(&name) {
                return name;
            }
            num += 1;
        }
    }
}

impl Circuit {
    /// Returns an error unless new units may be added.
    pub(crate) fn check_can_register(&self) -> CircuitResult<()> {
        let phase = self.phase();
        if phase == CircuitPhase::Closed {
            return Err(CircuitError::new(ErrorKind::PhaseViolation {
                phase: phase.to_string(),
                reason: "the circuit was closed".to_string(),
            }));
        }
        if !phase.allows_units() {
            return Err(CircuitError::new(ErrorKind::PhaseViolation {
                phase: phase.to_string(),
                reason: "not allowed after the start".to_string(),
            }));
        }
        Ok(())
    }

    pub(crate) fn register_unit(&self, unit: Unit) -> CircuitResult<()> {
        self.check_can_register()?;
        lock(&self.inner.registry).insert(unit)
    }

    pub(crate) fn register_trigger(&self, trigger: Trigger) -> CircuitResult<()> {
        self.check_can_register()?;
        lock(&self.inner.registry).triggers.push(trigger);
        Ok(())
    }

    /// Returns the block or formula named `name`.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Unit> {
        lock(&self.inner.registry).get(name).cloned()
    }

    /// Returns the block named `name`.
    #[must_use]
    pub fn block(&self, name: &str) -> Option<Block> {
        self.get(name).and_then(|u| u.as_block().cloned())
    }

    /// Returns all blocks and formulas in registration order.
    #[must_use]
    pub fn units(&self) -> Vec<Unit> {
        lock(&self.inner.registry).units.clone()
    }

    /// Returns all blocks in registration order.
    #[must_use]
    pub fn blocks(&self) -> Vec<Block> {
        lock(&self.inner.registry)
            .units
            .iter()
            .filter_map(|u| u.as_block().cloned())
            .collect()
    }

    /// Returns all formulas in registration order.
    #[must_use]
    pub fn formulas(&self) -> Vec<Formula> {
        lock(&self.inner.registry)
            .units
            .iter()
            .filter_map(|u| u.as_formula().cloned())
            .collect()
    }

    /// Returns all triggers in registration order.
    #[must_use]
    pub fn triggers(&self) -> Vec<Trigger> {
        lock(&self.inner.registry).triggers.clone()
    }

    /// Resolves a unit reference.
    ///
    /// Handles are returned unchanged. Names are looked up. The reserved
    /// `_phase` unit is created on first use up to the `InitUnits` phase;
    /// only the `InitCircuit` phase and earlier accept the new unit.
    ///
    /// # Errors
    /// Returns `UnitNotFound` for an unknown name, or the registration
    /// error when `_phase` is first asked for during `InitUnits`.
    pub fn resolve(&self, unit: impl Into<UnitRef>) -> CircuitResult<Unit> {
        let name = match unit.into() {
            UnitRef::Unit(unit) => return Ok(unit),
            UnitRef::Name(name) => name,
        };
        if let Some(unit) = self.get(&name) {
            return Ok(unit);
        }
        if name == PHASE_UNIT && self.phase() <= CircuitPhase::InitUnits {
            let block = Block::builder(PHASE_UNIT)
                .comment("Circuit phase")
                .reserved()
                .build(self, PhaseMonitor)?;
            return Ok(Unit::Block(block));
        }
        Err(CircuitError::new(ErrorKind::UnitNotFound { name }))
    }

    /// Returns a name starting with `prefix` that is not registered yet.
    ///
    /// # Errors
    /// Returns `InvalidName` if the prefix is not an identifier.
    pub fn unique_name(&self, prefix: &str) -> CircuitResult<String> {
        check_identifier(prefix, "Block/Formula name prefix")?;
        Ok(lock(&self.inner.registry).unique_name(prefix))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blocklib::Memory;
    use crate::unit::InputValues;
    use crate::value::Value;

    #[test]
    fn test_identifiers() {
        assert!(check_identifier("abc_1", "name").is_ok());
        assert!(check_identifier("_x", "name").is_ok());
        assert!(check_identifier("1abc", "name").is_err());
        assert!(check_identifier("", "name").is_err());
        assert!(check_identifier("a-b", "name").is_err());
        assert!(validate_unit_name("_x", false).is_err());
        assert!(validate_unit_name("_x", true).is_ok());
    }

    #[test]
    fn test_duplicate_name() {
        let circuit = Circuit::new();
        Block::builder("x").build(&circuit, Memory).unwrap();
        let err = Formula::builder("x")
            .input("x")
            .build(&circuit, |_: &InputValues| Ok(Value::Null))
            .unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::DuplicateName { .. }));
        assert_eq!(circuit.units().len(), 1);
    }

    #[test]
    fn test_registration_after_start() {
        let circuit = Circuit::new();
        circuit.set_phase(CircuitPhase::InitCircuit);
        Block::builder("early").build(&circuit, Memory).unwrap();
        circuit.set_phase(CircuitPhase::InitUnits);
        let err = Block::builder("late").build(&circuit, Memory).unwrap_err();
        assert!(err.to_string().contains("not allowed after the start"));

        circuit.set_phase(CircuitPhase::Closed);
        let err = Block::builder("late").build(&circuit, Memory).unwrap_err();
        assert!(err.to_string().contains("the circuit was closed"));
    }

    #[test]
    fn test_unique_name() {
        let circuit = Circuit::new();
        assert_eq!(circuit.unique_name("auto").unwrap(), "auto_0");
        Block::builder("auto_0").build(&circuit, Memory).unwrap();
        Block::builder("auto_2").build(&circuit, Memory).unwrap();
        // two names share the prefix, the search starts at 2
        assert_eq!(circuit.unique_name("auto").unwrap(), "auto_3");
        assert_eq!(circuit.unique_name("tmp_").unwrap(), "tmp_0");
        assert!(circuit.unique_name("bad prefix").is_err());
    }

    #[test]
    fn test_resolve() {
        let circuit = Circuit::new();
        let m = Block::builder("m").build(&circuit, Memory).unwrap();
        assert_eq!(circuit.resolve("m").unwrap().name(), "m");
        assert!(circuit.resolve(&m).unwrap().same_as(&Unit::Block(m.clone())));
        let err = circuit.resolve("missing").unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::UnitNotFound { .. }));
    }

    #[test]
    fn test_phase_unit_is_created_on_demand() {
        let circuit = Circuit::new();
        let unit = circuit.resolve(PHASE_UNIT).unwrap();
        assert_eq!(unit.name(), "_phase");
        // the same unit on the next lookup
        assert!(circuit.resolve(PHASE_UNIT).unwrap().same_as(&unit));

        let late = Circuit::new();
        late.set_phase(CircuitPhase::InitUnits);
        let err = late.resolve(PHASE_UNIT).unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::PhaseViolation { .. }), "{err}");
        late.set_phase(CircuitPhase::Running);
        let err = late.resolve(PHASE_UNIT).unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::UnitNotFound { .. }), "{err}");
    }
}
