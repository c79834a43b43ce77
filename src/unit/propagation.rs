//! Change propagation.
//!
//! An output change first re-evaluates the dependent formulas, recursively,
//! and collects every trigger reached on the way. Only then the collected
//! triggers run, each exactly once, so a trigger always observes the final
//! values of all formulas affected by the change.

use std::collections::HashSet;

use crate::error::CircuitResult;

use super::{Dependents, Trigger, TriggerId};

/// Ordered set of triggers, de-duplicated by identity.
#[derive(Default)]
pub(crate) struct TriggerSet {
    triggers: Vec<Trigger>,
    seen: HashSet<TriggerId>,
}

impl TriggerSet {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn insert(&mut self, trigger: Trigger) {
        if self.seen.insert(trigger.id()) {
            self.triggers.push(trigger);
        }
    }

    pub(crate) fn extend(&mut self, other: Self) {
        for trigger in other.triggers {
            self.insert(trigger);
        }
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.triggers.len()
    }

    /// Runs every trigger once, in insertion order.
    pub(crate) fn fire_all(self) -> CircuitResult<()> {
        for trigger in self.triggers {
            trigger.fire()?;
        }
        Ok(())
    }
}

/// Evaluates the dependent formulas and returns all affected triggers.
pub(crate) fn cascade(dependents: Dependents) -> CircuitResult<TriggerSet> {
    let mut affected = TriggerSet::new();
    for trigger in dependents.triggers {
        affected.insert(trigger);
    }
    for formula in dependents.formulas {
        affected.extend(formula.evaluate()?);
    }
    Ok(affected)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::unit::InputValues;
    use crate::Circuit;

    #[test]
    fn test_trigger_set_dedupes() {
        let circuit = Circuit::new();
        let t1 = Trigger::builder()
            .input("a")
            .build(&circuit, |_: &InputValues| Ok(()))
            .unwrap();
        let t2 = Trigger::builder()
            .input("a")
            .build(&circuit, |_: &InputValues| Ok(()))
            .unwrap();

        let mut set = TriggerSet::new();
        set.insert(t1.clone());
        set.insert(t2.clone());
        set.insert(t1.clone());

        let mut other = TriggerSet::new();
        other.insert(t2);
        other.insert(t1);
        set.extend(other);
        assert_eq!(set.len(), 2);
    }
}
