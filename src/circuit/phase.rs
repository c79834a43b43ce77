//! Circuit lifecycle phases.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::CircuitResult;
use crate::unit::{Block, BlockLogic};
use crate::value::Value;

/// Lifecycle phase of a circuit.
///
/// Phases only move forward; a phase that was left is never entered again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitPhase {
    /// Being built, the runner has not started.
    UnderConstruction,
    /// The runner initializes itself and pre-initializes units.
    InitCircuit,
    /// Blocks are being initialized, formulas and triggers started.
    InitUnits,
    /// Normal operation.
    Running,
    /// Shutdown in progress.
    ShuttingDown,
    /// The runner has exited.
    Closed,
}

impl CircuitPhase {
    /// Returns the phase name, as reported by the `_phase` unit.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::UnderConstruction => "under_construction",
            Self::InitCircuit => "init_circuit",
            Self::InitUnits => "init_units",
            Self::Running => "running",
            Self::ShuttingDown => "shutting_down",
            Self::Closed => "closed",
        }
    }

    /// Returns true while new units may be registered.
    #[must_use]
    pub const fn allows_units(self) -> bool {
        matches!(self, Self::UnderConstruction | Self::InitCircuit)
    }

    /// Returns true once shutdown has begun.
    #[must_use]
    pub const fn is_shut_down(self) -> bool {
        matches!(self, Self::ShuttingDown | Self::Closed)
    }
}

impl fmt::Display for CircuitPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Logic of the reserved `_phase` block: its output is the current phase name.
pub(crate) struct PhaseMonitor;

impl BlockLogic for PhaseMonitor {
    const TYPE_NAME: &'static str = "PhaseMonitor";

    fn init_default(&self, block: &Block) -> CircuitResult<()> {
        let phase = block
            .circuit()
            .map_or(CircuitPhase::Closed, |circuit| circuit.phase());
        block.set_output(Value::from(phase.name()))?;
        Ok(())
    }
}
