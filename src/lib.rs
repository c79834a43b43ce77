//! # KyroCircuit - Reactive Automation Runtime
//!
//! KyroCircuit runs a circuit of reactive units under supervision. Blocks
//! receive events and hold an output, formulas compute their output from
//! other units, and triggers run side effects when watched outputs change.
//! The circuit owns them all, drives their lifecycle and supervises the
//! async jobs they need.
//!
//! ## Core Concepts
//!
//! - **Block**: a named stateful unit accepting events, with one output
//! - **Formula**: a named unit whose output is a function of other outputs
//! - **Trigger**: an anonymous observer running a function on changes
//! - **Circuit**: the owner of all units, their lifecycle and the services
//!
//! ## Usage
//!
//! ```rust,no_run
//! use kyrocircuit::blocklib::Memory;
//! use kyrocircuit::{Block, Circuit, EventData, Formula, Trigger, Value};
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let circuit = Circuit::new();
//! let temp = Block::builder("temp").initial_value(20).build(&circuit, Memory)?;
//! Formula::builder("too_hot")
//!     .input("temp")
//!     .build(&circuit, |v| Ok(Value::Bool(v.at(0).and_then(Value::as_int) > Some(25))))?;
//! Trigger::builder()
//!     .input("too_hot")
//!     .build(&circuit, |v| {
//!         println!("too hot: {}", v.values()[0]);
//!         Ok(())
//!     })?;
//!
//! temp.event("store", EventData::from_value(30))?;
//! circuit.run([]).await?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod blocklib;
pub mod circuit;
pub mod error;
pub mod init;
pub mod storage;
pub mod unit;
pub mod value;

// Re-export primary types at crate root for convenience
pub use circuit::{shield, Circuit, CircuitConfig, CircuitPhase, Job, ServiceHandle, Shielded};
pub use error::{AggregateError, CircuitError, CircuitResult, ErrorId, ErrorKind};
pub use init::{
    CheckpointMode, InitFunction, InitTask, InitValue, InitWait, Initializer, RestoreState,
};
pub use storage::{InMemoryStateStore, StateStore, StorageError, StoredState};
pub use unit::{
    Block, BlockBuilder, BlockLogic, EventData, Formula, FormulaBuilder, Handler, HandlerTable,
    InputValues, PersistenceMode, Trigger, TriggerBuilder, TriggerId, Unit, UnitRef, Validator,
};
pub use value::{Output, Value};

#[cfg(feature = "persistent")]
pub use storage::{open_store, FileStateStore, PersistentConfig};
