//! State storage for block persistence.
//!
//! The circuit writes exported block states to a `StateStore` at
//! checkpoints and reads them back through the `RestoreState` initializer.

mod memory;
mod traits;

/// Durable file-backed store.
#[cfg(feature = "persistent")]
pub mod persistent;

pub use memory::InMemoryStateStore;
pub use traits::{StateStore, StorageError, StoredState};

#[cfg(feature = "persistent")]
pub use persistent::{open_store, FileStateStore, LockOwner, PersistentConfig};
