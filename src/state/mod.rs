//! Durable application registry.
//!
//! One JSON file (`<root>/registry.json`) holds a record per application.
//! The store is the only writer; everyone else reads a copy and writes back
//! through [`StateStore::update`].

mod reconcile;
mod store;
mod types;

pub use reconcile::{reconcile, FilesystemScan, ReconcileReport};
pub use store::StateStore;
pub use types::{AppRecord, InstallState, ProcessHandle, Registry, RunState, REGISTRY_VERSION};
