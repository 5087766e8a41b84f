//! Refresh orchestration between the registry and the catalog
//!
//! # Modules
//!
//! - [`refresh`]: Bounded version and extension refreshes committed to the catalog

pub mod refresh;

pub use refresh::{ExtensionListHandler, SyncSettings, Synchronizer};
