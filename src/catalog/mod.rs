//! Release catalog layer
//!
//! This module provides the core functionality for discovering published release
//! versions and the extension images associated with each release, and for keeping
//! both in memory.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────┐     ┌─────────────┐     ┌─────────────┐
//! │  TagLister  │────▶│   Semver    │────▶│             │
//! │ (list tags) │     │  (filter)   │     │   Catalog   │
//! └─────────────┘     └─────────────┘     │   (store)   │
//! ┌─────────────┐     ┌─────────────┐     │             │
//! │ ImagePuller │────▶│   Digests   │────▶│             │
//! │   (pull)    │     │  (extract)  │     └─────────────┘
//! └─────────────┘     └─────────────┘
//! ```
//!
//! # Modules
//!
//! - [`store`]: In-memory catalog with snapshot reads
//! - [`semver`]: Tolerant version parsing and the release admission policy
//! - [`digests`]: Streaming extraction of the `image-digests` extension list
//! - [`reference`]: Tagged image references and extension refs
//! - [`registry`]: Capability traits for listing tags and pulling images
//! - [`registries`]: OCI distribution API implementation of those traits
//! - [`error`]: Error types for extraction, registry and refresh operations

pub mod digests;
pub mod error;
pub mod reference;
pub mod registries;
pub mod registry;
pub mod semver;
pub mod store;
