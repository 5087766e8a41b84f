//! In-memory catalog of release versions and their extensions
//!
//! Versions and extensions are guarded by separate locks, so a slow extension
//! refresh never holds up version readers. Every write swaps in a fully built
//! value; readers get an `Arc` to an immutable snapshot and never see a
//! partially applied update.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use semver::Version;
use tracing::debug;

use crate::catalog::reference::ExtensionRef;

/// Accepted release versions as of the last successful refresh
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VersionSnapshot {
    /// Sorted ascending, without duplicates
    pub versions: Vec<Version>,
    /// `None` until the first successful refresh
    pub refreshed_at: Option<DateTime<Utc>>,
}

impl VersionSnapshot {
    /// Newest accepted version, if any
    pub fn latest(&self) -> Option<&Version> {
        self.versions.last()
    }
}

/// Release versions and per-tag extension lists, shared between refreshes and readers
///
/// Writers swap in complete values only, so a poisoned lock still holds a
/// consistent value and is recovered instead of propagated.
#[derive(Debug, Default)]
pub struct Catalog {
    versions: RwLock<Arc<VersionSnapshot>>,
    extensions: RwLock<HashMap<String, Arc<[ExtensionRef]>>>,
}

impl Catalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the accepted versions and their refresh timestamp
    pub fn replace_versions(&self, versions: Vec<Version>, refreshed_at: DateTime<Utc>) {
        debug!("Replacing {} cached versions", versions.len());

        let snapshot = Arc::new(VersionSnapshot {
            versions,
            refreshed_at: Some(refreshed_at),
        });

        *self
            .versions
            .write()
            .unwrap_or_else(PoisonError::into_inner) = snapshot;
    }

    /// Current versions snapshot
    pub fn versions(&self) -> Arc<VersionSnapshot> {
        self.versions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Replace the whole extension list of a release tag
    ///
    /// Other tags are left as they are. A shorter list than the cached one
    /// still replaces it.
    pub fn replace_extensions(&self, tag: &str, extensions: Vec<ExtensionRef>) {
        debug!("Replacing {} cached extensions for {}", extensions.len(), tag);

        let extensions: Arc<[ExtensionRef]> = extensions.into();

        self.extensions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(tag.to_string(), extensions);
    }

    /// Extension list of a release tag, or `None` if it was never fetched
    pub fn extensions(&self, tag: &str) -> Option<Arc<[ExtensionRef]>> {
        self.extensions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(tag)
            .cloned()
    }

    /// Release tags with a cached extension list, sorted
    pub fn extension_tags(&self) -> Vec<String> {
        let mut tags: Vec<String> = self
            .extensions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        tags.sort();
        tags
    }
}
