//! Capabilities the catalog needs from a container image registry

use std::fmt;
use std::io::Read;
use std::sync::Arc;

#[cfg(test)]
use mockall::automock;
use serde::Deserialize;

use crate::catalog::error::{ExtractError, RegistryError};

/// Target architecture of a pulled image
///
/// Release versions and extension lists are assumed to be the same for every
/// architecture, so a single reference architecture is enough for lookups.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Arch {
    #[default]
    Amd64,
    Arm64,
}

impl Arch {
    pub fn as_str(&self) -> &'static str {
        match self {
            Arch::Amd64 => "amd64",
            Arch::Arm64 => "arm64",
        }
    }
}

impl fmt::Display for Arch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Trait for listing the tags published in a repository
///
/// Tags are shared by every architecture of a multi-arch image, so listing
/// takes no [`Arch`].
#[cfg_attr(test, automock)]
#[async_trait::async_trait]
pub trait TagLister: Send + Sync {
    /// Lists all tags of a repository
    ///
    /// # Arguments
    /// * `repository` - Repository path within the registry (e.g., "siderolabs/imager")
    ///
    /// # Returns
    /// * `Ok(Vec<String>)` - Tags in registry order
    /// * `Err(RegistryError)` - If the listing fails
    async fn list_tags(&self, repository: &str) -> Result<Vec<String>, RegistryError>;
}

/// Consumer of an exported image filesystem
///
/// Implementations do blocking I/O; pullers call them off the async runtime.
pub trait ExportHandler: Send + Sync {
    /// Reads the exported filesystem, given as a tar stream
    fn handle(&self, export: &mut dyn Read) -> Result<(), ExtractError>;
}

/// Trait for pulling an image and exposing its filesystem
#[async_trait::async_trait]
pub trait ImagePuller: Send + Sync {
    /// Pulls `repository:tag` for `arch` and runs `handler` over its exported filesystem
    ///
    /// Handler failures are returned as `RegistryError::Handler`. If the returned
    /// future is dropped while the handler runs, the handler may still finish
    /// in the background.
    async fn pull_image(
        &self,
        repository: &str,
        tag: &str,
        arch: Arch,
        handler: Arc<dyn ExportHandler>,
    ) -> Result<(), RegistryError>;
}
