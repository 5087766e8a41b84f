use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ReferenceError {
    #[error("reference is empty")]
    Empty,

    #[error("invalid registry host: {0}")]
    InvalidRegistry(String),

    #[error("invalid repository: {0}")]
    InvalidRepository(String),

    #[error("invalid tag: {0}")]
    InvalidTag(String),
}

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("error reading tar header: {0}")]
    ReadHeader(#[source] std::io::Error),

    #[error("error reading image-digests: {0}")]
    ReadDigests(#[source] std::io::Error),

    #[error("failed to parse tagged reference {reference}: {source}")]
    InvalidReference {
        reference: String,
        #[source]
        source: ReferenceError,
    },

    #[error("failed to find image-digests file")]
    DigestsNotFound,
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Repository not found: {0}")]
    NotFound(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("No image for platform {0}")]
    UnsupportedPlatform(String),

    #[error("Failed to export image filesystem: {0}")]
    Export(#[source] std::io::Error),

    #[error("Image content handler failed: {0}")]
    Handler(#[from] ExtractError),
}

#[derive(Debug, Error)]
pub enum RefreshError {
    #[error("refresh timed out after {0:?}")]
    Timeout(Duration),

    #[error("failed to list release versions: {0}")]
    ListTags(#[source] RegistryError),

    #[error("failed to fetch extensions for {tag}: {source}")]
    PullExtensions {
        tag: String,
        #[source]
        source: RegistryError,
    },
}
