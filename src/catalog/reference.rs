//! Tagged image references and the extension refs built from them

use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;

use crate::catalog::error::ReferenceError;

/// Registry implied by references without an explicit host
pub const DEFAULT_REGISTRY: &str = "index.docker.io";

/// Tag implied by references without an explicit tag
pub const DEFAULT_TAG: &str = "latest";

/// Registry host with optional port: `ghcr.io`, `localhost:5000`
static REGISTRY_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9](?:[A-Za-z0-9.-]*[A-Za-z0-9])?(?::[0-9]+)?$").unwrap());

/// Single repository path component: `siderolabs`, `gvisor-debug`, `my_ext`
static COMPONENT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z0-9]+(?:(?:[._]|__|-+)[a-z0-9]+)*$").unwrap());

static TAG_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_.-]{1,128}$").unwrap());

const MAX_REPOSITORY_LEN: usize = 255;

/// Reference to a tagged image: `registry/repository:tag`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TaggedReference {
    registry: String,
    repository: String,
    tag: String,
}

impl TaggedReference {
    pub fn registry(&self) -> &str {
        &self.registry
    }

    pub fn repository(&self) -> &str {
        &self.repository
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }
}

impl FromStr for TaggedReference {
    type Err = ReferenceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(ReferenceError::Empty);
        }

        // The tag separator is the last ':' that is not part of a registry port;
        // an empty tag means the default one
        let (name, tag) = match s.rfind(':') {
            Some(idx) if !s[idx + 1..].contains('/') => (&s[..idx], &s[idx + 1..]),
            _ => (s, ""),
        };
        let tag = if tag.is_empty() { DEFAULT_TAG } else { tag };

        if !TAG_RE.is_match(tag) {
            return Err(ReferenceError::InvalidTag(tag.to_string()));
        }

        // Only a first component that looks like a host names the registry
        let (registry, repository) = match name.split_once('/') {
            Some((host, rest)) if host.contains('.') || host.contains(':') => {
                (host, rest.to_string())
            }
            _ => (DEFAULT_REGISTRY, name.to_string()),
        };

        if !REGISTRY_RE.is_match(registry) {
            return Err(ReferenceError::InvalidRegistry(registry.to_string()));
        }

        if repository.is_empty()
            || repository.len() > MAX_REPOSITORY_LEN
            || !repository.split('/').all(|c| COMPONENT_RE.is_match(c))
        {
            return Err(ReferenceError::InvalidRepository(repository));
        }

        // Official images on the default registry live under "library/"
        let repository = if registry == DEFAULT_REGISTRY && !repository.contains('/') {
            format!("library/{}", repository)
        } else {
            repository
        };

        Ok(Self {
            registry: registry.to_string(),
            repository,
            tag: tag.to_string(),
        })
    }
}

impl fmt::Display for TaggedReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}:{}", self.registry, self.repository, self.tag)
    }
}

/// An extension image officially associated with a release
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtensionRef {
    pub tagged_reference: TaggedReference,
    /// Content digest of the image, e.g. `sha256:<hex>`
    pub digest: String,
}

impl fmt::Display for ExtensionRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.tagged_reference, self.digest)
    }
}
