//! OCI distribution API registry implementation

use std::collections::HashMap;
use std::io::{Cursor, Read};
use std::sync::{Arc, LazyLock, Mutex, PoisonError};

use flate2::read::GzDecoder;
use regex::Regex;
use reqwest::header::{ACCEPT, HeaderMap, LINK, WWW_AUTHENTICATE};
use reqwest::{StatusCode, Url};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::catalog::error::RegistryError;
use crate::catalog::registries::export::flatten_layers;
use crate::catalog::registry::{Arch, ExportHandler, ImagePuller, TagLister};

/// Manifest media types accepted when resolving a tag
const MANIFEST_ACCEPT: &str = "application/vnd.oci.image.index.v1+json, \
    application/vnd.docker.distribution.manifest.list.v2+json, \
    application/vnd.oci.image.manifest.v1+json, \
    application/vnd.docker.distribution.manifest.v2+json";

/// `key="value"` pairs of a `WWW-Authenticate: Bearer ...` challenge
static CHALLENGE_PARAM_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(\w+)="([^"]*)""#).unwrap());

static NEXT_LINK_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"<([^>]+)>\s*;\s*rel="?next"?"#).unwrap());

/// Response from the tags list endpoint
#[derive(Debug, Deserialize)]
struct TagList {
    tags: Option<Vec<String>>,
}

/// Image manifest or image index; only the fields needed for pulling
#[derive(Debug, Deserialize)]
struct Manifest {
    #[serde(default)]
    manifests: Option<Vec<Descriptor>>,
    #[serde(default)]
    layers: Vec<Descriptor>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Descriptor {
    media_type: String,
    digest: String,
    platform: Option<Platform>,
}

#[derive(Debug, Deserialize)]
struct Platform {
    os: String,
    architecture: String,
}

/// Response from a token endpoint
#[derive(Debug, Deserialize)]
struct TokenResponse {
    token: Option<String>,
    access_token: Option<String>,
}

/// Registry implementation for the OCI distribution API
///
/// Public repositories only: bearer tokens are obtained anonymously when the
/// registry asks for them, and cached per repository.
pub struct OciRegistry {
    client: reqwest::Client,
    base_url: String,
    tokens: Mutex<HashMap<String, String>>,
}

impl OciRegistry {
    /// Creates a new OciRegistry with a custom base URL
    pub fn new(base_url: &str) -> Self {
        Self {
            client: reqwest::Client::builder()
                .user_agent("release-catalog")
                .build()
                .expect("Failed to create HTTP client"),
            base_url: base_url.trim_end_matches('/').to_string(),
            tokens: Mutex::new(HashMap::new()),
        }
    }

    fn cached_token(&self, repository: &str) -> Option<String> {
        self.tokens
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(repository)
            .cloned()
    }

    async fn send(
        &self,
        repository: &str,
        url: &str,
        accept: Option<&str>,
    ) -> Result<reqwest::Response, RegistryError> {
        let mut request = self.client.get(url);
        if let Some(accept) = accept {
            request = request.header(ACCEPT, accept);
        }
        if let Some(token) = self.cached_token(repository) {
            request = request.bearer_auth(token);
        }
        Ok(request.send().await?)
    }

    /// GET with one retry after answering a bearer challenge
    async fn get(
        &self,
        repository: &str,
        url: &str,
        accept: Option<&str>,
    ) -> Result<reqwest::Response, RegistryError> {
        let response = self.send(repository, url, accept).await?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }

        let challenge = response
            .headers()
            .get(WWW_AUTHENTICATE)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| RegistryError::Unauthorized(url.to_string()))?
            .to_string();

        let token = self.fetch_token(&challenge, repository).await?;
        self.tokens
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(repository.to_string(), token);

        let response = self.send(repository, url, accept).await?;
        if response.status() == StatusCode::UNAUTHORIZED {
            return Err(RegistryError::Unauthorized(url.to_string()));
        }
        Ok(response)
    }

    async fn fetch_token(&self, challenge: &str, repository: &str) -> Result<String, RegistryError> {
        let Some(params) = challenge
            .strip_prefix("Bearer ")
            .or_else(|| challenge.strip_prefix("bearer "))
        else {
            return Err(RegistryError::Unauthorized(format!(
                "unsupported challenge: {}",
                challenge
            )));
        };

        let params: HashMap<&str, &str> = CHALLENGE_PARAM_RE
            .captures_iter(params)
            .filter_map(|c| Some((c.get(1)?.as_str(), c.get(2)?.as_str())))
            .collect();

        let realm = params
            .get("realm")
            .ok_or_else(|| RegistryError::Unauthorized("challenge without realm".to_string()))?;
        let default_scope = format!("repository:{}:pull", repository);
        let scope = params.get("scope").copied().unwrap_or(&default_scope);

        let mut query = vec![("scope", scope)];
        if let Some(service) = params.get("service") {
            query.push(("service", *service));
        }
        let token_url = Url::parse_with_params(realm, &query)
            .map_err(|e| RegistryError::InvalidResponse(format!("invalid token realm: {}", e)))?;

        debug!("Requesting registry token for {}", repository);
        let response = self.client.get(token_url).send().await?;
        if !response.status().is_success() {
            return Err(RegistryError::Unauthorized(format!(
                "token endpoint returned {}",
                response.status()
            )));
        }

        let body: TokenResponse = response
            .json()
            .await
            .map_err(|e| RegistryError::InvalidResponse(e.to_string()))?;

        body.token
            .or(body.access_token)
            .ok_or_else(|| RegistryError::InvalidResponse("token response without token".to_string()))
    }

    /// Resolve the `rel="next"` pagination link against the registry base URL
    fn next_page(&self, headers: &HeaderMap) -> Result<Option<String>, RegistryError> {
        let Some(link) = headers.get(LINK).and_then(|v| v.to_str().ok()) else {
            return Ok(None);
        };
        let Some(target) = NEXT_LINK_RE.captures(link).and_then(|c| c.get(1)) else {
            return Ok(None);
        };

        Url::parse(&self.base_url)
            .and_then(|base| base.join(target.as_str()))
            .map(|url| Some(url.to_string()))
            .map_err(|e| RegistryError::InvalidResponse(format!("invalid pagination link: {}", e)))
    }

    async fn fetch_manifest(
        &self,
        repository: &str,
        reference: &str,
    ) -> Result<Manifest, RegistryError> {
        let url = format!("{}/v2/{}/manifests/{}", self.base_url, repository, reference);
        let response = self.get(repository, &url, Some(MANIFEST_ACCEPT)).await?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(RegistryError::NotFound(format!("{}:{}", repository, reference)));
        }
        if !status.is_success() {
            warn!("Registry returned status {}: {}", status, url);
            return Err(RegistryError::InvalidResponse(format!(
                "Unexpected status: {}",
                status
            )));
        }

        response
            .json()
            .await
            .map_err(|e| RegistryError::InvalidResponse(e.to_string()))
    }

    /// Download a layer blob and return it as an uncompressed tar stream
    async fn fetch_layer(
        &self,
        repository: &str,
        layer: &Descriptor,
    ) -> Result<Box<dyn Read + Send>, RegistryError> {
        let url = format!("{}/v2/{}/blobs/{}", self.base_url, repository, layer.digest);
        let response = self.get(repository, &url, None).await?;

        let status = response.status();
        if !status.is_success() {
            warn!("Registry returned status {}: {}", status, url);
            return Err(RegistryError::InvalidResponse(format!(
                "Unexpected status for layer {}: {}",
                layer.digest, status
            )));
        }

        let bytes = Cursor::new(response.bytes().await?);
        if layer.media_type.ends_with("gzip") {
            Ok(Box::new(GzDecoder::new(bytes)))
        } else if layer.media_type.ends_with("tar") {
            Ok(Box::new(bytes))
        } else {
            Err(RegistryError::InvalidResponse(format!(
                "Unsupported layer media type: {}",
                layer.media_type
            )))
        }
    }
}

#[async_trait::async_trait]
impl TagLister for OciRegistry {
    async fn list_tags(&self, repository: &str) -> Result<Vec<String>, RegistryError> {
        let mut tags = Vec::new();
        let mut next = Some(format!("{}/v2/{}/tags/list", self.base_url, repository));

        while let Some(url) = next {
            let response = self.get(repository, &url, None).await?;

            let status = response.status();
            if status == StatusCode::NOT_FOUND {
                return Err(RegistryError::NotFound(repository.to_string()));
            }
            if !status.is_success() {
                warn!("Registry returned status {}: {}", status, url);
                return Err(RegistryError::InvalidResponse(format!(
                    "Unexpected status: {}",
                    status
                )));
            }

            next = self.next_page(response.headers())?;

            let page: TagList = response.json().await.map_err(|e| {
                warn!("Failed to parse tags list response: {}", e);
                RegistryError::InvalidResponse(e.to_string())
            })?;
            tags.extend(page.tags.unwrap_or_default());
        }

        Ok(tags)
    }
}

#[async_trait::async_trait]
impl ImagePuller for OciRegistry {
    async fn pull_image(
        &self,
        repository: &str,
        tag: &str,
        arch: Arch,
        handler: Arc<dyn ExportHandler>,
    ) -> Result<(), RegistryError> {
        let mut manifest = self.fetch_manifest(repository, tag).await?;

        if let Some(manifests) = manifest.manifests.take() {
            let descriptor = manifests
                .iter()
                .find(|m| {
                    m.platform
                        .as_ref()
                        .is_some_and(|p| p.os == "linux" && p.architecture == arch.as_str())
                })
                .ok_or_else(|| RegistryError::UnsupportedPlatform(format!("linux/{}", arch)))?;

            debug!(
                "Resolved {}:{} for linux/{} to {}",
                repository, tag, arch, descriptor.digest
            );
            manifest = self.fetch_manifest(repository, &descriptor.digest).await?;
        }

        let mut layers = Vec::with_capacity(manifest.layers.len());
        for layer in &manifest.layers {
            layers.push(self.fetch_layer(repository, layer).await?);
        }

        let image = format!("{}:{}", repository, tag);
        tokio::task::spawn_blocking(move || -> Result<(), RegistryError> {
            let export = flatten_layers(layers).map_err(RegistryError::Export)?;
            debug!("Exported {} filesystem ({} bytes)", image, export.len());

            handler.handle(&mut Cursor::new(export))?;
            Ok(())
        })
        .await
        .map_err(|e| RegistryError::Export(std::io::Error::other(e)))?
    }
}
