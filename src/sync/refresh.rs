//! On-demand refresh of the release catalog
//!
//! Each refresh is a single bounded attempt: the registry call runs under
//! `fetch_timeout` and is dropped when the budget runs out. The catalog is only
//! written after a refresh fully succeeds, so a failed refresh leaves the last
//! good data in place.

use std::io::Read;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::Utc;
use futures::future::join_all;
use semver::Version;
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info};

use crate::catalog::digests::extract_extension_list;
use crate::catalog::error::{ExtractError, RefreshError, RegistryError};
use crate::catalog::reference::ExtensionRef;
use crate::catalog::registry::{Arch, ExportHandler, ImagePuller, TagLister};
use crate::catalog::store::{Catalog, VersionSnapshot};
use crate::config::{CatalogConfig, ConfigError, FETCH_STAGGER_DELAY_MS};

/// Settings of a [`Synchronizer`], resolved from [`CatalogConfig`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncSettings {
    /// Repository whose tags are the release versions
    pub release_repository: String,
    /// Repository of the extension manifest images, tagged per release
    pub extensions_repository: String,
    pub min_version: Version,
    pub fetch_timeout: Duration,
}

impl SyncSettings {
    pub fn from_config(config: &CatalogConfig) -> Result<Self, ConfigError> {
        Ok(Self {
            release_repository: config.registry.release_repository.clone(),
            extensions_repository: config.registry.extensions_repository.clone(),
            min_version: config.min_version()?,
            fetch_timeout: config.fetch_timeout(),
        })
    }
}

/// Export handler running the extension list extraction
#[derive(Default)]
pub struct ExtensionListHandler {
    extensions: Mutex<Option<Vec<ExtensionRef>>>,
}

impl ExtensionListHandler {
    /// Extracted refs, or `None` if the handler has not completed
    pub fn take_extensions(&self) -> Option<Vec<ExtensionRef>> {
        self.extensions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }
}

impl ExportHandler for ExtensionListHandler {
    fn handle(&self, export: &mut dyn Read) -> Result<(), ExtractError> {
        let extensions = extract_extension_list(export)?;
        info!(count = extensions.len(), "Extracted the image digests");

        *self
            .extensions
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(extensions);
        Ok(())
    }
}

/// Keeps a [`Catalog`] in sync with the registry
///
/// The synchronizer has no schedule of its own; callers decide when to refresh.
/// Refreshes for different tags may run concurrently. Overlapping refreshes of
/// the same tag are not coalesced; the last one to finish wins.
pub struct Synchronizer {
    lister: Arc<dyn TagLister>,
    puller: Arc<dyn ImagePuller>,
    catalog: Arc<Catalog>,
    settings: SyncSettings,
}

impl Synchronizer {
    pub fn new(
        lister: Arc<dyn TagLister>,
        puller: Arc<dyn ImagePuller>,
        catalog: Arc<Catalog>,
        settings: SyncSettings,
    ) -> Self {
        Self {
            lister,
            puller,
            catalog,
            settings,
        }
    }

    pub fn catalog(&self) -> &Arc<Catalog> {
        &self.catalog
    }

    /// Current versions snapshot
    pub fn versions(&self) -> Arc<VersionSnapshot> {
        self.catalog.versions()
    }

    /// Cached extensions of a release tag, `None` if never fetched
    pub fn extensions(&self, tag: &str) -> Option<Arc<[ExtensionRef]>> {
        self.catalog.extensions(tag)
    }

    /// Fetch the published release versions and replace the cached list
    ///
    /// Takes no [`Arch`]: a release tag names one multi-arch image, so the tag
    /// list is the same for every architecture.
    ///
    /// Returns the number of accepted versions.
    pub async fn refresh_versions(&self) -> Result<usize, RefreshError> {
        let repository = &self.settings.release_repository;
        info!(%repository, "Fetching available release versions");

        let tags = timeout(self.settings.fetch_timeout, self.lister.list_tags(repository))
            .await
            .map_err(|_| RefreshError::Timeout(self.settings.fetch_timeout))?
            .map_err(RefreshError::ListTags)?;

        let versions = crate::catalog::semver::filter_versions(&tags, &self.settings.min_version);
        let count = versions.len();
        debug!(
            "Accepted {} of {} tags from {}",
            count,
            tags.len(),
            repository
        );

        self.catalog.replace_versions(versions, Utc::now());
        info!(count, "Refreshed release versions");

        Ok(count)
    }

    /// Fetch the official extensions of a release tag and replace its cached list
    ///
    /// On timeout the export may still be running on the blocking pool; its
    /// result is discarded and never committed.
    ///
    /// Returns the number of extensions.
    pub async fn refresh_extensions(&self, tag: &str, arch: Arch) -> Result<usize, RefreshError> {
        let repository = &self.settings.extensions_repository;
        info!(%repository, tag, %arch, "Fetching official extensions");

        let handler = Arc::new(ExtensionListHandler::default());
        let pull = self.puller.pull_image(repository, tag, arch, handler.clone());

        timeout(self.settings.fetch_timeout, pull)
            .await
            .map_err(|_| RefreshError::Timeout(self.settings.fetch_timeout))?
            .map_err(|source| RefreshError::PullExtensions {
                tag: tag.to_string(),
                source,
            })?;

        let extensions =
            handler
                .take_extensions()
                .ok_or_else(|| RefreshError::PullExtensions {
                    tag: tag.to_string(),
                    source: RegistryError::Handler(ExtractError::DigestsNotFound),
                })?;

        let count = extensions.len();
        self.catalog.replace_extensions(tag, extensions);
        info!(tag, count, "Refreshed official extensions");

        Ok(count)
    }

    /// Refresh the extensions of several release tags
    ///
    /// Refreshes run in parallel with staggered start times to avoid rate limiting.
    /// A failing tag does not affect the others; each tag gets its own result.
    pub async fn refresh_all_extensions(
        &self,
        tags: &[String],
        arch: Arch,
    ) -> Vec<(String, Result<usize, RefreshError>)> {
        let futures = tags.iter().enumerate().map(|(i, tag)| {
            let delay = Duration::from_millis(FETCH_STAGGER_DELAY_MS * i as u64);
            async move {
                sleep(delay).await;
                let result = self
                    .refresh_extensions(tag, arch)
                    .await
                    .inspect_err(|e| error!("Failed to refresh extensions for {}: {}", tag, e));
                (tag.clone(), result)
            }
        });

        join_all(futures).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::registry::MockTagLister;
    use std::collections::HashMap;

    fn v(s: &str) -> Version {
        Version::parse(s).unwrap()
    }

    fn settings() -> SyncSettings {
        SyncSettings {
            release_repository: "siderolabs/imager".to_string(),
            extensions_repository: "siderolabs/extensions".to_string(),
            min_version: v("1.0.0"),
            fetch_timeout: Duration::from_secs(5),
        }
    }

    fn digests_archive(content: &str) -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());
        let mut header = tar::Header::new_gnu();
        header.set_size(content.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder
            .append_data(&mut header, "image-digests", content.as_bytes())
            .unwrap();
        builder.into_inner().unwrap()
    }

    /// Puller serving pre-built exports by tag
    #[derive(Default)]
    struct StaticPuller {
        exports: HashMap<String, Vec<u8>>,
    }

    impl StaticPuller {
        fn with_export(mut self, tag: &str, export: Vec<u8>) -> Self {
            self.exports.insert(tag.to_string(), export);
            self
        }
    }

    #[async_trait::async_trait]
    impl ImagePuller for StaticPuller {
        async fn pull_image(
            &self,
            _repository: &str,
            tag: &str,
            _arch: Arch,
            handler: Arc<dyn ExportHandler>,
        ) -> Result<(), RegistryError> {
            let export = self
                .exports
                .get(tag)
                .ok_or_else(|| RegistryError::NotFound(tag.to_string()))?;
            handler.handle(&mut export.as_slice())?;
            Ok(())
        }
    }

    /// Puller that reports success without ever invoking the handler
    struct SilentPuller;

    #[async_trait::async_trait]
    impl ImagePuller for SilentPuller {
        async fn pull_image(
            &self,
            _repository: &str,
            _tag: &str,
            _arch: Arch,
            _handler: Arc<dyn ExportHandler>,
        ) -> Result<(), RegistryError> {
            Ok(())
        }
    }

    /// Puller exporting on the blocking pool after a delay, like a slow image
    struct BlockingPuller {
        export: Vec<u8>,
        delay: Duration,
    }

    #[async_trait::async_trait]
    impl ImagePuller for BlockingPuller {
        async fn pull_image(
            &self,
            _repository: &str,
            _tag: &str,
            _arch: Arch,
            handler: Arc<dyn ExportHandler>,
        ) -> Result<(), RegistryError> {
            let export = self.export.clone();
            let delay = self.delay;
            tokio::task::spawn_blocking(move || {
                std::thread::sleep(delay);
                handler.handle(&mut export.as_slice())
            })
            .await
            .unwrap()?;
            Ok(())
        }
    }

    fn synchronizer(lister: MockTagLister, puller: impl ImagePuller + 'static) -> Synchronizer {
        Synchronizer::new(
            Arc::new(lister),
            Arc::new(puller),
            Arc::new(Catalog::new()),
            settings(),
        )
    }

    #[tokio::test]
    async fn refresh_versions_filters_tags_and_saves_to_catalog() {
        let mut lister = MockTagLister::new();
        lister
            .expect_list_tags()
            .withf(|repository| repository == "siderolabs/imager")
            .times(1)
            .returning(|_| {
                Ok(vec![
                    "v1.5.0".to_string(),
                    "v1.4.0-beta.2".to_string(),
                    "v1.3.0-rc.1".to_string(),
                    "0.9.0".to_string(),
                    "not-a-version".to_string(),
                ])
            });

        let sync = synchronizer(lister, StaticPuller::default());
        let count = sync.refresh_versions().await.unwrap();

        let snapshot = sync.versions();
        assert_eq!(count, 2);
        assert_eq!(snapshot.versions, vec![v("1.4.0-beta.2"), v("1.5.0")]);
        assert!(snapshot.refreshed_at.is_some());
    }

    #[tokio::test]
    async fn refresh_versions_keeps_previous_list_on_registry_error() {
        let mut lister = MockTagLister::new();
        let mut calls = 0;
        lister.expect_list_tags().times(2).returning(move |_| {
            calls += 1;
            if calls == 1 {
                Ok(vec!["v1.5.0".to_string()])
            } else {
                Err(RegistryError::InvalidResponse("Unexpected status: 500".to_string()))
            }
        });

        let sync = synchronizer(lister, StaticPuller::default());
        sync.refresh_versions().await.unwrap();
        let before = sync.versions();

        let result = sync.refresh_versions().await;

        assert!(matches!(result, Err(RefreshError::ListTags(_))));
        assert_eq!(sync.versions(), before);
    }

    #[tokio::test]
    async fn refresh_versions_accepts_empty_tag_list() {
        let mut lister = MockTagLister::new();
        lister.expect_list_tags().returning(|_| Ok(vec![]));

        let sync = synchronizer(lister, StaticPuller::default());
        let count = sync.refresh_versions().await.unwrap();

        assert_eq!(count, 0);
        assert!(sync.versions().refreshed_at.is_some());
    }

    #[tokio::test]
    async fn refresh_extensions_saves_extracted_refs() {
        let mut lister = MockTagLister::new();
        lister.expect_list_tags().times(0);
        let puller = StaticPuller::default().with_export(
            "v1.6.0",
            digests_archive("reg.example/ext1:v1@sha256:aaa\n\nreg.example/ext2:v1@sha256:bbb\n"),
        );

        let sync = synchronizer(lister, puller);
        let count = sync.refresh_extensions("v1.6.0", Arch::Amd64).await.unwrap();

        let cached = sync.extensions("v1.6.0").unwrap();
        assert_eq!(count, 2);
        assert_eq!(cached[0].to_string(), "reg.example/ext1:v1@sha256:aaa");
        assert_eq!(cached[1].to_string(), "reg.example/ext2:v1@sha256:bbb");
    }

    #[tokio::test]
    async fn refresh_extensions_keeps_previous_entry_on_structural_error() {
        let puller = StaticPuller::default()
            .with_export("v1.6.0", digests_archive("reg.example/ext1:v1@sha256:aaa\n"))
            .with_export("broken", digests_archive("not a valid ref@sha256:aaa\n"));
        let sync = synchronizer(MockTagLister::new(), puller);
        sync.catalog().replace_extensions(
            "broken",
            vec![ExtensionRef {
                tagged_reference: "reg.example/old:v1".parse().unwrap(),
                digest: "sha256:old".to_string(),
            }],
        );
        sync.refresh_extensions("v1.6.0", Arch::Amd64).await.unwrap();

        let result = sync.refresh_extensions("broken", Arch::Amd64).await;

        assert!(matches!(
            result,
            Err(RefreshError::PullExtensions {
                source: RegistryError::Handler(ExtractError::InvalidReference { .. }),
                ..
            })
        ));
        assert_eq!(sync.extensions("broken").unwrap()[0].digest, "sha256:old");
        assert_eq!(sync.extensions("v1.6.0").unwrap().len(), 1);
    }

    #[tokio::test]
    async fn refresh_extensions_returns_error_when_pull_fails() {
        let sync = synchronizer(MockTagLister::new(), StaticPuller::default());

        let result = sync.refresh_extensions("v9.9.9", Arch::Amd64).await;

        assert!(matches!(
            result,
            Err(RefreshError::PullExtensions { ref tag, source: RegistryError::NotFound(_) }) if tag == "v9.9.9"
        ));
        assert!(sync.extensions("v9.9.9").is_none());
    }

    #[tokio::test]
    async fn refresh_extensions_fails_when_handler_never_ran() {
        let sync = synchronizer(MockTagLister::new(), SilentPuller);

        let result = sync.refresh_extensions("v1.6.0", Arch::Amd64).await;

        assert!(matches!(
            result,
            Err(RefreshError::PullExtensions {
                source: RegistryError::Handler(ExtractError::DigestsNotFound),
                ..
            })
        ));
        assert!(sync.extensions("v1.6.0").is_none());
    }

    #[tokio::test]
    async fn refresh_extensions_discards_export_finishing_after_timeout() {
        let puller = BlockingPuller {
            export: digests_archive("reg.example/ext1:v1@sha256:aaa\n"),
            delay: Duration::from_millis(300),
        };
        let sync = Synchronizer::new(
            Arc::new(MockTagLister::new()),
            Arc::new(puller),
            Arc::new(Catalog::new()),
            SyncSettings {
                fetch_timeout: Duration::from_millis(50),
                ..settings()
            },
        );

        let result = sync.refresh_extensions("v1.6.0", Arch::Amd64).await;
        assert!(matches!(result, Err(RefreshError::Timeout(_))));

        // Let the blocking export run to completion
        tokio::time::sleep(Duration::from_millis(500)).await;

        assert!(sync.extensions("v1.6.0").is_none());
    }

    #[tokio::test]
    async fn refresh_extensions_commits_export_from_blocking_pool() {
        let puller = BlockingPuller {
            export: digests_archive("reg.example/ext1:v1@sha256:aaa\n"),
            delay: Duration::from_millis(10),
        };
        let sync = synchronizer(MockTagLister::new(), puller);

        let count = sync.refresh_extensions("v1.6.0", Arch::Amd64).await.unwrap();

        assert_eq!(count, 1);
        assert_eq!(sync.extensions("v1.6.0").unwrap()[0].digest, "sha256:aaa");
    }

    #[tokio::test]
    async fn refresh_all_extensions_continues_on_error() {
        let puller = StaticPuller::default()
            .with_export("v1.5.0", digests_archive("reg.example/ext1:v1@sha256:aaa\n"))
            .with_export("v1.6.0", digests_archive("reg.example/ext1:v2@sha256:bbb\n"));
        let sync = synchronizer(MockTagLister::new(), puller);
        let tags = vec![
            "v1.5.0".to_string(),
            "missing".to_string(),
            "v1.6.0".to_string(),
        ];

        let results = sync.refresh_all_extensions(&tags, Arch::Amd64).await;

        let outcome: Vec<(&str, bool)> = results
            .iter()
            .map(|(tag, result)| (tag.as_str(), result.is_ok()))
            .collect();
        assert_eq!(
            outcome,
            vec![("v1.5.0", true), ("missing", false), ("v1.6.0", true)]
        );
        assert_eq!(sync.catalog().extension_tags(), vec!["v1.5.0", "v1.6.0"]);
    }

    #[test]
    fn sync_settings_from_config_parses_min_version() {
        let config = CatalogConfig {
            min_version: "v1.4".to_string(),
            ..CatalogConfig::default()
        };

        let settings = SyncSettings::from_config(&config).unwrap();

        assert_eq!(settings.min_version, v("1.4.0"));
        assert_eq!(settings.release_repository, "siderolabs/imager");
        assert_eq!(settings.extensions_repository, "siderolabs/extensions");
    }
}
