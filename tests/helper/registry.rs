//! Registry test utilities

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use semver::Version;

use release_catalog::catalog::error::RegistryError;
use release_catalog::catalog::registry::{Arch, ExportHandler, ImagePuller, TagLister};
use release_catalog::catalog::store::Catalog;
use release_catalog::sync::{SyncSettings, Synchronizer};

/// Sets a flag when dropped, to observe cancelled registry calls
struct DropFlag(Arc<AtomicBool>);

impl Drop for DropFlag {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

/// Tag lister replaying scripted responses
///
/// Once the script is exhausted the last response is repeated.
pub struct FakeLister {
    responses: Mutex<VecDeque<Vec<String>>>,
    last: Mutex<Option<Vec<String>>>,
    failure: Option<String>,
    delay: Duration,
    pub calls: AtomicUsize,
    pub completed: AtomicBool,
    pub dropped: Arc<AtomicBool>,
}

impl FakeLister {
    pub fn new() -> Self {
        Self {
            responses: Mutex::new(VecDeque::new()),
            last: Mutex::new(None),
            failure: None,
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
            completed: AtomicBool::new(false),
            dropped: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_tags(self, tags: Vec<&str>) -> Self {
        self.responses
            .lock()
            .unwrap()
            .push_back(tags.into_iter().map(|t| t.to_string()).collect());
        self
    }

    pub fn failing(mut self, message: &str) -> Self {
        self.failure = Some(message.to_string());
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

#[async_trait]
impl TagLister for FakeLister {
    async fn list_tags(&self, _repository: &str) -> Result<Vec<String>, RegistryError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let _guard = DropFlag(self.dropped.clone());

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.completed.store(true, Ordering::SeqCst);

        if let Some(message) = &self.failure {
            return Err(RegistryError::InvalidResponse(message.clone()));
        }

        let next = self.responses.lock().unwrap().pop_front();
        let mut last = self.last.lock().unwrap();
        if let Some(tags) = next {
            *last = Some(tags);
        }
        Ok(last.clone().unwrap_or_default())
    }
}

/// Image puller serving pre-built filesystem exports by tag
pub struct FakePuller {
    exports: HashMap<String, Vec<u8>>,
    delay: Duration,
}

impl FakePuller {
    pub fn new() -> Self {
        Self {
            exports: HashMap::new(),
            delay: Duration::ZERO,
        }
    }

    pub fn with_export(mut self, tag: &str, export: Vec<u8>) -> Self {
        self.exports.insert(tag.to_string(), export);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

#[async_trait]
impl ImagePuller for FakePuller {
    async fn pull_image(
        &self,
        _repository: &str,
        tag: &str,
        _arch: Arch,
        handler: Arc<dyn ExportHandler>,
    ) -> Result<(), RegistryError> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        let export = self
            .exports
            .get(tag)
            .ok_or_else(|| RegistryError::NotFound(tag.to_string()))?;
        handler.handle(&mut export.as_slice())?;
        Ok(())
    }
}

/// Build a filesystem export holding an `image-digests` file
pub fn digests_export(lines: &[&str]) -> Vec<u8> {
    let mut content = lines.join("\n");
    content.push('\n');

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

pub fn test_settings(fetch_timeout: Duration) -> SyncSettings {
    SyncSettings {
        release_repository: "siderolabs/imager".to_string(),
        extensions_repository: "siderolabs/extensions".to_string(),
        min_version: Version::new(1, 0, 0),
        fetch_timeout,
    }
}

/// Create a synchronizer over a fresh catalog
pub fn create_test_synchronizer(
    lister: Arc<FakeLister>,
    puller: Arc<FakePuller>,
    fetch_timeout: Duration,
) -> Synchronizer {
    Synchronizer::new(
        lister,
        puller,
        Arc::new(Catalog::new()),
        test_settings(fetch_timeout),
    )
}
