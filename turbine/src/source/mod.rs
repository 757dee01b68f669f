//! The source-fetcher interface consumed by the Builder pipeline, and a registry that
//! dispatches a [`crate::model::Source`] to the fetcher matching its `kind`: a concurrent map
//! keyed by a string identifier, built once at startup and looked up per request thereafter.

pub mod raw;

use crate::model::Source;
use async_trait::async_trait;
use dashmap::DashMap;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(thiserror::Error, Debug)]
pub enum SourceFetchError {
    #[error("no source fetcher registered for kind '{0}'")]
    UnknownKind(String),

    #[error("could not fetch source; {0}")]
    Fetch(String),

    #[error("fetched archive was malformed; {0}")]
    MalformedArchive(String),
}

/// Materializes a [`Source`] into a local directory. Implementations are selected by
/// `Source.kind`.
#[async_trait]
pub trait SourceFetcher: Send + Sync + std::fmt::Debug {
    async fn fetch(&self, source: &Source) -> Result<PathBuf, SourceFetchError>;
}

/// A registry of source fetchers keyed by the `kind` they handle.
#[derive(Default)]
pub struct SourceRegistry {
    fetchers: DashMap<String, Arc<dyn SourceFetcher>>,
}

impl SourceRegistry {
    pub fn new() -> Self {
        Self {
            fetchers: DashMap::new(),
        }
    }

    /// Registers `fetcher` to handle sources whose `kind` equals `name`. Registering the same
    /// name twice replaces the previous fetcher.
    pub fn register(&self, name: impl Into<String>, fetcher: Arc<dyn SourceFetcher>) {
        self.fetchers.insert(name.into(), fetcher);
    }

    pub async fn fetch(&self, source: &Source) -> Result<PathBuf, SourceFetchError> {
        let fetcher = self
            .fetchers
            .get(&source.kind)
            .ok_or_else(|| SourceFetchError::UnknownKind(source.kind.clone()))?
            .clone();

        fetcher.fetch(source).await
    }
}

/// Builds the registry this service ships with: today, just the `raw` tarball fetcher.
pub fn default_registry() -> SourceRegistry {
    let registry = SourceRegistry::new();
    registry.register("raw", Arc::new(raw::RawFetcher::new()));
    registry
}
