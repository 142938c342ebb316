//! Persisted record of images already hosted for a release.
//!
//! One JSON document per release, mapping each tracker scope to the images
//! uploaded for it. The document is read and written whole; concurrent runs
//! against the same release must be serialized by the caller.

use crate::{sanitize_filename, ScreensError, TrackerScope, UploadedImageRecord};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

const CACHE_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedRecord {
    #[serde(flatten)]
    pub record: UploadedImageRecord,
    pub uploaded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CacheDocument {
    version: u32,
    #[serde(default)]
    scopes: BTreeMap<String, Vec<CachedRecord>>,
}

impl Default for CacheDocument {
    fn default() -> Self {
        Self {
            version: CACHE_VERSION,
            scopes: BTreeMap::new(),
        }
    }
}

pub struct ReuploadCache {
    path: PathBuf,
    document: CacheDocument,
}

impl ReuploadCache {
    /// Location of a release's document inside `cache_dir`.
    pub fn path_for(cache_dir: &Path, release_key: &str) -> PathBuf {
        cache_dir.join(format!("{}.json", sanitize_filename(release_key)))
    }

    /// Opens the release's document. A missing file is an empty cache and is
    /// only created on the first append.
    pub async fn open(cache_dir: &Path, release_key: &str) -> Result<Self, ScreensError> {
        let path = Self::path_for(cache_dir, release_key);
        let document = match tokio::fs::read_to_string(&path).await {
            Ok(content) => match serde_json::from_str::<CacheDocument>(&content) {
                Ok(document) => document,
                Err(e) => {
                    warn!(
                        "Ignoring unreadable re-upload cache {}: {}",
                        path.display(),
                        e
                    );
                    CacheDocument::default()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => CacheDocument::default(),
            Err(e) => {
                return Err(ScreensError::CacheError(format!(
                    "cannot read {}: {}",
                    path.display(),
                    e
                )))
            }
        };

        Ok(Self { path, document })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn lookup(&self, scope: &TrackerScope) -> Vec<UploadedImageRecord> {
        self.document
            .scopes
            .get(&scope.cache_key())
            .map(|entries| entries.iter().map(|e| e.record.clone()).collect())
            .unwrap_or_default()
    }

    pub fn entries(&self) -> impl Iterator<Item = (&str, &[CachedRecord])> {
        self.document
            .scopes
            .iter()
            .map(|(key, records)| (key.as_str(), records.as_slice()))
    }

    /// Appends records whose `raw_url` is new to the scope and persists the
    /// document. Returns how many were added.
    pub async fn append(
        &mut self,
        scope: &TrackerScope,
        records: &[UploadedImageRecord],
    ) -> Result<usize, ScreensError> {
        let entries = self.document.scopes.entry(scope.cache_key()).or_default();
        let mut known: HashSet<String> = entries.iter().map(|e| e.record.raw_url.clone()).collect();

        let now = Utc::now();
        let mut added = 0;
        for record in records {
            if known.insert(record.raw_url.clone()) {
                entries.push(CachedRecord {
                    record: record.clone(),
                    uploaded_at: now,
                });
                added += 1;
            }
        }

        if added > 0 {
            self.persist().await?;
            debug!("Cached {} new records for {}", added, scope.cache_key());
        }
        Ok(added)
    }

    /// Forgets a scope. Returns whether anything was removed.
    pub async fn invalidate(&mut self, scope: &TrackerScope) -> Result<bool, ScreensError> {
        let removed = self.document.scopes.remove(&scope.cache_key()).is_some();
        if removed {
            self.persist().await?;
            info!("Invalidated cached images for {}", scope.cache_key());
        }
        Ok(removed)
    }

    async fn persist(&self) -> Result<(), ScreensError> {
        let cache_error =
            |e: std::io::Error| ScreensError::CacheError(format!("{}: {}", self.path.display(), e));

        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(cache_error)?;
        }

        let content = serde_json::to_string_pretty(&self.document)?;
        let temp = self.path.with_extension("json.tmp");
        tokio::fs::write(&temp, content).await.map_err(cache_error)?;
        tokio::fs::rename(&temp, &self.path).await.map_err(cache_error)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(n: usize) -> UploadedImageRecord {
        UploadedImageRecord {
            img_url: format!("https://i.alpha.example/{n}.th.png"),
            raw_url: format!("https://i.alpha.example/{n}.png"),
            web_url: format!("https://alpha.example/v/{n}"),
            host_name: Some("alpha".to_string()),
            source_screenshot_index: n,
            release_url: None,
        }
    }

    #[tokio::test]
    async fn test_cache_is_created_lazily() {
        let dir = tempfile::tempdir().unwrap();
        let mut cache = ReuploadCache::open(dir.path(), "Some Release").await.unwrap();
        let scope = TrackerScope::new("Some Release", "tracker");
        assert!(cache.lookup(&scope).is_empty());
        assert!(!cache.path().exists());

        assert_eq!(cache.append(&scope, &[]).await.unwrap(), 0);
        assert!(!cache.path().exists());

        assert_eq!(cache.append(&scope, &[record(0)]).await.unwrap(), 1);
        assert!(cache.path().exists());
    }

    #[tokio::test]
    async fn test_reload_round_trip_and_dedupe() {
        let dir = tempfile::tempdir().unwrap();
        let scope = TrackerScope::new("rel", "tracker");

        let mut cache = ReuploadCache::open(dir.path(), "rel").await.unwrap();
        cache.append(&scope, &[record(0), record(1)]).await.unwrap();
        assert_eq!(cache.append(&scope, &[record(1), record(2)]).await.unwrap(), 1);

        let reloaded = ReuploadCache::open(dir.path(), "rel").await.unwrap();
        let records = reloaded.lookup(&scope);
        assert_eq!(records, vec![record(0), record(1), record(2)]);

        let other = TrackerScope::new("rel", "other");
        assert!(reloaded.lookup(&other).is_empty());
    }

    #[tokio::test]
    async fn test_release_url_scopes_are_separate() {
        let dir = tempfile::tempdir().unwrap();
        let plain = TrackerScope::new("rel", "tracker");
        let mut cover = plain.clone();
        cover.release_url = Some("https://db.example/release/9".to_string());

        let mut cache = ReuploadCache::open(dir.path(), "rel").await.unwrap();
        cache.append(&cover, &[record(5)]).await.unwrap();
        assert!(cache.lookup(&plain).is_empty());
        assert_eq!(cache.lookup(&cover).len(), 1);
    }

    #[tokio::test]
    async fn test_invalidate() {
        let dir = tempfile::tempdir().unwrap();
        let scope = TrackerScope::new("rel", "tracker");
        let mut cache = ReuploadCache::open(dir.path(), "rel").await.unwrap();
        cache.append(&scope, &[record(0)]).await.unwrap();

        assert!(cache.invalidate(&scope).await.unwrap());
        assert!(!cache.invalidate(&scope).await.unwrap());

        let reloaded = ReuploadCache::open(dir.path(), "rel").await.unwrap();
        assert!(reloaded.lookup(&scope).is_empty());
    }

    #[tokio::test]
    async fn test_corrupt_document_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(ReuploadCache::path_for(dir.path(), "rel"), "{not json").unwrap();
        let cache = ReuploadCache::open(dir.path(), "rel").await.unwrap();
        assert!(cache.lookup(&TrackerScope::new("rel", "tracker")).is_empty());
    }
}
