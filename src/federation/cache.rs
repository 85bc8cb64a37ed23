//! Write-once on-disk cache of remote objects
//!
//! Entries live at `<cache-root>/<host>/<url-path>`. A resolved entry is
//! never rewritten or evicted; a placeholder may be replaced once the
//! remote becomes reachable again.

use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use url::Url;

use super::model::ApObject;
use crate::error::AppError;
use crate::metrics::{CACHE_HITS_TOTAL, CACHE_MISSES_TOTAL};

/// File name used when an IRI path names a directory
const INDEX_FILE: &str = "index.json";

/// One cached object
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum CacheEntry {
    Resolved {
        object: ApObject,
    },
    /// The fetch failed; `object` is the stand-in that was served instead.
    Placeholder {
        object: ApObject,
        attempted_at: DateTime<Utc>,
    },
}

impl CacheEntry {
    pub fn placeholder(iri: &Url) -> Self {
        CacheEntry::Placeholder {
            object: ApObject::placeholder(iri),
            attempted_at: Utc::now(),
        }
    }

    pub fn object(&self) -> &ApObject {
        match self {
            CacheEntry::Resolved { object } | CacheEntry::Placeholder { object, .. } => object,
        }
    }

    pub fn into_object(self) -> ApObject {
        match self {
            CacheEntry::Resolved { object } | CacheEntry::Placeholder { object, .. } => object,
        }
    }

    pub fn is_placeholder(&self) -> bool {
        matches!(self, CacheEntry::Placeholder { .. })
    }
}

/// Files written before entries were tagged hold the bare object.
#[derive(Deserialize)]
#[serde(untagged)]
enum StoredEntry {
    Tagged(CacheEntry),
    Bare(ApObject),
}

/// Object cache rooted at one directory
#[derive(Debug, Clone)]
pub struct ObjectCache {
    root: PathBuf,
}

impl ObjectCache {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// File backing `iri`
    ///
    /// Query and fragment are ignored. Dot segments are rejected so an
    /// IRI cannot address anything outside its host directory.
    pub fn path_for(&self, iri: &Url) -> Result<PathBuf, AppError> {
        let host = iri
            .host_str()
            .ok_or_else(|| AppError::Validation(format!("IRI has no host: {}", iri)))?;
        let host_dir = match iri.port() {
            Some(port) => format!("{}:{}", host, port),
            None => host.to_string(),
        };

        let mut path = self.root.join(host_dir);
        let segments: Vec<&str> = iri
            .path_segments()
            .map(|s| s.collect())
            .unwrap_or_default();

        for segment in segments.iter().filter(|s| !s.is_empty()) {
            if *segment == "." || *segment == ".." || segment.contains('\\') {
                return Err(AppError::Validation(format!(
                    "IRI path is not cacheable: {}",
                    iri
                )));
            }
            path.push(segment);
        }

        if segments.last().is_none_or(|s| s.is_empty()) {
            path.push(INDEX_FILE);
        }

        Ok(path)
    }

    /// Read the entry for `iri`
    ///
    /// `Ok(None)` only when no entry exists; an unreadable or undecodable
    /// file is an error.
    pub async fn get(&self, iri: &Url) -> Result<Option<CacheEntry>, AppError> {
        let path = self.path_for(iri)?;
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                CACHE_MISSES_TOTAL.with_label_values(&["object"]).inc();
                tracing::debug!(iri = %iri, "Object cache miss");
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };

        let entry = match serde_json::from_slice::<StoredEntry>(&bytes) {
            Ok(StoredEntry::Tagged(entry)) => entry,
            Ok(StoredEntry::Bare(object)) => CacheEntry::Resolved { object },
            Err(e) => {
                return Err(AppError::CorruptState {
                    path: path.display().to_string(),
                    reason: e.to_string(),
                });
            }
        };

        CACHE_HITS_TOTAL.with_label_values(&["object"]).inc();
        tracing::debug!(iri = %iri, placeholder = entry.is_placeholder(), "Object cache hit");
        Ok(Some(entry))
    }

    /// Store `entry` for `iri`
    ///
    /// The file is written beside its destination and renamed into place,
    /// so readers see either the previous file or the complete new one.
    pub async fn put(&self, iri: &Url, entry: &CacheEntry) -> Result<(), AppError> {
        let path = self.path_for(iri)?;
        let bytes = serde_json::to_vec_pretty(entry)?;
        write_atomic(path, bytes).await?;
        tracing::debug!(iri = %iri, placeholder = entry.is_placeholder(), "Object cached");
        Ok(())
    }

    /// Drop a placeholder so the next resolve fetches again
    ///
    /// Returns `false` when there is nothing to drop. Resolved entries are
    /// left alone.
    pub async fn remove_placeholder(&self, iri: &Url) -> Result<bool, AppError> {
        match self.get(iri).await? {
            Some(entry) if entry.is_placeholder() => {
                let path = self.path_for(iri)?;
                tokio::fs::remove_file(&path).await?;
                tracing::info!(iri = %iri, "Placeholder removed");
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

/// Write `bytes` to `path` via a temp file in the same directory.
pub(crate) async fn write_atomic(path: PathBuf, bytes: Vec<u8>) -> Result<(), AppError> {
    tokio::task::spawn_blocking(move || -> Result<(), std::io::Error> {
        let dir = path.parent().unwrap_or_else(|| Path::new("."));
        std::fs::create_dir_all(dir)?;
        let mut file = tempfile::NamedTempFile::new_in(dir)?;
        file.write_all(&bytes)?;
        file.as_file().sync_all()?;
        file.persist(&path).map_err(|e| e.error)?;
        Ok(())
    })
    .await
    .map_err(|e| AppError::Internal(e.into()))??;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn note(iri: &Url) -> ApObject {
        let mut object = ApObject::new("Note");
        object.id = Some(iri.clone());
        object.content = Some("<p>hello</p>".to_string());
        object
    }

    #[test]
    fn path_follows_host_and_path() {
        let cache = ObjectCache::new("/var/cache/ap");
        let iri = Url::parse("https://example.social/notes/42").expect("url");
        assert_eq!(
            cache.path_for(&iri).expect("path"),
            PathBuf::from("/var/cache/ap/example.social/notes/42")
        );
    }

    #[test]
    fn path_keeps_explicit_port_and_drops_query() {
        let cache = ObjectCache::new("/c");
        let iri = Url::parse("http://127.0.0.1:8080/notes/1?page=2#frag").expect("url");
        assert_eq!(
            cache.path_for(&iri).expect("path"),
            PathBuf::from("/c/127.0.0.1:8080/notes/1")
        );
    }

    #[test]
    fn directory_iri_uses_index_file() {
        let cache = ObjectCache::new("/c");
        let root = Url::parse("https://example.social").expect("url");
        assert_eq!(
            cache.path_for(&root).expect("path"),
            PathBuf::from("/c/example.social/index.json")
        );
        let dir = Url::parse("https://example.social/users/bob/").expect("url");
        assert_eq!(
            cache.path_for(&dir).expect("path"),
            PathBuf::from("/c/example.social/users/bob/index.json")
        );
    }

    #[tokio::test]
    async fn miss_then_hit() {
        let dir = TempDir::new().expect("tempdir");
        let cache = ObjectCache::new(dir.path());
        let iri = Url::parse("https://example.social/notes/42").expect("url");

        assert!(cache.get(&iri).await.expect("get").is_none());

        let entry = CacheEntry::Resolved { object: note(&iri) };
        cache.put(&iri, &entry).await.expect("put");
        cache.put(&iri, &entry).await.expect("put is idempotent");

        assert_eq!(cache.get(&iri).await.expect("get"), Some(entry));
        assert!(dir.path().join("example.social/notes/42").is_file());
    }

    #[tokio::test]
    async fn corrupt_entry_is_an_error() {
        let dir = TempDir::new().expect("tempdir");
        let cache = ObjectCache::new(dir.path());
        let iri = Url::parse("https://example.social/notes/7").expect("url");
        let path = cache.path_for(&iri).expect("path");
        std::fs::create_dir_all(path.parent().expect("parent")).expect("mkdir");
        std::fs::write(&path, b"{not json").expect("write");

        match cache.get(&iri).await {
            Err(AppError::CorruptState { .. }) => {}
            other => panic!("expected corrupt state error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn bare_object_reads_as_resolved() {
        let dir = TempDir::new().expect("tempdir");
        let cache = ObjectCache::new(dir.path());
        let iri = Url::parse("https://example.social/notes/8").expect("url");
        let path = cache.path_for(&iri).expect("path");
        std::fs::create_dir_all(path.parent().expect("parent")).expect("mkdir");
        std::fs::write(&path, serde_json::to_vec(&note(&iri)).expect("json")).expect("write");

        let entry = cache.get(&iri).await.expect("get").expect("entry");
        assert!(!entry.is_placeholder());
        assert_eq!(entry.object().content.as_deref(), Some("<p>hello</p>"));
    }

    #[tokio::test]
    async fn remove_placeholder_leaves_resolved_entries() {
        let dir = TempDir::new().expect("tempdir");
        let cache = ObjectCache::new(dir.path());
        let failed = Url::parse("https://down.example/notes/1").expect("url");
        let fine = Url::parse("https://example.social/notes/1").expect("url");

        cache
            .put(&failed, &CacheEntry::placeholder(&failed))
            .await
            .expect("put placeholder");
        cache
            .put(&fine, &CacheEntry::Resolved { object: note(&fine) })
            .await
            .expect("put resolved");

        assert!(cache.remove_placeholder(&failed).await.expect("remove"));
        assert!(cache.get(&failed).await.expect("get").is_none());
        assert!(!cache.remove_placeholder(&fine).await.expect("remove"));
        assert!(cache.get(&fine).await.expect("get").is_some());
    }
}
