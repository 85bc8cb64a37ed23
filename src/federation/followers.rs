//! Follower list persisted as an `OrderedCollection`
//!
//! One file per local host: `<serve-root>/<host>/followers.jsonld`,
//! served as-is by the static file layer.

use std::path::{Path, PathBuf};

use serde_json::Value;
use url::Url;

use super::cache::write_atomic;
use super::model::{ACTIVITYSTREAMS_CONTEXT, Collection, ObjectRef};
use crate::error::AppError;

const FOLLOWERS_FILE: &str = "followers.jsonld";

/// In-memory follower list of one local actor
#[derive(Debug, Clone, PartialEq)]
pub struct FollowerList {
    pub id: Option<Url>,
    pub actor: Option<Url>,
    followers: Vec<Url>,
}

impl FollowerList {
    pub fn new(id: Url, actor: Url) -> Self {
        Self {
            id: Some(id),
            actor: Some(actor),
            followers: Vec::new(),
        }
    }

    pub fn followers(&self) -> &[Url] {
        &self.followers
    }

    pub fn len(&self) -> usize {
        self.followers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.followers.is_empty()
    }

    pub fn contains(&self, follower: &Url) -> bool {
        self.followers.contains(follower)
    }

    /// Append `follower` unless already present; returns whether it was added.
    pub fn add(&mut self, follower: Url) -> bool {
        if self.contains(&follower) {
            return false;
        }
        self.followers.push(follower);
        true
    }

    fn from_collection(collection: Collection) -> Self {
        let mut list = Self {
            id: collection.id,
            actor: collection
                .attributed_to
                .as_ref()
                .and_then(Value::as_str)
                .and_then(|s| Url::parse(s).ok()),
            followers: Vec::new(),
        };
        // Hand-edited files may contain duplicates; the first occurrence wins.
        for follower in collection
            .ordered_items
            .iter()
            .chain(collection.items.iter())
            .filter_map(ObjectRef::iri)
        {
            list.add(follower);
        }
        list
    }

    fn to_collection(&self) -> Collection {
        let mut collection = Collection::ordered(self.id.clone(), self.followers.clone());
        collection.context = Some(Value::String(ACTIVITYSTREAMS_CONTEXT.to_string()));
        collection.attributed_to = self.actor.as_ref().map(|a| Value::String(a.to_string()));
        collection
    }
}

/// Follower files under the served root
#[derive(Debug, Clone)]
pub struct FollowerStore {
    serve_root: PathBuf,
}

impl FollowerStore {
    pub fn new(serve_root: impl Into<PathBuf>) -> Self {
        Self {
            serve_root: serve_root.into(),
        }
    }

    pub fn path_for(&self, host: &str) -> Result<PathBuf, AppError> {
        if host.is_empty() || host.contains(['/', '\\']) || host == "." || host == ".." {
            return Err(AppError::Validation(format!("invalid host: {:?}", host)));
        }
        Ok(self.serve_root.join(host).join(FOLLOWERS_FILE))
    }

    /// Read the list for `host`
    ///
    /// A missing file is `NotFound`; an unreadable one is an error too.
    pub async fn load(&self, host: &str) -> Result<FollowerList, AppError> {
        let path = self.path_for(host)?;
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::warn!(host, path = %path.display(), "No follower list for host");
                return Err(AppError::NotFound);
            }
            Err(e) => return Err(e.into()),
        };
        let collection: Collection =
            serde_json::from_slice(&bytes).map_err(|e| corrupt(&path, e))?;
        Ok(FollowerList::from_collection(collection))
    }

    /// Replace the list for `host` in one rename
    pub async fn save(&self, host: &str, list: &FollowerList) -> Result<(), AppError> {
        let path = self.path_for(host)?;
        let bytes = serde_json::to_vec_pretty(&list.to_collection())?;
        write_atomic(path, bytes).await
    }

    /// Create an empty list for `host` if none exists yet
    pub async fn ensure(&self, host: &str, actor: &Url) -> Result<FollowerList, AppError> {
        match self.load(host).await {
            Ok(list) => Ok(list),
            Err(AppError::NotFound) => {
                let mut id = actor.clone();
                id.set_path("/followers.jsonld");
                id.set_fragment(None);
                let list = FollowerList::new(id, actor.clone());
                self.save(host, &list).await?;
                tracing::info!(host, "Created empty follower list");
                Ok(list)
            }
            Err(e) => Err(e),
        }
    }
}

fn corrupt(path: &Path, e: serde_json::Error) -> AppError {
    AppError::CorruptState {
        path: path.display().to_string(),
        reason: e.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn url(s: &str) -> Url {
        Url::parse(s).expect("url")
    }

    #[test]
    fn add_is_idempotent() {
        let mut list = FollowerList::new(
            url("https://blog.example/followers.jsonld"),
            url("https://blog.example/ap.jsonld"),
        );
        assert!(list.add(url("https://a.example/users/bob")));
        assert!(!list.add(url("https://a.example/users/bob")));
        assert_eq!(list.len(), 1);
    }

    #[tokio::test]
    async fn missing_list_is_not_found() {
        let dir = TempDir::new().expect("tempdir");
        let store = FollowerStore::new(dir.path());
        assert!(matches!(store.load("blog.example").await, Err(AppError::NotFound)));
    }

    #[tokio::test]
    async fn ensure_then_round_trip() {
        let dir = TempDir::new().expect("tempdir");
        let store = FollowerStore::new(dir.path());
        let actor = url("https://blog.example/ap.jsonld");

        let mut list = store.ensure("blog.example", &actor).await.expect("ensured");
        assert!(list.is_empty());
        list.add(url("https://a.example/users/bob"));
        store.save("blog.example", &list).await.expect("saved");

        let written: Value = serde_json::from_slice(
            &std::fs::read(dir.path().join("blog.example/followers.jsonld")).expect("file"),
        )
        .expect("json");
        assert_eq!(written["type"], "OrderedCollection");
        assert_eq!(written["totalItems"], 1);
        assert_eq!(written["orderedItems"], json!(["https://a.example/users/bob"]));
        assert_eq!(written["id"], "https://blog.example/followers.jsonld");
        assert_eq!(written["attributedTo"], "https://blog.example/ap.jsonld");

        let reloaded = store.load("blog.example").await.expect("loaded");
        assert_eq!(reloaded, list);

        // A second ensure keeps existing followers.
        let again = store.ensure("blog.example", &actor).await.expect("ensured");
        assert_eq!(again.len(), 1);
    }

    #[tokio::test]
    async fn corrupt_list_is_an_error() {
        let dir = TempDir::new().expect("tempdir");
        let store = FollowerStore::new(dir.path());
        std::fs::create_dir_all(dir.path().join("blog.example")).expect("mkdir");
        std::fs::write(dir.path().join("blog.example/followers.jsonld"), b"[1,2").expect("write");

        assert!(matches!(
            store.load("blog.example").await,
            Err(AppError::CorruptState { .. })
        ));
    }

    #[test]
    fn host_cannot_escape_root() {
        let store = FollowerStore::new("/srv/files");
        assert!(store.path_for("../etc").is_err());
        assert!(store.path_for("..").is_err());
        assert!(store.path_for("blog.example:8080").is_ok());
    }
}
