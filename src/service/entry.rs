//! Entry service
//!
//! Entries are stored as files: `<source-root>/<host>/<id>/entry.jsonld`
//! holds the `Note`, `activity.jsonld` the `Create` that announced it.
//! Ids are consecutive integers per host. An entry is written under a
//! hidden staging directory and renamed into place, so readers only see
//! numeric directories with both files present.

use std::path::{Path, PathBuf};

use serde_json::{Value, json};
use tokio::sync::Mutex;
use url::Url;

use crate::error::AppError;
use crate::federation::cache::write_atomic;
use crate::federation::delivery::builder;
use crate::federation::model::{
    ACTIVITYSTREAMS_CONTEXT, Activity, ActivityObject, ApObject, ObjectRef, PUBLIC_COLLECTION,
};
use crate::metrics::ENTRIES_TOTAL;

const ENTRY_FILE: &str = "entry.jsonld";
const ACTIVITY_FILE: &str = "activity.jsonld";

/// Submitted entry
#[derive(Debug, Clone)]
pub struct NewEntry {
    pub title: String,
    /// Markdown source
    pub body: String,
    /// Entry being replied to
    pub parent: Option<Url>,
}

/// Entry as persisted
#[derive(Debug, Clone)]
pub struct PublishedEntry {
    pub id: u64,
    pub note: ApObject,
    pub activity: Activity,
}

/// Entry service
pub struct EntryService {
    source_root: PathBuf,
    protocol: String,
    actor: Url,
    /// Held while choosing the next id and moving its directory into place
    publish_lock: Mutex<()>,
}

impl EntryService {
    pub fn new(source_root: impl Into<PathBuf>, protocol: impl Into<String>, actor: Url) -> Self {
        Self {
            source_root: source_root.into(),
            protocol: protocol.into(),
            actor,
            publish_lock: Mutex::new(()),
        }
    }

    fn host_dir(&self, host: &str) -> Result<PathBuf, AppError> {
        if host.is_empty() || host.contains(['/', '\\']) || host == "." || host == ".." {
            return Err(AppError::Validation(format!("invalid host: {:?}", host)));
        }
        Ok(self.source_root.join(host))
    }

    fn base_url(&self, host: &str) -> Result<Url, AppError> {
        Url::parse(&format!("{}://{}/", self.protocol, host))
            .map_err(|e| AppError::Validation(format!("invalid host {:?}: {}", host, e)))
    }

    /// Persist a new entry and its `Create` activity
    ///
    /// # Returns
    /// The stored entry; the caller queues `activity` for delivery.
    pub async fn publish(&self, host: &str, entry: NewEntry) -> Result<PublishedEntry, AppError> {
        let title = entry.title.trim().to_string();
        let body = entry.body.trim().to_string();
        if body.is_empty() {
            return Err(AppError::Validation("entry text is required".to_string()));
        }

        let host_dir = self.host_dir(host)?;
        let base = self.base_url(host)?;

        let _guard = self.publish_lock.lock().await;

        let id = next_entry_id(&host_dir).await?;
        let entry_dir = host_dir.join(id.to_string());
        let staging_dir = host_dir.join(format!(".{}.partial", id));
        // Left over from an interrupted publish
        match tokio::fs::remove_dir_all(&staging_dir).await {
            Ok(()) => tracing::warn!(path = %staging_dir.display(), "Removed stale staging directory"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        tokio::fs::create_dir_all(&staging_dir).await?;

        let entry_uri = base
            .join(&format!("{}/", id))
            .map_err(|e| AppError::Internal(e.into()))?;
        let note_id = entry_uri
            .join(ENTRY_FILE)
            .map_err(|e| AppError::Internal(e.into()))?;
        let activity_id = entry_uri
            .join(ACTIVITY_FILE)
            .map_err(|e| AppError::Internal(e.into()))?;
        let followers = base
            .join("followers.jsonld")
            .map_err(|e| AppError::Internal(e.into()))?;
        let now = chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true);

        let mut note = ApObject::new("Note");
        note.context = Some(Value::String(ACTIVITYSTREAMS_CONTEXT.to_string()));
        note.id = Some(note_id);
        note.name = (!title.is_empty()).then_some(title);
        note.content = Some(markdown_to_html(&body));
        note.attributed_to = Some(Value::String(self.actor.to_string()));
        note.published = Some(now.clone());
        note.updated = Some(now);
        note.in_reply_to = entry.parent.map(ObjectRef::Iri);
        note.url = Some(json!({
            "type": "Link",
            "href": entry_uri.as_str(),
            "mediaType": "text/html"
        }));
        note.to = vec![PUBLIC_COLLECTION.to_string()];
        note.cc = vec![followers.to_string()];
        note.extra.insert(
            "source".to_string(),
            json!({"content": body, "mediaType": "text/markdown"}),
        );

        let mut activity = builder::create(&self.actor, activity_id, note.clone());
        activity.context = Some(Value::String(ACTIVITYSTREAMS_CONTEXT.to_string()));

        write_atomic(staging_dir.join(ENTRY_FILE), serde_json::to_vec_pretty(&note)?).await?;
        write_atomic(staging_dir.join(ACTIVITY_FILE), serde_json::to_vec_pretty(&activity)?).await?;
        tokio::fs::rename(&staging_dir, &entry_dir).await?;

        ENTRIES_TOTAL.inc();
        tracing::info!(host, id, uri = %entry_uri, "Entry published");

        Ok(PublishedEntry { id, note, activity })
    }

    /// All entries of `host`, oldest first
    ///
    /// Numeric directories without an `activity.jsonld` are skipped.
    pub async fn list_entries(&self, host: &str) -> Result<Vec<ApObject>, AppError> {
        let host_dir = self.host_dir(host)?;
        let mut entries = Vec::new();

        for id in entry_ids(&host_dir).await? {
            let path = host_dir.join(id.to_string()).join(ACTIVITY_FILE);
            let bytes = match tokio::fs::read(&path).await {
                Ok(bytes) => bytes,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    tracing::debug!(host, id, "Entry directory has no activity; skipping");
                    continue;
                }
                Err(e) => return Err(e.into()),
            };
            let activity: Activity =
                serde_json::from_slice(&bytes).map_err(|e| AppError::CorruptState {
                    path: path.display().to_string(),
                    reason: e.to_string(),
                })?;
            match activity.object {
                Some(ActivityObject::Object(note)) => entries.push(*note),
                _ => {
                    return Err(AppError::CorruptState {
                        path: path.display().to_string(),
                        reason: "activity does not embed its object".to_string(),
                    });
                }
            }
        }

        Ok(entries)
    }
}

/// Entries that do not reply to anything
pub fn root_entries(entries: &[ApObject]) -> Vec<&ApObject> {
    entries.iter().filter(|e| e.in_reply_to.is_none()).collect()
}

/// Numeric subdirectories of `host_dir`, ascending; a missing directory has none.
async fn entry_ids(host_dir: &Path) -> Result<Vec<u64>, AppError> {
    let mut dir = match tokio::fs::read_dir(host_dir).await {
        Ok(dir) => dir,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut ids = Vec::new();
    while let Some(item) = dir.next_entry().await? {
        let Some(id) = item.file_name().to_str().and_then(|n| n.parse::<u64>().ok()) else {
            continue;
        };
        if item.file_type().await?.is_dir() {
            ids.push(id);
        }
    }
    ids.sort_unstable();
    Ok(ids)
}

async fn next_entry_id(host_dir: &Path) -> Result<u64, AppError> {
    Ok(entry_ids(host_dir).await?.last().map_or(1, |last| last + 1))
}

/// Paragraph-level rendering of entry text
///
/// Blank lines separate paragraphs; everything else is escaped text.
/// Full markdown is left to the site renderer, which reads `source`.
fn markdown_to_html(text: &str) -> String {
    text.split("\n\n")
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(|p| format!("<p>{}</p>", html_escape::encode_text(p).replace('\n', "<br>")))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::federation::model::ActivityKind;
    use tempfile::TempDir;

    fn service(dir: &TempDir) -> EntryService {
        EntryService::new(
            dir.path(),
            "https",
            Url::parse("https://blog.example/ap.jsonld").expect("actor"),
        )
    }

    fn entry(title: &str, body: &str, parent: Option<&str>) -> NewEntry {
        NewEntry {
            title: title.to_string(),
            body: body.to_string(),
            parent: parent.map(|p| Url::parse(p).expect("parent")),
        }
    }

    #[tokio::test]
    async fn publish_writes_entry_and_activity() {
        let dir = TempDir::new().expect("tempdir");
        let service = service(&dir);

        let published = service
            .publish("blog.example", entry("Hello", "First *post*", None))
            .await
            .expect("published");

        assert_eq!(published.id, 1);
        assert_eq!(
            published.note.id.as_ref().map(Url::as_str),
            Some("https://blog.example/1/entry.jsonld")
        );
        assert_eq!(
            published.note.html_permalink().map(String::from),
            Some("https://blog.example/1/".to_string())
        );
        assert_eq!(published.note.to, [PUBLIC_COLLECTION]);
        assert_eq!(published.note.cc, ["https://blog.example/followers.jsonld"]);
        assert_eq!(published.activity.kind, ActivityKind::Create);
        assert_eq!(
            published.activity.id.as_ref().map(Url::as_str),
            Some("https://blog.example/1/activity.jsonld")
        );

        let entry_dir = dir.path().join("blog.example/1");
        let stored: Value =
            serde_json::from_slice(&std::fs::read(entry_dir.join("entry.jsonld")).expect("entry"))
                .expect("json");
        assert_eq!(stored["@context"], ACTIVITYSTREAMS_CONTEXT);
        assert_eq!(stored["name"], "Hello");
        assert_eq!(stored["source"]["content"], "First *post*");
        assert_eq!(stored["source"]["mediaType"], "text/markdown");
        assert!(entry_dir.join("activity.jsonld").is_file());
    }

    #[tokio::test]
    async fn ids_continue_from_highest_directory() {
        let dir = TempDir::new().expect("tempdir");
        std::fs::create_dir_all(dir.path().join("blog.example/7")).expect("mkdir");
        std::fs::create_dir_all(dir.path().join("blog.example/drafts")).expect("mkdir");
        std::fs::write(dir.path().join("blog.example/9"), b"not a dir").expect("write");

        let published = service(&dir)
            .publish("blog.example", entry("", "text", None))
            .await
            .expect("published");
        assert_eq!(published.id, 8);
        assert!(published.note.name.is_none());
    }

    #[tokio::test]
    async fn root_entries_exclude_replies() {
        let dir = TempDir::new().expect("tempdir");
        let service = service(&dir);
        service
            .publish("blog.example", entry("Root", "root text", None))
            .await
            .expect("root");
        service
            .publish(
                "blog.example",
                entry("Re", "reply text", Some("https://a.example/notes/1")),
            )
            .await
            .expect("reply");

        let entries = service.list_entries("blog.example").await.expect("entries");
        assert_eq!(entries.len(), 2);
        let roots = root_entries(&entries);
        assert_eq!(roots.len(), 1);
        assert_eq!(roots[0].name.as_deref(), Some("Root"));
    }

    #[tokio::test]
    async fn listing_during_publish_sees_only_complete_entries() {
        let dir = TempDir::new().expect("tempdir");
        let service = std::sync::Arc::new(service(&dir));

        let writer = {
            let service = service.clone();
            tokio::spawn(async move {
                for n in 0..40 {
                    service
                        .publish("blog.example", entry("", &format!("entry {n}"), None))
                        .await
                        .expect("published");
                }
            })
        };

        while !writer.is_finished() {
            let entries = service
                .list_entries("blog.example")
                .await
                .expect("listing while publishing");
            assert!(entries.iter().all(|e| e.content.is_some()));
            tokio::task::yield_now().await;
        }
        writer.await.expect("writer");

        assert_eq!(
            service.list_entries("blog.example").await.expect("entries").len(),
            40
        );
        assert!(!dir.path().join("blog.example/.40.partial").exists());
    }

    #[tokio::test]
    async fn empty_entry_directory_is_skipped() {
        let dir = TempDir::new().expect("tempdir");
        let service = service(&dir);
        service
            .publish("blog.example", entry("", "first", None))
            .await
            .expect("published");
        std::fs::create_dir_all(dir.path().join("blog.example/2")).expect("mkdir");

        let entries = service.list_entries("blog.example").await.expect("entries");
        assert_eq!(entries.len(), 1);
    }

    #[tokio::test]
    async fn empty_body_is_rejected() {
        let dir = TempDir::new().expect("tempdir");
        assert!(matches!(
            service(&dir).publish("blog.example", entry("t", "   ", None)).await,
            Err(AppError::Validation(_))
        ));
    }

    #[test]
    fn paragraphs_are_escaped() {
        assert_eq!(
            markdown_to_html("a <b>\nline\n\nsecond"),
            "<p>a &lt;b&gt;<br>line</p><p>second</p>"
        );
    }
}
