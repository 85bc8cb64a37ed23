//! Remote object resolution
//!
//! Cache first; on a miss, fetch the object, flatten its paginated
//! `replies` collection into one ordered list of IRIs, and persist the
//! result. Objects that cannot be fetched are cached as placeholders.

use std::collections::HashSet;
use std::time::Duration;

use serde::de::DeserializeOwned;
use url::Url;

use super::cache::{CacheEntry, ObjectCache};
use super::client::{FetchError, ObjectFetcher};
use super::locks::KeyedLocks;
use super::model::{ApObject, Collection, CollectionPage, ObjectRef};
use crate::error::AppError;

/// Resolution limits
#[derive(Debug, Clone)]
pub struct ResolverOptions {
    /// Ceiling on pages followed per replies collection
    pub max_pages: usize,
    /// Refetch placeholders older than this; `None` keeps them until removed
    pub placeholder_retry: Option<Duration>,
}

impl Default for ResolverOptions {
    fn default() -> Self {
        Self {
            max_pages: 100,
            placeholder_retry: None,
        }
    }
}

pub struct ObjectResolver<F> {
    fetcher: F,
    cache: ObjectCache,
    locks: KeyedLocks,
    options: ResolverOptions,
}

impl<F: ObjectFetcher> ObjectResolver<F> {
    pub fn new(fetcher: F, cache: ObjectCache, options: ResolverOptions) -> Self {
        Self {
            fetcher,
            cache,
            locks: KeyedLocks::new(),
            options,
        }
    }

    pub fn cache(&self) -> &ObjectCache {
        &self.cache
    }

    /// Resolve `iri` to an object with its replies flattened
    ///
    /// Concurrent calls for the same IRI are serialized; the later caller
    /// reads what the first one cached.
    pub async fn resolve(&self, iri: &Url) -> Result<ApObject, AppError> {
        let _guard = self.locks.lock(iri.as_str()).await;

        if let Some(entry) = self.cache.get(iri).await? {
            if !self.placeholder_expired(&entry) {
                return Ok(entry.into_object());
            }
            tracing::info!(iri = %iri, "Retrying placeholder");
        }

        let document = match self.fetcher.fetch(iri).await {
            Ok(document) => document,
            Err(e) if e.is_unreachable() => {
                tracing::warn!(iri = %iri, error = %e, "Object unavailable; caching placeholder");
                let entry = CacheEntry::placeholder(iri);
                self.cache.put(iri, &entry).await?;
                return Ok(entry.into_object());
            }
            Err(e) => return Err(e.into()),
        };

        let mut object: ApObject = decode(iri, document)?;

        let mut complete = true;
        if let Some(replies) = object.replies.take() {
            let collection_id = replies.iri();
            let flattened = self.flatten_replies(replies).await?;
            complete = flattened.complete;
            tracing::debug!(iri = %iri, replies = flattened.iris.len(), "Replies flattened");
            object.replies = Some(ObjectRef::Object(Box::new(Collection::ordered(
                collection_id,
                flattened.iris,
            ))));
        }

        if !complete {
            tracing::warn!(iri = %iri, "Replies collection unavailable; not caching");
            return Ok(object);
        }

        self.cache
            .put(
                iri,
                &CacheEntry::Resolved {
                    object: object.clone(),
                },
            )
            .await?;
        tracing::info!(iri = %iri, kind = %object.kind, "Object resolved");
        Ok(object)
    }

    fn placeholder_expired(&self, entry: &CacheEntry) -> bool {
        match (entry, self.options.placeholder_retry) {
            (CacheEntry::Placeholder { attempted_at, .. }, Some(ttl)) => {
                let age = chrono::Utc::now().signed_duration_since(*attempted_at);
                age.to_std().map(|age| age >= ttl).unwrap_or(false)
            }
            _ => false,
        }
    }

    /// Walk `first`/`next` and collect every item IRI in page order
    ///
    /// Stops early, keeping what was collected, when a later page cannot
    /// be fetched, a page repeats, or the page ceiling is reached. Losing
    /// the collection itself or its first page marks the result incomplete.
    async fn flatten_replies(&self, replies: ObjectRef<Collection>) -> Result<FlattenedReplies, AppError> {
        let collection = match replies {
            ObjectRef::Object(collection) => *collection,
            ObjectRef::Iri(iri) => match self.fetch_best_effort::<Collection>(&iri).await? {
                Some(collection) => collection,
                None => return Ok(FlattenedReplies::incomplete()),
            },
        };

        let mut reply_iris = Vec::new();

        let Some(first) = collection.first else {
            collect_items(&mut reply_iris, &collection.items, &collection.ordered_items);
            return Ok(FlattenedReplies::complete(reply_iris));
        };

        let mut seen_pages = HashSet::new();
        let mut next = Some(first);
        let mut pages = 0;

        while let Some(page_ref) = next.take() {
            if pages >= self.options.max_pages {
                tracing::warn!(max_pages = self.options.max_pages, "Reply page ceiling reached");
                break;
            }
            if let Some(page_iri) = page_ref.iri() {
                if !seen_pages.insert(page_iri.clone()) {
                    tracing::warn!(page = %page_iri, "Reply pages loop; stopping");
                    break;
                }
            }

            let page = match page_ref {
                ObjectRef::Object(page) => *page,
                ObjectRef::Iri(page_iri) => {
                    match self.fetch_best_effort::<CollectionPage>(&page_iri).await? {
                        Some(page) => page,
                        None if pages == 0 => return Ok(FlattenedReplies::incomplete()),
                        None => break,
                    }
                }
            };

            pages += 1;
            collect_items(&mut reply_iris, &page.items, &page.ordered_items);
            next = page.next;
        }

        Ok(FlattenedReplies::complete(reply_iris))
    }

    /// `Ok(None)` when the remote is unreachable; decode failures are errors.
    async fn fetch_best_effort<T: DeserializeOwned>(&self, iri: &Url) -> Result<Option<T>, AppError> {
        match self.fetcher.fetch(iri).await {
            Ok(document) => decode(iri, document).map(Some),
            Err(e) if e.is_unreachable() => {
                tracing::warn!(iri = %iri, error = %e, "Reply page unavailable; keeping partial list");
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// Reply IRIs in page order
struct FlattenedReplies {
    iris: Vec<Url>,
    /// False when nothing could be read from the collection
    complete: bool,
}

impl FlattenedReplies {
    fn complete(iris: Vec<Url>) -> Self {
        Self {
            iris,
            complete: true,
        }
    }

    fn incomplete() -> Self {
        Self {
            iris: Vec::new(),
            complete: false,
        }
    }
}

fn decode<T: DeserializeOwned>(iri: &Url, document: serde_json::Value) -> Result<T, AppError> {
    serde_json::from_value(document).map_err(|e| {
        FetchError::Decode {
            iri: iri.clone(),
            reason: e.to_string(),
        }
        .into()
    })
}

fn collect_items(out: &mut Vec<Url>, items: &[ObjectRef], ordered_items: &[ObjectRef]) {
    for item in items.iter().chain(ordered_items) {
        match item.iri() {
            Some(iri) => out.push(iri),
            None => tracing::warn!("Skipping embedded reply without an id"),
        }
    }
}
