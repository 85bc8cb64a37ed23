//! Reply tree materialization

use std::collections::HashSet;
use std::sync::Mutex;
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt};
use url::Url;

use super::client::{FetchError, ObjectFetcher};
use super::model::{ApObject, RemoteObject};
use super::resolver::ObjectResolver;
use crate::error::AppError;

/// Walks an object and its replies through the resolver.
///
/// Each IRI is expanded at most once per walk; a repeat shows up as a
/// leaf. Nodes at `max_depth` are leaves as well. A reply whose body is
/// not an ActivityStreams object becomes an uncached placeholder leaf;
/// the same failure on the root is returned to the caller.
pub struct ReplyTreeWalker<'a, F> {
    resolver: &'a ObjectResolver<F>,
    max_depth: usize,
    visited: Mutex<HashSet<Url>>,
}

impl<'a, F: ObjectFetcher> ReplyTreeWalker<'a, F> {
    pub fn new(resolver: &'a ObjectResolver<F>, max_depth: usize) -> Self {
        Self {
            resolver,
            max_depth,
            visited: Mutex::new(HashSet::new()),
        }
    }

    /// Walk the whole tree under `iri`, failing with `Timeout` past `deadline`.
    pub async fn walk_with_deadline(
        &self,
        iri: &Url,
        deadline: Duration,
    ) -> Result<RemoteObject, AppError> {
        tokio::time::timeout(deadline, self.walk(iri, 0))
            .await
            .map_err(|_| {
                tracing::warn!(iri = %iri, ?deadline, "Reply tree walk timed out");
                AppError::Timeout(format!("reply tree walk for {}", iri))
            })?
    }

    /// Resolve `iri` at `depth` and, below the depth ceiling, each of its replies.
    pub fn walk<'s>(&'s self, iri: &'s Url, depth: usize) -> BoxFuture<'s, Result<RemoteObject, AppError>> {
        async move {
            let object = self.resolver.resolve(iri).await?;
            let mut node = RemoteObject::from_object(&object);

            let first_visit = self
                .visited
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .insert(iri.clone());
            if !first_visit {
                tracing::debug!(iri = %iri, "Already visited; not expanding");
                return Ok(node);
            }
            if depth >= self.max_depth {
                tracing::debug!(iri = %iri, depth, "Depth ceiling reached");
                return Ok(node);
            }

            for reply in object.reply_iris() {
                let child = match self.walk(&reply, depth + 1).await {
                    Ok(child) => child,
                    Err(AppError::Fetch(e @ FetchError::Decode { .. })) => {
                        tracing::warn!(iri = %reply, error = %e, "Undecodable reply; using placeholder");
                        RemoteObject::from_object(&ApObject::placeholder(&reply))
                    }
                    Err(e) => return Err(e),
                };
                node.replies.push(child);
            }

            Ok(node)
        }
        .boxed()
    }
}
