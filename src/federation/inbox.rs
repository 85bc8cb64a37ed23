//! Inbound activity processing
//!
//! Only `Follow` changes state: the follower is recorded and an `Accept`
//! is queued back. Every other activity is acknowledged and dropped.

use url::Url;

use super::delivery::{DeliveryQueue, DeliveryTarget, builder};
use super::followers::FollowerStore;
use super::locks::KeyedLocks;
use super::model::{Activity, ActivityKind};
use crate::error::AppError;
use crate::metrics::{ACTIVITYPUB_ACTIVITIES_RECEIVED, FOLLOWERS_TOTAL};

/// What an inbound activity did
#[derive(Debug, Clone, PartialEq)]
pub enum InboxOutcome {
    /// New follower recorded, Accept queued
    FollowAccepted { follower: Url },
    /// Follower was already recorded; nothing changed
    AlreadyFollowing { follower: Url },
    /// Activity type this site does not act on
    Ignored { kind: ActivityKind },
}

pub struct InboxProcessor {
    followers: FollowerStore,
    /// One follower-list writer per host
    locks: KeyedLocks,
    queue: DeliveryQueue,
    actor: Url,
}

impl InboxProcessor {
    pub fn new(followers: FollowerStore, queue: DeliveryQueue, actor: Url) -> Self {
        Self {
            followers,
            locks: KeyedLocks::new(),
            queue,
            actor,
        }
    }

    /// Handle one activity delivered to the inbox of `host`
    ///
    /// # Errors
    /// `Validation` when the body is not an activity; follower-list
    /// load/save failures are propagated.
    pub async fn handle_inbound(&self, host: &str, body: &[u8]) -> Result<InboxOutcome, AppError> {
        let activity: Activity = serde_json::from_slice(body)
            .map_err(|e| AppError::Validation(format!("Malformed activity: {}", e)))?;

        ACTIVITYPUB_ACTIVITIES_RECEIVED
            .with_label_values(&[activity.kind.as_str()])
            .inc();

        match activity.kind {
            ActivityKind::Follow => self.handle_follow(host, activity).await,
            kind => {
                tracing::info!(
                    host,
                    activity_type = kind.as_str(),
                    activity_id = ?activity.id.as_ref().map(Url::as_str),
                    "Ignoring inbound activity"
                );
                Ok(InboxOutcome::Ignored { kind })
            }
        }
    }

    async fn handle_follow(&self, host: &str, follow: Activity) -> Result<InboxOutcome, AppError> {
        let follower = follow
            .actor_iri()
            .ok_or_else(|| AppError::Validation("Follow has no actor".to_string()))?;

        let _guard = self.locks.lock(host).await;

        let mut list = self.followers.load(host).await?;
        if !list.add(follower.clone()) {
            tracing::info!(host, follower = %follower, "Already following");
            return Ok(InboxOutcome::AlreadyFollowing { follower });
        }
        self.followers.save(host, &list).await?;
        FOLLOWERS_TOTAL.set(i64::try_from(list.len()).unwrap_or(i64::MAX));
        tracing::info!(host, follower = %follower, total = list.len(), "Follower added");

        let accept = builder::accept(&self.actor, follow);
        // The follower stays recorded even if the Accept cannot be queued.
        if let Err(e) = self
            .queue
            .enqueue(accept, DeliveryTarget::ActorInbox(follower.clone()))
        {
            tracing::error!(follower = %follower, error = %e, "Failed to queue Accept");
        }

        Ok(InboxOutcome::FollowAccepted { follower })
    }
}
