//! Activity delivery
//!
//! `ActivityDispatcher` POSTs one signed activity to one inbox. Callers
//! normally go through `DeliveryQueue`, whose worker retries failed
//! deliveries with exponential backoff.

use std::sync::Arc;
use std::time::Duration;

use reqwest::StatusCode;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use url::Url;

use super::client::{FederationClient, FetchError};
use super::model::{ACTIVITYSTREAMS_CONTEXT, Activity};
use crate::config::DeliveryConfig;
use crate::metrics::{ACTIVITYPUB_ACTIVITIES_SENT, DELIVERY_RETRIES_TOTAL};

/// Delivery failures
#[derive(Debug, Error)]
pub enum DeliveryError {
    /// The inbox answered with a non-2xx status
    #[error("{inbox} rejected activity: HTTP {status}")]
    Rejected { inbox: Url, status: StatusCode },

    #[error(transparent)]
    Transport(FetchError),

    #[error("failed to serialize activity: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("could not find an inbox for {actor}: {reason}")]
    InboxDiscovery { actor: Url, reason: String },

    #[error("delivery queue is full")]
    QueueFull,

    #[error("delivery queue is closed")]
    QueueClosed,
}

impl DeliveryError {
    /// Worth another attempt later
    pub fn is_retryable(&self) -> bool {
        match self {
            DeliveryError::Rejected { status, .. } => {
                status.is_server_error()
                    || *status == StatusCode::TOO_MANY_REQUESTS
                    || *status == StatusCode::REQUEST_TIMEOUT
            }
            DeliveryError::Transport(e) => e.is_unreachable(),
            DeliveryError::InboxDiscovery { .. } => true,
            DeliveryError::Serialize(_) | DeliveryError::QueueFull | DeliveryError::QueueClosed => {
                false
            }
        }
    }
}

impl From<FetchError> for DeliveryError {
    fn from(err: FetchError) -> Self {
        match err {
            FetchError::Status { iri, status } => DeliveryError::Rejected { inbox: iri, status },
            other => DeliveryError::Transport(other),
        }
    }
}

/// Where an activity should go
#[derive(Debug, Clone, PartialEq)]
pub enum DeliveryTarget {
    /// A known inbox URI
    Inbox(Url),
    /// An actor whose `inbox` is looked up at delivery time
    ActorInbox(Url),
}

/// Sends single activities to single inboxes
#[derive(Clone)]
pub struct ActivityDispatcher {
    client: FederationClient,
}

impl ActivityDispatcher {
    pub fn new(client: FederationClient) -> Self {
        Self { client }
    }

    /// POST `activity` to `inbox`, signed as the local actor
    ///
    /// # Errors
    /// `Rejected` for a non-2xx answer, `Transport` when the inbox is
    /// unreachable or the request cannot be signed.
    pub async fn dispatch(&self, activity: &Activity, inbox: &Url) -> Result<(), DeliveryError> {
        let body = serialize_with_context(activity)?;
        let status = self.client.post_activity(inbox, body).await?;

        ACTIVITYPUB_ACTIVITIES_SENT
            .with_label_values(&[activity.kind.as_str()])
            .inc();
        tracing::info!(
            inbox = %inbox,
            activity_type = activity.kind.as_str(),
            status = %status,
            "Delivered activity"
        );
        Ok(())
    }

    /// Deliver to `target`, looking up the actor's inbox first if needed
    pub async fn deliver(&self, activity: &Activity, target: &DeliveryTarget) -> Result<(), DeliveryError> {
        let inbox = match target {
            DeliveryTarget::Inbox(inbox) => inbox.clone(),
            DeliveryTarget::ActorInbox(actor) => self.discover_inbox(actor).await?,
        };
        self.dispatch(activity, &inbox).await
    }

    /// `inbox` of the actor document, else `endpoints.sharedInbox`
    pub async fn discover_inbox(&self, actor: &Url) -> Result<Url, DeliveryError> {
        let document = self
            .client
            .get_json(actor)
            .await
            .map_err(|e| DeliveryError::InboxDiscovery {
                actor: actor.clone(),
                reason: e.to_string(),
            })?;

        inbox_of(&document).ok_or_else(|| DeliveryError::InboxDiscovery {
            actor: actor.clone(),
            reason: "actor document has no inbox".to_string(),
        })
    }
}

fn inbox_of(actor: &Value) -> Option<Url> {
    actor
        .get("inbox")
        .and_then(Value::as_str)
        .or_else(|| {
            actor
                .get("endpoints")
                .and_then(|e| e.get("sharedInbox"))
                .and_then(Value::as_str)
        })
        .and_then(|s| Url::parse(s).ok())
}

/// Activity JSON with the ActivityStreams `@context`
pub fn serialize_with_context(activity: &Activity) -> Result<Vec<u8>, serde_json::Error> {
    let mut document = serde_json::to_value(activity)?;
    if let Value::Object(map) = &mut document {
        map.entry("@context")
            .or_insert_with(|| Value::String(ACTIVITYSTREAMS_CONTEXT.to_string()));
    }
    serde_json::to_vec(&document)
}

/// Retry policy with exponential backoff
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Attempts after the first one
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            initial_delay: Duration::from_secs(30),
            max_delay: Duration::from_secs(3600),
            multiplier: 2.0,
        }
    }
}

impl From<&DeliveryConfig> for RetryPolicy {
    fn from(config: &DeliveryConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            initial_delay: Duration::from_secs(config.initial_delay_secs),
            max_delay: Duration::from_secs(config.max_delay_secs),
            multiplier: config.multiplier,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (0-indexed)
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt >= self.max_retries {
            return self.max_delay;
        }

        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let delay_secs = self.initial_delay.as_secs_f64() * self.multiplier.powi(exponent);
        let delay = Duration::try_from_secs_f64(delay_secs).unwrap_or(self.max_delay);

        delay.min(self.max_delay)
    }

    #[must_use]
    pub const fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_retries
    }
}

/// One queued delivery
#[derive(Debug, Clone)]
pub struct DeliveryJob {
    pub activity: Activity,
    pub target: DeliveryTarget,
}

/// Producer side of the outbound queue
#[derive(Clone)]
pub struct DeliveryQueue {
    sender: mpsc::Sender<DeliveryJob>,
}

/// Consumer side of the outbound queue
pub struct DeliveryReceiver {
    receiver: mpsc::Receiver<DeliveryJob>,
}

impl DeliveryReceiver {
    pub async fn recv(&mut self) -> Option<DeliveryJob> {
        self.receiver.recv().await
    }

    pub fn try_recv(&mut self) -> Option<DeliveryJob> {
        self.receiver.try_recv().ok()
    }
}

impl DeliveryQueue {
    pub fn channel(capacity: usize) -> (Self, DeliveryReceiver) {
        let (sender, receiver) = mpsc::channel(capacity);
        (Self { sender }, DeliveryReceiver { receiver })
    }

    /// Queue `activity` for delivery without waiting for it to be sent
    pub fn enqueue(&self, activity: Activity, target: DeliveryTarget) -> Result<(), DeliveryError> {
        let kind = activity.kind;
        self.sender
            .try_send(DeliveryJob { activity, target })
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => DeliveryError::QueueFull,
                mpsc::error::TrySendError::Closed(_) => DeliveryError::QueueClosed,
            })?;
        tracing::debug!(activity_type = kind.as_str(), "Activity queued for delivery");
        Ok(())
    }
}

/// Drains the queue, at most `max_concurrent` jobs in flight
pub struct DeliveryWorker {
    dispatcher: Arc<ActivityDispatcher>,
    receiver: DeliveryReceiver,
    retry: RetryPolicy,
    max_concurrent: usize,
}

impl DeliveryWorker {
    pub fn new(
        dispatcher: Arc<ActivityDispatcher>,
        receiver: DeliveryReceiver,
        retry: RetryPolicy,
        max_concurrent: usize,
    ) -> Self {
        Self {
            dispatcher,
            receiver,
            retry,
            max_concurrent: max_concurrent.max(1),
        }
    }

    /// Run until every `DeliveryQueue` handle has been dropped and the
    /// jobs already taken from the queue have finished.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) {
        tracing::info!(max_concurrent = self.max_concurrent, "Delivery worker started");
        let mut in_flight = JoinSet::new();

        loop {
            tokio::select! {
                Some(done) = in_flight.join_next(), if !in_flight.is_empty() => {
                    log_join_failure(done);
                }
                job = self.receiver.recv(), if in_flight.len() < self.max_concurrent => {
                    let Some(job) = job else { break };
                    let dispatcher = self.dispatcher.clone();
                    let retry = self.retry.clone();
                    in_flight.spawn(async move {
                        deliver_with_retry(&dispatcher, &job, &retry).await;
                    });
                }
            }
        }

        tracing::info!(pending = in_flight.len(), "Delivery queue closed; finishing in-flight jobs");
        while let Some(done) = in_flight.join_next().await {
            log_join_failure(done);
        }
        tracing::info!("Delivery worker stopped");
    }
}

fn log_join_failure(done: Result<(), tokio::task::JoinError>) {
    if let Err(e) = done {
        tracing::error!(error = %e, "Delivery task failed");
    }
}

/// Returns whether the job was eventually delivered.
pub async fn deliver_with_retry(
    dispatcher: &ActivityDispatcher,
    job: &DeliveryJob,
    retry: &RetryPolicy,
) -> bool {
    let mut attempt = 0;
    loop {
        match dispatcher.deliver(&job.activity, &job.target).await {
            Ok(()) => {
                if attempt > 0 {
                    DELIVERY_RETRIES_TOTAL.with_label_values(&["delivered"]).inc();
                }
                return true;
            }
            Err(e) if e.is_retryable() && retry.should_retry(attempt) => {
                let delay = retry.delay_for_attempt(attempt);
                tracing::warn!(
                    target_inbox = ?job.target,
                    attempt = attempt + 1,
                    delay_secs = delay.as_secs_f64(),
                    error = %e,
                    "Delivery failed; retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => {
                if attempt > 0 {
                    DELIVERY_RETRIES_TOTAL.with_label_values(&["abandoned"]).inc();
                }
                tracing::error!(
                    target_inbox = ?job.target,
                    activity_id = ?job.activity.id.as_ref().map(Url::as_str),
                    attempts = attempt + 1,
                    error = %e,
                    "Delivery abandoned"
                );
                return false;
            }
        }
    }
}

/// Activity constructors
pub mod builder {
    use chrono::Utc;
    use url::Url;

    use crate::federation::model::{Activity, ActivityKind, ActivityObject, ApObject};

    /// Fresh activity id on the actor's host
    pub fn activity_id(actor: &Url) -> Url {
        let mut id = actor.clone();
        id.set_path(&format!("/activities/{}", ulid::Ulid::new().to_string().to_lowercase()));
        id.set_query(None);
        id.set_fragment(None);
        id
    }

    /// Accept wrapping `follow` by value, addressed to the follower
    pub fn accept(actor: &Url, follow: Activity) -> Activity {
        let follower = follow.actor_iri();
        let mut accept = Activity::new(
            ActivityKind::Accept,
            activity_id(actor),
            actor.clone(),
            ActivityObject::Activity(Box::new(follow)),
        );
        accept.to = follower.into_iter().map(String::from).collect();
        accept
    }

    /// Create for `object`, inheriting its audience
    pub fn create(actor: &Url, id: Url, object: ApObject) -> Activity {
        let to = object.to.clone();
        let cc = object.cc.clone();
        let mut create = Activity::new(
            ActivityKind::Create,
            id,
            actor.clone(),
            ActivityObject::Object(Box::new(object)),
        );
        create.to = to;
        create.cc = cc;
        create.published = Some(Utc::now());
        create
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::federation::model::{ActivityKind, ActivityObject};
    use serde_json::json;

    fn url(s: &str) -> Url {
        Url::parse(s).expect("url")
    }

    fn follow() -> Activity {
        serde_json::from_value(json!({
            "id": "https://a.example/follows/1",
            "type": "Follow",
            "actor": "https://a.example/users/bob",
            "object": "https://blog.example/ap.jsonld"
        }))
        .expect("follow")
    }

    #[test]
    fn exponential_backoff() {
        let policy = RetryPolicy {
            max_retries: 5,
            initial_delay: Duration::from_secs(60),
            max_delay: Duration::from_secs(3600),
            multiplier: 2.0,
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_secs(60));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(120));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(240));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_secs(960));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_secs(3600));
    }

    #[test]
    fn backoff_is_capped() {
        let policy = RetryPolicy {
            max_retries: 10,
            initial_delay: Duration::from_secs(3600),
            max_delay: Duration::from_secs(7200),
            multiplier: 2.0,
        };
        assert_eq!(policy.delay_for_attempt(5), Duration::from_secs(7200));
        assert!(policy.should_retry(9));
        assert!(!policy.should_retry(10));
    }

    #[test]
    fn client_errors_are_not_retried() {
        let rejected = |status| DeliveryError::Rejected {
            inbox: url("https://a.example/inbox"),
            status,
        };
        assert!(!rejected(StatusCode::FORBIDDEN).is_retryable());
        assert!(!rejected(StatusCode::BAD_REQUEST).is_retryable());
        assert!(rejected(StatusCode::SERVICE_UNAVAILABLE).is_retryable());
        assert!(rejected(StatusCode::TOO_MANY_REQUESTS).is_retryable());
    }

    #[test]
    fn status_fetch_error_becomes_rejected() {
        let err: DeliveryError = FetchError::Status {
            iri: url("https://a.example/inbox"),
            status: StatusCode::UNAUTHORIZED,
        }
        .into();
        assert!(matches!(
            err,
            DeliveryError::Rejected { status: StatusCode::UNAUTHORIZED, .. }
        ));
    }

    #[test]
    fn serialized_activity_carries_context() {
        let body = serialize_with_context(&follow()).expect("serialized");
        let value: Value = serde_json::from_slice(&body).expect("json");
        assert_eq!(value["@context"], ACTIVITYSTREAMS_CONTEXT);
        assert_eq!(value["type"], "Follow");
    }

    #[test]
    fn accept_wraps_follow_by_value() {
        let actor = url("https://blog.example/ap.jsonld");
        let accept = builder::accept(&actor, follow());

        assert_eq!(accept.kind, ActivityKind::Accept);
        assert_eq!(accept.actor_iri(), Some(actor));
        assert_eq!(accept.to, ["https://a.example/users/bob"]);
        assert!(accept
            .id
            .as_ref()
            .is_some_and(|id| id.as_str().starts_with("https://blog.example/activities/")));
        match accept.object {
            Some(ActivityObject::Activity(inner)) => {
                assert_eq!(inner.id, Some(url("https://a.example/follows/1")))
            }
            other => panic!("expected embedded follow, got {other:?}"),
        }
    }

    #[test]
    fn activity_ids_are_unique() {
        let actor = url("https://blog.example/ap.jsonld");
        assert_ne!(builder::activity_id(&actor), builder::activity_id(&actor));
    }

    #[test]
    fn inbox_falls_back_to_shared_inbox() {
        let personal = json!({"inbox": "https://a.example/users/bob/inbox"});
        assert_eq!(inbox_of(&personal), Some(url("https://a.example/users/bob/inbox")));
        let shared = json!({"endpoints": {"sharedInbox": "https://a.example/inbox"}});
        assert_eq!(inbox_of(&shared), Some(url("https://a.example/inbox")));
        assert_eq!(inbox_of(&json!({})), None);
    }

    #[tokio::test]
    async fn first_attempt_failure_is_not_a_retry() {
        let identity = crate::federation::SigningIdentity::from_pem(
            include_str!("../../tests/common/actor_key.pem"),
            url("https://blog.example/ap.jsonld"),
        )
        .expect("identity");
        let client = FederationClient::new(reqwest::Client::new(), Arc::new(identity), false);
        let dispatcher = ActivityDispatcher::new(client);
        let job = DeliveryJob {
            activity: follow(),
            target: DeliveryTarget::Inbox(url("http://127.0.0.1:9/inbox")),
        };
        let abandoned = || DELIVERY_RETRIES_TOTAL.with_label_values(&["abandoned"]).get();
        let before = abandoned();

        let delivered = deliver_with_retry(&dispatcher, &job, &RetryPolicy::default()).await;

        assert!(!delivered);
        assert_eq!(abandoned(), before);
    }

    #[tokio::test]
    async fn full_queue_is_reported() {
        let (queue, mut receiver) = DeliveryQueue::channel(1);
        let target = DeliveryTarget::Inbox(url("https://a.example/inbox"));

        queue.enqueue(follow(), target.clone()).expect("first fits");
        assert!(matches!(
            queue.enqueue(follow(), target.clone()),
            Err(DeliveryError::QueueFull)
        ));

        let job = receiver.recv().await.expect("job");
        assert_eq!(job.target, target);
    }
}
