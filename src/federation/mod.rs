//! ActivityPub federation module
//!
//! Handles:
//! - Remote object resolution and the on-disk object cache
//! - Reply tree walking
//! - Activity delivery (outbox) with retries
//! - Inbound activities (inbox) and the follower list
//! - HTTP Signatures

pub mod cache;
pub mod client;
pub mod delivery;
pub mod followers;
pub mod inbox;
pub mod keys;
pub mod locks;
pub mod model;
pub mod resolver;
pub mod signature;
pub mod tree;

pub use cache::{CacheEntry, ObjectCache};
pub use client::{FederationClient, FetchError, ObjectFetcher};
pub use delivery::{
    ActivityDispatcher, DeliveryError, DeliveryQueue, DeliveryReceiver, DeliveryTarget,
    DeliveryWorker, RetryPolicy,
};
pub use followers::{FollowerList, FollowerStore};
pub use inbox::{InboxOutcome, InboxProcessor};
pub use keys::SigningIdentity;
pub use model::{Activity, ActivityKind, ActivityObject, ApObject, ObjectRef, RemoteObject};
pub use resolver::{ObjectResolver, ResolverOptions};
pub use signature::{ParsedSignature, SignatureError, parse_signature_header, sign_request};
pub use tree::ReplyTreeWalker;
