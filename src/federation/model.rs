//! ActivityStreams vocabulary used by the federation layer
//!
//! Only the properties this site reads or writes are typed; everything
//! else a remote server sends is kept in `extra` so cached objects
//! round-trip without loss.

use chrono::{DateTime, Utc};
use serde::de::{DeserializeOwned, Deserializer};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use url::Url;

/// JSON-LD context attached to every outbound document
pub const ACTIVITYSTREAMS_CONTEXT: &str = "https://www.w3.org/ns/activitystreams";

/// Special collection addressing everyone
pub const PUBLIC_COLLECTION: &str = "https://www.w3.org/ns/activitystreams#Public";

/// Media type for federation requests and responses
pub const ACTIVITY_JSON: &str = "application/activity+json";

/// Content of the object cached in place of one that failed to load
pub const PLACEHOLDER_CONTENT: &str = "Failed to load entry";

/// Reference to another object: an IRI or the embedded object itself
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ObjectRef<T = Value> {
    Iri(Url),
    Object(Box<T>),
}

impl<T: Identified> ObjectRef<T> {
    /// IRI of the referenced object; `None` for embedded objects without an id.
    pub fn iri(&self) -> Option<Url> {
        match self {
            ObjectRef::Iri(iri) => Some(iri.clone()),
            ObjectRef::Object(object) => object.object_id(),
        }
    }
}

/// Anything that may carry an `id`
pub trait Identified {
    fn object_id(&self) -> Option<Url>;
}

impl Identified for Value {
    /// `id` of an object, or `href` of a `Link`
    fn object_id(&self) -> Option<Url> {
        let raw = if self.get("type").and_then(Value::as_str) == Some("Link") {
            self.get("href")
        } else {
            self.get("id")
        };
        raw.and_then(Value::as_str)
            .and_then(|s| Url::parse(s).ok())
    }
}

/// Generic ActivityStreams object (Note, Article, Person, ...)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApObject {
    #[serde(rename = "@context", default, skip_serializing_if = "Option::is_none")]
    pub context: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Url>,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub in_reply_to: Option<ObjectRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attributed_to: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub published: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated: Option<String>,
    #[serde(default, deserialize_with = "one_or_many", skip_serializing_if = "Vec::is_empty")]
    pub to: Vec<String>,
    #[serde(default, deserialize_with = "one_or_many", skip_serializing_if = "Vec::is_empty")]
    pub cc: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replies: Option<ObjectRef<Collection>>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Identified for ApObject {
    fn object_id(&self) -> Option<Url> {
        self.id.clone()
    }
}

impl ApObject {
    /// Bare object of the given type
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            context: None,
            id: None,
            kind: kind.into(),
            name: None,
            content: None,
            in_reply_to: None,
            attributed_to: None,
            url: None,
            published: None,
            updated: None,
            to: Vec::new(),
            cc: Vec::new(),
            replies: None,
            extra: Map::new(),
        }
    }

    /// Stand-in for an object that could not be fetched
    pub fn placeholder(iri: &Url) -> Self {
        let mut object = Self::new("Note");
        object.id = Some(iri.clone());
        object.content = Some(PLACEHOLDER_CONTENT.to_string());
        object
    }

    pub fn is_placeholder(&self) -> bool {
        self.kind == "Note" && self.content.as_deref() == Some(PLACEHOLDER_CONTENT)
    }

    /// Reply IRIs, once `replies` has been flattened into an inline collection
    pub fn reply_iris(&self) -> Vec<Url> {
        match &self.replies {
            Some(ObjectRef::Object(collection)) => collection
                .ordered_items
                .iter()
                .chain(collection.items.iter())
                .filter_map(ObjectRef::iri)
                .collect(),
            _ => Vec::new(),
        }
    }

    /// Permalink of the human-readable page, if any
    pub fn html_permalink(&self) -> Option<Url> {
        self.url.as_ref().and_then(html_link)
    }
}

fn html_link(value: &Value) -> Option<Url> {
    match value {
        Value::String(s) => Url::parse(s).ok(),
        Value::Array(links) => links.iter().find_map(html_link),
        Value::Object(link) => {
            let media_type = link.get("mediaType").and_then(Value::as_str);
            if media_type.is_some_and(|m| m != "text/html") {
                return None;
            }
            link.get("href")
                .and_then(Value::as_str)
                .and_then(|s| Url::parse(s).ok())
        }
        _ => None,
    }
}

/// `Collection` / `OrderedCollection`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Collection {
    #[serde(rename = "@context", default, skip_serializing_if = "Option::is_none")]
    pub context: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Url>,
    #[serde(rename = "type", default = "default_collection_kind")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attributed_to: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_items: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first: Option<ObjectRef<CollectionPage>>,
    #[serde(default, deserialize_with = "one_or_many", skip_serializing_if = "Vec::is_empty")]
    pub items: Vec<ObjectRef>,
    #[serde(default, deserialize_with = "one_or_many", skip_serializing_if = "Vec::is_empty")]
    pub ordered_items: Vec<ObjectRef>,
}

fn default_collection_kind() -> String {
    "Collection".to_string()
}

impl Identified for Collection {
    fn object_id(&self) -> Option<Url> {
        self.id.clone()
    }
}

impl Collection {
    /// Inline `OrderedCollection` of IRIs with a matching `totalItems`
    pub fn ordered(id: Option<Url>, iris: Vec<Url>) -> Self {
        Self {
            context: None,
            id,
            kind: "OrderedCollection".to_string(),
            attributed_to: None,
            total_items: Some(iris.len() as u64),
            first: None,
            items: Vec::new(),
            ordered_items: iris.into_iter().map(ObjectRef::Iri).collect(),
        }
    }
}

/// `CollectionPage` / `OrderedCollectionPage`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectionPage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Url>,
    #[serde(rename = "type", default = "default_page_kind")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next: Option<ObjectRef<CollectionPage>>,
    #[serde(default, deserialize_with = "one_or_many", skip_serializing_if = "Vec::is_empty")]
    pub items: Vec<ObjectRef>,
    #[serde(default, deserialize_with = "one_or_many", skip_serializing_if = "Vec::is_empty")]
    pub ordered_items: Vec<ObjectRef>,
}

fn default_page_kind() -> String {
    "CollectionPage".to_string()
}

impl Identified for CollectionPage {
    fn object_id(&self) -> Option<Url> {
        self.id.clone()
    }
}

/// Activity types this site acts on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActivityKind {
    Create,
    Follow,
    Accept,
    #[serde(other)]
    Unknown,
}

impl ActivityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActivityKind::Create => "Create",
            ActivityKind::Follow => "Follow",
            ActivityKind::Accept => "Accept",
            ActivityKind::Unknown => "Unknown",
        }
    }
}

/// An activity received or sent by this site
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Activity {
    #[serde(rename = "@context", default, skip_serializing_if = "Option::is_none")]
    pub context: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Url>,
    #[serde(rename = "type")]
    pub kind: ActivityKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actor: Option<ObjectRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object: Option<ActivityObject>,
    #[serde(default, deserialize_with = "one_or_many", skip_serializing_if = "Vec::is_empty")]
    pub to: Vec<String>,
    #[serde(default, deserialize_with = "one_or_many", skip_serializing_if = "Vec::is_empty")]
    pub cc: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub published: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Activity {
    pub fn new(kind: ActivityKind, id: Url, actor: Url, object: ActivityObject) -> Self {
        Self {
            context: None,
            id: Some(id),
            kind,
            actor: Some(ObjectRef::Iri(actor)),
            object: Some(object),
            to: Vec::new(),
            cc: Vec::new(),
            published: None,
            extra: Map::new(),
        }
    }

    pub fn actor_iri(&self) -> Option<Url> {
        self.actor.as_ref().and_then(ObjectRef::iri)
    }
}

/// `object` of an activity: an IRI, a nested activity, or a plain object
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ActivityObject {
    Iri(Url),
    Activity(Box<Activity>),
    Object(Box<ApObject>),
}

/// Types decoded as a nested [`Activity`] rather than a plain object
const ACTIVITY_TYPES: &[&str] = &[
    "Accept", "Add", "Announce", "Block", "Create", "Delete", "Follow", "Like", "Move", "Reject",
    "Remove", "Undo", "Update",
];

impl<'de> Deserialize<'de> for ActivityObject {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        use serde::de::Error;

        let value = Value::deserialize(deserializer)?;
        match &value {
            Value::String(iri) => Url::parse(iri)
                .map(ActivityObject::Iri)
                .map_err(D::Error::custom),
            Value::Object(map) => {
                let is_activity = map
                    .get("type")
                    .and_then(Value::as_str)
                    .is_some_and(|t| ACTIVITY_TYPES.contains(&t));
                if is_activity {
                    serde_json::from_value(value)
                        .map(|a| ActivityObject::Activity(Box::new(a)))
                        .map_err(D::Error::custom)
                } else {
                    serde_json::from_value(value)
                        .map(|o| ActivityObject::Object(Box::new(o)))
                        .map_err(D::Error::custom)
                }
            }
            other => Err(D::Error::custom(format!(
                "activity object must be an IRI or an object, got {other}"
            ))),
        }
    }
}

/// Materialized reply tree node returned to callers
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteObject {
    pub id: Option<Url>,
    #[serde(rename = "type")]
    pub kind: String,
    pub name: Option<String>,
    /// Sanitized HTML
    pub content: Option<String>,
    pub in_reply_to: Option<Url>,
    pub html_uri: Option<Url>,
    pub placeholder: bool,
    pub replies: Vec<RemoteObject>,
}

impl RemoteObject {
    /// Leaf node for `object`; children are attached by the tree walker
    pub fn from_object(object: &ApObject) -> Self {
        Self {
            id: object.id.clone(),
            kind: object.kind.clone(),
            name: object.name.clone(),
            content: object.content.as_deref().map(sanitize_remote_html),
            in_reply_to: object.in_reply_to.as_ref().and_then(ObjectRef::iri),
            html_uri: object.html_permalink(),
            placeholder: object.is_placeholder(),
            replies: Vec::new(),
        }
    }

    /// Number of nodes in this subtree, including `self`
    pub fn size(&self) -> usize {
        1 + self.replies.iter().map(RemoteObject::size).sum::<usize>()
    }
}

/// Strip scripts and unsafe markup from remote HTML
pub fn sanitize_remote_html(html: &str) -> String {
    ammonia::clean(html)
}

#[derive(Deserialize)]
#[serde(untagged)]
enum OneOrMany<T> {
    Many(Vec<T>),
    One(T),
}

/// Accepts a single value, an array, or null
fn one_or_many<'de, D, T>(deserializer: D) -> Result<Vec<T>, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned,
{
    Ok(match Option::<OneOrMany<T>>::deserialize(deserializer)? {
        None => Vec::new(),
        Some(OneOrMany::Many(values)) => values,
        Some(OneOrMany::One(value)) => vec![value],
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn object_ref_prefers_link_href() {
        let link: ObjectRef = serde_json::from_value(json!({
            "type": "Link",
            "href": "https://a.example/notes/1"
        }))
        .expect("link");
        assert_eq!(
            link.iri().map(String::from),
            Some("https://a.example/notes/1".to_string())
        );

        let embedded: ObjectRef = serde_json::from_value(json!({
            "type": "Note",
            "id": "https://a.example/notes/2"
        }))
        .expect("embedded");
        assert_eq!(
            embedded.iri().map(String::from),
            Some("https://a.example/notes/2".to_string())
        );
    }

    #[test]
    fn unknown_properties_survive_a_round_trip() {
        let raw = json!({
            "id": "https://a.example/notes/1",
            "type": "Note",
            "content": "<p>hi</p>",
            "sensitive": false,
            "tag": [{"type": "Hashtag", "name": "#rust"}]
        });
        let object: ApObject = serde_json::from_value(raw.clone()).expect("object");
        assert_eq!(serde_json::to_value(&object).expect("value"), raw);
    }

    #[test]
    fn audience_accepts_single_string() {
        let object: ApObject = serde_json::from_value(json!({
            "type": "Note",
            "to": PUBLIC_COLLECTION
        }))
        .expect("object");
        assert_eq!(object.to, vec![PUBLIC_COLLECTION.to_string()]);
    }

    #[test]
    fn follow_object_decodes_as_nested_activity() {
        let accept: Activity = serde_json::from_value(json!({
            "type": "Accept",
            "actor": "https://blog.example/ap.jsonld",
            "object": {
                "id": "https://a.example/follows/1",
                "type": "Follow",
                "actor": "https://a.example/users/bob",
                "object": "https://blog.example/ap.jsonld"
            }
        }))
        .expect("accept");
        match accept.object {
            Some(ActivityObject::Activity(follow)) => {
                assert_eq!(follow.kind, ActivityKind::Follow)
            }
            other => panic!("expected nested Follow, got {other:?}"),
        }
    }

    #[test]
    fn unrecognized_activity_type_is_unknown() {
        let activity: Activity =
            serde_json::from_value(json!({"type": "EmojiReact", "actor": "https://a.example/u"}))
                .expect("activity");
        assert_eq!(activity.kind, ActivityKind::Unknown);
    }

    #[test]
    fn html_permalink_picks_text_html_link() {
        let object: ApObject = serde_json::from_value(json!({
            "type": "Note",
            "url": [
                {"type": "Link", "mediaType": "application/activity+json", "href": "https://a.example/n/1.json"},
                {"type": "Link", "mediaType": "text/html", "href": "https://a.example/n/1"}
            ]
        }))
        .expect("object");
        assert_eq!(
            object.html_permalink().map(String::from),
            Some("https://a.example/n/1".to_string())
        );
    }

    #[test]
    fn remote_object_content_is_sanitized() {
        let mut object = ApObject::new("Note");
        object.content = Some("<p>hello</p><script>alert(1)</script>".to_string());
        let node = RemoteObject::from_object(&object);
        assert_eq!(node.content.as_deref(), Some("<p>hello</p>"));
    }

    #[test]
    fn placeholder_is_recognized() {
        let iri = Url::parse("https://a.example/notes/9").expect("url");
        let placeholder = ApObject::placeholder(&iri);
        assert!(placeholder.is_placeholder());
        assert_eq!(placeholder.kind, "Note");
        assert_eq!(placeholder.id, Some(iri));
    }
}
