//! Items aggregated by feeds and the queries that drive them.

use crate::error::Result;
use crate::types::{collections, Document, MemberRole, Query, Timestamp};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;

/// An entity a feed can aggregate.
///
/// Implementors say which dependent query serves a chunk of group ids and how
/// snapshots are ordered.
pub trait FeedItem: Clone + Send + Sync + 'static {
    /// Stable, store-assigned identity.
    fn id(&self) -> &str;

    /// Query serving one chunk of driving keys.
    fn dependent_query(chunk: Vec<String>) -> Query;

    /// Snapshot ordering. Must be a total order for distinct ids.
    fn feed_order(a: &Self, b: &Self) -> Ordering;

    /// Decode an item from a delivered document.
    fn from_document(doc: &Document) -> Result<Self>;
}

/// Decode a document into `T`, injecting the document id as `id`.
pub fn decode_document<T: DeserializeOwned>(doc: &Document) -> Result<T> {
    let mut fields = doc.fields.clone();
    fields.insert("id".to_string(), Value::String(doc.id.0.clone()));
    Ok(serde_json::from_value(Value::Object(fields))?)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GroupPrivacy {
    #[default]
    Public,
    Private,
}

/// A group the user belongs to or administers.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, Default)]
#[serde(default, rename_all = "camelCase")]
pub struct Group {
    pub id: String,
    pub name: String,
    pub description: String,
    pub avatar_url: Option<String>,
    pub owner_id: String,
    pub privacy: GroupPrivacy,
    pub require_post_approval: bool,
    pub member_count: u64,
    pub created_at: Timestamp,
}

impl FeedItem for Group {
    fn id(&self) -> &str {
        &self.id
    }

    fn dependent_query(chunk: Vec<String>) -> Query {
        Query::GroupsById { ids: chunk }
    }

    fn feed_order(a: &Self, b: &Self) -> Ordering {
        b.created_at
            .cmp(&a.created_at)
            .then_with(|| a.id.cmp(&b.id))
    }

    fn from_document(doc: &Document) -> Result<Self> {
        decode_document(doc)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ApprovalStatus {
    #[default]
    Approved,
    Pending,
    Rejected,
}

/// A post published inside a group.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, Default)]
#[serde(default, rename_all = "camelCase")]
pub struct Post {
    pub id: String,
    pub author_id: String,
    pub author_name: String,
    pub text: String,
    pub media_urls: Vec<String>,
    pub like_count: u64,
    pub comment_count: u64,
    pub created_at: Timestamp,
    /// Group the post belongs to; only used to route it to a driving key.
    pub group_id: Option<String>,
    pub approval_status: ApprovalStatus,
    pub is_pinned: bool,
}

impl FeedItem for Post {
    fn id(&self) -> &str {
        &self.id
    }

    fn dependent_query(chunk: Vec<String>) -> Query {
        Query::ApprovedPosts { group_ids: chunk }
    }

    fn feed_order(a: &Self, b: &Self) -> Ordering {
        b.created_at
            .cmp(&a.created_at)
            .then_with(|| a.id.cmp(&b.id))
    }

    fn from_document(doc: &Document) -> Result<Self> {
        decode_document(doc)
    }
}

/// A chat message, as returned by message search.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, Default)]
#[serde(default, rename_all = "camelCase")]
pub struct Message {
    /// Server id, or a locally generated UUID before confirmation.
    pub id: String,
    pub conversation_id: String,
    pub sender_id: String,
    pub sender_name: String,
    pub content: String,
    pub timestamp: Timestamp,
}

/// The driving query of a feed: whose memberships, and which ones.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DrivingQuery {
    pub user_id: String,
    /// Restrict to memberships with this role (e.g. groups the user administers).
    pub role: Option<MemberRole>,
}

impl DrivingQuery {
    /// Every group the user belongs to.
    pub fn member(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            role: None,
        }
    }

    /// Groups the user administers.
    pub fn admin(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            role: Some(MemberRole::Admin),
        }
    }

    pub fn to_query(&self) -> Query {
        Query::Memberships {
            user_id: self.user_id.clone(),
            role: self.role,
        }
    }
}

/// Driving key (group id) of a membership document: the parent group for
/// `groups/{gid}/members/{uid}`, falling back to the `groupId` field.
pub fn membership_key(doc: &Document) -> Option<String> {
    if doc.collection != collections::MEMBERS {
        return None;
    }
    doc.parent_id
        .clone()
        .or_else(|| doc.str_field("groupId").map(str::to_string))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_decode_post_from_document() {
        let doc = Document::from_value(
            "posts",
            "p1",
            &json!({
                "authorId": "u1",
                "text": "hello",
                "createdAt": 42,
                "groupId": "g1",
                "approvalStatus": "APPROVED"
            }),
        )
        .unwrap();

        let post = Post::from_document(&doc).unwrap();
        assert_eq!(post.id, "p1");
        assert_eq!(post.group_id.as_deref(), Some("g1"));
        assert_eq!(post.created_at, Timestamp(42));
        assert_eq!(post.like_count, 0);
    }

    #[test]
    fn test_decode_rejects_wrong_types() {
        let doc = Document::new("groups", "g1").with_field("memberCount", "many");
        assert!(Group::from_document(&doc).is_err());
    }

    #[test]
    fn test_post_order_newest_first() {
        let older = Post {
            id: "a".into(),
            created_at: Timestamp(1),
            ..Default::default()
        };
        let newer = Post {
            id: "b".into(),
            created_at: Timestamp(2),
            ..Default::default()
        };
        assert_eq!(Post::feed_order(&newer, &older), Ordering::Less);
    }

    #[test]
    fn test_membership_key_prefers_parent() {
        let doc = Document::new("members", "u1")
            .with_parent("g1")
            .with_field("groupId", "other");
        assert_eq!(membership_key(&doc).as_deref(), Some("g1"));

        let flat = Document::new("members", "m1").with_field("groupId", "g2");
        assert_eq!(membership_key(&flat).as_deref(), Some("g2"));

        assert_eq!(membership_key(&Document::new("groups", "g1")), None);
    }

    #[test]
    fn test_driving_query_presets() {
        assert_eq!(
            DrivingQuery::admin("u1").to_query(),
            Query::Memberships {
                user_id: "u1".into(),
                role: Some(MemberRole::Admin)
            }
        );
        assert_eq!(DrivingQuery::member("u1").role, None);
    }
}
