//! Core types shared by sources, feeds and the aggregation store.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Store-assigned document identifier.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DocumentId(pub String);

impl DocumentId {
    pub fn new(id: impl Into<String>) -> Self {
        DocumentId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DocumentId({})", self.0)
    }
}

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DocumentId {
    fn from(id: &str) -> Self {
        DocumentId(id.to_string())
    }
}

/// Microseconds since Unix epoch.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(transparent)]
pub struct Timestamp(pub i64);

impl Timestamp {
    pub fn from_secs(secs: i64) -> Self {
        Timestamp(secs * 1_000_000)
    }

    /// Whole seconds, rounded down.
    pub fn as_secs(self) -> i64 {
        self.0.div_euclid(1_000_000)
    }
}

impl fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Timestamp({})", self.0)
    }
}

/// Provisioning epoch of a feed. Bumped on every (re)provisioning so that
/// callbacks from retired listeners can be recognised and discarded.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(transparent)]
pub struct Generation(pub u64);

impl Generation {
    pub fn next(self) -> Self {
        Generation(self.0 + 1)
    }
}

impl fmt::Debug for Generation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Gen({})", self.0)
    }
}

/// Role of a member inside a group.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MemberRole {
    Admin,
    Moderator,
    #[default]
    Member,
}

impl MemberRole {
    pub fn as_str(self) -> &'static str {
        match self {
            MemberRole::Admin => "ADMIN",
            MemberRole::Moderator => "MODERATOR",
            MemberRole::Member => "MEMBER",
        }
    }
}

/// A document as delivered by a source.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Document {
    /// Document id, unique within its collection.
    pub id: DocumentId,

    /// Collection name (e.g. "groups", "posts", "members").
    pub collection: String,

    /// Id of the parent document for sub-collection documents
    /// (`groups/{parent}/members/{id}`).
    #[serde(default)]
    pub parent_id: Option<String>,

    /// Document fields.
    #[serde(default)]
    pub fields: Map<String, Value>,
}

impl Document {
    pub fn new(collection: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            id: DocumentId(id.into()),
            collection: collection.into(),
            parent_id: None,
            fields: Map::new(),
        }
    }

    /// Set the parent document id.
    pub fn with_parent(mut self, parent_id: impl Into<String>) -> Self {
        self.parent_id = Some(parent_id.into());
        self
    }

    /// Set a single field.
    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    /// Build a document from any serializable value. Objects become the field
    /// map; an `id` field in the value is dropped in favour of `id`.
    pub fn from_value(
        collection: impl Into<String>,
        id: impl Into<String>,
        value: &impl Serialize,
    ) -> Result<Self, serde_json::Error> {
        let mut doc = Self::new(collection, id);
        if let Value::Object(mut fields) = serde_json::to_value(value)? {
            fields.remove("id");
            doc.fields = fields;
        }
        Ok(doc)
    }

    /// Key identifying the document across a collection group:
    /// `parent/id` for sub-collection documents, the plain id otherwise.
    pub fn key(&self) -> DocumentId {
        match self.parent_id {
            Some(ref parent) => DocumentId(format!("{}/{}", parent, self.id.0)),
            None => self.id.clone(),
        }
    }

    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    pub fn str_field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).and_then(Value::as_str)
    }

    pub fn i64_field(&self, name: &str) -> Option<i64> {
        self.fields.get(name).and_then(Value::as_i64)
    }
}

/// One delivery worth of changes from a listener.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ChangeSet {
    /// Documents that entered the result set or changed.
    pub upserted: Vec<Document>,
    /// Documents that left the result set.
    pub removed: Vec<DocumentId>,
}

impl ChangeSet {
    pub fn upserts(docs: Vec<Document>) -> Self {
        Self {
            upserted: docs,
            removed: Vec::new(),
        }
    }

    pub fn removals(ids: Vec<DocumentId>) -> Self {
        Self {
            upserted: Vec::new(),
            removed: ids,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.upserted.is_empty() && self.removed.is_empty()
    }
}

/// Collection names used by the built-in queries.
pub mod collections {
    pub const MEMBERS: &str = "members";
    pub const GROUPS: &str = "groups";
    pub const POSTS: &str = "posts";
}

/// Approval status a post needs to appear in a feed.
pub const APPROVED: &str = "APPROVED";

/// Live query descriptor understood by a document source.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Query {
    /// Collection-group query over `members` where `userId == user_id`
    /// (and `role == role` when set).
    Memberships {
        user_id: String,
        role: Option<MemberRole>,
    },

    /// Documents in `groups` whose id is in `ids`.
    GroupsById { ids: Vec<String> },

    /// Documents in `posts` whose `groupId` is in `group_ids` and whose
    /// `approvalStatus` is `APPROVED`, newest first.
    ApprovedPosts { group_ids: Vec<String> },
}

impl Query {
    /// Collection the query reads from.
    pub fn collection(&self) -> &'static str {
        match self {
            Query::Memberships { .. } => collections::MEMBERS,
            Query::GroupsById { .. } => collections::GROUPS,
            Query::ApprovedPosts { .. } => collections::POSTS,
        }
    }

    /// Number of keys in the `IN` clause, if any.
    pub fn key_count(&self) -> usize {
        match self {
            Query::Memberships { .. } => 0,
            Query::GroupsById { ids } => ids.len(),
            Query::ApprovedPosts { group_ids } => group_ids.len(),
        }
    }

    /// Check if a document satisfies this query.
    pub fn matches(&self, doc: &Document) -> bool {
        if doc.collection != self.collection() {
            return false;
        }

        match self {
            Query::Memberships { user_id, role } => {
                if doc.str_field("userId") != Some(user_id.as_str()) {
                    return false;
                }
                match role {
                    Some(role) => doc.str_field("role") == Some(role.as_str()),
                    None => true,
                }
            }
            Query::GroupsById { ids } => ids.iter().any(|id| id == doc.id.as_str()),
            Query::ApprovedPosts { group_ids } => {
                let in_groups = doc
                    .str_field("groupId")
                    .is_some_and(|gid| group_ids.iter().any(|g| g == gid));
                in_groups && doc.str_field("approvalStatus") == Some(APPROVED)
            }
        }
    }
}
