//! Reap core types: object identity, change sets and collaborator traits.

#![forbid(unsafe_code)]

use std::fmt;

use serde::{Deserialize, Serialize};

pub mod codec;

pub use codec::{CompactCodec, IdentityCodec};

/// Version-independent identity of a managed object.
///
/// `namespace` is empty for cluster-scoped objects and `group` is empty for the core API group.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectId {
    pub namespace: String,
    pub name: String,
    pub group: String,
    pub kind: String,
}

impl ObjectId {
    pub fn new(
        namespace: impl Into<String>,
        name: impl Into<String>,
        group: impl Into<String>,
        kind: impl Into<String>,
    ) -> Self {
        Self { namespace: namespace.into(), name: name.into(), group: group.into(), kind: kind.into() }
    }

    /// First required identity field that is empty, if any.
    pub fn missing_field(&self) -> Option<&'static str> {
        if self.name.is_empty() {
            Some("name")
        } else if self.kind.is_empty() {
            Some("kind")
        } else {
            None
        }
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.namespace.is_empty() {
            write!(f, "{}/{}", self.kind, self.name)
        } else {
            write!(f, "{}/{}/{}", self.kind, self.namespace, self.name)
        }
    }
}

/// Fully qualified object reference, enough to address the object on a cluster.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObjRef {
    pub group: String,
    pub version: String,
    pub kind: String,
    pub namespace: Option<String>,
    pub name: String,
}

impl ObjRef {
    /// Rehydrate a reference from a decoded identity and the stored version string.
    ///
    /// The stored version may be a bare version (`v1`) or a full group/version (`apps/v1`).
    pub fn from_id(id: ObjectId, stored_version: &str) -> InventoryResult<Self> {
        let version = match stored_version.rsplit_once('/') {
            Some((_, v)) => v,
            None => stored_version,
        };
        if version.is_empty() {
            return Err(InventoryError::Parse {
                id: id.to_string(),
                reason: format!("invalid version {:?}", stored_version),
            });
        }
        Ok(Self {
            group: id.group,
            version: version.to_string(),
            kind: id.kind,
            namespace: if id.namespace.is_empty() { None } else { Some(id.namespace) },
            name: id.name,
        })
    }

    pub fn api_version(&self) -> String {
        if self.group.is_empty() {
            self.version.clone()
        } else {
            format!("{}/{}", self.group, self.version)
        }
    }

    pub fn id(&self) -> ObjectId {
        ObjectId {
            namespace: self.namespace.clone().unwrap_or_default(),
            name: self.name.clone(),
            group: self.group.clone(),
            kind: self.kind.clone(),
        }
    }
}

impl fmt::Display for ObjRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}/{}/{}", self.api_version(), self.kind, ns, self.name),
            None => write!(f, "{}/{}/{}", self.api_version(), self.kind, self.name),
        }
    }
}

/// Outcome of the operation that produced an [`Entry`].
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Created,
    Configured,
    Unchanged,
    Deleted,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Action::Created => "created",
            Action::Configured => "configured",
            Action::Unchanged => "unchanged",
            Action::Deleted => "deleted",
        };
        f.write_str(s)
    }
}

/// One managed object as reported by an apply or delete operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    pub id: ObjectId,
    /// API version the object was applied with.
    pub group_version: String,
    /// Display label; never used for matching.
    pub subject: String,
    pub action: Action,
}

impl Entry {
    pub fn new(id: ObjectId, group_version: impl Into<String>, action: Action) -> Self {
        let group_version = group_version.into();
        let subject = fmt_subject(&id, &group_version);
        Self { id, group_version, subject, action }
    }
}

/// Render `api_version/Kind/namespace/name`, dropping the namespace segment for cluster-scoped ids.
pub fn fmt_subject(id: &ObjectId, group_version: &str) -> String {
    let api_version = if id.group.is_empty() || group_version.contains('/') {
        group_version.to_string()
    } else {
        format!("{}/{}", id.group, group_version)
    };
    if id.namespace.is_empty() {
        format!("{}/{}/{}", api_version, id.kind, id.name)
    } else {
        format!("{}/{}/{}/{}", api_version, id.kind, id.namespace, id.name)
    }
}

/// Ordered, append-only batch of entries produced by one apply (or delete) operation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeSet {
    entries: Vec<Entry>,
}

impl ChangeSet {
    pub fn new() -> Self { Self::default() }

    pub fn add(&mut self, entry: Entry) { self.entries.push(entry); }

    pub fn append(&mut self, other: ChangeSet) { self.entries.extend(other.entries); }

    pub fn len(&self) -> usize { self.entries.len() }

    pub fn is_empty(&self) -> bool { self.entries.is_empty() }

    pub fn iter(&self) -> std::slice::Iter<'_, Entry> { self.entries.iter() }

    /// Number of entries carrying the given action.
    pub fn count(&self, action: Action) -> usize {
        self.entries.iter().filter(|e| e.action == action).count()
    }
}

impl FromIterator<Entry> for ChangeSet {
    fn from_iter<I: IntoIterator<Item = Entry>>(iter: I) -> Self {
        Self { entries: iter.into_iter().collect() }
    }
}

impl IntoIterator for ChangeSet {
    type Item = Entry;
    type IntoIter = std::vec::IntoIter<Entry>;

    fn into_iter(self) -> Self::IntoIter { self.entries.into_iter() }
}

impl<'a> IntoIterator for &'a ChangeSet {
    type Item = &'a Entry;
    type IntoIter = std::slice::Iter<'a, Entry>;

    fn into_iter(self) -> Self::IntoIter { self.entries.iter() }
}

impl fmt::Display for ChangeSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for e in &self.entries {
            writeln!(f, "{} {}", e.subject, e.action)?;
        }
        Ok(())
    }
}

/// Errors raised by inventory bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
pub enum InventoryError {
    #[error("invalid entry {subject:?}: missing {field}")]
    InvalidEntry { subject: String, field: String },
    #[error("parse error: cannot decode object id {id:?}: {reason}")]
    Parse { id: String, reason: String },
}

pub type InventoryResult<T> = Result<T, InventoryError>;

/// Produces a [`ChangeSet`] by applying desired objects to a cluster.
#[async_trait::async_trait]
pub trait ApplyEngine: Send + Sync {
    async fn apply(&self, objects: Vec<serde_json::Value>) -> anyhow::Result<ChangeSet>;
}

/// Removes stale objects from a cluster. Returned entries carry [`Action::Deleted`].
#[async_trait::async_trait]
pub trait Pruner: Send + Sync {
    async fn delete(&self, objects: &[ObjRef]) -> anyhow::Result<ChangeSet>;
}

pub mod prelude {
    pub use super::{
        Action, ApplyEngine, ChangeSet, CompactCodec, Entry, IdentityCodec, InventoryError, InventoryResult, ObjRef,
        ObjectId, Pruner,
    };
}
