//! Value types shared by every store.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Opaque version stamp of a document.
///
/// Every successful mutation assigns a new CAS. A write carrying an expected
/// CAS only succeeds while the document still has that CAS.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Cas(pub u64);

impl Cas {
    /// Creates a CAS from its raw value.
    #[must_use]
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// Returns the raw CAS value.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for Cas {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cas:{}", self.0)
    }
}

/// A keyspace: a collection inside a scope.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CollectionRef {
    /// Scope name.
    pub scope: String,
    /// Collection name.
    pub collection: String,
}

impl CollectionRef {
    /// Name of the scope used when none is given.
    pub const DEFAULT_SCOPE: &'static str = "_default";

    /// Creates a collection reference.
    pub fn new(scope: impl Into<String>, collection: impl Into<String>) -> Self {
        Self {
            scope: scope.into(),
            collection: collection.into(),
        }
    }

    /// Creates a reference to a collection in the default scope.
    pub fn in_default_scope(collection: impl Into<String>) -> Self {
        Self::new(Self::DEFAULT_SCOPE, collection)
    }
}

impl fmt::Display for CollectionRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.scope, self.collection)
    }
}

/// Durability requirement attached to a mutation.
///
/// Levels are ordered from weakest to strongest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub enum DurabilityLevel {
    /// Acknowledged once in memory on the active node.
    None,
    /// Replicated to a majority of nodes.
    #[default]
    Majority,
    /// Majority replicated and persisted on the active node.
    MajorityAndPersistToActive,
    /// Persisted on a majority of nodes.
    PersistToMajority,
}

/// A document as returned by [`crate::DocumentStore::read`].
#[derive(Debug, Clone, PartialEq)]
pub struct StoredDocument {
    /// Visible body. `None` marks a shadow document that carries only
    /// extended attributes.
    pub content: Option<Value>,
    /// Current CAS.
    pub cas: Cas,
    /// Extended attributes, if any.
    pub xattrs: Option<Value>,
}

impl StoredDocument {
    /// Returns true if the document has no visible body.
    #[must_use]
    pub fn is_shadow(&self) -> bool {
        self.content.is_none()
    }
}

/// The new state of a document passed to [`crate::DocumentStore::write`].
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentWrite {
    /// New body, or `None` to store a shadow document.
    pub content: Option<Value>,
    /// New extended attributes; replaces the previous set.
    pub xattrs: Option<Value>,
    /// Durability requirement.
    pub durability: DurabilityLevel,
}

impl DocumentWrite {
    /// A write of a visible body without extended attributes.
    pub fn body(content: Value) -> Self {
        Self {
            content: Some(content),
            xattrs: None,
            durability: DurabilityLevel::default(),
        }
    }

    /// A write of a shadow document carrying only extended attributes.
    pub fn shadow(xattrs: Value) -> Self {
        Self {
            content: None,
            xattrs: Some(xattrs),
            durability: DurabilityLevel::default(),
        }
    }

    /// A write with an optional body.
    pub fn new(content: Option<Value>, xattrs: Option<Value>) -> Self {
        Self {
            content,
            xattrs,
            durability: DurabilityLevel::default(),
        }
    }

    /// Sets the extended attributes.
    #[must_use]
    pub fn with_xattrs(mut self, xattrs: Option<Value>) -> Self {
        self.xattrs = xattrs;
        self
    }

    /// Sets the durability requirement.
    #[must_use]
    pub fn with_durability(mut self, durability: DurabilityLevel) -> Self {
        self.durability = durability;
        self
    }
}
