//! Cluster member identity.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Opaque, cluster-unique, comparable member identity.
///
/// By convention a node id reads `name@host`; two nodes with equal ids
/// are the same logical member. Ordering is lexicographic and is what
/// placement uses to break ties.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn from_parts(name: &str, host: &str) -> Self {
        Self(format!("{name}@{host}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The part before `@`, or the whole id when there is no `@`.
    pub fn name(&self) -> &str {
        self.0.split('@').next().unwrap_or(&self.0)
    }

    /// The part after `@`, if any.
    pub fn host(&self) -> Option<&str> {
        self.0.split_once('@').map(|(_, host)| host)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for NodeId {
    type Err = NodeIdParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(NodeIdParseError);
        }
        Ok(Self(s.to_owned()))
    }
}

impl Default for NodeId {
    fn default() -> Self {
        Self::from_parts("lattice", "localhost")
    }
}

/// Error returned when parsing an empty node id.
#[derive(Debug, Clone)]
pub struct NodeIdParseError;

impl fmt::Display for NodeIdParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("node id must be non-empty")
    }
}

impl std::error::Error for NodeIdParseError {}
