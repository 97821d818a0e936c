//! Identity types for the twin runtime
//!
//! Twins and adapters are identified by caller-supplied strings.
//! A twin id is unique within an engine; an adapter id is unique
//! within its twin.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Digital twin identity - unique within a twin engine
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TwinId(String);

impl TwinId {
    pub fn new(id: impl Into<String>) -> Self {
        TwinId(id.into())
    }

    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for TwinId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Twin({})", self.0)
    }
}

impl fmt::Display for TwinId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TwinId {
    fn from(id: &str) -> Self {
        TwinId::new(id)
    }
}

impl From<String> for TwinId {
    fn from(id: String) -> Self {
        TwinId(id)
    }
}

/// Adapter identity - unique within a twin
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AdapterId(String);

impl AdapterId {
    pub fn new(id: impl Into<String>) -> Self {
        AdapterId(id.into())
    }

    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for AdapterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Adapter({})", self.0)
    }
}

impl fmt::Display for AdapterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for AdapterId {
    fn from(id: &str) -> Self {
        AdapterId::new(id)
    }
}

impl From<String> for AdapterId {
    fn from(id: String) -> Self {
        AdapterId(id)
    }
}
