//! Identity atoms.
//!
//! NodeId: fixed-width peer identifier
//! RepoId: repository name

use std::fmt;
use std::str::FromStr;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// Fixed-width node identifier (a public-key digest), totally ordered.
///
/// The all-ones value is reserved: [`NodeId::LOCAL`] denotes this
/// process's own entries and sorts after every real peer.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId([u8; 32]);

impl NodeId {
    /// Distinguished identity for this node's own file maps.
    pub const LOCAL: NodeId = NodeId([0xff; 32]);

    pub const fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum NodeIdError {
    #[error("node id must be 64 hex characters, got {got}")]
    BadLength { got: usize },
    #[error("node id contains non-hex character {ch:?}")]
    BadChar { ch: char },
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0 {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({self})")
    }
}

impl FromStr for NodeId {
    type Err = NodeIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != 64 {
            return Err(NodeIdError::BadLength { got: s.len() });
        }
        let mut bytes = [0u8; 32];
        for (i, chunk) in s.as_bytes().chunks(2).enumerate() {
            let hi = hex_val(chunk[0] as char)?;
            let lo = hex_val(chunk[1] as char)?;
            bytes[i] = hi << 4 | lo;
        }
        Ok(Self(bytes))
    }
}

fn hex_val(ch: char) -> Result<u8, NodeIdError> {
    ch.to_digit(16)
        .map(|v| v as u8)
        .ok_or(NodeIdError::BadChar { ch })
}

impl Serialize for NodeId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for NodeId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(D::Error::custom)
    }
}

/// Repository identifier - short printable string, unique per process.
#[derive(Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RepoId(String);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RepoIdError {
    #[error("repository id is empty")]
    Empty,
    #[error("repository id contains non-printable character {ch:?}")]
    BadChar { ch: char },
}

impl RepoId {
    pub fn parse(s: impl Into<String>) -> Result<Self, RepoIdError> {
        let s = s.into();
        if s.is_empty() {
            return Err(RepoIdError::Empty);
        }
        if let Some(ch) = s.chars().find(|c| c.is_control() || c.is_whitespace()) {
            return Err(RepoIdError::BadChar { ch });
        }
        Ok(Self(s))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for RepoId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for RepoId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RepoId({:?})", self.0)
    }
}
