#![forbid(unsafe_code)]

//! Peer-to-peer file replication.
//!
//! Every node holds one or more repositories (directory trees) shared
//! with a declared set of peers. Each node scans its own tree, exchanges
//! indexes with its peers, and pulls whatever it is missing, so that all
//! peers sharing a repository converge on the latest version of every
//! file. The [`model::Model`] is the per-process orchestrator; the wire
//! protocol, block puller and admin surfaces live outside this crate and
//! talk to it through the contracts in [`protocol`] and [`pull`].

pub mod config;
pub mod core;
pub mod error;
pub mod model;
pub mod protocol;
pub mod pull;
pub mod scan;
pub mod telemetry;

pub use error::Error;
pub type Result<T> = std::result::Result<T, Error>;

// Re-export the working set at the crate root for convenience.
pub use crate::config::{Config, FileOrder, Options, RepoConfig};
pub use crate::core::{
    BlockInfo, FLAG_DELETED, FLAG_DIRECTORY, FLAG_INVALID, FLAG_PERM_MASK, FileInfo, LamportClock,
    NodeId, RepoId, ZERO_ENTRY_SIZE,
};
pub use crate::model::{
    ConnectionInfo, FileSet, Model, ModelError, ModelHandle, NeedCounts, RepoState, SizeCounts,
    Suppressor,
};
pub use crate::protocol::{
    ClusterConfigMessage, ClusterMismatchError, Connection, ProtocolHandler, RawConnection,
    Statistics,
};
pub use crate::pull::PullerFactory;
