//! Peer protocol contract.
//!
//! Wire framing and encryption live outside this crate. The model sees a
//! peer through [`Connection`] (calls it issues) and the protocol layer
//! drives the model through [`ProtocolHandler`] (callbacks it receives).
//! Frames are length-delimited and delivered in FIFO order per
//! direction; nothing is guaranteed across peers.

use std::io;
use std::net::SocketAddr;
use std::time::SystemTime;

use crate::core::{FileInfo, NodeId, RepoId};
use crate::model::ModelError;

pub mod cluster;

pub use cluster::{
    ClusterConfigMessage, ClusterMismatchError, FLAG_SHARE_TRUSTED, NodeEntry, RepoEntry,
    compare_cluster_config,
};

/// Per-connection transfer counters.
#[derive(Clone, Copy, Debug)]
pub struct Statistics {
    pub at: SystemTime,
    pub in_bytes_total: u64,
    pub out_bytes_total: u64,
}

impl Default for Statistics {
    fn default() -> Self {
        Self {
            at: SystemTime::UNIX_EPOCH,
            in_bytes_total: 0,
            out_bytes_total: 0,
        }
    }
}

/// A live peer session.
///
/// Implementations serialize their own frames; calls may block for
/// network I/O and must be safe to issue from any thread.
pub trait Connection: Send + Sync {
    /// The remote peer's node id.
    fn id(&self) -> NodeId;

    /// Stream an index (full or batch) for `repo` to the peer.
    fn index(&self, repo: &RepoId, files: &[FileInfo]);

    /// Read a byte range of `name` from the peer's copy of `repo`.
    fn request(
        &self,
        repo: &RepoId,
        name: &str,
        offset: u64,
        size: u32,
    ) -> Result<Vec<u8>, ModelError>;

    /// Announce our cluster configuration.
    fn cluster_config(&self, msg: ClusterConfigMessage);

    fn statistics(&self) -> Statistics;
}

/// The transport underneath a [`Connection`]: closable, with an optional
/// peer address for reporting.
pub trait RawConnection: Send + Sync {
    fn close(&self) -> io::Result<()>;

    fn remote_addr(&self) -> Option<SocketAddr> {
        None
    }
}

/// Callbacks invoked by the protocol layer as frames arrive from a peer.
pub trait ProtocolHandler: Send + Sync {
    /// Full index replacing everything previously known for `(node, repo)`.
    fn index(&self, node: NodeId, repo: &RepoId, files: Vec<FileInfo>);

    /// Incremental index merged over the previous state.
    fn index_update(&self, node: NodeId, repo: &RepoId, files: Vec<FileInfo>);

    /// The peer's view of the shared cluster.
    fn cluster_config(&self, node: NodeId, msg: ClusterConfigMessage);

    /// Byte-range read of a local file on behalf of the peer.
    fn request(
        &self,
        node: NodeId,
        repo: &RepoId,
        name: &str,
        offset: u64,
        size: u32,
    ) -> Result<Vec<u8>, ModelError>;

    /// The connection is gone; `cause` is descriptive only.
    fn close(&self, node: NodeId, cause: &str);
}
