//! Cluster configuration handshake: message shape and comparison.
//!
//! Each side announces the repositories it shares with the peer and the
//! full membership of each share group. The two views must agree before
//! indexes are exchanged.

use std::collections::{BTreeMap, BTreeSet};

use thiserror::Error;

use crate::core::{NodeId, RepoId};

/// Node is a trusted member of the share group.
pub const FLAG_SHARE_TRUSTED: u32 = 1 << 0;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ClusterConfigMessage {
    pub client_name: String,
    pub client_version: String,
    pub repositories: Vec<RepoEntry>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RepoEntry {
    pub id: RepoId,
    pub nodes: Vec<NodeEntry>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodeEntry {
    pub id: NodeId,
    pub flags: u32,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ClusterMismatchError {
    #[error("cluster config mismatch: local announces {local} shared repositories, peer announces {remote}")]
    RepoCount { local: usize, remote: usize },
    #[error("cluster config mismatch: repository {repo} is not announced by the peer")]
    MissingRepo { repo: RepoId },
    #[error(
        "cluster config mismatch: repository {repo} is shared with {local} nodes locally and {remote} by the peer"
    )]
    NodeCount {
        repo: RepoId,
        local: usize,
        remote: usize,
    },
    #[error("cluster config mismatch: repository {repo} does not list node {node} on the peer")]
    MissingNode { repo: RepoId, node: NodeId },
}

/// Check that both sides agree on the set of shared repositories and,
/// per repository, on the set of sharing nodes. Client name and version
/// are informational and never compared.
pub fn compare_cluster_config(
    local: &ClusterConfigMessage,
    remote: &ClusterConfigMessage,
) -> Result<(), ClusterMismatchError> {
    if local.repositories.len() != remote.repositories.len() {
        return Err(ClusterMismatchError::RepoCount {
            local: local.repositories.len(),
            remote: remote.repositories.len(),
        });
    }

    let remote_repos: BTreeMap<&RepoId, &RepoEntry> =
        remote.repositories.iter().map(|r| (&r.id, r)).collect();

    for repo in &local.repositories {
        let Some(peer) = remote_repos.get(&repo.id) else {
            return Err(ClusterMismatchError::MissingRepo {
                repo: repo.id.clone(),
            });
        };

        if repo.nodes.len() != peer.nodes.len() {
            return Err(ClusterMismatchError::NodeCount {
                repo: repo.id.clone(),
                local: repo.nodes.len(),
                remote: peer.nodes.len(),
            });
        }

        let peer_nodes: BTreeSet<NodeId> = peer.nodes.iter().map(|n| n.id).collect();
        for node in &repo.nodes {
            if !peer_nodes.contains(&node.id) {
                return Err(ClusterMismatchError::MissingNode {
                    repo: repo.id.clone(),
                    node: node.id,
                });
            }
        }
    }

    Ok(())
}
