//! Configuration schema.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::{FileInfo, NodeId, RepoId};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("io error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("config parse failed: {0}")]
    Parse(#[from] serde_json::Error),
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub options: Options,
    pub repositories: Vec<RepoConfig>,
}

impl Config {
    pub fn load(path: &Path) -> Result<Config, ConfigError> {
        let raw = fs::read(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(serde_json::from_slice(&raw)?)
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let raw = serde_json::to_vec_pretty(self)?;
        fs::write(path, raw).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn repo(&self, id: &RepoId) -> Option<&RepoConfig> {
        self.repositories.iter().find(|r| &r.id == id)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct Options {
    /// Per-file change-rate ceiling in kB/s; zero disables suppression.
    pub max_change_kbps: u64,
    /// Broadcast loop interval in milliseconds.
    pub broadcast_interval_ms: u64,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            max_change_kbps: 10_000,
            broadcast_interval_ms: 5_000,
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RepoConfig {
    pub id: RepoId,
    pub directory: PathBuf,
    /// Drop permission bits from scanned entries and comparisons.
    pub ignore_perms: bool,
    /// Every node this repository is shared with, including this one.
    pub shared_with: Vec<NodeId>,
    pub file_order: FileOrder,
    /// Non-empty when the repository has been taken out of service,
    /// typically after a failed scan. Holds the reason.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub invalid: String,
}

/// Order in which needed files are handed to the puller.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileOrder {
    #[default]
    Alphabetic,
    SmallestFirst,
    LargestFirst,
    Newest,
    Oldest,
}

impl FileOrder {
    pub fn sort(self, files: &mut [FileInfo]) {
        match self {
            FileOrder::Alphabetic => files.sort_by(|a, b| a.name.cmp(&b.name)),
            FileOrder::SmallestFirst => files.sort_by_key(FileInfo::size),
            FileOrder::LargestFirst => {
                files.sort_by_key(FileInfo::size);
                files.reverse();
            }
            FileOrder::Newest => files.sort_by_key(|f| std::cmp::Reverse(f.modified)),
            FileOrder::Oldest => files.sort_by_key(|f| f.modified),
        }
    }
}
