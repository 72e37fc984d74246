//! Crate-level convenience error.
//!
//! A thin wrapper over the capability errors; nothing is flattened or
//! renamed on the way through.

use thiserror::Error;

use crate::config::ConfigError;
use crate::model::{IndexStoreError, ModelError};
use crate::protocol::ClusterMismatchError;
use crate::scan::ScanError;

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    #[error(transparent)]
    Model(#[from] ModelError),

    #[error(transparent)]
    Cluster(#[from] ClusterMismatchError),

    #[error(transparent)]
    Scan(#[from] ScanError),

    #[error(transparent)]
    Index(#[from] IndexStoreError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}
