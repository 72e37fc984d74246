//! Block puller contract.
//!
//! The block-level puller lives outside this crate. For each file in a
//! repository's need set it requests missing blocks from peers holding
//! the winning version, writes them to a temp file named by the temp
//! namer, verifies block hashes, renames into place, and adopts the
//! winner via [`Model::update_local`]. Retries and worker scheduling are
//! its own business; the model only supplies the hooks:
//! [`Model::current_repo_file`] for the local view,
//! [`Model::request_global`] for remote reads, and
//! [`Model::update_local`] to record adopted files.
//!
//! [`Model::update_local`]: crate::model::Model::update_local
//! [`Model::current_repo_file`]: crate::model::Model::current_repo_file
//! [`Model::request_global`]: crate::model::Model::request_global

use std::sync::Arc;

use crate::config::RepoConfig;
use crate::model::Model;

/// Instantiates pullers when a repository enters read/write mode.
pub trait PullerFactory: Send + Sync {
    /// Attach a puller for `cfg` with `threads` worker slots. Zero
    /// threads means announce-only mode: serve and broadcast, never
    /// fetch.
    fn start(&self, model: &Arc<Model>, cfg: RepoConfig, threads: usize);
}
