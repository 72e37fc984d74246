//! The synchronization model.
//!
//! One per process. Owns the per-repository file sets, drives peer
//! connections, answers the peer protocol callbacks, runs the index
//! broadcast loop, and fans out scans and temp cleanup.
//!
//! Shared state is split across three reader-writer locks so a slow
//! consumer of one cannot stall the others: `repos` (configuration and
//! file set handles), `states` (per-repository scan state), `conns` (the
//! connection registry). When both `conns` and `repos` are taken, conns
//! comes first. No lock is ever held across a call into a peer
//! connection.

use std::collections::BTreeMap;
use std::fs::File;
use std::net::SocketAddr;
use std::os::unix::fs::FileExt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info, warn};

pub mod connections;
pub mod deadlock;
pub mod file_set;
pub mod index_store;
pub mod suppressor;

pub use connections::ConnectionRegistry;
pub use file_set::FileSet;
pub use index_store::IndexStoreError;
pub use suppressor::Suppressor;

use crate::config::{Config, RepoConfig};
use crate::core::{FLAG_DELETED, FLAG_INVALID, FileInfo, LamportClock, NodeId, RepoId};
use crate::protocol::cluster::{
    ClusterConfigMessage, FLAG_SHARE_TRUSTED, NodeEntry, RepoEntry, compare_cluster_config,
};
use crate::protocol::{Connection, ProtocolHandler, RawConnection, Statistics};
use crate::pull::PullerFactory;
use crate::scan::{CurrentFiler, IGNORE_FILE, STANDARD_BLOCK_SIZE, ScanError, TempNamer, Walker};

/// Initial index sends are chunked to bound memory and latency on large
/// repositories.
const INITIAL_INDEX_BATCH: usize = 1000;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum RepoState {
    #[default]
    Idle,
    Scanning,
    Syncing,
    Cleaning,
}

impl RepoState {
    pub fn as_str(self) -> &'static str {
        match self {
            RepoState::Idle => "idle",
            RepoState::Scanning => "scanning",
            RepoState::Syncing => "syncing",
            RepoState::Cleaning => "cleaning",
        }
    }
}

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("no such file")]
    NoSuchFile,
    #[error("file is invalid")]
    Invalid,
    #[error("unknown repository {0}")]
    UnknownRepo(RepoId),
    #[error("repository {repo} is not shared with {node}")]
    NotShared { repo: RepoId, node: NodeId },
    #[error("not connected to {0}")]
    NotConnected(NodeId),
    #[error(transparent)]
    Scan(#[from] ScanError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// File, deletion and byte counts over one view of a repository.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SizeCounts {
    pub files: usize,
    pub deleted: usize,
    pub bytes: u64,
}

impl SizeCounts {
    fn account(&mut self, f: &FileInfo) {
        if f.is_deleted() {
            self.deleted += 1;
        } else {
            self.files += 1;
        }
        self.bytes += f.size();
    }
}

/// Pending work for a node: entry count (files and deletions alike) and
/// bytes outstanding.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct NeedCounts {
    pub files: usize,
    pub bytes: u64,
}

#[derive(Clone, Debug)]
pub struct ConnectionInfo {
    pub statistics: Statistics,
    pub address: Option<SocketAddr>,
    pub client_version: String,
    /// Percentage of the global view this peer already has.
    pub completion: u8,
}

#[derive(Default)]
struct RepoTable {
    cfgs: BTreeMap<RepoId, RepoConfig>,
    files: BTreeMap<RepoId, Arc<FileSet>>,
    suppressors: BTreeMap<RepoId, Arc<Suppressor>>,
    /// repo -> all sharing nodes (including this one).
    repo_nodes: BTreeMap<RepoId, Vec<NodeId>>,
    /// node -> repos shared with it.
    node_repos: BTreeMap<NodeId, Vec<RepoId>>,
}

pub struct Model {
    index_dir: PathBuf,
    local_id: NodeId,
    client_name: String,
    client_version: String,
    clock: Arc<LamportClock>,
    cfg: RwLock<Config>,
    repos: Arc<RwLock<RepoTable>>,
    states: Arc<RwLock<BTreeMap<RepoId, RepoState>>>,
    conns: Arc<RwLock<ConnectionRegistry>>,
    puller: RwLock<Option<Arc<dyn PullerFactory>>>,
    started: AtomicBool,
}

/// Owns the background threads spawned by [`Model::start`].
pub struct ModelHandle {
    shutdown: Arc<AtomicBool>,
    joins: Vec<JoinHandle<()>>,
}

impl ModelHandle {
    pub fn shutdown(self) {
        self.shutdown.store(true, Ordering::Relaxed);
        for join in self.joins {
            let _ = join.join();
        }
    }
}

impl Model {
    /// A new model in announce-only mode: it will serve requests and
    /// send indexes but alter nothing locally until pullers are
    /// attached.
    pub fn new(
        index_dir: impl Into<PathBuf>,
        cfg: Config,
        local_id: NodeId,
        client_name: impl Into<String>,
        client_version: impl Into<String>,
    ) -> Arc<Model> {
        Arc::new(Model {
            index_dir: index_dir.into(),
            local_id,
            client_name: client_name.into(),
            client_version: client_version.into(),
            clock: Arc::new(LamportClock::new()),
            cfg: RwLock::new(cfg),
            repos: Arc::new(RwLock::new(RepoTable::default())),
            states: Arc::new(RwLock::new(BTreeMap::new())),
            conns: Arc::new(RwLock::new(ConnectionRegistry::new())),
            puller: RwLock::new(None),
            started: AtomicBool::new(false),
        })
    }

    pub fn local_id(&self) -> NodeId {
        self.local_id
    }

    pub fn clock(&self) -> &Arc<LamportClock> {
        &self.clock
    }

    pub fn set_puller_factory(&self, factory: Arc<dyn PullerFactory>) {
        *self.puller.write().expect("puller lock poisoned") = Some(factory);
    }

    /// Install a repository. Only valid before [`Model::start`].
    pub fn add_repo(&self, cfg: RepoConfig) {
        if self.started.load(Ordering::SeqCst) {
            panic!("cannot add repository to a started model");
        }
        if cfg.id.is_empty() {
            panic!("cannot add repository with empty id");
        }

        let threshold = self
            .cfg
            .read()
            .expect("config lock poisoned")
            .options
            .max_change_kbps;

        let mut repos = self.repos.write().expect("repo lock poisoned");
        repos.files.insert(
            cfg.id.clone(),
            Arc::new(FileSet::new(
                cfg.id.clone(),
                self.local_id,
                &cfg.shared_with,
                Arc::clone(&self.clock),
            )),
        );
        repos
            .suppressors
            .insert(cfg.id.clone(), Arc::new(Suppressor::new(threshold)));
        repos.repo_nodes.insert(cfg.id.clone(), cfg.shared_with.clone());
        for node in &cfg.shared_with {
            repos
                .node_repos
                .entry(*node)
                .or_default()
                .push(cfg.id.clone());
        }
        repos.cfgs.insert(cfg.id.clone(), cfg);
    }

    /// Spawn the broadcast loop and the lock watchdogs. Call once, after
    /// every `add_repo`.
    pub fn start(self: Arc<Self>) -> ModelHandle {
        self.started.store(true, Ordering::SeqCst);
        let shutdown = Arc::new(AtomicBool::new(false));
        let timeout = deadlock::timeout_from_env();

        let mut joins = vec![
            deadlock::watch("repo", Arc::clone(&self.repos), timeout, Arc::clone(&shutdown)),
            deadlock::watch(
                "state",
                Arc::clone(&self.states),
                timeout,
                Arc::clone(&shutdown),
            ),
            deadlock::watch(
                "connection",
                Arc::clone(&self.conns),
                timeout,
                Arc::clone(&shutdown),
            ),
        ];

        let model = self;
        let flag = Arc::clone(&shutdown);
        joins.push(
            thread::Builder::new()
                .name("index-broadcast".into())
                .spawn(move || model.broadcast_index_loop(&flag))
                .expect("spawn broadcast loop"),
        );

        ModelHandle { shutdown, joins }
    }

    // ---- peer protocol surface ----

    /// Full index from a peer.
    pub fn index(&self, node: NodeId, repo: &RepoId, files: Vec<FileInfo>) {
        debug!(%node, %repo, files = files.len(), "incoming index");
        if !self.repo_shared_with(repo, node) {
            let err = ModelError::NotShared {
                repo: repo.clone(),
                node,
            };
            warn!("dropping index: {err}");
            return;
        }

        let repos = self.repos.read().expect("repo lock poisoned");
        match repos.files.get(repo) {
            Some(fs) => fs.replace(node, files),
            None => panic!("index for nonexistent repo {repo}"),
        }
    }

    /// Incremental index from a peer.
    pub fn index_update(&self, node: NodeId, repo: &RepoId, files: Vec<FileInfo>) {
        debug!(%node, %repo, files = files.len(), "incoming index update");
        if !self.repo_shared_with(repo, node) {
            let err = ModelError::NotShared {
                repo: repo.clone(),
                node,
            };
            warn!("dropping index update: {err}");
            return;
        }

        let repos = self.repos.read().expect("repo lock poisoned");
        match repos.files.get(repo) {
            Some(fs) => fs.update(node, files),
            None => panic!("index update for nonexistent repo {repo}"),
        }
    }

    /// The peer's view of the shared cluster. A disagreement about what
    /// is shared with whom closes the connection.
    pub fn cluster_config(&self, node: NodeId, msg: ClusterConfigMessage) {
        let local = self.cluster_config_for(node);
        if let Err(err) = compare_cluster_config(&local, &msg) {
            warn!(%node, "{err}");
            self.close(node, &err.to_string());
            return;
        }

        let version = if msg.client_name == self.client_name {
            msg.client_version.clone()
        } else {
            format!("{} {}", msg.client_name, msg.client_version)
        };
        self.conns
            .write()
            .expect("connection lock poisoned")
            .set_client_version(node, version);

        info!(
            %node,
            client = %msg.client_name,
            version = %msg.client_version,
            "peer client identified"
        );
    }

    /// Serve a byte range of a local file to a peer.
    pub fn request(
        &self,
        node: NodeId,
        repo: &RepoId,
        name: &str,
        offset: u64,
        size: u32,
    ) -> Result<Vec<u8>, ModelError> {
        let (fs, directory) = {
            let repos = self.repos.read().expect("repo lock poisoned");
            match (repos.files.get(repo), repos.cfgs.get(repo)) {
                (Some(fs), Some(cfg)) => (Arc::clone(fs), cfg.directory.clone()),
                _ => {
                    warn!(%node, %repo, name, "request for nonexistent repo");
                    return Err(ModelError::NoSuchFile);
                }
            }
        };

        let local = fs.get(NodeId::LOCAL, name);
        if local.name.is_empty() {
            debug!(%node, %repo, name, "request for unknown file");
            return Err(ModelError::NoSuchFile);
        }
        if local.is_invalid() || local.is_deleted() {
            debug!(%node, %repo, name, "request for invalid or deleted file");
            return Err(ModelError::Invalid);
        }
        if offset > local.size() {
            debug!(%node, %repo, name, offset, "request past end of file");
            return Err(ModelError::NoSuchFile);
        }

        debug!(%node, %repo, name, offset, size, "serving request");
        let path = directory.join(name);
        let file = File::open(&path)?;
        let mut buf = vec![0u8; size as usize];
        file.read_exact_at(&mut buf, offset)?;
        Ok(buf)
    }

    /// Forget a peer: blank its entries in every shared file set and
    /// drop the connection. Idempotent; doubles as the cancellation
    /// signal for anything in flight on that connection.
    pub fn close(&self, node: NodeId, cause: &str) {
        info!(%node, cause, "connection closed");

        {
            let repos = self.repos.read().expect("repo lock poisoned");
            for repo in repos.node_repos.get(&node).into_iter().flatten() {
                if let Some(fs) = repos.files.get(repo) {
                    fs.replace(node, Vec::new());
                }
            }
        }

        self.conns
            .write()
            .expect("connection lock poisoned")
            .remove(node);
    }

    // ---- connection management ----

    /// Register a handshaken connection, announce our cluster config,
    /// and stream the initial index from a one-shot background thread so
    /// a large repository cannot delay the caller or the broadcast loop.
    pub fn add_connection(&self, raw: Arc<dyn RawConnection>, proto: Arc<dyn Connection>) {
        let node = proto.id();
        self.conns
            .write()
            .expect("connection lock poisoned")
            .add(raw, Arc::clone(&proto));

        proto.cluster_config(self.cluster_config_for(node));

        let mut to_send: Vec<(RepoId, Vec<FileInfo>)> = Vec::new();
        {
            let repos = self.repos.read().expect("repo lock poisoned");
            for repo in repos.node_repos.get(&node).into_iter().flatten() {
                if let Some(fs) = repos.files.get(repo) {
                    to_send.push((repo.clone(), protocol_index(fs)));
                }
            }
        }

        thread::Builder::new()
            .name("initial-index".into())
            .spawn(move || {
                for (repo, index) in to_send {
                    debug!(%node, %repo, files = index.len(), "sending initial index");
                    for batch in index.chunks(INITIAL_INDEX_BATCH) {
                        proto.index(&repo, batch);
                    }
                }
            })
            .expect("spawn initial index send");
    }

    pub fn connected_to(&self, node: NodeId) -> bool {
        self.conns
            .read()
            .expect("connection lock poisoned")
            .is_connected(node)
    }

    /// Per-peer transfer statistics, address, client version and
    /// completion percentage.
    pub fn connection_stats(&self) -> BTreeMap<NodeId, ConnectionInfo> {
        // Lock order: connections before repos.
        let conns = self.conns.read().expect("connection lock poisoned");
        let repos = self.repos.read().expect("repo lock poisoned");

        let mut stats = BTreeMap::new();
        for (node, conn) in conns.iter() {
            let mut total = 0u64;
            let mut have = 0u64;
            for repo in repos.node_repos.get(node).into_iter().flatten() {
                let Some(fs) = repos.files.get(repo) else {
                    continue;
                };
                fs.with_global(|f| {
                    if !f.is_deleted() {
                        total += f.size();
                        have += f.size();
                    }
                    true
                });
                fs.with_need(*node, |f| {
                    if !f.is_deleted() {
                        have = have.saturating_sub(f.size());
                    }
                    true
                });
            }

            let completion = if total == 0 {
                100
            } else {
                (100 * have / total) as u8
            };

            stats.insert(
                *node,
                ConnectionInfo {
                    statistics: conn.statistics(),
                    address: conns.remote_addr(*node),
                    client_version: conns.client_version(*node).unwrap_or_default().to_string(),
                    completion,
                },
            );
        }
        stats
    }

    /// Read a byte range of the named file from a peer's copy.
    pub fn request_global(
        &self,
        node: NodeId,
        repo: &RepoId,
        name: &str,
        offset: u64,
        size: u32,
        hash: &[u8],
    ) -> Result<Vec<u8>, ModelError> {
        let conn = {
            let conns = self.conns.read().expect("connection lock poisoned");
            conns.get(node).ok_or(ModelError::NotConnected(node))?
        };
        debug!(%node, %repo, name, offset, size, hash_len = hash.len(), "outgoing request");
        conn.request(repo, name, offset, size)
    }

    // ---- index views ----

    pub fn current_repo_file(&self, repo: &RepoId, name: &str) -> FileInfo {
        let repos = self.repos.read().expect("repo lock poisoned");
        repos
            .files
            .get(repo)
            .map(|fs| fs.get(NodeId::LOCAL, name))
            .unwrap_or_default()
    }

    pub fn current_global_file(&self, repo: &RepoId, name: &str) -> FileInfo {
        let repos = self.repos.read().expect("repo lock poisoned");
        repos
            .files
            .get(repo)
            .map(|fs| fs.get_global(name))
            .unwrap_or_default()
    }

    /// Replace the local index after an authoritative scan sweep.
    pub fn replace_local(&self, repo: &RepoId, files: Vec<FileInfo>) {
        let repos = self.repos.read().expect("repo lock poisoned");
        if let Some(fs) = repos.files.get(repo) {
            fs.replace_with_delete(NodeId::LOCAL, files);
        }
    }

    /// Record a single adopted file (puller callback).
    pub fn update_local(&self, repo: &RepoId, file: FileInfo) {
        let repos = self.repos.read().expect("repo lock poisoned");
        if let Some(fs) = repos.files.get(repo) {
            fs.update(NodeId::LOCAL, vec![file]);
        }
    }

    pub fn global_size(&self, repo: &RepoId) -> SizeCounts {
        let mut counts = SizeCounts::default();
        let repos = self.repos.read().expect("repo lock poisoned");
        if let Some(fs) = repos.files.get(repo) {
            fs.with_global(|f| {
                counts.account(f);
                true
            });
        }
        counts
    }

    pub fn local_size(&self, repo: &RepoId) -> SizeCounts {
        let mut counts = SizeCounts::default();
        let repos = self.repos.read().expect("repo lock poisoned");
        if let Some(fs) = repos.files.get(repo) {
            fs.with_have(NodeId::LOCAL, |f| {
                counts.account(f);
                true
            });
        }
        counts
    }

    pub fn need_size(&self, repo: &RepoId) -> NeedCounts {
        let mut counts = NeedCounts::default();
        for f in self.need_files_repo(repo) {
            counts.files += 1;
            counts.bytes += f.size();
        }
        counts
    }

    /// The local need set, ordered by the repository's configured file
    /// order.
    pub fn need_files_repo(&self, repo: &RepoId) -> Vec<FileInfo> {
        let repos = self.repos.read().expect("repo lock poisoned");
        let Some(fs) = repos.files.get(repo) else {
            return Vec::new();
        };
        let mut files = Vec::new();
        fs.with_need(NodeId::LOCAL, |f| {
            files.push(f.clone());
            true
        });
        if let Some(cfg) = repos.cfgs.get(repo) {
            cfg.file_order.sort(&mut files);
        }
        files
    }

    /// Change version for the repository: the sum of per-node mutation
    /// counters. Strictly increases whenever any node's map changes.
    pub fn version(&self, repo: &RepoId) -> u64 {
        let repos = self.repos.read().expect("repo lock poisoned");
        let Some(fs) = repos.files.get(repo) else {
            return 0;
        };
        let mut version = fs.changes(NodeId::LOCAL);
        for node in repos.repo_nodes.get(repo).into_iter().flatten() {
            version += fs.changes(*node);
        }
        version
    }

    /// Resolve a conflict in this node's favor: every needed file is
    /// re-announced as the local copy (or a synthesized deletion) with a
    /// fresh version, so this repository wins cluster-wide.
    pub fn override_changes(&self, repo: &RepoId) {
        let mut files = self.need_files_repo(repo);
        let fs = {
            let repos = self.repos.read().expect("repo lock poisoned");
            match repos.files.get(repo) {
                Some(fs) => Arc::clone(fs),
                None => return,
            }
        };

        info!(%repo, files = files.len(), "overriding remote changes");
        for f in files.iter_mut() {
            let have = fs.get(NodeId::LOCAL, &f.name);
            if have.name != f.name {
                // Missing locally: the winner becomes a deletion.
                f.flags |= FLAG_DELETED;
                f.blocks = Vec::new();
            } else {
                *f = have;
            }
            f.version = self.clock.tick(f.version);
        }
        fs.update(NodeId::LOCAL, files);
    }

    // ---- lifecycle ----

    /// Load the persisted local index of every repository from the
    /// index directory. Versions advance the Lamport clock; the invalid
    /// flag is cleared so files suppressed in the previous run get a
    /// fresh chance.
    pub fn load_indexes(&self) {
        let targets: Vec<(RepoId, PathBuf, Arc<FileSet>)> = {
            let repos = self.repos.read().expect("repo lock poisoned");
            repos
                .cfgs
                .iter()
                .filter_map(|(id, cfg)| {
                    repos
                        .files
                        .get(id)
                        .map(|fs| (id.clone(), cfg.directory.clone(), Arc::clone(fs)))
                })
                .collect()
        };

        for (repo, directory, fs) in targets {
            let mut files = index_store::load(&repo, &directory, &self.index_dir);
            for f in &mut files {
                self.clock.tick(f.version);
                f.flags &= !FLAG_INVALID;
            }
            info!(%repo, files = files.len(), "loaded index");
            fs.replace(NodeId::LOCAL, files);
        }
    }

    /// Persist the local index of one repository.
    pub fn save_index(&self, repo: &RepoId) -> Result<(), IndexStoreError> {
        let (directory, index) = {
            let repos = self.repos.read().expect("repo lock poisoned");
            let (Some(cfg), Some(fs)) = (repos.cfgs.get(repo), repos.files.get(repo)) else {
                return Ok(());
            };
            (cfg.directory.clone(), protocol_index(fs))
        };
        index_store::save(repo, &directory, &self.index_dir, &index)
    }

    /// Persist the local index of every repository.
    pub fn save_indexes(&self) -> Result<(), IndexStoreError> {
        let repos: Vec<RepoId> = {
            let table = self.repos.read().expect("repo lock poisoned");
            table.cfgs.keys().cloned().collect()
        };
        for repo in repos {
            self.save_index(&repo)?;
        }
        Ok(())
    }

    /// Walk one repository and install the result as the local index.
    pub fn scan_repo(&self, repo: &RepoId) -> Result<(), ModelError> {
        let walker = {
            let repos = self.repos.read().expect("repo lock poisoned");
            let cfg = repos
                .cfgs
                .get(repo)
                .ok_or_else(|| ModelError::UnknownRepo(repo.clone()))?;
            Walker {
                dir: cfg.directory.clone(),
                ignore_file: IGNORE_FILE.to_string(),
                block_size: STANDARD_BLOCK_SIZE,
                temp_namer: TempNamer::default(),
                suppressor: repos.suppressors.get(repo).cloned(),
                current_filer: repos.files.get(repo).map(|fs| {
                    Box::new(RepoFiler {
                        files: Arc::clone(fs),
                    }) as Box<dyn CurrentFiler>
                }),
                ignore_perms: cfg.ignore_perms,
                clock: Arc::clone(&self.clock),
            }
        };

        self.set_state(repo, RepoState::Scanning);
        let report = walker.walk();
        match report {
            Ok(report) => {
                self.replace_local(repo, report.files);
                self.set_state(repo, RepoState::Idle);
                Ok(())
            }
            Err(err) => {
                self.set_state(repo, RepoState::Idle);
                self.invalidate_repo(repo, &err.to_string());
                Err(err.into())
            }
        }
    }

    /// Scan every repository concurrently.
    pub fn scan_repos(&self) {
        let repos: Vec<RepoId> = {
            let table = self.repos.read().expect("repo lock poisoned");
            table.cfgs.keys().cloned().collect()
        };

        thread::scope(|scope| {
            for repo in repos {
                scope.spawn(move || {
                    if let Err(err) = self.scan_repo(&repo) {
                        warn!(%repo, "scan failed: {err}");
                    }
                });
            }
        });
    }

    /// Remove leftover temporaries from every repository directory.
    pub fn clean_repos(&self) {
        let targets: Vec<(RepoId, PathBuf)> = {
            let table = self.repos.read().expect("repo lock poisoned");
            table
                .cfgs
                .iter()
                .map(|(id, cfg)| (id.clone(), cfg.directory.clone()))
                .collect()
        };

        thread::scope(|scope| {
            for (repo, dir) in targets {
                scope.spawn(move || {
                    self.set_state(&repo, RepoState::Cleaning);
                    let walker = Walker {
                        dir,
                        ignore_file: IGNORE_FILE.to_string(),
                        block_size: STANDARD_BLOCK_SIZE,
                        temp_namer: TempNamer::default(),
                        suppressor: None,
                        current_filer: None,
                        ignore_perms: false,
                        clock: Arc::clone(&self.clock),
                    };
                    walker.clean_temp_files();
                    self.set_state(&repo, RepoState::Idle);
                });
            }
        });
    }

    /// Attach a puller so the repository is kept in sync with the
    /// cluster. Zero threads means announce-only mode.
    pub fn start_repo_rw(self: Arc<Self>, repo: &RepoId, threads: usize) {
        let cfg = {
            let repos = self.repos.read().expect("repo lock poisoned");
            repos.cfgs.get(repo).cloned()
        };
        let Some(cfg) = cfg else {
            panic!("cannot start unknown repository {repo}");
        };

        let factory = self.puller.read().expect("puller lock poisoned").clone();
        match factory {
            Some(factory) => factory.start(&self, cfg, threads),
            None => debug!(%repo, threads, "no puller factory registered"),
        }
    }

    /// Announce-only mode for the repository.
    pub fn start_repo_ro(self: Arc<Self>, repo: &RepoId) {
        self.start_repo_rw(repo, 0);
    }

    pub fn state(&self, repo: &RepoId) -> RepoState {
        self.states
            .read()
            .expect("state lock poisoned")
            .get(repo)
            .copied()
            .unwrap_or_default()
    }

    /// Record a repository state transition. Scans and cleanup set this
    /// themselves; pullers use it to mark syncing.
    pub fn set_state(&self, repo: &RepoId, state: RepoState) {
        self.states
            .write()
            .expect("state lock poisoned")
            .insert(repo.clone(), state);
    }

    // ---- internals ----

    fn repo_shared_with(&self, repo: &RepoId, node: NodeId) -> bool {
        let repos = self.repos.read().expect("repo lock poisoned");
        repos
            .node_repos
            .get(&node)
            .is_some_and(|list| list.contains(repo))
    }

    fn invalidate_repo(&self, repo: &RepoId, reason: &str) {
        let mut cfg = self.cfg.write().expect("config lock poisoned");
        if let Some(entry) = cfg.repositories.iter_mut().find(|r| &r.id == repo) {
            entry.invalid = reason.to_string();
        }
    }

    /// The cluster config we announce to `node`: every repository shared
    /// with it, each listing its full share group.
    fn cluster_config_for(&self, node: NodeId) -> ClusterConfigMessage {
        let mut msg = ClusterConfigMessage {
            client_name: self.client_name.clone(),
            client_version: self.client_version.clone(),
            repositories: Vec::new(),
        };

        let repos = self.repos.read().expect("repo lock poisoned");
        for repo in repos.node_repos.get(&node).into_iter().flatten() {
            let mut entry = RepoEntry {
                id: repo.clone(),
                nodes: Vec::new(),
            };
            for member in repos.repo_nodes.get(repo).into_iter().flatten() {
                entry.nodes.push(NodeEntry {
                    id: *member,
                    flags: FLAG_SHARE_TRUSTED,
                });
            }
            msg.repositories.push(entry);
        }
        msg
    }

    fn broadcast_index_loop(&self, shutdown: &AtomicBool) {
        let interval = Duration::from_millis(
            self.cfg
                .read()
                .expect("config lock poisoned")
                .options
                .broadcast_interval_ms,
        );
        let mut last_change: BTreeMap<RepoId, u64> = BTreeMap::new();
        loop {
            deadlock::sleep_while_running(shutdown, interval);
            if shutdown.load(Ordering::Relaxed) {
                return;
            }
            self.broadcast_changed_indexes(&mut last_change);
        }
    }

    /// One broadcast iteration: for every repository whose local index
    /// changed since the counters in `last_change`, send the full index
    /// to every connected sharing peer. Sends to distinct peers run in
    /// parallel and are all awaited before returning, so indexes from
    /// one iteration are delivered before the next begins.
    fn broadcast_changed_indexes(&self, last_change: &mut BTreeMap<RepoId, u64>) {
        let mut sends: Vec<(RepoId, Arc<dyn Connection>, Arc<Vec<FileInfo>>)> = Vec::new();
        {
            // Lock order: connections before repos. Both are released
            // before any send.
            let conns = self.conns.read().expect("connection lock poisoned");
            let repos = self.repos.read().expect("repo lock poisoned");

            for (repo, fs) in &repos.files {
                let counter = fs.changes(NodeId::LOCAL);
                if last_change.get(repo) == Some(&counter) {
                    continue;
                }
                last_change.insert(repo.clone(), counter);

                let index = Arc::new(protocol_index(fs));
                for node in repos.repo_nodes.get(repo).into_iter().flatten() {
                    if let Some(conn) = conns.get(*node) {
                        sends.push((repo.clone(), conn, Arc::clone(&index)));
                    }
                }
            }
        }

        thread::scope(|scope| {
            for (repo, conn, index) in sends {
                scope.spawn(move || {
                    debug!(node = %conn.id(), %repo, files = index.len(), "broadcasting index");
                    conn.index(&repo, &index);
                });
            }
        });
    }
}

impl ProtocolHandler for Model {
    fn index(&self, node: NodeId, repo: &RepoId, files: Vec<FileInfo>) {
        Model::index(self, node, repo, files);
    }

    fn index_update(&self, node: NodeId, repo: &RepoId, files: Vec<FileInfo>) {
        Model::index_update(self, node, repo, files);
    }

    fn cluster_config(&self, node: NodeId, msg: ClusterConfigMessage) {
        Model::cluster_config(self, node, msg);
    }

    fn request(
        &self,
        node: NodeId,
        repo: &RepoId,
        name: &str,
        offset: u64,
        size: u32,
    ) -> Result<Vec<u8>, ModelError> {
        Model::request(self, node, repo, name, offset, size)
    }

    fn close(&self, node: NodeId, cause: &str) {
        Model::close(self, node, cause);
    }
}

/// The local index in announcement order.
fn protocol_index(fs: &FileSet) -> Vec<FileInfo> {
    let mut files = Vec::new();
    fs.with_have(NodeId::LOCAL, |f| {
        files.push(f.clone());
        true
    });
    files
}

/// Binds a file set to the walker's current-file lookup.
struct RepoFiler {
    files: Arc<FileSet>,
}

impl CurrentFiler for RepoFiler {
    fn current_file(&self, name: &str) -> FileInfo {
        self.files.get(NodeId::LOCAL, name)
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::Path;

    use tempfile::TempDir;

    use super::*;
    use crate::config::Options;
    use crate::core::{BlockInfo, ZERO_ENTRY_SIZE};

    fn node(seed: u8) -> NodeId {
        NodeId::new([seed; 32])
    }

    fn repo_id() -> RepoId {
        RepoId::parse("r").unwrap()
    }

    fn test_model(dir: &Path, shared: Vec<NodeId>) -> Arc<Model> {
        let model = Model::new(
            dir.join("index"),
            Config {
                options: Options {
                    broadcast_interval_ms: 25,
                    ..Options::default()
                },
                repositories: Vec::new(),
            },
            node(1),
            "shoal",
            "0.1.0",
        );
        model.add_repo(RepoConfig {
            id: repo_id(),
            directory: dir.join("repo"),
            shared_with: shared,
            ..RepoConfig::default()
        });
        model
    }

    fn file(name: &str, version: u64) -> FileInfo {
        FileInfo {
            name: name.into(),
            version,
            blocks: vec![BlockInfo {
                offset: 0,
                size: 10,
                hash: vec![0; 32],
            }],
            ..FileInfo::default()
        }
    }

    #[test]
    fn index_from_unshared_node_is_dropped() {
        let tmp = TempDir::new().unwrap();
        let model = test_model(tmp.path(), vec![node(1), node(2)]);

        model.index(node(9), &repo_id(), vec![file("a", 1)]);
        assert!(model.current_global_file(&repo_id(), "a").name.is_empty());

        model.index(node(2), &repo_id(), vec![file("a", 1)]);
        assert_eq!(model.current_global_file(&repo_id(), "a").version, 1);
    }

    #[test]
    fn index_update_merges_by_version() {
        let tmp = TempDir::new().unwrap();
        let model = test_model(tmp.path(), vec![node(1), node(2)]);

        model.index(node(2), &repo_id(), vec![file("a", 5)]);
        model.index_update(node(2), &repo_id(), vec![file("a", 3), file("b", 1)]);

        assert_eq!(model.current_global_file(&repo_id(), "a").version, 5);
        assert_eq!(model.current_global_file(&repo_id(), "b").version, 1);
    }

    #[test]
    fn version_is_monotonic_over_mutations() {
        let tmp = TempDir::new().unwrap();
        let model = test_model(tmp.path(), vec![node(1), node(2)]);
        let r = repo_id();

        let v0 = model.version(&r);
        model.index(node(2), &r, vec![file("a", 1)]);
        let v1 = model.version(&r);
        model.replace_local(&r, vec![file("b", 0)]);
        let v2 = model.version(&r);
        model.close(node(2), "test");
        let v3 = model.version(&r);

        assert!(v0 < v1 && v1 < v2 && v2 < v3);
    }

    #[test]
    fn close_blanks_the_peer_and_is_idempotent() {
        let tmp = TempDir::new().unwrap();
        let model = test_model(tmp.path(), vec![node(1), node(2)]);
        let r = repo_id();

        model.index(node(2), &r, vec![file("a", 4)]);
        assert_eq!(model.current_global_file(&r, "a").version, 4);

        model.close(node(2), "test");
        assert!(model.current_global_file(&r, "a").name.is_empty());

        let repos = model.repos.read().unwrap();
        let fs = repos.files.get(&r).unwrap();
        assert!(fs.get(node(2), "a").name.is_empty());
        drop(repos);

        model.close(node(2), "again");
    }

    #[test]
    fn request_checks_index_before_disk() {
        let tmp = TempDir::new().unwrap();
        let model = test_model(tmp.path(), vec![node(1), node(2)]);
        let r = repo_id();
        fs::create_dir_all(tmp.path().join("repo")).unwrap();
        fs::write(tmp.path().join("repo/f1"), vec![9u8; 100]).unwrap();

        // Not announced yet.
        assert!(matches!(
            model.request(node(2), &r, "f1", 0, 10),
            Err(ModelError::NoSuchFile)
        ));

        model.scan_repo(&r).unwrap();

        let bytes = model.request(node(2), &r, "f1", 10, 20).unwrap();
        assert_eq!(bytes, vec![9u8; 20]);

        // Offset past the announced size.
        assert!(matches!(
            model.request(node(2), &r, "f1", 1000, 10),
            Err(ModelError::NoSuchFile)
        ));

        // Unknown repo.
        assert!(matches!(
            model.request(node(2), &RepoId::parse("nope").unwrap(), "f1", 0, 1),
            Err(ModelError::NoSuchFile)
        ));

        // Deleted files are invalid to request.
        fs::remove_file(tmp.path().join("repo/f1")).unwrap();
        model.scan_repo(&r).unwrap();
        assert!(matches!(
            model.request(node(2), &r, "f1", 0, 1),
            Err(ModelError::Invalid)
        ));
    }

    #[test]
    fn scan_sizes_account_dirs_and_empty_files_at_the_sentinel() {
        let tmp = TempDir::new().unwrap();
        let model = test_model(tmp.path(), vec![node(1), node(2)]);
        let r = repo_id();
        let root = tmp.path().join("repo");
        fs::create_dir_all(root.join("d1")).unwrap();
        fs::write(root.join("f1"), vec![1u8; 100]).unwrap();
        fs::File::create(root.join("f2")).unwrap();

        model.scan_repo(&r).unwrap();

        assert_eq!(
            model.local_size(&r),
            SizeCounts {
                files: 3,
                deleted: 0,
                bytes: 100 + 2 * ZERO_ENTRY_SIZE,
            }
        );
        assert_eq!(model.state(&r), RepoState::Idle);
    }

    #[test]
    fn deleting_a_file_propagates_through_rescan() {
        let tmp = TempDir::new().unwrap();
        let model = test_model(tmp.path(), vec![node(1), node(2)]);
        let r = repo_id();
        let root = tmp.path().join("repo");
        fs::create_dir_all(&root).unwrap();
        fs::write(root.join("f1"), b"data").unwrap();

        model.scan_repo(&r).unwrap();
        let before = model.current_repo_file(&r, "f1");
        assert!(!before.is_deleted());

        fs::remove_file(root.join("f1")).unwrap();
        model.scan_repo(&r).unwrap();
        let after = model.current_repo_file(&r, "f1");
        assert!(after.is_deleted());
        assert!(after.version > before.version);
    }

    #[test]
    fn override_makes_the_local_copy_win() {
        let tmp = TempDir::new().unwrap();
        let model = test_model(tmp.path(), vec![node(1), node(2)]);
        let r = repo_id();

        // The peer has a newer "a" and a file we lack entirely.
        model.replace_local(&r, vec![file("a", 1)]);
        model.index(node(2), &r, vec![file("a", 8), file("b", 2)]);
        assert_eq!(model.need_size(&r).files, 2);

        model.override_changes(&r);

        assert_eq!(model.need_size(&r).files, 0);
        let a = model.current_global_file(&r, "a");
        assert!(a.version > 8);
        assert!(!a.is_deleted());
        let b = model.current_global_file(&r, "b");
        assert!(b.version > 2);
        assert!(b.is_deleted());
    }

    #[test]
    fn indexes_survive_restart_with_invalid_cleared() {
        let tmp = TempDir::new().unwrap();
        let model = test_model(tmp.path(), vec![node(1), node(2)]);
        let r = repo_id();

        let mut hot = file("hot", 6);
        hot.flags |= FLAG_INVALID;
        model.replace_local(&r, vec![file("a", 3), hot]);
        model.save_indexes().unwrap();

        let restarted = test_model(tmp.path(), vec![node(1), node(2)]);
        restarted.load_indexes();

        let a = restarted.current_repo_file(&r, "a");
        assert_eq!(a.version, 3);
        let hot = restarted.current_repo_file(&r, "hot");
        assert!(!hot.is_invalid());

        // The clock resumed past every persisted version.
        assert!(restarted.clock().current() >= 6);
    }

    #[test]
    fn state_transitions_are_reported() {
        let tmp = TempDir::new().unwrap();
        let model = test_model(tmp.path(), vec![node(1)]);
        let r = repo_id();
        assert_eq!(model.state(&r), RepoState::Idle);
        assert_eq!(RepoState::Scanning.as_str(), "scanning");

        fs::create_dir_all(tmp.path().join("repo")).unwrap();
        model.scan_repos();
        assert_eq!(model.state(&r), RepoState::Idle);
    }

    #[test]
    fn failed_scans_invalidate_the_repo_config() {
        let tmp = TempDir::new().unwrap();
        let model = Model::new(
            tmp.path().join("index"),
            Config {
                repositories: vec![RepoConfig {
                    id: repo_id(),
                    directory: tmp.path().join("missing"),
                    ..RepoConfig::default()
                }],
                ..Config::default()
            },
            node(1),
            "shoal",
            "0.1.0",
        );
        model.add_repo(RepoConfig {
            id: repo_id(),
            directory: tmp.path().join("missing"),
            shared_with: vec![node(1)],
            ..RepoConfig::default()
        });

        model.scan_repos();

        let cfg = model.cfg.read().unwrap();
        assert!(!cfg.repositories[0].invalid.is_empty());
    }

    #[test]
    #[should_panic(expected = "started model")]
    fn add_repo_after_start_panics() {
        let tmp = TempDir::new().unwrap();
        let model = test_model(tmp.path(), vec![node(1)]);
        let handle = Arc::clone(&model).start();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            model.add_repo(RepoConfig {
                id: RepoId::parse("late").unwrap(),
                ..RepoConfig::default()
            });
        }));
        handle.shutdown();
        if let Err(panic) = result {
            std::panic::resume_unwind(panic);
        }
    }

    #[test]
    #[should_panic(expected = "empty id")]
    fn add_repo_with_empty_id_panics() {
        let tmp = TempDir::new().unwrap();
        let model = test_model(tmp.path(), vec![node(1)]);
        model.add_repo(RepoConfig::default());
    }

    #[test]
    fn cluster_config_lists_share_group_per_repo() {
        let tmp = TempDir::new().unwrap();
        let model = test_model(tmp.path(), vec![node(1), node(2), node(3)]);

        let msg = model.cluster_config_for(node(2));
        assert_eq!(msg.client_name, "shoal");
        assert_eq!(msg.repositories.len(), 1);
        assert_eq!(msg.repositories[0].id, repo_id());
        assert_eq!(msg.repositories[0].nodes.len(), 3);

        // Nothing is shared with a stranger.
        assert!(model.cluster_config_for(node(9)).repositories.is_empty());
    }
}
