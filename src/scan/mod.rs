//! Filesystem walker: hashes a repository tree into a FileInfo list.
//!
//! The walker is deliberately dumb about replication. It reports what is
//! on disk, reuses stored metadata for files that have not changed, and
//! defers churn decisions to the suppressor. Everything else is the
//! model's business.

use std::collections::BTreeSet;
use std::fs;
use std::io::Read;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, warn};

use crate::core::{
    BlockInfo, FLAG_DIRECTORY, FLAG_INVALID, FLAG_PERM_MASK, FileInfo, LamportClock, time,
};
use crate::model::Suppressor;

/// Content is hashed in spans of this many bytes.
pub const STANDARD_BLOCK_SIZE: u32 = 128 * 1024;

/// Default name of the per-repository ignore file.
pub const IGNORE_FILE: &str = ".shoalignore";

#[derive(Debug, Error)]
pub enum ScanError {
    #[error("io error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("not a directory: {path:?}")]
    NotADirectory { path: PathBuf },
}

/// The walker's view of what is already announced, used to skip
/// re-hashing unchanged files.
pub trait CurrentFiler: Send + Sync {
    /// The file as currently announced, or the zero FileInfo.
    fn current_file(&self, name: &str) -> FileInfo;
}

/// Names for in-flight temporary files, shared between the walker (which
/// skips and cleans them) and the puller (which writes into them).
#[derive(Clone, Debug)]
pub struct TempNamer {
    prefix: String,
}

impl Default for TempNamer {
    fn default() -> Self {
        Self {
            prefix: ".shoal.".to_string(),
        }
    }
}

impl TempNamer {
    /// The temporary sibling for `name` (a repository-relative path).
    pub fn temp_name(&self, name: &str) -> String {
        match name.rsplit_once('/') {
            Some((dir, base)) => format!("{dir}/{}{base}.tmp", self.prefix),
            None => format!("{}{name}.tmp", self.prefix),
        }
    }

    /// Whether a file name (basename) belongs to us.
    pub fn is_temporary(&self, name: &str) -> bool {
        let base = name.rsplit('/').next().unwrap_or(name);
        base.starts_with(&self.prefix) && base.ends_with(".tmp")
    }
}

/// One scan of one repository directory.
pub struct Walker {
    pub dir: PathBuf,
    pub ignore_file: String,
    pub block_size: u32,
    pub temp_namer: TempNamer,
    pub suppressor: Option<Arc<Suppressor>>,
    pub current_filer: Option<Box<dyn CurrentFiler>>,
    pub ignore_perms: bool,
    pub clock: Arc<LamportClock>,
}

pub struct WalkReport {
    pub files: Vec<FileInfo>,
    /// Repository-relative names skipped because of ignore patterns.
    pub ignored: Vec<String>,
}

impl Walker {
    /// Scan the tree and return fresh FileInfos for everything present.
    pub fn walk(&self) -> Result<WalkReport, ScanError> {
        debug!(dir = %self.dir.display(), "walk start");
        let meta = fs::metadata(&self.dir).map_err(|source| ScanError::Io {
            path: self.dir.clone(),
            source,
        })?;
        if !meta.is_dir() {
            return Err(ScanError::NotADirectory {
                path: self.dir.clone(),
            });
        }

        let patterns = self.load_ignore_patterns();
        let mut report = WalkReport {
            files: Vec::new(),
            ignored: Vec::new(),
        };
        self.walk_dir("", &patterns, &mut report)?;
        debug!(
            dir = %self.dir.display(),
            files = report.files.len(),
            ignored = report.ignored.len(),
            "walk done"
        );
        Ok(report)
    }

    /// Remove leftover temporary files from interrupted pulls.
    pub fn clean_temp_files(&self) {
        self.clean_dir(&self.dir);
    }

    fn clean_dir(&self, dir: &Path) {
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(err) => {
                warn!(dir = %dir.display(), "temp cleanup: {err}");
                return;
            }
        };
        for entry in entries.flatten() {
            let Ok(name) = entry.file_name().into_string() else {
                continue;
            };
            let path = entry.path();
            if path.is_dir() {
                self.clean_dir(&path);
            } else if self.temp_namer.is_temporary(&name) {
                debug!(path = %path.display(), "removing temp file");
                if let Err(err) = fs::remove_file(&path) {
                    warn!(path = %path.display(), "temp cleanup: {err}");
                }
            }
        }
    }

    /// Exact-name patterns from the repository's ignore file, one per
    /// line, matched against entry basenames anywhere in the tree.
    fn load_ignore_patterns(&self) -> BTreeSet<String> {
        let path = self.dir.join(&self.ignore_file);
        match fs::read_to_string(&path) {
            Ok(raw) => raw
                .lines()
                .map(str::trim)
                .filter(|l| !l.is_empty() && !l.starts_with('#'))
                .map(str::to_string)
                .collect(),
            Err(_) => BTreeSet::new(),
        }
    }

    fn walk_dir(
        &self,
        rel: &str,
        patterns: &BTreeSet<String>,
        report: &mut WalkReport,
    ) -> Result<(), ScanError> {
        let abs = self.dir.join(rel);
        let entries = fs::read_dir(&abs).map_err(|source| ScanError::Io {
            path: abs.clone(),
            source,
        })?;

        for entry in entries {
            let entry = entry.map_err(|source| ScanError::Io {
                path: abs.clone(),
                source,
            })?;
            let Ok(name) = entry.file_name().into_string() else {
                warn!(dir = %abs.display(), "skipping non-UTF-8 file name");
                continue;
            };
            if name == self.ignore_file || self.temp_namer.is_temporary(&name) {
                continue;
            }

            let rel_name = if rel.is_empty() {
                name.clone()
            } else {
                format!("{rel}/{name}")
            };
            if patterns.contains(&name) {
                report.ignored.push(rel_name);
                continue;
            }

            let meta = match entry.metadata() {
                Ok(meta) => meta,
                Err(err) => {
                    warn!(name = %rel_name, "stat failed, skipping: {err}");
                    continue;
                }
            };

            if meta.is_dir() {
                report.files.push(self.dir_info(&rel_name, &meta));
                self.walk_dir(&rel_name, patterns, report)?;
            } else if meta.is_file() {
                if let Some(f) = self.file_info(&rel_name, &entry.path(), &meta) {
                    report.files.push(f);
                }
            }
            // Symlinks and special files are not replicated.
        }
        Ok(())
    }

    fn perms_of(&self, meta: &fs::Metadata) -> u32 {
        if self.ignore_perms {
            0
        } else {
            meta.permissions().mode() & FLAG_PERM_MASK
        }
    }

    fn current(&self, name: &str) -> FileInfo {
        self.current_filer
            .as_ref()
            .map(|cf| cf.current_file(name))
            .unwrap_or_default()
    }

    fn unchanged(&self, cur: &FileInfo, modified: i64, perms: u32) -> bool {
        cur.modified == modified
            && !cur.is_invalid()
            && !cur.is_deleted()
            && (self.ignore_perms || cur.flags & FLAG_PERM_MASK == perms)
    }

    fn dir_info(&self, name: &str, meta: &fs::Metadata) -> FileInfo {
        let modified = mtime_secs(meta);
        let perms = self.perms_of(meta);
        let cur = self.current(name);
        if cur.name == *name && cur.is_directory() && self.unchanged(&cur, modified, perms) {
            return cur;
        }
        FileInfo {
            name: name.to_string(),
            flags: FLAG_DIRECTORY | perms,
            modified,
            version: self.clock.tick(cur.version),
            blocks: Vec::new(),
        }
    }

    fn file_info(&self, name: &str, path: &Path, meta: &fs::Metadata) -> Option<FileInfo> {
        let modified = mtime_secs(meta);
        let perms = self.perms_of(meta);
        let cur = self.current(name);
        if cur.name == *name && !cur.is_directory() && self.unchanged(&cur, modified, perms) {
            return Some(cur);
        }

        if let Some(sup) = &self.suppressor {
            let (suppressed, rate_bps) = sup.suppress(name, meta.len(), time::now_ms());
            if suppressed {
                warn!(
                    name = %name,
                    rate_kbps = (rate_bps / 1000.0) as u64,
                    "changing too fast, marking invalid"
                );
                return Some(FileInfo {
                    name: name.to_string(),
                    flags: perms | FLAG_INVALID,
                    modified,
                    version: cur.version,
                    blocks: Vec::new(),
                });
            }
        }

        let blocks = match hash_blocks(path, self.block_size) {
            Ok(blocks) => blocks,
            Err(err) => {
                warn!(name = %name, "hashing failed, skipping: {err}");
                return None;
            }
        };
        Some(FileInfo {
            name: name.to_string(),
            flags: perms,
            modified,
            version: self.clock.tick(cur.version),
            blocks,
        })
    }
}

fn mtime_secs(meta: &fs::Metadata) -> i64 {
    meta.modified()
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

fn hash_blocks(path: &Path, block_size: u32) -> std::io::Result<Vec<BlockInfo>> {
    let mut file = fs::File::open(path)?;
    let mut blocks = Vec::new();
    let mut buf = vec![0u8; block_size as usize];
    let mut offset = 0u64;
    loop {
        let n = read_full(&mut file, &mut buf)?;
        if n == 0 {
            break;
        }
        blocks.push(BlockInfo {
            offset,
            size: n as u32,
            hash: Sha256::digest(&buf[..n]).to_vec(),
        });
        offset += n as u64;
        if n < buf.len() {
            break;
        }
    }
    Ok(blocks)
}

/// Read until the buffer is full or EOF; returns the bytes read.
fn read_full(file: &mut fs::File, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = file.read(&mut buf[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}
