//! On-disk index snapshots: gzip-compressed CBOR, written crash-atomically.
//!
//! One file per repository under the index directory, named by the SHA-1
//! of the repository directory path so repositories with the same id in
//! different locations never collide. Writes go to a uniquely named temp
//! file, are fsynced, then renamed over the final name.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use minicbor::{Decoder, Encoder};
use sha1::{Digest, Sha1};
use thiserror::Error;
use tracing::debug;

use crate::core::{BlockInfo, FileInfo, RepoId, time};

#[derive(Debug, Error)]
pub enum IndexStoreError {
    #[error("io error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("index encode failed: {0}")]
    Encode(#[from] minicbor::encode::Error<std::convert::Infallible>),
}

fn index_file_name(directory: &Path) -> String {
    let digest = Sha1::digest(directory.as_os_str().as_encoded_bytes());
    let mut name = String::with_capacity(digest.len() * 2 + 7);
    for b in digest {
        name.push_str(&format!("{b:02x}"));
    }
    name.push_str(".idx.gz");
    name
}

/// Serialize `{repo, files}` and atomically replace the snapshot for
/// `directory` under `index_dir`.
pub fn save(
    repo: &RepoId,
    directory: &Path,
    index_dir: &Path,
    files: &[FileInfo],
) -> Result<(), IndexStoreError> {
    let final_path = index_dir.join(index_file_name(directory));
    let tmp_path = index_dir.join(format!(
        "{}.tmp.{}",
        index_file_name(directory),
        time::now_nanos()
    ));

    let mut payload = Vec::new();
    let mut enc = Encoder::new(&mut payload);
    enc.map(2)?;
    enc.str("repo")?;
    enc.str(repo.as_str())?;
    enc.str("files")?;
    enc.array(files.len() as u64)?;
    for f in files {
        encode_file_info(&mut enc, f)?;
    }

    let result = write_snapshot(&tmp_path, &final_path, &payload);
    if result.is_err() {
        let _ = fs::remove_file(&tmp_path);
    }
    result?;

    debug!(%repo, files = files.len(), path = %final_path.display(), "wrote index snapshot");
    Ok(())
}

fn write_snapshot(tmp: &Path, final_path: &Path, payload: &[u8]) -> Result<(), IndexStoreError> {
    let io_err = |path: &Path| {
        let path = path.to_path_buf();
        move |source| IndexStoreError::Io {
            path: path.clone(),
            source,
        }
    };

    fs::create_dir_all(final_path.parent().unwrap_or(Path::new(".")))
        .map_err(io_err(final_path))?;
    let file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(tmp)
        .map_err(io_err(tmp))?;
    let mut gz = GzEncoder::new(file, Compression::default());
    gz.write_all(payload).map_err(io_err(tmp))?;
    let file = gz.finish().map_err(io_err(tmp))?;
    file.sync_all().map_err(io_err(tmp))?;
    fs::rename(tmp, final_path).map_err(io_err(final_path))?;
    Ok(())
}

/// Read the snapshot for `(repo, directory)`. Returns an empty list on
/// any error, including a snapshot recorded for a different repository
/// id: a missing or damaged index just means a fresh scan.
pub fn load(repo: &RepoId, directory: &Path, index_dir: &Path) -> Vec<FileInfo> {
    let path = index_dir.join(index_file_name(directory));
    match read_snapshot(repo, &path) {
        Some(files) => files,
        None => {
            debug!(%repo, path = %path.display(), "no usable index snapshot");
            Vec::new()
        }
    }
}

fn read_snapshot(repo: &RepoId, path: &Path) -> Option<Vec<FileInfo>> {
    let file = File::open(path).ok()?;
    let mut raw = Vec::new();
    GzDecoder::new(file).read_to_end(&mut raw).ok()?;

    let mut dec = Decoder::new(&raw);
    let entries = dec.map().ok()??;
    let mut decoded_repo = None;
    let mut files = None;
    for _ in 0..entries {
        match dec.str().ok()? {
            "repo" => decoded_repo = Some(dec.str().ok()?.to_string()),
            "files" => {
                let count = dec.array().ok()??;
                let mut list = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    list.push(decode_file_info(&mut dec).ok()?);
                }
                files = Some(list);
            }
            _ => dec.skip().ok()?,
        }
    }

    if decoded_repo.as_deref() != Some(repo.as_str()) {
        return None;
    }
    files
}

fn encode_file_info(
    enc: &mut Encoder<&mut Vec<u8>>,
    f: &FileInfo,
) -> Result<(), minicbor::encode::Error<std::convert::Infallible>> {
    enc.map(5)?;
    enc.str("name")?;
    enc.str(&f.name)?;
    enc.str("flags")?;
    enc.u32(f.flags)?;
    enc.str("modified")?;
    enc.i64(f.modified)?;
    enc.str("version")?;
    enc.u64(f.version)?;
    enc.str("blocks")?;
    enc.array(f.blocks.len() as u64)?;
    for b in &f.blocks {
        enc.map(3)?;
        enc.str("offset")?;
        enc.u64(b.offset)?;
        enc.str("size")?;
        enc.u32(b.size)?;
        enc.str("hash")?;
        enc.bytes(&b.hash)?;
    }
    Ok(())
}

fn decode_file_info(dec: &mut Decoder<'_>) -> Result<FileInfo, minicbor::decode::Error> {
    let indefinite = || minicbor::decode::Error::message("indefinite length");
    let entries = dec.map()?.ok_or_else(indefinite)?;
    let mut f = FileInfo::default();
    for _ in 0..entries {
        match dec.str()? {
            "name" => f.name = dec.str()?.to_string(),
            "flags" => f.flags = dec.u32()?,
            "modified" => f.modified = dec.i64()?,
            "version" => f.version = dec.u64()?,
            "blocks" => {
                let count = dec.array()?.ok_or_else(indefinite)?;
                let mut blocks = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    blocks.push(decode_block(dec)?);
                }
                f.blocks = blocks;
            }
            _ => dec.skip()?,
        }
    }
    Ok(f)
}

fn decode_block(dec: &mut Decoder<'_>) -> Result<BlockInfo, minicbor::decode::Error> {
    let indefinite = || minicbor::decode::Error::message("indefinite length");
    let entries = dec.map()?.ok_or_else(indefinite)?;
    let mut b = BlockInfo::default();
    for _ in 0..entries {
        match dec.str()? {
            "offset" => b.offset = dec.u64()?,
            "size" => b.size = dec.u32()?,
            "hash" => b.hash = dec.bytes()?.to_vec(),
            _ => dec.skip()?,
        }
    }
    Ok(b)
}
