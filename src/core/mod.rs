//! Core value types: identities, file metadata, logical time.

pub mod clock;
pub mod file_info;
pub mod identity;
pub mod time;

pub use clock::LamportClock;
pub use file_info::{
    BlockInfo, FileInfo, FLAG_DELETED, FLAG_DIRECTORY, FLAG_INVALID, FLAG_PERM_MASK,
    ZERO_ENTRY_SIZE,
};
pub use identity::{NodeId, NodeIdError, RepoId, RepoIdError};
