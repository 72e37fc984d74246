//! The replication unit: per-file metadata and content block layout.

/// File is a tombstone; blocks are empty.
pub const FLAG_DELETED: u32 = 1 << 12;
/// File is excluded from global and need views (suppressed or unreadable).
pub const FLAG_INVALID: u32 = 1 << 13;
/// Entry is a directory; blocks are empty.
pub const FLAG_DIRECTORY: u32 = 1 << 14;
/// Unix permission bits carried in the low twelve flag bits.
pub const FLAG_PERM_MASK: u32 = 0o7777;

/// Accounting size for entries without content: directories, deletions
/// and empty files. Larger than zero so pending work stays visible in
/// progress reporting.
pub const ZERO_ENTRY_SIZE: u64 = 128;

/// One hashed span of a file's content.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BlockInfo {
    pub offset: u64,
    pub size: u32,
    pub hash: Vec<u8>,
}

/// Per-file replication metadata.
///
/// `version` is a Lamport timestamp, strictly increasing per name across
/// the cluster. The zero value (empty `name`) stands for "absent".
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FileInfo {
    /// Repository-relative path, forward-slash separated.
    pub name: String,
    pub flags: u32,
    /// Seconds since the Unix epoch.
    pub modified: i64,
    pub version: u64,
    pub blocks: Vec<BlockInfo>,
}

impl FileInfo {
    pub fn is_deleted(&self) -> bool {
        self.flags & FLAG_DELETED != 0
    }

    pub fn is_invalid(&self) -> bool {
        self.flags & FLAG_INVALID != 0
    }

    pub fn is_directory(&self) -> bool {
        self.flags & FLAG_DIRECTORY != 0
    }

    /// Content size in bytes. Entries with no content blocks (deletions,
    /// directories, empty files) are accounted at [`ZERO_ENTRY_SIZE`].
    pub fn size(&self) -> u64 {
        if self.is_deleted() || self.is_directory() || self.blocks.is_empty() {
            return ZERO_ENTRY_SIZE;
        }
        self.blocks.iter().map(|b| u64::from(b.size)).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block(offset: u64, size: u32) -> BlockInfo {
        BlockInfo {
            offset,
            size,
            hash: vec![0u8; 32],
        }
    }

    #[test]
    fn size_sums_blocks() {
        let f = FileInfo {
            name: "a".into(),
            blocks: vec![block(0, 128 * 1024), block(128 * 1024, 100)],
            ..FileInfo::default()
        };
        assert_eq!(f.size(), 128 * 1024 + 100);
    }

    #[test]
    fn size_uses_sentinel_for_contentless_entries() {
        let dir = FileInfo {
            name: "d".into(),
            flags: FLAG_DIRECTORY | 0o755,
            ..FileInfo::default()
        };
        let deleted = FileInfo {
            name: "gone".into(),
            flags: FLAG_DELETED,
            ..FileInfo::default()
        };
        let empty = FileInfo {
            name: "empty".into(),
            ..FileInfo::default()
        };
        assert_eq!(dir.size(), ZERO_ENTRY_SIZE);
        assert_eq!(deleted.size(), ZERO_ENTRY_SIZE);
        assert_eq!(empty.size(), ZERO_ENTRY_SIZE);
    }

    #[test]
    fn flag_predicates() {
        let f = FileInfo {
            flags: FLAG_DELETED | FLAG_INVALID | 0o644,
            ..FileInfo::default()
        };
        assert!(f.is_deleted());
        assert!(f.is_invalid());
        assert!(!f.is_directory());
        assert_eq!(f.flags & FLAG_PERM_MASK, 0o644);
    }
}
