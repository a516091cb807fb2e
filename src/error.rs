use crate::inode::InodeId;

/// Fatal open-time failures. When any of these is returned the engine handle
/// is never constructed.
#[derive(Debug, thiserror::Error)]
pub enum OpenError {
    #[error("I/O error: {0}.")]
    Io(#[from] std::io::Error),
    #[error("The provided volume is not an exFAT filesystem.")]
    WrongFs,
    #[error("Invalid bytes per sector shift detected: {0}. Must be between `9` and `12`.")]
    InvalidBytesPerSectorShift(u8),
    #[error(
        "Invalid sectors per cluster shift detected: {0}. Clusters must not exceed 32MB in size."
    )]
    InvalidSectorsPerClusterShift(u8),
    #[error("Invalid number of FATs detected: {0}. Must be either `1` or `2`.")]
    InvalidNumberOfFats(u8),
    #[error("FAT length of zero sectors detected.")]
    EmptyFat,
    #[error("FAT region at sector {offset} ({length} sectors) does not fit inside the volume.")]
    FatOutOfBounds { offset: u32, length: u32 },
    #[error(
        "Cluster heap at sector {offset} with {clusters} clusters does not fit inside the volume."
    )]
    HeapOutOfBounds { offset: u32, clusters: u32 },
    #[error(
        "Invalid index of root directory cluster detected: {0}. Must be bigger than `2` and at most `cluster_count + 1`."
    )]
    InvalidRootDirectoryClusterIndex(u32),
    #[error("Allocation bitmap could not be located in the root directory.")]
    BitmapMissing,
    #[error(
        "Corrupt allocation bitmap entry: claims {found} bytes but the cluster heap needs {expected}."
    )]
    BitmapWrongLength { expected: u64, found: u64 },
    #[error("Allocation bitmap first cluster {0} lies outside the cluster heap.")]
    BitmapOutOfBounds(u32),
}

/// Failures scoped to a single operation. The engine stays usable after any
/// of these.
#[derive(Debug, thiserror::Error)]
pub enum WalkError {
    #[error("I/O error: {0}.")]
    Io(#[from] std::io::Error),
    #[error("Inode #{0} does not denote a directory-entry slot of this volume.")]
    UnknownInode(InodeId),
    #[error("Inode #{0} does not hold a parseable file entry set.")]
    NotAnEntry(InodeId),
    #[error("Inode #{0} is not a directory.")]
    NotADirectory(InodeId),
}

/// Recoverable conditions, reported alongside the entries they pertain to.
/// None of these aborts iteration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Diagnostic {
    /// The first four slots of a directory sector all failed classification;
    /// the rest of the directory was parsed with deep validity checks.
    CorruptDirectory { dir: InodeId },
    /// A FAT chain revisited a cluster. The run list covers the chain up to
    /// the repeated cluster.
    LoopDetected { cluster: u32 },
    /// UTF-16 name decoding produced replacement characters.
    NameDecodeLossy { id: InodeId },
    /// Descent stopped because the depth or path-length bound was hit.
    DepthLimitExceeded { dir: InodeId },
}
