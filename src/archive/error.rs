use std::io;
use std::path::PathBuf;

use nix::errno::Errno;

use super::EntryKind;

/// Errors produced while writing an archive.
///
/// Every one of them leaves the output stream in an undefined state: the archive must be
/// discarded, there is no way to resume writing it.
#[derive(thiserror::Error, Debug)]
pub enum ArchiveError {
    #[error("invalid archive name for {path:?} (prefix length {offset})")]
    InvalidName { path: PathBuf, offset: usize },

    #[error("cannot archive {path:?}: {kind} is not supported")]
    UnsupportedType { path: PathBuf, kind: EntryKind },

    #[error("failed to resolve symlink {path:?}: {source}")]
    ReadLink { path: PathBuf, source: io::Error },

    #[error("failed to get file stat of {path:?}: {source}")]
    Stat { path: PathBuf, source: Errno },

    #[error("failed to read xattrs of {path:?}: {source}")]
    Xattr { path: PathBuf, source: Errno },

    #[error("failed to write tar header for {path:?}: {source}")]
    WriteEntry { path: PathBuf, source: io::Error },

    #[error("failed to open {path:?}: {source}")]
    OpenFile { path: PathBuf, source: io::Error },

    #[error("failed to copy file content of {path:?}: {source}")]
    CopyBody { path: PathBuf, source: io::Error },

    #[error("failed to finish archive: {0}")]
    Finish(#[source] io::Error),
}

impl ArchiveError {
    /// The source path of the entry which failed, if the error belongs to a single entry.
    pub fn path(&self) -> Option<&std::path::Path> {
        match self {
            ArchiveError::InvalidName { path, .. }
            | ArchiveError::UnsupportedType { path, .. }
            | ArchiveError::ReadLink { path, .. }
            | ArchiveError::Stat { path, .. }
            | ArchiveError::Xattr { path, .. }
            | ArchiveError::WriteEntry { path, .. }
            | ArchiveError::OpenFile { path, .. }
            | ArchiveError::CopyBody { path, .. } => Some(path),
            ArchiveError::Finish(_) => None,
        }
    }
}
