use std::fmt;
use std::fs::FileType;
use std::os::unix::fs::FileTypeExt;
use std::path::Path;

use nix::sys::stat::FileStat;

/// The closed set of file types the writer distinguishes.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum EntryKind {
    Regular,
    Directory,
    Symlink,
    BlockDevice,
    CharDevice,
    Fifo,
    Socket,
    Other,
}

impl From<FileType> for EntryKind {
    fn from(file_type: FileType) -> Self {
        if file_type.is_symlink() {
            EntryKind::Symlink
        } else if file_type.is_dir() {
            EntryKind::Directory
        } else if file_type.is_file() {
            EntryKind::Regular
        } else if file_type.is_block_device() {
            EntryKind::BlockDevice
        } else if file_type.is_char_device() {
            EntryKind::CharDevice
        } else if file_type.is_fifo() {
            EntryKind::Fifo
        } else if file_type.is_socket() {
            EntryKind::Socket
        } else {
            EntryKind::Other
        }
    }
}

impl EntryKind {
    /// The tar entry type used for the header, `None` if tar has no representation.
    pub fn tar_entry_type(self) -> Option<tar::EntryType> {
        Some(match self {
            EntryKind::Regular => tar::EntryType::Regular,
            EntryKind::Directory => tar::EntryType::Directory,
            EntryKind::Symlink => tar::EntryType::Symlink,
            EntryKind::BlockDevice => tar::EntryType::Block,
            EntryKind::CharDevice => tar::EntryType::Char,
            EntryKind::Fifo => tar::EntryType::Fifo,
            EntryKind::Socket | EntryKind::Other => return None,
        })
    }

    /// Only regular files carry data in the archive, every other header has size zero.
    pub fn has_body(self) -> bool {
        self == EntryKind::Regular
    }
}

impl fmt::Display for EntryKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match self {
            EntryKind::Regular => "regular file",
            EntryKind::Directory => "directory",
            EntryKind::Symlink => "symlink",
            EntryKind::BlockDevice => "block device",
            EntryKind::CharDevice => "character device",
            EntryKind::Fifo => "fifo",
            EntryKind::Socket => "socket",
            EntryKind::Other => "unknown file type",
        })
    }
}

/// The parts of `lstat(2)` the generic `std::fs::Metadata` view does not expose portably.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct EntryStat {
    pub uid: u32,
    pub gid: u32,
    pub dev_major: u32,
    pub dev_minor: u32,
    pub inode: u64,
    pub nlink: u64,
}

impl EntryStat {
    pub fn lstat(path: &Path) -> Result<Self, nix::Error> {
        nix::sys::stat::lstat(path).map(|stat| Self::from(&stat))
    }
}

impl From<&FileStat> for EntryStat {
    fn from(stat: &FileStat) -> Self {
        Self {
            uid: stat.st_uid,
            gid: stat.st_gid,
            dev_major: nix::sys::stat::major(stat.st_rdev) as u32,
            dev_minor: nix::sys::stat::minor(stat.st_rdev) as u32,
            inode: stat.st_ino,
            nlink: u64::from(stat.st_nlink),
        }
    }
}
