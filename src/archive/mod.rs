//! Streaming tar writer for container file systems
//!
//! Every file system entry handed to the [`ArchiveWriter`] turns into zero or more records of a
//! GNU tar stream:
//!  * `x` PAX header    -- `SCHILY.xattr.<name>` records, if the entry has extended attributes
//!  * `L`/`K` headers   -- GNU long name and long link records, if needed
//!  * header            -- type, mode, ownership, mtime, device numbers, size
//!  * payload           -- file contents, regular files only
//!
//! Sockets cannot be represented and are skipped. Entries whose owner cannot be mapped into the
//! target id range are skipped too.
//!
//! Regular files with more than one link are written once, every later name of the same inode
//! becomes a hard link record pointing to the first name.

mod entry;
mod error;
mod flags;
mod link_table;
mod writer;

pub use entry::{EntryKind, EntryStat};
pub use error::ArchiveError;
pub use flags::Flags;
pub use link_table::{LinkLookup, LinkTable};
pub use writer::{ArchiveWriter, IdRemap, SkipReason, WriterOptions};

/// Upper bound on the number of entries an export walks by default, to limit memory used by the
/// hard link table.
pub const ENTRIES_MAX: usize = 1024 * 1024;
