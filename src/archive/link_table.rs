use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Remembers the first archive name of every multiply linked regular file.
///
/// Entries are only ever added, the table lives as long as the archive it belongs to.
#[derive(Debug, Default)]
pub struct LinkTable {
    first_paths: HashMap<u64, PathBuf>,
}

/// Result of looking up an inode while it is being archived.
#[derive(Debug, Eq, PartialEq)]
pub enum LinkLookup<'a> {
    /// The inode was seen before, the body lives at this archive path.
    Known(&'a Path),
    /// First occurrence, the name was recorded and the caller has to write the body.
    Recorded,
}

impl LinkTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up `inode`, recording `name` as its first archive path if it was not yet known.
    pub fn lookup_or_insert(&mut self, inode: u64, name: &Path) -> LinkLookup<'_> {
        use std::collections::hash_map::Entry;

        match self.first_paths.entry(inode) {
            Entry::Occupied(entry) => LinkLookup::Known(entry.into_mut().as_path()),
            Entry::Vacant(entry) => {
                entry.insert(name.to_path_buf());
                LinkLookup::Recorded
            }
        }
    }

    pub fn get(&self, inode: u64) -> Option<&Path> {
        self.first_paths.get(&inode).map(PathBuf::as_path)
    }

    pub fn len(&self) -> usize {
        self.first_paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.first_paths.is_empty()
    }
}
