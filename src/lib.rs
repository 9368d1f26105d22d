//! Export container root file systems as tar archives.

pub mod archive;
pub mod export;
pub mod idmap;
