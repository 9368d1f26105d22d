//! Export a complete container directory.

use std::io::{self, Write};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::{bail, format_err, Context, Error};
use walkdir::WalkDir;

use crate::archive::{ArchiveWriter, WriterOptions, ENTRIES_MAX};
use crate::idmap::IdmapSet;

/// Options for [`export_container`].
#[derive(Clone, Debug)]
pub struct ExportOptions {
    pub writer: WriterOptions,
    /// Ownership of entries below the remap root is shifted out of this map.
    pub idmap: Option<IdmapSet>,
    /// Maximum number of entries to archive.
    pub entries_max: usize,
}

impl Default for ExportOptions {
    fn default() -> Self {
        Self {
            writer: WriterOptions::default(),
            idmap: None,
            entries_max: ENTRIES_MAX,
        }
    }
}

/// Archive everything below `container_dir` into `output`.
///
/// Names inside the archive are relative to `container_dir`, so a container directory produces
/// `rootfs/...`, `metadata.yaml` and `templates/...` entries. Directory contents are visited in
/// file name order, symlinks are never followed.
pub fn export_container<W: Write>(
    container_dir: &Path,
    output: W,
    options: ExportOptions,
) -> Result<W, Error> {
    let mut writer = ArchiveWriter::new(output, options.writer);
    if let Some(idmap) = options.idmap {
        writer = writer.with_remap(Arc::new(idmap));
    }

    let skipped = Arc::new(AtomicUsize::new(0));
    {
        let skipped = Arc::clone(&skipped);
        writer.on_skip(move |_path, _reason| {
            skipped.fetch_add(1, Ordering::Relaxed);
        });
    }

    let walker = WalkDir::new(container_dir)
        .follow_links(false)
        .min_depth(1)
        .sort_by_file_name();

    let mut entry_counter = 0usize;
    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => match err.io_error() {
                Some(inner) if inner.kind() == io::ErrorKind::NotFound => {
                    log::info!("ignoring vanished file: {:?}", err.path());
                    continue;
                }
                _ => {
                    return Err(format_err!(
                        "failed to walk {:?}: {}",
                        err.path().unwrap_or(container_dir),
                        err
                    ))
                }
            },
        };

        entry_counter += 1;
        if entry_counter > options.entries_max {
            bail!(
                "exceeded allowed number of file entries (> {})",
                options.entries_max
            );
        }

        let path = entry.path();
        let relative = path
            .strip_prefix(container_dir)
            .with_context(|| format!("{path:?} is not below {container_dir:?}"))?;
        let offset = path.as_os_str().len() - relative.as_os_str().len();

        let metadata = entry
            .metadata()
            .with_context(|| format!("stat failed on {path:?}"))?;

        writer
            .write_entry(offset, path, &metadata)
            .with_context(|| format!("error tarring up {path:?}"))?;
    }

    let output = writer.finish()?;

    log::info!(
        "archived {} entries from {:?}, skipped {}",
        entry_counter - skipped.load(Ordering::Relaxed),
        container_dir,
        skipped.load(Ordering::Relaxed),
    );

    Ok(output)
}
