use std::fs::{File, OpenOptions};
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use anyhow::{bail, format_err, Context, Error};

use rootfs_export::archive::{Flags, WriterOptions, ENTRIES_MAX};
use rootfs_export::export::{export_container, ExportOptions};
use rootfs_export::idmap::{IdmapEntry, IdmapSet};
use rootfs_tools::io::ProgressWriter;

use proxmox_router::cli::*;
use proxmox_schema::api;

/// Progress is logged every time this many more bytes were written.
const PROGRESS_INTERVAL: u64 = 64 * 1024 * 1024;

fn load_idmap(
    entries: Option<Vec<String>>,
    idmap_file: Option<String>,
) -> Result<Option<IdmapSet>, Error> {
    let mut idmap = match idmap_file {
        Some(path) => {
            let data = std::fs::read_to_string(&path)
                .with_context(|| format!("unable to read id map {path:?}"))?;
            IdmapSet::from_json(&data).with_context(|| format!("invalid id map {path:?}"))?
        }
        None => IdmapSet::new(),
    };

    for entry in entries.unwrap_or_default() {
        let entry: IdmapEntry = entry
            .parse()
            .map_err(|err| format_err!("error in id map entry {entry:?}: {err}"))?;
        idmap.append(entry)?;
    }

    Ok(if idmap.is_empty() { None } else { Some(idmap) })
}

#[api(
    input: {
        properties: {
            archive: {
                description: "Archive name, '-' writes to standard output.",
            },
            source: {
                description: "Container directory.",
            },
            "no-xattrs": {
                description: "Ignore extended file attributes.",
                optional: true,
                default: false,
            },
            "no-device-nodes": {
                description: "Ignore device nodes.",
                optional: true,
                default: false,
            },
            "no-fifos": {
                description: "Ignore fifos.",
                optional: true,
                default: false,
            },
            idmap: {
                description: "List of id map entries used to shift ownership out of the container.",
                optional: true,
                type: Array,
                items: {
                    description: "Id map entry of the form 'u|g|b:nsid:hostid:range'.",
                    type: String,
                },
            },
            "idmap-file": {
                description: "JSON file containing the id map of the container.",
                optional: true,
            },
            "remap-root": {
                description: "Only entries below this archive path have their ownership shifted.",
                optional: true,
                default: "rootfs",
            },
            "entries-max": {
                description: "Max number of entries to archive",
                optional: true,
                default: ENTRIES_MAX as isize,
                minimum: 0,
                maximum: isize::MAX,
            },
        },
    },
)]
/// Create a tar archive from a container directory.
#[allow(clippy::too_many_arguments)]
fn create_archive(
    archive: String,
    source: String,
    no_xattrs: bool,
    no_device_nodes: bool,
    no_fifos: bool,
    idmap: Option<Vec<String>>,
    idmap_file: Option<String>,
    remap_root: String,
    entries_max: isize,
) -> Result<(), Error> {
    let source = PathBuf::from(source);
    if !source.is_dir() {
        bail!("source {source:?} is not a directory");
    }

    let mut flags = Flags::DEFAULT;
    if no_xattrs {
        flags.remove(Flags::WITH_XATTRS);
    }
    if no_device_nodes {
        flags.remove(Flags::WITH_DEVICE_NODES);
    }
    if no_fifos {
        flags.remove(Flags::WITH_FIFOS);
    }

    let options = ExportOptions {
        writer: WriterOptions {
            flags,
            remap_root: PathBuf::from(remap_root),
        },
        idmap: load_idmap(idmap, idmap_file)?,
        entries_max: entries_max as usize,
    };

    let output: Box<dyn Write> = if archive == "-" {
        Box::new(std::io::stdout())
    } else {
        Box::new(
            OpenOptions::new()
                .create_new(true)
                .write(true)
                .mode(0o640)
                .open(&archive)
                .with_context(|| format!("unable to create archive {archive:?}"))?,
        )
    };

    let writer = std::io::BufWriter::with_capacity(1024 * 1024, output);

    let mut next_report = PROGRESS_INTERVAL;
    let writer = ProgressWriter::new(writer, move |written| {
        if written >= next_report {
            log::debug!("{} MiB written", written / (1024 * 1024));
            next_report = written + PROGRESS_INTERVAL;
        }
    });

    let writer = export_container(&source, writer, options)?;
    log::debug!("archive size: {} bytes", writer.written());

    let mut writer = writer.into_inner();
    writer.flush()?;

    Ok(())
}

fn format_entry<R: std::io::Read>(entry: &tar::Entry<R>) -> Result<String, Error> {
    let header = entry.header();
    let path = entry.path()?;

    let kind = match header.entry_type() {
        tar::EntryType::Regular => '-',
        tar::EntryType::Directory => 'd',
        tar::EntryType::Symlink => 'l',
        tar::EntryType::Link => 'h',
        tar::EntryType::Block => 'b',
        tar::EntryType::Char => 'c',
        tar::EntryType::Fifo => 'p',
        _ => '?',
    };

    let mut line = format!(
        "{kind} {:04o} {:>6}/{:<6} {:>10} {}",
        header.mode()?,
        header.uid()?,
        header.gid()?,
        header.size()?,
        path.display(),
    );

    if let Some(target) = entry.link_name()? {
        line.push_str(" -> ");
        line.push_str(&target.to_string_lossy());
    }

    Ok(line)
}

#[api(
    input: {
        properties: {
            archive: {
                description: "Archive name.",
            },
        },
    },
)]
/// List the contents of an archive.
fn dump_archive(archive: String) -> Result<(), Error> {
    let file = File::open(Path::new(&archive))
        .with_context(|| format!("unable to open archive {archive:?}"))?;
    let mut reader = tar::Archive::new(file);

    for entry in reader.entries()? {
        let entry = entry?;

        if log::log_enabled!(log::Level::Debug) {
            log::debug!("{}", format_entry(&entry)?);
        } else {
            log::info!("{:?}", entry.path()?);
        }
    }
    Ok(())
}

fn main() {
    init_cli_logger("ROOTFS_EXPORT_LOG", "info");

    let cmd_def = CliCommandMap::new()
        .insert(
            "create",
            CliCommand::new(&API_METHOD_CREATE_ARCHIVE)
                .arg_param(&["archive", "source"])
                .completion_cb("archive", complete_file_name)
                .completion_cb("source", complete_file_name)
                .completion_cb("idmap-file", complete_file_name),
        )
        .insert(
            "list",
            CliCommand::new(&API_METHOD_DUMP_ARCHIVE)
                .arg_param(&["archive"])
                .completion_cb("archive", complete_file_name),
        );

    let rpcenv = CliEnvironment::new();
    run_cli_command(
        cmd_def,
        rpcenv,
        Some(|future| proxmox_async::runtime::main(future)),
    );
}
