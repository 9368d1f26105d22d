use std::ffi::{CString, OsStr};
use std::fs::{File, Metadata};
use std::io::{self, Read, Write};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use nix::errno::Errno;

use rootfs_tools::xattr;

use super::link_table::{LinkLookup, LinkTable};
use super::{ArchiveError, EntryKind, EntryStat, Flags};

/// Translation of on-disk ownership to the ownership stored in the archive.
pub trait IdRemap {
    /// Map a uid/gid pair. `None` means at least one of the ids cannot be represented.
    fn remap(&self, uid: u32, gid: u32) -> Option<(u32, u32)>;
}

impl<F> IdRemap for F
where
    F: Fn(u32, u32) -> Option<(u32, u32)>,
{
    fn remap(&self, uid: u32, gid: u32) -> Option<(u32, u32)> {
        self(uid, gid)
    }
}

/// Why an entry was left out of the archive without raising an error.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SkipReason {
    /// Sockets cannot be stored in tarballs.
    Socket,
    /// The owner has no representation in the configured id map.
    Unmappable { uid: u32, gid: u32 },
    /// The entry type was disabled via [`Flags`].
    Excluded(EntryKind),
}

/// Options for writing an archive.
#[derive(Clone, Debug)]
pub struct WriterOptions {
    /// Optional parts of the file system to include.
    pub flags: Flags,
    /// Only entries at or below this archive path have their ownership remapped. An empty path
    /// remaps every entry.
    pub remap_root: PathBuf,
}

impl Default for WriterOptions {
    fn default() -> Self {
        Self {
            flags: Flags::DEFAULT,
            remap_root: PathBuf::from("rootfs"),
        }
    }
}

type SkipCallback = Box<dyn FnMut(&Path, SkipReason) + Send>;

/// Streams file system entries into a tar archive.
///
/// Entries are added one at a time in the order the caller discovers them. Any error is fatal
/// for the whole archive since a tar stream cannot be repaired once an entry was cut short.
pub struct ArchiveWriter<W: Write> {
    builder: tar::Builder<W>,
    options: WriterOptions,
    remap: Option<Arc<dyn IdRemap + Send + Sync>>,
    hardlinks: LinkTable,
    on_skip: Option<SkipCallback>,
}

impl<W: Write> ArchiveWriter<W> {
    pub fn new(writer: W, options: WriterOptions) -> Self {
        Self {
            builder: tar::Builder::new(writer),
            options,
            remap: None,
            hardlinks: LinkTable::new(),
            on_skip: None,
        }
    }

    /// Translate the ownership of entries below the remap root through `remap`.
    pub fn with_remap(mut self, remap: Arc<dyn IdRemap + Send + Sync>) -> Self {
        self.remap = Some(remap);
        self
    }

    /// Register a callback which is told about every silently skipped entry.
    pub fn on_skip<F>(&mut self, callback: F)
    where
        F: FnMut(&Path, SkipReason) + Send + 'static,
    {
        self.on_skip = Some(Box::new(callback));
    }

    pub fn get_ref(&self) -> &W {
        self.builder.get_ref()
    }

    pub fn link_table(&self) -> &LinkTable {
        &self.hardlinks
    }

    fn skip(&mut self, path: &Path, reason: SkipReason) {
        match reason {
            SkipReason::Unmappable { uid, gid } => {
                log::info!("skipping {:?}: ownership {}:{} cannot be mapped", path, uid, gid)
            }
            SkipReason::Socket => log::debug!("skipping socket {:?}", path),
            SkipReason::Excluded(kind) => log::debug!("skipping {} {:?}", kind, path),
        }

        if let Some(ref mut callback) = self.on_skip {
            callback(path, reason);
        }
    }

    /// Add one file system entry.
    ///
    /// The name inside the archive is `path` with the first `offset` bytes removed. `metadata`
    /// must describe `path` itself, not the target of a symlink.
    pub fn write_entry(
        &mut self,
        offset: usize,
        path: &Path,
        metadata: &Metadata,
    ) -> Result<(), ArchiveError> {
        let kind = EntryKind::from(metadata.file_type());

        if kind == EntryKind::Socket {
            self.skip(path, SkipReason::Socket);
            return Ok(());
        }

        if !self.options.flags.includes(kind) {
            self.skip(path, SkipReason::Excluded(kind));
            return Ok(());
        }

        let link_target = match kind {
            EntryKind::Symlink => {
                Some(
                    std::fs::read_link(path).map_err(|source| ArchiveError::ReadLink {
                        path: path.to_owned(),
                        source,
                    })?,
                )
            }
            _ => None,
        };

        let entry_type = kind
            .tar_entry_type()
            .ok_or_else(|| ArchiveError::UnsupportedType {
                path: path.to_owned(),
                kind,
            })?;
        let name = archive_name(path, offset)?;

        let file_size = if kind.has_body() { metadata.len() } else { 0 };

        let mut header = tar::Header::new_gnu();
        header.set_entry_type(entry_type);
        header.set_mode(metadata.permissions().mode() & 0o7777);
        header.set_mtime(metadata.mtime().max(0) as u64);
        header.set_size(file_size);

        let stat = EntryStat::lstat(path).map_err(|source| ArchiveError::Stat {
            path: path.to_owned(),
            source,
        })?;

        let (uid, gid) = match self.map_owner(&name, &stat) {
            Some(ids) => ids,
            None => {
                self.skip(
                    path,
                    SkipReason::Unmappable {
                        uid: stat.uid,
                        gid: stat.gid,
                    },
                );
                return Ok(());
            }
        };
        header.set_uid(u64::from(uid));
        header.set_gid(u64::from(gid));

        let write_err = |source: io::Error| ArchiveError::WriteEntry {
            path: path.to_owned(),
            source,
        };

        header.set_device_major(stat.dev_major).map_err(write_err)?;
        header.set_device_minor(stat.dev_minor).map_err(write_err)?;

        let mut hardlink_target = None;
        if kind == EntryKind::Regular && stat.nlink > 1 {
            if let LinkLookup::Known(first) = self.hardlinks.lookup_or_insert(stat.inode, &name) {
                hardlink_target = Some(first.to_owned());
            }
        }
        if hardlink_target.is_some() {
            header.set_entry_type(tar::EntryType::Link);
            header.set_size(0);
        }

        // the xattrs of a symlink are not captured
        if kind != EntryKind::Symlink && self.options.flags.contains(Flags::WITH_XATTRS) {
            let xattrs = read_xattrs(path)?;
            if !xattrs.is_empty() {
                self.builder
                    .append_pax_extensions(
                        xattrs
                            .iter()
                            .map(|(key, value)| (key.as_str(), value.as_slice())),
                    )
                    .map_err(write_err)?;
            }
        }

        log::debug!("adding {:?} to tar", name);

        if let Some(target) = link_target.as_ref().or(hardlink_target.as_ref()) {
            return self
                .builder
                .append_link(&mut header, &name, target)
                .map_err(write_err);
        }

        if kind.has_body() {
            return self.append_file_body(&mut header, &name, path, file_size);
        }

        self.builder
            .append_data(&mut header, &name, io::empty())
            .map_err(write_err)
    }

    fn map_owner(&self, name: &Path, stat: &EntryStat) -> Option<(u32, u32)> {
        match self.remap {
            Some(ref remap) if name.starts_with(&self.options.remap_root) => {
                remap.remap(stat.uid, stat.gid)
            }
            _ => Some((stat.uid, stat.gid)),
        }
    }

    fn append_file_body(
        &mut self,
        header: &mut tar::Header,
        name: &Path,
        path: &Path,
        file_size: u64,
    ) -> Result<(), ArchiveError> {
        let file = File::open(path).map_err(|source| ArchiveError::OpenFile {
            path: path.to_owned(),
            source,
        })?;

        let mut body = SizedBody::new(file, file_size);
        let result = self.builder.append_data(header, name, &mut body);

        result.map_err(|source| {
            if body.source_failed {
                ArchiveError::CopyBody {
                    path: path.to_owned(),
                    source,
                }
            } else {
                ArchiveError::WriteEntry {
                    path: path.to_owned(),
                    source,
                }
            }
        })
    }

    /// Write the end-of-archive marker and hand back the flushed output.
    pub fn finish(self) -> Result<W, ArchiveError> {
        let mut writer = self.builder.into_inner().map_err(ArchiveError::Finish)?;
        writer.flush().map_err(ArchiveError::Finish)?;
        Ok(writer)
    }
}

/// Strip the first `offset` bytes of `path`. Leading slashes of the remainder are dropped, names
/// in the archive are always relative.
fn archive_name(path: &Path, offset: usize) -> Result<PathBuf, ArchiveError> {
    let bytes = path.as_os_str().as_bytes();
    let name = bytes.get(offset..).map(|name| {
        let start = name.iter().position(|b| *b != b'/').unwrap_or(name.len());
        &name[start..]
    });

    match name {
        Some(name) if !name.is_empty() => Ok(PathBuf::from(OsStr::from_bytes(name))),
        _ => Err(ArchiveError::InvalidName {
            path: path.to_owned(),
            offset,
        }),
    }
}

/// Read all extended attributes of `path` as PAX records, sorted by name.
fn read_xattrs(path: &Path) -> Result<Vec<(String, Vec<u8>)>, ArchiveError> {
    let xattr_err = |source: Errno| ArchiveError::Xattr {
        path: path.to_owned(),
        source,
    };

    let c_path = CString::new(path.as_os_str().as_bytes()).map_err(|_| xattr_err(Errno::EINVAL))?;

    let names = match xattr::llistxattr(&c_path) {
        Ok(names) => names,
        Err(errno) if xattr::errno_is_unsupported(errno) => return Ok(Vec::new()),
        Err(err) => return Err(xattr_err(err)),
    };

    let mut records = Vec::new();
    for attr in &names {
        let value = match xattr::lgetxattr(&c_path, attr) {
            Ok(value) => value,
            Err(Errno::ENODATA) => continue, // it got removed while we were iterating...
            Err(err) => return Err(xattr_err(err)),
        };

        match attr.to_str() {
            Ok(attr) => records.push((format!("SCHILY.xattr.{attr}"), value)),
            Err(_) => log::warn!(
                "extended attribute {:?} of {:?} is not valid UTF-8, not archived",
                attr,
                path,
            ),
        }
    }
    records.sort();

    Ok(records)
}

/// Reader yielding exactly the number of bytes announced in the tar header.
///
/// A source which ends early or still has data once the announced size was read changed while
/// being archived. Both cases are reported as read errors, the entry would not match its header.
struct SizedBody<R> {
    inner: R,
    size: u64,
    remaining: u64,
    source_failed: bool,
}

impl<R: Read> SizedBody<R> {
    fn new(inner: R, size: u64) -> Self {
        Self {
            inner,
            size,
            remaining: size,
            source_failed: false,
        }
    }

    fn source_read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.read(buf).map_err(|err| {
            if err.kind() != io::ErrorKind::Interrupted {
                self.source_failed = true;
            }
            err
        })
    }

    fn size_changed(&mut self, what: &str) -> io::Error {
        self.source_failed = true;
        io::Error::new(
            io::ErrorKind::Other,
            format!("file size {what} while reading (expected {} bytes)", self.size),
        )
    }
}

impl<R: Read> Read for SizedBody<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }

        if self.remaining == 0 {
            let mut extra = [0u8; 1];
            if self.source_read(&mut extra)? != 0 {
                return Err(self.size_changed("increased"));
            }
            return Ok(0);
        }

        let max = buf.len().min(self.remaining.min(usize::MAX as u64) as usize);
        let got = self.source_read(&mut buf[..max])?;
        if got == 0 {
            return Err(self.size_changed("shrunk"));
        }

        self.remaining -= got as u64;
        Ok(got)
    }
}
