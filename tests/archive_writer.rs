use std::ffi::CString;
use std::fs;
use std::io::Read;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::symlink;
use std::os::unix::net::UnixListener;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::Error;
use nix::sys::stat::Mode;

use rootfs_export::archive::{
    ArchiveError, ArchiveWriter, EntryKind, Flags, SkipReason, WriterOptions,
};

#[derive(Debug)]
struct ReadEntry {
    path: PathBuf,
    entry_type: tar::EntryType,
    size: u64,
    uid: u64,
    gid: u64,
    link_name: Option<PathBuf>,
    device: (u32, u32),
    xattrs: Vec<(String, Vec<u8>)>,
    data: Vec<u8>,
}

fn read_archive(data: &[u8]) -> Result<Vec<ReadEntry>, Error> {
    let mut archive = tar::Archive::new(data);
    let mut list = Vec::new();

    for entry in archive.entries()? {
        let mut entry = entry?;

        let mut xattrs = Vec::new();
        if let Some(extensions) = entry.pax_extensions()? {
            for extension in extensions {
                let extension = extension?;
                xattrs.push((extension.key()?.to_string(), extension.value_bytes().to_vec()));
            }
        }

        let header = entry.header();
        let path = entry.path()?.into_owned();
        let entry_type = header.entry_type();
        let size = header.size()?;
        let uid = header.uid()?;
        let gid = header.gid()?;
        let device = (
            header.device_major()?.unwrap_or(0),
            header.device_minor()?.unwrap_or(0),
        );
        let link_name = entry.link_name()?.map(|name| name.into_owned());

        let mut data = Vec::new();
        entry.read_to_end(&mut data)?;

        list.push(ReadEntry {
            path,
            entry_type,
            size,
            uid,
            gid,
            link_name,
            device,
            xattrs,
            data,
        });
    }

    Ok(list)
}

/// Write the given paths below `base` with names relative to `base`.
fn archive_paths(
    writer: &mut ArchiveWriter<Vec<u8>>,
    base: &Path,
    paths: &[&str],
) -> Result<(), Error> {
    let offset = base.as_os_str().len() + 1;
    for name in paths {
        let path = base.join(name);
        let metadata = fs::symlink_metadata(&path)?;
        writer.write_entry(offset, &path, &metadata)?;
    }
    Ok(())
}

fn current_ids() -> (u32, u32) {
    (
        nix::unistd::getuid().as_raw(),
        nix::unistd::getgid().as_raw(),
    )
}

#[test]
fn hardlinks_are_stored_once() -> Result<(), Error> {
    let dir = tempfile::tempdir()?;
    let rootfs = dir.path().join("rootfs");
    fs::create_dir(&rootfs)?;
    fs::write(rootfs.join("a"), b"shared content")?;
    fs::hard_link(rootfs.join("a"), rootfs.join("b"))?;
    fs::hard_link(rootfs.join("a"), rootfs.join("c"))?;

    let mut writer = ArchiveWriter::new(Vec::new(), WriterOptions::default());
    archive_paths(&mut writer, &rootfs, &["a", "b", "c"])?;
    assert_eq!(writer.link_table().len(), 1);
    let data = writer.finish()?;

    let entries = read_archive(&data)?;
    assert_eq!(entries.len(), 3);

    assert_eq!(entries[0].path, Path::new("a"));
    assert_eq!(entries[0].entry_type, tar::EntryType::Regular);
    assert_eq!(entries[0].data, b"shared content");

    for entry in &entries[1..] {
        assert_eq!(entry.entry_type, tar::EntryType::Link);
        assert_eq!(entry.size, 0);
        assert_eq!(entry.link_name.as_deref(), Some(Path::new("a")));
        assert!(entry.data.is_empty());
    }

    Ok(())
}

#[test]
fn sockets_are_skipped() -> Result<(), Error> {
    let dir = tempfile::tempdir()?;
    fs::write(dir.path().join("file"), b"data")?;
    let _listener = UnixListener::bind(dir.path().join("sock"))?;

    let skipped = Arc::new(Mutex::new(Vec::new()));
    let mut writer = ArchiveWriter::new(Vec::new(), WriterOptions::default());
    {
        let skipped = Arc::clone(&skipped);
        writer.on_skip(move |path, reason| {
            skipped.lock().unwrap().push((path.to_owned(), reason));
        });
    }

    archive_paths(&mut writer, dir.path(), &["sock", "file"])?;
    let entries = read_archive(&writer.finish()?)?;

    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].path, Path::new("file"));

    let skipped = skipped.lock().unwrap();
    assert_eq!(*skipped, vec![(dir.path().join("sock"), SkipReason::Socket)]);

    Ok(())
}

#[test]
fn directories_and_symlinks_have_no_size() -> Result<(), Error> {
    let dir = tempfile::tempdir()?;
    let rootfs = dir.path().join("rootfs");
    fs::create_dir_all(rootfs.join("etc"))?;
    symlink("/etc/passwd", rootfs.join("link"))?;

    let mut writer = ArchiveWriter::new(Vec::new(), WriterOptions::default());
    archive_paths(&mut writer, &rootfs, &["etc", "link"])?;
    let entries = read_archive(&writer.finish()?)?;

    assert_eq!(entries.len(), 2);

    assert_eq!(entries[0].path, Path::new("etc"));
    assert_eq!(entries[0].entry_type, tar::EntryType::Directory);
    assert_eq!(entries[0].size, 0);

    assert_eq!(entries[1].path, Path::new("link"));
    assert_eq!(entries[1].entry_type, tar::EntryType::Symlink);
    assert_eq!(entries[1].size, 0);
    assert_eq!(entries[1].link_name.as_deref(), Some(Path::new("/etc/passwd")));
    assert!(entries[1].xattrs.is_empty());

    Ok(())
}

#[test]
fn unmappable_owner_drops_entry() -> Result<(), Error> {
    let dir = tempfile::tempdir()?;
    fs::create_dir(dir.path().join("rootfs"))?;
    fs::write(dir.path().join("rootfs/file"), b"x")?;
    fs::write(dir.path().join("metadata.yaml"), b"architecture: x86_64\n")?;

    let (uid, gid) = current_ids();
    let skipped = Arc::new(Mutex::new(Vec::new()));

    let remap = |_uid: u32, _gid: u32| -> Option<(u32, u32)> { None };
    let mut writer =
        ArchiveWriter::new(Vec::new(), WriterOptions::default()).with_remap(Arc::new(remap));
    {
        let skipped = Arc::clone(&skipped);
        writer.on_skip(move |path, reason| {
            skipped.lock().unwrap().push((path.to_owned(), reason));
        });
    }

    // entries after a skipped one are still written
    archive_paths(&mut writer, dir.path(), &["rootfs/file", "metadata.yaml"])?;
    let entries = read_archive(&writer.finish()?)?;

    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].path, Path::new("metadata.yaml"));
    assert_eq!(entries[0].uid, u64::from(uid));
    assert_eq!(entries[0].gid, u64::from(gid));

    let skipped = skipped.lock().unwrap();
    assert_eq!(
        *skipped,
        vec![(
            dir.path().join("rootfs/file"),
            SkipReason::Unmappable { uid, gid }
        )]
    );

    Ok(())
}

#[test]
fn owners_below_remap_root_are_shifted() -> Result<(), Error> {
    let dir = tempfile::tempdir()?;
    fs::create_dir(dir.path().join("rootfs"))?;
    fs::write(dir.path().join("rootfs/file"), b"x")?;
    fs::create_dir(dir.path().join("rootfsx"))?;

    let (uid, gid) = current_ids();

    let remap = |uid: u32, gid: u32| -> Option<(u32, u32)> {
        Some((uid.checked_add(1000)?, gid.checked_add(2000)?))
    };
    let mut writer =
        ArchiveWriter::new(Vec::new(), WriterOptions::default()).with_remap(Arc::new(remap));

    archive_paths(&mut writer, dir.path(), &["rootfs", "rootfs/file", "rootfsx"])?;
    let entries = read_archive(&writer.finish()?)?;

    assert_eq!(entries.len(), 3);
    for entry in &entries[..2] {
        assert_eq!(entry.uid, u64::from(uid) + 1000);
        assert_eq!(entry.gid, u64::from(gid) + 2000);
    }

    // only whole path components match the remap root
    assert_eq!(entries[2].path, Path::new("rootfsx"));
    assert_eq!(entries[2].uid, u64::from(uid));
    assert_eq!(entries[2].gid, u64::from(gid));

    Ok(())
}

#[test]
fn device_nodes_and_fifos() -> Result<(), Error> {
    let dir = tempfile::tempdir()?;
    nix::unistd::mkfifo(&dir.path().join("fifo"), Mode::S_IRUSR | Mode::S_IWUSR)?;

    let mut writer = ArchiveWriter::new(Vec::new(), WriterOptions::default());
    archive_paths(&mut writer, dir.path(), &["fifo"])?;
    archive_paths(&mut writer, Path::new("/dev"), &["null"])?;
    let entries = read_archive(&writer.finish()?)?;

    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0].entry_type, tar::EntryType::Fifo);
    assert_eq!(entries[0].size, 0);

    assert_eq!(entries[1].path, Path::new("null"));
    assert_eq!(entries[1].entry_type, tar::EntryType::Char);
    assert_eq!(entries[1].size, 0);
    assert_eq!(entries[1].device, (1, 3));

    let options = WriterOptions {
        flags: Flags::DEFAULT - Flags::WITH_FIFOS - Flags::WITH_DEVICE_NODES,
        ..Default::default()
    };
    let skipped = Arc::new(Mutex::new(Vec::new()));
    let mut writer = ArchiveWriter::new(Vec::new(), options);
    {
        let skipped = Arc::clone(&skipped);
        writer.on_skip(move |_path, reason| skipped.lock().unwrap().push(reason));
    }
    archive_paths(&mut writer, dir.path(), &["fifo"])?;
    archive_paths(&mut writer, Path::new("/dev"), &["null"])?;
    let entries = read_archive(&writer.finish()?)?;

    assert!(entries.is_empty());
    assert_eq!(
        *skipped.lock().unwrap(),
        vec![
            SkipReason::Excluded(EntryKind::Fifo),
            SkipReason::Excluded(EntryKind::CharDevice),
        ]
    );

    Ok(())
}

#[test]
fn xattrs_are_stored_as_pax_records() -> Result<(), Error> {
    let dir = tempfile::tempdir()?;
    let file = dir.path().join("file");
    fs::write(&file, b"data")?;

    let c_path = CString::new(file.as_os_str().as_bytes())?;
    let set = |name: &str, value: &[u8]| {
        rootfs_tools::xattr::lsetxattr(&c_path, &CString::new(name).unwrap(), value)
    };
    match set("user.b", b"second") {
        Ok(()) => (),
        Err(errno) if rootfs_tools::xattr::errno_is_unsupported(errno) => return Ok(()),
        Err(errno) => return Err(errno.into()),
    }
    set("user.a", b"first")?;

    let mut writer = ArchiveWriter::new(Vec::new(), WriterOptions::default());
    archive_paths(&mut writer, dir.path(), &["file"])?;
    let entries = read_archive(&writer.finish()?)?;

    assert_eq!(entries.len(), 1);
    let user_xattrs: Vec<_> = entries[0]
        .xattrs
        .iter()
        .filter(|(key, _)| key.starts_with("SCHILY.xattr.user."))
        .cloned()
        .collect();
    assert_eq!(
        user_xattrs,
        vec![
            ("SCHILY.xattr.user.a".to_string(), b"first".to_vec()),
            ("SCHILY.xattr.user.b".to_string(), b"second".to_vec()),
        ]
    );
    assert_eq!(entries[0].data, b"data");

    let options = WriterOptions {
        flags: Flags::DEFAULT - Flags::WITH_XATTRS,
        ..Default::default()
    };
    let mut writer = ArchiveWriter::new(Vec::new(), options);
    archive_paths(&mut writer, dir.path(), &["file"])?;
    let entries = read_archive(&writer.finish()?)?;
    assert!(entries[0].xattrs.is_empty());

    Ok(())
}

#[test]
fn long_names_survive() -> Result<(), Error> {
    let dir = tempfile::tempdir()?;
    let name = "n".repeat(150);
    fs::write(dir.path().join(&name), b"long")?;

    let mut writer = ArchiveWriter::new(Vec::new(), WriterOptions::default());
    archive_paths(&mut writer, dir.path(), &[name.as_str()])?;
    let entries = read_archive(&writer.finish()?)?;

    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].path, Path::new(&name));
    assert_eq!(entries[0].data, b"long");

    Ok(())
}

#[test]
fn finish_writes_trailer() -> Result<(), Error> {
    let writer = ArchiveWriter::new(Vec::new(), WriterOptions::default());
    let data = writer.finish()?;
    assert_eq!(data, vec![0u8; 1024]);

    let dir = tempfile::tempdir()?;
    fs::write(dir.path().join("file"), b"content")?;
    let mut writer = ArchiveWriter::new(Vec::new(), WriterOptions::default());
    archive_paths(&mut writer, dir.path(), &["file"])?;
    let data = writer.finish()?;

    assert_eq!(data.len() % 512, 0);
    assert!(data[data.len() - 1024..].iter().all(|b| *b == 0));

    Ok(())
}

#[test]
fn entry_errors() -> Result<(), Error> {
    let dir = tempfile::tempdir()?;
    let file = dir.path().join("file");
    fs::write(&file, b"content")?;
    let metadata = fs::symlink_metadata(&file)?;

    let mut writer = ArchiveWriter::new(Vec::new(), WriterOptions::default());

    let offset = file.as_os_str().len();
    match writer.write_entry(offset, &file, &metadata) {
        Err(ArchiveError::InvalidName { path, .. }) => assert_eq!(path, file),
        other => panic!("expected invalid name error, got {other:?}"),
    }

    let link = dir.path().join("link");
    symlink("file", &link)?;
    let link_metadata = fs::symlink_metadata(&link)?;
    fs::remove_file(&link)?;
    let err = writer
        .write_entry(dir.path().as_os_str().len() + 1, &link, &link_metadata)
        .unwrap_err();
    assert!(matches!(err, ArchiveError::ReadLink { .. }));
    assert_eq!(err.path(), Some(link.as_path()));

    fs::remove_file(&file)?;
    let err = writer
        .write_entry(dir.path().as_os_str().len() + 1, &file, &metadata)
        .unwrap_err();
    assert!(matches!(err, ArchiveError::Stat { .. }));

    Ok(())
}

#[test]
fn file_grown_since_stat_is_fatal() -> Result<(), Error> {
    let dir = tempfile::tempdir()?;
    let file = dir.path().join("file");
    fs::write(&file, b"hello")?;
    let metadata = fs::symlink_metadata(&file)?;
    fs::write(&file, b"hello, a lot more data")?;

    let mut writer = ArchiveWriter::new(Vec::new(), WriterOptions::default());
    let err = writer
        .write_entry(dir.path().as_os_str().len() + 1, &file, &metadata)
        .unwrap_err();
    match err {
        ArchiveError::CopyBody { path, source } => {
            assert_eq!(path, file);
            assert!(source.to_string().contains("increased"), "{source}");
        }
        other => panic!("expected copy error, got {other:?}"),
    }

    Ok(())
}

#[test]
fn file_shrunk_since_stat_is_fatal() -> Result<(), Error> {
    let dir = tempfile::tempdir()?;
    let file = dir.path().join("file");
    fs::write(&file, b"hello world")?;
    let metadata = fs::symlink_metadata(&file)?;
    fs::write(&file, b"he")?;

    let mut writer = ArchiveWriter::new(Vec::new(), WriterOptions::default());
    let err = writer
        .write_entry(dir.path().as_os_str().len() + 1, &file, &metadata)
        .unwrap_err();
    match err {
        ArchiveError::CopyBody { path, source } => {
            assert_eq!(path, file);
            assert!(source.to_string().contains("shrunk"), "{source}");
        }
        other => panic!("expected copy error, got {other:?}"),
    }

    Ok(())
}

#[test]
fn body_open_and_read_errors() -> Result<(), Error> {
    let dir = tempfile::tempdir()?;
    let offset = dir.path().as_os_str().len() + 1;
    let file = dir.path().join("file");
    fs::write(&file, b"content")?;
    let metadata = fs::symlink_metadata(&file)?;

    let mut writer = ArchiveWriter::new(Vec::new(), WriterOptions::default());

    // a dangling symlink passes lstat but cannot be opened
    let dangling = dir.path().join("dangling");
    symlink("missing", &dangling)?;
    let err = writer.write_entry(offset, &dangling, &metadata).unwrap_err();
    assert!(matches!(err, ArchiveError::OpenFile { .. }), "{err:?}");
    assert_eq!(err.path(), Some(dangling.as_path()));

    // a directory opens fine, reading it fails with EISDIR
    let subdir = dir.path().join("subdir");
    fs::create_dir(&subdir)?;
    let err = writer.write_entry(offset, &subdir, &metadata).unwrap_err();
    assert!(matches!(err, ArchiveError::CopyBody { .. }), "{err:?}");
    assert_eq!(err.path(), Some(subdir.as_path()));

    Ok(())
}

#[test]
fn non_utf8_xattr_names_are_left_out() -> Result<(), Error> {
    let dir = tempfile::tempdir()?;
    let file = dir.path().join("file");
    fs::write(&file, b"data")?;

    let c_path = CString::new(file.as_os_str().as_bytes())?;
    let invalid = CString::new(&b"user.\xff\xfe"[..])?;
    if rootfs_tools::xattr::lsetxattr(&c_path, &invalid, b"binary").is_err() {
        // the backing file system does not take user xattrs or refuses the name
        return Ok(());
    }
    rootfs_tools::xattr::lsetxattr(&c_path, &CString::new("user.valid")?, b"kept")?;

    let mut writer = ArchiveWriter::new(Vec::new(), WriterOptions::default());
    archive_paths(&mut writer, dir.path(), &["file"])?;
    let entries = read_archive(&writer.finish()?)?;

    assert_eq!(entries.len(), 1);
    let user_xattrs: Vec<_> = entries[0]
        .xattrs
        .iter()
        .filter(|(key, _)| key.starts_with("SCHILY.xattr.user."))
        .collect();
    assert_eq!(
        user_xattrs,
        vec![&("SCHILY.xattr.user.valid".to_string(), b"kept".to_vec())]
    );
    assert_eq!(entries[0].data, b"data");

    Ok(())
}
