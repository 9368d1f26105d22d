//! Path based wrappers for the libc xattr calls.
//!
//! All of these operate on the link itself (`l*xattr`), so a symbolic link is never followed.
//! Device nodes and fifos can be queried without opening them.

use std::ffi::CStr;

use nix::errno::Errno;

/// Attribute names of one path as returned by [`llistxattr`].
///
/// The kernel hands back the names as one buffer of NUL terminated strings, iterating yields
/// each of them as a `&CStr` without copying.
pub struct ListXAttr {
    data: Vec<u8>,
}

impl ListXAttr {
    fn new(data: Vec<u8>) -> Self {
        Self { data }
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl<'a> IntoIterator for &'a ListXAttr {
    type Item = &'a CStr;
    type IntoIter = ListXAttrIter<'a>;

    fn into_iter(self) -> Self::IntoIter {
        ListXAttrIter {
            data: &self.data,
            at: 0,
        }
    }
}

/// Iterator over the extended attribute entries in a `ListXAttr`.
pub struct ListXAttrIter<'a> {
    data: &'a [u8],
    at: usize,
}

impl<'a> Iterator for ListXAttrIter<'a> {
    type Item = &'a CStr;

    fn next(&mut self) -> Option<&'a CStr> {
        let data = &self.data[self.at..];
        let next = data.iter().position(|b| *b == 0)? + 1;
        self.at += next;
        CStr::from_bytes_with_nul(&data[..next]).ok()
    }
}

/// Return the extended attribute names of `path` without following symlinks.
pub fn llistxattr(path: &CStr) -> Result<ListXAttr, Errno> {
    // Initial buffer size for the attribute list, if content does not fit
    // it gets dynamically increased until big enough.
    let mut size = 256;
    let mut buffer = vec![0u8; size];
    let mut bytes = unsafe {
        libc::llistxattr(
            path.as_ptr(),
            buffer.as_mut_ptr() as *mut libc::c_char,
            buffer.len(),
        )
    };
    while bytes < 0 {
        match Errno::last() {
            Errno::ERANGE => {
                // Buffer was not big enough to fit the list, retry with double the size
                size = size.checked_mul(2).ok_or(Errno::ENOMEM)?;
            }
            err => return Err(err),
        }
        buffer.resize(size, 0);
        bytes = unsafe {
            libc::llistxattr(
                path.as_ptr(),
                buffer.as_mut_ptr() as *mut libc::c_char,
                buffer.len(),
            )
        };
    }
    buffer.truncate(bytes as usize);

    Ok(ListXAttr::new(buffer))
}

/// Read the value of attribute `name` of `path`, without following symlinks.
///
/// Both arguments go straight to the syscall, hence the `&CStr` types. Names taken from a
/// [`ListXAttr`] can be passed as they are.
pub fn lgetxattr(path: &CStr, name: &CStr) -> Result<Vec<u8>, Errno> {
    let mut size = 256;
    let mut buffer = vec![0u8; size];
    let mut bytes = unsafe {
        libc::lgetxattr(
            path.as_ptr(),
            name.as_ptr(),
            buffer.as_mut_ptr() as *mut libc::c_void,
            buffer.len(),
        )
    };
    while bytes < 0 {
        match Errno::last() {
            Errno::ERANGE => {
                // Buffer was not big enough to fit the value, retry with double the size
                size = size.checked_mul(2).ok_or(Errno::ENOMEM)?;
            }
            err => return Err(err),
        }
        buffer.resize(size, 0);
        bytes = unsafe {
            libc::lgetxattr(
                path.as_ptr(),
                name.as_ptr(),
                buffer.as_mut_ptr() as *mut libc::c_void,
                buffer.len(),
            )
        };
    }
    buffer.truncate(bytes as usize);

    Ok(buffer)
}

/// Set an extended attribute on `path` without following symlinks.
pub fn lsetxattr(path: &CStr, name: &CStr, data: &[u8]) -> Result<(), Errno> {
    let result = unsafe {
        libc::lsetxattr(
            path.as_ptr(),
            name.as_ptr(),
            data.as_ptr() as *const libc::c_void,
            data.len(),
            0,
        )
    };
    Errno::result(result).map(drop)
}

/// Errors which mean the file system simply cannot carry extended attributes.
pub fn errno_is_unsupported(errno: Errno) -> bool {
    matches!(errno, Errno::EOPNOTSUPP | Errno::ENOSYS)
}
