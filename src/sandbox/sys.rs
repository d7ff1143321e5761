//! Thin wrappers over the mount/chroot/mknod/kill/statfs syscalls.

use std::ffi::CString;
use std::fs::File;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::AsRawFd;
use std::path::Path;
use std::ptr;

pub use libc::{c_ulong, MNT_DETACH, MS_BIND, MS_MOVE, MS_PRIVATE, MS_REC};

fn path_cstr(path: &Path) -> io::Result<CString> {
    Ok(CString::new(path.as_os_str().as_bytes())?)
}

fn opt_cstr(value: &str) -> io::Result<Option<CString>> {
    if value.is_empty() {
        Ok(None)
    } else {
        Ok(Some(CString::new(value)?))
    }
}

fn cvt(ret: libc::c_int) -> io::Result<()> {
    if ret == -1 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

pub fn mount(source: &str, target: &Path, fstype: &str, flags: c_ulong, data: &str) -> io::Result<()> {
    let source = CString::new(source)?;
    let target = path_cstr(target)?;
    let fstype = opt_cstr(fstype)?;
    let data = opt_cstr(data)?;

    tracing::debug!(
        source = ?source,
        target = ?target,
        fstype = ?fstype,
        flags,
        "mount"
    );

    // SAFETY: every pointer is either null or a valid NUL-terminated string
    // that outlives the call.
    cvt(unsafe {
        libc::mount(
            source.as_ptr(),
            target.as_ptr(),
            fstype.as_ref().map_or(ptr::null(), |s| s.as_ptr()),
            flags,
            data.as_ref()
                .map_or(ptr::null(), |s| s.as_ptr() as *const libc::c_void),
        )
    })
}

pub fn umount2(target: &Path, flags: libc::c_int) -> io::Result<()> {
    let target = path_cstr(target)?;
    // SAFETY: `target` is a valid NUL-terminated string.
    cvt(unsafe { libc::umount2(target.as_ptr(), flags) })
}

pub fn chroot(path: &Path) -> io::Result<()> {
    let path = path_cstr(path)?;
    // SAFETY: `path` is a valid NUL-terminated string.
    cvt(unsafe { libc::chroot(path.as_ptr()) })
}

/// Change the working directory to an already opened directory.
pub fn fchdir(dir: &File) -> io::Result<()> {
    // SAFETY: the descriptor is owned by `dir` and open for the whole call.
    cvt(unsafe { libc::fchdir(dir.as_raw_fd()) })
}

pub fn mknod(path: &Path, mode: libc::mode_t, major: u32, minor: u32) -> io::Result<()> {
    let path = path_cstr(path)?;
    let dev = libc::makedev(major, minor);
    // SAFETY: `path` is a valid NUL-terminated string.
    cvt(unsafe { libc::mknod(path.as_ptr(), mode, dev) })
}

pub fn kill(pid: libc::pid_t, signal: libc::c_int) -> io::Result<()> {
    // SAFETY: kill has no memory safety preconditions.
    cvt(unsafe { libc::kill(pid, signal) })
}

/// Filesystem magic number (`f_type`) of the filesystem holding `path`.
pub fn statfs_magic(path: &Path) -> io::Result<i64> {
    let path = path_cstr(path)?;
    // SAFETY: an all-zero statfs is a valid value for the kernel to fill in.
    let mut stat: libc::statfs = unsafe { std::mem::zeroed() };
    // SAFETY: `path` is a valid NUL-terminated string and `stat` is writable.
    cvt(unsafe { libc::statfs(path.as_ptr(), &mut stat) })?;
    Ok(stat.f_type as i64)
}

pub fn sync() {
    // SAFETY: sync takes no arguments and cannot fail.
    unsafe { libc::sync() }
}

pub fn is_root() -> bool {
    // SAFETY: geteuid never fails and takes no arguments.
    unsafe { libc::geteuid() == 0 }
}
