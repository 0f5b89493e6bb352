//! The trait every component performing filesystem access is written
//! against.

use std::os::unix::io::RawFd;
use std::path::{Path, PathBuf};

use nix::fcntl::OFlag;
use nix::mount::{MntFlags, MsFlags};
use nix::sys::stat::Mode;
use nix::unistd::{Gid, Uid};

use super::linux::LinuxSyscall;
use super::{DirEntry, FileInfo, FsInfo, MountInfoEntry, Result};

/// The kernel primitives the updater consumes. Production code uses
/// [`LinuxSyscall`]; tests use a recording implementation that never touches
/// the real filesystem.
///
/// Component-relative calls (`openat`, `mkdirat`, `symlinkat`, `readlinkat`,
/// `unlinkat`) take a directory descriptor and a single path component so
/// the secure creator can walk paths without ever following a symlink.
pub trait Syscall {
    fn open(&self, path: &Path, flags: OFlag, mode: Mode) -> Result<RawFd>;
    fn openat(&self, dirfd: RawFd, name: &str, flags: OFlag, mode: Mode) -> Result<RawFd>;
    fn close(&self, fd: RawFd) -> Result<()>;
    fn mkdirat(&self, dirfd: RawFd, name: &str, mode: Mode) -> Result<()>;
    fn symlinkat(&self, oldname: &Path, dirfd: RawFd, name: &str) -> Result<()>;
    fn readlinkat(&self, dirfd: RawFd, name: &str) -> Result<PathBuf>;
    fn fchown(&self, fd: RawFd, uid: Uid, gid: Gid) -> Result<()>;
    fn fstat(&self, fd: RawFd) -> Result<FileInfo>;
    fn fstatfs(&self, fd: RawFd) -> Result<FsInfo>;
    fn lstat(&self, path: &Path) -> Result<FileInfo>;
    /// Lists a directory, sorted by name. Used when planning a writable
    /// mimic to replicate the contents of the obstructed directory.
    fn readdir(&self, path: &Path) -> Result<Vec<DirEntry>>;
    fn mount(
        &self,
        source: Option<&str>,
        target: &Path,
        fstype: Option<&str>,
        flags: MsFlags,
        data: Option<&str>,
    ) -> Result<()>;
    fn umount2(&self, target: &Path, flags: MntFlags) -> Result<()>;
    fn unlinkat(&self, dirfd: RawFd, name: &str, remove_dir: bool) -> Result<()>;
    /// Reads `/proc/self/mountinfo`. Used to decide whether `EINVAL` from
    /// `umount2` means "nothing mounted there" or a real failure.
    fn mountinfo(&self) -> Result<Vec<MountInfoEntry>>;
}

pub fn create_syscall() -> Box<dyn Syscall> {
    Box::new(LinuxSyscall)
}
