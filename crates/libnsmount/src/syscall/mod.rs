//! A thin, mockable surface over the kernel primitives used by the rest of
//! the library. All filesystem access goes through the [`Syscall`] trait so
//! that tests can run against a recording implementation.

use std::path::PathBuf;

pub mod linux;
pub mod syscall;

pub use syscall::{create_syscall, Syscall};

/// Filesystem magic number of squashfs, the format application images are
/// distributed in. A placeholder left after an unmount is never removed when
/// it lives on squashfs.
pub const SQUASHFS_MAGIC: i64 = 0x7371_7368;
/// Filesystem magic number of tmpfs.
pub const TMPFS_MAGIC: i64 = 0x0102_1994;
/// Filesystem magic number of ext4.
pub const EXT4_SUPER_MAGIC: i64 = 0xef53;
/// Flag set in `statfs.f_flags` when the filesystem is mounted read-only.
pub const ST_RDONLY: u64 = 0x1;

#[derive(Debug, thiserror::Error)]
pub enum SyscallError {
    #[error("{0}")]
    Nix(#[from] nix::errno::Errno),
    #[error("{0}")]
    IO(#[from] std::io::Error),
    #[error("cannot read mount table: {0}")]
    Proc(#[from] procfs::ProcError),
}

impl SyscallError {
    /// The raw errno, when the error originated in a failed system call.
    pub fn errno(&self) -> Option<nix::errno::Errno> {
        match self {
            SyscallError::Nix(errno) => Some(*errno),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, SyscallError>;

/// The type of a directory entry or stat result, collapsed to the cases the
/// updater distinguishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    Directory,
    Regular,
    Symlink,
    /// Devices, sockets and fifos. Never mounted over, skipped by mimics.
    Other,
}

impl FileKind {
    pub fn from_mode(st_mode: u32) -> Self {
        match st_mode & libc::S_IFMT {
            libc::S_IFDIR => FileKind::Directory,
            libc::S_IFREG => FileKind::Regular,
            libc::S_IFLNK => FileKind::Symlink,
            _ => FileKind::Other,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FileKind::Directory => "directory",
            FileKind::Regular => "regular file",
            FileKind::Symlink => "symbolic link",
            FileKind::Other => "special file",
        }
    }
}

/// The subset of `stat(2)` results the updater inspects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileInfo {
    pub kind: FileKind,
    /// Permission bits, including setuid/setgid/sticky.
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
    /// Device number of the filesystem containing the file, used as the key
    /// of the verified tmpfs cache.
    pub dev: u64,
}

impl FileInfo {
    pub fn from_stat(st: &libc::stat) -> Self {
        FileInfo {
            kind: FileKind::from_mode(st.st_mode),
            mode: st.st_mode & 0o7777,
            uid: st.st_uid,
            gid: st.st_gid,
            size: st.st_size.max(0) as u64,
            dev: st.st_dev,
        }
    }
}

/// The subset of `statfs(2)` results the updater inspects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FsInfo {
    pub fs_type: i64,
    pub flags: u64,
}

impl FsInfo {
    pub fn is_read_only(&self) -> bool {
        self.flags & ST_RDONLY != 0
    }
}

/// One directory entry as returned by [`Syscall::readdir`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub kind: FileKind,
}

/// One row of `/proc/self/mountinfo`, reduced to the fields the updater
/// needs to decide whether a mount point is still mounted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountInfoEntry {
    pub mount_point: PathBuf,
    pub fs_type: String,
    pub source: String,
}
