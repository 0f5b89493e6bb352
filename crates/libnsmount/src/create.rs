//! Secure creation of directories, files and symlinks.
//!
//! Every operation walks its path from `/` downward, holding an open
//! descriptor to the current directory and issuing `openat`/`mkdirat`/
//! `symlinkat` relative to it with no-follow semantics. A concurrently
//! placed symbolic link cannot redirect the walk: the kernel reports
//! `ELOOP` or `ENOTDIR` instead of following it.

use std::os::unix::io::RawFd;
use std::path::{Path, PathBuf};

use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::sys::stat::Mode;
use nix::unistd::{Gid, Uid};

use crate::assumptions::{CheckError, Restrictions, TrespassingError};
use crate::path::{self, PathError, PathIterator, Segment};
use crate::syscall::{FileKind, Syscall, SyscallError};

#[derive(Debug, thiserror::Error)]
pub enum CreateError {
    #[error(transparent)]
    Path(#[from] PathError),
    /// The filesystem holding the reported prefix is read-only; the caller
    /// can plan a writable mimic there and retry.
    #[error("cannot write to {0:?}: read-only filesystem")]
    ReadOnlyFs(PathBuf),
    #[error(transparent)]
    Trespassing(#[from] TrespassingError),
    #[error("cannot create directory {path:?}: {source}")]
    Mkdir {
        path: PathBuf,
        #[source]
        source: SyscallError,
    },
    #[error("cannot create file {path:?}: {source}")]
    Mkfile {
        path: PathBuf,
        #[source]
        source: SyscallError,
    },
    #[error("cannot create symlink {path:?}: {source}")]
    Mksymlink {
        path: PathBuf,
        #[source]
        source: SyscallError,
    },
    #[error("cannot create symlink {path:?}: existing file in the way")]
    ExistingFileInTheWay { path: PathBuf },
    #[error("cannot open {path:?}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: SyscallError,
    },
    #[error("cannot change ownership of {path:?}: {source}")]
    Chown {
        path: PathBuf,
        #[source]
        source: SyscallError,
    },
    #[error("cannot open {0:?}: it is a symbolic link")]
    IsSymlink(PathBuf),
    #[error("cannot use {0:?} as a file name")]
    NotAFileName(PathBuf),
    #[error(transparent)]
    Syscall(#[from] SyscallError),
}

impl From<CheckError> for CreateError {
    fn from(err: CheckError) -> CreateError {
        match err {
            CheckError::Trespassing(err) => CreateError::Trespassing(err),
            CheckError::Syscall(err) => CreateError::Syscall(err),
        }
    }
}

/// Owns a descriptor and closes it through the syscall shim on drop, so
/// descriptor lifetimes show up in recorded call sequences.
pub struct FdGuard<'a> {
    sys: &'a dyn Syscall,
    fd: RawFd,
}

impl<'a> std::fmt::Debug for FdGuard<'a> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FdGuard").field("fd", &self.fd).finish()
    }
}

impl<'a> FdGuard<'a> {
    pub fn new(sys: &'a dyn Syscall, fd: RawFd) -> FdGuard<'a> {
        FdGuard { sys, fd }
    }

    pub fn raw(&self) -> RawFd {
        self.fd
    }
}

impl Drop for FdGuard<'_> {
    fn drop(&mut self) {
        let _ = self.sys.close(self.fd);
    }
}

fn open_root<'a>(sys: &'a dyn Syscall, flags: OFlag) -> Result<FdGuard<'a>, CreateError> {
    let fd = sys
        .open(Path::new("/"), flags, Mode::empty())
        .map_err(|source| CreateError::Open {
            path: PathBuf::from("/"),
            source,
        })?;
    Ok(FdGuard::new(sys, fd))
}

fn split_file_path(path: &Path) -> Result<(&Path, &str), CreateError> {
    path::validate(path)?;
    let parent = match path.parent() {
        Some(parent) => parent,
        None => return Err(CreateError::NotAFileName(path.to_path_buf())),
    };
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| CreateError::NotAFileName(path.to_path_buf()))?;
    Ok((parent, name))
}

/// Opens the directory `parent`, creating any missing components on the
/// way. The caller owns the returned descriptor of the deepest component.
pub fn mk_prefix<'a>(
    sys: &'a dyn Syscall,
    parent: &Path,
    mode: Mode,
    uid: Uid,
    gid: Gid,
    rs: &mut Restrictions,
) -> Result<FdGuard<'a>, CreateError> {
    let iter = PathIterator::new(parent)?;
    let mut fd = open_root(
        sys,
        OFlag::O_NOFOLLOW | OFlag::O_CLOEXEC | OFlag::O_DIRECTORY,
    )?;
    for segment in iter {
        let next = mk_dir(sys, fd.raw(), &segment.base, &segment.name, mode, uid, gid, rs)?;
        fd = next;
    }
    Ok(fd)
}

/// Creates (or opens, when it already exists) the directory `name` under
/// the directory open at `dirfd`, whose path is `base`. Newly created
/// directories are chowned to the given owner.
pub fn mk_dir<'a>(
    sys: &'a dyn Syscall,
    dirfd: RawFd,
    base: &Path,
    name: &str,
    mode: Mode,
    uid: Uid,
    gid: Gid,
    rs: &mut Restrictions,
) -> Result<FdGuard<'a>, CreateError> {
    rs.check(sys, dirfd, base)?;
    let mut created = true;
    if let Err(err) = sys.mkdirat(dirfd, name, mode) {
        match err.errno() {
            Some(Errno::EEXIST) => created = false,
            Some(Errno::EROFS) => return Err(CreateError::ReadOnlyFs(base.to_path_buf())),
            _ => {
                return Err(CreateError::Mkdir {
                    path: base.join(name),
                    source: err,
                })
            }
        }
    }
    let fd = sys
        .openat(
            dirfd,
            name,
            OFlag::O_NOFOLLOW | OFlag::O_CLOEXEC | OFlag::O_DIRECTORY,
            Mode::empty(),
        )
        .map_err(|source| CreateError::Open {
            path: base.join(name),
            source,
        })?;
    let guard = FdGuard::new(sys, fd);
    if created {
        sys.fchown(guard.raw(), uid, gid)
            .map_err(|source| CreateError::Chown {
                path: base.join(name),
                source,
            })?;
    }
    Ok(guard)
}

/// Creates the regular file `name` under the directory open at `dirfd`.
/// An existing file is left alone.
pub fn mk_file(
    sys: &dyn Syscall,
    dirfd: RawFd,
    base: &Path,
    name: &str,
    mode: Mode,
    uid: Uid,
    gid: Gid,
    rs: &mut Restrictions,
) -> Result<(), CreateError> {
    rs.check(sys, dirfd, base)?;
    match sys.openat(
        dirfd,
        name,
        OFlag::O_CREAT | OFlag::O_EXCL | OFlag::O_NOFOLLOW | OFlag::O_CLOEXEC,
        mode,
    ) {
        Ok(fd) => {
            let guard = FdGuard::new(sys, fd);
            sys.fchown(guard.raw(), uid, gid)
                .map_err(|source| CreateError::Chown {
                    path: base.join(name),
                    source,
                })?;
            Ok(())
        }
        Err(err) => match err.errno() {
            Some(Errno::EEXIST) => Ok(()),
            Some(Errno::EROFS) => Err(CreateError::ReadOnlyFs(base.to_path_buf())),
            _ => Err(CreateError::Mkfile {
                path: base.join(name),
                source: err,
            }),
        },
    }
}

/// Creates the symlink `name` pointing to `oldname` under the directory
/// open at `dirfd`. An existing symlink with the same target is a no-op;
/// any other pre-existing object is an error.
pub fn mk_symlink(
    sys: &dyn Syscall,
    dirfd: RawFd,
    base: &Path,
    name: &str,
    oldname: &Path,
    rs: &mut Restrictions,
) -> Result<(), CreateError> {
    rs.check(sys, dirfd, base)?;
    match sys.symlinkat(oldname, dirfd, name) {
        Ok(()) => Ok(()),
        Err(err) => match err.errno() {
            Some(Errno::EEXIST) => match sys.readlinkat(dirfd, name) {
                Ok(target) if target == oldname => Ok(()),
                _ => Err(CreateError::ExistingFileInTheWay {
                    path: base.join(name),
                }),
            },
            Some(Errno::EROFS) => Err(CreateError::ReadOnlyFs(base.to_path_buf())),
            _ => Err(CreateError::Mksymlink {
                path: base.join(name),
                source: err,
            }),
        },
    }
}

/// Creates the directory `path` along with any missing parents.
pub fn mkdir_all(
    sys: &dyn Syscall,
    path: &Path,
    mode: Mode,
    uid: Uid,
    gid: Gid,
    rs: &mut Restrictions,
) -> Result<(), CreateError> {
    path::validate(path)?;
    if path == Path::new("/") {
        return Ok(());
    }
    let (parent, name) = split_file_path(path)?;
    let parent_fd = mk_prefix(sys, parent, mode, uid, gid, rs)?;
    let _leaf = mk_dir(sys, parent_fd.raw(), parent, name, mode, uid, gid, rs)?;
    Ok(())
}

/// Creates the regular file `path` along with any missing parents.
pub fn mkfile_all(
    sys: &dyn Syscall,
    path: &Path,
    mode: Mode,
    uid: Uid,
    gid: Gid,
    rs: &mut Restrictions,
) -> Result<(), CreateError> {
    let (parent, name) = split_file_path(path)?;
    let parent_fd = mk_prefix(sys, parent, mode, uid, gid, rs)?;
    mk_file(sys, parent_fd.raw(), parent, name, mode, uid, gid, rs)
}

/// Creates the symlink `path` pointing to `oldname`, along with any
/// missing parents. The mode and owner apply to created parents only.
pub fn mksymlink_all(
    sys: &dyn Syscall,
    path: &Path,
    mode: Mode,
    uid: Uid,
    gid: Gid,
    oldname: &Path,
    rs: &mut Restrictions,
) -> Result<(), CreateError> {
    let (parent, name) = split_file_path(path)?;
    let parent_fd = mk_prefix(sys, parent, mode, uid, gid, rs)?;
    mk_symlink(sys, parent_fd.raw(), parent, name, oldname, rs)
}

/// Opens `path` with `O_PATH` semantics so the descriptor can be used as a
/// bind-mount source or target through `/proc/self/fd/N`. The terminal
/// component may be a non-directory but never a symbolic link.
pub fn open_path<'a>(sys: &'a dyn Syscall, path: &Path) -> Result<FdGuard<'a>, CreateError> {
    let segments: Vec<Segment> = PathIterator::new(path)?.collect();
    let mut fd = open_root(
        sys,
        OFlag::O_PATH | OFlag::O_NOFOLLOW | OFlag::O_CLOEXEC | OFlag::O_DIRECTORY,
    )?;
    let count = segments.len();
    for (index, segment) in segments.iter().enumerate() {
        let mut flags = OFlag::O_PATH | OFlag::O_NOFOLLOW | OFlag::O_CLOEXEC;
        if index + 1 < count {
            flags |= OFlag::O_DIRECTORY;
        }
        let next = sys
            .openat(fd.raw(), &segment.name, flags, Mode::empty())
            .map_err(|source| CreateError::Open {
                path: segment.path.clone(),
                source,
            })?;
        fd = FdGuard::new(sys, next);
    }
    let info = sys.fstat(fd.raw())?;
    if info.kind == FileKind::Symlink {
        return Err(CreateError::IsSymlink(path.to_path_buf()));
    }
    Ok(fd)
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;
    use crate::assumptions::Assumptions;
    use crate::syscall::test::{file_info, fs_info, TestSyscall};
    use crate::syscall::{EXT4_SUPER_MAGIC, SQUASHFS_MAGIC, ST_RDONLY};

    fn mode(bits: u32) -> Mode {
        Mode::from_bits_truncate(bits)
    }

    fn unrestricted() -> Assumptions {
        let mut assumptions = Assumptions::new();
        assumptions.add_unrestricted_paths(vec![PathBuf::from("/")]);
        assumptions
    }

    #[test]
    fn test_mkdir_all_creates_missing_components() {
        let sys = TestSyscall::new();
        let assumptions = unrestricted();
        let mut rs = assumptions.restrictions_for(Path::new("/abs/dir"));
        mkdir_all(
            &sys,
            Path::new("/abs/dir"),
            mode(0o755),
            Uid::from_raw(123),
            Gid::from_raw(456),
            &mut rs,
        )
        .unwrap();
        assert_eq!(
            sys.calls(),
            vec![
                r#"open "/" O_NOFOLLOW|O_CLOEXEC|O_DIRECTORY 0o0"#,
                r#"mkdirat 3 "abs" 0o755"#,
                r#"openat 3 "abs" O_NOFOLLOW|O_CLOEXEC|O_DIRECTORY 0o0"#,
                "fchown 4 123 456",
                "close 3",
                r#"mkdirat 4 "dir" 0o755"#,
                r#"openat 4 "dir" O_NOFOLLOW|O_CLOEXEC|O_DIRECTORY 0o0"#,
                "fchown 5 123 456",
                "close 5",
                "close 4",
            ]
        );
    }

    #[test]
    fn test_mkdir_all_existing_components_are_not_chowned() {
        let sys = TestSyscall::new();
        sys.insert_fault(r#"mkdirat 3 "abs" 0o755"#, Errno::EEXIST);
        let assumptions = unrestricted();
        let mut rs = assumptions.restrictions_for(Path::new("/abs/dir"));
        mkdir_all(
            &sys,
            Path::new("/abs/dir"),
            mode(0o755),
            Uid::from_raw(0),
            Gid::from_raw(0),
            &mut rs,
        )
        .unwrap();
        assert_eq!(
            sys.calls(),
            vec![
                r#"open "/" O_NOFOLLOW|O_CLOEXEC|O_DIRECTORY 0o0"#,
                r#"mkdirat 3 "abs" 0o755"#,
                r#"openat 3 "abs" O_NOFOLLOW|O_CLOEXEC|O_DIRECTORY 0o0"#,
                "close 3",
                r#"mkdirat 4 "dir" 0o755"#,
                r#"openat 4 "dir" O_NOFOLLOW|O_CLOEXEC|O_DIRECTORY 0o0"#,
                "fchown 5 0 0",
                "close 5",
                "close 4",
            ]
        );
    }

    #[test]
    fn test_mkdir_all_reports_read_only_prefix() {
        let sys = TestSyscall::new();
        sys.insert_fault(r#"mkdirat 3 "rofs" 0o755"#, Errno::EEXIST);
        sys.insert_fault(r#"mkdirat 4 "dir" 0o755"#, Errno::EROFS);
        let assumptions = unrestricted();
        let mut rs = assumptions.restrictions_for(Path::new("/rofs/dir"));
        let err = mkdir_all(
            &sys,
            Path::new("/rofs/dir"),
            mode(0o755),
            Uid::from_raw(0),
            Gid::from_raw(0),
            &mut rs,
        )
        .unwrap_err();
        assert!(matches!(err, CreateError::ReadOnlyFs(p) if p == PathBuf::from("/rofs")));
        // Every opened descriptor was closed on the error path.
        let calls = sys.calls();
        assert!(calls.contains(&"close 3".to_string()));
        assert!(calls.contains(&"close 4".to_string()));
    }

    #[test]
    fn test_mkdir_all_rejects_unclean_paths() {
        let sys = TestSyscall::new();
        let assumptions = unrestricted();
        let mut rs = assumptions.restrictions_for(Path::new("/a"));
        for bad in ["relative/path", "/a/../b", "/a/b/"] {
            let err = mkdir_all(
                &sys,
                Path::new(bad),
                mode(0o755),
                Uid::from_raw(0),
                Gid::from_raw(0),
                &mut rs,
            )
            .unwrap_err();
            assert!(matches!(err, CreateError::Path(_)));
        }
        // No side effects for invalid input.
        assert!(sys.calls().is_empty());
    }

    #[test]
    fn test_mkdir_all_trespassing_stops_before_writing() {
        let sys = TestSyscall::new();
        // / is on a read-only squashfs but /etc is on the writable host fs.
        sys.insert_fstatfs_result("/", fs_info(SQUASHFS_MAGIC, ST_RDONLY));
        sys.insert_fstatfs_result("/etc", fs_info(EXT4_SUPER_MAGIC, 0));
        sys.insert_fault(r#"mkdirat 3 "etc" 0o755"#, Errno::EEXIST);
        let assumptions = Assumptions::new();
        let mut rs = assumptions.restrictions_for(Path::new("/etc/demo"));
        let err = mkdir_all(
            &sys,
            Path::new("/etc/demo"),
            mode(0o755),
            Uid::from_raw(0),
            Gid::from_raw(0),
            &mut rs,
        )
        .unwrap_err();
        match err {
            CreateError::Trespassing(err) => {
                assert_eq!(err.violated, PathBuf::from("/etc"));
                assert_eq!(err.desired, PathBuf::from("/etc/demo"));
            }
            other => panic!("unexpected error: {:?}", other),
        }
        // The offending mkdirat was never issued.
        assert!(!sys
            .calls()
            .iter()
            .any(|c| c.starts_with(r#"mkdirat 4 "demo""#)));
    }

    #[test]
    fn test_mkfile_all_creates_file() {
        let sys = TestSyscall::new();
        let assumptions = unrestricted();
        let mut rs = assumptions.restrictions_for(Path::new("/abs/file"));
        mkfile_all(
            &sys,
            Path::new("/abs/file"),
            mode(0o644),
            Uid::from_raw(0),
            Gid::from_raw(0),
            &mut rs,
        )
        .unwrap();
        assert_eq!(
            sys.calls(),
            vec![
                r#"open "/" O_NOFOLLOW|O_CLOEXEC|O_DIRECTORY 0o0"#,
                r#"mkdirat 3 "abs" 0o644"#,
                r#"openat 3 "abs" O_NOFOLLOW|O_CLOEXEC|O_DIRECTORY 0o0"#,
                "fchown 4 0 0",
                "close 3",
                r#"openat 4 "file" O_NOFOLLOW|O_CLOEXEC|O_CREAT|O_EXCL 0o644"#,
                "fchown 5 0 0",
                "close 5",
                "close 4",
            ]
        );
    }

    #[test]
    fn test_mkfile_all_existing_file_is_no_op() {
        let sys = TestSyscall::new();
        sys.insert_fault(r#"mkdirat 3 "abs" 0o644"#, Errno::EEXIST);
        sys.insert_fault(
            r#"openat 4 "file" O_NOFOLLOW|O_CLOEXEC|O_CREAT|O_EXCL 0o644"#,
            Errno::EEXIST,
        );
        let assumptions = unrestricted();
        let mut rs = assumptions.restrictions_for(Path::new("/abs/file"));
        mkfile_all(
            &sys,
            Path::new("/abs/file"),
            mode(0o644),
            Uid::from_raw(0),
            Gid::from_raw(0),
            &mut rs,
        )
        .unwrap();
    }

    #[test]
    fn test_mksymlink_all_creates_symlink() {
        let sys = TestSyscall::new();
        let assumptions = unrestricted();
        let mut rs = assumptions.restrictions_for(Path::new("/abs/link"));
        mksymlink_all(
            &sys,
            Path::new("/abs/link"),
            mode(0o755),
            Uid::from_raw(0),
            Gid::from_raw(0),
            Path::new("/somewhere/else"),
            &mut rs,
        )
        .unwrap();
        assert!(sys
            .calls()
            .contains(&r#"symlinkat "/somewhere/else" 4 "link""#.to_string()));
    }

    #[test]
    fn test_mksymlink_all_same_target_is_no_op() {
        let sys = TestSyscall::new();
        sys.insert_fault(r#"symlinkat "/somewhere/else" 4 "link""#, Errno::EEXIST);
        sys.insert_readlink_result("/abs/link", "/somewhere/else");
        let assumptions = unrestricted();
        let mut rs = assumptions.restrictions_for(Path::new("/abs/link"));
        mksymlink_all(
            &sys,
            Path::new("/abs/link"),
            mode(0o755),
            Uid::from_raw(0),
            Gid::from_raw(0),
            Path::new("/somewhere/else"),
            &mut rs,
        )
        .unwrap();
    }

    #[test]
    fn test_mksymlink_all_different_target_is_an_error() {
        let sys = TestSyscall::new();
        sys.insert_fault(r#"symlinkat "/somewhere/else" 4 "link""#, Errno::EEXIST);
        sys.insert_readlink_result("/abs/link", "/other/place");
        let assumptions = unrestricted();
        let mut rs = assumptions.restrictions_for(Path::new("/abs/link"));
        let err = mksymlink_all(
            &sys,
            Path::new("/abs/link"),
            mode(0o755),
            Uid::from_raw(0),
            Gid::from_raw(0),
            Path::new("/somewhere/else"),
            &mut rs,
        )
        .unwrap_err();
        assert!(
            matches!(err, CreateError::ExistingFileInTheWay { path } if path == PathBuf::from("/abs/link"))
        );
    }

    #[test]
    fn test_open_path_walks_with_o_path() {
        let sys = TestSyscall::new();
        let fd = open_path(&sys, Path::new("/a/b")).unwrap();
        assert_eq!(fd.raw(), 5);
        assert_eq!(
            sys.calls(),
            vec![
                r#"open "/" O_PATH|O_NOFOLLOW|O_CLOEXEC|O_DIRECTORY 0o0"#,
                r#"openat 3 "a" O_PATH|O_NOFOLLOW|O_CLOEXEC|O_DIRECTORY 0o0"#,
                "close 3",
                // The terminal component may be a non-directory.
                r#"openat 4 "b" O_PATH|O_NOFOLLOW|O_CLOEXEC 0o0"#,
                "close 4",
                r#"fstat 5 "/a/b""#,
            ]
        );
        drop(fd);
        assert_eq!(sys.calls().last().map(String::as_str), Some("close 5"));
    }

    #[test]
    fn test_open_path_rejects_symlink_leaf() {
        let sys = TestSyscall::new();
        sys.insert_fstat_result("/a/b", file_info(FileKind::Symlink));
        let err = open_path(&sys, Path::new("/a/b")).unwrap_err();
        assert!(matches!(err, CreateError::IsSymlink(p) if p == PathBuf::from("/a/b")));
        // The descriptor to the symlink itself was closed.
        assert_eq!(sys.calls().last().map(String::as_str), Some("close 5"));
    }

    #[test]
    fn test_open_path_root() {
        let sys = TestSyscall::new();
        let fd = open_path(&sys, Path::new("/")).unwrap();
        assert_eq!(fd.raw(), 3);
    }
}
