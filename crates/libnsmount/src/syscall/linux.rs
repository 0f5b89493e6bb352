//! Implements the Syscall trait for Linux systems.

use std::ffi::CString;
use std::ffi::OsString;
use std::mem;
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::os::unix::io::RawFd;
use std::path::{Path, PathBuf};

use libc::c_char;
use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::mount::{mount, umount2, MntFlags, MsFlags};
use nix::sys::stat::Mode;
use nix::unistd::{close, Gid, Uid};

use super::{DirEntry, FileInfo, FileKind, FsInfo, MountInfoEntry, Result, Syscall};

/// Empty structure to implement the Syscall trait for.
#[derive(Clone)]
pub struct LinuxSyscall;

impl LinuxSyscall {
    fn path_cstring(path: &Path) -> Result<CString> {
        CString::new(path.as_os_str().as_bytes()).map_err(|_| Errno::EINVAL.into())
    }

    fn name_cstring(name: &str) -> Result<CString> {
        CString::new(name).map_err(|_| Errno::EINVAL.into())
    }
}

impl Syscall for LinuxSyscall {
    fn open(&self, path: &Path, flags: OFlag, mode: Mode) -> Result<RawFd> {
        let path = Self::path_cstring(path)?;
        match unsafe { libc::open(path.as_ptr(), flags.bits(), mode.bits() as libc::c_uint) } {
            -1 => Err(Errno::last().into()),
            fd => Ok(fd),
        }
    }

    fn openat(&self, dirfd: RawFd, name: &str, flags: OFlag, mode: Mode) -> Result<RawFd> {
        let name = Self::name_cstring(name)?;
        match unsafe {
            libc::openat(dirfd, name.as_ptr(), flags.bits(), mode.bits() as libc::c_uint)
        } {
            -1 => Err(Errno::last().into()),
            fd => Ok(fd),
        }
    }

    fn close(&self, fd: RawFd) -> Result<()> {
        close(fd)?;
        Ok(())
    }

    fn mkdirat(&self, dirfd: RawFd, name: &str, mode: Mode) -> Result<()> {
        let name = Self::name_cstring(name)?;
        match unsafe { libc::mkdirat(dirfd, name.as_ptr(), mode.bits()) } {
            0 => Ok(()),
            _ => Err(Errno::last().into()),
        }
    }

    fn symlinkat(&self, oldname: &Path, dirfd: RawFd, name: &str) -> Result<()> {
        let oldname = Self::path_cstring(oldname)?;
        let name = Self::name_cstring(name)?;
        match unsafe { libc::symlinkat(oldname.as_ptr(), dirfd, name.as_ptr()) } {
            0 => Ok(()),
            _ => Err(Errno::last().into()),
        }
    }

    fn readlinkat(&self, dirfd: RawFd, name: &str) -> Result<PathBuf> {
        let name = Self::name_cstring(name)?;
        let mut buf = vec![0u8; libc::PATH_MAX as usize];
        match unsafe {
            libc::readlinkat(
                dirfd,
                name.as_ptr(),
                buf.as_mut_ptr() as *mut c_char,
                buf.len(),
            )
        } {
            -1 => Err(Errno::last().into()),
            len => {
                buf.truncate(len as usize);
                Ok(PathBuf::from(OsString::from_vec(buf)))
            }
        }
    }

    fn fchown(&self, fd: RawFd, uid: Uid, gid: Gid) -> Result<()> {
        match unsafe { libc::fchown(fd, uid.as_raw(), gid.as_raw()) } {
            0 => Ok(()),
            _ => Err(Errno::last().into()),
        }
    }

    fn fstat(&self, fd: RawFd) -> Result<FileInfo> {
        let mut st = unsafe { mem::zeroed::<libc::stat>() };
        match unsafe { libc::fstat(fd, &mut st) } {
            0 => Ok(FileInfo::from_stat(&st)),
            _ => Err(Errno::last().into()),
        }
    }

    fn fstatfs(&self, fd: RawFd) -> Result<FsInfo> {
        let mut st = unsafe { mem::zeroed::<libc::statfs64>() };
        match unsafe { libc::fstatfs64(fd, &mut st) } {
            0 => Ok(FsInfo {
                fs_type: st.f_type as i64,
                flags: st.f_flags as u64,
            }),
            _ => Err(Errno::last().into()),
        }
    }

    fn lstat(&self, path: &Path) -> Result<FileInfo> {
        let path = Self::path_cstring(path)?;
        let mut st = unsafe { mem::zeroed::<libc::stat>() };
        match unsafe { libc::lstat(path.as_ptr(), &mut st) } {
            0 => Ok(FileInfo::from_stat(&st)),
            _ => Err(Errno::last().into()),
        }
    }

    fn readdir(&self, path: &Path) -> Result<Vec<DirEntry>> {
        let mut entries = Vec::new();
        for entry in std::fs::read_dir(path)? {
            let entry = entry?;
            let file_type = entry.file_type()?;
            let kind = if file_type.is_dir() {
                FileKind::Directory
            } else if file_type.is_file() {
                FileKind::Regular
            } else if file_type.is_symlink() {
                FileKind::Symlink
            } else {
                FileKind::Other
            };
            entries.push(DirEntry {
                name: entry.file_name().to_string_lossy().into_owned(),
                kind,
            });
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    fn mount(
        &self,
        source: Option<&str>,
        target: &Path,
        fstype: Option<&str>,
        flags: MsFlags,
        data: Option<&str>,
    ) -> Result<()> {
        mount(source, target, fstype, flags, data)?;
        Ok(())
    }

    fn umount2(&self, target: &Path, flags: MntFlags) -> Result<()> {
        umount2(target, flags)?;
        Ok(())
    }

    fn unlinkat(&self, dirfd: RawFd, name: &str, remove_dir: bool) -> Result<()> {
        let name = Self::name_cstring(name)?;
        let flags = if remove_dir { libc::AT_REMOVEDIR } else { 0 };
        match unsafe { libc::unlinkat(dirfd, name.as_ptr(), flags) } {
            0 => Ok(()),
            _ => Err(Errno::last().into()),
        }
    }

    fn mountinfo(&self) -> Result<Vec<MountInfoEntry>> {
        let process = procfs::process::Process::myself()?;
        let info = process.mountinfo()?;
        Ok(info
            .0
            .into_iter()
            .map(|mi| MountInfoEntry {
                mount_point: mi.mount_point,
                fs_type: mi.fs_type,
                source: mi.mount_source.unwrap_or_else(|| "none".to_string()),
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use anyhow::{bail, Context, Result};
    use tempfile::TempDir;

    use super::*;

    #[test]
    fn test_open_and_fstat_directory() -> Result<()> {
        let tmp = TempDir::new()?;
        let syscall = LinuxSyscall;
        let fd = syscall.open(
            tmp.path(),
            OFlag::O_DIRECTORY | OFlag::O_CLOEXEC | OFlag::O_NOFOLLOW,
            Mode::empty(),
        )?;
        let info = syscall.fstat(fd)?;
        syscall.close(fd)?;
        if info.kind != FileKind::Directory {
            bail!("expected a directory, got {:?}", info.kind);
        }
        Ok(())
    }

    #[test]
    fn test_mkdirat_and_readdir() -> Result<()> {
        let tmp = TempDir::new()?;
        let syscall = LinuxSyscall;
        let fd = syscall.open(
            tmp.path(),
            OFlag::O_DIRECTORY | OFlag::O_CLOEXEC,
            Mode::empty(),
        )?;
        syscall
            .mkdirat(fd, "sub", Mode::from_bits_truncate(0o755))
            .context("mkdirat failed")?;
        std::fs::write(tmp.path().join("file"), b"")?;
        syscall.close(fd)?;

        let entries = syscall.readdir(tmp.path())?;
        assert_eq!(
            entries,
            vec![
                DirEntry {
                    name: "file".to_string(),
                    kind: FileKind::Regular,
                },
                DirEntry {
                    name: "sub".to_string(),
                    kind: FileKind::Directory,
                },
            ]
        );
        Ok(())
    }

    #[test]
    fn test_openat_refuses_symlink() -> Result<()> {
        let tmp = TempDir::new()?;
        let syscall = LinuxSyscall;
        let fd = syscall.open(
            tmp.path(),
            OFlag::O_DIRECTORY | OFlag::O_CLOEXEC,
            Mode::empty(),
        )?;
        syscall.symlinkat(Path::new("/somewhere"), fd, "link")?;
        let err = syscall
            .openat(
                fd,
                "link",
                OFlag::O_NOFOLLOW | OFlag::O_CLOEXEC | OFlag::O_DIRECTORY,
                Mode::empty(),
            )
            .unwrap_err();
        syscall.close(fd)?;
        // The kernel reports ELOOP or ENOTDIR depending on the flags used.
        match err.errno() {
            Some(Errno::ELOOP) | Some(Errno::ENOTDIR) => Ok(()),
            other => bail!("unexpected errno: {:?}", other),
        }
    }

    #[test]
    fn test_readlinkat() -> Result<()> {
        let tmp = TempDir::new()?;
        let syscall = LinuxSyscall;
        let fd = syscall.open(
            tmp.path(),
            OFlag::O_DIRECTORY | OFlag::O_CLOEXEC,
            Mode::empty(),
        )?;
        syscall.symlinkat(Path::new("/target/elsewhere"), fd, "link")?;
        let target = syscall.readlinkat(fd, "link")?;
        syscall.close(fd)?;
        assert_eq!(target, PathBuf::from("/target/elsewhere"));
        Ok(())
    }

    #[test]
    fn test_mountinfo_contains_root() -> Result<()> {
        let syscall = LinuxSyscall;
        let info = syscall.mountinfo()?;
        if !info.iter().any(|mi| mi.mount_point == Path::new("/")) {
            bail!("mount table has no entry for /");
        }
        Ok(())
    }
}
