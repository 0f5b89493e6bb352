//! A change is one planned transition of the mount namespace and the code
//! that applies it to the kernel.

use std::fmt;
use std::path::{Path, PathBuf};

use nix::errno::Errno;
use nix::mount::{MntFlags, MsFlags};
use nix::sys::stat::Mode;
use nix::unistd::{Gid, Uid};

use crate::assumptions::{Assumptions, TrespassingError};
use crate::create::{self, CreateError};
use crate::entry::{EntryError, EntryKind, EntryOrigin, MountEntry};
use crate::mimic;
use crate::path;
use crate::syscall::{FileKind, Syscall, SyscallError, SQUASHFS_MAGIC};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Keep,
    Mount,
    Unmount,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match self {
            Action::Keep => "keep",
            Action::Mount => "mount",
            Action::Unmount => "unmount",
        })
    }
}

/// A pair of an action and the entry it applies to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Change {
    pub action: Action,
    pub entry: MountEntry,
}

impl fmt::Display for Change {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} ({})", self.action, self.entry)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ChangeError {
    #[error("cannot use {path:?} as mount point: not a {expected}")]
    ShapeMismatch { path: PathBuf, expected: &'static str },
    #[error("parent directory {must_exist:?} of ensure-dir target {target:?} does not exist")]
    EnsureDirParentMissing { target: PathBuf, must_exist: PathBuf },
    #[error("ensure-dir target {target:?} is not under {must_exist:?}")]
    EnsureDirMisuse { target: PathBuf, must_exist: PathBuf },
    /// Sentinel for entries tagged `x-snapd.ignore-missing` whose source or
    /// target is absent; the driver skips these silently.
    #[error("mount source or target is missing and the entry asks to ignore that")]
    IgnoredMissingMount,
    #[error("cannot inspect {path:?}: {source}")]
    Inspect {
        path: PathBuf,
        #[source]
        source: SyscallError,
    },
    #[error("cannot mount {target:?}: {source}")]
    Mount {
        target: PathBuf,
        #[source]
        source: SyscallError,
    },
    #[error("cannot unmount {target:?}: {source}")]
    Unmount {
        target: PathBuf,
        #[source]
        source: SyscallError,
    },
    #[error("cannot remove {path:?}: {source}")]
    Remove {
        path: PathBuf,
        #[source]
        source: SyscallError,
    },
    #[error("cannot establish writable mimic at {path:?}: {source}")]
    Mimic {
        path: PathBuf,
        #[source]
        source: Box<ChangeError>,
    },
    /// An undo path failed; the namespace may be inconsistent and the
    /// driver must abort without persisting a new profile.
    #[error("cannot undo {change}: {source}; the namespace may be inconsistent")]
    Fatal {
        change: String,
        #[source]
        source: Box<ChangeError>,
    },
    #[error(transparent)]
    Create(#[from] CreateError),
    #[error(transparent)]
    Entry(#[from] EntryError),
    #[error(transparent)]
    Syscall(#[from] SyscallError),
}

impl ChangeError {
    /// True for errors after which the driver must not persist a profile.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ChangeError::Fatal { .. })
    }
}

/// The error of [`Change::perform`]. Synthesised changes are carried even
/// on failure so the driver can record what was actually done.
#[derive(Debug, thiserror::Error)]
#[error("{error}")]
pub struct PerformError {
    pub synthesised: Vec<Change>,
    #[source]
    pub error: ChangeError,
}

impl Change {
    /// Applies the change to the kernel, returning any changes synthesised
    /// along the way (the mounts of a writable mimic). Successful changes
    /// are recorded in the assumptions so later trespass checks recognise
    /// the tmpfs directories this run created.
    pub fn perform(
        &self,
        sys: &dyn Syscall,
        assumptions: &mut Assumptions,
    ) -> Result<Vec<Change>, PerformError> {
        tracing::debug!(change = %self, "performing change");
        let mut synthesised = Vec::new();
        match self.perform_impl(sys, assumptions, &mut synthesised) {
            Ok(()) => {
                assumptions.add_change(self.clone());
                Ok(synthesised)
            }
            Err(error) => Err(PerformError { synthesised, error }),
        }
    }

    fn perform_impl(
        &self,
        sys: &dyn Syscall,
        assumptions: &mut Assumptions,
        synthesised: &mut Vec<Change>,
    ) -> Result<(), ChangeError> {
        match self.action {
            Action::Keep => Ok(()),
            Action::Mount => {
                self.ensure_target_exists(sys, assumptions, synthesised, true)?;
                let kind = self.entry.kind();
                if self.entry.is_bind()
                    && matches!(kind, EntryKind::Directory | EntryKind::File)
                {
                    self.ensure_source_exists(sys, assumptions, synthesised)?;
                }
                self.low_level_perform(sys)
            }
            Action::Unmount => self.unmount(sys),
        }
    }

    /// Makes sure the mount target exists and has the shape the entry kind
    /// requires, creating it when absent. When creation runs into a
    /// read-only filesystem or a trespass, a writable mimic is constructed
    /// at the obstruction and creation is retried once.
    fn ensure_target_exists(
        &self,
        sys: &dyn Syscall,
        assumptions: &mut Assumptions,
        synthesised: &mut Vec<Change>,
        poke_holes: bool,
    ) -> Result<(), ChangeError> {
        let entry = &self.entry;
        let target = &entry.target;
        let kind = entry.kind();
        path::validate(target).map_err(CreateError::Path)?;

        if let EntryKind::EnsureDir { must_exist } = &kind {
            if must_exist.as_os_str().is_empty() {
                return Err(EntryError::MissingMustExistDir(target.clone()).into());
            }
            if !target.starts_with(must_exist) {
                return Err(ChangeError::EnsureDirMisuse {
                    target: target.clone(),
                    must_exist: must_exist.clone(),
                });
            }
            match sys.lstat(must_exist) {
                Ok(info) if info.kind == FileKind::Directory => {}
                Ok(_) => {
                    return Err(ChangeError::EnsureDirParentMissing {
                        target: target.clone(),
                        must_exist: must_exist.clone(),
                    })
                }
                Err(err) if err.errno() == Some(Errno::ENOENT) => {
                    return Err(ChangeError::EnsureDirParentMissing {
                        target: target.clone(),
                        must_exist: must_exist.clone(),
                    })
                }
                Err(err) => {
                    return Err(ChangeError::Inspect {
                        path: must_exist.clone(),
                        source: err,
                    })
                }
            }
        }

        match sys.lstat(target) {
            Ok(info) => {
                let expected = match kind {
                    EntryKind::Directory | EntryKind::EnsureDir { .. } => FileKind::Directory,
                    EntryKind::File => FileKind::Regular,
                    EntryKind::Symlink { .. } => FileKind::Symlink,
                };
                if info.kind == expected {
                    Ok(())
                } else {
                    Err(ChangeError::ShapeMismatch {
                        path: target.clone(),
                        expected: expected.as_str(),
                    })
                }
            }
            Err(err) if err.errno() == Some(Errno::ENOENT) => {
                if entry.ignore_missing() {
                    return Err(ChangeError::IgnoredMissingMount);
                }
                match self.create_target(sys, assumptions) {
                    Ok(()) => Ok(()),
                    Err(ChangeError::Create(
                        CreateError::ReadOnlyFs(violated)
                        | CreateError::Trespassing(TrespassingError { violated, .. }),
                    )) if poke_holes && !matches!(kind, EntryKind::EnsureDir { .. }) => {
                        match mimic::create_writable_mimic(
                            sys,
                            &violated,
                            &entry.id(),
                            assumptions,
                        ) {
                            Ok(changes) => synthesised.extend(changes),
                            Err(err) => {
                                synthesised.extend(err.synthesised);
                                return Err(ChangeError::Mimic {
                                    path: violated,
                                    source: Box::new(err.error),
                                });
                            }
                        }
                        // Retry once; a second obstruction is a real error.
                        self.ensure_target_exists(sys, assumptions, synthesised, false)
                    }
                    Err(err) => Err(err),
                }
            }
            Err(err) => Err(ChangeError::Inspect {
                path: target.clone(),
                source: err,
            }),
        }
    }

    /// Makes sure the source of a bind mount exists. Missing sources are
    /// created; holes are only poked for layout entries, which are
    /// per-namespace and benefit from private mimics.
    fn ensure_source_exists(
        &self,
        sys: &dyn Syscall,
        assumptions: &mut Assumptions,
        synthesised: &mut Vec<Change>,
    ) -> Result<(), ChangeError> {
        let entry = &self.entry;
        let source = Path::new(&entry.source);
        path::validate(source).map_err(CreateError::Path)?;
        match sys.lstat(source) {
            Ok(info) => {
                let expected = match entry.kind() {
                    EntryKind::File => FileKind::Regular,
                    _ => FileKind::Directory,
                };
                if info.kind == expected {
                    Ok(())
                } else {
                    Err(ChangeError::ShapeMismatch {
                        path: source.to_path_buf(),
                        expected: expected.as_str(),
                    })
                }
            }
            Err(err) if err.errno() == Some(Errno::ENOENT) => {
                if entry.ignore_missing() {
                    return Err(ChangeError::IgnoredMissingMount);
                }
                let poke_holes = entry.origin() == EntryOrigin::Layout;
                match self.create_source(sys, assumptions) {
                    Ok(()) => Ok(()),
                    Err(ChangeError::Create(
                        CreateError::ReadOnlyFs(violated)
                        | CreateError::Trespassing(TrespassingError { violated, .. }),
                    )) if poke_holes => {
                        match mimic::create_writable_mimic(
                            sys,
                            &violated,
                            &entry.id(),
                            assumptions,
                        ) {
                            Ok(changes) => synthesised.extend(changes),
                            Err(err) => {
                                synthesised.extend(err.synthesised);
                                return Err(ChangeError::Mimic {
                                    path: violated,
                                    source: Box::new(err.error),
                                });
                            }
                        }
                        self.create_source(sys, assumptions)
                    }
                    Err(err) => Err(err),
                }
            }
            Err(err) => Err(ChangeError::Inspect {
                path: source.to_path_buf(),
                source: err,
            }),
        }
    }

    fn create_target(
        &self,
        sys: &dyn Syscall,
        assumptions: &Assumptions,
    ) -> Result<(), ChangeError> {
        let entry = &self.entry;
        let target = &entry.target;
        let mode = match entry.mode()? {
            Some(bits) => Mode::from_bits_truncate(bits),
            None => assumptions.mode_for_path(target),
        };
        let uid = Uid::from_raw(entry.uid()?);
        let gid = Gid::from_raw(entry.gid()?);
        let mut rs = assumptions.restrictions_for(target);
        let result = match entry.kind() {
            EntryKind::Directory | EntryKind::EnsureDir { .. } => {
                create::mkdir_all(sys, target, mode, uid, gid, &mut rs)
            }
            EntryKind::File => create::mkfile_all(sys, target, mode, uid, gid, &mut rs),
            EntryKind::Symlink {
                target: link_target,
            } => {
                if link_target.as_os_str().is_empty() {
                    return Err(EntryError::MissingSymlinkTarget(target.clone()).into());
                }
                create::mksymlink_all(sys, target, mode, uid, gid, &link_target, &mut rs)
            }
        };
        result.map_err(ChangeError::Create)
    }

    fn create_source(
        &self,
        sys: &dyn Syscall,
        assumptions: &Assumptions,
    ) -> Result<(), ChangeError> {
        let entry = &self.entry;
        let source = Path::new(&entry.source);
        let mode = assumptions.mode_for_path(source);
        let uid = Uid::from_raw(entry.uid()?);
        let gid = Gid::from_raw(entry.gid()?);
        let mut rs = assumptions.restrictions_for(source);
        let result = match entry.kind() {
            EntryKind::File => create::mkfile_all(sys, source, mode, uid, gid, &mut rs),
            _ => create::mkdir_all(sys, source, mode, uid, gid, &mut rs),
        };
        result.map_err(ChangeError::Create)
    }

    fn low_level_perform(&self, sys: &dyn Syscall) -> Result<(), ChangeError> {
        let entry = &self.entry;
        match entry.kind() {
            // The symlink was created while ensuring the target; ensure-dir
            // only ever creates the directory.
            EntryKind::Symlink { .. } | EntryKind::EnsureDir { .. } => Ok(()),
            _ if entry.is_bind() => self.bind_mount(sys),
            _ => {
                let (flags, data) = entry.mount_flags();
                sys.mount(
                    Some(entry.source.as_str()),
                    &entry.target,
                    Some(entry.fs_type.as_str()),
                    flags,
                    Some(data.as_str()),
                )
                .map_err(|source| ChangeError::Mount {
                    target: entry.target.clone(),
                    source,
                })?;
                self.apply_propagation(sys)
            }
        }
    }

    /// Binds source to target through `/proc/self/fd/N` so a racing rename
    /// or symlink swap between path resolution and mount(2) has no window
    /// to aim the mount elsewhere.
    fn bind_mount(&self, sys: &dyn Syscall) -> Result<(), ChangeError> {
        let entry = &self.entry;
        {
            let source_fd =
                create::open_path(sys, Path::new(&entry.source)).map_err(ChangeError::Create)?;
            let target_fd = create::open_path(sys, &entry.target).map_err(ChangeError::Create)?;
            let source_proc = format!("/proc/self/fd/{}", source_fd.raw());
            let target_proc = PathBuf::from(format!("/proc/self/fd/{}", target_fd.raw()));
            let (flags, _) = entry.mount_flags();
            sys.mount(Some(source_proc.as_str()), &target_proc, None, flags, None)
                .map_err(|source| ChangeError::Mount {
                    target: entry.target.clone(),
                    source,
                })?;
        }
        self.apply_propagation(sys)
    }

    fn apply_propagation(&self, sys: &dyn Syscall) -> Result<(), ChangeError> {
        if let Some(flags) = self.entry.propagation_flags() {
            sys.mount(None, &self.entry.target, None, flags, None)
                .map_err(|source| ChangeError::Mount {
                    target: self.entry.target.clone(),
                    source,
                })?;
        }
        Ok(())
    }

    fn unmount(&self, sys: &dyn Syscall) -> Result<(), ChangeError> {
        let entry = &self.entry;
        match entry.kind() {
            // Nothing is mounted for these kinds.
            EntryKind::Symlink { .. } => self.remove_leftovers(sys),
            EntryKind::EnsureDir { .. } => Ok(()),
            _ => {
                let mut flags = MntFlags::UMOUNT_NOFOLLOW;
                if entry.is_detach() {
                    flags |= MntFlags::MNT_DETACH;
                    // Switch the subtree to recursive private first; some
                    // kernels refuse a detach inside a shared subtree.
                    sys.mount(
                        None,
                        &entry.target,
                        None,
                        MsFlags::MS_REC | MsFlags::MS_PRIVATE,
                        None,
                    )
                    .map_err(|source| ChangeError::Mount {
                        target: entry.target.clone(),
                        source,
                    })?;
                }
                match sys.umount2(&entry.target, flags) {
                    Ok(()) => {}
                    Err(err) if err.errno() == Some(Errno::EINVAL) => {
                        // EINVAL is only forgiven when the mount table
                        // confirms there is nothing mounted at the target.
                        let mounted = sys
                            .mountinfo()?
                            .iter()
                            .any(|mi| mi.mount_point == entry.target);
                        if mounted {
                            return Err(ChangeError::Unmount {
                                target: entry.target.clone(),
                                source: err,
                            });
                        }
                        tracing::debug!(target = ?entry.target, "profile entry was stale, nothing to unmount");
                    }
                    Err(err) => {
                        return Err(ChangeError::Unmount {
                            target: entry.target.clone(),
                            source: err,
                        })
                    }
                }
                self.remove_leftovers(sys)
            }
        }
    }

    /// Best-effort removal of the placeholder left at the mount point. Only
    /// objects this updater plausibly created are touched: nothing on
    /// squashfs, and no file with content.
    fn remove_leftovers(&self, sys: &dyn Syscall) -> Result<(), ChangeError> {
        let entry = &self.entry;
        let target = &entry.target;
        let (parent, name) = match (target.parent(), target.file_name().and_then(|n| n.to_str()))
        {
            (Some(parent), Some(name)) => (parent, name),
            _ => return Ok(()),
        };
        let remove_dir = match entry.kind() {
            EntryKind::Symlink { .. } => false,
            kind => {
                let fd = match create::open_path(sys, target) {
                    Ok(fd) => fd,
                    Err(err) => {
                        tracing::debug!(?target, %err, "cannot inspect mount point, skipping cleanup");
                        return Ok(());
                    }
                };
                let fs = sys.fstatfs(fd.raw())?;
                if fs.fs_type == SQUASHFS_MAGIC {
                    return Ok(());
                }
                let info = sys.fstat(fd.raw())?;
                if matches!(kind, EntryKind::File) && info.size != 0 {
                    return Ok(());
                }
                info.kind == FileKind::Directory
            }
        };
        let parent_fd = match create::open_path(sys, parent) {
            Ok(fd) => fd,
            Err(err) => {
                tracing::debug!(?parent, %err, "cannot open parent of mount point, skipping cleanup");
                return Ok(());
            }
        };
        match sys.unlinkat(parent_fd.raw(), name, remove_dir) {
            Ok(()) => Ok(()),
            Err(err) => match err.errno() {
                Some(
                    Errno::EROFS | Errno::EBUSY | Errno::ENOTEMPTY | Errno::EEXIST | Errno::ENOENT,
                ) => {
                    tracing::debug!(?target, %err, "cannot remove placeholder, ignoring");
                    Ok(())
                }
                _ => Err(ChangeError::Remove {
                    path: target.clone(),
                    source: err,
                }),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::syscall::test::{file_info, fs_info, TestSyscall};
    use crate::syscall::{MountInfoEntry, ST_RDONLY};

    fn unrestricted() -> Assumptions {
        let mut assumptions = Assumptions::new();
        assumptions.add_unrestricted_paths(vec![PathBuf::from("/")]);
        assumptions
    }

    fn entry(source: &str, target: &str, fs_type: &str, options: &[&str]) -> MountEntry {
        MountEntry {
            source: source.to_string(),
            target: PathBuf::from(target),
            fs_type: fs_type.to_string(),
            options: options.iter().map(|o| o.to_string()).collect(),
            ..Default::default()
        }
    }

    #[test]
    fn test_keep_has_no_side_effects() {
        let sys = TestSyscall::new();
        let mut assumptions = unrestricted();
        let change = Change {
            action: Action::Keep,
            entry: entry("tmpfs", "/target", "tmpfs", &[]),
        };
        let synthesised = change.perform(&sys, &mut assumptions).unwrap();
        assert!(synthesised.is_empty());
        assert!(sys.calls().is_empty());
        assert_eq!(assumptions.past_changes(), std::slice::from_ref(&change));
    }

    #[test]
    fn test_mount_creates_missing_target_directory() {
        let sys = TestSyscall::new();
        let mut assumptions = unrestricted();
        let change = Change {
            action: Action::Mount,
            entry: entry("tmpfs", "/target", "tmpfs", &["mode=0755"]),
        };
        change.perform(&sys, &mut assumptions).unwrap();
        let calls = sys.calls();
        assert_eq!(calls[0], r#"lstat "/target""#);
        assert!(calls.contains(&r#"mkdirat 3 "target" 0o755"#.to_string()));
        assert_eq!(
            calls.last().map(String::as_str),
            Some(r#"mount "tmpfs" "/target" "tmpfs" 0 "mode=0755""#)
        );
    }

    #[test]
    fn test_mount_existing_target_of_wrong_shape() {
        let sys = TestSyscall::new();
        sys.insert_lstat_result("/target", file_info(FileKind::Regular));
        let mut assumptions = unrestricted();
        let change = Change {
            action: Action::Mount,
            entry: entry("tmpfs", "/target", "tmpfs", &[]),
        };
        let err = change.perform(&sys, &mut assumptions).unwrap_err();
        assert!(matches!(
            err.error,
            ChangeError::ShapeMismatch { path, expected: "directory" } if path == PathBuf::from("/target")
        ));
        // Nothing was mounted and nothing was recorded.
        assert!(!sys.calls().iter().any(|c| c.starts_with("mount ")));
        assert!(assumptions.past_changes().is_empty());
    }

    #[test]
    fn test_bind_mount_uses_proc_fd_paths() {
        let sys = TestSyscall::new();
        sys.insert_lstat_result("/source", file_info(FileKind::Directory));
        sys.insert_lstat_result("/target", file_info(FileKind::Directory));
        let mut assumptions = unrestricted();
        let change = Change {
            action: Action::Mount,
            entry: entry("/source", "/target", "none", &["bind"]),
        };
        change.perform(&sys, &mut assumptions).unwrap();
        assert_eq!(
            sys.calls(),
            vec![
                r#"lstat "/target""#,
                r#"lstat "/source""#,
                // open the source
                r#"open "/" O_PATH|O_NOFOLLOW|O_CLOEXEC|O_DIRECTORY 0o0"#,
                r#"openat 3 "source" O_PATH|O_NOFOLLOW|O_CLOEXEC 0o0"#,
                "close 3",
                r#"fstat 4 "/source""#,
                // open the target
                r#"open "/" O_PATH|O_NOFOLLOW|O_CLOEXEC|O_DIRECTORY 0o0"#,
                r#"openat 5 "target" O_PATH|O_NOFOLLOW|O_CLOEXEC 0o0"#,
                "close 5",
                r#"fstat 6 "/target""#,
                // mount one descriptor onto the other
                r#"mount "/proc/self/fd/4" "/proc/self/fd/6" "" MS_BIND """#,
                "close 6",
                "close 4",
            ]
        );
    }

    #[test]
    fn test_bind_mount_applies_propagation_separately() {
        let sys = TestSyscall::new();
        sys.insert_lstat_result("/source", file_info(FileKind::Directory));
        sys.insert_lstat_result("/target", file_info(FileKind::Directory));
        let mut assumptions = unrestricted();
        let change = Change {
            action: Action::Mount,
            entry: entry("/source", "/target", "none", &["rbind", "rshared"]),
        };
        change.perform(&sys, &mut assumptions).unwrap();
        let calls = sys.calls();
        assert!(calls
            .iter()
            .any(|c| c == r#"mount "/proc/self/fd/4" "/proc/self/fd/6" "" MS_BIND|MS_REC """#));
        assert_eq!(
            calls.last().map(String::as_str),
            Some(r#"mount "" "/target" "" MS_SHARED|MS_REC """#)
        );
    }

    #[test]
    fn test_mount_symlink_kind_creates_link_and_mounts_nothing() {
        let sys = TestSyscall::new();
        let mut assumptions = unrestricted();
        let change = Change {
            action: Action::Mount,
            entry: entry(
                "none",
                "/target/link",
                "none",
                &["x-snapd.kind=symlink", "x-snapd.symlink=/somewhere"],
            ),
        };
        change.perform(&sys, &mut assumptions).unwrap();
        let calls = sys.calls();
        assert!(calls.contains(&r#"symlinkat "/somewhere" 4 "link""#.to_string()));
        assert!(!calls.iter().any(|c| c.starts_with("mount ")));
    }

    #[test]
    fn test_mount_ensure_dir_creates_directory_only() {
        let sys = TestSyscall::new();
        sys.insert_lstat_result("/home/user", file_info(FileKind::Directory));
        let mut assumptions = unrestricted();
        let change = Change {
            action: Action::Mount,
            entry: entry(
                "none",
                "/home/user/stuff",
                "none",
                &["x-snapd.kind=ensure-dir", "x-snapd.must-exist-dir=/home/user"],
            ),
        };
        change.perform(&sys, &mut assumptions).unwrap();
        let calls = sys.calls();
        assert!(calls.contains(&r#"mkdirat 5 "stuff" 0o755"#.to_string()));
        assert!(!calls.iter().any(|c| c.starts_with("mount ")));
    }

    #[test]
    fn test_mount_ensure_dir_requires_existing_parent() {
        let sys = TestSyscall::new();
        let mut assumptions = unrestricted();
        let change = Change {
            action: Action::Mount,
            entry: entry(
                "none",
                "/home/user/stuff",
                "none",
                &["x-snapd.kind=ensure-dir", "x-snapd.must-exist-dir=/home/user"],
            ),
        };
        let err = change.perform(&sys, &mut assumptions).unwrap_err();
        assert!(matches!(
            err.error,
            ChangeError::EnsureDirParentMissing { .. }
        ));
    }

    #[test]
    fn test_mount_ignore_missing_target() {
        let sys = TestSyscall::new();
        let mut assumptions = unrestricted();
        let change = Change {
            action: Action::Mount,
            entry: entry("/source", "/target", "none", &["bind", "x-snapd.ignore-missing"]),
        };
        let err = change.perform(&sys, &mut assumptions).unwrap_err();
        assert!(matches!(err.error, ChangeError::IgnoredMissingMount));
        assert!(err.synthesised.is_empty());
    }

    #[test]
    fn test_mount_ignore_missing_source() {
        let sys = TestSyscall::new();
        sys.insert_lstat_result("/target", file_info(FileKind::Directory));
        let mut assumptions = unrestricted();
        let change = Change {
            action: Action::Mount,
            entry: entry("/source", "/target", "none", &["bind", "x-snapd.ignore-missing"]),
        };
        let err = change.perform(&sys, &mut assumptions).unwrap_err();
        assert!(matches!(err.error, ChangeError::IgnoredMissingMount));
    }

    #[test]
    fn test_unmount_plain() {
        let sys = TestSyscall::new();
        sys.insert_lstat_result("/target", file_info(FileKind::Directory));
        let mut assumptions = unrestricted();
        let change = Change {
            action: Action::Unmount,
            entry: entry("tmpfs", "/target", "tmpfs", &[]),
        };
        change.perform(&sys, &mut assumptions).unwrap();
        let calls = sys.calls();
        assert_eq!(calls[0], r#"umount2 "/target" UMOUNT_NOFOLLOW"#);
        // The placeholder directory is removed afterwards.
        assert!(calls.contains(&r#"unlinkat 5 "target" AT_REMOVEDIR"#.to_string()));
    }

    #[test]
    fn test_unmount_with_detach_goes_private_first() {
        let sys = TestSyscall::new();
        let mut assumptions = unrestricted();
        let change = Change {
            action: Action::Unmount,
            entry: entry("tmpfs", "/target", "tmpfs", &["x-snapd.detach"]),
        };
        change.perform(&sys, &mut assumptions).unwrap();
        let calls = sys.calls();
        assert_eq!(calls[0], r#"mount "" "/target" "" MS_PRIVATE|MS_REC """#);
        assert_eq!(calls[1], r#"umount2 "/target" UMOUNT_NOFOLLOW|MNT_DETACH"#);
    }

    #[test]
    fn test_unmount_einval_consumed_when_not_mounted() {
        let sys = TestSyscall::new();
        sys.insert_fault(r#"umount2 "/target" UMOUNT_NOFOLLOW"#, Errno::EINVAL);
        let mut assumptions = unrestricted();
        let change = Change {
            action: Action::Unmount,
            entry: entry("tmpfs", "/target", "tmpfs", &[]),
        };
        change.perform(&sys, &mut assumptions).unwrap();
        assert!(sys.calls().contains(&"mountinfo".to_string()));
    }

    #[test]
    fn test_unmount_einval_surfaced_when_still_mounted() {
        let sys = TestSyscall::new();
        sys.insert_fault(r#"umount2 "/target" UMOUNT_NOFOLLOW"#, Errno::EINVAL);
        sys.set_mountinfo(vec![MountInfoEntry {
            mount_point: PathBuf::from("/target"),
            fs_type: "tmpfs".to_string(),
            source: "tmpfs".to_string(),
        }]);
        let mut assumptions = unrestricted();
        let change = Change {
            action: Action::Unmount,
            entry: entry("tmpfs", "/target", "tmpfs", &[]),
        };
        let err = change.perform(&sys, &mut assumptions).unwrap_err();
        assert!(matches!(err.error, ChangeError::Unmount { .. }));
    }

    #[test]
    fn test_unmount_leaves_placeholder_on_squashfs() {
        let sys = TestSyscall::new();
        sys.insert_fstatfs_result("/target", fs_info(SQUASHFS_MAGIC, ST_RDONLY));
        let mut assumptions = unrestricted();
        let change = Change {
            action: Action::Unmount,
            entry: entry("/source", "/target", "none", &["bind"]),
        };
        change.perform(&sys, &mut assumptions).unwrap();
        assert!(!sys.calls().iter().any(|c| c.starts_with("unlinkat")));
    }

    #[test]
    fn test_unmount_leaves_non_empty_file_placeholder() {
        let sys = TestSyscall::new();
        let mut full = file_info(FileKind::Regular);
        full.size = 5;
        sys.insert_fstat_result("/target", full);
        let mut assumptions = unrestricted();
        let change = Change {
            action: Action::Unmount,
            entry: entry("/source", "/target", "none", &["bind", "x-snapd.kind=file"]),
        };
        change.perform(&sys, &mut assumptions).unwrap();
        assert!(!sys.calls().iter().any(|c| c.starts_with("unlinkat")));
    }

    #[test]
    fn test_unmount_placeholder_removal_failure_is_consumed() {
        let sys = TestSyscall::new();
        sys.insert_fault(r#"unlinkat 5 "target" AT_REMOVEDIR"#, Errno::EBUSY);
        let mut assumptions = unrestricted();
        let change = Change {
            action: Action::Unmount,
            entry: entry("tmpfs", "/target", "tmpfs", &[]),
        };
        change.perform(&sys, &mut assumptions).unwrap();
    }

    #[test]
    fn test_unmount_symlink_kind_removes_link() {
        let sys = TestSyscall::new();
        let mut assumptions = unrestricted();
        let change = Change {
            action: Action::Unmount,
            entry: entry(
                "none",
                "/target/link",
                "none",
                &["x-snapd.kind=symlink", "x-snapd.symlink=/somewhere"],
            ),
        };
        change.perform(&sys, &mut assumptions).unwrap();
        let calls = sys.calls();
        assert!(!calls.iter().any(|c| c.starts_with("umount2")));
        assert!(calls.contains(&r#"unlinkat 4 "link" 0"#.to_string()));
    }

    #[test]
    fn test_mount_existing_symlink_target_needs_no_work() {
        let sys = TestSyscall::new();
        sys.insert_lstat_result("/target/link", file_info(FileKind::Symlink));
        let mut assumptions = unrestricted();
        let change = Change {
            action: Action::Mount,
            entry: entry(
                "none",
                "/target/link",
                "none",
                &["x-snapd.kind=symlink", "x-snapd.symlink=/somewhere"],
            ),
        };
        change.perform(&sys, &mut assumptions).unwrap();
        assert_eq!(sys.calls(), vec![r#"lstat "/target/link""#]);
    }

    #[test]
    fn test_mount_file_kind_binds_existing_file() {
        let sys = TestSyscall::new();
        sys.insert_lstat_result("/src", file_info(FileKind::Regular));
        sys.insert_lstat_result("/tgt", file_info(FileKind::Regular));
        let mut assumptions = unrestricted();
        let change = Change {
            action: Action::Mount,
            entry: entry("/src", "/tgt", "none", &["bind", "x-snapd.kind=file"]),
        };
        change.perform(&sys, &mut assumptions).unwrap();
        let calls = sys.calls();
        // Neither side was created, both were opened and bound.
        assert!(!calls.iter().any(|c| c.contains("O_CREAT")));
        assert!(calls
            .iter()
            .any(|c| c == r#"mount "/proc/self/fd/4" "/proc/self/fd/6" "" MS_BIND """#));
    }

    #[test]
    fn test_mount_source_of_wrong_shape() {
        let sys = TestSyscall::new();
        sys.insert_lstat_result("/target", file_info(FileKind::Directory));
        sys.insert_lstat_result("/source", file_info(FileKind::Regular));
        let mut assumptions = unrestricted();
        let change = Change {
            action: Action::Mount,
            entry: entry("/source", "/target", "none", &["bind"]),
        };
        let err = change.perform(&sys, &mut assumptions).unwrap_err();
        assert!(matches!(
            err.error,
            ChangeError::ShapeMismatch { path, expected: "directory" } if path == PathBuf::from("/source")
        ));
    }

    #[test]
    fn test_mount_honours_mode_and_owner_options() {
        let sys = TestSyscall::new();
        let mut assumptions = unrestricted();
        let change = Change {
            action: Action::Mount,
            entry: entry(
                "tmpfs",
                "/target",
                "tmpfs",
                &["x-snapd.mode=0700", "x-snapd.uid=1000", "x-snapd.gid=1000"],
            ),
        };
        change.perform(&sys, &mut assumptions).unwrap();
        let calls = sys.calls();
        assert!(calls.contains(&r#"mkdirat 3 "target" 0o700"#.to_string()));
        assert!(calls.contains(&"fchown 4 1000 1000".to_string()));
    }

    #[test]
    fn test_mount_rejects_malformed_mode_option() {
        let sys = TestSyscall::new();
        let mut assumptions = unrestricted();
        let change = Change {
            action: Action::Mount,
            entry: entry("tmpfs", "/target", "tmpfs", &["x-snapd.mode=banana"]),
        };
        let err = change.perform(&sys, &mut assumptions).unwrap_err();
        assert!(matches!(
            err.error,
            ChangeError::Entry(EntryError::InvalidMode(_))
        ));
    }

    #[test]
    fn test_mount_rejects_relative_target() {
        let sys = TestSyscall::new();
        let mut assumptions = unrestricted();
        let change = Change {
            action: Action::Mount,
            entry: entry("tmpfs", "relative/path", "tmpfs", &[]),
        };
        let err = change.perform(&sys, &mut assumptions).unwrap_err();
        assert!(matches!(err.error, ChangeError::Create(CreateError::Path(_))));
        assert!(sys.calls().is_empty());
    }

    #[test]
    fn test_mount_ensure_dir_outside_required_root() {
        let sys = TestSyscall::new();
        let mut assumptions = unrestricted();
        let change = Change {
            action: Action::Mount,
            entry: entry(
                "none",
                "/elsewhere/stuff",
                "none",
                &["x-snapd.kind=ensure-dir", "x-snapd.must-exist-dir=/home/user"],
            ),
        };
        let err = change.perform(&sys, &mut assumptions).unwrap_err();
        assert!(matches!(err.error, ChangeError::EnsureDirMisuse { .. }));
    }

    #[test]
    fn test_unmount_ensure_dir_is_a_no_op() {
        let sys = TestSyscall::new();
        let mut assumptions = unrestricted();
        let change = Change {
            action: Action::Unmount,
            entry: entry(
                "none",
                "/home/user/stuff",
                "none",
                &["x-snapd.kind=ensure-dir", "x-snapd.must-exist-dir=/home/user"],
            ),
        };
        change.perform(&sys, &mut assumptions).unwrap();
        assert!(sys.calls().is_empty());
    }

    #[test]
    fn test_mount_pokes_hole_through_read_only_filesystem() {
        let sys = TestSyscall::new();
        // /rofs exists on a read-only filesystem; creating /rofs/dir fails
        // with EROFS and triggers a writable mimic at /rofs.
        sys.insert_lstat_result("/rofs", file_info(FileKind::Directory));
        sys.insert_fault(r#"mkdirat 3 "rofs" 0o755"#, Errno::EEXIST);
        sys.insert_fault(r#"mkdirat 4 "dir" 0o755"#, Errno::EROFS);
        sys.insert_readdir_result(
            "/rofs",
            vec![
                crate::syscall::DirEntry {
                    name: "data".to_string(),
                    kind: FileKind::Regular,
                },
                crate::syscall::DirEntry {
                    name: "link".to_string(),
                    kind: FileKind::Symlink,
                },
                crate::syscall::DirEntry {
                    name: "sock".to_string(),
                    kind: FileKind::Other,
                },
                crate::syscall::DirEntry {
                    name: "sub".to_string(),
                    kind: FileKind::Directory,
                },
            ],
        );
        sys.insert_readlink_result("/rofs/link", "/elsewhere");

        let mut assumptions = unrestricted();
        let change = Change {
            action: Action::Mount,
            entry: entry("tmpfs", "/rofs/dir", "tmpfs", &[]),
        };
        let synthesised = change.perform(&sys, &mut assumptions).unwrap();

        let targets: Vec<String> = synthesised
            .iter()
            .map(|c| format!("{} {}", c.action, c.entry.target.display()))
            .collect();
        assert_eq!(
            targets,
            vec![
                "mount /tmp/.snap/rofs",
                "mount /rofs",
                "mount /rofs/data",
                "mount /rofs/link",
                "mount /rofs/sub",
                "unmount /tmp/.snap/rofs",
            ]
        );
        // The mimicked tmpfs replicates the original attributes and is
        // coupled to the entry that needed it.
        let tmpfs = &synthesised[1].entry;
        assert_eq!(tmpfs.fs_type, "tmpfs");
        assert!(tmpfs.is_synthetic());
        assert_eq!(tmpfs.needed_by(), Some("/rofs/dir"));
        assert!(tmpfs.options.contains(&"mode=0755".to_string()));
        // The special file was skipped entirely.
        assert!(!targets.iter().any(|t| t.contains("sock")));
        // After the mimic the original mount went ahead.
        assert_eq!(
            sys.calls().last().map(String::as_str),
            Some(r#"mount "tmpfs" "/rofs/dir" "tmpfs" 0 """#)
        );
    }
}
