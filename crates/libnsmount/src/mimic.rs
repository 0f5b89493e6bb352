//! Construction of writable mimics.
//!
//! A mimic makes a read-only directory writable within the namespace while
//! preserving its visible contents: the directory is recursively bound to a
//! safe-keeping location, a tmpfs replicating the original attributes is
//! mounted over it, the original contents are bind-mounted back entry by
//! entry and the safe-keeping location is detached again.

use std::path::{Path, PathBuf};

use crate::assumptions::Assumptions;
use crate::change::{Action, Change, ChangeError, PerformError};
use crate::create;
use crate::entry::MountEntry;
use crate::syscall::{FileKind, Syscall};

/// Private location that holds the original content of a mimicked directory
/// while the tmpfs is installed over it.
pub const SAFE_KEEPING_PREFIX: &str = "/tmp/.snap";

/// The safe-keeping location of `dir`, e.g. `/tmp/.snap/etc` for `/etc`.
pub fn safe_keeping_dir(dir: &Path) -> PathBuf {
    let relative = dir.strip_prefix("/").unwrap_or(dir);
    Path::new(SAFE_KEEPING_PREFIX).join(relative)
}

/// Plans the changes that make `dir` writable. Every planned mount is
/// tagged as synthetic and coupled to `needed_by`, the id of the entry the
/// mimic exists for, so the next planner run can reason about it.
pub fn plan_writable_mimic(
    sys: &dyn Syscall,
    dir: &Path,
    needed_by: &str,
) -> Result<Vec<Change>, ChangeError> {
    tracing::debug!(?dir, needed_by, "planning writable mimic");
    let dir_fd = create::open_path(sys, dir).map_err(ChangeError::Create)?;
    let info = sys.fstat(dir_fd.raw())?;
    if info.kind != FileKind::Directory {
        return Err(ChangeError::ShapeMismatch {
            path: dir.to_path_buf(),
            expected: "directory",
        });
    }
    let safe_keeping = safe_keeping_dir(dir);
    let tag = |mut options: Vec<String>| -> Vec<String> {
        options.push("x-snapd.synthetic".to_string());
        options.push(format!("x-snapd.needed-by={}", needed_by));
        options
    };

    let mut changes = vec![
        // Hold the original content, and any mounts inside it, while the
        // tmpfs takes over the directory.
        Change {
            action: Action::Mount,
            entry: MountEntry {
                source: dir.to_string_lossy().into_owned(),
                target: safe_keeping.clone(),
                fs_type: "none".to_string(),
                options: tag(vec!["rbind".to_string()]),
                ..Default::default()
            },
        },
        Change {
            action: Action::Mount,
            entry: MountEntry {
                source: "tmpfs".to_string(),
                target: dir.to_path_buf(),
                fs_type: "tmpfs".to_string(),
                options: tag(vec![
                    format!("mode={:04o}", info.mode),
                    format!("uid={}", info.uid),
                    format!("gid={}", info.gid),
                ]),
                ..Default::default()
            },
        },
    ];

    for dirent in sys.readdir(dir)? {
        let target = dir.join(&dirent.name);
        let source = safe_keeping.join(&dirent.name);
        match dirent.kind {
            FileKind::Directory => changes.push(Change {
                action: Action::Mount,
                entry: MountEntry {
                    source: source.to_string_lossy().into_owned(),
                    target,
                    fs_type: "none".to_string(),
                    options: tag(vec!["rbind".to_string()]),
                    ..Default::default()
                },
            }),
            FileKind::Regular => changes.push(Change {
                action: Action::Mount,
                entry: MountEntry {
                    source: source.to_string_lossy().into_owned(),
                    target,
                    fs_type: "none".to_string(),
                    options: tag(vec!["bind".to_string(), "x-snapd.kind=file".to_string()]),
                    ..Default::default()
                },
            }),
            FileKind::Symlink => {
                let link_target = sys.readlinkat(dir_fd.raw(), &dirent.name)?;
                changes.push(Change {
                    action: Action::Mount,
                    entry: MountEntry {
                        source: "none".to_string(),
                        target,
                        fs_type: "none".to_string(),
                        options: tag(vec![
                            "x-snapd.kind=symlink".to_string(),
                            format!("x-snapd.symlink={}", link_target.display()),
                        ]),
                        ..Default::default()
                    },
                });
            }
            FileKind::Other => {
                tracing::debug!(path = ?target, "skipping special file while planning mimic");
            }
        }
    }

    changes.push(Change {
        action: Action::Unmount,
        entry: MountEntry {
            source: "none".to_string(),
            target: safe_keeping,
            fs_type: "none".to_string(),
            options: vec!["x-snapd.detach".to_string()],
            ..Default::default()
        },
    });
    Ok(changes)
}

/// Executes a mimic plan. On failure the already-executed mounts are undone
/// in reverse order; when the recovery itself fails the error is fatal
/// since the namespace may be left inconsistent.
pub fn exec_writable_mimic(
    sys: &dyn Syscall,
    plan: &[Change],
    assumptions: &mut Assumptions,
) -> Result<Vec<Change>, PerformError> {
    let mut performed: Vec<Change> = Vec::new();
    let mut undo: Vec<Change> = Vec::new();
    for change in plan {
        match change.perform(sys, assumptions) {
            Ok(nested) => {
                performed.extend(nested);
                performed.push(change.clone());
                if change.action == Action::Mount {
                    undo.push(change.clone());
                }
            }
            Err(err) => {
                let mut synthesised = performed;
                synthesised.extend(err.synthesised);
                for done in undo.iter().rev() {
                    let mut entry = done.entry.clone();
                    if entry.is_recursive_bind() && !entry.is_detach() {
                        entry.options.push("x-snapd.detach".to_string());
                    }
                    let inverse = Change {
                        action: Action::Unmount,
                        entry,
                    };
                    if let Err(undo_err) = inverse.perform(sys, assumptions) {
                        tracing::error!(change = %inverse, err = %undo_err, "cannot undo mimic change");
                        return Err(PerformError {
                            synthesised,
                            error: ChangeError::Fatal {
                                change: inverse.to_string(),
                                source: Box::new(undo_err.error),
                            },
                        });
                    }
                    // This step was undone, its mount is no longer applied.
                    synthesised.retain(|c| {
                        c.entry.target != inverse.entry.target
                            || c.entry.fs_type != inverse.entry.fs_type
                    });
                }
                return Err(PerformError {
                    synthesised,
                    error: err.error,
                });
            }
        }
    }
    Ok(performed)
}

/// Plans and executes a writable mimic at `dir` on behalf of `needed_by`.
pub fn create_writable_mimic(
    sys: &dyn Syscall,
    dir: &Path,
    needed_by: &str,
    assumptions: &mut Assumptions,
) -> Result<Vec<Change>, PerformError> {
    let plan = plan_writable_mimic(sys, dir, needed_by).map_err(|error| PerformError {
        synthesised: Vec::new(),
        error,
    })?;
    exec_writable_mimic(sys, &plan, assumptions)
}
