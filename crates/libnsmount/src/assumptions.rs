//! Global state carried across a single update run and the per-walk
//! write restrictions derived from it.

use std::cell::RefCell;
use std::collections::HashSet;
use std::os::unix::io::RawFd;
use std::path::{Path, PathBuf};

use nix::sys::stat::Mode;

use crate::change::{Action, Change};
use crate::path;
use crate::syscall::{Syscall, SyscallError, TMPFS_MAGIC};

/// A write that would, if not mediated by a tmpfs or a read-only
/// filesystem, become visible to the host.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("cannot write to {violated:?} because it would escape the sandbox (wanted {desired:?})")]
pub struct TrespassingError {
    pub violated: PathBuf,
    pub desired: PathBuf,
}

#[derive(Debug, thiserror::Error)]
pub enum CheckError {
    #[error(transparent)]
    Trespassing(#[from] TrespassingError),
    #[error(transparent)]
    Syscall(#[from] SyscallError),
}

struct ModeHint {
    pattern: String,
    mode: Mode,
}

/// Process-wide state for one update run: where writes are known safe,
/// which modes auto-created directories get, and what has already been
/// changed (used to recognise tmpfs directories installed by earlier
/// changes or earlier runs).
#[derive(Default)]
pub struct Assumptions {
    unrestricted_paths: Vec<PathBuf>,
    mode_hints: Vec<ModeHint>,
    past_changes: Vec<Change>,
    /// Device numbers known to belong to a private tmpfs, so sibling checks
    /// within the same tmpfs are O(1).
    verified_devices: RefCell<HashSet<u64>>,
}

impl Assumptions {
    pub fn new() -> Assumptions {
        Assumptions::default()
    }

    /// Adds path prefixes where writes are known safe, such as the
    /// application's own data tree and /tmp.
    pub fn add_unrestricted_paths<I>(&mut self, paths: I)
    where
        I: IntoIterator<Item = PathBuf>,
    {
        for p in paths {
            self.unrestricted_paths.push(path::clean(&p));
        }
    }

    /// Adds a hint consulted when the secure creator makes a directory that
    /// carries no explicit mode. `*` and `?` in the pattern never match `/`.
    pub fn add_mode_hint(&mut self, pattern: &str, mode: Mode) {
        self.mode_hints.push(ModeHint {
            pattern: pattern.to_string(),
            mode,
        });
    }

    /// Records a change that has been applied.
    pub fn add_change(&mut self, change: Change) {
        self.past_changes.push(change);
    }

    pub fn past_changes(&self) -> &[Change] {
        &self.past_changes
    }

    /// The mode an auto-created directory at `path` should get: the first
    /// matching hint, or 0755.
    pub fn mode_for_path(&self, path: &Path) -> Mode {
        let text = path.to_string_lossy();
        self.mode_hints
            .iter()
            .find(|hint| glob_match(&hint.pattern, &text))
            .map(|hint| hint.mode)
            .unwrap_or_else(|| Mode::from_bits_truncate(0o755))
    }

    pub fn is_unrestricted(&self, path: &Path) -> bool {
        self.unrestricted_paths
            .iter()
            .any(|prefix| path.starts_with(prefix))
    }

    /// Restrictions for one creator call heading towards `desired`.
    pub fn restrictions_for(&self, desired: &Path) -> Restrictions<'_> {
        Restrictions {
            assumptions: self,
            desired: desired.to_path_buf(),
            restricted: !self.is_unrestricted(desired),
        }
    }

    /// Decides whether the tmpfs open at `dirfd` is private to the
    /// application, either because the device was verified before, because
    /// the past-change log says an earlier change mounted it, or because of
    /// the /var/lib exception.
    fn verified_tmpfs(
        &self,
        sys: &dyn Syscall,
        dirfd: RawFd,
        path: &Path,
    ) -> Result<bool, SyscallError> {
        let info = sys.fstat(dirfd)?;
        if self.verified_devices.borrow().contains(&info.dev) {
            return Ok(true);
        }
        // TODO: drop the /var/lib exception when the container-runtime
        // integration that relies on it is retired.
        if path == Path::new("/var/lib") || self.is_private_tmpfs(path) {
            self.verified_devices.borrow_mut().insert(info.dev);
            return Ok(true);
        }
        Ok(false)
    }

    /// Scans the past-change log for a tmpfs mounted at `path` or at one of
    /// its ancestors whose mount has not been retracted by a later unmount.
    fn is_private_tmpfs(&self, path: &Path) -> bool {
        let mut verdict = false;
        for change in &self.past_changes {
            let entry = &change.entry;
            if !entry.is_tmpfs() || !path.starts_with(&entry.target) {
                continue;
            }
            match change.action {
                Action::Mount | Action::Keep => verdict = true,
                Action::Unmount => verdict = false,
            }
        }
        verdict
    }
}

/// Per-walk restriction state. Created restricted unless the desired path
/// is already in safe territory, and progressively lifted as the walk
/// enters directories that are verifiably safe to write to.
pub struct Restrictions<'a> {
    assumptions: &'a Assumptions,
    desired: PathBuf,
    restricted: bool,
}

impl Restrictions<'_> {
    pub fn lift(&mut self) {
        self.restricted = false;
    }

    /// Consulted before each write-bearing syscall, with the descriptor and
    /// path of the directory about to be written to. A directory is safe
    /// when it is under the unrestricted allow-list, on a read-only
    /// filesystem (the write will be stopped by EROFS and redirected into a
    /// mimic), or on a tmpfs this application put there.
    pub fn check(&mut self, sys: &dyn Syscall, dirfd: RawFd, path: &Path) -> Result<(), CheckError> {
        if !self.restricted {
            return Ok(());
        }
        if self.assumptions.is_unrestricted(path) {
            self.lift();
            return Ok(());
        }
        let fs = sys.fstatfs(dirfd)?;
        if fs.fs_type == TMPFS_MAGIC && self.assumptions.verified_tmpfs(sys, dirfd, path)? {
            self.lift();
            return Ok(());
        }
        // A read-only filesystem is safe to attempt writes on, but does not
        // lift the restriction: deeper components may cross onto a writable
        // filesystem.
        if fs.is_read_only() {
            return Ok(());
        }
        Err(TrespassingError {
            violated: path.to_path_buf(),
            desired: self.desired.clone(),
        }
        .into())
    }
}

/// `filepath.Match`-style matching: `*` matches any run of non-separator
/// characters, `?` a single non-separator character.
fn glob_match(pattern: &str, name: &str) -> bool {
    fn matches(pattern: &[char], name: &[char]) -> bool {
        match pattern.first() {
            None => name.is_empty(),
            Some('*') => {
                for skip in 0..=name.len() {
                    if matches(&pattern[1..], &name[skip..]) {
                        return true;
                    }
                    if skip < name.len() && name[skip] == '/' {
                        break;
                    }
                }
                false
            }
            Some('?') => {
                !name.is_empty() && name[0] != '/' && matches(&pattern[1..], &name[1..])
            }
            Some(c) => !name.is_empty() && name[0] == *c && matches(&pattern[1..], &name[1..]),
        }
    }
    let pattern: Vec<char> = pattern.chars().collect();
    let name: Vec<char> = name.chars().collect();
    matches(&pattern, &name)
}
