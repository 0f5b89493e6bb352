//! Reading and writing mount profiles.
//!
//! A profile on disk is an append-style log in fstab syntax: what was
//! mounted, in time order. Preserving that order is what makes
//! child-before-parent unmounting a simple reverse traversal.

use std::fmt;
use std::fs;
use std::io::ErrorKind;
use std::path::Path;

use crate::change::{Action, Change};
use crate::entry::{EntryError, MountEntry};

#[derive(Debug, thiserror::Error)]
pub enum ProfileError {
    #[error("cannot parse mount profile line {line}: {source}")]
    Parse {
        line: usize,
        #[source]
        source: EntryError,
    },
    #[error("{0}")]
    IO(#[from] std::io::Error),
}

/// An ordered sequence of mount entries.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MountProfile {
    pub entries: Vec<MountEntry>,
}

impl MountProfile {
    pub fn parse(text: &str) -> Result<MountProfile, ProfileError> {
        let mut entries = Vec::new();
        for (index, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let entry = MountEntry::parse(line).map_err(|source| ProfileError::Parse {
                line: index + 1,
                source,
            })?;
            entries.push(entry);
        }
        Ok(MountProfile { entries })
    }

    pub fn read(path: &Path) -> Result<MountProfile, ProfileError> {
        let text = fs::read_to_string(path)?;
        MountProfile::parse(&text)
    }

    /// Like [`MountProfile::read`] but a missing file reads as an empty
    /// profile, the state before any update has run.
    pub fn read_or_default(path: &Path) -> Result<MountProfile, ProfileError> {
        match fs::read_to_string(path) {
            Ok(text) => MountProfile::parse(&text),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(MountProfile::default()),
            Err(err) => Err(err.into()),
        }
    }

    /// Persists the profile. The write goes to a temporary file in the same
    /// directory which is then renamed over the destination, so a reader
    /// never observes a partially written profile.
    pub fn save(&self, path: &Path) -> Result<(), ProfileError> {
        let mut tmp = path.as_os_str().to_os_string();
        tmp.push(".tmp");
        let tmp = Path::new(&tmp);
        fs::write(tmp, self.to_string())?;
        fs::rename(tmp, path)?;
        Ok(())
    }

    /// Builds the next-generation current profile from the changes made
    /// during an update. `Mount` and `Keep` contribute their entry in
    /// order; an `Unmount` retracts any earlier entry with the same target
    /// and filesystem type, which is how a mimic's safe-keeping mount
    /// disappears from the persisted state. A single directory can host
    /// two entries of different types, so the type is part of the key.
    pub fn from_changes(changes: &[Change]) -> MountProfile {
        let mut entries: Vec<MountEntry> = Vec::new();
        for change in changes {
            match change.action {
                Action::Mount | Action::Keep => entries.push(change.entry.clone()),
                Action::Unmount => entries.retain(|e| {
                    e.target != change.entry.target || e.fs_type != change.entry.fs_type
                }),
            }
        }
        MountProfile { entries }
    }
}

impl fmt::Display for MountProfile {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for entry in &self.entries {
            writeln!(f, "{}", entry)?;
        }
        Ok(())
    }
}
