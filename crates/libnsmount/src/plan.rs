//! The diff planner: reconciles the current and desired mount profiles
//! into an ordered list of keep, mount and unmount changes.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};

use crate::change::{Action, Change};
use crate::entry::{EntryKind, EntryOrigin, MountEntry};
use crate::path;
use crate::profile::MountProfile;
use crate::syscall::{FileKind, Syscall};

/// Computes the changes that transform `current` into `desired`.
///
/// Current entries are analysed in origin-and-path order: an entry is kept
/// when it is still wanted byte-for-byte (or, for synthetic entries, when
/// its beneficiary is still wanted), everything else is unmounted, children
/// before parents. Desired entries that were not kept are then mounted,
/// overname entries first, parents before children.
pub fn needed_changes(
    current: &MountProfile,
    desired: &MountProfile,
    sys: &dyn Syscall,
) -> Vec<Change> {
    let mut current: Vec<MountEntry> = current.entries.iter().map(clean_entry).collect();
    let desired: Vec<MountEntry> = desired.entries.iter().map(clean_entry).collect();

    // Sort by origin (overname first), then by target path compared
    // component-wise. Component order treats targets as directories, so
    // "/a/b-1" is not grouped under "/a/b" even though it shares the
    // prefix "/a/b". The sort is stable: two entries at the same target
    // keep their profile order.
    current.sort_by(|a, b| {
        let a_overname = a.origin() == EntryOrigin::Overname;
        let b_overname = b.origin() == EntryOrigin::Overname;
        b_overname.cmp(&a_overname).then_with(|| a.target.cmp(&b.target))
    });

    let desired_by_key: HashMap<(PathBuf, String), &MountEntry> = desired
        .iter()
        .map(|e| ((e.target.clone(), e.fs_type.clone()), e))
        .collect();
    let desired_ids: HashSet<String> = desired.iter().map(|e| e.id()).collect();

    // Reuse analysis over the sorted current entries.
    let mut reused = vec![false; current.len()];
    let mut reused_desired: HashSet<(PathBuf, String)> = HashSet::new();
    let mut skip_dir: Option<PathBuf> = None;
    for (index, entry) in current.iter().enumerate() {
        if let Some(skip) = &skip_dir {
            if entry.target.starts_with(skip) && entry.target != *skip {
                tracing::debug!(target = ?entry.target, under = ?skip, "cannot reuse entry under replaced mount point");
                continue;
            }
        }
        skip_dir = None;
        // The root entry of the sandbox is never disturbed.
        if entry.target == Path::new("/") && entry.origin() == EntryOrigin::Rootfs {
            reused[index] = true;
            continue;
        }
        // Synthetic entries live for as long as their beneficiary.
        if entry.is_synthetic() {
            if entry
                .needed_by()
                .map(|id| desired_ids.contains(id))
                .unwrap_or(false)
            {
                reused[index] = true;
                continue;
            }
        } else {
            let key = (entry.target.clone(), entry.fs_type.clone());
            if let Some(wanted) = desired_by_key.get(&key) {
                if *wanted == entry {
                    reused[index] = true;
                    reused_desired.insert(key);
                    continue;
                }
            }
        }
        skip_dir = Some(entry.target.clone());
    }

    let mut changes: Vec<Change> = Vec::with_capacity(current.len() + desired.len());

    // Keep or unmount the current entries, children before parents.
    for (index, entry) in current.iter().enumerate().rev() {
        if reused[index] {
            changes.push(Change {
                action: Action::Keep,
                entry: entry.clone(),
            });
        } else {
            let mut entry = entry.clone();
            // Anything that can hold nested mounts is detached so the whole
            // subtree goes away in one step.
            if (entry.is_tmpfs() || entry.is_bind()) && !entry.is_detach() {
                entry.options.push("x-snapd.detach".to_string());
            }
            changes.push(Change {
                action: Action::Unmount,
                entry,
            });
        }
    }

    // Mount the desired entries that were not kept.
    let mut to_mount: Vec<&MountEntry> = desired
        .iter()
        .filter(|e| !reused_desired.contains(&(e.target.clone(), e.fs_type.clone())))
        .collect();
    to_mount.sort_by(|a, b| a.target.cmp(&b.target));

    // Overname entries remap the identity of the application itself and
    // must exist before anything inside them.
    for entry in to_mount
        .iter()
        .copied()
        .filter(|e| e.origin() == EntryOrigin::Overname)
    {
        changes.push(Change {
            action: Action::Mount,
            entry: entry.clone(),
        });
    }

    // Entries whose target already has the right shape can be applied
    // directly; the rest need work at the nearest existing ancestor and are
    // grouped by it, ascending, so parents are handled before children.
    let mut independent: Vec<&MountEntry> = Vec::new();
    let mut grouped: BTreeMap<PathBuf, Vec<&MountEntry>> = BTreeMap::new();
    for entry in to_mount
        .iter()
        .copied()
        .filter(|e| e.origin() != EntryOrigin::Overname)
    {
        let shape_present = match entry.kind() {
            EntryKind::Directory | EntryKind::EnsureDir { .. } => is_kind(sys, &entry.target, FileKind::Directory),
            EntryKind::File => is_kind(sys, &entry.target, FileKind::Regular),
            EntryKind::Symlink { .. } => is_kind(sys, &entry.target, FileKind::Symlink),
        };
        if shape_present {
            independent.push(entry);
        } else {
            let parent = entry.target.parent().unwrap_or_else(|| Path::new("/"));
            grouped
                .entry(nearest_existing_ancestor(sys, parent))
                .or_default()
                .push(entry);
        }
    }
    for entry in independent {
        changes.push(Change {
            action: Action::Mount,
            entry: entry.clone(),
        });
    }
    for (_, entries) in grouped {
        for entry in entries {
            changes.push(Change {
                action: Action::Mount,
                entry: entry.clone(),
            });
        }
    }

    changes
}

fn clean_entry(entry: &MountEntry) -> MountEntry {
    let mut entry = entry.clone();
    entry.target = path::clean(&entry.target);
    entry
}

fn is_kind(sys: &dyn Syscall, path: &Path, kind: FileKind) -> bool {
    matches!(sys.lstat(path), Ok(info) if info.kind == kind)
}

fn nearest_existing_ancestor(sys: &dyn Syscall, mut path: &Path) -> PathBuf {
    loop {
        if is_kind(sys, path, FileKind::Directory) {
            return path.to_path_buf();
        }
        match path.parent() {
            Some(parent) => path = parent,
            None => return PathBuf::from("/"),
        }
    }
}
