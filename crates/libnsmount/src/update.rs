//! The update driver: glues the planner and the executor together and
//! applies the error-reporting policy.

use crate::assumptions::Assumptions;
use crate::change::{Action, Change, ChangeError};
use crate::entry::EntryOrigin;
use crate::plan;
use crate::profile::{MountProfile, ProfileError};
use crate::syscall::Syscall;

#[derive(Debug, thiserror::Error)]
pub enum UpdateError {
    #[error("cannot load desired mount profile: {0}")]
    LoadDesired(#[source] ProfileError),
    #[error("cannot load current mount profile: {0}")]
    LoadCurrent(#[source] ProfileError),
    #[error("cannot save current mount profile: {0}")]
    SaveCurrent(#[source] ProfileError),
    #[error("cannot apply change {change}: {source}")]
    Change {
        change: String,
        #[source]
        source: ChangeError,
    },
}

/// The environment an update runs in. The namespace lock and the profile
/// locations are owned by the caller; the library only needs to read and
/// write profiles and to know the initial assumptions.
pub trait UpdateContext {
    fn assumptions(&self) -> Assumptions;
    fn load_desired_profile(&self) -> Result<MountProfile, ProfileError>;
    fn load_current_profile(&self) -> Result<MountProfile, ProfileError>;
    fn save_current_profile(&self, profile: &MountProfile) -> Result<(), ProfileError>;
}

/// Performs one mount namespace update: loads both profiles, computes the
/// needed changes, applies them in order and persists what was actually
/// done as the next current profile.
///
/// Failures on entries with layout or overname origin abort the update, as
/// does a failed mimic recovery; every other per-change failure is logged
/// and skipped. Entries tagged `x-snapd.ignore-missing` whose mount point
/// is absent are skipped silently.
pub fn execute_update(sys: &dyn Syscall, ctx: &dyn UpdateContext) -> Result<(), UpdateError> {
    let desired = ctx.load_desired_profile().map_err(UpdateError::LoadDesired)?;
    let current = ctx.load_current_profile().map_err(UpdateError::LoadCurrent)?;
    tracing::debug!(
        desired = desired.entries.len(),
        current = current.entries.len(),
        "computing mount profile changes"
    );

    let mut assumptions = ctx.assumptions();
    // Seed the past-change log so trespass checks recognise the tmpfs
    // directories that prior runs installed.
    for entry in &current.entries {
        assumptions.add_change(Change {
            action: Action::Mount,
            entry: entry.clone(),
        });
    }

    let changes = plan::needed_changes(&current, &desired, sys);
    let mut changes_made: Vec<Change> = Vec::new();
    for change in changes {
        match change.perform(sys, &mut assumptions) {
            Ok(synthesised) => {
                changes_made.extend(synthesised);
                changes_made.push(change);
            }
            Err(err) => {
                changes_made.extend(err.synthesised);
                if matches!(err.error, ChangeError::IgnoredMissingMount) {
                    tracing::debug!(change = %change, "skipping entry with missing mount point");
                    continue;
                }
                let origin = change.entry.origin();
                if err.error.is_fatal()
                    || matches!(origin, EntryOrigin::Layout | EntryOrigin::Overname)
                {
                    return Err(UpdateError::Change {
                        change: change.to_string(),
                        source: err.error,
                    });
                }
                tracing::error!(change = %change, err = %err.error, "cannot change mount namespace");
            }
        }
    }

    let next = MountProfile::from_changes(&changes_made);
    ctx.save_current_profile(&next)
        .map_err(UpdateError::SaveCurrent)
}
