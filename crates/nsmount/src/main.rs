//! Updates the mount namespace of a confined application.
//!
//! The process is expected to be started inside the target mount namespace
//! with the application frozen. It loads the desired profile (what the
//! application should see) and the current profile (what previous runs
//! applied), computes the difference and applies it, then persists the new
//! current profile.

use std::fs;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context, Result};
use clap::Parser;
use libnsmount::assumptions::Assumptions;
use libnsmount::profile::{MountProfile, ProfileError};
use libnsmount::syscall::linux::LinuxSyscall;
use libnsmount::update::{execute_update, UpdateContext};
use nix::fcntl::{Flock, FlockArg};
use nix::sys::stat::Mode;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(version, about = "Update the mount namespace of a confined application")]
struct Opts {
    /// Name of the application whose mount namespace should be updated.
    app_name: String,

    /// Directory holding desired mount profiles.
    #[arg(long, default_value = "/var/lib/nsmount")]
    profiles_dir: PathBuf,

    /// Directory holding current (applied) mount profiles and lock files.
    #[arg(long, default_value = "/run/nsmount")]
    run_dir: PathBuf,

    /// Additional path prefix where writes are considered safe. May be
    /// repeated.
    #[arg(long = "unrestricted-path")]
    unrestricted_paths: Vec<PathBuf>,

    /// Enable debug logging.
    #[arg(long)]
    debug: bool,

    /// Emit logs as JSON.
    #[arg(long)]
    log_json: bool,
}

struct SystemUpdateContext {
    desired_path: PathBuf,
    current_path: PathBuf,
    unrestricted_paths: Vec<PathBuf>,
}

impl SystemUpdateContext {
    fn new(opts: &Opts) -> SystemUpdateContext {
        let profile_name = format!("{}.fstab", opts.app_name);
        SystemUpdateContext {
            desired_path: opts.profiles_dir.join(&profile_name),
            current_path: opts.run_dir.join(&profile_name),
            unrestricted_paths: opts.unrestricted_paths.clone(),
        }
    }
}

impl UpdateContext for SystemUpdateContext {
    fn assumptions(&self) -> Assumptions {
        let mut assumptions = Assumptions::new();
        assumptions.add_unrestricted_paths(
            [PathBuf::from("/tmp")]
                .into_iter()
                .chain(self.unrestricted_paths.iter().cloned()),
        );
        // Safe-keeping directories of writable mimics are private.
        assumptions.add_mode_hint("/tmp/.snap/*", Mode::from_bits_truncate(0o700));
        assumptions
    }

    fn load_desired_profile(&self) -> Result<MountProfile, ProfileError> {
        MountProfile::read_or_default(&self.desired_path)
    }

    fn load_current_profile(&self) -> Result<MountProfile, ProfileError> {
        MountProfile::read_or_default(&self.current_path)
    }

    fn save_current_profile(&self, profile: &MountProfile) -> Result<(), ProfileError> {
        profile.save(&self.current_path)
    }
}

fn validate_app_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && !name.starts_with('.')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if !valid {
        bail!("invalid application name {:?}", name);
    }
    Ok(())
}

/// Takes the per-application namespace lock. The application's processes
/// are frozen by the caller while this lock is held; dropping the returned
/// guard releases it.
fn acquire_lock(run_dir: &Path, app_name: &str) -> Result<Flock<File>> {
    let path = run_dir.join(format!("{}.lock", app_name));
    let file = OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .open(&path)
        .with_context(|| format!("cannot open lock file {}", path.display()))?;
    Flock::lock(file, FlockArg::LockExclusive)
        .map_err(|(_, errno)| anyhow!("cannot lock {}: {}", path.display(), errno))
}

fn init_logging(opts: &Opts) {
    let default_filter = if opts.debug { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    if opts.log_json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }
}

fn main() -> Result<()> {
    let opts = Opts::parse();
    init_logging(&opts);
    validate_app_name(&opts.app_name)?;

    fs::create_dir_all(&opts.run_dir)
        .with_context(|| format!("cannot create run directory {}", opts.run_dir.display()))?;
    let _lock = acquire_lock(&opts.run_dir, &opts.app_name)?;

    let ctx = SystemUpdateContext::new(&opts);
    let syscall = LinuxSyscall;
    execute_update(&syscall, &ctx).with_context(|| {
        format!(
            "cannot update mount namespace of application {}",
            opts.app_name
        )
    })?;
    tracing::debug!(app = %opts.app_name, "mount namespace updated");
    Ok(())
}
