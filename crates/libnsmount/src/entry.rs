//! In-memory representation of one mount profile entry and the private
//! option namespace layered on top of the classic fstab option syntax.
//!
//! Options prefixed with `x-snapd.` are never passed to the kernel; they
//! carry the entry kind, its provenance and bookkeeping used by the diff
//! planner.

use std::fmt;
use std::path::PathBuf;

use nix::mount::MsFlags;

/// Reserved prefix of options that are interpreted by the updater and
/// stripped before anything reaches the kernel.
pub const OPTION_PREFIX: &str = "x-snapd.";

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum EntryError {
    #[error("expected six fields, found {found}")]
    WrongFieldCount { found: usize },
    #[error("cannot parse dump frequency {0:?}")]
    InvalidFreq(String),
    #[error("cannot parse check pass number {0:?}")]
    InvalidPassno(String),
    #[error("cannot parse octal mode in option {0:?}")]
    InvalidMode(String),
    #[error("cannot parse user id in option {0:?}")]
    InvalidUid(String),
    #[error("cannot parse group id in option {0:?}")]
    InvalidGid(String),
    #[error("symlink entry for {0:?} has no x-snapd.symlink option")]
    MissingSymlinkTarget(PathBuf),
    #[error("ensure-dir entry for {0:?} has no x-snapd.must-exist-dir option")]
    MissingMustExistDir(PathBuf),
}

/// What an entry asks the executor to do at its target, derived from the
/// `x-snapd.kind` option.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryKind {
    /// A mount over a directory, the default.
    Directory,
    /// A bind mount whose source and target are regular files.
    File,
    /// No mount at all, a symbolic link is created at the target.
    Symlink { target: PathBuf },
    /// Create a missing directory under an existing user-controlled root
    /// and do nothing else.
    EnsureDir { must_exist: PathBuf },
}

/// Where an entry comes from; governs the driver's error policy and the
/// planner's ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryOrigin {
    Unspecified,
    /// Declared filesystem layout of the application; failures are fatal.
    Layout,
    /// Remaps the application's own root into a parallel instance location;
    /// must be mounted before anything inside it.
    Overname,
    /// Set up by the sandbox initialiser; never disturbed.
    Rootfs,
}

impl EntryOrigin {
    fn from_option(value: Option<&str>) -> EntryOrigin {
        match value {
            Some("layout") => EntryOrigin::Layout,
            Some("overname") => EntryOrigin::Overname,
            Some("rootfs") => EntryOrigin::Rootfs,
            _ => EntryOrigin::Unspecified,
        }
    }
}

/// One line of a mount profile.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MountEntry {
    /// What is being mounted: a device, a source path, `tmpfs` or `none`.
    pub source: String,
    /// Absolute, clean path where the mount appears.
    pub target: PathBuf,
    /// Filesystem type; empty or `none` for bind mounts.
    pub fs_type: String,
    pub options: Vec<String>,
    /// Legacy dump frequency, carried for round-trip fidelity.
    pub freq: u32,
    /// Legacy fsck pass number, carried for round-trip fidelity.
    pub passno: u32,
}

impl MountEntry {
    /// Parses one fstab line. The caller is expected to have dropped
    /// comments and blank lines.
    pub fn parse(line: &str) -> Result<MountEntry, EntryError> {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() != 6 {
            return Err(EntryError::WrongFieldCount {
                found: fields.len(),
            });
        }
        let options = if fields[3] == "defaults" {
            Vec::new()
        } else {
            fields[3].split(',').map(unescape).collect()
        };
        Ok(MountEntry {
            source: unescape(fields[0]),
            target: PathBuf::from(unescape(fields[1])),
            fs_type: unescape(fields[2]),
            options,
            freq: fields[4]
                .parse()
                .map_err(|_| EntryError::InvalidFreq(fields[4].to_string()))?,
            passno: fields[5]
                .parse()
                .map_err(|_| EntryError::InvalidPassno(fields[5].to_string()))?,
        })
    }

    fn opt_value(&self, name: &str) -> Option<&str> {
        self.options
            .iter()
            .find_map(|o| o.strip_prefix(name).and_then(|rest| rest.strip_prefix('=')))
    }

    fn has_opt(&self, name: &str) -> bool {
        self.options.iter().any(|o| o == name)
    }

    pub fn kind(&self) -> EntryKind {
        match self.opt_value("x-snapd.kind") {
            Some("file") => EntryKind::File,
            Some("symlink") => EntryKind::Symlink {
                target: PathBuf::from(self.opt_value("x-snapd.symlink").unwrap_or("")),
            },
            Some("ensure-dir") => EntryKind::EnsureDir {
                must_exist: PathBuf::from(self.opt_value("x-snapd.must-exist-dir").unwrap_or("")),
            },
            _ => EntryKind::Directory,
        }
    }

    pub fn origin(&self) -> EntryOrigin {
        EntryOrigin::from_option(self.opt_value("x-snapd.origin"))
    }

    /// True for entries generated by a writable mimic.
    pub fn is_synthetic(&self) -> bool {
        self.has_opt("x-snapd.synthetic")
    }

    /// Identifier of the entry a synthetic entry exists for.
    pub fn needed_by(&self) -> Option<&str> {
        self.opt_value("x-snapd.needed-by")
    }

    /// Stable identifier of this entry; defaults to the target path.
    pub fn id(&self) -> String {
        match self.opt_value("x-snapd.id") {
            Some(id) => id.to_string(),
            None => self.target.to_string_lossy().into_owned(),
        }
    }

    /// True when the entry should be unmounted with `MNT_DETACH`.
    pub fn is_detach(&self) -> bool {
        self.has_opt("x-snapd.detach")
    }

    /// True when a missing source or target should be skipped with a
    /// sentinel error rather than reported.
    pub fn ignore_missing(&self) -> bool {
        self.has_opt("x-snapd.ignore-missing")
    }

    /// Explicit mode for an auto-created mount point, if any.
    pub fn mode(&self) -> Result<Option<u32>, EntryError> {
        match self.opt_value("x-snapd.mode") {
            Some(value) => u32::from_str_radix(value, 8)
                .map(Some)
                .map_err(|_| EntryError::InvalidMode(value.to_string())),
            None => Ok(None),
        }
    }

    /// Owner of an auto-created mount point; defaults to root.
    pub fn uid(&self) -> Result<u32, EntryError> {
        match self.opt_value("x-snapd.uid") {
            Some(value) => value
                .parse()
                .map_err(|_| EntryError::InvalidUid(value.to_string())),
            None => Ok(0),
        }
    }

    /// Group of an auto-created mount point; defaults to root.
    pub fn gid(&self) -> Result<u32, EntryError> {
        match self.opt_value("x-snapd.gid") {
            Some(value) => value
                .parse()
                .map_err(|_| EntryError::InvalidGid(value.to_string())),
            None => Ok(0),
        }
    }

    pub fn is_bind(&self) -> bool {
        self.has_opt("bind") || self.has_opt("rbind")
    }

    pub fn is_recursive_bind(&self) -> bool {
        self.has_opt("rbind")
    }

    pub fn is_tmpfs(&self) -> bool {
        self.fs_type == "tmpfs"
    }

    /// Translates the kernel-recognised options into mount flags and the
    /// leftover data string. Propagation options and `x-snapd.*` options are
    /// excluded; propagation is always applied with a separate mount call.
    pub fn mount_flags(&self) -> (MsFlags, String) {
        let mut flags = MsFlags::empty();
        let mut data: Vec<&str> = Vec::new();
        for option in &self.options {
            if option.starts_with(OPTION_PREFIX) || propagation_flag(option).is_some() {
                continue;
            }
            match flag_for_option(option) {
                Some((true, flag)) => flags &= !flag,
                Some((false, flag)) => flags |= flag,
                None => data.push(option),
            }
        }
        (flags, data.join(","))
    }

    /// The propagation change requested by this entry, if any.
    pub fn propagation_flags(&self) -> Option<MsFlags> {
        let mut flags = MsFlags::empty();
        for option in &self.options {
            if let Some(flag) = propagation_flag(option) {
                flags |= flag;
            }
        }
        if flags.is_empty() {
            None
        } else {
            Some(flags)
        }
    }
}

impl fmt::Display for MountEntry {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let target = self.target.to_string_lossy();
        let options = if self.options.is_empty() {
            "defaults".to_string()
        } else {
            self.options
                .iter()
                .map(|o| escape(o))
                .collect::<Vec<String>>()
                .join(",")
        };
        write!(
            f,
            "{} {} {} {} {} {}",
            escape(or_none(&self.source)),
            escape(or_none(&target)),
            escape(or_none(&self.fs_type)),
            options,
            self.freq,
            self.passno
        )
    }
}

fn or_none(field: &str) -> &str {
    if field.is_empty() {
        "none"
    } else {
        field
    }
}

/// The fixed table of kernel mount options. The boolean says whether the
/// option clears the flag rather than setting it.
fn flag_for_option(option: &str) -> Option<(bool, MsFlags)> {
    match option {
        "defaults" => Some((false, MsFlags::empty())),
        "ro" => Some((false, MsFlags::MS_RDONLY)),
        "rw" => Some((true, MsFlags::MS_RDONLY)),
        "suid" => Some((true, MsFlags::MS_NOSUID)),
        "nosuid" => Some((false, MsFlags::MS_NOSUID)),
        "dev" => Some((true, MsFlags::MS_NODEV)),
        "nodev" => Some((false, MsFlags::MS_NODEV)),
        "exec" => Some((true, MsFlags::MS_NOEXEC)),
        "noexec" => Some((false, MsFlags::MS_NOEXEC)),
        "sync" => Some((false, MsFlags::MS_SYNCHRONOUS)),
        "async" => Some((true, MsFlags::MS_SYNCHRONOUS)),
        "dirsync" => Some((false, MsFlags::MS_DIRSYNC)),
        "remount" => Some((false, MsFlags::MS_REMOUNT)),
        "mand" => Some((false, MsFlags::MS_MANDLOCK)),
        "nomand" => Some((true, MsFlags::MS_MANDLOCK)),
        "atime" => Some((true, MsFlags::MS_NOATIME)),
        "noatime" => Some((false, MsFlags::MS_NOATIME)),
        "diratime" => Some((true, MsFlags::MS_NODIRATIME)),
        "nodiratime" => Some((false, MsFlags::MS_NODIRATIME)),
        "bind" => Some((false, MsFlags::MS_BIND)),
        "rbind" => Some((false, MsFlags::MS_BIND | MsFlags::MS_REC)),
        "move" => Some((false, MsFlags::MS_MOVE)),
        "silent" => Some((false, MsFlags::MS_SILENT)),
        "acl" => Some((false, MsFlags::MS_POSIXACL)),
        "relatime" => Some((false, MsFlags::MS_RELATIME)),
        "norelatime" => Some((true, MsFlags::MS_RELATIME)),
        "strictatime" => Some((false, MsFlags::MS_STRICTATIME)),
        "nostrictatime" => Some((true, MsFlags::MS_STRICTATIME)),
        _ => None,
    }
}

fn propagation_flag(option: &str) -> Option<MsFlags> {
    match option {
        "shared" => Some(MsFlags::MS_SHARED),
        "rshared" => Some(MsFlags::MS_SHARED | MsFlags::MS_REC),
        "slave" => Some(MsFlags::MS_SLAVE),
        "rslave" => Some(MsFlags::MS_SLAVE | MsFlags::MS_REC),
        "private" => Some(MsFlags::MS_PRIVATE),
        "rprivate" => Some(MsFlags::MS_PRIVATE | MsFlags::MS_REC),
        "unbindable" => Some(MsFlags::MS_UNBINDABLE),
        "runbindable" => Some(MsFlags::MS_UNBINDABLE | MsFlags::MS_REC),
        _ => None,
    }
}

/// Escapes whitespace and backslashes with the octal codes fstab uses.
pub(crate) fn escape(field: &str) -> String {
    let mut out = String::with_capacity(field.len());
    for c in field.chars() {
        match c {
            ' ' => out.push_str("\\040"),
            '\t' => out.push_str("\\011"),
            '\n' => out.push_str("\\012"),
            '\\' => out.push_str("\\134"),
            c => out.push(c),
        }
    }
    out
}

/// Reverses [`escape`]; any `\ooo` sequence is decoded.
pub(crate) fn unescape(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out: Vec<u8> = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\'
            && i + 3 < bytes.len()
            && bytes[i + 1..i + 4].iter().all(|b| (b'0'..=b'7').contains(b))
        {
            let value = (u32::from(bytes[i + 1] - b'0') << 6)
                | (u32::from(bytes[i + 2] - b'0') << 3)
                | u32::from(bytes[i + 3] - b'0');
            out.push(value as u8);
            i += 4;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}
