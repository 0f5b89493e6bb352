//! Core library for updating the mount namespace of a confined application.
//!
//! Given two fstab-style mount profiles, the *current* one (a log of mounts
//! applied by prior runs) and the *desired* one (what the application now
//! needs), this library computes a minimal, correctly ordered sequence of
//! mount changes and executes it against the kernel, while defending against
//! symlink races and writes that would escape into the host filesystem.
//!
//! The caller is expected to have entered the target mount namespace and to
//! have frozen the application before the update runs.

pub mod assumptions;
pub mod change;
pub mod create;
pub mod entry;
pub mod mimic;
pub mod path;
pub mod plan;
pub mod profile;
pub mod syscall;
pub mod update;
