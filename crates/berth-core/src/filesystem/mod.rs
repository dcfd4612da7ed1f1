//! Filesystem management for container isolation.
//!
//! Provides mount propagation changes, bind mounts, pseudo-filesystem
//! mounts, and `pivot_root` for secure root filesystem switching.

pub mod mount;
pub mod pivot_root;

pub use mount::{Propagation, bind_mount, mount_proc, remount_readonly, set_propagation};
pub use pivot_root::pivot_root;
