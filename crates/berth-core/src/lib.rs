//! # berth-core
//!
//! Low-level Linux isolation primitives for the berth runtime.
//!
//! This crate provides safe abstractions over:
//! - **Namespaces**: the namespace-type to clone-flag table, `unshare(2)`,
//!   `setns(2)`, uid/gid mappings, and time-namespace offsets.
//! - **Cgroups v2**: the [`cgroup::CgroupHandle`] contract and its default
//!   unified-hierarchy implementation.
//! - **Processes**: `/proc/<pid>/stat` probes used for PID-reuse-safe
//!   liveness checks, and `CLONE_PARENT` forking.
//! - **Descriptors and images**: close-on-exec hygiene and the sealed
//!   in-memory copy of the runtime executable.
//! - **Filesystem and capabilities**: `pivot_root`, propagation changes,
//!   and bounding-set capability drops.
//!
//! All unsafe system calls are encapsulated in safe wrappers with
//! proper error handling and `// SAFETY:` documentation.

#![allow(unsafe_code)]
#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

#[cfg(not(target_os = "linux"))]
compile_error!("berth-core only supports Linux");

pub mod capability;
pub mod cgroup;
pub mod exe;
pub mod fd;
pub mod filesystem;
pub mod fork;
pub mod namespace;
pub mod proc;
