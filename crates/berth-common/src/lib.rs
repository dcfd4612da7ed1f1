//! # berth-common
//!
//! Shared types, error definitions, configuration models, and constants
//! used across the entire berth workspace.
//!
//! This crate is the leaf of the dependency graph — it depends on no other
//! internal crate and provides the vocabulary (container ids, lifecycle
//! statuses, resource limits) that the kernel layer and the runtime share.

pub mod config;
pub mod constants;
pub mod error;
pub mod types;
