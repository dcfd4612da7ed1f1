//! Container lifecycle management for the berth runtime.
//!
//! The supervisor side ([`container::Container`], [`factory::Factory`],
//! [`signal`]) drives a companion process through the handshake in
//! [`sync`]; the companion side lives in [`init`] and is entered through
//! the runtime binary's hidden `init` subcommand.

#![allow(unsafe_code)]
#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod bootstrap;
pub mod collaborators;
pub mod config;
pub mod container;
pub mod error;
pub mod factory;
pub mod gate;
pub mod hooks;
pub mod init;
pub mod lifecycle;
pub mod logs;
pub mod process;
pub mod signal;
pub mod state;
pub mod sync;

#[cfg(test)]
pub(crate) mod testing;
