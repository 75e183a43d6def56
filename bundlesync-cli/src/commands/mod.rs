//! CLI command implementations.

pub mod common;
pub mod config;
pub mod diff;
pub mod init;
pub mod status;
pub mod update;
