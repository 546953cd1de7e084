//! Shared helpers for binaries.

pub mod bootstrap;
