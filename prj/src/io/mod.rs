//! I/O adapters used by the execution engine.

pub mod artifacts;
pub mod config;
pub mod definitions;
pub mod events;
pub mod git;
pub mod process;
pub mod session;
pub mod steps;
pub mod workspace;
