//! Local workflow orchestrator for software-development tasks.
//!
//! An action is a declarative list of steps (builtin, script, or shell),
//! optionally wrapped in an isolated git worktree and a tmux session. The
//! crate keeps a strict separation:
//!
//! - **[`core`]**: Pure, deterministic logic (definitions, context, strategy
//!   selection, argument and environment handling). No I/O.
//! - **[`io`]**: Side-effecting adapters (processes, git, tmux, TOML
//!   definitions, event log, artifacts).
//!
//! Orchestration modules ([`engine`], [`resources`], [`step_exec`],
//! [`builtins`]) combine the two into the lifecycle controller exposed as
//! [`engine::Engine::execute`].

pub mod builtins;
pub mod core;
pub mod engine;
pub mod error;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod resources;
pub mod step_exec;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
