//! Deterministic, pure logic shared by the execution engine.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod arguments;
pub mod classifier;
pub mod context;
pub mod definition;
pub mod env;
pub mod lifecycle;
pub mod tokenize;
pub mod types;
