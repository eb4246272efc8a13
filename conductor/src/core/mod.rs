//! Deterministic, pure logic shared by the orchestrator.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod command;
pub mod cooldown;
pub mod decision;
pub mod message;
pub mod selector;
pub mod transitions;
pub mod types;
