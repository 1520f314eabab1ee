//! Deterministic, pure logic shared by the refinement loop.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod classifier;
pub mod outcome_parser;
pub mod policy;
pub mod repair;
pub mod reward;
pub mod types;
