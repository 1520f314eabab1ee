//! Test-driven candidate refinement.
//!
//! Given a candidate Python implementation and a fixed pytest oracle, the
//! crate runs the oracle in a disposable container, turns the output into a
//! structured outcome, classifies failures, scores the candidate and decides
//! whether to ask a generator for another attempt. The architecture enforces
//! a strict separation:
//!
//! - **[`core`]**: Pure, deterministic logic (parsing, classification, reward,
//!   stop policy, code normalization). No I/O, fully testable in isolation.
//! - **[`io`]**: Side-effecting operations (process execution, the Docker
//!   sandbox, generator backends, config files).
//!
//! [`refine`] wires both together behind injected collaborators;
//! [`analysis`] provides the tree-sitter based static metrics.

pub mod analysis;
pub mod cancel;
pub mod core;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod refine;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
