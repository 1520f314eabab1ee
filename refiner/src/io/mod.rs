//! Side-effecting collaborators: processes, containers, generators, config.

pub mod config;
pub mod generator;
pub mod process;
pub mod prompt;
pub mod sandbox;
