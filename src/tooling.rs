//! Tooling & Integration Layer
//!
//! Command-line entry points for creating agents and exercising a small
//! in-process network.

pub mod cli;

pub use cli::{Cli, CliContext, Commands};
