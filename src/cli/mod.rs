//! CLI module for keelson.
//!
//! This module provides the command-line interface for planning and
//! applying stacks.

mod commands;
mod output;

pub use commands::{Cli, Commands, OutputFormat, StateCommands};
pub use output::OutputFormatter;
