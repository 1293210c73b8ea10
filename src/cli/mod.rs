//! Command-line interface
//!
//! One-shot subcommands parsed with clap, and the line commands of the
//! `startnode` console.

pub mod commands;

pub use commands::{Command, ConsoleCommand, Opt};
