//! CLI module for traversal-scheduler - command-line interface and subcommands.

pub mod commands;

pub use commands::Cli;
