//! trpc CLI
//!
//! Command-line front end of the trpc test runner: configuration, console
//! reporting, and the per-file run loop.

pub mod config;
pub mod output;
pub mod run;

pub use config::RunnerConfig;
pub use output::ConsoleReporter;
