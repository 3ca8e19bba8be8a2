//! Storage infrastructure: configuration file loading.
//!
//! The `config` sub-module reads the TOML file named on the command line and
//! falls back to defaults when it does not exist.  The registry itself is
//! held in memory only.

pub mod config;
