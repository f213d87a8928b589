//! Storage infrastructure: configuration file persistence.
//!
//! The `config` sub-module reads the presenter's TOML file, fills in
//! defaults for anything missing, and converts it into the runtime settings
//! the session server and fan-out sender take.

pub mod config;
