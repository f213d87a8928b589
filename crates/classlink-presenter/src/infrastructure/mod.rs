//! Infrastructure layer for the presenter.
//!
//! Contains the OS-facing adapters: the session server and presence
//! announcer sockets, and the TOML configuration file.
//!
//! **Dependency rule**: this layer may depend on `application` and
//! `classlink_core`, but is never imported by the `application` layer.

pub mod network;
pub mod storage;
