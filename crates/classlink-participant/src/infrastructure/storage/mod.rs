//! Persistent participant settings.

pub mod config;
