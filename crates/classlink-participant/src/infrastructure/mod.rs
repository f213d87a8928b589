//! Infrastructure layer for the participant: sockets and config files.
//!
//! May depend on `application` and `classlink_core`; the application layer
//! never imports from here.

pub mod network;
pub mod storage;
