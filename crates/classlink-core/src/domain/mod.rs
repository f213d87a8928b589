//! Domain entities shared by the presenter and participant roles.
//!
//! Nothing in here touches sockets or the runtime; these are the plain data
//! types both ends agree on.

/// Participant identity and status tags.
pub mod participant;
