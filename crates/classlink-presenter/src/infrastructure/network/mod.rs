//! Network infrastructure for the presenter.
//!
//! # Sub-modules
//!
//! - **`session_server`** – accepts participant connections, runs the
//!   registration handshake, answers heartbeats, evicts silent participants,
//!   and exposes `send_to` / `broadcast` to collaborators.
//!
//! - **`presence`** – periodically announces the presenter's name, channel
//!   and session port on the presence multicast group and the broadcast
//!   address, so participants can find it without configuration.

pub mod presence;
pub mod session_server;

pub use session_server::{ServerConfig, ServerError, ServerStats, SessionServer};
