//! Network infrastructure for the participant.
//!
//! - `discovery` listens for presenter announcements on the presence channel.
//! - `session_client` owns the TCP session with one presenter.

pub mod discovery;
pub mod session_client;

pub use discovery::PresenceListener;
pub use session_client::{ClientConfig, ClientError, ClientState, ClientStats, SessionClient};
