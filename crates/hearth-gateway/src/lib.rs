/// Real-time gateway: per-connection identity and room state, and the
/// WebSocket loop that feeds it.
pub mod connection;
pub mod session;

pub use session::{ConnectionId, SessionConfig, SessionError, SessionManager};
