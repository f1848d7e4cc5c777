//! WebSocket transport: subprotocol negotiation, per-socket sessions,
//! keep-alive, and frame dispatch into the router.

pub mod handler;
pub mod session;

pub use handler::{Flow, SessionHandler};
pub use session::{SessionState, run_ws_session};
