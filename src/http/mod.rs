//! HTTP/WebSocket server surface
//!
//! - GET /ws/transcribe - per-session duplex channel into the fan-out proxy
//! - GET /health - health check
//! - GET / - liveness message

mod handlers;
mod routes;
mod state;

pub use routes::create_router;
pub use state::AppState;
