//! WebSocket connection state, session lifecycle, heartbeat sweep and the
//! inbound message pipeline.

pub mod connection;
pub mod handler;
pub mod heartbeat;
pub mod session;
