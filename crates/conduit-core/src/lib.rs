//! # conduit-core
//!
//! Foundation types shared by every conduit crate:
//!
//! - **Branded IDs**: newtype wrappers so a connection ID can never be passed
//!   where an event ID is expected
//! - **Clock helpers**: millisecond wall-clock timestamps and minute buckets
//! - **Logging**: `tracing` subscriber initialization

#![deny(unsafe_code)]

pub mod clock;
pub mod ids;
pub mod logging;

pub use ids::{ConnectionId, EventId, StreamId, TraceId};
