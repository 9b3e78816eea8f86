//! # conduit-store
//!
//! The two external collaborators the gateway depends on, behind narrow
//! interfaces:
//!
//! - **[`shared`]**: the cross-instance broker + KV store ([`SharedStore`]).
//!   Connection records, subscriber sets, trace records, rate counters and
//!   one fan-out channel per event type live here. [`MemoryStore`] is the
//!   in-process implementation.
//! - **[`sqlite`]** / **[`audit`]**: the durable audit store. Event log rows
//!   and subscription records, used for replay and compliance, never on the
//!   hot delivery path.

#![deny(unsafe_code)]

pub mod audit;
pub mod errors;
pub mod keys;
pub mod shared;
pub mod sqlite;

pub use audit::AuditStore;
pub use errors::{Result, StoreError};
pub use shared::{BrokerMessage, BrokerSubscription, MemoryStore, SharedStore};
pub use sqlite::ConnectionConfig;
pub use sqlite::repositories::{EventLogQuery, NewSubscription};
