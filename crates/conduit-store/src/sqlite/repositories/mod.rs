//! Stateless repositories. Every method takes a `&Connection`, so each
//! operation is a plain function of (connection, input) and is testable
//! against a bare in-memory database.

pub mod event_log;
pub mod subscription;

pub use event_log::{EventLogQuery, EventLogRepo};
pub use subscription::{NewSubscription, SubscriptionRepo};
