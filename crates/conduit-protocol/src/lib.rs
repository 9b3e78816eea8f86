//! # conduit-protocol
//!
//! Everything that defines what travels over a gateway connection:
//!
//! - [`envelope`]: the JSON frame wrapping every message
//! - [`message_type`]: the closed catalogue of message types and their direction
//! - [`schema`]: per-type payload contracts and security requirements
//! - [`validation`]: the [`SchemaRegistry`](validation::SchemaRegistry) pipeline
//!   (ids, size, sanitization, structure)
//! - [`messages`]: typed payloads and the [`ClientMessage`](messages::ClientMessage) sum type
//! - [`policy`]: role tiers, capabilities, security levels and rate budgets
//! - [`targeting`]: event publication and addressing types
//! - [`signing`]: optional HMAC envelope signatures
//! - [`errors`]: client-facing error codes and payloads
//!
//! Nothing in this crate performs I/O.

#![deny(unsafe_code)]

pub mod constants;
pub mod envelope;
pub mod errors;
pub mod message_type;
pub mod messages;
pub mod policy;
pub mod sanitize;
pub mod schema;
pub mod signing;
pub mod targeting;
pub mod validation;

pub use envelope::Envelope;
pub use errors::{ErrorCategory, ErrorPayload, FieldError, ValidationError};
pub use message_type::{Direction, MessageType};
pub use messages::ClientMessage;
pub use policy::{Capability, RateKind, Role, RolePolicy, SecurityLevel};
pub use schema::{FieldKind, MessageSchema, SchemaDescription};
pub use targeting::{EventPublication, Priority, PublishOptions, TargetType, Targeting};
pub use validation::{SchemaRegistry, ValidatedEnvelope};
