//! # conduit-settings
//!
//! Configuration management with layered sources for the conduit gateway.
//!
//! Settings are loaded from three layers (in priority order):
//! 1. **Compiled defaults**: [`ConduitSettings::default()`]
//! 2. **Settings file**: `~/.conduit/settings.json` (deep-merged over defaults)
//! 3. **Environment variables**: `CONDUIT_*` overrides (highest priority)
//!
//! Command-line flags in the gateway binary are applied on top of the result.

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{deep_merge, load_settings, load_settings_from_path, settings_path};
pub use types::*;
