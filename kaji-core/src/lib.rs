//! Kaji core library: team-sync domain types, client configuration, errors.
//!
//! - [`types`]: concurrency token, entity tags, cache regions, revision events
//! - [`config`]: `~/.kaji/config.yaml` load / save / validate
//! - [`error`]: [`ConfigError`]

pub mod config;
pub mod error;
pub mod types;

pub use config::SyncConfig;
pub use error::ConfigError;
pub use types::{CacheRegion, ConcurrencyToken, EntityTag, RevisionEvent};
