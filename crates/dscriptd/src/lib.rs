//! Home automation daemon for Devantech dScript relay boards.
//!
//! The [`engine`] owns entity state and routes commands to integrations, the
//! [`api`] exposes both over HTTP. The dScript integration needs a protocol
//! backend linked in; see [`integrations::dscript`].

pub mod api;
pub mod config;
pub mod engine;
pub mod integrations;

pub use config::Config;
pub use config::ConfigError;
pub use config::LogLevel;
pub use engine::Engine;
pub use engine::State;
