//! Devantech dScript board integration.
//!
//! Boards are discovered by heartbeat or configuration, identified by MAC and
//! exposed as light, switch, cover and sensor entities. Pushed events arrive
//! through a built-in event server and are dispatched per integration instance.
//!
//! # Protocol backends
//!
//! This crate does not speak the dScript wire protocols itself. A backend
//! crate registers a [`protocol::ProtocolBackend`] in
//! [`protocol::PROTOCOL_BACKENDS`] and gets linked into the binary:
//!
//! ```ignore
//! #[linkme::distributed_slice(dscriptd::integrations::dscript::protocol::PROTOCOL_BACKENDS)]
//! static BACKEND: ProtocolBackend = ProtocolBackend {
//!     name: "dscript-net",
//!     connector: net::connector,
//!     server: net::event_server,
//! };
//! ```
//!
//! Without a linked backend no dScript instance is started; configured
//! entries are skipped with an error at startup.

mod board;
mod boards;
mod cache;
pub mod channel;
mod config;
mod context;
mod dispatch;
mod entities;
mod entity;
mod error;
mod integration;
mod mac;
mod platform;
mod probe;
pub mod protocol;
mod reconcile;
mod server;

pub use config::DscriptConfig;
pub use config::Protocol;
pub use error::Error;
pub use integration::DscriptIntegration;
use linkme::distributed_slice;
use tracing::error;
use tracing::info;

use crate::engine;

pub const DOMAIN: &str = "dscriptmodule";
pub const MANUFACTURER: &str = "Devantech";

#[distributed_slice(engine::INTEGRATION_REGISTRY)]
fn init_dscript(ctx: &engine::IntegrationContext) -> engine::IntegrationFactoryResult {
    let entries = &ctx.config.integrations.dscript;
    if entries.is_empty() {
        return Ok(Vec::new());
    }

    let Some(backend) = protocol::default_backend() else {
        error!(
            "No dScript protocol backend linked, skipping {} configured entries",
            entries.len()
        );
        return Ok(Vec::new());
    };

    let mut integrations: Vec<Box<dyn engine::Integration>> = Vec::new();
    for (entry_id, config) in entries {
        if !config.enabled {
            info!("[{}] Integration is disabled, skipping", entry_id);
            continue;
        }
        info!("[{}] Using protocol backend {}", entry_id, backend.name);
        let settings = protocol::ServerSettings {
            listen_ip: config.listen_ip,
            port: config.port,
            protocol: config.protocol,
        };
        integrations.push(Box::new(DscriptIntegration::new(
            entry_id.clone(),
            config.clone(),
            (backend.connector)(),
            (backend.server)(&settings),
        )));
    }
    Ok(integrations)
}
