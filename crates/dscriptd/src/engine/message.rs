//! Type-safe message system for dscriptd
//!
//! Messages are split by direction to enforce correct usage at compile time:
//! - `FromIntegrationMessage`: Events from integrations to the engine
//! - `ToIntegrationMessage`: Commands and service calls from the engine to integrations

use super::device::Device;

/// Messages FROM integrations TO the engine (events/state updates)
#[derive(Debug, Clone)]
pub enum FromIntegrationMessage {
    /// An entity was discovered and registered
    EntityDiscovered {
        entity_id: String,
        integration_name: String,
        platform: String,
        device: Option<Device>,
    },

    /// An entity was removed (hardware reconfigured, platform unloaded, etc.)
    EntityRemoved { entity_id: String },

    /// An entity's state or availability changed
    EntityStateChanged {
        entity_id: String,
        available: bool,
        state: serde_json::Value,
    },
}

/// Messages FROM the engine TO integrations (commands)
#[derive(Debug, Clone, PartialEq)]
pub enum ToIntegrationMessage {
    TurnOn { entity_id: String },
    TurnOff { entity_id: String },
    OpenCover { entity_id: String },
    CloseCover { entity_id: String },
    StopCover { entity_id: String },
    SetCoverPosition { entity_id: String, position: u8 },

    /// Poll the given entities now
    UpdateEntities { entity_ids: Vec<String> },

    /// Health-check every board known to the integration
    HeartbeatKnownBoards,
}

impl ToIntegrationMessage {
    /// The entity a command targets, if it targets exactly one.
    pub fn entity_id(&self) -> Option<&str> {
        match self {
            ToIntegrationMessage::TurnOn { entity_id }
            | ToIntegrationMessage::TurnOff { entity_id }
            | ToIntegrationMessage::OpenCover { entity_id }
            | ToIntegrationMessage::CloseCover { entity_id }
            | ToIntegrationMessage::StopCover { entity_id }
            | ToIntegrationMessage::SetCoverPosition { entity_id, .. } => Some(entity_id),
            ToIntegrationMessage::UpdateEntities { .. }
            | ToIntegrationMessage::HeartbeatKnownBoards => None,
        }
    }
}
