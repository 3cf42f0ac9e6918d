use std::collections::HashMap;

use serde::Serialize;

use super::device::Device;

/// Last reported state of a single entity.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EntityState {
    /// Platform the entity belongs to ("light", "switch", "cover", "sensor").
    pub platform: String,

    /// Whether the entity is currently reachable.
    pub available: bool,

    /// Platform-specific state as reported by the owning integration.
    pub state: serde_json::Value,
}

/// Centralized snapshot of the entire engine state.
#[derive(Debug, Clone, Default, Serialize)]
pub struct State {
    pub entities: HashMap<String, EntityState>,
    pub devices: HashMap<String, Device>,
}
