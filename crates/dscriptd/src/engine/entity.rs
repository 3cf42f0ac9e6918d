/// Entity abstraction for dscriptd
///
/// All entities (lights, switches, covers, sensors, etc.) implement the Entity trait.
///
/// Base trait that all entities must implement
pub trait Entity: Send + Sync {
    /// Host-facing entity id (e.g. "light.kitchen_light1")
    fn entity_id(&self) -> &str;

    /// Serialize current state to JSON for Engine storage
    fn state_json(&self) -> serde_json::Value;

    /// Return the platform type of this entity (e.g. "cover", "light")
    fn platform(&self) -> &'static str;

    /// Whether the entity can currently be read or controlled
    fn available(&self) -> bool {
        true
    }
}
