use std::collections::BTreeMap;
use std::collections::HashMap;
use std::error::Error;
use std::sync::Arc;

use arc_swap::ArcSwap;
use tokio::sync::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use super::integration::FromIntegrationReceiver;
use super::integration::FromIntegrationSender;
use super::integration::Integration;
use super::integration::ToIntegrationSender;
use super::message::FromIntegrationMessage;
use super::message::ToIntegrationMessage;
use super::state::EntityState;
use super::state::State;
use crate::engine::IntegrationContext;

/// dscriptd engine
///
/// This structure handles the flow of events, sending commands to the correct integration,
/// and maintaining a view of the world with State.
pub struct Engine {
    /// Centralized state snapshot (readers load the Arc, writer stores a new one)
    state: ArcSwap<State>,

    /// Map of entity_id -> integration name for routing messages
    entity_integration_map: std::sync::Mutex<HashMap<String, String>>,

    /// Communication channels to integrations (for commands)
    integration_channels: std::sync::Mutex<HashMap<String, ToIntegrationSender>>,

    /// Receive messages from integrations (events)
    message_rx: Mutex<FromIntegrationReceiver>,

    /// Sender for integrations to report events back to the engine
    message_tx: FromIntegrationSender,

    /// Handles for integration tasks
    integration_handles: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

/// Capacity for the integration→engine message channel
/// Provides backpressure when integrations send faster than the engine can process
const FROM_INTEGRATION_CHANNEL_SIZE: usize = 1024;

fn routing_error(kind: std::io::ErrorKind, msg: String) -> Box<dyn Error + Send> {
    Box::new(std::io::Error::new(kind, msg))
}

impl Engine {
    /// Create a new Engine instance
    pub fn new() -> Self {
        let (message_tx, message_rx) = mpsc::channel(FROM_INTEGRATION_CHANNEL_SIZE);
        Self {
            state: ArcSwap::new(Arc::default()),
            entity_integration_map: std::sync::Mutex::new(HashMap::new()),
            integration_channels: std::sync::Mutex::new(HashMap::new()),
            message_rx: Mutex::new(message_rx),
            message_tx,
            integration_handles: std::sync::Mutex::new(Vec::new()),
        }
    }

    /// Register integrations from configuration
    ///
    /// Runs every linked integration factory against the config and registers
    /// all instances they produce.
    pub fn register_integrations_from_config(&self, cfg: &crate::config::Config) {
        let ctx = IntegrationContext { config: cfg };
        for constr in super::integration::REGISTRY {
            let integrations = match constr(&ctx) {
                Ok(i) => i,
                Err(e) => {
                    error!("failed to setup integration: {:#}", e);
                    continue;
                }
            };
            for integration in integrations {
                let name = integration.name().to_string();
                self.register_integration(name, integration);
            }
        }
    }

    /// Register an integration with the engine
    ///
    /// This spawns the integration in a background task, wires up channels,
    /// and starts its setup process.
    pub fn register_integration(&self, name: String, mut integration: Box<dyn Integration>) {
        let (to_integration_tx, mut to_integration_rx) = mpsc::unbounded_channel();
        let from_integration_tx = self.message_tx.clone();

        if let Ok(mut channels) = self.integration_channels.lock() {
            channels.insert(name.clone(), to_integration_tx);
        }

        // Spawn integration task
        let handle = tokio::spawn(async move {
            // Setup integration (gives it the sender for events)
            if let Err(e) = integration.setup(from_integration_tx).await {
                warn!("Integration '{}' setup failed: {}", name, e);
                return;
            }

            // Process commands from engine
            while let Some(msg) = to_integration_rx.recv().await {
                if let Err(e) = integration.handle_message(msg).await {
                    warn!("Integration '{}' failed to handle message: {}", name, e);
                }
            }

            if let Err(e) = integration.shutdown().await {
                warn!("Integration '{}' shutdown failed: {}", name, e);
            }
        });

        if let Ok(mut handles) = self.integration_handles.lock() {
            handles.push(handle);
        }
    }

    fn send_to_integration(
        &self,
        integration_name: &str,
        msg: ToIntegrationMessage,
    ) -> Result<(), Box<dyn Error + Send>> {
        let channels = self
            .integration_channels
            .lock()
            .map_err(|e| routing_error(std::io::ErrorKind::Other, e.to_string()))?;

        let tx = channels.get(integration_name).ok_or_else(|| {
            routing_error(
                std::io::ErrorKind::NotFound,
                format!("Integration channel not found: {}", integration_name),
            )
        })?;

        tx.send(msg)
            .map_err(|e| -> Box<dyn Error + Send> { Box::new(e) })
    }

    fn integration_for_entity(&self, entity_id: &str) -> Option<String> {
        self.entity_integration_map
            .lock()
            .ok()
            .and_then(|map| map.get(entity_id).cloned())
    }

    /// Send a command to an integration
    ///
    /// Routes the command to the appropriate integration based on entity_id.
    pub fn send_command(&self, msg: ToIntegrationMessage) -> Result<(), Box<dyn Error + Send>> {
        let entity_id = msg.entity_id().map(str::to_string).ok_or_else(|| {
            routing_error(
                std::io::ErrorKind::InvalidInput,
                format!("Command does not target a single entity: {:?}", msg),
            )
        })?;

        // Route to the integration that owns this entity
        let integration_name = self.integration_for_entity(&entity_id).ok_or_else(|| {
            routing_error(
                std::io::ErrorKind::NotFound,
                format!("No integration found for entity: {}", entity_id),
            )
        })?;

        self.send_to_integration(&integration_name, msg)
    }

    /// Ask the owning integrations to poll the given entities now.
    ///
    /// Entities unknown to the engine are logged and skipped; the rest are still
    /// processed. Returns the ids that could not be routed.
    pub fn update_entities(&self, entity_ids: Vec<String>) -> Vec<String> {
        let mut by_integration: BTreeMap<String, Vec<String>> = BTreeMap::new();
        let mut unknown = Vec::new();

        for entity_id in entity_ids {
            match self.integration_for_entity(&entity_id) {
                Some(name) => by_integration.entry(name).or_default().push(entity_id),
                None => {
                    warn!("update_entities: unable to find entity: {}", entity_id);
                    unknown.push(entity_id);
                }
            }
        }

        for (name, entity_ids) in by_integration {
            if let Err(e) =
                self.send_to_integration(&name, ToIntegrationMessage::UpdateEntities { entity_ids })
            {
                warn!("update_entities: failed to reach integration '{}': {}", name, e);
            }
        }

        unknown
    }

    /// Ask an integration instance to health-check all of its known boards.
    pub fn heartbeat_known_boards(
        &self,
        integration_name: &str,
    ) -> Result<(), Box<dyn Error + Send>> {
        self.send_to_integration(integration_name, ToIntegrationMessage::HeartbeatKnownBoards)
    }

    /// Run the engine's main event loop
    ///
    /// Processes incoming events from integrations and updates state.
    pub async fn run(&self) -> Result<(), Box<dyn Error + Send>> {
        info!("Engine starting");

        // Main event loop - only receives FromIntegration messages
        let mut rx = self.message_rx.lock().await;
        while let Some(msg) = rx.recv().await {
            if let Err(e) = self.handle_event(msg).await {
                warn!("Error handling event: {}", e);
            }
        }

        info!("Engine shutting down");
        Ok(())
    }

    /// Close all integration channels and wait for the integrations to shut down.
    pub async fn shutdown(&self) {
        if let Ok(mut channels) = self.integration_channels.lock() {
            channels.clear();
        }

        let handles = match self.integration_handles.lock() {
            Ok(mut handles) => std::mem::take(&mut *handles),
            Err(_) => Vec::new(),
        };
        for handle in handles {
            if let Err(e) = handle.await {
                warn!("Integration task ended abnormally: {}", e);
            }
        }
    }

    /// Get a snapshot of the current engine state.
    ///
    /// Clones the `Arc` (atomic refcount bump), essentially free.
    pub fn state_snapshot(&self) -> Arc<State> {
        self.state.load_full()
    }

    /// Handle an event from an integration
    async fn handle_event(&self, msg: FromIntegrationMessage) -> Result<(), Box<dyn Error + Send>> {
        match msg {
            FromIntegrationMessage::EntityDiscovered {
                entity_id,
                integration_name,
                platform,
                device,
            } => {
                info!(
                    "Entity discovered: {} ({}, from {})",
                    entity_id, platform, integration_name
                );

                // Record which integration owns this entity for command routing.
                // State is not populated until the first state-change message arrives.
                if let Ok(mut map) = self.entity_integration_map.lock() {
                    map.insert(entity_id.clone(), integration_name);
                }

                if let Some(device) = device {
                    let mut state = State::clone(&self.state.load());
                    state
                        .devices
                        .entry(device.id.clone())
                        .or_insert(device)
                        .add_entity(entity_id);
                    self.state.store(Arc::new(state));
                }
            }
            FromIntegrationMessage::EntityRemoved { entity_id } => {
                info!("Entity removed: {}", entity_id);

                {
                    let mut state = State::clone(&self.state.load());
                    state.entities.remove(&entity_id);
                    for device in state.devices.values_mut() {
                        device.remove_entity(&entity_id);
                    }
                    self.state.store(Arc::new(state));
                }

                // Remove from routing map
                if let Ok(mut map) = self.entity_integration_map.lock() {
                    map.remove(&entity_id);
                }
            }
            FromIntegrationMessage::EntityStateChanged {
                entity_id,
                available,
                state: entity_state,
            } => {
                let platform = entity_id
                    .split_once('.')
                    .map(|(platform, _)| platform.to_string())
                    .unwrap_or_default();
                debug!(
                    "Entity state changed: {} -> available={}, state={}",
                    entity_id, available, entity_state
                );

                let mut state = State::clone(&self.state.load());
                state.entities.insert(
                    entity_id,
                    EntityState {
                        platform,
                        available,
                        state: entity_state,
                    },
                );
                self.state.store(Arc::new(state));
            }
        }
        Ok(())
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::Device;

    struct RecordingIntegration {
        name: String,
        seen: Arc<std::sync::Mutex<Vec<ToIntegrationMessage>>>,
    }

    #[async_trait::async_trait]
    impl Integration for RecordingIntegration {
        fn name(&self) -> &str {
            &self.name
        }

        async fn setup(&mut self, _tx: FromIntegrationSender) -> Result<(), Box<dyn Error + Send>> {
            Ok(())
        }

        async fn handle_message(
            &mut self,
            msg: ToIntegrationMessage,
        ) -> Result<(), Box<dyn Error + Send>> {
            self.seen.lock().unwrap().push(msg);
            Ok(())
        }

        async fn shutdown(&mut self) -> Result<(), Box<dyn Error + Send>> {
            Ok(())
        }
    }

    fn discovered(entity_id: &str, integration_name: &str) -> FromIntegrationMessage {
        FromIntegrationMessage::EntityDiscovered {
            entity_id: entity_id.to_string(),
            integration_name: integration_name.to_string(),
            platform: "light".to_string(),
            device: Some(Device::new("dev1".to_string(), "Board".to_string())),
        }
    }

    #[tokio::test]
    async fn test_state_changes_are_recorded() {
        let engine = Engine::new();
        engine
            .handle_event(discovered("light.board_light1", "office"))
            .await
            .unwrap();
        engine
            .handle_event(FromIntegrationMessage::EntityStateChanged {
                entity_id: "light.board_light1".to_string(),
                available: true,
                state: serde_json::json!({"on": true}),
            })
            .await
            .unwrap();

        let snapshot = engine.state_snapshot();
        let light = snapshot.entities.get("light.board_light1").unwrap();
        assert_eq!(light.platform, "light");
        assert!(light.available);
        assert_eq!(light.state["on"], true);
        assert_eq!(
            snapshot.devices.get("dev1").unwrap().entity_ids,
            vec!["light.board_light1"]
        );
    }

    #[tokio::test]
    async fn test_entity_removed_clears_state_and_routing() {
        let engine = Engine::new();
        engine
            .handle_event(discovered("light.board_light1", "office"))
            .await
            .unwrap();
        engine
            .handle_event(FromIntegrationMessage::EntityRemoved {
                entity_id: "light.board_light1".to_string(),
            })
            .await
            .unwrap();

        assert!(engine.state_snapshot().entities.is_empty());
        assert!(engine
            .send_command(ToIntegrationMessage::TurnOn {
                entity_id: "light.board_light1".to_string(),
            })
            .is_err());
    }

    #[tokio::test]
    async fn test_commands_route_to_owning_integration() {
        let engine = Engine::new();
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        engine.register_integration(
            "office".to_string(),
            Box::new(RecordingIntegration {
                name: "office".to_string(),
                seen: seen.clone(),
            }),
        );
        engine
            .handle_event(discovered("light.board_light1", "office"))
            .await
            .unwrap();

        engine
            .send_command(ToIntegrationMessage::TurnOn {
                entity_id: "light.board_light1".to_string(),
            })
            .unwrap();
        let unknown = engine.update_entities(vec![
            "light.board_light1".to_string(),
            "light.missing".to_string(),
        ]);
        assert_eq!(unknown, vec!["light.missing"]);
        engine.heartbeat_known_boards("office").unwrap();
        assert!(engine.heartbeat_known_boards("elsewhere").is_err());

        engine.shutdown().await;

        let seen = seen.lock().unwrap();
        assert_eq!(
            *seen,
            vec![
                ToIntegrationMessage::TurnOn {
                    entity_id: "light.board_light1".to_string()
                },
                ToIntegrationMessage::UpdateEntities {
                    entity_ids: vec!["light.board_light1".to_string()]
                },
                ToIntegrationMessage::HeartbeatKnownBoards,
            ]
        );
    }
}
