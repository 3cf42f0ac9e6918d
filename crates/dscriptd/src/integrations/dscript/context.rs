//! Per-instance integration state.
//!
//! Every handler gets the [`DscriptContext`] of its own integration instance,
//! so several instances can run side by side.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;
use tracing::info;
use tracing::warn;

use super::board::Board;
use super::boards::BoardRegistry;
use super::channel::ChannelCommand;
use super::channel::ChannelKind;
use super::channel::Platform;
use super::config::DscriptConfig;
use super::config::Protocol;
use super::entities::EntityRegistry;
use super::entity::DscriptEntity;
use super::error::Error;
use super::error::Result;
use super::platform::PlatformHost;
use super::platform::PlatformSetup;
use super::reconcile::reconcile_board;
use crate::engine::Entity;
use crate::engine::FromIntegrationMessage;
use crate::engine::FromIntegrationSender;

/// Pause between attempts to bring up a configured board.
const SETUP_RETRY_DELAY: Duration = Duration::from_secs(2);

pub struct DscriptContext {
    entry_id: String,
    config: DscriptConfig,
    boards: BoardRegistry,
    entities: EntityRegistry,
    platforms: Arc<PlatformSetup>,
    tx: FromIntegrationSender,
    retry_delay: Duration,
}

impl DscriptContext {
    pub fn new(
        entry_id: impl Into<String>,
        config: DscriptConfig,
        boards: BoardRegistry,
        tx: FromIntegrationSender,
    ) -> Self {
        Self {
            entry_id: entry_id.into(),
            config,
            boards,
            entities: EntityRegistry::new(),
            platforms: PlatformSetup::new(),
            tx,
            retry_delay: SETUP_RETRY_DELAY,
        }
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    pub fn entry_id(&self) -> &str {
        &self.entry_id
    }

    pub fn config(&self) -> &DscriptConfig {
        &self.config
    }

    pub fn boards(&self) -> &BoardRegistry {
        &self.boards
    }

    pub fn entities(&self) -> &EntityRegistry {
        &self.entities
    }

    async fn send(&self, msg: FromIntegrationMessage) {
        if let Err(e) = self.tx.send(msg).await {
            warn!("[{}] Engine is gone, dropping update: {}", self.entry_id, e);
        }
    }

    /// Report an entity's current state and availability to the engine.
    pub async fn publish(&self, entity: &DscriptEntity) {
        self.send(entity.state_message()).await;
    }

    /// Report every entity of a board, e.g. after its availability changed.
    pub async fn publish_board(&self, board: &Board) {
        for entity in self.entities.for_board(&board.mac()) {
            self.publish(&entity).await;
        }
    }

    /// Bring up a board and set up platforms for it when it is new.
    pub async fn setup_board(
        self: &Arc<Self>,
        ip: IpAddr,
        port: u16,
        protocol: Protocol,
        aes_key: &str,
    ) -> Option<Arc<Board>> {
        let board = self.boards.create_or_get(ip, port, protocol, aes_key).await?;
        // Every set-up board has at least its status sensor
        if self.entities.for_board(&board.mac()).is_empty() {
            self.setup_platforms(&Platform::ALL).await;
        }
        Some(board)
    }

    /// Run platform setup and wait for it to finish.
    pub async fn setup_platforms(self: &Arc<Self>, platforms: &[Platform]) {
        let handles = self.platforms.setup(self.clone(), platforms).await;
        for handle in handles {
            if let Err(e) = handle.await {
                warn!("[{}] Platform setup task failed: {}", self.entry_id, e);
            }
        }
    }

    /// Create and announce entities for newly appeared channels.
    ///
    /// Existing entities are left alone. New entities get an initial update.
    pub async fn add_entities(&self, board: &Arc<Board>, channels: &[(ChannelKind, u32)]) {
        let mut created = Vec::new();
        for &(kind, index) in channels {
            if let Some(entity) = self.entities.create(board, kind, index) {
                self.send(entity.discovery_message(&self.entry_id)).await;
                created.push(entity);
            }
        }
        if !created.is_empty() {
            info!(
                "[{}] {}: added {} entities",
                self.entry_id,
                board.friendly_name(),
                created.len()
            );
        }

        for entity in created {
            if let Err(e) = entity.update().await {
                debug!("[{}] {}: initial update failed: {}", self.entry_id, entity.unique_id(), e);
            }
            self.publish(&entity).await;
        }
    }

    /// Handle channels that disappeared from a board's config.
    ///
    /// Depending on `remove_stale_entities` they are deregistered, or kept and
    /// reported unavailable.
    pub async fn retire_entities(&self, board: &Arc<Board>, channels: &[(ChannelKind, u32)]) {
        for &(kind, index) in channels {
            let Some(entity) = self.entities.get_by_location(board.mac(), kind, index) else {
                continue;
            };
            if self.config.remove_stale_entities {
                self.entities.remove(&board.mac(), entity.unique_id());
                info!("[{}] {}: removed stale entity", self.entry_id, entity.entity_id());
                self.send(FromIntegrationMessage::EntityRemoved {
                    entity_id: entity.entity_id().to_string(),
                })
                .await;
            } else {
                debug!("[{}] {}: keeping stale entity", self.entry_id, entity.entity_id());
                self.publish(&entity).await;
            }
        }
    }

    /// All channels a board currently exposes for the given kinds.
    fn channels(board: &Board, kinds: &[ChannelKind]) -> Vec<(ChannelKind, u32)> {
        kinds
            .iter()
            .flat_map(|&kind| (1..=board.count(kind)).map(move |i| (kind, i)))
            .collect()
    }

    /// Bring up configured boards and boards from the known-board cache.
    pub async fn setup_known_boards(self: &Arc<Self>) {
        let mut targets: Vec<(IpAddr, u16, Protocol, String)> = self
            .config
            .devices
            .iter()
            .map(|d| (d.host, d.port, d.protocol, d.aes_key.clone()))
            .collect();
        for (mac, cached) in self.boards.cache().entries() {
            if targets.iter().any(|(ip, ..)| *ip == cached.ip) {
                continue;
            }
            debug!("[{}] {}: known from cache as {}", self.entry_id, cached.ip, mac);
            targets.push((
                cached.ip,
                self.config.port,
                self.config.protocol,
                self.config.aes_key.clone(),
            ));
        }

        let attempts = self.config.setup_retries.max(1);
        for (ip, port, protocol, aes_key) in targets {
            let mut ready = false;
            for attempt in 1..=attempts {
                if self
                    .boards
                    .create_or_get(ip, port, protocol, &aes_key)
                    .await
                    .is_some()
                {
                    ready = true;
                    break;
                }
                if attempt < attempts {
                    tokio::time::sleep(self.retry_delay).await;
                }
            }
            if !ready {
                warn!(
                    "[{}] {}: board did not come up after {} attempts",
                    self.entry_id, ip, attempts
                );
            }
        }

        self.setup_platforms(&Platform::ALL).await;
    }

    /// Poll the named host entities now. Returns the ids that were not found.
    pub async fn update_entities(&self, entity_ids: &[String]) -> Vec<String> {
        let mut unknown = Vec::new();
        for entity_id in entity_ids {
            let Some(entity) = self.entities.get_by_external_id(entity_id) else {
                warn!("[{}] update_entity: unable to find entity {}", self.entry_id, entity_id);
                unknown.push(entity_id.clone());
                continue;
            };
            if let Err(e) = self.poll_and_publish(&entity).await {
                warn!("[{}] {}: update failed: {}", self.entry_id, entity_id, e);
            }
        }
        unknown
    }

    /// One poll cycle over every entity whose state must be pulled.
    ///
    /// Board-status sensors are always part of it.
    pub async fn poll_entities(&self) {
        for entity in self.entities.all() {
            if !entity.should_poll() {
                continue;
            }
            if let Err(e) = self.poll_and_publish(&entity).await {
                debug!("[{}] {}: poll failed: {}", self.entry_id, entity.unique_id(), e);
            }
        }
    }

    /// Poll and report an entity. When the poll flipped the board's
    /// availability, the whole board is reported.
    async fn poll_and_publish(&self, entity: &DscriptEntity) -> Result<()> {
        let board = entity.board().clone();
        let was_available = board.available();
        let result = entity.poll().await;
        if board.available() != was_available {
            self.publish_board(&board).await;
        } else {
            self.publish(entity).await;
        }
        result
    }

    /// Health-check every known board, then reconcile the reachable ones that
    /// run custom firmware.
    pub async fn heartbeat_known_boards(&self) {
        for board in self.boards.all() {
            let alive = board.heartbeat().await;
            if alive && board.custom_firmware() {
                // Failures are logged by the reconciler and stay local to this board
                let _ = reconcile_board(self, &board).await;
            }
            self.publish_board(&board).await;
        }
    }

    /// Execute an output command on a host entity.
    pub async fn command(&self, entity_id: &str, command: ChannelCommand) -> Result<()> {
        let entity = self
            .entities
            .get_by_external_id(entity_id)
            .ok_or_else(|| Error::UnknownEntity(entity_id.to_string()))?;
        let result = entity.command(command).await;
        self.publish(&entity).await;
        result
    }
}

#[async_trait]
impl PlatformHost for DscriptContext {
    async fn setup_platform(&self, platform: Platform) {
        debug!("[{}] Setting up platform {}", self.entry_id, platform);
        for board in self.boards.all() {
            let channels = Self::channels(&board, platform.kinds());
            self.add_entities(&board, &channels).await;
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use tokio::sync::mpsc;

    use super::*;
    use crate::integrations::dscript::boards::test_support::Fixture;

    pub struct Harness {
        pub fx: Fixture,
        pub ctx: Arc<DscriptContext>,
        pub rx: mpsc::Receiver<FromIntegrationMessage>,
    }

    impl Harness {
        pub fn new(config: DscriptConfig) -> Self {
            let fx = Fixture::new();
            let (tx, rx) = mpsc::channel(1024);
            let ctx = DscriptContext::new("test", config, fx.registry(), tx)
                .with_retry_delay(Duration::from_millis(1));
            Self {
                fx,
                ctx: Arc::new(ctx),
                rx,
            }
        }

        /// Messages sent to the engine so far.
        pub fn drain(&mut self) -> Vec<FromIntegrationMessage> {
            let mut messages = Vec::new();
            while let Ok(msg) = self.rx.try_recv() {
                messages.push(msg);
            }
            messages
        }

        pub fn unique_ids(&self) -> Vec<String> {
            let mut ids: Vec<String> = self
                .ctx
                .entities()
                .all()
                .iter()
                .map(|e| e.unique_id().to_string())
                .collect();
            ids.sort();
            ids
        }
    }
}
