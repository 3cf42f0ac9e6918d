use std::collections::HashMap;
use std::error::Error as StdError;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tracing::debug;
use tracing::info;
use tracing::warn;

use super::DscriptConfig;
use super::boards::BoardRegistry;
use super::cache::KnownBoardCache;
use super::channel::ChannelCommand;
use super::channel::Platform;
use super::context::DscriptContext;
use super::dispatch::EventQueue;
use super::dispatch::spawn_dispatcher;
use super::error::Error;
use super::mac::AddressResolver;
use super::mac::ArpTableResolver;
use super::mac::MacAddress;
use super::probe::HttpStatusProbe;
use super::probe::StatusProbe;
use super::protocol::BoardConnector;
use super::protocol::EventServer;
use super::server::BuiltInServer;
use crate::engine::FromIntegrationSender;
use crate::engine::Integration;
use crate::engine::ToIntegrationMessage;

fn boxed(e: Error) -> Box<dyn StdError + Send> {
    Box::new(e)
}

fn not_ready(entry_id: &str) -> Box<dyn StdError + Send> {
    Box::new(std::io::Error::new(
        std::io::ErrorKind::NotConnected,
        format!("dScript integration '{}' is not set up", entry_id),
    ))
}

/// One configured dScript integration instance.
///
/// Owns the built-in event server, the dispatcher task and the per-instance
/// registries. Commands from the engine are executed against the entity
/// registry.
pub struct DscriptIntegration {
    entry_id: String,
    config: DscriptConfig,
    connector: Arc<dyn BoardConnector>,
    resolver: Arc<dyn AddressResolver>,
    probe: Arc<dyn StatusProbe>,
    /// Taken by `setup`
    event_server: Option<Box<dyn EventServer>>,
    server_interval: Option<Duration>,
    retry_delay: Option<Duration>,

    ctx: Option<Arc<DscriptContext>>,
    server: Option<BuiltInServer>,
    dispatcher: Option<JoinHandle<()>>,
    known_boards: Option<JoinHandle<()>>,
    poller: Option<JoinHandle<()>>,
}

impl DscriptIntegration {
    pub fn new(
        entry_id: String,
        config: DscriptConfig,
        connector: Arc<dyn BoardConnector>,
        event_server: Box<dyn EventServer>,
    ) -> Self {
        Self {
            entry_id,
            config,
            connector,
            resolver: Arc::new(ArpTableResolver::default()),
            probe: Arc::new(HttpStatusProbe::default()),
            event_server: Some(event_server),
            server_interval: None,
            retry_delay: None,
            ctx: None,
            server: None,
            dispatcher: None,
            known_boards: None,
            poller: None,
        }
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn AddressResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn with_probe(mut self, probe: Arc<dyn StatusProbe>) -> Self {
        self.probe = probe;
        self
    }

    /// Pause between readiness checks of the event server.
    pub fn with_server_interval(mut self, interval: Duration) -> Self {
        self.server_interval = Some(interval);
        self
    }

    /// Pause between attempts to bring up a known board.
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = Some(delay);
        self
    }

    fn friendly_names(&self) -> HashMap<MacAddress, String> {
        self.config
            .entities
            .iter()
            .filter_map(|e| match e.mac.parse() {
                Ok(mac) => Some((mac, e.name.clone())),
                Err(_) => {
                    warn!("[{}] Ignoring name for invalid MAC '{}'", self.entry_id, e.mac);
                    None
                }
            })
            .collect()
    }

    fn load_cache(&self) -> KnownBoardCache {
        match KnownBoardCache::load(&self.config.cache_file) {
            Ok(cache) => {
                debug!(
                    "[{}] Loaded {} known boards from {}",
                    self.entry_id,
                    cache.entries().len(),
                    cache.path().display()
                );
                cache
            }
            Err(e) => {
                warn!("[{}] Starting with an empty board cache: {}", self.entry_id, e);
                KnownBoardCache::new(&self.config.cache_file)
            }
        }
    }

    /// Run a poll cycle every scan interval, starting one interval from now.
    fn spawn_poller(&self, ctx: Arc<DscriptContext>) -> JoinHandle<()> {
        let period = self.config.scan_interval();
        debug!("[{}] Polling every {:?}", self.entry_id, period);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tick.tick().await;
                ctx.poll_entities().await;
            }
        })
    }

    fn context(&self) -> Result<&Arc<DscriptContext>, Box<dyn StdError + Send>> {
        self.ctx.as_ref().ok_or_else(|| not_ready(&self.entry_id))
    }
}

#[async_trait]
impl Integration for DscriptIntegration {
    fn name(&self) -> &str {
        &self.entry_id
    }

    async fn setup(&mut self, tx: FromIntegrationSender) -> Result<(), Box<dyn StdError + Send>> {
        info!("[{}] Setting up dScript integration", self.entry_id);

        let event_server = self
            .event_server
            .take()
            .ok_or_else(|| not_ready(&self.entry_id))?;

        let boards = BoardRegistry::new(
            self.entry_id.clone(),
            self.connector.clone(),
            self.resolver.clone(),
            self.probe.clone(),
            Arc::new(self.load_cache()),
        )
        .with_friendly_names(self.friendly_names());

        let mut ctx = DscriptContext::new(self.entry_id.clone(), self.config.clone(), boards, tx);
        if let Some(delay) = self.retry_delay {
            ctx = ctx.with_retry_delay(delay);
        }
        let ctx = Arc::new(ctx);

        let (queue, rx) = EventQueue::new();
        let dispatcher = spawn_dispatcher(ctx.clone(), rx);

        let mut server =
            BuiltInServer::new(self.entry_id.clone(), event_server, &self.config.aes_key, &queue);
        if let Some(interval) = self.server_interval {
            server = server.with_interval(interval);
        }
        if let Err(e) = server.start().await {
            dispatcher.abort();
            return Err(boxed(e));
        }

        ctx.setup_platforms(&Platform::ALL).await;

        let known_boards = {
            let ctx = ctx.clone();
            tokio::spawn(async move { ctx.setup_known_boards().await })
        };
        let poller = self.spawn_poller(ctx.clone());

        self.ctx = Some(ctx);
        self.server = Some(server);
        self.dispatcher = Some(dispatcher);
        self.known_boards = Some(known_boards);
        self.poller = Some(poller);

        info!(
            "[{}] Listening for board events on {}:{} ({})",
            self.entry_id, self.config.listen_ip, self.config.port, self.config.protocol
        );
        Ok(())
    }

    async fn handle_message(
        &mut self,
        msg: ToIntegrationMessage,
    ) -> Result<(), Box<dyn StdError + Send>> {
        let ctx = self.context()?;
        let (entity_id, command) = match msg {
            ToIntegrationMessage::TurnOn { entity_id } => (entity_id, ChannelCommand::On),
            ToIntegrationMessage::TurnOff { entity_id } => (entity_id, ChannelCommand::Off),
            ToIntegrationMessage::OpenCover { entity_id } => (entity_id, ChannelCommand::Open),
            ToIntegrationMessage::CloseCover { entity_id } => (entity_id, ChannelCommand::Close),
            ToIntegrationMessage::StopCover { entity_id } => (entity_id, ChannelCommand::Stop),
            ToIntegrationMessage::SetCoverPosition {
                entity_id,
                position,
            } => (entity_id, ChannelCommand::Position(position)),
            ToIntegrationMessage::UpdateEntities { entity_ids } => {
                let unknown = ctx.update_entities(&entity_ids).await;
                if !unknown.is_empty() {
                    debug!("[{}] Skipped unknown entities: {:?}", self.entry_id, unknown);
                }
                return Ok(());
            }
            ToIntegrationMessage::HeartbeatKnownBoards => {
                ctx.heartbeat_known_boards().await;
                return Ok(());
            }
        };

        debug!("[{}] {}: {}", self.entry_id, entity_id, command);
        ctx.command(&entity_id, command).await.map_err(boxed)
    }

    async fn shutdown(&mut self) -> Result<(), Box<dyn StdError + Send>> {
        info!("[{}] Shutting down dScript integration", self.entry_id);

        if let Some(known_boards) = self.known_boards.take() {
            known_boards.abort();
        }
        if let Some(poller) = self.poller.take() {
            poller.abort();
        }
        let result = match self.server.take() {
            Some(server) => server.stop().await.map_err(boxed),
            None => Ok(()),
        };
        if let Some(dispatcher) = self.dispatcher.take() {
            dispatcher.abort();
        }
        self.ctx = None;
        result
    }
}
