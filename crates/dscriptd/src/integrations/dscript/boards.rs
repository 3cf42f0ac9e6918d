//! Board registry: known boards of one integration instance, keyed by MAC.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::sync::RwLock;

use tokio::sync::Mutex;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use super::board::Board;
use super::board::BoardParams;
use super::cache::KnownBoardCache;
use super::config::Protocol;
use super::error::Result;
use super::mac::AddressResolver;
use super::mac::MacAddress;
use super::probe::StatusProbe;
use super::protocol::BoardConnector;

pub struct BoardRegistry {
    entry_id: String,
    boards: RwLock<BTreeMap<MacAddress, Arc<Board>>>,
    /// Serializes board creation so concurrent triggers converge on one record
    create_lock: Mutex<()>,
    connector: Arc<dyn BoardConnector>,
    resolver: Arc<dyn AddressResolver>,
    probe: Arc<dyn StatusProbe>,
    cache: Arc<KnownBoardCache>,
    friendly_names: HashMap<MacAddress, String>,
}

impl BoardRegistry {
    pub fn new(
        entry_id: impl Into<String>,
        connector: Arc<dyn BoardConnector>,
        resolver: Arc<dyn AddressResolver>,
        probe: Arc<dyn StatusProbe>,
        cache: Arc<KnownBoardCache>,
    ) -> Self {
        Self {
            entry_id: entry_id.into(),
            boards: RwLock::new(BTreeMap::new()),
            create_lock: Mutex::new(()),
            connector,
            resolver,
            probe,
            cache,
            friendly_names: HashMap::new(),
        }
    }

    /// User-assigned names that take precedence over cached and reported ones.
    pub fn with_friendly_names(mut self, names: HashMap<MacAddress, String>) -> Self {
        self.friendly_names = names;
        self
    }

    pub fn cache(&self) -> &Arc<KnownBoardCache> {
        &self.cache
    }

    pub fn all(&self) -> Vec<Arc<Board>> {
        self.boards
            .read()
            .map(|b| b.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.boards.read().map(|b| b.len()).unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get_by_mac(&self, mac: &MacAddress) -> Option<Arc<Board>> {
        self.boards.read().ok()?.get(mac).cloned()
    }

    fn find_ip(&self, ip: IpAddr) -> Option<Arc<Board>> {
        self.boards
            .read()
            .ok()?
            .values()
            .find(|b| b.ip() == ip)
            .cloned()
    }

    /// Look a board up by address, falling back to the neighbour table for
    /// boards that moved to a new IP.
    pub async fn get_by_ip(&self, ip: IpAddr) -> Option<Arc<Board>> {
        if let Some(board) = self.find_ip(ip) {
            return Some(board);
        }
        if self.is_empty() {
            return None;
        }

        let resolver = self.resolver.clone();
        let mac = match tokio::task::spawn_blocking(move || resolver.resolve(ip)).await {
            Ok(mac) => mac?,
            Err(e) => {
                warn!("[{}] {}: address resolution failed: {}", self.entry_id, ip, e);
                return None;
            }
        };

        let board = self.get_by_mac(&mac)?;
        debug!("[{}] {}: resolved to known board {}", self.entry_id, ip, mac);
        board.set_ip(ip);
        Some(board)
    }

    /// Return the board at `ip`, connecting and initializing it if unknown.
    ///
    /// Failures are logged and yield `None`; no partial board is registered.
    pub async fn create_or_get(
        &self,
        ip: IpAddr,
        port: u16,
        protocol: Protocol,
        aes_key: &str,
    ) -> Option<Arc<Board>> {
        let _guard = self.create_lock.lock().await;

        if let Some(board) = self.get_by_ip(ip).await {
            debug!("[{}] {}: already known as {}", self.entry_id, ip, board.mac());
            return Some(board);
        }

        match self.create(ip, port, protocol, aes_key).await {
            Ok(board) => Some(board),
            Err(e) => {
                error!("[{}] {}: board setup failed: {}", self.entry_id, ip, e);
                None
            }
        }
    }

    async fn create(
        &self,
        ip: IpAddr,
        port: u16,
        protocol: Protocol,
        aes_key: &str,
    ) -> Result<Arc<Board>> {
        let mut client = self.connector.connect(ip, port, protocol).await?;
        if !aes_key.is_empty() {
            client.set_aes_key(aes_key);
        }
        let identity = client.init_board().await?;
        let mac: MacAddress = identity.mac.parse()?;

        // Reached through another path, e.g. heartbeat vs. configured address
        if let Some(board) = self.get_by_mac(&mac) {
            debug!("[{}] {}: already known by MAC {}", self.entry_id, ip, mac);
            board.set_ip(ip);
            return Ok(board);
        }

        let friendly_name = self
            .friendly_names
            .get(&mac)
            .cloned()
            .or_else(|| self.cache.get(&mac).map(|c| c.name))
            .unwrap_or_else(|| identity.host_name.clone());

        debug!(
            "[{}] {}: firmware {} app {} custom={} mac={} protocol={}",
            self.entry_id,
            identity.host_name,
            identity.system_firmware,
            identity.app_firmware,
            identity.custom_firmware,
            mac,
            protocol
        );
        info!(
            "[{}] {}: initialized {} as {} ({})",
            self.entry_id, ip, identity.module_id, friendly_name, mac
        );

        let board = Arc::new(Board::new(
            BoardParams {
                mac,
                ip,
                port,
                protocol,
                friendly_name,
                identity,
            },
            Arc::from(client),
            self.probe.clone(),
        ));

        if let Ok(mut boards) = self.boards.write() {
            boards.insert(mac, board.clone());
        }
        self.persist(&board).await;
        Ok(board)
    }

    /// Best-effort write of the board's name and address to the cache.
    async fn persist(&self, board: &Board) {
        if !self
            .cache
            .insert(board.mac(), board.friendly_name(), board.ip())
        {
            return;
        }
        let cache = self.cache.clone();
        match tokio::task::spawn_blocking(move || cache.save()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("[{}] Unable to write board cache: {}", self.entry_id, e),
            Err(e) => warn!("[{}] Unable to write board cache: {}", self.entry_id, e),
        }
    }
}
