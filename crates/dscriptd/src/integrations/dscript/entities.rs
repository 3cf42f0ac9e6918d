//! Entity registry: live entities of one integration instance.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::sync::RwLock;

use tracing::debug;
use tracing::warn;

use super::board::Board;
use super::channel::ChannelKind;
use super::entity::DscriptEntity;
use super::entity::object_id;
use super::entity::unique_id;
use super::mac::MacAddress;
use crate::engine::Entity;

/// How to identify the owning board in a location lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoardKey {
    Mac(MacAddress),
    Ip(IpAddr),
}

impl From<MacAddress> for BoardKey {
    fn from(mac: MacAddress) -> Self {
        BoardKey::Mac(mac)
    }
}

impl From<IpAddr> for BoardKey {
    fn from(ip: IpAddr) -> Self {
        BoardKey::Ip(ip)
    }
}

#[derive(Default)]
struct Entities {
    /// board MAC -> unique id -> entity
    by_board: BTreeMap<MacAddress, BTreeMap<String, Arc<DscriptEntity>>>,
    /// host entity id -> entity
    by_entity_id: HashMap<String, Arc<DscriptEntity>>,
}

impl Entities {
    fn contains(&self, mac: &MacAddress, unique_id: &str) -> bool {
        self.by_board
            .get(mac)
            .is_some_and(|entities| entities.contains_key(unique_id))
    }

    fn insert(&mut self, entity: Arc<DscriptEntity>) {
        self.by_entity_id
            .insert(entity.entity_id().to_string(), entity.clone());
        self.by_board
            .entry(entity.board().mac())
            .or_default()
            .insert(entity.unique_id().to_string(), entity);
    }

    /// `platform.object_id`, suffixed `_2`, `_3`, ... while taken.
    fn free_entity_id(&self, platform: &str, object_id: &str) -> String {
        let base = format!("{}.{}", platform, object_id);
        if !self.by_entity_id.contains_key(&base) {
            return base;
        }
        (2..)
            .map(|n| format!("{}_{}", base, n))
            .find(|candidate| !self.by_entity_id.contains_key(candidate))
            .unwrap_or(base)
    }
}

#[derive(Default)]
pub struct EntityRegistry {
    inner: RwLock<Entities>,
}

impl EntityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create the entity for `(board, kind, index)` unless one already exists.
    ///
    /// Returns `None` for an existing entity, so repeated discovery is a no-op.
    pub fn create(
        &self,
        board: &Arc<Board>,
        kind: ChannelKind,
        index: u32,
    ) -> Option<Arc<DscriptEntity>> {
        let mut inner = self.inner.write().ok()?;
        let mac = board.mac();
        if inner.contains(&mac, &unique_id(&mac, kind, index)) {
            return None;
        }

        let object_id = object_id(board.friendly_name(), kind, index);
        let entity_id = inner.free_entity_id(kind.platform().as_str(), &object_id);
        let entity = Arc::new(DscriptEntity::new(board.clone(), kind, index, entity_id));
        debug!("{}: created {}", entity.unique_id(), entity.entity_id());
        inner.insert(entity.clone());
        Some(entity)
    }

    /// Register a prebuilt entity; a duplicate unique id is logged and ignored.
    pub fn register(&self, entity: Arc<DscriptEntity>) -> bool {
        let Ok(mut inner) = self.inner.write() else {
            return false;
        };
        let mac = entity.board().mac();
        if inner.contains(&mac, entity.unique_id()) {
            warn!("{}: already registered", entity.unique_id());
            return false;
        }
        if inner.by_entity_id.contains_key(entity.entity_id()) {
            warn!("{}: entity id {} is taken", entity.unique_id(), entity.entity_id());
            return false;
        }
        inner.insert(entity);
        true
    }

    pub fn remove(&self, mac: &MacAddress, unique_id: &str) -> Option<Arc<DscriptEntity>> {
        let mut inner = self.inner.write().ok()?;
        let entity = inner.by_board.get_mut(mac)?.remove(unique_id)?;
        inner.by_entity_id.remove(entity.entity_id());
        Some(entity)
    }

    pub fn get_by_unique_id(&self, mac: &MacAddress, unique_id: &str) -> Option<Arc<DscriptEntity>> {
        self.inner.read().ok()?.by_board.get(mac)?.get(unique_id).cloned()
    }

    pub fn get_by_location(
        &self,
        board: impl Into<BoardKey>,
        kind: ChannelKind,
        index: u32,
    ) -> Option<Arc<DscriptEntity>> {
        let inner = self.inner.read().ok()?;
        match board.into() {
            BoardKey::Mac(mac) => inner.by_board.get(&mac)?.get(&unique_id(&mac, kind, index)).cloned(),
            BoardKey::Ip(ip) => inner
                .by_board
                .values()
                .flat_map(|entities| entities.values())
                .find(|e| e.board().ip() == ip && e.kind() == kind && e.index() == index)
                .cloned(),
        }
    }

    /// Look up by host entity id (`light.office_light1`).
    pub fn get_by_external_id(&self, entity_id: &str) -> Option<Arc<DscriptEntity>> {
        self.inner.read().ok()?.by_entity_id.get(entity_id).cloned()
    }

    pub fn for_board(&self, mac: &MacAddress) -> Vec<Arc<DscriptEntity>> {
        self.inner
            .read()
            .ok()
            .and_then(|inner| inner.by_board.get(mac).map(|e| e.values().cloned().collect()))
            .unwrap_or_default()
    }

    pub fn all(&self) -> Vec<Arc<DscriptEntity>> {
        self.inner
            .read()
            .map(|inner| {
                inner
                    .by_board
                    .values()
                    .flat_map(|e| e.values().cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.inner
            .read()
            .map(|inner| inner.by_entity_id.len())
            .unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
