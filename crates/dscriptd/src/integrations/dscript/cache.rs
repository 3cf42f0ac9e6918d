//! Known-board cache.
//!
//! A small JSON file mapping board MAC to its friendly name and last IP, so
//! boards come back after a restart without waiting for a heartbeat:
//!
//! ```json
//! { "dscriptmodule": { "AA:BB:CC:DD:EE:FF": { "name": "Office", "ip": "10.0.0.5" } } }
//! ```

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Mutex;

use serde::Deserialize;
use serde::Serialize;

use super::DOMAIN;
use super::error::Error;
use super::error::Result;
use super::mac::MacAddress;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedBoard {
    pub name: String,
    pub ip: IpAddr,
}

type CacheFile = BTreeMap<String, BTreeMap<MacAddress, CachedBoard>>;

#[derive(Debug)]
pub struct KnownBoardCache {
    path: PathBuf,
    entries: Mutex<BTreeMap<MacAddress, CachedBoard>>,
}

impl KnownBoardCache {
    /// An empty cache that will be written to `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            entries: Mutex::new(BTreeMap::new()),
        }
    }

    /// Read the cache; a missing file yields an empty cache.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let entries = match std::fs::read_to_string(&path) {
            Ok(contents) => {
                let mut file: CacheFile = serde_json::from_str(&contents)
                    .map_err(|e| Error::CacheFormat(path.clone(), e))?;
                file.remove(DOMAIN).unwrap_or_default()
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(Error::CacheIo(path, e)),
        };
        Ok(Self {
            path,
            entries: Mutex::new(entries),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get(&self, mac: &MacAddress) -> Option<CachedBoard> {
        self.entries.lock().ok()?.get(mac).cloned()
    }

    /// Record a board; returns whether the entry changed.
    pub fn insert(&self, mac: MacAddress, name: &str, ip: IpAddr) -> bool {
        let entry = CachedBoard {
            name: name.to_string(),
            ip,
        };
        match self.entries.lock() {
            Ok(mut entries) => entries.insert(mac, entry.clone()).as_ref() != Some(&entry),
            Err(_) => false,
        }
    }

    pub fn entries(&self) -> Vec<(MacAddress, CachedBoard)> {
        self.entries
            .lock()
            .map(|e| e.iter().map(|(k, v)| (*k, v.clone())).collect())
            .unwrap_or_default()
    }

    /// Write the cache. Blocking; run off the async workers.
    pub fn save(&self) -> Result<()> {
        let file: CacheFile = BTreeMap::from([(
            DOMAIN.to_string(),
            self.entries
                .lock()
                .map(|e| e.clone())
                .unwrap_or_default(),
        )]);
        let json = serde_json::to_string_pretty(&file)
            .map_err(|e| Error::CacheFormat(self.path.clone(), e))?;
        std::fs::write(&self.path, json).map_err(|e| Error::CacheIo(self.path.clone(), e))
    }
}
