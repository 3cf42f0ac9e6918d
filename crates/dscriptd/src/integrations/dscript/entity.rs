//! Entities derived from board channels.
//!
//! One [`DscriptEntity`] exists per (board, channel kind, index). Kind-specific
//! behaviour is selected through [`ChannelKind`] rather than one type per kind.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use serde_json::json;
use tracing::debug;

use super::DOMAIN;
use super::board::Board;
use super::channel::ChannelCommand;
use super::channel::ChannelKind;
use super::channel::ChannelValue;
use super::channel::CoverMotion;
use super::error::Error;
use super::error::Result;
use super::mac::MacAddress;
use crate::engine::Entity;
use crate::engine::FromIntegrationMessage;

/// `GetStatus` is refreshed on every n-th board-status poll.
const STATUS_REFRESH_INTERVAL: u64 = 10;

/// Deterministic unique id, stable across restarts.
pub fn unique_id(mac: &MacAddress, kind: ChannelKind, index: u32) -> String {
    format!("{}_{}_{}{}", DOMAIN, mac.compact(), kind, index)
}

/// Object id part of the host entity id (`office_light1`).
pub fn object_id(friendly_name: &str, kind: ChannelKind, index: u32) -> String {
    format!("{}_{}{}", friendly_name, kind, index)
        .replace(':', "")
        .replace(['-', ' '], "_")
        .to_lowercase()
}

/// Last known value of an entity.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Reading {
    Unknown,
    Channel(ChannelValue),
    /// Board-status probe result
    Http(u16),
}

fn cover_state(position: u8, motion: Option<CoverMotion>) -> &'static str {
    match (position, motion) {
        (100, _) => "open",
        (0, _) => "closed",
        (_, Some(CoverMotion::Opening)) => "opening",
        (_, Some(CoverMotion::Closing)) => "closing",
        (_, None) => "stopped",
    }
}

pub struct DscriptEntity {
    board: Arc<Board>,
    kind: ChannelKind,
    index: u32,
    unique_id: String,
    entity_id: String,
    name: String,
    reading: Mutex<Reading>,
    polls: AtomicU64,
}

impl std::fmt::Debug for DscriptEntity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DscriptEntity")
            .field("unique_id", &self.unique_id)
            .field("entity_id", &self.entity_id)
            .field("reading", &self.reading())
            .finish()
    }
}

impl DscriptEntity {
    pub fn new(board: Arc<Board>, kind: ChannelKind, index: u32, entity_id: String) -> Self {
        let unique_id = unique_id(&board.mac(), kind, index);
        let name = format!("{}_{}{}", board.friendly_name(), kind.label(), index);
        Self {
            board,
            kind,
            index,
            unique_id,
            entity_id,
            name,
            reading: Mutex::new(Reading::Unknown),
            polls: AtomicU64::new(0),
        }
    }

    pub fn unique_id(&self) -> &str {
        &self.unique_id
    }

    pub fn kind(&self) -> ChannelKind {
        self.kind
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn board(&self) -> &Arc<Board> {
        &self.board
    }

    pub fn reading(&self) -> Reading {
        self.reading.lock().map(|r| *r).unwrap_or(Reading::Unknown)
    }

    fn set_reading(&self, reading: Reading) {
        if let Ok(mut current) = self.reading.lock() {
            *current = reading;
        }
    }

    /// Whether updates must be pulled rather than waited for.
    pub fn should_poll(&self) -> bool {
        !self.kind.is_pushed()
            || self.reading() == Reading::Unknown
            || !self.board.custom_firmware()
    }

    /// Apply a value pushed by the board; without a value, poll instead.
    pub async fn push(&self, value: Option<ChannelValue>) -> Result<()> {
        let Some(value) = value else {
            return self.poll().await;
        };
        if !value.fits(self.kind) {
            return Err(Error::ValueMismatch {
                kind: self.kind,
                value: value.to_string(),
            });
        }

        let value = match value {
            // Pushes never carry a reliable direction
            ChannelValue::Position { position, .. } => ChannelValue::Position {
                position,
                motion: None,
            },
            other => other,
        };
        self.set_reading(Reading::Channel(value));
        debug!("{}: push -> {}", self.unique_id, value);

        if self.kind == ChannelKind::Button {
            // The firmware only resets its internal counter once it is read back
            let ack = self.board.client().get_channel(self.kind, self.index).await?;
            debug!("{}: counter read back: {}", self.unique_id, ack);
        }
        Ok(())
    }

    /// Read the current value from the board.
    ///
    /// A connectivity failure leaves the entity in the unknown state.
    pub async fn poll(&self) -> Result<()> {
        if self.kind == ChannelKind::Board {
            self.poll_board_status().await;
            return Ok(());
        }

        match self.board.client().get_channel(self.kind, self.index).await {
            Ok(value) if value.fits(self.kind) => {
                debug!("{}: poll -> {}", self.unique_id, value);
                self.set_reading(Reading::Channel(value));
                Ok(())
            }
            Ok(value) => Err(Error::ValueMismatch {
                kind: self.kind,
                value: value.to_string(),
            }),
            Err(e) => {
                if e.is_connectivity() {
                    self.set_reading(Reading::Unknown);
                }
                Err(e)
            }
        }
    }

    async fn poll_board_status(&self) {
        let code = self.board.probe_http().await;
        if self.polls.fetch_add(1, Ordering::SeqCst) % STATUS_REFRESH_INTERVAL == 0 {
            if let Err(e) = self.board.refresh_status().await {
                debug!("{}: status refresh failed: {}", self.unique_id, e);
            }
        }
        self.set_reading(Reading::Http(code));
    }

    /// Poll when the poll policy asks for it. Returns whether a poll ran.
    pub async fn update(&self) -> Result<bool> {
        if !self.should_poll() {
            return Ok(false);
        }
        self.poll().await?;
        Ok(true)
    }

    /// Send an output command to the channel.
    pub async fn command(&self, command: ChannelCommand) -> Result<()> {
        if !self.kind.accepts(command) {
            return Err(Error::Unsupported {
                kind: self.kind,
                operation: command_name(command),
            });
        }
        self.board
            .client()
            .set_channel(self.kind, self.index, command)
            .await?;
        debug!("{}: {}", self.unique_id, command);

        // Boards without custom firmware do not push the result
        if !self.board.custom_firmware() {
            self.poll().await?;
        }
        Ok(())
    }

    pub fn discovery_message(&self, integration_name: &str) -> FromIntegrationMessage {
        FromIntegrationMessage::EntityDiscovered {
            entity_id: self.entity_id.clone(),
            integration_name: integration_name.to_string(),
            platform: self.platform().to_string(),
            device: Some(self.board.device()),
        }
    }

    pub fn state_message(&self) -> FromIntegrationMessage {
        FromIntegrationMessage::EntityStateChanged {
            entity_id: self.entity_id.clone(),
            available: self.available(),
            state: self.state_json(),
        }
    }

    fn board_attributes(&self) -> serde_json::Value {
        let identity = self.board.identity();
        let status = self.board.status().unwrap_or_default();
        json!({
            "model": identity.module_id,
            "voltage": status.voltage,
            "temperature": status.temperature,
            "device_id": self.board.mac().to_string(),
            "sw_version": identity.app_firmware.to_string(),
            "firmware": identity.system_firmware.to_string(),
            "ipaddress": self.board.ip().to_string(),
            "custom_app": identity.custom_firmware,
            "protocol": self.board.protocol().to_string(),
            "port": self.board.port(),
            "unique_id": self.unique_id,
        })
    }
}

fn command_name(command: ChannelCommand) -> &'static str {
    match command {
        ChannelCommand::On => "turn_on",
        ChannelCommand::Off => "turn_off",
        ChannelCommand::Open => "open",
        ChannelCommand::Close => "close",
        ChannelCommand::Stop => "stop",
        ChannelCommand::Position(_) => "set_position",
    }
}

impl Entity for DscriptEntity {
    fn entity_id(&self) -> &str {
        &self.entity_id
    }

    fn state_json(&self) -> serde_json::Value {
        let mut value = json!({
            "name": self.name,
            "unique_id": self.unique_id,
        });
        let reading = self.reading();
        match (self.kind, reading) {
            (_, Reading::Unknown) => {
                value["state"] = json!("unknown");
            }
            (ChannelKind::Cover, Reading::Channel(ChannelValue::Position { position, motion })) => {
                value["state"] = json!(cover_state(position, motion));
                value["position"] = json!(position);
            }
            (_, Reading::Channel(ChannelValue::State(on))) => {
                value["state"] = json!(if on { "on" } else { "off" });
            }
            (_, Reading::Channel(ChannelValue::Counter(count))) => {
                value["state"] = json!(count);
            }
            (_, Reading::Channel(ChannelValue::Position { position, .. })) => {
                value["state"] = json!(position);
            }
            (_, Reading::Http(code)) => {
                value["state"] = json!(code);
            }
        }
        if let Some(icon) = self.kind.icon() {
            value["icon"] = json!(icon);
        }
        if self.kind == ChannelKind::Board {
            value["attributes"] = self.board_attributes();
        }
        value
    }

    fn platform(&self) -> &'static str {
        self.kind.platform().as_str()
    }

    /// Never available while the board is down or the channel is beyond the
    /// reported count. The board-status sensor itself always reports.
    fn available(&self) -> bool {
        if self.kind == ChannelKind::Board {
            return true;
        }
        self.board.available() && self.index <= self.board.count(self.kind)
    }
}
