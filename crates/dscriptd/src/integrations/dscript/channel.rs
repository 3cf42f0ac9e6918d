//! Channel kinds and the per-kind lookup table.
//!
//! Every kind maps to a host platform, a count attribute on the board, a push
//! topic and a display label. Dispatching through [`ChannelKind`] keeps all
//! kind-specific decisions in one place.

use serde::Deserialize;
use serde::Serialize;

/// Number of generic relays a board exposes without custom firmware.
pub const VIRTUAL_RELAYS: u32 = 32;

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::IntoStaticStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ChannelKind {
    Light,
    Switch,
    Cover,
    #[serde(rename = "sensor_motion")]
    #[strum(serialize = "sensor_motion")]
    Motion,
    #[serde(rename = "sensor_button")]
    #[strum(serialize = "sensor_button")]
    Button,
    #[serde(rename = "sensor_board")]
    #[strum(serialize = "sensor_board")]
    Board,
}

/// Host platforms entities are grouped under.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    strum::Display,
    strum::EnumString,
    strum::IntoStaticStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Platform {
    Light,
    Switch,
    Cover,
    Sensor,
}

/// Push topics the event server delivers.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    strum::Display,
    strum::EnumString,
    strum::IntoStaticStr,
)]
#[strum(serialize_all = "lowercase")]
pub enum Topic {
    Heartbeat,
    GetConfig,
    GetLight,
    GetSocket,
    GetShutter,
    GetMotion,
    GetButton,
}

impl Topic {
    pub const ALL: [Topic; 7] = [
        Topic::Heartbeat,
        Topic::GetConfig,
        Topic::GetLight,
        Topic::GetSocket,
        Topic::GetShutter,
        Topic::GetMotion,
        Topic::GetButton,
    ];

    /// The channel kind a state topic reports on; `None` for control topics.
    pub fn channel_kind(self) -> Option<ChannelKind> {
        match self {
            Topic::Heartbeat | Topic::GetConfig => None,
            Topic::GetLight => Some(ChannelKind::Light),
            Topic::GetSocket => Some(ChannelKind::Switch),
            Topic::GetShutter => Some(ChannelKind::Cover),
            Topic::GetMotion => Some(ChannelKind::Motion),
            Topic::GetButton => Some(ChannelKind::Button),
        }
    }
}

impl Platform {
    pub const ALL: [Platform; 4] = [
        Platform::Light,
        Platform::Switch,
        Platform::Cover,
        Platform::Sensor,
    ];

    pub fn as_str(self) -> &'static str {
        self.into()
    }

    /// Channel kinds whose entities live on this platform.
    pub fn kinds(self) -> &'static [ChannelKind] {
        match self {
            Platform::Light => &[ChannelKind::Light],
            Platform::Switch => &[ChannelKind::Switch],
            Platform::Cover => &[ChannelKind::Cover],
            Platform::Sensor => &[
                ChannelKind::Motion,
                ChannelKind::Button,
                ChannelKind::Board,
            ],
        }
    }
}

/// Connected-channel counts reported by `GetConfig`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelCounts {
    pub lights: u32,
    pub sockets: u32,
    pub shutters: u32,
    pub motion_sensors: u32,
    pub buttons: u32,
}

impl ChannelKind {
    pub const ALL: [ChannelKind; 6] = [
        ChannelKind::Light,
        ChannelKind::Switch,
        ChannelKind::Cover,
        ChannelKind::Motion,
        ChannelKind::Button,
        ChannelKind::Board,
    ];

    /// Kind name as used in unique ids (`light`, `sensor_motion`, ...).
    pub fn as_str(self) -> &'static str {
        self.into()
    }

    pub fn platform(self) -> Platform {
        match self {
            ChannelKind::Light => Platform::Light,
            ChannelKind::Switch => Platform::Switch,
            ChannelKind::Cover => Platform::Cover,
            ChannelKind::Motion | ChannelKind::Button | ChannelKind::Board => Platform::Sensor,
        }
    }

    pub fn topic(self) -> Option<Topic> {
        match self {
            ChannelKind::Light => Some(Topic::GetLight),
            ChannelKind::Switch => Some(Topic::GetSocket),
            ChannelKind::Cover => Some(Topic::GetShutter),
            ChannelKind::Motion => Some(Topic::GetMotion),
            ChannelKind::Button => Some(Topic::GetButton),
            ChannelKind::Board => None,
        }
    }

    /// Capitalized label used in display names (`Office_Light1`).
    pub fn label(self) -> &'static str {
        match self {
            ChannelKind::Light => "Light",
            ChannelKind::Switch => "Switch",
            ChannelKind::Cover => "Cover",
            ChannelKind::Motion => "Motion",
            ChannelKind::Button => "Button",
            ChannelKind::Board => "Board",
        }
    }

    pub fn icon(self) -> Option<&'static str> {
        match self {
            ChannelKind::Motion => Some("mdi:motion-sensor"),
            ChannelKind::Button => Some("mdi:gesture-tap-button"),
            ChannelKind::Board => Some("mdi:developer-board"),
            _ => None,
        }
    }

    /// How many channels of this kind a board exposes.
    ///
    /// Without custom firmware all outputs collapse into the fixed relay bank
    /// and the typed kinds report nothing.
    pub fn count(self, counts: &ChannelCounts, custom_firmware: bool) -> u32 {
        match (self, custom_firmware) {
            (ChannelKind::Board, _) => 1,
            (ChannelKind::Switch, false) => VIRTUAL_RELAYS,
            (_, false) => 0,
            (ChannelKind::Light, true) => counts.lights,
            (ChannelKind::Switch, true) => counts.sockets,
            (ChannelKind::Cover, true) => counts.shutters,
            (ChannelKind::Motion, true) => counts.motion_sensors,
            (ChannelKind::Button, true) => counts.buttons,
        }
    }

    /// Whether the board reports state changes of this kind by push.
    pub fn is_pushed(self) -> bool {
        self.topic().is_some()
    }

    pub fn accepts(self, command: ChannelCommand) -> bool {
        match self {
            ChannelKind::Light | ChannelKind::Switch => {
                matches!(command, ChannelCommand::On | ChannelCommand::Off)
            }
            ChannelKind::Cover => matches!(
                command,
                ChannelCommand::Open
                    | ChannelCommand::Close
                    | ChannelCommand::Stop
                    | ChannelCommand::Position(_)
            ),
            ChannelKind::Motion | ChannelKind::Button | ChannelKind::Board => false,
        }
    }
}

/// Direction a cover is travelling in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum CoverMotion {
    Opening,
    Closing,
}

/// A channel value as read from or pushed by a board.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelValue {
    /// On/off outputs and motion inputs
    State(bool),
    /// Shutter position in percent, with the travel direction when known
    Position {
        position: u8,
        motion: Option<CoverMotion>,
    },
    /// Button press counter
    Counter(u64),
}

impl ChannelValue {
    /// Whether the value has the shape `kind` reports.
    pub fn fits(&self, kind: ChannelKind) -> bool {
        matches!(
            (self, kind),
            (
                ChannelValue::State(_),
                ChannelKind::Light | ChannelKind::Switch | ChannelKind::Motion
            ) | (ChannelValue::Position { .. }, ChannelKind::Cover)
                | (ChannelValue::Counter(_), ChannelKind::Button)
        )
    }
}

impl std::fmt::Display for ChannelValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChannelValue::State(on) => write!(f, "{}", if *on { "on" } else { "off" }),
            ChannelValue::Position {
                position,
                motion: Some(motion),
            } => write!(f, "{}% ({})", position, motion),
            ChannelValue::Position { position, .. } => write!(f, "{}%", position),
            ChannelValue::Counter(count) => write!(f, "#{}", count),
        }
    }
}

/// Output commands sent to a board channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum ChannelCommand {
    On,
    Off,
    Open,
    Close,
    Stop,
    #[strum(to_string = "position {0}")]
    Position(u8),
}
