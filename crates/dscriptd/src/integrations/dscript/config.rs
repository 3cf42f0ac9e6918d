use std::net::IpAddr;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;

use super::mac::MacAddress;

pub const DEFAULT_PORT: u16 = 17123;

/// Wire protocol variant spoken by a board or the event server.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Protocol {
    Modbus,
    Ascii,
    #[default]
    Binary,
    BinaryAes,
}

fn default_listen_ip() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_true() -> bool {
    true
}

fn default_cache_file() -> PathBuf {
    PathBuf::from(".dscriptmodule_cache.json")
}

fn default_setup_retries() -> u32 {
    3
}

fn default_scan_interval() -> u64 {
    30
}

/// One dScript integration instance (`[integrations.dscript.<entry_id>]`).
#[derive(Debug, Clone, Deserialize)]
pub struct DscriptConfig {
    /// Address the built-in event server listens on
    #[serde(default = "default_listen_ip")]
    pub listen_ip: IpAddr,

    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default)]
    pub protocol: Protocol,

    #[serde(default)]
    pub aes_key: String,

    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Known-board cache (MAC -> name, IP)
    #[serde(default = "default_cache_file")]
    pub cache_file: PathBuf,

    /// Deregister entities whose channel disappeared after a config refresh
    #[serde(default = "default_true")]
    pub remove_stale_entities: bool,

    /// Attempts per statically configured board at startup
    #[serde(default = "default_setup_retries")]
    pub setup_retries: u32,

    /// Seconds between poll cycles
    #[serde(default = "default_scan_interval")]
    pub scan_interval_secs: u64,

    /// Statically configured boards
    #[serde(default)]
    pub devices: Vec<DeviceConfig>,

    /// Friendly-name overrides keyed by MAC
    #[serde(default)]
    pub entities: Vec<FriendlyNameConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeviceConfig {
    pub host: IpAddr,

    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default)]
    pub protocol: Protocol,

    #[serde(default)]
    pub aes_key: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FriendlyNameConfig {
    pub mac: String,
    pub name: String,
}

impl Default for DscriptConfig {
    fn default() -> Self {
        Self {
            listen_ip: default_listen_ip(),
            port: default_port(),
            protocol: Protocol::default(),
            aes_key: String::new(),
            enabled: true,
            cache_file: default_cache_file(),
            remove_stale_entities: true,
            setup_retries: default_setup_retries(),
            scan_interval_secs: default_scan_interval(),
            devices: Vec::new(),
            entities: Vec::new(),
        }
    }
}

impl DscriptConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.protocol == Protocol::BinaryAes && self.aes_key.is_empty() {
            return Err("protocol binaryaes requires aes_key".to_string());
        }
        if self.scan_interval_secs == 0 {
            return Err("scan_interval_secs must be at least 1".to_string());
        }
        for device in &self.devices {
            if device.protocol == Protocol::BinaryAes && device.aes_key.is_empty() {
                return Err(format!("device {}: protocol binaryaes requires aes_key", device.host));
            }
        }
        for entity in &self.entities {
            entity
                .mac
                .parse::<MacAddress>()
                .map_err(|e| format!("entities: {}", e))?;
            if entity.name.trim().is_empty() {
                return Err(format!("entities: empty name for {}", entity.mac));
            }
        }
        Ok(())
    }

    pub fn scan_interval(&self) -> Duration {
        Duration::from_secs(self.scan_interval_secs)
    }

    /// User-assigned friendly name for a board, matched by MAC.
    pub fn friendly_name(&self, mac: &MacAddress) -> Option<&str> {
        self.entities
            .iter()
            .find(|e| e.mac.parse::<MacAddress>().is_ok_and(|m| m == *mac))
            .map(|e| e.name.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config: DscriptConfig = toml::from_str("").unwrap();
        assert_eq!(config.listen_ip.to_string(), "0.0.0.0");
        assert_eq!(config.port, 17123);
        assert_eq!(config.protocol, Protocol::Binary);
        assert!(config.enabled);
        assert!(config.remove_stale_entities);
        assert_eq!(config.setup_retries, 3);
        assert_eq!(config.scan_interval(), Duration::from_secs(30));
        assert_eq!(config.cache_file, PathBuf::from(".dscriptmodule_cache.json"));
    }

    #[test]
    fn test_protocol_names() {
        let config: DscriptConfig =
            toml::from_str("protocol = \"binaryaes\"\naes_key = \"k\"").unwrap();
        assert_eq!(config.protocol, Protocol::BinaryAes);
        assert_eq!(Protocol::BinaryAes.to_string(), "binaryaes");
        assert!(toml::from_str::<DscriptConfig>("protocol = \"udp\"").is_err());
    }

    #[test]
    fn test_aes_without_key_is_invalid() {
        let config: DscriptConfig = toml::from_str("protocol = \"binaryaes\"").unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_scan_interval_is_invalid() {
        let config: DscriptConfig = toml::from_str("scan_interval_secs = 0").unwrap();
        assert!(config.validate().is_err());
        let config: DscriptConfig = toml::from_str("scan_interval_secs = 5").unwrap();
        assert_eq!(config.scan_interval(), Duration::from_secs(5));
    }

    #[test]
    fn test_friendly_name_matches_any_mac_format() {
        let config: DscriptConfig = toml::from_str(
            r#"
            [[entities]]
            mac = "aa-bb-cc-dd-ee-f"
            name = "Garage"
            "#,
        )
        .unwrap();
        config.validate().unwrap();

        let mac: MacAddress = "AA:BB:CC:DD:EE:0F".parse().unwrap();
        assert_eq!(config.friendly_name(&mac), Some("Garage"));
        assert_eq!(config.friendly_name(&MacAddress::new([0; 6])), None);
    }
}
