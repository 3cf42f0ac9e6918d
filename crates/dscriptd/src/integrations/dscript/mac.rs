//! Board identity: canonical MAC addresses and IP→MAC resolution.

use std::fmt;
use std::net::IpAddr;
use std::path::PathBuf;
use std::str::FromStr;

use serde::Deserialize;
use serde::Deserializer;
use serde::Serialize;
use serde::Serializer;
use tracing::debug;
use tracing::warn;

use super::error::Error;

/// A board MAC address.
///
/// Parsed once where a MAC enters the system; always displayed as
/// uppercase colon-separated pairs (`AA:BB:CC:DD:EE:FF`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MacAddress([u8; 6]);

impl MacAddress {
    pub const fn new(octets: [u8; 6]) -> Self {
        Self(octets)
    }

    pub fn octets(&self) -> [u8; 6] {
        self.0
    }

    /// The all-zero address neighbour tables report for incomplete entries.
    pub fn is_unspecified(&self) -> bool {
        self.0 == [0; 6]
    }

    /// Lowercase hex without separators, as used in unique ids.
    pub fn compact(&self) -> String {
        self.0.iter().map(|b| format!("{:02x}", b)).collect()
    }
}

impl FromStr for MacAddress {
    type Err = Error;

    /// Accepts `:` or `-` separated octets with one or two hex digits each
    /// (protocol replies drop leading zeros), or twelve bare hex digits.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || Error::InvalidMac(s.to_string());
        let trimmed = s.trim();
        let mut octets = [0u8; 6];

        if trimmed.contains(':') || trimmed.contains('-') {
            let parts: Vec<&str> = trimmed.split([':', '-']).collect();
            if parts.len() != 6 {
                return Err(invalid());
            }
            for (octet, part) in octets.iter_mut().zip(parts) {
                if part.is_empty() || part.len() > 2 {
                    return Err(invalid());
                }
                *octet = u8::from_str_radix(part, 16).map_err(|_| invalid())?;
            }
        } else {
            if trimmed.len() != 12 || !trimmed.is_ascii() {
                return Err(invalid());
            }
            for (i, octet) in octets.iter_mut().enumerate() {
                *octet =
                    u8::from_str_radix(&trimmed[i * 2..i * 2 + 2], 16).map_err(|_| invalid())?;
            }
        }

        Ok(Self(octets))
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            a, b, c, d, e, g
        )
    }
}

impl Serialize for MacAddress {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for MacAddress {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Resolves an IP address to the MAC address of the host using it.
///
/// Implementations may block; callers run them on the blocking pool.
pub trait AddressResolver: Send + Sync {
    fn resolve(&self, ip: IpAddr) -> Option<MacAddress>;
}

/// Reads the kernel neighbour table (`/proc/net/arp`).
#[derive(Debug, Clone)]
pub struct ArpTableResolver {
    path: PathBuf,
}

impl Default for ArpTableResolver {
    fn default() -> Self {
        Self {
            path: PathBuf::from("/proc/net/arp"),
        }
    }
}

impl ArpTableResolver {
    pub fn with_path(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

/// Find `ip` in the contents of an ARP table.
///
/// Format: `IP address  HW type  Flags  HW address  Mask  Device`, one header line.
fn parse_arp_table(contents: &str, ip: IpAddr) -> Option<MacAddress> {
    let wanted = ip.to_string();
    contents
        .lines()
        .skip(1)
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            match fields.as_slice() {
                [addr, _, _, hw, ..] if *addr == wanted => hw.parse::<MacAddress>().ok(),
                _ => None,
            }
        })
        .find(|mac| !mac.is_unspecified())
}

impl AddressResolver for ArpTableResolver {
    fn resolve(&self, ip: IpAddr) -> Option<MacAddress> {
        let contents = match std::fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(e) => {
                warn!("Unable to read {}: {}", self.path.display(), e);
                return None;
            }
        };
        let mac = parse_arp_table(&contents, ip);
        debug!("Resolved {} -> {:?}", ip, mac);
        mac
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_pads_short_octets() {
        let mac: MacAddress = "a:bb:c:d:ee:f".parse().unwrap();
        assert_eq!(mac.to_string(), "0A:BB:0C:0D:EE:0F");
        assert_eq!(mac.compact(), "0abb0c0dee0f");
    }

    #[test]
    fn test_parse_separator_variants_agree() {
        let colon: MacAddress = "aa:bb:cc:dd:ee:ff".parse().unwrap();
        let dash: MacAddress = "AA-BB-CC-DD-EE-FF".parse().unwrap();
        let bare: MacAddress = "aabbccddeeff".parse().unwrap();
        assert_eq!(colon, dash);
        assert_eq!(colon, bare);
        assert_eq!(colon.to_string(), "AA:BB:CC:DD:EE:FF");
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!("".parse::<MacAddress>().is_err());
        assert!("aa:bb:cc:dd:ee".parse::<MacAddress>().is_err());
        assert!("aa:bb:cc:dd:ee:fff".parse::<MacAddress>().is_err());
        assert!("zz:bb:cc:dd:ee:ff".parse::<MacAddress>().is_err());
        assert!("aabbccddeef".parse::<MacAddress>().is_err());
    }

    #[test]
    fn test_serde_uses_canonical_form() {
        let mac: MacAddress = serde_json::from_str(r#""a:b:c:d:e:f""#).unwrap();
        assert_eq!(
            serde_json::to_string(&mac).unwrap(),
            r#""0A:0B:0C:0D:0E:0F""#
        );
    }

    #[test]
    fn test_parse_arp_table() {
        let table = "\
IP address       HW type     Flags       HW address            Mask     Device
10.0.0.5         0x1         0x2         aa:bb:cc:dd:ee:ff     *        eth0
10.0.0.6         0x1         0x0         00:00:00:00:00:00     *        eth0
";
        assert_eq!(
            parse_arp_table(table, "10.0.0.5".parse().unwrap()),
            Some("AA:BB:CC:DD:EE:FF".parse().unwrap())
        );
        assert_eq!(parse_arp_table(table, "10.0.0.6".parse().unwrap()), None);
        assert_eq!(parse_arp_table(table, "10.0.0.7".parse().unwrap()), None);
    }

    #[test]
    fn test_arp_resolver_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("arp");
        std::fs::write(
            &path,
            "IP address HW type Flags HW address Mask Device\n10.0.0.9 0x1 0x2 1:2:3:4:5:6 * eth0\n",
        )
        .unwrap();

        let resolver = ArpTableResolver::with_path(&path);
        assert_eq!(
            resolver.resolve("10.0.0.9".parse().unwrap()),
            Some(MacAddress::new([1, 2, 3, 4, 5, 6]))
        );
    }
}
