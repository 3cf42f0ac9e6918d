use std::net::IpAddr;
use std::sync::Arc;
use std::sync::RwLock;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

use tracing::debug;
use tracing::warn;

use super::DOMAIN;
use super::MANUFACTURER;
use super::channel::ChannelCounts;
use super::channel::ChannelKind;
use super::config::Protocol;
use super::error::Result;
use super::mac::MacAddress;
use super::probe::StatusProbe;
use super::protocol::BoardClient;
use super::protocol::BoardIdentity;
use super::protocol::BoardStatus;
use crate::engine::Device;

/// A known board: the protocol client plus integration-local bookkeeping.
pub struct Board {
    mac: MacAddress,
    client: Arc<dyn BoardClient>,
    probe: Arc<dyn StatusProbe>,
    identity: BoardIdentity,
    port: u16,
    protocol: Protocol,
    friendly_name: String,
    ip: RwLock<IpAddr>,
    available: AtomicBool,
    counts: RwLock<ChannelCounts>,
    status: RwLock<Option<BoardStatus>>,
}

impl std::fmt::Debug for Board {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Board")
            .field("mac", &self.mac)
            .field("ip", &self.ip())
            .field("friendly_name", &self.friendly_name)
            .field("available", &self.available())
            .finish()
    }
}

pub struct BoardParams {
    pub mac: MacAddress,
    pub ip: IpAddr,
    pub port: u16,
    pub protocol: Protocol,
    pub friendly_name: String,
    pub identity: BoardIdentity,
}

impl Board {
    /// A freshly initialized board; available until a health check says otherwise.
    pub fn new(
        params: BoardParams,
        client: Arc<dyn BoardClient>,
        probe: Arc<dyn StatusProbe>,
    ) -> Self {
        let counts = params.identity.counts;
        Self {
            mac: params.mac,
            client,
            probe,
            identity: params.identity,
            port: params.port,
            protocol: params.protocol,
            friendly_name: params.friendly_name,
            ip: RwLock::new(params.ip),
            available: AtomicBool::new(true),
            counts: RwLock::new(counts),
            status: RwLock::new(None),
        }
    }

    pub fn mac(&self) -> MacAddress {
        self.mac
    }

    pub fn ip(&self) -> IpAddr {
        self.ip.read().map(|ip| *ip).unwrap_or(IpAddr::from([0, 0, 0, 0]))
    }

    /// Boards may move between addresses (DHCP); the MAC stays the identity.
    pub fn set_ip(&self, ip: IpAddr) {
        if let Ok(mut current) = self.ip.write() {
            if *current != ip {
                debug!("{}: address changed {} -> {}", self.mac, current, ip);
                *current = ip;
            }
        }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    pub fn friendly_name(&self) -> &str {
        &self.friendly_name
    }

    pub fn identity(&self) -> &BoardIdentity {
        &self.identity
    }

    pub fn custom_firmware(&self) -> bool {
        self.identity.custom_firmware
    }

    pub fn client(&self) -> &Arc<dyn BoardClient> {
        &self.client
    }

    pub fn available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    /// Returns whether the availability changed.
    pub fn set_available(&self, available: bool) -> bool {
        let previous = self.available.swap(available, Ordering::SeqCst);
        if previous != available {
            debug!("{}: available {} -> {}", self.friendly_name, previous, available);
        }
        previous != available
    }

    pub fn counts(&self) -> ChannelCounts {
        self.counts.read().map(|c| *c).unwrap_or_default()
    }

    /// Number of channels of `kind` in the last reported config.
    pub fn count(&self, kind: ChannelKind) -> u32 {
        kind.count(&self.counts(), self.custom_firmware())
    }

    /// Fetch `GetConfig` and store the new counts. Returns `(before, after)`.
    pub async fn refresh_counts(&self) -> Result<(ChannelCounts, ChannelCounts)> {
        let before = self.counts();
        let after = self.client.get_config().await?;
        if let Ok(mut counts) = self.counts.write() {
            *counts = after;
        }
        Ok((before, after))
    }

    pub fn status(&self) -> Option<BoardStatus> {
        self.status.read().ok().and_then(|s| *s)
    }

    /// Fetch `GetStatus` and keep the readings.
    pub async fn refresh_status(&self) -> Result<BoardStatus> {
        let status = self.client.get_status().await?;
        if let Ok(mut current) = self.status.write() {
            *current = Some(status);
        }
        Ok(status)
    }

    /// Probe the board's web interface and update availability from the result.
    pub async fn probe_http(&self) -> u16 {
        let code = self.probe.probe(self.ip()).await;
        if code != 200 {
            warn!("{} ({}): web interface answered {}", self.friendly_name, self.ip(), code);
        }
        self.set_available(code == 200);
        code
    }

    /// Health check through the protocol; a failure marks the board unavailable.
    pub async fn heartbeat(&self) -> bool {
        match self.refresh_status().await {
            Ok(_) => {
                self.set_available(true);
                true
            }
            Err(e) => {
                warn!("{} ({}): heartbeat failed: {}", self.friendly_name, self.ip(), e);
                self.set_available(false);
                false
            }
        }
    }

    /// Device registry entry grouping this board's entities.
    pub fn device(&self) -> Device {
        let mac = self.mac.to_string();
        let mut device = Device::new(mac.clone(), self.friendly_name.clone());
        device.identifiers = vec![(DOMAIN.to_string(), mac)];
        device.manufacturer = Some(MANUFACTURER.to_string());
        device.model = Some(self.identity.module_id.clone());
        device.sw_version = Some(self.identity.app_firmware.to_string());
        device.configuration_url = Some(format!("http://{}/index.htm", self.ip()));
        device.suggested_area = self
            .friendly_name
            .rsplit('_')
            .next()
            .map(str::to_string);
        device
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::integrations::dscript::probe::mock::MockProbe;

    /// A board backed by a mock client, without going through a registry.
    pub fn board(
        name: &str,
        ip: &str,
        mock: &crate::integrations::dscript::protocol::mock::MockBoard,
    ) -> Arc<Board> {
        let identity = mock.state.lock().unwrap().identity.clone();
        let client = crate::integrations::dscript::protocol::mock::MockClient::new(
            ip.parse().unwrap(),
            mock.clone(),
        );
        Arc::new(Board::new(
            BoardParams {
                mac: identity.mac.parse().unwrap(),
                ip: ip.parse().unwrap(),
                port: 17123,
                protocol: Protocol::Binary,
                friendly_name: name.to_string(),
                identity: BoardIdentity {
                    counts: mock.state.lock().unwrap().counts,
                    ..identity
                },
            },
            Arc::new(client),
            Arc::new(MockProbe::default()),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::board;
    use super::*;
    use crate::integrations::dscript::protocol::mock::MockBoard;

    fn counts(lights: u32) -> ChannelCounts {
        ChannelCounts {
            lights,
            ..Default::default()
        }
    }

    #[test]
    fn test_device_info() {
        let mock = MockBoard::new("a:bb:cc:dd:ee:ff", "ds1", counts(2));
        let board = board("Home_Office", "10.0.0.5", &mock);
        let device = board.device();

        assert_eq!(device.id, "0A:BB:CC:DD:EE:FF");
        assert_eq!(
            device.identifiers,
            vec![("dscriptmodule".to_string(), "0A:BB:CC:DD:EE:FF".to_string())]
        );
        assert_eq!(device.manufacturer.as_deref(), Some("Devantech"));
        assert_eq!(device.sw_version.as_deref(), Some("1.7"));
        assert_eq!(
            device.configuration_url.as_deref(),
            Some("http://10.0.0.5/index.htm")
        );
        assert_eq!(device.suggested_area.as_deref(), Some("Office"));
    }

    #[tokio::test]
    async fn test_refresh_counts_reports_before_and_after() {
        let mock = MockBoard::new("aa:bb:cc:dd:ee:ff", "ds1", counts(2));
        let board = board("Office", "10.0.0.5", &mock);
        mock.set_counts(counts(3));

        let (before, after) = board.refresh_counts().await.unwrap();
        assert_eq!(before.lights, 2);
        assert_eq!(after.lights, 3);
        assert_eq!(board.count(ChannelKind::Light), 3);
    }

    #[tokio::test]
    async fn test_heartbeat_tracks_reachability() {
        let mock = MockBoard::new("aa:bb:cc:dd:ee:ff", "ds1", counts(1));
        let board = board("Office", "10.0.0.5", &mock);

        mock.set_reachable(false);
        assert!(!board.heartbeat().await);
        assert!(!board.available());

        mock.set_reachable(true);
        assert!(board.heartbeat().await);
        assert!(board.available());
        assert_eq!(board.status().unwrap().voltage, Some(12.1));
    }
}
