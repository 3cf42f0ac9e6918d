//! Seam to the dScript protocol engine.
//!
//! Framing, encryption and the board state machine belong to a protocol
//! backend. The integration only talks to boards through [`BoardClient`] and
//! receives pushes through an [`EventServer`]. Backends register themselves in
//! [`PROTOCOL_BACKENDS`].

use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;

use async_trait::async_trait;
use linkme::distributed_slice;
use serde::Serialize;

use super::channel::ChannelCommand;
use super::channel::ChannelCounts;
use super::channel::ChannelKind;
use super::channel::ChannelValue;
use super::channel::Topic;
use super::config::Protocol;
use super::error::Result;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FirmwareVersion {
    pub major: u32,
    pub minor: u32,
}

impl fmt::Display for FirmwareVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// Handshake reply of `InitBoard`.
///
/// `mac` is passed through as the board reported it; it is canonicalized by
/// the board registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoardIdentity {
    pub mac: String,
    pub host_name: String,
    pub module_id: String,
    pub system_firmware: FirmwareVersion,
    pub app_firmware: FirmwareVersion,
    pub custom_firmware: bool,
    pub counts: ChannelCounts,
}

/// Health readings returned by `GetStatus`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct BoardStatus {
    pub voltage: Option<f32>,
    pub temperature: Option<f32>,
}

/// Connection to a single board.
#[async_trait]
pub trait BoardClient: Send + Sync {
    /// Configure the key for `binaryaes` connections; called before `init_board`.
    fn set_aes_key(&mut self, key: &str);

    async fn init_board(&self) -> Result<BoardIdentity>;

    async fn get_config(&self) -> Result<ChannelCounts>;

    async fn get_status(&self) -> Result<BoardStatus>;

    async fn get_channel(&self, kind: ChannelKind, index: u32) -> Result<ChannelValue>;

    async fn set_channel(&self, kind: ChannelKind, index: u32, command: ChannelCommand)
        -> Result<()>;
}

/// Opens board connections.
#[async_trait]
pub trait BoardConnector: Send + Sync {
    async fn connect(
        &self,
        ip: IpAddr,
        port: u16,
        protocol: Protocol,
    ) -> Result<Box<dyn BoardClient>>;
}

/// Sender descriptor of a pushed event.
#[derive(Debug, Clone, PartialEq)]
pub struct EventSender {
    /// IP address the event arrived from
    pub sender: IpAddr,
    /// 1-based channel index for state topics
    pub identifier: u32,
    pub topic: Topic,
    /// New channel value, if the event carried one
    pub value: Option<ChannelValue>,
}

/// Callback invoked by the event server from its own execution context.
pub type EventHandler = Arc<dyn Fn(EventSender) + Send + Sync>;

/// Listener that receives pushes from boards.
#[async_trait]
pub trait EventServer: Send + Sync {
    fn set_aes_key(&mut self, key: &str);

    fn add_event_handler(&mut self, topic: Topic, handler: EventHandler);

    async fn start(&self) -> Result<()>;

    async fn stop(&self) -> Result<()>;

    /// Readiness of the listener.
    fn is_running(&self) -> bool;
}

#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub listen_ip: IpAddr,
    pub port: u16,
    pub protocol: Protocol,
}

/// A linked-in protocol engine.
pub struct ProtocolBackend {
    pub name: &'static str,
    pub connector: fn() -> Arc<dyn BoardConnector>,
    pub server: fn(&ServerSettings) -> Box<dyn EventServer>,
}

#[distributed_slice]
pub static PROTOCOL_BACKENDS: [ProtocolBackend];

/// The first linked backend, if any.
pub fn default_backend() -> Option<&'static ProtocolBackend> {
    PROTOCOL_BACKENDS.iter().next()
}

#[cfg(test)]
pub mod mock {
    //! In-memory boards, connector, event server and resolver.

    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::sync::atomic::AtomicBool;
    use std::sync::atomic::AtomicUsize;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    use super::*;
    use crate::integrations::dscript::error::Error;
    use crate::integrations::dscript::mac::AddressResolver;
    use crate::integrations::dscript::mac::MacAddress;

    #[derive(Debug)]
    pub struct MockBoardState {
        pub identity: BoardIdentity,
        pub counts: ChannelCounts,
        pub values: HashMap<(ChannelKind, u32), ChannelValue>,
        pub status: BoardStatus,
        pub reachable: bool,
        pub init_delay: Duration,
        pub commands: Vec<(ChannelKind, u32, ChannelCommand)>,
        pub aes_key: Option<String>,
    }

    /// A simulated board. Clones share state.
    #[derive(Debug, Clone)]
    pub struct MockBoard {
        pub state: Arc<Mutex<MockBoardState>>,
        pub init_calls: Arc<AtomicUsize>,
        pub get_channel_calls: Arc<AtomicUsize>,
    }

    impl MockBoard {
        pub fn new(mac: &str, host_name: &str, counts: ChannelCounts) -> Self {
            Self {
                state: Arc::new(Mutex::new(MockBoardState {
                    identity: BoardIdentity {
                        mac: mac.to_string(),
                        host_name: host_name.to_string(),
                        module_id: "DS2824".to_string(),
                        system_firmware: FirmwareVersion { major: 4, minor: 2 },
                        app_firmware: FirmwareVersion { major: 1, minor: 7 },
                        custom_firmware: true,
                        counts,
                    },
                    counts,
                    values: HashMap::new(),
                    status: BoardStatus {
                        voltage: Some(12.1),
                        temperature: Some(24.5),
                    },
                    reachable: true,
                    init_delay: Duration::ZERO,
                    commands: Vec::new(),
                    aes_key: None,
                })),
                init_calls: Arc::new(AtomicUsize::new(0)),
                get_channel_calls: Arc::new(AtomicUsize::new(0)),
            }
        }

        pub fn with_custom_firmware(self, custom: bool) -> Self {
            self.state.lock().unwrap().identity.custom_firmware = custom;
            self
        }

        pub fn with_init_delay(self, delay: Duration) -> Self {
            self.state.lock().unwrap().init_delay = delay;
            self
        }

        pub fn set_counts(&self, counts: ChannelCounts) {
            self.state.lock().unwrap().counts = counts;
        }

        pub fn set_value(&self, kind: ChannelKind, index: u32, value: ChannelValue) {
            self.state.lock().unwrap().values.insert((kind, index), value);
        }

        pub fn set_reachable(&self, reachable: bool) {
            self.state.lock().unwrap().reachable = reachable;
        }

        pub fn commands(&self) -> Vec<(ChannelKind, u32, ChannelCommand)> {
            self.state.lock().unwrap().commands.clone()
        }

        fn check(&self, ip: IpAddr) -> Result<()> {
            if self.state.lock().unwrap().reachable {
                Ok(())
            } else {
                Err(Error::Timeout(ip))
            }
        }
    }

    pub struct MockClient {
        ip: IpAddr,
        board: MockBoard,
    }

    impl MockClient {
        pub fn new(ip: IpAddr, board: MockBoard) -> Self {
            Self { ip, board }
        }
    }

    #[async_trait]
    impl BoardClient for MockClient {
        fn set_aes_key(&mut self, key: &str) {
            self.board.state.lock().unwrap().aes_key = Some(key.to_string());
        }

        async fn init_board(&self) -> Result<BoardIdentity> {
            self.board.init_calls.fetch_add(1, Ordering::SeqCst);
            let delay = self.board.state.lock().unwrap().init_delay;
            tokio::time::sleep(delay).await;
            self.board.check(self.ip)?;
            let state = self.board.state.lock().unwrap();
            let mut identity = state.identity.clone();
            identity.counts = state.counts;
            Ok(identity)
        }

        async fn get_config(&self) -> Result<ChannelCounts> {
            self.board.check(self.ip)?;
            Ok(self.board.state.lock().unwrap().counts)
        }

        async fn get_status(&self) -> Result<BoardStatus> {
            self.board.check(self.ip)?;
            Ok(self.board.state.lock().unwrap().status)
        }

        async fn get_channel(&self, kind: ChannelKind, index: u32) -> Result<ChannelValue> {
            self.board.get_channel_calls.fetch_add(1, Ordering::SeqCst);
            self.board.check(self.ip)?;
            let state = self.board.state.lock().unwrap();
            Ok(state
                .values
                .get(&(kind, index))
                .copied()
                .unwrap_or(match kind {
                    ChannelKind::Cover => ChannelValue::Position {
                        position: 0,
                        motion: None,
                    },
                    ChannelKind::Button => ChannelValue::Counter(0),
                    _ => ChannelValue::State(false),
                }))
        }

        async fn set_channel(
            &self,
            kind: ChannelKind,
            index: u32,
            command: ChannelCommand,
        ) -> Result<()> {
            self.board.check(self.ip)?;
            self.board
                .state
                .lock()
                .unwrap()
                .commands
                .push((kind, index, command));
            Ok(())
        }
    }

    /// Connects to registered mock boards by IP; anything else is refused.
    #[derive(Default)]
    pub struct MockConnector {
        pub boards: Mutex<HashMap<IpAddr, MockBoard>>,
        pub connects: AtomicUsize,
    }

    impl MockConnector {
        pub fn add(&self, ip: &str, board: MockBoard) {
            self.boards
                .lock()
                .unwrap()
                .insert(ip.parse().unwrap(), board);
        }
    }

    #[async_trait]
    impl BoardConnector for MockConnector {
        async fn connect(
            &self,
            ip: IpAddr,
            _port: u16,
            _protocol: Protocol,
        ) -> Result<Box<dyn BoardClient>> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            let board = self.boards.lock().unwrap().get(&ip).cloned();
            match board {
                Some(board) => Ok(Box::new(MockClient { ip, board })),
                None => Err(Error::Connection(
                    ip,
                    std::io::Error::from(std::io::ErrorKind::ConnectionRefused),
                )),
            }
        }
    }

    /// Event server that lets tests emit pushes.
    #[derive(Clone, Default)]
    pub struct MockEventServer {
        pub handlers: Arc<Mutex<HashMap<Topic, Vec<EventHandler>>>>,
        pub running: Arc<AtomicBool>,
        target: Arc<AtomicBool>,
        /// Readiness checks that still report the old state after start/stop
        pub lag: Arc<AtomicUsize>,
        pub aes_key: Arc<Mutex<Option<String>>>,
    }

    impl MockEventServer {
        pub fn emit(&self, event: EventSender) {
            let handlers = self
                .handlers
                .lock()
                .unwrap()
                .get(&event.topic)
                .cloned()
                .unwrap_or_default();
            for handler in handlers {
                handler(event.clone());
            }
        }
    }

    #[async_trait]
    impl EventServer for MockEventServer {
        fn set_aes_key(&mut self, key: &str) {
            *self.aes_key.lock().unwrap() = Some(key.to_string());
        }

        fn add_event_handler(&mut self, topic: Topic, handler: EventHandler) {
            self.handlers
                .lock()
                .unwrap()
                .entry(topic)
                .or_default()
                .push(handler);
        }

        async fn start(&self) -> Result<()> {
            self.target.store(true, Ordering::SeqCst);
            Ok(())
        }

        async fn stop(&self) -> Result<()> {
            self.target.store(false, Ordering::SeqCst);
            Ok(())
        }

        fn is_running(&self) -> bool {
            let running = self.running.load(Ordering::SeqCst);
            let target = self.target.load(Ordering::SeqCst);
            if running != target
                && self
                    .lag
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                    .is_err()
            {
                self.running.store(target, Ordering::SeqCst);
                return target;
            }
            running
        }
    }

    #[derive(Default)]
    pub struct MockResolver {
        pub table: Mutex<HashMap<IpAddr, MacAddress>>,
        pub lookups: AtomicUsize,
    }

    impl MockResolver {
        pub fn add(&self, ip: &str, mac: &str) {
            self.table
                .lock()
                .unwrap()
                .insert(ip.parse().unwrap(), mac.parse().unwrap());
        }
    }

    impl AddressResolver for MockResolver {
        fn resolve(&self, ip: IpAddr) -> Option<MacAddress> {
            self.lookups.fetch_add(1, Ordering::SeqCst);
            self.table.lock().unwrap().get(&ip).copied()
        }
    }
}
