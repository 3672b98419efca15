use std::io::BufWriter;
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::time::Duration;

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use super::{Connector, DEFAULT_READ_BUFFER, IoStream, Stream};
use crate::error::BeamError;

/// Socket settings for the TCP link to the scan engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    pub host: String,
    pub port: u16,
    /// Timeout for establishing the TCP connection
    #[serde(with = "duration_secs")]
    pub connect_timeout: Duration,
    /// Timeout for a single socket read; long scans stream continuously so
    /// this only needs to cover the gap between chunks
    #[serde(with = "duration_secs")]
    pub read_timeout: Duration,
    #[serde(with = "duration_secs")]
    pub write_timeout: Duration,
    /// Upper bound on bytes held while searching for a sync sentinel
    pub read_buffer: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 2017,
            connect_timeout: Duration::from_secs(5),
            read_timeout: Duration::from_secs(10),
            write_timeout: Duration::from_secs(5),
            read_buffer: DEFAULT_READ_BUFFER,
        }
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}

/// Builder for [`TcpConnector`].
///
/// ```no_run
/// use std::time::Duration;
/// use rusty_beam::TcpConnector;
///
/// let connector = TcpConnector::builder()
///     .address("192.168.1.100")
///     .port(2017)
///     .read_timeout(Duration::from_secs(30))
///     .build()?;
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// ```
#[derive(Default)]
pub struct TcpConnectorBuilder {
    address: Option<String>,
    port: Option<u16>,
    config: ConnectionConfig,
}

impl TcpConnectorBuilder {
    pub fn address(mut self, addr: &str) -> Self {
        self.address = Some(addr.to_string());
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// Set the full connection configuration
    pub fn config(mut self, config: ConnectionConfig) -> Self {
        self.config = config;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = timeout;
        self
    }

    pub fn read_timeout(mut self, timeout: Duration) -> Self {
        self.config.read_timeout = timeout;
        self
    }

    pub fn write_timeout(mut self, timeout: Duration) -> Self {
        self.config.write_timeout = timeout;
        self
    }

    pub fn read_buffer(mut self, bytes: usize) -> Self {
        self.config.read_buffer = bytes;
        self
    }

    /// Resolve the address. No connection is made until [`Connector::connect`].
    pub fn build(mut self) -> Result<TcpConnector, BeamError> {
        if let Some(address) = self.address {
            self.config.host = address;
        }
        if let Some(port) = self.port {
            self.config.port = port;
        }
        let host = &self.config.host;
        let peer = (host.as_str(), self.config.port)
            .to_socket_addrs()
            .map_err(|_| BeamError::InvalidAddress(format!("{host}:{}", self.config.port)))?
            .next()
            .ok_or_else(|| BeamError::InvalidAddress(host.clone()))?;
        Ok(TcpConnector {
            peer,
            config: self.config,
        })
    }
}

/// Connects to the scan engine's TCP bridge.
pub struct TcpConnector {
    peer: SocketAddr,
    config: ConnectionConfig,
}

impl TcpConnector {
    pub fn new(addr: &str, port: u16) -> Result<Self, BeamError> {
        Self::builder().address(addr).port(port).build()
    }

    pub fn builder() -> TcpConnectorBuilder {
        TcpConnectorBuilder::default()
    }

    pub fn from_config(config: ConnectionConfig) -> Result<Self, BeamError> {
        Self::builder().config(config).build()
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }
}

impl Connector for TcpConnector {
    fn connect(&mut self) -> Result<Box<dyn Stream>, BeamError> {
        debug!("Connecting to scan engine at {}", self.peer);
        let socket = TcpStream::connect_timeout(&self.peer, self.config.connect_timeout)
            .map_err(|e| {
                warn!("Failed to connect to {}: {e}", self.peer);
                BeamError::io(e, format!("Failed to connect to {}", self.peer))
            })?;
        socket
            .set_read_timeout(Some(self.config.read_timeout))
            .map_err(|e| BeamError::io(e, "setting read timeout"))?;
        socket
            .set_write_timeout(Some(self.config.write_timeout))
            .map_err(|e| BeamError::io(e, "setting write timeout"))?;
        socket
            .set_nodelay(true)
            .map_err(|e| BeamError::io(e, "disabling Nagle"))?;
        let writer = socket
            .try_clone()
            .map_err(|e| BeamError::io(e, "cloning socket"))?;
        info!("Connected to scan engine at {}", self.peer);
        Ok(Box::new(IoStream::new(
            BufWriter::new(writer),
            socket,
            self.config.read_buffer,
        )))
    }

    fn describe(&self) -> String {
        format!("tcp://{}", self.peer)
    }
}
