//! Byte-stream transports
//!
//! The node talks to the outside world only through [`Transport`]: one
//! listener for inbound connections and a fresh outbound stream per send.
//! [`TcpTransport`] is the real network, [`MemoryTransport`] wires nodes
//! together inside one process.

use std::collections::HashMap;
use std::fmt;
use std::future::{self, Future};
use std::io;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream};
use tokio::net::{TcpSocket, TcpStream};
use tokio::sync::mpsc;

/// Pending connection queue of the TCP listener
pub const LISTEN_BACKLOG: u32 = 10;

/// Buffer size of each in-memory pipe; fits several frames so writers never
/// wait on a busy reader
const MEMORY_PIPE_CAPACITY: usize = 16 * 1024;

/// Address without a `:` separator or with an unparsable port
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Invalid address format: {0} (expected host:port)")]
pub struct AddressFormatError(pub String);

/// A parsed `host:port` address
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PeerAddr {
    pub host: String,
    pub port: u16,
}

impl PeerAddr {
    /// Split on the last `:`
    pub fn parse(address: &str) -> Result<Self, AddressFormatError> {
        let (host, port) = address
            .rsplit_once(':')
            .ok_or_else(|| AddressFormatError(address.to_string()))?;
        let port = port
            .trim()
            .parse()
            .map_err(|_| AddressFormatError(address.to_string()))?;
        Ok(Self {
            host: host.to_string(),
            port,
        })
    }
}

impl FromStr for PeerAddr {
    type Err = AddressFormatError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for PeerAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Source of inbound streams
pub trait Listener: Send + 'static {
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    /// Wait for the next inbound connection and a printable remote address
    fn accept(&mut self) -> impl Future<Output = io::Result<(Self::Stream, String)>> + Send;

    /// Port actually bound
    fn local_port(&self) -> u16;
}

/// Connection factory used by the network
pub trait Transport: Clone + Send + Sync + 'static {
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;
    type Listener: Listener<Stream = Self::Stream>;

    /// Start listening for `node_id` on `port`
    fn bind(
        &self,
        node_id: &str,
        port: u16,
    ) -> impl Future<Output = io::Result<Self::Listener>> + Send;

    /// Open a new outbound stream
    fn dial(&self, addr: &PeerAddr) -> impl Future<Output = io::Result<Self::Stream>> + Send;
}

// =============================================================================
// TCP
// =============================================================================

/// Plain TCP sockets
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpTransport;

/// Bound TCP listener
pub struct TcpAcceptor {
    listener: tokio::net::TcpListener,
    port: u16,
}

impl Listener for TcpAcceptor {
    type Stream = TcpStream;

    async fn accept(&mut self) -> io::Result<(TcpStream, String)> {
        let (stream, addr) = self.listener.accept().await?;
        Ok((stream, addr.to_string()))
    }

    fn local_port(&self) -> u16 {
        self.port
    }
}

impl Transport for TcpTransport {
    type Stream = TcpStream;
    type Listener = TcpAcceptor;

    async fn bind(&self, _node_id: &str, port: u16) -> io::Result<TcpAcceptor> {
        let addr = SocketAddr::from(([0, 0, 0, 0], port));
        let socket = TcpSocket::new_v4()?;
        socket.set_reuseaddr(true)?;
        socket.bind(addr)?;
        let listener = socket.listen(LISTEN_BACKLOG)?;
        let port = listener.local_addr()?.port();

        Ok(TcpAcceptor { listener, port })
    }

    async fn dial(&self, addr: &PeerAddr) -> io::Result<TcpStream> {
        TcpStream::connect((addr.host.as_str(), addr.port)).await
    }
}

// =============================================================================
// In-memory
// =============================================================================

type Inbound = (DuplexStream, String);

#[derive(Default)]
struct MemoryHub {
    listeners: HashMap<String, mpsc::UnboundedSender<Inbound>>,
    dials: usize,
}

/// In-process transport: listeners are registered by node id and each dial
/// creates a duplex pipe.
#[derive(Clone, Default)]
pub struct MemoryTransport {
    hub: Arc<Mutex<MemoryHub>>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of dial attempts made so far, including refused ones
    pub fn dial_count(&self) -> usize {
        self.hub.lock().map(|hub| hub.dials).unwrap_or(0)
    }

    /// Whether a live listener is registered for `node_id`
    pub fn is_bound(&self, node_id: &str) -> bool {
        self.hub
            .lock()
            .map(|hub| {
                hub.listeners
                    .get(node_id)
                    .map(|tx| !tx.is_closed())
                    .unwrap_or(false)
            })
            .unwrap_or(false)
    }

    fn register(&self, node_id: &str, port: u16) -> io::Result<MemoryListener> {
        let mut hub = self
            .hub
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "memory hub poisoned"))?;

        if let Some(tx) = hub.listeners.get(node_id) {
            if !tx.is_closed() {
                return Err(io::Error::new(
                    io::ErrorKind::AddrInUse,
                    format!("{} already bound", node_id),
                ));
            }
        }

        let (tx, rx) = mpsc::unbounded_channel();
        hub.listeners.insert(node_id.to_string(), tx);
        Ok(MemoryListener { rx, port })
    }

    fn open_pipe(&self, addr: &PeerAddr) -> io::Result<DuplexStream> {
        let mut hub = self
            .hub
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "memory hub poisoned"))?;
        hub.dials += 1;
        let label = format!("memory-{}", hub.dials);

        let refused = || io::Error::new(io::ErrorKind::ConnectionRefused, addr.to_string());
        let tx = hub.listeners.get(&addr.to_string()).ok_or_else(refused)?;

        let (client, server) = tokio::io::duplex(MEMORY_PIPE_CAPACITY);
        tx.send((server, label)).map_err(|_| refused())?;
        Ok(client)
    }
}

/// Listener side of [`MemoryTransport`]
pub struct MemoryListener {
    rx: mpsc::UnboundedReceiver<Inbound>,
    port: u16,
}

impl Listener for MemoryListener {
    type Stream = DuplexStream;

    async fn accept(&mut self) -> io::Result<(DuplexStream, String)> {
        self.rx
            .recv()
            .await
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "memory listener closed"))
    }

    fn local_port(&self) -> u16 {
        self.port
    }
}

impl Transport for MemoryTransport {
    type Stream = DuplexStream;
    type Listener = MemoryListener;

    fn bind(
        &self,
        node_id: &str,
        port: u16,
    ) -> impl Future<Output = io::Result<MemoryListener>> + Send {
        future::ready(self.register(node_id, port))
    }

    fn dial(&self, addr: &PeerAddr) -> impl Future<Output = io::Result<DuplexStream>> + Send {
        future::ready(self.open_pipe(addr))
    }
}
