//! P2P network facade
//!
//! The context value every component shares: configuration, the transport,
//! the peer directory and the message handler. Outbound operations (`send`,
//! `broadcast`, `connect`) live here, as does the work queue that executes the
//! tasks planned by the discovery engine.

use crate::network::discovery::{DiscoveryEngine, Task, ANNOUNCE_TTL};
use crate::network::message::{
    CodecError, DiscoveryMessage, Frame, Message, MessageHandler, DISCOVERY_TYPE,
};
use crate::network::peer::{Peer, PeerDirectory};
use crate::network::server::{Server, WireCodec};
use crate::network::transport::{AddressFormatError, PeerAddr, TcpTransport, Transport};
use futures::sink::{Sink, SinkExt};
use std::collections::VecDeque;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio_util::codec::FramedWrite;

/// Network errors
#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("IO error: {0}")]
    Transport(#[from] io::Error),
    #[error(transparent)]
    AddressFormat(#[from] AddressFormatError),
    #[error("Protocol error: {0}")]
    Protocol(#[from] CodecError),
    #[error("Message type {0:?} is reserved for discovery")]
    ReservedType(String),
    #[error("Failed to bind to port {port}: {source}")]
    Bind {
        port: u16,
        #[source]
        source: io::Error,
    },
}

/// P2P node configuration
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// This node's `host:port`; names the peer file and fills the sender field
    pub node_id: String,
    /// Port to listen on
    pub port: u16,
    /// Directory holding the peer file
    pub data_dir: PathBuf,
    /// TTL of announcements sent by `connect`
    pub announce_ttl: i32,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: "127.0.0.1:1248".to_string(),
            port: 1248,
            data_dir: PathBuf::from("."),
            announce_ttl: ANNOUNCE_TTL,
        }
    }
}

impl NodeConfig {
    /// Use `address` as the node id and listen on its port
    pub fn from_address(address: &str) -> Result<Self, AddressFormatError> {
        let addr = PeerAddr::parse(address)?;
        Ok(Self {
            node_id: address.to_string(),
            port: addr.port,
            ..Default::default()
        })
    }
}

struct Inner<T> {
    config: NodeConfig,
    transport: T,
    /// Single writer: every mutation takes the write lock
    directory: RwLock<PeerDirectory>,
    engine: DiscoveryEngine,
    handler: Box<dyn MessageHandler>,
}

/// Handle to a running node; cheap to clone
pub struct Network<T: Transport = TcpTransport> {
    inner: Arc<Inner<T>>,
}

impl<T: Transport> Clone for Network<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Transport> Network<T> {
    /// Create the network and bootstrap from the saved peer file.
    ///
    /// Every saved peer is connected to before this returns, which is before
    /// the server is started.
    pub async fn create(
        config: NodeConfig,
        transport: T,
        handler: impl MessageHandler + 'static,
    ) -> Self {
        let mut directory = PeerDirectory::new(&config.data_dir);
        let loaded = directory.load_from_file(&config.node_id);
        let saved = directory.addresses();
        let engine =
            DiscoveryEngine::with_announce_ttl(config.node_id.as_str(), config.announce_ttl);

        let network = Self {
            inner: Arc::new(Inner {
                config,
                transport,
                directory: RwLock::new(directory),
                engine,
                handler: Box::new(handler),
            }),
        };

        if loaded > 0 {
            log::info!("Reconnecting to {} saved peers", loaded);
        }
        for address in &saved {
            if let Err(e) = network.connect(address).await {
                log::warn!("Bootstrap connect to {} failed: {}", address, e);
            }
        }

        network
    }

    pub fn node_id(&self) -> &str {
        &self.inner.config.node_id
    }

    pub fn config(&self) -> &NodeConfig {
        &self.inner.config
    }

    pub fn handler(&self) -> &dyn MessageHandler {
        self.inner.handler.as_ref()
    }

    /// Bind the listener and spawn the accept loop
    pub async fn start(&self) -> Result<ServerHandle, NetworkError> {
        let config = &self.inner.config;
        let server = Server::bind(&self.inner.transport, &config.node_id, config.port).await?;
        let port = server.port();

        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>(1);
        let task = tokio::spawn(server.run(self.clone(), shutdown_rx));
        log::info!("Node {} started", config.node_id);

        Ok(ServerHandle {
            port,
            shutdown_tx,
            task,
        })
    }

    /// Send one application message on a fresh connection.
    ///
    /// A type that reads as `DISCOVERY` on the wire is refused before dialing;
    /// the receiver would classify the frame as discovery and drop it.
    pub async fn send(
        &self,
        address: &str,
        msg_type: &str,
        payload: &str,
    ) -> Result<(), NetworkError> {
        if msg_type.trim() == DISCOVERY_TYPE {
            return Err(NetworkError::ReservedType(msg_type.to_string()));
        }
        let msg = Message::new(msg_type, self.node_id(), payload);
        self.deliver(address, Frame::Message(msg)).await?;
        log::info!("Sent {} to {}", msg_type, address);
        Ok(())
    }

    /// Send one discovery message on a fresh connection; the reply is not read
    pub async fn send_discovery(
        &self,
        address: &str,
        ttl: i32,
        peer_list: &str,
    ) -> Result<(), NetworkError> {
        let msg = DiscoveryMessage::new(self.node_id(), ttl, peer_list);
        self.deliver(address, Frame::Discovery(msg)).await
    }

    /// Send to every known peer, returning how many sends succeeded
    pub async fn broadcast(&self, msg_type: &str, payload: &str) -> usize {
        let addresses = self.inner.directory.read().await.addresses();

        let mut sent = 0;
        for address in &addresses {
            match self.send(address, msg_type, payload).await {
                Ok(()) => sent += 1,
                Err(e) => log::warn!("Failed to send {} to {}: {}", msg_type, address, e),
            }
        }

        log::info!("Broadcast {} to {} peers", msg_type, sent);
        sent
    }

    /// Add `address` and announce ourselves to every known peer.
    ///
    /// Returns the number of announcements delivered.
    pub async fn connect(&self, address: &str) -> Result<usize, NetworkError> {
        PeerAddr::parse(address)?;
        let queue = VecDeque::from([Task::Connect(address.to_string())]);
        Ok(self
            .run_queue(queue, None::<&mut FramedWrite<T::Stream, WireCodec>>)
            .await)
    }

    /// Snapshot of the known peers
    pub async fn peers(&self) -> Vec<Peer> {
        self.inner.directory.read().await.list().to_vec()
    }

    pub async fn peer_count(&self) -> usize {
        self.inner.directory.read().await.count()
    }

    pub async fn has_peer(&self, address: &str) -> bool {
        self.inner.directory.read().await.find(address).is_some()
    }

    /// Merge an inbound discovery message under the directory write lock
    pub(crate) async fn plan_discovery(&self, msg: &DiscoveryMessage) -> VecDeque<Task> {
        let mut directory = self.inner.directory.write().await;
        self.inner.engine.handle(&mut directory, msg)
    }

    /// Execute tasks in order until the queue is empty.
    ///
    /// A connect expands into sends that run before the rest of the queue, the
    /// order a recursive call would give. Replies go to `reply` when present.
    /// Returns the number of discovery messages delivered.
    pub(crate) async fn run_queue<W>(
        &self,
        mut queue: VecDeque<Task>,
        mut reply: Option<&mut W>,
    ) -> usize
    where
        W: Sink<Frame, Error = io::Error> + Unpin + Send,
    {
        let mut delivered = 0;

        while let Some(task) = queue.pop_front() {
            match task {
                Task::Connect(address) => {
                    log::info!("Connecting to: {}", address);
                    let sends = {
                        let mut directory = self.inner.directory.write().await;
                        self.inner.engine.plan_connect(&mut directory, &address)
                    };
                    for send in sends.into_iter().rev() {
                        queue.push_front(send);
                    }
                }
                Task::SendDiscovery { to, message } => {
                    match self.deliver(&to, Frame::Discovery(message)).await {
                        Ok(()) => delivered += 1,
                        Err(e) => log::warn!("Failed to send discovery to {}: {}", to, e),
                    }
                }
                Task::Reply(message) => match reply.as_deref_mut() {
                    Some(sink) => {
                        if let Err(e) = sink.send(Frame::Discovery(message)).await {
                            log::debug!("Discovery reply not delivered: {}", e);
                        }
                    }
                    None => log::debug!("No inbound connection to reply on"),
                },
            }
        }

        delivered
    }

    /// Open a connection, write one frame, close
    async fn deliver(&self, address: &str, frame: Frame) -> Result<(), NetworkError> {
        let addr = PeerAddr::parse(address)?;
        let stream = self.inner.transport.dial(&addr).await?;

        let mut writer = FramedWrite::new(stream, WireCodec);
        writer.send(frame).await?;
        writer.close().await?;

        Ok(())
    }
}

/// Running accept loop
pub struct ServerHandle {
    port: u16,
    shutdown_tx: mpsc::Sender<()>,
    task: JoinHandle<()>,
}

impl ServerHandle {
    /// Port actually bound
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Stop accepting; waits for the connection in progress to finish
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(()).await;
        if let Err(e) = self.task.await {
            log::warn!("Server task ended abnormally: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::transport::{Listener, MemoryTransport};
    use futures::stream::StreamExt;
    use std::path::Path;
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::io::{AsyncWriteExt, DuplexStream};
    use tokio_util::codec::Framed;

    const WAIT: Duration = Duration::from_secs(5);

    #[derive(Clone, Default)]
    struct Recorder(Arc<Mutex<Vec<Message>>>);

    impl MessageHandler for Recorder {
        fn handle(&self, message: &Message) {
            self.0.lock().unwrap().push(message.clone());
        }
    }

    impl Recorder {
        fn len(&self) -> usize {
            self.0.lock().unwrap().len()
        }
    }

    fn config(node_id: &str, dir: &Path) -> NodeConfig {
        NodeConfig {
            data_dir: dir.to_path_buf(),
            ..NodeConfig::from_address(node_id).unwrap()
        }
    }

    fn ignore(_: &Message) {}

    async fn memory_node(
        node_id: &str,
        dir: &Path,
        transport: &MemoryTransport,
    ) -> Network<MemoryTransport> {
        Network::create(config(node_id, dir), transport.clone(), ignore).await
    }

    async fn wait_for_peer<T: Transport>(network: &Network<T>, address: &str) -> bool {
        for _ in 0..500 {
            if network.has_peer(address).await {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    async fn wait_for_messages(recorder: &Recorder, count: usize) -> bool {
        for _ in 0..500 {
            if recorder.len() >= count {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    async fn dial(transport: &MemoryTransport, address: &str) -> Framed<DuplexStream, WireCodec> {
        let stream = transport
            .dial(&PeerAddr::parse(address).unwrap())
            .await
            .unwrap();
        Framed::new(stream, WireCodec)
    }

    async fn next_discovery<L: Listener>(listener: &mut L) -> DiscoveryMessage {
        let (stream, _) = tokio::time::timeout(WAIT, listener.accept())
            .await
            .unwrap()
            .unwrap();
        let mut framed = Framed::new(stream, WireCodec);
        match framed.next().await {
            Some(Ok(Frame::Discovery(msg))) => msg,
            other => panic!("Expected discovery frame, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_node_creation() {
        let temp_dir = tempfile::tempdir().unwrap();
        let transport = MemoryTransport::new();
        let node = memory_node("node-a:9000", temp_dir.path(), &transport).await;

        assert_eq!(node.node_id(), "node-a:9000");
        assert_eq!(node.config().port, 9000);
        assert_eq!(node.peer_count().await, 0);
        assert!(!transport.is_bound("node-a:9000"));
    }

    #[tokio::test]
    async fn test_connect_registers_both_sides() {
        let temp_dir = tempfile::tempdir().unwrap();
        let transport = MemoryTransport::new();
        let a = memory_node("node-a:9000", temp_dir.path(), &transport).await;
        let b = memory_node("node-b:9000", temp_dir.path(), &transport).await;
        let _server_a = a.start().await.unwrap();
        let _server_b = b.start().await.unwrap();

        assert_eq!(a.connect("node-b:9000").await.unwrap(), 1);

        assert!(a.has_peer("node-b:9000").await);
        assert!(wait_for_peer(&b, "node-a:9000").await);
    }

    #[tokio::test]
    async fn test_multi_hop_discovery() {
        let temp_dir = tempfile::tempdir().unwrap();
        let transport = MemoryTransport::new();
        let a = memory_node("node-a:9000", temp_dir.path(), &transport).await;
        let b = memory_node("node-b:9000", temp_dir.path(), &transport).await;
        let c = memory_node("node-c:9000", temp_dir.path(), &transport).await;
        let _servers = (
            a.start().await.unwrap(),
            b.start().await.unwrap(),
            c.start().await.unwrap(),
        );

        // Line topology B-C, then A joins through B
        b.connect("node-c:9000").await.unwrap();
        assert!(wait_for_peer(&c, "node-b:9000").await);

        a.connect("node-b:9000").await.unwrap();
        assert!(wait_for_peer(&c, "node-a:9000").await);
        assert!(wait_for_peer(&a, "node-c:9000").await);
    }

    #[tokio::test]
    async fn test_send_bad_address_opens_no_socket() {
        let temp_dir = tempfile::tempdir().unwrap();
        let transport = MemoryTransport::new();
        let a = memory_node("node-a:9000", temp_dir.path(), &transport).await;

        let err = a.send("badaddress", "PING", "x").await.unwrap_err();
        assert!(matches!(err, NetworkError::AddressFormat(_)));

        let err = a.connect("badaddress").await.unwrap_err();
        assert!(matches!(err, NetworkError::AddressFormat(_)));

        assert_eq!(transport.dial_count(), 0);
        assert_eq!(a.peer_count().await, 0);
    }

    #[tokio::test]
    async fn test_send_rejects_discovery_type() {
        let temp_dir = tempfile::tempdir().unwrap();
        let transport = MemoryTransport::new();
        let a = memory_node("node-a:9000", temp_dir.path(), &transport).await;
        let b = memory_node("node-b:9000", temp_dir.path(), &transport).await;
        let _server = b.start().await.unwrap();

        for msg_type in ["DISCOVERY", " DISCOVERY "] {
            let err = a.send("node-b:9000", msg_type, "x").await.unwrap_err();
            assert!(matches!(err, NetworkError::ReservedType(_)));
        }
        assert_eq!(transport.dial_count(), 0);

        a.send("node-b:9000", "DISCOVER", "x").await.unwrap();
        assert_eq!(transport.dial_count(), 1);
    }

    #[tokio::test]
    async fn test_bootstrap_reconnects_before_listening() {
        let temp_dir = tempfile::tempdir().unwrap();
        let transport = MemoryTransport::new();
        let cfg = config("node-d:9000", temp_dir.path());
        std::fs::write(
            PeerDirectory::new(temp_dir.path()).peer_file(&cfg.node_id),
            "peer-1:1\npeer-2:2\n",
        )
        .unwrap();

        let mut peer_1 = transport.bind("peer-1:1", 1).await.unwrap();
        let mut peer_2 = transport.bind("peer-2:2", 2).await.unwrap();

        let node = Network::create(cfg, transport.clone(), ignore).await;

        assert!(!transport.is_bound("node-d:9000"));
        assert_eq!(node.peer_count().await, 2);
        // Two connects, each announcing to both saved peers
        assert_eq!(transport.dial_count(), 4);

        for listener in [&mut peer_1, &mut peer_2] {
            for _ in 0..2 {
                let msg = next_discovery(listener).await;
                assert_eq!(msg.sender, "node-d:9000");
                assert_eq!(msg.ttl, ANNOUNCE_TTL);
                assert_eq!(msg.peer_list, "peer-1:1,peer-2:2");
            }
        }
    }

    #[tokio::test]
    async fn test_forward_decrements_ttl_and_skips_sender() {
        let temp_dir = tempfile::tempdir().unwrap();
        let transport = MemoryTransport::new();
        let mut spy = transport.bind("spy:1", 1).await.unwrap();
        let mut origin = transport.bind("origin:1", 1).await.unwrap();

        let b = memory_node("node-b:9000", temp_dir.path(), &transport).await;
        let _server = b.start().await.unwrap();
        b.connect("spy:1").await.unwrap();
        next_discovery(&mut spy).await;

        // ttl 1: reply with ttl 0, no flood
        let mut conn = dial(&transport, "node-b:9000").await;
        conn.send(Frame::Discovery(DiscoveryMessage::new("origin:1", 1, "")))
            .await
            .unwrap();
        match conn.next().await {
            Some(Ok(Frame::Discovery(reply))) => {
                assert_eq!(reply.ttl, 0);
                assert_eq!(reply.sender, "node-b:9000");
            }
            other => panic!("Expected reply, got {:?}", other),
        }

        // ttl 3: reply with ttl 2 and a flood with ttl 2 to everyone but origin
        let mut conn = dial(&transport, "node-b:9000").await;
        conn.send(Frame::Discovery(DiscoveryMessage::new("origin:1", 3, "")))
            .await
            .unwrap();
        match conn.next().await {
            Some(Ok(Frame::Discovery(reply))) => assert_eq!(reply.ttl, 2),
            other => panic!("Expected reply, got {:?}", other),
        }

        let flooded = next_discovery(&mut spy).await;
        assert_eq!(flooded.ttl, 2);
        assert_eq!(flooded.sender, "node-b:9000");
        assert_eq!(flooded.peer_list, "spy:1,origin:1");

        let nothing = tokio::time::timeout(Duration::from_millis(100), origin.accept()).await;
        assert!(nothing.is_err(), "flood must not go back to its sender");
    }

    #[tokio::test]
    async fn test_regular_message_reaches_handler() {
        let temp_dir = tempfile::tempdir().unwrap();
        let transport = MemoryTransport::new();
        let recorder = Recorder::default();
        let a = memory_node("node-a:9000", temp_dir.path(), &transport).await;
        let b = Network::create(
            config("node-b:9000", temp_dir.path()),
            transport.clone(),
            recorder.clone(),
        )
        .await;
        let _server = b.start().await.unwrap();

        a.send("node-b:9000", "PING", "hello").await.unwrap();
        assert!(wait_for_messages(&recorder, 1).await);

        let received = recorder.0.lock().unwrap()[0].clone();
        assert_eq!(received, Message::new("PING", "node-a:9000", "hello"));
        // Regular messages never touch the directory
        assert_eq!(b.peer_count().await, 0);
    }

    #[tokio::test]
    async fn test_short_frame_is_dropped() {
        let temp_dir = tempfile::tempdir().unwrap();
        let transport = MemoryTransport::new();
        let recorder = Recorder::default();
        let b = Network::create(
            config("node-b:9000", temp_dir.path()),
            transport.clone(),
            recorder.clone(),
        )
        .await;
        let _server = b.start().await.unwrap();

        let mut raw = dial(&transport, "node-b:9000").await.into_inner();
        raw.write_all(&[b'P'; 10]).await.unwrap();
        drop(raw);

        b.send("node-b:9000", "PING", "after").await.unwrap();
        assert!(wait_for_messages(&recorder, 1).await);
        assert_eq!(recorder.0.lock().unwrap()[0].payload, "after");
    }

    #[tokio::test]
    async fn test_broadcast_counts_successes() {
        let temp_dir = tempfile::tempdir().unwrap();
        let transport = MemoryTransport::new();
        let recorder = Recorder::default();
        let a = memory_node("node-a:9000", temp_dir.path(), &transport).await;
        let b = Network::create(
            config("node-b:9000", temp_dir.path()),
            transport.clone(),
            recorder.clone(),
        )
        .await;
        let _server = b.start().await.unwrap();

        a.connect("node-b:9000").await.unwrap();
        a.connect("node-x:1").await.unwrap();

        assert_eq!(a.broadcast("NEWS", "hi").await, 1);
        assert!(wait_for_messages(&recorder, 1).await);
    }

    #[tokio::test]
    async fn test_bind_failure_is_reported() {
        let temp_dir = tempfile::tempdir().unwrap();
        let transport = MemoryTransport::new();
        let a = memory_node("node-a:9000", temp_dir.path(), &transport).await;
        let _server = a.start().await.unwrap();

        let err = a.start().await.err().unwrap();
        assert!(matches!(err, NetworkError::Bind { port: 9000, .. }));
    }

    #[tokio::test]
    async fn test_shutdown_releases_listener() {
        let temp_dir = tempfile::tempdir().unwrap();
        let transport = MemoryTransport::new();
        let a = memory_node("node-a:9000", temp_dir.path(), &transport).await;

        let server = a.start().await.unwrap();
        assert_eq!(server.port(), 9000);
        server.shutdown().await;

        assert!(!transport.is_bound("node-a:9000"));
        assert!(a.send("node-a:9000", "PING", "x").await.is_err());
    }

    #[tokio::test]
    async fn test_tcp_message_delivery() {
        let temp_dir = tempfile::tempdir().unwrap();
        let port = std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let b_id = format!("127.0.0.1:{}", port);

        let recorder = Recorder::default();
        let b = Network::create(config(&b_id, temp_dir.path()), TcpTransport, recorder.clone())
            .await;
        let _server = b.start().await.unwrap();

        let a =
            Network::create(config("127.0.0.1:1", temp_dir.path()), TcpTransport, ignore).await;
        a.send(&b_id, "PING", "over tcp").await.unwrap();
        assert!(wait_for_messages(&recorder, 1).await);

        a.connect(&b_id).await.unwrap();
        assert!(wait_for_peer(&b, "127.0.0.1:1").await);
    }
}
