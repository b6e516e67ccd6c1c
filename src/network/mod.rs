//! P2P Networking module
//!
//! Provides the peer-to-peer node: fixed-width wire messages, the
//! file-backed peer directory, TTL-bounded gossip discovery and the
//! connection server.
//!
//! # Features
//! - Fixed-size framing classified by the type field
//! - Peer directory persisted to `<node_id>_PeerList.txt`
//! - Bootstrap reconnect from the saved peer file
//! - Discovery flooding bounded by TTL
//! - Pluggable transports (TCP and in-memory)

pub mod discovery;
pub mod message;
pub mod node;
pub mod peer;
pub mod server;
pub mod transport;

pub use discovery::{DiscoveryEngine, Task, ANNOUNCE_TTL};
pub use message::{
    CodecError, DiscoveryMessage, Frame, Message, MessageHandler, PrintHandler,
    DISCOVERY_FRAME_LEN, DISCOVERY_TYPE, MAX_PEER_LIST_LEN, MESSAGE_FRAME_LEN,
};
pub use node::{Network, NetworkError, NodeConfig, ServerHandle};
pub use peer::{AddOutcome, DirectoryError, Peer, PeerDirectory};
pub use server::{handle_connection, Server, WireCodec};
pub use transport::{
    AddressFormatError, Listener, MemoryTransport, PeerAddr, TcpTransport, Transport,
};
