//! Gossip Node: a minimal peer-to-peer node in Rust
//!
//! This crate provides:
//! - Fixed-width binary messages classified by their type field
//! - A peer directory backed by an append-only file per node
//! - TTL-bounded gossip discovery with auto-connect to new peers
//! - Bootstrap from the saved peer file on startup
//! - A single-threaded accept loop that serializes all gossip work
//!
//! # Example
//!
//! ```no_run
//! use gossip_node::network::{Network, NodeConfig, PrintHandler, TcpTransport};
//!
//! # async fn demo() -> Result<(), gossip_node::network::NetworkError> {
//! let config = NodeConfig::from_address("127.0.0.1:9000").unwrap();
//! let network = Network::create(config, TcpTransport, PrintHandler).await;
//! let server = network.start().await?;
//!
//! network.connect("127.0.0.1:9001").await?;
//! let sent = network.broadcast("HELLO", "hi everyone").await;
//! println!("Broadcast to {} peers", sent);
//!
//! server.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod cli;
pub mod network;

// Re-export commonly used types
pub use network::{
    DiscoveryEngine, DiscoveryMessage, Message, MessageHandler, Network, NetworkError,
    NodeConfig, Peer, PeerDirectory, TcpTransport,
};
