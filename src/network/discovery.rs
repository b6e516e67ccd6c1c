//! Gossip-based peer discovery
//!
//! Each inbound discovery message is processed to completion against the peer
//! directory and turned into an ordered list of [`Task`]s: auto-connects to
//! newly learned peers, a reply on the inbound connection, and a TTL-bounded
//! flood to every other known peer. The network executes the tasks from a
//! work queue instead of recursing.
//!
//! Loop avoidance is only "do not flood back to the immediate sender". There
//! is no message id, so a cyclic topology re-floods the same announcement
//! until its TTL runs out.

use crate::network::message::DiscoveryMessage;
use crate::network::peer::{AddOutcome, PeerDirectory};
use std::collections::{HashSet, VecDeque};

/// TTL of the announcement sent when connecting to a peer
pub const ANNOUNCE_TTL: i32 = 3;

/// Unit of outbound work produced by the discovery engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Task {
    /// Add the address and announce ourselves to every known peer
    Connect(String),
    /// Deliver a discovery message on a fresh connection
    SendDiscovery {
        to: String,
        message: DiscoveryMessage,
    },
    /// Write a discovery message back on the inbound connection
    Reply(DiscoveryMessage),
}

/// The gossip state machine for one node
#[derive(Debug, Clone)]
pub struct DiscoveryEngine {
    node_id: String,
    announce_ttl: i32,
}

impl DiscoveryEngine {
    pub fn new(node_id: impl Into<String>) -> Self {
        Self::with_announce_ttl(node_id, ANNOUNCE_TTL)
    }

    pub fn with_announce_ttl(node_id: impl Into<String>, announce_ttl: i32) -> Self {
        Self {
            node_id: node_id.into(),
            announce_ttl,
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Merge an inbound announcement and plan the resulting outbound work.
    pub fn handle(&self, directory: &mut PeerDirectory, msg: &DiscoveryMessage) -> VecDeque<Task> {
        let known_before: HashSet<String> = directory.addresses().into_iter().collect();
        let sender = msg.sender.trim();
        let mut tasks = VecDeque::new();

        self.record(directory, &msg.sender);

        if msg.ttl <= 0 {
            log::debug!("Discovery from {} expired (ttl {})", msg.sender, msg.ttl);
            return tasks;
        }

        for token in msg.peers().filter(|t| *t != self.node_id) {
            if self.record(directory, token) == Some(AddOutcome::Added) {
                tasks.push_back(Task::Connect(token.to_string()));
            }
        }

        let ttl = msg.ttl - 1;
        let snapshot = directory.snapshot_addresses();
        tasks.push_back(Task::Reply(DiscoveryMessage::new(
            self.node_id.as_str(),
            ttl,
            snapshot.as_str(),
        )));

        if ttl > 0 {
            for peer in directory.list().iter().filter(|p| p.address != sender) {
                tasks.push_back(Task::SendDiscovery {
                    to: peer.address.clone(),
                    message: DiscoveryMessage::new(self.node_id.as_str(), ttl, snapshot.as_str()),
                });
            }
        }

        // Second pass against the pre-merge view: anything unknown before this
        // message gets another connect, even if the first pass already did.
        for token in msg.peers().filter(|t| *t != self.node_id) {
            if !known_before.contains(token) {
                tasks.push_back(Task::Connect(token.to_string()));
            }
        }

        log::debug!(
            "Discovery from {} (ttl {}) planned {} tasks",
            msg.sender,
            msg.ttl,
            tasks.len()
        );
        tasks
    }

    /// Plan a connect: add `address` and announce to every known peer.
    pub fn plan_connect(&self, directory: &mut PeerDirectory, address: &str) -> Vec<Task> {
        self.record(directory, address);

        let snapshot = directory.snapshot_addresses();
        directory
            .list()
            .iter()
            .map(|peer| Task::SendDiscovery {
                to: peer.address.clone(),
                message: DiscoveryMessage::new(
                    self.node_id.as_str(),
                    self.announce_ttl,
                    snapshot.as_str(),
                ),
            })
            .collect()
    }

    fn record(&self, directory: &mut PeerDirectory, address: &str) -> Option<AddOutcome> {
        match directory.add(address, &self.node_id) {
            Ok(outcome) => Some(outcome),
            Err(e) => {
                log::warn!("{}", e);
                None
            }
        }
    }
}
