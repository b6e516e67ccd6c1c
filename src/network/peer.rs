//! Peer directory for P2P networking
//!
//! Tracks known peer addresses in memory, backed by an append-only file per
//! node. The file is the authority for de-duplication: an address already on
//! disk is never appended again.

use crate::network::message::MAX_PEER_LIST_LEN;
use chrono::{DateTime, Utc};
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Suffix of the per-node peer file
pub const PEER_FILE_SUFFIX: &str = "_PeerList.txt";

/// Peer directory errors
#[derive(Error, Debug)]
pub enum DirectoryError {
    /// The peer is cached in memory but was not written to disk
    #[error("Failed to persist peer {address}: {source}")]
    Persistence {
        address: String,
        #[source]
        source: io::Error,
    },
}

/// Result of adding an address to the directory
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddOutcome {
    /// Genuinely new: cached and appended to the peer file
    Added,
    /// Already on disk or in memory
    AlreadyExists,
}

/// A known peer
#[derive(Debug, Clone, PartialEq)]
pub struct Peer {
    /// `host:port`, the identity key
    pub address: String,
    /// When this node last learned about the peer
    pub last_seen: DateTime<Utc>,
}

impl Peer {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            last_seen: Utc::now(),
        }
    }
}

/// Address-keyed registry of known peers
#[derive(Debug)]
pub struct PeerDirectory {
    /// Directory holding `<node_id>_PeerList.txt` files
    data_dir: PathBuf,
    /// In-memory cache, in insertion order
    peers: Vec<Peer>,
}

impl PeerDirectory {
    /// Create an empty directory whose peer files live under `data_dir`
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            peers: Vec::new(),
        }
    }

    /// Path of the peer file for `node_id`
    pub fn peer_file(&self, node_id: &str) -> PathBuf {
        self.data_dir.join(format!("{}{}", node_id, PEER_FILE_SUFFIX))
    }

    /// Add `address`, persisting it to the peer file of `node_id`.
    ///
    /// An address present in the file is reported as existing even when it is
    /// not cached in memory. On `Err` the peer stays cached in memory only.
    /// Addresses are stored trimmed, the same form `load_from_file` reads back.
    pub fn add(&mut self, address: &str, node_id: &str) -> Result<AddOutcome, DirectoryError> {
        let address = address.trim();
        let path = self.peer_file(node_id);

        if file_contains(&path, address) {
            return Ok(AddOutcome::AlreadyExists);
        }
        if self.find(address).is_some() {
            return Ok(AddOutcome::AlreadyExists);
        }

        self.peers.push(Peer::new(address));
        log::info!("Added peer {}", address);

        append_line(&path, address).map_err(|source| {
            log::warn!(
                "Peer {} kept in memory only, could not write {}: {}",
                address,
                path.display(),
                source
            );
            DirectoryError::Persistence {
                address: address.to_string(),
                source,
            }
        })?;

        Ok(AddOutcome::Added)
    }

    /// Hydrate the cache from the peer file of `node_id`.
    ///
    /// Returns the number of peers loaded; a missing file loads nothing.
    pub fn load_from_file(&mut self, node_id: &str) -> usize {
        let path = self.peer_file(node_id);
        let file = match File::open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return 0,
            Err(e) => {
                log::warn!("Failed to open {}: {}", path.display(), e);
                return 0;
            }
        };

        let mut loaded = 0;
        for line in BufReader::new(file).lines() {
            let line = match line {
                Ok(line) => line,
                Err(e) => {
                    log::warn!("Failed to read {}: {}", path.display(), e);
                    break;
                }
            };
            let address = line.trim();
            if address.is_empty() || self.find(address).is_some() {
                continue;
            }
            self.peers.push(Peer::new(address));
            loaded += 1;
        }

        log::info!("Loaded {} peers from {}", loaded, path.display());
        loaded
    }

    /// Remove `address` from memory. The peer file is left untouched.
    pub fn remove(&mut self, address: &str) -> bool {
        match self.peers.iter().position(|p| p.address == address) {
            Some(index) => {
                self.peers.remove(index);
                true
            }
            None => false,
        }
    }

    /// Find a peer by address
    pub fn find(&self, address: &str) -> Option<&Peer> {
        self.peers.iter().find(|p| p.address == address)
    }

    /// All cached peers, in insertion order
    pub fn list(&self) -> &[Peer] {
        &self.peers
    }

    /// Cached addresses, in insertion order
    pub fn addresses(&self) -> Vec<String> {
        self.peers.iter().map(|p| p.address.clone()).collect()
    }

    /// Number of cached peers
    pub fn count(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Comma-joined addresses for a discovery message.
    ///
    /// Stops before the first address that would push the list past the wire
    /// limit, so no address is ever cut in half.
    pub fn snapshot_addresses(&self) -> String {
        let mut out = String::new();
        for peer in &self.peers {
            let extra = if out.is_empty() { 0 } else { 1 } + peer.address.len();
            if out.len() + extra > MAX_PEER_LIST_LEN {
                break;
            }
            if !out.is_empty() {
                out.push(',');
            }
            out.push_str(&peer.address);
        }
        out
    }
}

fn file_contains(path: &Path, address: &str) -> bool {
    match File::open(path) {
        Ok(file) => BufReader::new(file)
            .lines()
            .map_while(Result::ok)
            .any(|line| line.trim() == address),
        Err(_) => false,
    }
}

fn append_line(path: &Path, address: &str) -> io::Result<()> {
    let mut file = match OpenOptions::new().append(true).open(path) {
        Ok(file) => file,
        Err(_) => {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            OpenOptions::new().append(true).create(true).open(path)?
        }
    };
    writeln!(file, "{}", address)
}
