use std::collections::BTreeMap;
use std::net::{SocketAddr, ToSocketAddrs};
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::protocol::LENGTH_PREFIX_LEN;

pub type PeerId = u32;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("malformed peer entry '{0}', expected id:host:port")]
    MalformedPeer(String),
    #[error("peer {0} is configured more than once")]
    DuplicatePeer(PeerId),
    #[error("local peer {0} is not part of the peer table")]
    UnknownLocalPeer(PeerId),
    #[error("cannot resolve peer address {host}:{port}")]
    InvalidAddress { host: String, port: u16 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostPort {
    pub host: String,
    pub port: u16,
    pub up: bool,
}

impl HostPort {
    pub fn new<T: Into<String>>(host: T, port: u16) -> Self {
        HostPort {
            host: host.into(),
            port,
            up: true,
        }
    }

    pub fn socket_addr(&self) -> Result<SocketAddr, ConfigError> {
        let invalid = || ConfigError::InvalidAddress {
            host: self.host.clone(),
            port: self.port,
        };

        match (self.host.as_str(), self.port).to_socket_addrs() {
            Ok(mut addrs) => addrs.next().ok_or_else(invalid),
            Err(_) => Err(invalid()),
        }
    }
}

/// Peers of the replication group, keyed by peer id.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PeerTable {
    peers: BTreeMap<PeerId, HostPort>,
}

impl PeerTable {
    pub fn new() -> Self {
        PeerTable::default()
    }

    pub fn insert(&mut self, id: PeerId, host_port: HostPort) -> Result<(), ConfigError> {
        if self.peers.contains_key(&id) {
            return Err(ConfigError::DuplicatePeer(id));
        }

        self.peers.insert(id, host_port);
        Ok(())
    }

    pub fn get(&self, id: PeerId) -> Option<&HostPort> {
        self.peers.get(&id)
    }

    /// the entry a peer binds its client listener to
    pub fn local(&self, id: PeerId) -> Result<&HostPort, ConfigError> {
        self.get(id).ok_or(ConfigError::UnknownLocalPeer(id))
    }

    pub fn iter(&self) -> impl Iterator<Item = (PeerId, &HostPort)> {
        self.peers.iter().map(|(id, host_port)| (*id, host_port))
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}

fn parse_peer(entry: &str) -> Result<(PeerId, HostPort), ConfigError> {
    let malformed = || ConfigError::MalformedPeer(entry.to_string());

    // the host may itself contain ':' so the port is split from the right
    let (id, rest) = entry.split_once(':').ok_or_else(malformed)?;
    let (host, port) = rest.rsplit_once(':').ok_or_else(malformed)?;

    if host.is_empty() {
        return Err(malformed());
    }

    let id = id.trim().parse::<PeerId>().map_err(|_| malformed())?;
    let port = port.trim().parse::<u16>().map_err(|_| malformed())?;

    Ok((id, HostPort::new(host.trim(), port)))
}

impl FromStr for PeerTable {
    type Err = ConfigError;

    /// parse a comma separated list of `id:host:port` triples
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut table = PeerTable::new();

        for entry in s.split(',').map(str::trim).filter(|entry| !entry.is_empty()) {
            let (id, host_port) = parse_peer(entry)?;
            table.insert(id, host_port)?;
        }

        Ok(table)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerOptions {
    /// Upper bound of the readiness wait, and so the consensus tick granularity.
    pub heartbeat: Duration,
    pub max_clients: usize,
    pub recv_buffer_len: usize,
    pub listen_backlog: i32,
    /// Requests declaring a longer payload are dropped along with their connection.
    pub max_message_len: usize,
}

impl ServerOptions {
    pub fn with_heartbeat(mut self, heartbeat: Duration) -> Self {
        self.heartbeat = heartbeat;
        self
    }

    pub fn with_max_clients(mut self, max_clients: usize) -> Self {
        self.max_clients = max_clients;
        self
    }

    pub fn with_max_message_len(mut self, max_message_len: usize) -> Self {
        self.max_message_len = max_message_len;
        self
    }

    pub fn with_recv_buffer_len(mut self, recv_buffer_len: usize) -> Self {
        // a length prefix must always fit in the receive buffer
        self.recv_buffer_len = recv_buffer_len.max(LENGTH_PREFIX_LEN);
        self
    }
}

impl Default for ServerOptions {
    fn default() -> Self {
        ServerOptions {
            heartbeat: Duration::from_millis(20),
            max_clients: 1024,
            recv_buffer_len: 1024,
            listen_backlog: 10,
            max_message_len: 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub local_id: PeerId,
    pub peers: PeerTable,
    pub options: ServerOptions,
}

impl WorkerConfig {
    pub fn new(local_id: PeerId, peers: PeerTable) -> Self {
        WorkerConfig {
            local_id,
            peers,
            options: ServerOptions::default(),
        }
    }

    pub fn from_peer_string(local_id: PeerId, peers: &str) -> Result<Self, ConfigError> {
        let peers = peers.parse::<PeerTable>()?;
        // fail early rather than when the listener gets bound
        let _ = peers.local(local_id)?;
        Ok(WorkerConfig::new(local_id, peers))
    }

    pub fn with_options(mut self, options: ServerOptions) -> Self {
        self.options = options;
        self
    }

    pub fn listen_addr(&self) -> Result<SocketAddr, ConfigError> {
        self.peers.local(self.local_id)?.socket_addr()
    }
}
