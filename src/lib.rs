//! A small replicated coordination service.
//!
//! Peers agree on an ordered log of opaque updates through a consensus engine, and every peer
//! applies that log to its [`StateMachine`]. Clients connect to the leader, submit one update at
//! a time and are acknowledged once their update has been committed and applied.
//!
//! ```ignore
//! use raftable::{Server, TableState, WorkerConfig};
//!
//! let config = WorkerConfig::from_peer_string(0, "0:127.0.0.1:6000,1:127.0.0.1:6001")?;
//! let mut server = Server::start(config, engine, TableState::default())?;
//! // ...
//! server.stop();
//! ```

pub mod config;
pub mod consensus;
mod error;
pub mod protocol;
pub mod server;
pub mod storage;

pub use config::{ConfigError, HostPort, PeerId, PeerTable, ServerOptions, WorkerConfig};
pub use consensus::{ConsensusAdapter, ConsensusEngine, LogIndex, StateMachine};
pub use error::{AdmitError, ServerError};
pub use protocol::client::Client;
pub use protocol::{ProtocolError, RequesterId};
pub use server::{run, EventLoop, Server, ServerState, StopToken};
pub use storage::{InMemoryStorage, Storage, TableState, UpdateBuilder};
