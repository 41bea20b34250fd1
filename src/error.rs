use std::io;
use std::net::SocketAddr;

use thiserror::Error;

use crate::config::ConfigError;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("cannot bind the listening socket on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
    #[error("couldn't start consensus: {0}")]
    Consensus(#[source] io::Error),
    #[error("failed to wait for socket readiness: {0}")]
    Poll(#[source] io::Error),
    #[error("server failed to start: {0}")]
    Startup(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Why a connection was not admitted into the connection table.
#[derive(Debug, Error)]
pub enum AdmitError {
    #[error("client limit of {0} sessions hit")]
    CapacityExceeded(usize),
    #[error("cannot register the client socket: {0}")]
    Register(#[from] io::Error),
}
