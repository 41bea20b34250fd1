use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::time::Duration;

use super::{decode_status, encode_request, ProtocolError, STATUS_APPLIED, STATUS_LEN};

/// Blocking client of the update protocol.
///
/// At most one request may be outstanding: [`Client::submit`] waits for the acknowledgment
/// before returning. When the server drops the connection (not a leader anymore, refused
/// update, ...) the call fails with [`io::ErrorKind::UnexpectedEof`] and the update has to be
/// resubmitted to the current leader.
pub struct Client {
    stream: TcpStream,
}

impl Client {
    pub fn connect<A: ToSocketAddrs>(addr: A) -> io::Result<Self> {
        let stream = TcpStream::connect(addr)?;
        stream.set_nodelay(true)?;
        Ok(Client { stream })
    }

    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.stream.peer_addr()
    }

    /// bound how long [`Client::wait_ack`] blocks
    pub fn set_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        self.stream.set_read_timeout(timeout)
    }

    /// write one framed request without waiting for its acknowledgment
    pub fn send(&mut self, payload: &[u8]) -> io::Result<()> {
        self.stream.write_all(&encode_request(payload))
    }

    pub fn wait_ack(&mut self) -> io::Result<()> {
        let mut status = [0; STATUS_LEN];
        self.stream.read_exact(&mut status)?;

        match decode_status(status) {
            STATUS_APPLIED => Ok(()),
            other => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                ProtocolError::UnexpectedStatus(other),
            )),
        }
    }

    pub fn submit(&mut self, payload: &[u8]) -> io::Result<()> {
        self.send(payload)?;
        self.wait_ack()
    }

    pub fn into_inner(self) -> TcpStream {
        self.stream
    }
}
