use std::io::{self, Write};

use log::{debug, warn};
use mio::net::TcpStream;

use crate::config::ServerOptions;
use crate::consensus::{ConsensusAdapter, ConsensusEngine, LogIndex};
use crate::protocol::{self, FrameAssembler, RecvBuffer, RequesterId, STATUS_LEN};

/// A request accepted into the log whose acknowledgment is still owed to the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Expectation {
    pub requester: RequesterId,
    pub index: LogIndex,
}

/// Server side of one client connection.
///
/// A client has at most one request in flight: a second one arriving before the first is
/// acknowledged is a protocol violation and the session turns bad. Bad sessions are never read
/// from or written to again and get evicted by the next sweep.
pub struct Session {
    stream: TcpStream,
    good: bool,
    recv: RecvBuffer,
    assembler: FrameAssembler,
    expect: Option<Expectation>,
}

impl Session {
    pub fn new(stream: TcpStream, options: &ServerOptions) -> Self {
        Session {
            stream,
            good: true,
            recv: RecvBuffer::with_capacity(options.recv_buffer_len),
            assembler: FrameAssembler::new(options.max_message_len),
            expect: None,
        }
    }

    pub fn is_good(&self) -> bool {
        self.good
    }

    pub fn expectation(&self) -> Option<Expectation> {
        self.expect
    }

    pub fn stream(&self) -> &TcpStream {
        &self.stream
    }

    pub fn stream_mut(&mut self) -> &mut TcpStream {
        &mut self.stream
    }

    pub fn mark_bad(&mut self) {
        self.good = false;
        self.expect = None;
        self.assembler.reset();
        self.recv.clear();
    }

    /// One non-blocking read into the receive buffer. Returns whether bytes were read.
    pub fn pull(&mut self) -> bool {
        if !self.good || self.recv.available() == 0 {
            return false;
        }

        loop {
            match self.recv.fill_from(&mut self.stream) {
                Ok(0) => {
                    debug!("client closed the connection");
                    self.mark_bad();
                    return false;
                }
                Ok(_) => return true,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return false,
                Err(err) => {
                    warn!("failed to read from client: {}", err);
                    self.mark_bad();
                    return false;
                }
            }
        }
    }

    /// Submits every complete message buffered so far.
    pub fn reassemble<E: ConsensusEngine>(&mut self, consensus: &mut ConsensusAdapter<E>) {
        while self.good {
            match self.assembler.next_message(&mut self.recv) {
                Ok(Some(payload)) => self.submit(payload, consensus),
                Ok(None) => break,
                Err(err) => {
                    warn!("dropping client: {}", err);
                    self.mark_bad();
                }
            }
        }
    }

    /// Reads until the socket runs dry, submitting complete messages along the way.
    pub fn attend<E: ConsensusEngine>(&mut self, consensus: &mut ConsensusAdapter<E>) {
        while self.pull() {
            self.reassemble(consensus);
        }
    }

    /// Hands `payload` over to consensus and remembers which log index to acknowledge.
    pub fn submit<E: ConsensusEngine>(
        &mut self,
        payload: Vec<u8>,
        consensus: &mut ConsensusAdapter<E>,
    ) {
        if let Some(expect) = self.expect {
            warn!(
                "client sent another update while index {} is outstanding, dropping it",
                expect.index
            );
            self.mark_bad();
            return;
        }

        let requester = match protocol::requester_id(&payload) {
            Ok(requester) => requester,
            Err(err) => {
                warn!("dropping client: {}", err);
                self.mark_bad();
                return;
            }
        };

        match consensus.emit(payload) {
            Some(index) => {
                debug!("update of requester {} emitted at index {}", requester, index);
                self.expect = Some(Expectation { requester, index });
            }
            None => {
                warn!("consensus refused the update of requester {}", requester);
                self.mark_bad();
            }
        }
    }

    /// Acknowledges the outstanding request once it has been applied. Returns whether an
    /// acknowledgment was sent.
    pub fn notify_if_ready<E: ConsensusEngine>(&mut self, consensus: &ConsensusAdapter<E>) -> bool {
        if !self.good {
            return false;
        }

        let expect = match self.expect {
            Some(expect) => expect,
            None => return false,
        };

        if !consensus.applied(expect.requester, expect.index) {
            return false;
        }

        self.expect = None;
        match self.stream.write(&protocol::encode_ack()) {
            Ok(STATUS_LEN) => true,
            Ok(written) => {
                warn!("failed to notify client: short write of {} bytes", written);
                self.mark_bad();
                false
            }
            Err(err) => {
                warn!("failed to notify client: {}", err);
                self.mark_bad();
                false
            }
        }
    }
}
