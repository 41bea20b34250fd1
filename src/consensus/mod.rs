//! Glue between the event loop and an external consensus engine.
//!
//! The engine owns leader election, log replication and its own peer-to-peer datagram socket.
//! The loop only needs to know whether this peer leads, push client updates into the log, learn
//! when a given entry has been applied, and forward raw peer messages as they arrive.

#[cfg(test)]
pub(crate) mod testing;

use std::io;
use std::os::unix::io::RawFd;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use log::{debug, error, info, warn};

use crate::config::{PeerId, WorkerConfig};
use crate::error::ServerError;
use crate::protocol::RequesterId;

pub type LogIndex = u64;

// a transport failing this many times in a row is broken rather than fed a bad message
const MAX_CONSECUTIVE_RECV_FAILURES: usize = 64;

/// The replicated state, driven by the engine.
pub trait StateMachine {
    /// Called once per committed entry, in log order. `snapshot` is set when the update carries
    /// the whole state of a peer rather than a single entry.
    fn apply(&mut self, update: &[u8], snapshot: bool);

    /// Full state, used by the engine to bring a lagging or joining peer up to date.
    fn snapshot(&self) -> Vec<u8>;
}

impl<M: StateMachine> StateMachine for Arc<Mutex<M>> {
    fn apply(&mut self, update: &[u8], snapshot: bool) {
        self.lock()
            .unwrap_or_else(PoisonError::into_inner)
            .apply(update, snapshot)
    }

    fn snapshot(&self) -> Vec<u8> {
        self.lock()
            .unwrap_or_else(PoisonError::into_inner)
            .snapshot()
    }
}

/// Capabilities of the consensus engine the service is built on.
///
/// Every peer must be registered with [`peer_up`] before [`create_transport_socket`] is called.
///
/// [`peer_up`]: Self::peer_up
/// [`create_transport_socket`]: Self::create_transport_socket
pub trait ConsensusEngine {
    type Message;

    fn attach_state_machine(&mut self, machine: Box<dyn StateMachine + Send>);

    fn peer_up(&mut self, id: PeerId, host: &str, port: u16, is_self: bool);

    /// Creates the non-blocking datagram socket peers talk through. The engine keeps ownership,
    /// the returned descriptor is only polled for readiness.
    fn create_transport_socket(&mut self) -> io::Result<RawFd>;

    fn tick(&mut self, elapsed_ms: u64);

    fn is_leader(&self) -> bool;

    /// Appends `update` to the log, returning its index, or `None` when the engine refuses it.
    fn emit(&mut self, update: Vec<u8>) -> Option<LogIndex>;

    fn applied(&self, requester: RequesterId, index: LogIndex) -> bool;

    /// `Ok(None)` once no message is pending on the transport socket.
    fn receive_message(&mut self) -> io::Result<Option<Self::Message>>;

    fn handle_message(&mut self, message: Self::Message);
}

pub struct ConsensusAdapter<E> {
    engine: E,
    transport: Option<RawFd>,
    // sub-millisecond remainder not yet handed to the engine
    tick_carry: Duration,
}

impl<E: ConsensusEngine> ConsensusAdapter<E> {
    pub fn new<M: StateMachine + Send + 'static>(mut engine: E, machine: M) -> Self {
        engine.attach_state_machine(Box::new(machine));

        ConsensusAdapter {
            engine,
            transport: None,
            tick_carry: Duration::default(),
        }
    }

    /// Registers every configured peer with the engine.
    pub fn add_peers(&mut self, config: &WorkerConfig) -> Result<(), ServerError> {
        // the local peer has to be known before anything is registered
        let _ = config.peers.local(config.local_id)?;

        for (id, host_port) in config.peers.iter() {
            if !host_port.up {
                continue;
            }

            let is_self = id == config.local_id;
            debug!(
                "registering peer {} at {}:{}{}",
                id,
                host_port.host,
                host_port.port,
                if is_self { " (self)" } else { "" }
            );
            self.engine
                .peer_up(id, &host_port.host, host_port.port, is_self);
        }

        Ok(())
    }

    pub fn create_transport_socket(&mut self) -> Result<RawFd, ServerError> {
        let fd = self
            .engine
            .create_transport_socket()
            .map_err(ServerError::Consensus)?;
        info!("consensus transport socket fd={} created", fd);

        self.transport = Some(fd);
        Ok(fd)
    }

    pub fn transport_socket(&self) -> Option<RawFd> {
        self.transport
    }

    pub fn is_leader(&self) -> bool {
        self.engine.is_leader()
    }

    /// Advances the engine clock, carrying sub-millisecond leftovers over to the next call.
    pub fn tick(&mut self, elapsed: Duration) {
        let elapsed = self.tick_carry + elapsed;
        let elapsed_ms = elapsed.as_millis() as u64;
        self.tick_carry = elapsed - Duration::from_millis(elapsed_ms);

        self.engine.tick(elapsed_ms);
    }

    pub fn emit(&mut self, update: Vec<u8>) -> Option<LogIndex> {
        self.engine.emit(update)
    }

    pub fn applied(&self, requester: RequesterId, index: LogIndex) -> bool {
        self.engine.applied(requester, index)
    }

    pub fn receive_message(&mut self) -> io::Result<Option<E::Message>> {
        self.engine.receive_message()
    }

    pub fn handle_message(&mut self, message: E::Message) {
        self.engine.handle_message(message)
    }

    /// Handles every message pending on the transport socket, returning how many were handled.
    ///
    /// A message that fails to be received is skipped. The socket only signals new arrivals, so
    /// stopping at the first bad one would strand the messages queued behind it.
    pub fn pump_messages(&mut self) -> usize {
        let mut handled = 0;
        let mut failures = 0;

        loop {
            match self.receive_message() {
                Ok(Some(message)) => {
                    self.handle_message(message);
                    handled += 1;
                    failures = 0;
                }
                Ok(None) => break,
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    warn!("skipping a consensus message: {}", err);
                    failures += 1;
                    if failures >= MAX_CONSECUTIVE_RECV_FAILURES {
                        error!(
                            "{} consecutive consensus receive failures, leaving the transport for now",
                            failures
                        );
                        break;
                    }
                }
            }
        }

        handled
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    pub fn engine_mut(&mut self) -> &mut E {
        &mut self.engine
    }
}
