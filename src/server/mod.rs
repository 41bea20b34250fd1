#[cfg(test)]
mod tests;

pub mod connections;
pub mod session;
mod util;

pub use connections::ConnectionTable;
pub use session::{Expectation, Session};
pub use util::{create_listening_socket, StopToken};

use std::io;
use std::net::SocketAddr;
use std::os::unix::io::RawFd;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, Sender};
use log::{debug, error, info, warn};
use mio::net::TcpListener;
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};

use crate::config::{ServerOptions, WorkerConfig};
use crate::consensus::{ConsensusAdapter, ConsensusEngine, StateMachine};
use crate::error::ServerError;

const LISTENER: Token = Token(0);
const TRANSPORT: Token = Token(1);
const EVENTS_CAPACITY: usize = 256;
const STATE_CHANGE_TIMEOUT: Duration = Duration::from_secs(5);

/// Single-threaded readiness loop serving clients of one peer.
///
/// Every iteration waits for readiness (at most one heartbeat), accepts new clients, reads
/// client requests into consensus, advances the consensus clock, handles peer messages and
/// acknowledges applied requests, then evicts bad sessions. Clients are only served while this
/// peer leads.
pub struct EventLoop<E> {
    poll: Poll,
    events: Events,
    listener: TcpListener,
    transport: RawFd,
    connections: ConnectionTable,
    consensus: ConsensusAdapter<E>,
    options: ServerOptions,
    last_tick: Instant,
}

impl<E: ConsensusEngine> EventLoop<E> {
    /// Registers peers, binds the client listener then creates the consensus transport, in
    /// that order.
    pub fn new(
        config: &WorkerConfig,
        mut consensus: ConsensusAdapter<E>,
    ) -> Result<Self, ServerError> {
        consensus.add_peers(config)?;

        let addr = config.listen_addr()?;
        info!("binding tcp {}", addr);
        let mut listener = create_listening_socket(addr, config.options.listen_backlog)
            .map_err(|source| ServerError::Bind { addr, source })?;

        let transport = consensus.create_transport_socket()?;

        let poll = Poll::new()?;
        poll.registry()
            .register(&mut listener, LISTENER, Interest::READABLE)?;
        poll.registry()
            .register(&mut SourceFd(&transport), TRANSPORT, Interest::READABLE)?;

        Ok(EventLoop {
            poll,
            events: Events::with_capacity(EVENTS_CAPACITY),
            listener,
            transport,
            connections: ConnectionTable::with_capacity(config.options.max_clients),
            consensus,
            options: config.options.clone(),
            last_tick: Instant::now(),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn connections(&self) -> &ConnectionTable {
        &self.connections
    }

    pub fn consensus(&self) -> &ConsensusAdapter<E> {
        &self.consensus
    }

    pub fn consensus_mut(&mut self) -> &mut ConsensusAdapter<E> {
        &mut self.consensus
    }

    /// Turns the loop until `stop` is raised, then closes every client.
    pub fn run(&mut self, stop: &StopToken) -> Result<(), ServerError> {
        let result = self.run_until_stopped(stop);
        self.shutdown();
        result
    }

    fn run_until_stopped(&mut self, stop: &StopToken) -> Result<(), ServerError> {
        while !stop.is_stopped() {
            self.turn()?;
        }

        info!("stop requested, shutting down");
        Ok(())
    }

    /// One iteration of the loop. Only a failed readiness wait is an error.
    pub fn turn(&mut self) -> Result<(), ServerError> {
        match self.poll.poll(&mut self.events, Some(self.options.heartbeat)) {
            Ok(()) => {}
            // a signal landed, the stop token gets checked before the next wait
            Err(err) if err.kind() == io::ErrorKind::Interrupted => self.events.clear(),
            Err(err) => return Err(ServerError::Poll(err)),
        }

        let mut listener_ready = false;
        let mut transport_ready = false;
        let mut ready_clients = vec![];

        for event in self.events.iter() {
            match event.token() {
                LISTENER => listener_ready = true,
                TRANSPORT => transport_ready = true,
                token => ready_clients.push(token),
            }
        }

        if listener_ready {
            self.accept_clients();
        }

        ready_clients.sort();
        for token in ready_clients {
            if let Some(session) = self.connections.get_mut(token) {
                session.attend(&mut self.consensus);
            }
        }

        self.tick();

        if transport_ready {
            let handled = self.consensus.pump_messages();
            debug!("handled {} consensus messages", handled);
            self.notify_clients();
        }

        let evicted = self
            .connections
            .sweep(self.poll.registry(), self.consensus.is_leader());
        if evicted > 0 {
            debug!("evicted {} clients", evicted);
        }

        Ok(())
    }

    fn accept_clients(&mut self) {
        loop {
            let (stream, peer_addr) = match self.listener.accept() {
                Ok(accepted) => accepted,
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) if is_connection_error(&err) => {
                    debug!("a pending connection went away before accept: {}", err);
                    continue;
                }
                Err(err) => {
                    // out of descriptors or memory, the backlog waits for the next edge
                    error!("failed to accept a connection: {}", err);
                    return;
                }
            };

            if !self.consensus.is_leader() {
                info!("not a leader, disconnecting the accepted connection from {}", peer_addr);
                continue;
            }

            if let Err(err) = stream.set_nodelay(true) {
                debug!("cannot disable nagle for {}: {}", peer_addr, err);
            }

            match self
                .connections
                .accept(self.poll.registry(), stream, &self.options)
            {
                Ok(token) => debug!("a new connection from {} accepted as {:?}", peer_addr, token),
                Err(err) => warn!("rejecting the connection from {}: {}", peer_addr, err),
            }
        }
    }

    fn tick(&mut self) {
        let now = Instant::now();
        let elapsed = now.saturating_duration_since(self.last_tick);
        self.last_tick = now;

        self.consensus.tick(elapsed);
    }

    /// acknowledge applied requests, in slot order
    fn notify_clients(&mut self) {
        let mut notified = 0;
        for (_, session) in self.connections.iter_mut() {
            if session.notify_if_ready(&self.consensus) {
                notified += 1;
            }
        }

        if notified > 0 {
            debug!("notified {} clients", notified);
        }
    }

    /// Closes every client and stops polling the listener and the transport.
    pub fn shutdown(&mut self) {
        let registry = self.poll.registry();
        self.connections.clear(registry);

        if let Err(err) = registry.deregister(&mut self.listener) {
            debug!("failed to deregister the listener: {}", err);
        }
        if let Err(err) = registry.deregister(&mut SourceFd(&self.transport)) {
            debug!("failed to deregister the consensus transport: {}", err);
        }
    }
}

/// Accept failures that only concern the connection at the head of the backlog.
pub(crate) fn is_connection_error(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::TimedOut
    )
}

/// Serves clients on the calling thread until `stop` is raised.
pub fn run<E, M>(
    config: &WorkerConfig,
    engine: E,
    machine: M,
    stop: &StopToken,
) -> Result<(), ServerError>
where
    E: ConsensusEngine,
    M: StateMachine + Send + 'static,
{
    let mut event_loop = EventLoop::new(config, ConsensusAdapter::new(engine, machine))?;
    event_loop.run(stop)
}

#[derive(Debug, Eq, PartialEq, Clone)]
pub enum ServerState {
    Started(SocketAddr),
    Stopped,
    Timeout,
    Error(String),
}

/// Event loop running on its own thread.
pub struct Server {
    local_addr: SocketAddr,
    stop: StopToken,
    state_recv: Receiver<ServerState>,
    handle: Option<JoinHandle<Result<(), ServerError>>>,
}

impl Server {
    /// Spawns the event loop and waits until its listener is bound.
    pub fn start<E, M>(config: WorkerConfig, engine: E, machine: M) -> Result<Self, ServerError>
    where
        E: ConsensusEngine + Send + 'static,
        M: StateMachine + Send + 'static,
    {
        let (state_send, state_recv) = unbounded();
        let stop = StopToken::new();
        let loop_stop = stop.clone();

        let handle = thread::Builder::new()
            .name("raftable worker".to_string())
            .spawn(move || serve(&config, engine, machine, &loop_stop, &state_send))?;

        match state_recv.recv_timeout(STATE_CHANGE_TIMEOUT) {
            Ok(ServerState::Started(local_addr)) => Ok(Server {
                local_addr,
                stop,
                state_recv,
                handle: Some(handle),
            }),
            Ok(other) => {
                stop.stop();
                match handle.join() {
                    Ok(Err(err)) => Err(err),
                    _ => Err(ServerError::Startup(format!("{:?}", other))),
                }
            }
            Err(_) => {
                stop.stop();
                Err(ServerError::Startup("timed out waiting for the listener".to_string()))
            }
        }
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Raises the stop token and waits for the loop to wind down.
    pub fn stop(&mut self) -> Option<ServerState> {
        let handle = self.handle.take()?;
        self.stop.stop();

        let state = match self.state_recv.recv_timeout(STATE_CHANGE_TIMEOUT) {
            Ok(state) => state,
            Err(_) => return Some(ServerState::Timeout),
        };

        let _ = handle.join();
        Some(state)
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

fn serve<E, M>(
    config: &WorkerConfig,
    engine: E,
    machine: M,
    stop: &StopToken,
    state_send: &Sender<ServerState>,
) -> Result<(), ServerError>
where
    E: ConsensusEngine,
    M: StateMachine + Send + 'static,
{
    let started = EventLoop::new(config, ConsensusAdapter::new(engine, machine))
        .and_then(|event_loop| Ok((event_loop.local_addr()?, event_loop)));

    let mut event_loop = match started {
        Ok((local_addr, event_loop)) => {
            // notify that the server has been started
            let _ = state_send.send(ServerState::Started(local_addr));
            event_loop
        }
        Err(err) => {
            error!("couldn't start raftable server: {}", err);
            let _ = state_send.send(ServerState::Error(err.to_string()));
            return Err(err);
        }
    };

    match event_loop.run(stop) {
        Ok(()) => {
            let _ = state_send.send(ServerState::Stopped);
            Ok(())
        }
        Err(err) => {
            error!("raftable server stopped: {}", err);
            let _ = state_send.send(ServerState::Error(err.to_string()));
            Err(err)
        }
    }
}
