//! A consensus engine the tests fully control.
//!
//! Leadership and emit refusal are flipped through a [`ScriptHandle`]. Commits travel as real
//! datagrams to the engine's transport socket so the event loop sees it become readable, the
//! same way it would see a peer message.

use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use crate::config::PeerId;
use crate::consensus::{ConsensusEngine, LogIndex, StateMachine};
use crate::protocol::RequesterId;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisteredPeer {
    pub id: PeerId,
    pub host: String,
    pub port: u16,
    pub is_self: bool,
}

#[derive(Debug, Default)]
pub struct Script {
    pub leader: bool,
    pub refuse_emit: bool,
    pub peers: Vec<RegisteredPeer>,
    // number of peers registered when the transport socket got created
    pub peers_before_transport: Option<usize>,
    pub transport_addr: Option<SocketAddr>,
    pub emitted: Vec<Vec<u8>>,
    pub committed: LogIndex,
    pub elapsed_ms: u64,
    pub handled_messages: usize,
}

#[derive(Clone, Default)]
pub struct ScriptHandle(Arc<Mutex<Script>>);

impl ScriptHandle {
    pub fn lock(&self) -> MutexGuard<'_, Script> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_leader(&self, leader: bool) {
        self.lock().leader = leader;
    }

    pub fn refuse_emit(&self, refuse: bool) {
        self.lock().refuse_emit = refuse;
    }

    pub fn emitted(&self) -> Vec<Vec<u8>> {
        self.lock().emitted.clone()
    }

    pub fn handled_messages(&self) -> usize {
        self.lock().handled_messages
    }

    /// tell the engine, through its transport socket, that everything up to `index` committed
    pub fn commit(&self, index: LogIndex) {
        self.send_datagram(&index.to_ne_bytes());
    }

    /// deliver arbitrary bytes to the transport socket, as a misbehaving peer would
    pub fn send_datagram(&self, bytes: &[u8]) {
        let addr = self
            .lock()
            .transport_addr
            .expect("transport socket not created yet");
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        socket.send_to(bytes, addr).unwrap();
    }

    /// block until `cond` holds on the script, panicking after a few seconds
    pub fn wait_for<F: Fn(&Script) -> bool>(&self, cond: F) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !cond(&self.lock()) {
            assert!(Instant::now() < deadline, "script condition never held");
            thread::sleep(Duration::from_millis(5));
        }
    }
}

pub struct ScriptedEngine {
    script: ScriptHandle,
    socket: Option<UdpSocket>,
    machine: Option<Box<dyn StateMachine + Send>>,
    applied_upto: LogIndex,
}

impl ScriptedEngine {
    pub fn new() -> (Self, ScriptHandle) {
        let script = ScriptHandle::default();
        let engine = ScriptedEngine {
            script: script.clone(),
            socket: None,
            machine: None,
            applied_upto: 0,
        };

        (engine, script)
    }

    pub fn leading() -> (Self, ScriptHandle) {
        let (engine, script) = ScriptedEngine::new();
        script.set_leader(true);
        (engine, script)
    }

    fn apply_committed(&mut self, committed: LogIndex, entries: &[Vec<u8>]) {
        if let Some(machine) = self.machine.as_mut() {
            for index in self.applied_upto + 1..=committed {
                machine.apply(&entries[index as usize - 1], false);
            }
        }
        self.applied_upto = committed;
    }
}

impl ConsensusEngine for ScriptedEngine {
    type Message = LogIndex;

    fn attach_state_machine(&mut self, machine: Box<dyn StateMachine + Send>) {
        self.machine = Some(machine);
    }

    fn peer_up(&mut self, id: PeerId, host: &str, port: u16, is_self: bool) {
        self.script.lock().peers.push(RegisteredPeer {
            id,
            host: host.to_string(),
            port,
            is_self,
        });
    }

    fn create_transport_socket(&mut self) -> io::Result<RawFd> {
        let socket = UdpSocket::bind("127.0.0.1:0")?;
        socket.set_nonblocking(true)?;
        let fd = socket.as_raw_fd();

        let mut script = self.script.lock();
        script.transport_addr = Some(socket.local_addr()?);
        script.peers_before_transport = Some(script.peers.len());
        drop(script);

        self.socket = Some(socket);
        Ok(fd)
    }

    fn tick(&mut self, elapsed_ms: u64) {
        self.script.lock().elapsed_ms += elapsed_ms;
    }

    fn is_leader(&self) -> bool {
        self.script.lock().leader
    }

    fn emit(&mut self, update: Vec<u8>) -> Option<LogIndex> {
        let mut script = self.script.lock();
        if script.refuse_emit || !script.leader {
            return None;
        }

        script.emitted.push(update);
        Some(script.emitted.len() as LogIndex)
    }

    fn applied(&self, _requester: RequesterId, index: LogIndex) -> bool {
        index <= self.applied_upto
    }

    fn receive_message(&mut self) -> io::Result<Option<LogIndex>> {
        let socket = match self.socket.as_ref() {
            Some(socket) => socket,
            None => return Ok(None),
        };

        let mut buf = [0; 8];
        match socket.recv(&mut buf) {
            Ok(8) => Ok(Some(LogIndex::from_ne_bytes(buf))),
            Ok(len) => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("{} byte commit datagram", len),
            )),
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(err) => Err(err),
        }
    }

    fn handle_message(&mut self, index: LogIndex) {
        let (committed, entries) = {
            let mut script = self.script.lock();
            script.handled_messages += 1;
            let committed = index.min(script.emitted.len() as LogIndex).max(script.committed);
            script.committed = committed;
            (committed, script.emitted.clone())
        };

        self.apply_committed(committed, &entries);
    }
}
