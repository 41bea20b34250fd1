use log::{debug, warn};
use mio::net::TcpStream;
use mio::{Interest, Registry, Token};
use slab::Slab;

use crate::config::ServerOptions;
use crate::error::AdmitError;
use crate::server::session::Session;

/// Tokens below this one belong to the listener and the consensus transport.
pub const FIRST_CLIENT: usize = 2;

fn token_of(key: usize) -> Token {
    Token(key + FIRST_CLIENT)
}

fn key_of(token: Token) -> Option<usize> {
    token.0.checked_sub(FIRST_CLIENT)
}

/// Bounded arena of client sessions, addressed by their poll token.
pub struct ConnectionTable {
    slots: Slab<Session>,
    capacity: usize,
}

impl ConnectionTable {
    pub fn with_capacity(capacity: usize) -> Self {
        ConnectionTable {
            slots: Slab::with_capacity(capacity),
            capacity,
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_full(&self) -> bool {
        self.slots.len() >= self.capacity
    }

    /// Admits `stream` as a new session and registers it for readability.
    ///
    /// The stream is dropped, and so closed, when it cannot be admitted.
    pub fn accept(
        &mut self,
        registry: &Registry,
        stream: TcpStream,
        options: &ServerOptions,
    ) -> Result<Token, AdmitError> {
        if self.is_full() {
            return Err(AdmitError::CapacityExceeded(self.capacity));
        }

        let entry = self.slots.vacant_entry();
        let token = token_of(entry.key());
        let mut session = Session::new(stream, options);
        registry.register(session.stream_mut(), token, Interest::READABLE)?;
        entry.insert(session);

        Ok(token)
    }

    pub fn get(&self, token: Token) -> Option<&Session> {
        key_of(token).and_then(|key| self.slots.get(key))
    }

    pub fn get_mut(&mut self, token: Token) -> Option<&mut Session> {
        key_of(token).and_then(move |key| self.slots.get_mut(key))
    }

    /// sessions in slot order
    pub fn iter_mut(&mut self) -> impl Iterator<Item = (Token, &mut Session)> {
        self.slots
            .iter_mut()
            .map(|(key, session)| (token_of(key), session))
    }

    /// Unregisters and closes the session behind `token`, freeing its slot.
    pub fn evict(&mut self, registry: &Registry, token: Token) -> bool {
        let mut session = match key_of(token).and_then(|key| self.slots.try_remove(key)) {
            Some(session) => session,
            None => return false,
        };

        if let Err(err) = registry.deregister(session.stream_mut()) {
            warn!("failed to deregister client {:?}: {}", token, err);
        }
        debug!("client {:?} disconnected", token);

        // dropping the session closes its socket and releases its buffers
        true
    }

    /// Evicts every bad session, or every session at all when this peer does not lead.
    pub fn sweep(&mut self, registry: &Registry, leader: bool) -> usize {
        let doomed: Vec<Token> = self
            .slots
            .iter()
            .filter(|(_, session)| !leader || !session.is_good())
            .map(|(key, _)| token_of(key))
            .collect();

        for token in doomed.iter() {
            self.evict(registry, *token);
        }

        doomed.len()
    }

    pub fn clear(&mut self, registry: &Registry) {
        for mut session in self.slots.drain() {
            if let Err(err) = registry.deregister(session.stream_mut()) {
                warn!("failed to deregister a client on shutdown: {}", err);
            }
        }
    }
}
