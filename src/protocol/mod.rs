//! Client framing protocol.
//!
//! A request is a native-width length prefix followed by exactly that many payload bytes. The
//! payload starts with the requester id the acknowledgment is correlated with. Once the request
//! is committed and applied the server answers with a single native `i32` status.

#[cfg(test)]
mod tests;

pub mod client;
pub mod error;

use std::io::{self, Read};
use std::mem;

pub use error::ProtocolError;

pub type RequesterId = i32;
pub type Status = i32;

/// Requester id of updates no client is waiting for (snapshots).
pub const NOBODY: RequesterId = -1;
pub const STATUS_APPLIED: Status = 1;

pub const LENGTH_PREFIX_LEN: usize = mem::size_of::<usize>();
pub const REQUESTER_LEN: usize = mem::size_of::<RequesterId>();
pub const STATUS_LEN: usize = mem::size_of::<Status>();

/// Bytes read from a socket and not yet moved into a message.
pub struct RecvBuffer {
    buf: Box<[u8]>,
    filled: usize,
}

impl RecvBuffer {
    pub fn with_capacity(capacity: usize) -> Self {
        RecvBuffer {
            buf: vec![0; capacity.max(LENGTH_PREFIX_LEN)].into_boxed_slice(),
            filled: 0,
        }
    }

    pub fn filled(&self) -> usize {
        self.filled
    }

    pub fn available(&self) -> usize {
        self.buf.len() - self.filled
    }

    pub fn is_empty(&self) -> bool {
        self.filled == 0
    }

    /// one read into the remaining capacity
    pub fn fill_from<R: Read>(&mut self, reader: &mut R) -> io::Result<usize> {
        let read = reader.read(&mut self.buf[self.filled..])?;
        self.filled += read;
        Ok(read)
    }

    /// copy as much of `bytes` as fits, returning how many bytes were taken
    pub fn extend_from_slice(&mut self, bytes: &[u8]) -> usize {
        let taken = bytes.len().min(self.available());
        self.buf[self.filled..self.filled + taken].copy_from_slice(&bytes[..taken]);
        self.filled += taken;
        taken
    }

    pub fn clear(&mut self) {
        self.filled = 0;
    }

    fn consume(&mut self, bytes: usize) {
        debug_assert!(bytes <= self.filled);
        self.buf.copy_within(bytes..self.filled, 0);
        self.filled -= bytes;
    }
}

/// Extracts the length prefix, or `None` while fewer than [`LENGTH_PREFIX_LEN`] bytes are buffered.
pub fn try_consume_length_prefix(buf: &mut RecvBuffer) -> Option<usize> {
    if buf.filled < LENGTH_PREFIX_LEN {
        return None;
    }

    let mut prefix = [0; LENGTH_PREFIX_LEN];
    prefix.copy_from_slice(&buf.buf[..LENGTH_PREFIX_LEN]);
    buf.consume(LENGTH_PREFIX_LEN);

    Some(usize::from_ne_bytes(prefix))
}

/// Moves at most `remaining` buffered bytes into `dst`, returning how many were moved.
pub fn try_consume_body(buf: &mut RecvBuffer, dst: &mut Vec<u8>, remaining: usize) -> usize {
    let moved = remaining.min(buf.filled);
    dst.extend_from_slice(&buf.buf[..moved]);
    buf.consume(moved);
    moved
}

struct PendingMessage {
    body: Vec<u8>,
    total: usize,
}

/// Rebuilds whole messages out of arbitrarily fragmented reads.
pub struct FrameAssembler {
    pending: Option<PendingMessage>,
    max_message_len: usize,
}

impl FrameAssembler {
    pub fn new(max_message_len: usize) -> Self {
        FrameAssembler {
            pending: None,
            max_message_len,
        }
    }

    /// Returns the next complete payload, `None` if more bytes are needed.
    pub fn next_message(&mut self, buf: &mut RecvBuffer) -> Result<Option<Vec<u8>>, ProtocolError> {
        if self.pending.is_none() {
            let total = match try_consume_length_prefix(buf) {
                Some(total) => total,
                None => return Ok(None),
            };

            if total > self.max_message_len {
                return Err(ProtocolError::MessageTooLarge {
                    len: total,
                    max: self.max_message_len,
                });
            }

            self.pending = Some(PendingMessage {
                body: Vec::with_capacity(total),
                total,
            });
        }

        let complete = match self.pending.as_mut() {
            Some(pending) => {
                let remaining = pending.total - pending.body.len();
                let _ = try_consume_body(buf, &mut pending.body, remaining);
                pending.body.len() == pending.total
            }
            None => false,
        };

        if complete {
            Ok(self.pending.take().map(|pending| pending.body))
        } else {
            Ok(None)
        }
    }

    pub fn in_progress(&self) -> bool {
        self.pending.is_some()
    }

    /// drop the partially received message, if any
    pub fn reset(&mut self) {
        self.pending = None;
    }
}

pub fn encode_request(payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(LENGTH_PREFIX_LEN + payload.len());
    frame.extend_from_slice(&payload.len().to_ne_bytes());
    frame.extend_from_slice(payload);
    frame
}

pub fn encode_ack() -> [u8; STATUS_LEN] {
    STATUS_APPLIED.to_ne_bytes()
}

pub fn decode_status(bytes: [u8; STATUS_LEN]) -> Status {
    Status::from_ne_bytes(bytes)
}

/// The requester id carried by the leading bytes of a payload.
pub fn requester_id(payload: &[u8]) -> Result<RequesterId, ProtocolError> {
    if payload.len() < REQUESTER_LEN {
        return Err(ProtocolError::MissingRequester(payload.len()));
    }

    let mut id = [0; REQUESTER_LEN];
    id.copy_from_slice(&payload[..REQUESTER_LEN]);
    Ok(RequesterId::from_ne_bytes(id))
}
