//! Encoding of table updates.
//!
//! ```text
//! [requester: i32][count: u32] then count times [key_len: u32][value_len: u32][key][value]
//! ```
//!
//! Integers use native byte order, like the request length prefix. A `value_len` of
//! `u32::MAX` removes the key and is followed by no value bytes.

use std::convert::{TryFrom, TryInto};
use std::mem;

use crate::protocol::{ProtocolError, RequesterId, REQUESTER_LEN};

const REMOVED: u32 = u32::MAX;
const U32_LEN: usize = mem::size_of::<u32>();

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Change<'a> {
    Write(&'a [u8], &'a [u8]),
    Remove(&'a [u8]),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Update<'a> {
    pub requester: RequesterId,
    pub changes: Vec<Change<'a>>,
}

struct Reader<'a> {
    bytes: &'a [u8],
    offset: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, len: usize) -> Result<&'a [u8], ProtocolError> {
        let end = self
            .offset
            .checked_add(len)
            .filter(|end| *end <= self.bytes.len())
            .ok_or(ProtocolError::TruncatedUpdate(self.offset))?;

        let taken = &self.bytes[self.offset..end];
        self.offset = end;
        Ok(taken)
    }

    fn u32(&mut self) -> Result<u32, ProtocolError> {
        let offset = self.offset;
        self.take(U32_LEN)?
            .try_into()
            .map(u32::from_ne_bytes)
            .map_err(|_| ProtocolError::TruncatedUpdate(offset))
    }

    fn i32(&mut self) -> Result<i32, ProtocolError> {
        let offset = self.offset;
        self.take(REQUESTER_LEN)?
            .try_into()
            .map(i32::from_ne_bytes)
            .map_err(|_| ProtocolError::TruncatedUpdate(offset))
    }
}

impl<'a> Update<'a> {
    pub fn decode(bytes: &'a [u8]) -> Result<Self, ProtocolError> {
        let mut reader = Reader { bytes, offset: 0 };

        let requester = reader.i32()?;
        let count = reader.u32()?;

        // every change takes at least two length words, don't trust `count` for the allocation
        let mut changes = Vec::with_capacity((count as usize).min(bytes.len() / (2 * U32_LEN)));
        for _ in 0..count {
            let key_len = reader.u32()? as usize;
            let value_len = reader.u32()?;
            let key = reader.take(key_len)?;

            if value_len == REMOVED {
                changes.push(Change::Remove(key));
            } else {
                let value = reader.take(value_len as usize)?;
                changes.push(Change::Write(key, value));
            }
        }

        Ok(Update { requester, changes })
    }
}

/// Length word for a key or value, `None` when it would not fit below the removal marker.
pub(crate) fn field_len(len: usize) -> Option<u32> {
    u32::try_from(len).ok().filter(|len| *len < REMOVED)
}

/// Builds the payload of a request updating the table.
///
/// # Panics
///
/// Keys and values must be shorter than `u32::MAX` bytes; [`write`](Self::write) and
/// [`remove`](Self::remove) panic otherwise.
#[derive(Debug, Clone)]
pub struct UpdateBuilder {
    requester: RequesterId,
    count: u32,
    body: Vec<u8>,
}

impl UpdateBuilder {
    pub fn new(requester: RequesterId) -> Self {
        UpdateBuilder {
            requester,
            count: 0,
            body: vec![],
        }
    }

    pub fn write(mut self, key: &[u8], value: &[u8]) -> Self {
        let value_len = field_len(value.len())
            .unwrap_or_else(|| panic!("value of {} bytes does not fit an update", value.len()));
        self.push(key, value_len);
        self.body.extend_from_slice(value);
        self
    }

    pub fn remove(mut self, key: &[u8]) -> Self {
        self.push(key, REMOVED);
        self
    }

    fn push(&mut self, key: &[u8], value_len: u32) {
        let key_len = field_len(key.len())
            .unwrap_or_else(|| panic!("key of {} bytes does not fit an update", key.len()));

        self.count += 1;
        self.body.extend_from_slice(&key_len.to_ne_bytes());
        self.body.extend_from_slice(&value_len.to_ne_bytes());
        self.body.extend_from_slice(key);
    }

    pub fn build(self) -> Vec<u8> {
        let mut update = Vec::with_capacity(REQUESTER_LEN + U32_LEN + self.body.len());
        update.extend_from_slice(&self.requester.to_ne_bytes());
        update.extend_from_slice(&self.count.to_ne_bytes());
        update.extend_from_slice(&self.body);
        update
    }
}
