use thiserror::Error;

use super::Status;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("declared message length {len} exceeds the limit of {max} bytes")]
    MessageTooLarge { len: usize, max: usize },
    #[error("payload of {0} bytes is too short to carry a requester id")]
    MissingRequester(usize),
    // update encoding ran out of bytes at the given offset
    #[error("update is truncated at byte {0}")]
    TruncatedUpdate(usize),
    #[error("unexpected acknowledgment status {0}")]
    UnexpectedStatus(Status),
}
