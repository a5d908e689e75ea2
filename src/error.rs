use std::fmt;

/// Errors surfaced by the blocking socket calls.
///
/// Peer close on a stream read is not an error (the read returns `Ok(0)`),
/// and a datagram arriving while the receive slot is occupied is dropped
/// silently.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Error {
    /// A call was made with an empty buffer, on a closed socket, or on a
    /// socket of the wrong type for the operation.
    InvalidArgument,
    /// The stack could not allocate a protocol control block or a transport
    /// buffer.
    AllocationFailure,
    /// The stack rejected the operation.
    Protocol,
    /// An incoming or outgoing connection was refused.
    ConnectionRefused,
    /// The requested local address is already bound.
    AddressInUse,
    /// A send without a destination on a socket that has no connected peer.
    NotConnected,
    /// The payload exceeds the largest datagram the stack can carry.
    MessageTooLarge,
    /// The operation is documented but not wired up.
    Unsupported,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            Error::InvalidArgument => "invalid argument",
            Error::AllocationFailure => "allocation failure",
            Error::Protocol => "protocol error",
            Error::ConnectionRefused => "connection refused",
            Error::AddressInUse => "address in use",
            Error::NotConnected => "not connected",
            Error::MessageTooLarge => "message too large",
            Error::Unsupported => "operation not supported",
        };
        write!(f, "{msg}")
    }
}

impl std::error::Error for Error {}

pub type Result<T> = std::result::Result<T, Error>;
