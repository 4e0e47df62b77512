//! Typed errors for the relay's local failure modes. Everything that happens on a socket after a
//!  connection was set up is reported through [crate::relay::relay_events::ConnectionEvent]
//!  instead; these errors only fail the single call that caused them.

use std::io;
use thiserror::Error;

use crate::relay::connection_key::ConnectionKey;

/// Malformed wire messages, rejected synchronously without any side effect
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WireError {
    #[error("message too short: {len} bytes, the header alone needs {required}")]
    TooShort { len: usize, required: usize },

    #[error("declared message size {declared} does not match the actual length {actual}")]
    SizeMismatch { declared: usize, actual: usize },

    #[error("reserved bits set in flag byte 0x{0:02x}")]
    ReservedFlags(u8),

    #[error("payload of {0} bytes does not fit into a wire message")]
    TooLarge(usize),

    #[error("invalid IPv4 endpoint: {0}")]
    InvalidEndpoint(String),
}

/// Failures of the shared memory channel. `Full` and `BufferTooSmall` are capacity problems the
///  caller is expected to handle (back off, or re-read with a bigger buffer), the others mean the
///  channel cannot be used as configured.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChannelError {
    #[error("shared region of {0} bytes is too small for a duplex channel")]
    RegionTooSmall(usize),

    #[error("refusing to write an empty message")]
    EmptyMessage,

    #[error("channel full: message needs {required} bytes, {available} available")]
    Full { required: usize, available: usize },

    #[error("read buffer too small: next message has {required} bytes")]
    BufferTooSmall { required: usize },

    #[error("corrupt channel: next message declares {declared} bytes, region holds at most {capacity}")]
    Corrupt { declared: usize, capacity: usize },

    #[error("corrupt channel: cursor {cursor} outside of a data region of {region} bytes")]
    InvalidCursor { cursor: u32, region: usize },
}

/// Failures of multiplexer operations
#[derive(Error, Debug)]
pub enum RelayError {
    #[error("malformed message: {0}")]
    Malformed(#[from] WireError),

    #[error("no active connection for {0}, and a pinned TCP source port is never opened implicitly")]
    NoRoute(ConnectionKey),

    #[error("failed to create connection {key}: {source}")]
    CreateFailed {
        key: ConnectionKey,
        #[source]
        source: io::Error,
    },

    #[error("failed to listen on TCP port {port}: {source}")]
    Listen {
        port: u16,
        #[source]
        source: io::Error,
    },

    #[error("no connection registered for {0}")]
    NotFound(ConnectionKey),

    #[error("connection {0} is shutting down")]
    Closed(ConnectionKey),

    #[error("the multiplexer must be created inside a tokio runtime")]
    NoRuntime,
}
