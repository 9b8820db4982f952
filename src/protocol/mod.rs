//! Client-server communication protocol.
//!
//! This module implements everything that happens after a [`Schema`](crate::Schema) has been
//! built: framing and encoding messages, the authenticated handshake, and the threaded
//! server/client architecture that moves messages between peers.
//!
//! # Overview
//!
//! A server is a small supervised group of threads:
//!
//! - the [`Listener`] accepts sockets and runs handshakes on a worker pool;
//! - the [`Manager`] keeps the registry of live [`Connection`]s, runs keepalive and routes
//!   inbound messages to the application's [`Room`];
//! - every [`Connection`] owns one reader thread and one writer thread.
//!
//! The [`Client`] runs the same reader/writer loops against a single server and offers both a
//! callback-driven and a blocking request/reply API.
//!
//! # Binary Format
//!
//! Every unit on the wire is a frame:
//!
//! - a 4-byte big-endian unsigned payload length, followed by
//! - the payload, capped at a configurable maximum.
//!
//! Message payloads hold the message name followed by the argument values in declared order.
//! Integers are 8-byte signed big-endian, floats IEEE-754 doubles, booleans a single byte and
//! strings a 64-bit big-endian byte count followed by UTF-8 bytes. Handshake frames carry a
//! bincode-encoded [`Handshake`] value instead.
//!
//! # See Also
//!
//! - [`schema`](crate::schema): The vocabulary every payload is checked against.
mod client;
mod codec;
mod connection;
mod handshake;
mod listener;
mod manager;
mod room;
mod server;
mod thread;
mod transport;
mod user;

use std::sync::{Mutex, MutexGuard};

use thread::ThreadPool;

pub use client::{Client, ClientConfig};
pub use codec::{decode, encode};
pub use connection::{Connection, ConnectionId, ConnectionState};
pub use handshake::{
    Encryptor, Handshake, HandshakeState, UserValidator, VersionValidator, sha256_credential,
};
pub use listener::Listener;
pub use manager::Manager;
pub use room::{HandlerError, Room};
pub use server::{Keepalive, Server, ServerConfig, StopHandle};
pub use transport::{MessageReader, MessageWriter};
pub use user::User;

/// Default cap on a single frame's payload.
pub const DEFAULT_MAX_FRAME: usize = 1 << 20;

/// Locks `mutex`, recovering the data if a panicking thread poisoned it.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

pub mod error {
    use std::{fmt, io};

    use thiserror::Error;

    use crate::schema::ArgType;

    /// Why the accepting side refused a handshake.
    ///
    /// Only the accepting side knows the reason; the peer sees [`RejectReason::Unspecified`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum RejectReason {
        Version,
        Credentials,
        ConnectionLimit,
        UnexpectedFrame,
        Unspecified,
    }

    impl fmt::Display for RejectReason {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            let reason = match self {
                RejectReason::Version => "unsupported version",
                RejectReason::Credentials => "invalid credentials",
                RejectReason::ConnectionLimit => "too many connections for user",
                RejectReason::UnexpectedFrame => "unexpected handshake frame",
                RejectReason::Unspecified => "rejected by server",
            };
            write!(f, "{reason}")
        }
    }

    #[derive(Debug, Error)]
    pub enum ProtocolError {
        #[error("frame of {size} bytes exceeds limit of {max} bytes")]
        FrameTooLarge { size: usize, max: usize },

        #[error("malformed message: {0}")]
        MalformedMessage(String),

        #[error("unknown message '{0}'")]
        UnknownMessage(String),

        #[error("argument '{argument}' of '{message}' must be {expected}, got {found}")]
        TypeMismatch {
            message: String,
            argument: String,
            expected: ArgType,
            found: String,
        },

        #[error("message '{message}' is missing argument '{argument}'")]
        MissingArgument { message: String, argument: String },

        #[error("message '{message}' does not declare argument '{argument}'")]
        UnexpectedArgument { message: String, argument: String },

        #[error("handshake rejected: {reason}")]
        HandshakeRejected { reason: RejectReason },

        #[error("socket closed")]
        SocketClosed,

        #[error("connection closed")]
        ConnectionClosed,

        #[error("timed out waiting for a message")]
        Timeout,

        #[error("expected message '{expected}', got '{actual}'")]
        UnexpectedMessage { expected: String, actual: String },

        #[error("peer did not answer keepalive")]
        PingTimeout,

        #[error("room handler failed: {0}")]
        Handler(String),

        #[error("{0} thread panicked")]
        Panicked(&'static str),

        #[error("failed to encode frame: {0}")]
        Encode(#[from] bincode::error::EncodeError),

        #[error("failed to decode frame: {0}")]
        Decode(#[from] bincode::error::DecodeError),

        #[error("transport IO error: {0}")]
        Io(#[source] io::Error),
    }

    impl From<io::Error> for ProtocolError {
        fn from(value: io::Error) -> Self {
            match value.kind() {
                io::ErrorKind::UnexpectedEof
                | io::ErrorKind::ConnectionReset
                | io::ErrorKind::ConnectionAborted
                | io::ErrorKind::BrokenPipe
                | io::ErrorKind::NotConnected => ProtocolError::SocketClosed,
                _ => ProtocolError::Io(value),
            }
        }
    }

    impl ProtocolError {
        /// `true` for failures that mean the peer went away rather than misbehaved.
        pub fn is_disconnect(&self) -> bool {
            matches!(
                self,
                ProtocolError::SocketClosed | ProtocolError::ConnectionClosed
            )
        }
    }

}
