//! Typed message passing over persistent TCP connections.
//!
//! Both peers build the same [`Schema`] from a [`DefinitionList`], authenticate through a
//! salted challenge handshake and then exchange [`Message`]s that are checked against the
//! schema on both ends. A [`Server`] routes everything it receives to an application
//! [`Room`]; a [`Client`] talks to one server either through callbacks or in blocking
//! request/reply style.
//!
//! ```rust,no_run
//! use std::{sync::Arc, time::Duration};
//!
//! use tether::{Client, ClientConfig, DefinitionList, Encryptor, args};
//!
//! let schema = DefinitionList::from_text("Ping\nPong\n")?.instantiate()?;
//! let config = ClientConfig::new("127.0.0.1:4000".parse()?, "michael", "secret")
//!     .with_version(1, 0, 0);
//! let encrypt: Encryptor =
//!     Arc::new(|password: &str, salt: &[u8]| [password.as_bytes(), salt].concat());
//!
//! let client = Client::connect(schema, &config, &encrypt)?;
//! client.send("Ping", args!())?;
//! client.receive_blocking("Pong", Some(Duration::from_secs(5)))?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
pub mod message;
pub mod protocol;
pub mod schema;

pub use message::{Args, Message, Value};
pub use protocol::{
    Client, ClientConfig, Connection, ConnectionId, ConnectionState, Encryptor, HandlerError,
    Keepalive, Manager, Room, Server, ServerConfig, StopHandle, User, UserValidator,
    VersionValidator, sha256_credential,
    error::{ProtocolError, RejectReason},
};
pub use schema::{ArgType, DefinitionList, MessageDefinition, Schema, SchemaError};
