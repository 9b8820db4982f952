use std::{error::Error, sync::Arc};

use crate::message::Message;

use super::{connection::Connection, manager::Manager};

pub type HandlerError = Box<dyn Error + Send + Sync>;

/// Application logic invoked for every inbound message.
///
/// A single room is shared by all connections and is called concurrently from their reader
/// threads; calls for one connection arrive in that connection's message order. An error
/// returned from [`Room::handle`] closes the offending connection only.
///
/// # Example
/// ```rust
/// use tether::{Connection, HandlerError, Message, Room, args};
///
/// struct Echo;
///
/// impl Room for Echo {
///     fn handle(&self, connection: &Connection, message: Message) -> Result<(), HandlerError> {
///         match message.name() {
///             "Ping" => connection.send("Pong", args!())?,
///             other => return Err(format!("unexpected message {other}").into()),
///         }
///         Ok(())
///     }
/// }
/// ```
pub trait Room: Send + Sync + 'static {
    fn handle(&self, connection: &Connection, message: Message) -> Result<(), HandlerError>;

    /// Called once when the server starts, before any connection is accepted.
    ///
    /// The manager owns the room, so keep only a [`Weak`](std::sync::Weak) reference to it.
    fn attach(&self, _manager: &Arc<Manager>) {}

    /// Called after a connection has been registered.
    fn user_enter(&self, _connection: &Connection) {}

    /// Called after a connection has been deregistered; it can no longer send.
    fn user_exit(&self, _connection: &Connection) {}
}
