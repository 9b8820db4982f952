use std::{
    collections::VecDeque,
    fmt,
    net::{SocketAddr, TcpStream},
    panic::{self, AssertUnwindSafe},
    sync::{Arc, Condvar, Mutex},
    time::{Duration, Instant},
};

use log::{debug, info, warn};

use crate::{
    message::{Args, Message},
    schema::Schema,
};

use super::{
    DEFAULT_MAX_FRAME,
    connection::{Connection, Inbound},
    error::ProtocolError,
    handshake::{Encryptor, initiate, login_timeout},
    lock,
    user::User,
};

#[derive(Clone)]
pub struct ClientConfig {
    pub address: SocketAddr,
    pub username: String,
    pub password: String,
    pub version: (i64, i64, i64),
    pub max_frame: usize,
    pub login_timeout: Duration,
    /// How long [`Client::stop`] lets queued messages flush before aborting.
    pub close_timeout: Duration,
}

impl fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConfig")
            .field("address", &self.address)
            .field("username", &self.username)
            .field("password", &"***")
            .field("version", &self.version)
            .field("max_frame", &self.max_frame)
            .field("login_timeout", &self.login_timeout)
            .field("close_timeout", &self.close_timeout)
            .finish()
    }
}

impl ClientConfig {
    pub fn new(
        address: SocketAddr,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            address,
            username: username.into(),
            password: password.into(),
            version: (0, 0, 0),
            max_frame: DEFAULT_MAX_FRAME,
            login_timeout: Duration::from_secs(10),
            close_timeout: Duration::from_secs(5),
        }
    }

    pub fn with_version(mut self, major: i64, minor: i64, revision: i64) -> Self {
        self.version = (major, minor, revision);
        self
    }

    pub fn with_max_frame(mut self, max_frame: usize) -> Self {
        self.max_frame = max_frame;
        self
    }

    pub fn with_login_timeout(mut self, login_timeout: Duration) -> Self {
        self.login_timeout = login_timeout;
        self
    }

    pub fn with_close_timeout(mut self, close_timeout: Duration) -> Self {
        self.close_timeout = close_timeout;
        self
    }
}

type Handler = Box<dyn FnMut(&Connection, Message) + Send>;

/// Where the client's reader thread puts inbound messages.
#[derive(Default)]
struct Inbox {
    handler: Mutex<Option<Handler>>,
    state: Mutex<InboxState>,
    ready: Condvar,
}

#[derive(Default)]
struct InboxState {
    messages: VecDeque<Message>,
    closed: bool,
    /// Why the connection ended; reported once.
    failure: Option<ProtocolError>,
}

impl Inbox {
    fn push(&self, message: Message) {
        lock(&self.state).messages.push_back(message);
        self.ready.notify_all();
    }

    /// Marks the inbox closed. Only the first close records its failure.
    fn close(&self, failure: Option<ProtocolError>) {
        let mut state = lock(&self.state);
        if !state.closed {
            state.closed = true;
            state.failure = failure;
        }
        drop(state);
        self.ready.notify_all();
    }

    fn wait_closed(&self) {
        let mut state = lock(&self.state);
        while !state.closed {
            state = self.ready.wait(state).unwrap_or_else(|e| e.into_inner());
        }
    }

    fn take_failure(&self) -> Option<ProtocolError> {
        lock(&self.state).failure.take()
    }

    fn try_pop(&self) -> Option<Message> {
        lock(&self.state).messages.pop_front()
    }

    /// Pops the next message, waiting up to `timeout` for one to arrive.
    ///
    /// The message is consumed even when its name is not `expected`.
    fn pop(&self, expected: &str, timeout: Option<Duration>) -> Result<Message, ProtocolError> {
        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        let mut state = lock(&self.state);

        loop {
            if let Some(message) = state.messages.pop_front() {
                if message.name() != expected {
                    return Err(ProtocolError::UnexpectedMessage {
                        expected: expected.to_string(),
                        actual: message.name().to_string(),
                    });
                }
                return Ok(message);
            }
            if state.closed {
                return Err(state.failure.take().unwrap_or(ProtocolError::SocketClosed));
            }

            state = match deadline {
                None => self.ready.wait(state).unwrap_or_else(|e| e.into_inner()),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(ProtocolError::Timeout);
                    }
                    self.ready
                        .wait_timeout(state, deadline - now)
                        .map(|(state, _)| state)
                        .unwrap_or_else(|e| e.into_inner().0)
                }
            };
        }
    }
}

impl Inbound for Inbox {
    fn deliver(&self, connection: &Connection, message: Message) -> Result<(), ProtocolError> {
        if let Some(handler) = lock(&self.handler).as_mut() {
            let name = message.name().to_string();
            return panic::catch_unwind(AssertUnwindSafe(|| handler(connection, message)))
                .map_err(|_| ProtocolError::Handler(format!("panic while handling '{name}'")));
        }

        self.push(message);
        Ok(())
    }

    fn closed(&self, connection: &Connection, error: Option<ProtocolError>) {
        match &error {
            None => debug!("client connection {connection} closed"),
            Some(ProtocolError::SocketClosed) => info!("server closed connection {connection}"),
            Some(e) => warn!("client connection {connection} failed: {e}"),
        }
        self.close(error);
    }
}

/// Connecting peer of the protocol.
///
/// After [`Client::connect`] has completed the handshake the client runs the same reader and
/// writer threads as a server-side [`Connection`]. Inbound messages are either queued for
/// [`Client::receive`] and [`Client::receive_blocking`], or handed to a callback installed
/// with [`Client::connect_with_handler`]. Keepalive pings from the server are answered
/// without surfacing.
///
/// All methods take `&self`, so a client can be shared between a thread blocked in
/// [`Client::receive_blocking`] and one calling [`Client::stop`].
pub struct Client {
    connection: Connection,
    inbox: Arc<Inbox>,
    close_timeout: Duration,
}

impl Client {
    /// Connects, logs in and starts the connection threads in queued mode.
    pub fn connect(
        schema: Schema,
        config: &ClientConfig,
        encrypt: &Encryptor,
    ) -> Result<Self, ProtocolError> {
        Self::open(schema, config, encrypt, None)
    }

    /// Like [`Client::connect`], but calls `handler` on the reader thread for every inbound
    /// message instead of queuing it.
    pub fn connect_with_handler<F>(
        schema: Schema,
        config: &ClientConfig,
        encrypt: &Encryptor,
        handler: F,
    ) -> Result<Self, ProtocolError>
    where
        F: FnMut(&Connection, Message) + Send + 'static,
    {
        Self::open(schema, config, encrypt, Some(Box::new(handler)))
    }

    fn open(
        schema: Schema,
        config: &ClientConfig,
        encrypt: &Encryptor,
        handler: Option<Handler>,
    ) -> Result<Self, ProtocolError> {
        let mut stream = TcpStream::connect_timeout(&config.address, config.login_timeout)?;
        stream.set_read_timeout(Some(config.login_timeout))?;
        initiate(
            &mut stream,
            config.version,
            &config.username,
            &config.password,
            encrypt,
        )
        .map_err(login_timeout)?;
        stream.set_read_timeout(None)?;

        let connection = Connection::new(
            stream,
            User::new(config.username.as_str()),
            schema,
            config.max_frame,
        )?;
        let inbox = Arc::new(Inbox {
            handler: Mutex::new(handler),
            ..Inbox::default()
        });
        connection.start(inbox.clone())?;

        info!("logged in to {} as {}", config.address, config.username);
        Ok(Self {
            connection,
            inbox,
            close_timeout: config.close_timeout,
        })
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    pub fn schema(&self) -> &Schema {
        self.connection.schema()
    }

    pub fn is_alive(&self) -> bool {
        self.connection.is_alive()
    }

    /// Builds a message and queues it for the writer thread. Never blocks.
    pub fn send(&self, name: &str, args: Args) -> Result<(), ProtocolError> {
        self.connection.send(name, args)
    }

    /// Queues an already built message. Never blocks.
    pub fn queue(&self, message: Message) -> Result<(), ProtocolError> {
        self.connection.queue(message)
    }

    /// Next queued message, if one has arrived.
    pub fn receive(&self) -> Option<Message> {
        self.inbox.try_pop()
    }

    /// Waits for the next message and checks that it is an `expected` one.
    ///
    /// # Errors
    ///
    /// - [`ProtocolError::UnexpectedMessage`] if the next message has another name; that
    ///   message is consumed.
    /// - [`ProtocolError::Timeout`] if nothing arrived within `timeout`.
    /// - The error that ended the connection once nothing is left queued, for example
    ///   [`ProtocolError::UnknownMessage`] when the server sent a message this schema lacks.
    ///   It is reported once; later calls, and calls after a local close, get
    ///   [`ProtocolError::SocketClosed`].
    pub fn receive_blocking(
        &self,
        expected: &str,
        timeout: Option<Duration>,
    ) -> Result<Message, ProtocolError> {
        self.inbox.pop(expected, timeout)
    }

    /// Blocks until the connection has ended, then returns what ended it.
    ///
    /// A server that closed the connection shows up as [`ProtocolError::SocketClosed`]. Must not
    /// be called from a handler installed with [`Client::connect_with_handler`].
    pub fn join(&self) -> Result<(), ProtocolError> {
        self.inbox.wait_closed();
        self.connection.join();
        self.inbox.take_failure().map_or(Ok(()), Err)
    }

    /// Closes the connection after flushing queued messages and waits for its threads.
    ///
    /// Messages still unsent after [`ClientConfig::close_timeout`] are dropped. Returns the
    /// failure that had already ended the connection, if any and not yet reported.
    pub fn stop(&self) -> Result<(), ProtocolError> {
        self.connection.close();
        self.connection.join_within(self.close_timeout);
        self.inbox.close(None);
        self.inbox.take_failure().map_or(Ok(()), Err)
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            debug!("client connection ended with: {e}");
        }
    }
}
