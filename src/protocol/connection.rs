use std::{
    fmt,
    net::{Shutdown, SocketAddr, TcpStream},
    sync::{
        Arc, Mutex,
        atomic::{AtomicU64, Ordering},
        mpsc,
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use log::{debug, error, trace, warn};

use crate::{
    message::{Args, Message},
    schema::{PING, PONG, Schema},
};

use super::{
    error::ProtocolError,
    lock,
    transport::{MessageReader, MessageWriter},
    user::User,
};

pub type ConnectionId = u64;

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

const DRAIN_POLL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Active,
    Closed,
}

/// Consumer of everything a connection's reader loop produces.
pub(crate) trait Inbound: Send + Sync + 'static {
    /// Called on the reader thread for each application message, in arrival order.
    /// An error is fatal to the connection.
    fn deliver(&self, connection: &Connection, message: Message) -> Result<(), ProtocolError>;

    /// Called exactly once, after the connection is closed. `error` is `None` when the
    /// connection was closed locally.
    fn closed(&self, connection: &Connection, error: Option<ProtocolError>);
}

/// One live, authenticated TCP session.
///
/// Cloning is cheap; all clones refer to the same session. Each connection owns exactly one
/// reader thread and one writer thread. Messages passed to [`Connection::send`] are written in
/// the order they were queued.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

struct Inner {
    id: ConnectionId,
    peer: SocketAddr,
    user: User,
    schema: Schema,
    max_frame: usize,
    socket: TcpStream,
    outbound: Mutex<Option<mpsc::Sender<Message>>>,
    pending: Mutex<Option<Pending>>,
    activity: Mutex<Activity>,
    failure: Mutex<Option<ProtocolError>>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

struct Pending {
    stream: TcpStream,
    receiver: mpsc::Receiver<Message>,
}

struct Activity {
    last_seen: Instant,
    ping_sent: bool,
}

impl Connection {
    /// Wraps an authenticated socket. No thread runs until [`Connection::start`].
    pub(crate) fn new(
        stream: TcpStream,
        user: User,
        schema: Schema,
        max_frame: usize,
    ) -> Result<Self, ProtocolError> {
        let peer = stream.peer_addr()?;
        let socket = stream.try_clone()?;
        let (sender, receiver) = mpsc::channel();

        Ok(Self {
            inner: Arc::new(Inner {
                id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
                peer,
                user,
                schema,
                max_frame,
                socket,
                outbound: Mutex::new(Some(sender)),
                pending: Mutex::new(Some(Pending { stream, receiver })),
                activity: Mutex::new(Activity {
                    last_seen: Instant::now(),
                    ping_sent: false,
                }),
                failure: Mutex::new(None),
                threads: Mutex::new(Vec::new()),
            }),
        })
    }

    /// Spawns the reader and writer loops.
    pub(crate) fn start(&self, inbound: Arc<dyn Inbound>) -> Result<(), ProtocolError> {
        let Pending { stream, receiver } = lock(&self.inner.pending)
            .take()
            .ok_or(ProtocolError::ConnectionClosed)?;

        let schema = &self.inner.schema;
        let writer = MessageWriter::new(stream.try_clone()?, schema.clone(), self.inner.max_frame);
        let reader = MessageReader::new(stream, schema.clone(), self.inner.max_frame);

        let connection = self.clone();
        let write_thread = thread::Builder::new()
            .name(format!("tether-conn-{}-writer", self.inner.id))
            .spawn(move || write_loop(connection, writer, receiver))?;
        lock(&self.inner.threads).push(write_thread);

        let connection = self.clone();
        let spawned = thread::Builder::new()
            .name(format!("tether-conn-{}-reader", self.inner.id))
            .spawn(move || read_loop(connection, reader, inbound));
        match spawned {
            Ok(read_thread) => {
                lock(&self.inner.threads).push(read_thread);
                Ok(())
            }
            Err(e) => {
                self.abort();
                Err(e.into())
            }
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.inner.id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.inner.peer
    }

    pub fn user(&self) -> &User {
        &self.inner.user
    }

    pub fn schema(&self) -> &Schema {
        &self.inner.schema
    }

    pub fn state(&self) -> ConnectionState {
        match lock(&self.inner.outbound).as_ref() {
            Some(_) => ConnectionState::Active,
            None => ConnectionState::Closed,
        }
    }

    pub fn is_alive(&self) -> bool {
        self.state() == ConnectionState::Active
    }

    /// Builds a message from this connection's schema and queues it. Never blocks.
    pub fn send(&self, name: &str, args: Args) -> Result<(), ProtocolError> {
        let message = Message::new(&self.inner.schema, name, args)?;
        self.queue(message)
    }

    /// Queues an already built message. Never blocks.
    pub fn queue(&self, message: Message) -> Result<(), ProtocolError> {
        let outbound = lock(&self.inner.outbound);
        let sender = outbound.as_ref().ok_or(ProtocolError::ConnectionClosed)?;
        sender
            .send(message)
            .map_err(|_| ProtocolError::ConnectionClosed)
    }

    /// Closes the connection after the writer has flushed what is already queued.
    ///
    /// Returns `false` if the connection was already closed.
    pub fn close(&self) -> bool {
        let Some(sender) = lock(&self.inner.outbound).take() else {
            return false;
        };
        drop(sender);
        debug!("closing connection {self}");

        // Without running loops nobody else will shut the socket down.
        if lock(&self.inner.pending).take().is_some() {
            self.shutdown();
        }
        true
    }

    /// Closes the connection immediately, dropping anything still queued.
    pub fn abort(&self) {
        self.close();
        self.shutdown();
    }

    /// Records `error` as the reason this connection ends and aborts it.
    ///
    /// Only the first failure of a still active connection is kept.
    pub(crate) fn fail(&self, error: ProtocolError) {
        if self.is_alive() {
            let mut failure = lock(&self.inner.failure);
            if failure.is_none() {
                *failure = Some(error);
            }
        }
        self.abort();
    }

    fn shutdown(&self) {
        if let Err(e) = self.inner.socket.shutdown(Shutdown::Both) {
            trace!("shutdown of connection {} failed: {e}", self.inner.id);
        }
    }

    fn touch(&self) {
        let mut activity = lock(&self.inner.activity);
        activity.last_seen = Instant::now();
        activity.ping_sent = false;
    }

    /// Pings the peer once it has been silent for `interval`; fails the connection when that
    /// ping stays unanswered for another `timeout`.
    pub(crate) fn check_keepalive(&self, interval: Duration, timeout: Duration) {
        let mut activity = lock(&self.inner.activity);
        let idle = activity.last_seen.elapsed();

        if activity.ping_sent {
            if idle >= interval + timeout {
                drop(activity);
                warn!("connection {self} missed keepalive");
                self.fail(ProtocolError::PingTimeout);
            }
        } else if idle >= interval {
            activity.ping_sent = true;
            drop(activity);
            trace!("pinging connection {self}");
            if let Err(e) = self.send(PING, Args::new()) {
                debug!("could not ping connection {self}: {e}");
            }
        }
    }

    /// Waits for both loops to finish. A loop never joins itself.
    pub(crate) fn join(&self) {
        let handles: Vec<_> = lock(&self.inner.threads).drain(..).collect();
        let current = thread::current().id();

        for handle in handles {
            if handle.thread().id() == current {
                continue;
            }
            if handle.join().is_err() {
                error!("thread of connection {self} panicked");
            }
        }
    }

    /// Like [`Connection::join`], but aborts the connection when its loops are still running
    /// after `grace`. A peer that stopped reading otherwise keeps the writer blocked forever.
    pub(crate) fn join_within(&self, grace: Duration) {
        let deadline = Instant::now() + grace;
        while !self.loops_finished() {
            if Instant::now() >= deadline {
                warn!("connection {self} did not drain within {grace:?}, aborting");
                self.abort();
                break;
            }
            thread::sleep(DRAIN_POLL);
        }
        self.join();
    }

    fn loops_finished(&self) -> bool {
        let current = thread::current().id();
        lock(&self.inner.threads)
            .iter()
            .filter(|handle| handle.thread().id() != current)
            .all(JoinHandle::is_finished)
    }

    fn take_failure(&self) -> Option<ProtocolError> {
        lock(&self.inner.failure).take()
    }
}

impl fmt::Display for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{} ({}@{})", self.inner.id, self.inner.user, self.inner.peer)
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.inner.id)
            .field("peer", &self.inner.peer)
            .field("user", &self.inner.user.name())
            .field("state", &self.state())
            .finish()
    }
}

impl PartialEq for Connection {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl Eq for Connection {}

fn read_loop(
    connection: Connection,
    mut reader: MessageReader<TcpStream>,
    inbound: Arc<dyn Inbound>,
) {
    let error = loop {
        let message = match reader.read() {
            Ok(message) => message,
            Err(e) => break e,
        };
        connection.touch();

        match message.name() {
            PING => {
                if let Err(e) = connection.send(PONG, Args::new()) {
                    break e;
                }
            }
            _ if message.is_builtin() => {}
            _ => {
                trace!("connection {connection} received {message}");
                if let Err(e) = inbound.deliver(&connection, message) {
                    break e;
                }
            }
        }
    };

    let closed_locally = !connection.is_alive();
    let error = connection
        .take_failure()
        .or((!closed_locally).then_some(error));

    connection.close();
    inbound.closed(&connection, error);
}

fn write_loop(
    connection: Connection,
    mut writer: MessageWriter<TcpStream>,
    receiver: mpsc::Receiver<Message>,
) {
    for message in receiver.iter() {
        if let Err(e) = writer.write(&message) {
            if !e.is_disconnect() {
                warn!("failed writing to connection {connection}: {e}");
            }
            connection.fail(e);
            break;
        }
    }

    connection.shutdown();
}

#[cfg(test)]
mod tests {
    use std::net::TcpListener;

    use crate::{DefinitionList, args};

    use super::*;

    #[derive(Debug)]
    enum Event {
        Message(String),
        Closed(Option<String>),
    }

    struct Collector {
        events: Mutex<mpsc::Sender<Event>>,
        fail_on: Option<&'static str>,
    }

    impl Inbound for Collector {
        fn deliver(&self, _: &Connection, message: Message) -> Result<(), ProtocolError> {
            if Some(message.name()) == self.fail_on {
                return Err(ProtocolError::Handler("refused".into()));
            }
            let _ = lock(&self.events).send(Event::Message(message.to_string()));
            Ok(())
        }

        fn closed(&self, _: &Connection, error: Option<ProtocolError>) {
            let _ = lock(&self.events).send(Event::Closed(error.map(|e| format!("{e:?}"))));
        }
    }

    fn schema() -> Schema {
        DefinitionList::from_text("Count n=int\nBoom\nBlob data=str\n")
            .unwrap()
            .instantiate()
            .unwrap()
    }

    const MAX_FRAME: usize = 1 << 16;

    fn started(
        fail_on: Option<&'static str>,
    ) -> (Connection, TcpStream, mpsc::Receiver<Event>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let peer = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (stream, _) = listener.accept().unwrap();

        let (tx, rx) = mpsc::channel();
        let connection = Connection::new(stream, User::new("tester"), schema(), MAX_FRAME).unwrap();
        connection
            .start(Arc::new(Collector {
                events: Mutex::new(tx),
                fail_on,
            }))
            .unwrap();
        (connection, peer, rx)
    }

    fn next(rx: &mpsc::Receiver<Event>) -> Event {
        rx.recv_timeout(Duration::from_secs(5)).unwrap()
    }

    #[test]
    fn inbound_messages_keep_order() {
        let (connection, peer, rx) = started(None);
        let schema = schema();
        let mut writer = MessageWriter::new(peer, schema.clone(), 1024);

        for n in 0..50 {
            let msg = Message::new(&schema, "Count", args!(n = n)).unwrap();
            writer.write(&msg).unwrap();
        }

        for n in 0..50 {
            match next(&rx) {
                Event::Message(m) => assert_eq!(m, format!("Count(n={n})")),
                other => panic!("unexpected {other:?}"),
            }
        }
        connection.abort();
    }

    #[test]
    fn outbound_messages_keep_order() {
        let (connection, peer, _rx) = started(None);
        let mut reader = MessageReader::new(peer, schema(), 1024);

        for n in 0..50 {
            connection.send("Count", args!(n = n)).unwrap();
        }
        for n in 0..50 {
            assert_eq!(reader.read().unwrap().get_int("n"), Some(n));
        }
        connection.close();
    }

    #[test]
    fn ping_is_answered_and_not_delivered() {
        let (connection, peer, rx) = started(None);
        let schema = schema();
        let mut writer = MessageWriter::new(peer.try_clone().unwrap(), schema.clone(), 1024);
        let mut reader = MessageReader::new(peer, schema.clone(), 1024);

        writer
            .write(&Message::new(&schema, PING, args!()).unwrap())
            .unwrap();
        assert_eq!(reader.read().unwrap().name(), PONG);
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
        connection.abort();
    }

    #[test]
    fn peer_disconnect_is_socket_closed() {
        let (connection, peer, rx) = started(None);
        drop(peer);

        match next(&rx) {
            Event::Closed(Some(e)) => assert_eq!(e, "SocketClosed"),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(connection.state(), ConnectionState::Closed);
        assert!(matches!(
            connection.send("Boom", args!()),
            Err(ProtocolError::ConnectionClosed)
        ));
        connection.join();
    }

    #[test]
    fn local_close_reports_no_error() {
        let (connection, _peer, rx) = started(None);

        assert!(connection.close());
        assert!(!connection.close());
        match next(&rx) {
            Event::Closed(None) => {}
            other => panic!("unexpected {other:?}"),
        }
        connection.join();
    }

    #[test]
    fn local_close_flushes_queued_messages() {
        let (connection, peer, _rx) = started(None);
        let mut reader = MessageReader::new(peer, schema(), 1024);

        for n in 0..10 {
            connection.send("Count", args!(n = n)).unwrap();
        }
        connection.close();

        for n in 0..10 {
            assert_eq!(reader.read().unwrap().get_int("n"), Some(n));
        }
        assert!(matches!(reader.read(), Err(ProtocolError::SocketClosed)));
    }

    #[test]
    fn undecodable_frame_closes_connection() {
        let (_connection, mut peer, rx) = started(None);
        crate::protocol::transport::write_raw(&mut peer, &[0, 0, 0], 1024).unwrap();

        match next(&rx) {
            Event::Closed(Some(e)) => assert!(e.starts_with("MalformedMessage")),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn inbound_failure_closes_connection() {
        let (_connection, peer, rx) = started(Some("Boom"));
        let schema = schema();
        let mut writer = MessageWriter::new(peer, schema.clone(), 1024);
        writer
            .write(&Message::new(&schema, "Boom", args!()).unwrap())
            .unwrap();

        match next(&rx) {
            Event::Closed(Some(e)) => assert!(e.starts_with("Handler")),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn keepalive_pings_then_times_out() {
        let (connection, peer, rx) = started(None);
        let mut reader = MessageReader::new(peer, schema(), 1024);

        connection.check_keepalive(Duration::ZERO, Duration::from_secs(60));
        assert_eq!(reader.read().unwrap().name(), PING);

        connection.check_keepalive(Duration::ZERO, Duration::ZERO);
        match next(&rx) {
            Event::Closed(Some(e)) => assert_eq!(e, "PingTimeout"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn close_gives_up_on_peer_that_never_reads() {
        let (connection, _peer, rx) = started(None);
        let blob = "x".repeat(60_000);
        for _ in 0..500 {
            connection.send("Blob", args!(data = blob.as_str())).unwrap();
        }

        let begun = Instant::now();
        assert!(connection.close());
        connection.join_within(Duration::from_millis(200));

        assert!(begun.elapsed() < Duration::from_secs(5));
        match next(&rx) {
            Event::Closed(None) => {}
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn join_within_waits_for_drained_writer() {
        let (connection, peer, _rx) = started(None);
        let mut reader = MessageReader::new(peer, schema(), MAX_FRAME);

        for n in 0..10 {
            connection.send("Count", args!(n = n)).unwrap();
        }
        connection.close();
        connection.join_within(Duration::from_secs(5));

        for n in 0..10 {
            assert_eq!(reader.read().unwrap().get_int("n"), Some(n));
        }
        assert!(matches!(reader.read(), Err(ProtocolError::SocketClosed)));
    }
}
