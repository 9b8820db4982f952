use std::{
    collections::HashMap,
    panic::{self, AssertUnwindSafe},
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

use log::{debug, error, info, warn};

use crate::{
    message::{Args, Message},
    schema::Schema,
};

use super::{
    connection::{Connection, ConnectionId, Inbound},
    error::{ProtocolError, RejectReason},
    lock,
    room::Room,
    server::Keepalive,
};

const MANAGER_TICK: Duration = Duration::from_millis(100);

/// Registry of live connections and router of their messages to the [`Room`].
///
/// The registry lock only guards adding, removing and listing connections. Routing happens
/// on each connection's reader thread, outside the lock, so a slow handler never blocks
/// registration or other connections.
pub struct Manager {
    room: Arc<dyn Room>,
    schema: Schema,
    max_connections_per_user: usize,
    connections: Mutex<HashMap<ConnectionId, Connection>>,
}

impl Manager {
    pub(crate) fn new(
        room: Arc<dyn Room>,
        schema: Schema,
        max_connections_per_user: usize,
    ) -> Self {
        Self {
            room,
            schema,
            max_connections_per_user,
            connections: Mutex::new(HashMap::new()),
        }
    }

    /// Adds an authenticated connection, unless its user already holds the maximum number of
    /// live connections.
    pub(crate) fn register(&self, connection: &Connection) -> Result<(), ProtocolError> {
        let mut connections = lock(&self.connections);

        let name = connection.user().name();
        let count = connections
            .values()
            .filter(|c| c.user().name() == name)
            .count();
        if count >= self.max_connections_per_user {
            return Err(ProtocolError::HandshakeRejected {
                reason: RejectReason::ConnectionLimit,
            });
        }

        connections.insert(connection.id(), connection.clone());
        info!("registered connection {connection}, {} open", connections.len());
        Ok(())
    }

    /// Removes a connection; returns `false` if it was not registered.
    pub fn deregister(&self, connection: &Connection) -> bool {
        let mut connections = lock(&self.connections);
        let removed = connections.remove(&connection.id()).is_some();
        if removed {
            info!("deregistered connection {connection}, {} open", connections.len());
        }
        removed
    }

    /// Queues a message on every live connection; returns how many accepted it.
    pub fn broadcast(&self, name: &str, args: Args) -> Result<usize, ProtocolError> {
        let message = Message::new(&self.schema, name, args)?;
        let delivered = self
            .connections()
            .iter()
            .filter(|c| c.queue(message.clone()).is_ok())
            .count();
        debug!("broadcast {message} to {delivered} connections");
        Ok(delivered)
    }

    /// Hands one inbound message to the room.
    ///
    /// Handler errors and panics are logged and returned, which closes `connection` only.
    pub fn route(&self, connection: &Connection, message: Message) -> Result<(), ProtocolError> {
        let name = message.name().to_string();
        let outcome =
            panic::catch_unwind(AssertUnwindSafe(|| self.room.handle(connection, message)));

        match outcome {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                error!("room failed to handle '{name}' from {connection}: {e}");
                Err(ProtocolError::Handler(e.to_string()))
            }
            Err(_) => {
                error!("room panicked handling '{name}' from {connection}");
                Err(ProtocolError::Handler(format!("panic while handling '{name}'")))
            }
        }
    }

    /// Snapshot of the live connections.
    pub fn connections(&self) -> Vec<Connection> {
        lock(&self.connections).values().cloned().collect()
    }

    pub fn get(&self, id: ConnectionId) -> Option<Connection> {
        lock(&self.connections).get(&id).cloned()
    }

    pub fn len(&self) -> usize {
        lock(&self.connections).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.connections).is_empty()
    }

    /// Number of live connections held by the user called `name`.
    pub fn user_count(&self, name: &str) -> usize {
        lock(&self.connections)
            .values()
            .filter(|c| c.user().name() == name)
            .count()
    }

    pub(crate) fn room(&self) -> &Arc<dyn Room> {
        &self.room
    }

    /// Body of the manager thread: keeps connections alive until `halt` is raised.
    pub(crate) fn run(
        &self,
        keepalive: Option<Keepalive>,
        halt: &AtomicBool,
    ) -> Result<(), ProtocolError> {
        info!("manager starting");

        while !halt.load(Ordering::SeqCst) {
            if let Some(keepalive) = keepalive {
                for connection in self.connections() {
                    connection.check_keepalive(keepalive.interval, keepalive.timeout);
                }
            }
            thread::sleep(MANAGER_TICK);
        }

        info!("manager stopped");
        Ok(())
    }

    /// Closes every connection, letting writers flush, and waits for their threads.
    ///
    /// Connections still flushing once `grace` has passed are aborted.
    pub(crate) fn close_all(&self, grace: Duration) {
        let connections = self.connections();
        if !connections.is_empty() {
            info!("closing {} connections", connections.len());
        }
        for connection in &connections {
            connection.close();
        }

        let deadline = Instant::now() + grace;
        for connection in &connections {
            connection.join_within(deadline.saturating_duration_since(Instant::now()));
        }
    }
}

impl Inbound for Manager {
    fn deliver(&self, connection: &Connection, message: Message) -> Result<(), ProtocolError> {
        self.route(connection, message)
    }

    fn closed(&self, connection: &Connection, error: Option<ProtocolError>) {
        match error {
            None => debug!("connection {connection} closed"),
            Some(ProtocolError::SocketClosed) => info!("connection {connection} disconnected"),
            Some(e) => warn!("connection {connection} failed: {e}"),
        }

        if self.deregister(connection) {
            self.room.user_exit(connection);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::{TcpListener, TcpStream};

    use crate::{
        DefinitionList, args,
        protocol::{HandlerError, MessageReader, MessageWriter, user::User},
    };

    use super::*;

    struct Recorder {
        seen: Mutex<Vec<(ConnectionId, String)>>,
        exits: Mutex<Vec<ConnectionId>>,
    }

    impl Room for Recorder {
        fn handle(&self, connection: &Connection, message: Message) -> Result<(), HandlerError> {
            match message.name() {
                "Fail" => Err("asked to fail".into()),
                "Panic" => panic!("asked to panic"),
                _ => {
                    lock(&self.seen).push((connection.id(), message.to_string()));
                    Ok(())
                }
            }
        }

        fn user_exit(&self, connection: &Connection) {
            lock(&self.exits).push(connection.id());
        }
    }

    fn schema() -> Schema {
        DefinitionList::from_text("Note text=str\nFail\nPanic\n")
            .unwrap()
            .instantiate()
            .unwrap()
    }

    fn manager(limit: usize) -> (Arc<Manager>, Arc<Recorder>) {
        let room = Arc::new(Recorder {
            seen: Mutex::new(Vec::new()),
            exits: Mutex::new(Vec::new()),
        });
        let manager = Arc::new(Manager::new(room.clone(), schema(), limit));
        (manager, room)
    }

    const GRACE: Duration = Duration::from_secs(5);

    fn connection(user: &str) -> (Connection, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let peer = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (stream, _) = listener.accept().unwrap();
        (
            Connection::new(stream, User::new(user), schema(), 1 << 16).unwrap(),
            peer,
        )
    }

    fn wait_until(mut f: impl FnMut() -> bool) {
        for _ in 0..200 {
            if f() {
                return;
            }
            thread::sleep(Duration::from_millis(10));
        }
        panic!("condition not reached");
    }

    #[test]
    fn register_and_deregister() {
        let (manager, _) = manager(4);
        let (a, _pa) = connection("ann");
        let (b, _pb) = connection("bob");

        manager.register(&a).unwrap();
        manager.register(&b).unwrap();
        assert_eq!(manager.len(), 2);
        assert_eq!(manager.get(a.id()), Some(a.clone()));

        assert!(manager.deregister(&a));
        assert!(!manager.deregister(&a));
        assert_eq!(manager.connections(), vec![b]);
    }

    #[test]
    fn register_enforces_user_limit() {
        let (manager, _) = manager(1);
        let (first, _p1) = connection("ann");
        let (second, _p2) = connection("ann");
        let (other, _p3) = connection("bob");

        manager.register(&first).unwrap();
        assert!(matches!(
            manager.register(&second),
            Err(ProtocolError::HandshakeRejected {
                reason: RejectReason::ConnectionLimit
            })
        ));
        manager.register(&other).unwrap();
        assert_eq!(manager.user_count("ann"), 1);
    }

    #[test]
    fn broadcast_reaches_every_live_connection() {
        let (manager, _) = manager(4);
        let (a, pa) = connection("ann");
        let (b, pb) = connection("bob");
        for c in [&a, &b] {
            manager.register(c).unwrap();
            c.start(manager.clone()).unwrap();
        }

        assert_eq!(manager.broadcast("Note", args!(text = "hi")).unwrap(), 2);
        for peer in [pa, pb] {
            let mut reader = MessageReader::new(peer, schema(), 1024);
            assert_eq!(reader.read().unwrap().get_str("text"), Some("hi"));
        }
        assert!(matches!(
            manager.broadcast("Note", args!(text = 1)),
            Err(ProtocolError::TypeMismatch { .. })
        ));
        manager.close_all(GRACE);
    }

    #[test]
    fn handler_failure_isolated_to_its_connection() {
        let (manager, room) = manager(4);
        let (a, pa) = connection("ann");
        let (b, pb) = connection("bob");
        for c in [&a, &b] {
            manager.register(c).unwrap();
            c.start(manager.clone()).unwrap();
        }

        let schema = schema();
        let mut wa = MessageWriter::new(pa, schema.clone(), 1024);
        let mut wb = MessageWriter::new(pb, schema.clone(), 1024);

        wa.write(&Message::new(&schema, "Fail", args!()).unwrap()).unwrap();
        wait_until(|| !lock(&room.exits).is_empty());
        assert!(!a.is_alive());
        assert_eq!(manager.len(), 1);
        assert_eq!(lock(&room.exits).as_slice(), &[a.id()]);

        wb.write(&Message::new(&schema, "Note", args!(text = "still here")).unwrap())
            .unwrap();
        wait_until(|| !lock(&room.seen).is_empty());
        assert_eq!(
            lock(&room.seen).as_slice(),
            &[(b.id(), "Note(text=\"still here\")".to_string())]
        );
        assert!(b.is_alive());
        manager.close_all(GRACE);
    }

    #[test]
    fn handler_panic_is_caught() {
        let (manager, _) = manager(4);
        let (a, _pa) = connection("ann");
        manager.register(&a).unwrap();

        let message = Message::new(&schema(), "Panic", args!()).unwrap();
        assert!(matches!(
            manager.route(&a, message),
            Err(ProtocolError::Handler(_))
        ));
    }

    #[test]
    fn run_stops_on_halt() {
        let (manager, _) = manager(4);
        let halt = Arc::new(AtomicBool::new(false));

        let handle = {
            let manager = manager.clone();
            let halt = halt.clone();
            thread::spawn(move || manager.run(None, &halt))
        };
        halt.store(true, Ordering::SeqCst);
        handle.join().unwrap().unwrap();
    }

    #[test]
    fn close_all_is_bounded_by_grace() {
        let (manager, room) = manager(4);
        let (stuck, _never_reads) = connection("ann");
        let (fine, pf) = connection("bob");
        for c in [&stuck, &fine] {
            manager.register(c).unwrap();
            c.start(manager.clone()).unwrap();
        }

        let blob = "x".repeat(60_000);
        for _ in 0..500 {
            stuck.send("Note", args!(text = blob.as_str())).unwrap();
        }
        fine.send("Note", args!(text = "bye")).unwrap();

        let begun = Instant::now();
        manager.close_all(Duration::from_millis(200));
        assert!(begun.elapsed() < Duration::from_secs(5));

        let mut reader = MessageReader::new(pf, schema(), 1024);
        assert_eq!(reader.read().unwrap().get_str("text"), Some("bye"));
        wait_until(|| lock(&room.exits).len() == 2);
        assert!(manager.is_empty());
    }
}
