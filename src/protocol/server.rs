use std::{
    net::SocketAddr,
    panic::{self, AssertUnwindSafe},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
        mpsc,
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use log::{error, info, warn};

use crate::schema::Schema;

use super::{
    DEFAULT_MAX_FRAME,
    error::ProtocolError,
    handshake::{UserValidator, VersionValidator},
    listener::{Admission, Listener},
    manager::Manager,
    room::Room,
};

/// Idle detection for server-side connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Keepalive {
    /// Silence after which the peer is pinged.
    pub interval: Duration,
    /// How long an unanswered ping is tolerated before the connection is dropped.
    pub timeout: Duration,
}

impl Default for Keepalive {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub address: SocketAddr,
    pub max_frame: usize,
    pub login_timeout: Duration,
    pub keepalive: Option<Keepalive>,
    pub max_connections_per_user: usize,
    pub handshake_workers: usize,
    /// How long a stopping server lets connections flush before aborting them.
    pub close_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: SocketAddr::from(([127, 0, 0, 1], 0)),
            max_frame: DEFAULT_MAX_FRAME,
            login_timeout: Duration::from_secs(10),
            keepalive: Some(Keepalive::default()),
            max_connections_per_user: 4,
            handshake_workers: 8,
            close_timeout: Duration::from_secs(5),
        }
    }
}

impl ServerConfig {
    pub fn with_address(mut self, address: SocketAddr) -> Self {
        self.address = address;
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

    /// `None` disables keepalive pings.
    pub fn with_keepalive(mut self, keepalive: Option<Keepalive>) -> Self {
        self.keepalive = keepalive;
        self
    }

    pub fn with_max_connections_per_user(mut self, max: usize) -> Self {
        self.max_connections_per_user = max;
        self
    }

    pub fn with_handshake_workers(mut self, workers: usize) -> Self {
        self.handshake_workers = workers;
        self
    }

    pub fn with_close_timeout(mut self, close_timeout: Duration) -> Self {
        self.close_timeout = close_timeout;
        self
    }
}

enum Event {
    Stop,
    Exited {
        component: &'static str,
        result: Result<(), ProtocolError>,
    },
}

/// Requests a graceful stop of a running [`Server`] from any thread.
#[derive(Clone)]
pub struct StopHandle {
    events: mpsc::Sender<Event>,
}

impl StopHandle {
    pub fn stop(&self) {
        // A closed channel means the server is already down.
        let _ = self.events.send(Event::Stop);
    }
}

/// Supervised group of threads serving one [`Room`].
///
/// [`Server::start`] spawns the listener, the manager and a supervisor that watches both.
/// Failures of single connections are contained, but if the listener or the manager fails or
/// panics, the supervisor shuts everything down and [`Server::join`] returns that first
/// error.
///
/// # Example
/// ```rust,no_run
/// use std::sync::Arc;
///
/// use tether::{
///     Connection, DefinitionList, HandlerError, Message, Room, Server, ServerConfig, User, args,
/// };
///
/// struct Pong;
///
/// impl Room for Pong {
///     fn handle(&self, connection: &Connection, _: Message) -> Result<(), HandlerError> {
///         Ok(connection.send("Pong", args!())?)
///     }
/// }
///
/// let schema = DefinitionList::from_text("Ping\nPong\n")?.instantiate()?;
/// let mut server = Server::new(
///     schema,
///     Arc::new(Pong),
///     Arc::new(|major: i64, _: i64, _: i64| major == 1),
///     Arc::new(|name: &str, _: &[u8], _: &[u8]| Some(User::new(name))),
///     ServerConfig::default().with_address("0.0.0.0:4000".parse()?),
/// );
/// server.run()?;
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// ```
pub struct Server {
    schema: Schema,
    config: ServerConfig,
    versions: VersionValidator,
    users: UserValidator,
    manager: Arc<Manager>,
    local_addr: Option<SocketAddr>,
    events: mpsc::Sender<Event>,
    receiver: Option<mpsc::Receiver<Event>>,
    supervisor: Option<JoinHandle<Result<(), ProtocolError>>>,
}

impl Server {
    pub fn new(
        schema: Schema,
        room: Arc<dyn Room>,
        versions: VersionValidator,
        users: UserValidator,
        config: ServerConfig,
    ) -> Self {
        let manager = Arc::new(Manager::new(
            room,
            schema.clone(),
            config.max_connections_per_user,
        ));
        let (events, receiver) = mpsc::channel();

        Self {
            schema,
            config,
            versions,
            users,
            manager,
            local_addr: None,
            events,
            receiver: Some(receiver),
            supervisor: None,
        }
    }

    /// Binds the listening socket and spawns the server threads.
    ///
    /// Returns the bound address. Calling it again on a started server does nothing.
    pub fn start(&mut self) -> Result<SocketAddr, ProtocolError> {
        if let Some(address) = self.local_addr {
            return Ok(address);
        }
        if self.receiver.is_none() {
            return Err(ProtocolError::ConnectionClosed);
        }

        let listener = Listener::bind(
            self.config.address,
            self.config.handshake_workers,
            Admission {
                manager: self.manager.clone(),
                schema: self.schema.clone(),
                versions: self.versions.clone(),
                users: self.users.clone(),
                max_frame: self.config.max_frame,
                login_timeout: self.config.login_timeout,
            },
        )?;
        let address = listener.local_addr();
        self.manager.room().attach(&self.manager);

        let halt = Arc::new(AtomicBool::new(false));
        let components = vec![
            self.spawn("listener", {
                let halt = halt.clone();
                move || listener.run(&halt)
            })?,
            self.spawn("manager", {
                let halt = halt.clone();
                let manager = self.manager.clone();
                let keepalive = self.config.keepalive;
                move || manager.run(keepalive, &halt)
            })?,
        ];

        let Some(receiver) = self.receiver.take() else {
            return Err(ProtocolError::ConnectionClosed);
        };
        let manager = self.manager.clone();
        let grace = self.config.close_timeout;
        self.supervisor = Some(
            thread::Builder::new()
                .name("tether-supervisor".into())
                .spawn(move || supervise(receiver, halt, components, manager, grace))?,
        );

        self.local_addr = Some(address);
        info!("server started at {address}");
        Ok(address)
    }

    fn spawn<F>(&self, component: &'static str, f: F) -> Result<JoinHandle<()>, ProtocolError>
    where
        F: FnOnce() -> Result<(), ProtocolError> + Send + 'static,
    {
        let events = self.events.clone();
        let handle = thread::Builder::new()
            .name(format!("tether-{component}"))
            .spawn(move || {
                let result = panic::catch_unwind(AssertUnwindSafe(f))
                    .unwrap_or(Err(ProtocolError::Panicked(component)));
                let _ = events.send(Event::Exited { component, result });
            })?;
        Ok(handle)
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn manager(&self) -> &Arc<Manager> {
        &self.manager
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            events: self.events.clone(),
        }
    }

    pub fn is_running(&self) -> bool {
        self.supervisor
            .as_ref()
            .is_some_and(|supervisor| !supervisor.is_finished())
    }

    /// Stops accepting, closes every connection after flushing it and waits for all threads.
    ///
    /// Connections that cannot flush within [`ServerConfig::close_timeout`] are aborted.
    pub fn stop(&mut self) -> Result<(), ProtocolError> {
        self.stop_handle().stop();
        self.join()
    }

    /// Blocks until the server has stopped; returns the first failure of the listener or
    /// the manager, if any.
    pub fn join(&mut self) -> Result<(), ProtocolError> {
        match self.supervisor.take() {
            Some(supervisor) => supervisor
                .join()
                .unwrap_or(Err(ProtocolError::Panicked("supervisor"))),
            None => Ok(()),
        }
    }

    /// Starts the server and blocks until it stops.
    pub fn run(&mut self) -> Result<(), ProtocolError> {
        self.start()?;
        self.join()
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        if self.supervisor.is_some() {
            if let Err(e) = self.stop() {
                error!("server stopped with error: {e}");
            }
        }
    }
}

fn supervise(
    events: mpsc::Receiver<Event>,
    halt: Arc<AtomicBool>,
    components: Vec<JoinHandle<()>>,
    manager: Arc<Manager>,
    grace: Duration,
) -> Result<(), ProtocolError> {
    let outcome = match events.recv() {
        Ok(Event::Stop) | Err(_) => Ok(()),
        Ok(Event::Exited {
            component,
            result: Ok(()),
        }) => {
            warn!("{component} exited unexpectedly");
            Ok(())
        }
        Ok(Event::Exited {
            component,
            result: Err(e),
        }) => {
            error!("{component} failed: {e}");
            Err(e)
        }
    };

    info!("stopping server");
    halt.store(true, Ordering::SeqCst);
    for component in components {
        if component.join().is_err() {
            error!("server component panicked outside its guard");
        }
    }
    manager.close_all(grace);

    info!("server stopped");
    outcome
}
