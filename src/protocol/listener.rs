use std::{
    io,
    net::{SocketAddr, TcpListener, TcpStream},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::Duration,
};

use log::{debug, info, warn};

use crate::schema::Schema;

use super::{
    ThreadPool,
    connection::Connection,
    error::{ProtocolError, RejectReason},
    handshake::{ServerHandshake, UserValidator, VersionValidator, login_timeout},
    manager::Manager,
};

const ACCEPT_POLL: Duration = Duration::from_millis(50);

/// Accepts sockets and turns them into registered, running [`Connection`]s.
///
/// The acceptor itself never blocks on a peer: each handshake runs on a fixed pool of
/// workers and is bounded by the login timeout.
pub struct Listener {
    listener: TcpListener,
    address: SocketAddr,
    pool: ThreadPool,
    admission: Arc<Admission>,
}

/// Everything a handshake worker needs to admit one socket.
pub(crate) struct Admission {
    pub manager: Arc<Manager>,
    pub schema: Schema,
    pub versions: VersionValidator,
    pub users: UserValidator,
    pub max_frame: usize,
    pub login_timeout: Duration,
}

impl Listener {
    pub(crate) fn bind(
        address: SocketAddr,
        workers: usize,
        admission: Admission,
    ) -> Result<Self, ProtocolError> {
        let listener = TcpListener::bind(address)?;
        listener.set_nonblocking(true)?;
        let address = listener.local_addr()?;

        Ok(Self {
            listener,
            address,
            pool: ThreadPool::new("tether-handshake", workers)?,
            admission: Arc::new(admission),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.address
    }

    /// Accept loop; returns once `halt` is raised or the listening socket fails.
    pub(crate) fn run(&self, halt: &AtomicBool) -> Result<(), ProtocolError> {
        info!("listening at {}", self.address);

        while !halt.load(Ordering::SeqCst) {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    debug!("accepted socket from {peer}");
                    let admission = Arc::clone(&self.admission);
                    self.pool.execute(move || {
                        if let Err(e) = admission.admit(stream, peer) {
                            match e {
                                ProtocolError::HandshakeRejected { reason } => {
                                    warn!("rejected {peer}: {reason}")
                                }
                                e if e.is_disconnect() => debug!("{peer} left during handshake"),
                                e => warn!("handshake with {peer} failed: {e}"),
                            }
                        }
                    })?;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => thread::sleep(ACCEPT_POLL),
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::ConnectionAborted
                            | io::ErrorKind::ConnectionReset
                            | io::ErrorKind::Interrupted
                    ) =>
                {
                    warn!("broken connection: {e:?}")
                }
                Err(e) => return Err(e.into()),
            }
        }

        info!("listener at {} stopped", self.address);
        Ok(())
    }
}

impl Admission {
    /// Runs the handshake on `stream` and, once accepted, registers and starts its connection.
    pub(crate) fn admit(
        &self,
        mut stream: TcpStream,
        peer: SocketAddr,
    ) -> Result<Connection, ProtocolError> {
        stream.set_nonblocking(false)?;
        stream.set_read_timeout(Some(self.login_timeout))?;

        let mut handshake = ServerHandshake::new(&self.versions, &self.users);
        let user = match handshake.authenticate(&mut stream) {
            Ok(user) => user,
            Err(e) => {
                debug!("handshake with {peer} ended in state {:?}", handshake.state());
                return Err(login_timeout(e));
            }
        };
        stream.set_read_timeout(None)?;

        let connection = Connection::new(
            stream.try_clone()?,
            user,
            self.schema.clone(),
            self.max_frame,
        )?;
        if self.manager.register(&connection).is_err() {
            return handshake.reject(&mut stream, RejectReason::ConnectionLimit);
        }

        let started = handshake
            .accept(&mut stream)
            .and_then(|()| {
                self.manager.room().user_enter(&connection);
                connection.start(self.manager.clone())
            });
        if let Err(e) = started {
            self.manager.deregister(&connection);
            connection.abort();
            return Err(e);
        }

        info!("{} logged in from {peer} as {}", connection, connection.user());
        Ok(connection)
    }
}
