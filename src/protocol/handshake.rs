//! Connection handshake.
//!
//! Before any message is exchanged, the connecting peer proves it runs a compatible version
//! and knows a user's password:
//!
//! 1. client sends [`Handshake::Hello`] with its version triple;
//! 2. server checks the version and answers with a fresh random [`Handshake::Challenge`] salt;
//! 3. client sends [`Handshake::Credentials`], the password encrypted with that salt;
//! 4. server validates them and answers [`Handshake::Accept`] or [`Handshake::Reject`].
//!
//! The salt is new for every attempt, so a captured credential cannot be replayed, and the
//! raw password never crosses the wire. A rejected peer only ever sees a bare
//! [`Handshake::Reject`].
use std::{
    io::{self, Read, Write},
    sync::Arc,
};

use bincode::{
    Decode, Encode,
    config::{BigEndian, Configuration, Fixint, Limit},
    decode_from_slice, encode_to_vec,
};
use log::debug;
use rand::Rng;
use sha2::{Digest, Sha256};

use super::{
    error::{ProtocolError, RejectReason},
    transport::{read_raw, write_raw},
    user::User,
};

/// Decides whether a client version `(major, minor, revision)` may connect.
pub type VersionValidator = Arc<dyn Fn(i64, i64, i64) -> bool + Send + Sync>;
/// Checks `(username, credential, salt)`; returns the bound [`User`] on success.
pub type UserValidator = Arc<dyn Fn(&str, &[u8], &[u8]) -> Option<User> + Send + Sync>;
/// Turns `(password, salt)` into the credential sent on the wire.
pub type Encryptor = Arc<dyn Fn(&str, &[u8]) -> Vec<u8> + Send + Sync>;

/// SHA-256 over `password` followed by `salt`.
///
/// A ready-made credential function for peers that have nothing better; the accepting side
/// recomputes it from its own copy of the password and compares.
pub fn sha256_credential(password: &str, salt: &[u8]) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(password.as_bytes());
    hasher.update(salt);
    hasher.finalize().to_vec()
}

pub(crate) const HANDSHAKE_FRAME_LIMIT: usize = 4096;
const SALT_SIZE: usize = 32;

/// Frames exchanged before a connection becomes active.
#[derive(Debug, Clone, Encode, Decode, PartialEq, Eq)]
pub enum Handshake {
    Hello {
        major: i64,
        minor: i64,
        revision: i64,
    },
    Challenge {
        salt: Vec<u8>,
    },
    Credentials {
        username: String,
        credential: Vec<u8>,
    },
    Accept,
    Reject,
}

fn config() -> Configuration<BigEndian, Fixint, Limit<HANDSHAKE_FRAME_LIMIT>> {
    bincode::config::standard()
        .with_big_endian()
        .with_fixed_int_encoding()
        .with_limit::<HANDSHAKE_FRAME_LIMIT>()
}

impl Handshake {
    pub fn write<W: Write>(&self, stream: &mut W) -> Result<(), ProtocolError> {
        let payload = encode_to_vec(self, config())?;
        write_raw(stream, &payload, HANDSHAKE_FRAME_LIMIT)?;
        Ok(())
    }

    pub fn read<R: Read>(stream: &mut R) -> Result<Self, ProtocolError> {
        let payload = read_raw(stream, HANDSHAKE_FRAME_LIMIT)?;
        let (frame, read) = decode_from_slice(&payload, config())?;
        if read != payload.len() {
            return Err(ProtocolError::MalformedMessage(
                "trailing bytes in handshake frame".into(),
            ));
        }
        Ok(frame)
    }
}

/// Progress of one handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    Connected,
    VersionCheck,
    CredentialCheck,
    Authenticated,
    Active,
    Rejected,
}

/// Accepting side of the handshake.
pub(crate) struct ServerHandshake<'a> {
    state: HandshakeState,
    versions: &'a VersionValidator,
    users: &'a UserValidator,
}

impl<'a> ServerHandshake<'a> {
    pub fn new(versions: &'a VersionValidator, users: &'a UserValidator) -> Self {
        Self {
            state: HandshakeState::Connected,
            versions,
            users,
        }
    }

    pub fn state(&self) -> HandshakeState {
        self.state
    }

    /// Runs the version and credential checks.
    ///
    /// On success the peer is authenticated but not yet told so; follow with
    /// [`ServerHandshake::accept`] or [`ServerHandshake::reject`].
    pub fn authenticate<S: Read + Write>(&mut self, stream: &mut S) -> Result<User, ProtocolError> {
        self.state = HandshakeState::VersionCheck;
        let (major, minor, revision) = match Handshake::read(stream)? {
            Handshake::Hello {
                major,
                minor,
                revision,
            } => (major, minor, revision),
            _ => return self.reject(stream, RejectReason::UnexpectedFrame),
        };
        if !(self.versions)(major, minor, revision) {
            debug!("refusing client version {major}.{minor}.{revision}");
            return self.reject(stream, RejectReason::Version);
        }

        self.state = HandshakeState::CredentialCheck;
        let salt: [u8; SALT_SIZE] = rand::rng().random();
        Handshake::Challenge {
            salt: salt.to_vec(),
        }
        .write(stream)?;

        let (username, credential) = match Handshake::read(stream)? {
            Handshake::Credentials {
                username,
                credential,
            } => (username, credential),
            _ => return self.reject(stream, RejectReason::UnexpectedFrame),
        };

        match (self.users)(&username, &credential, &salt) {
            Some(user) => {
                self.state = HandshakeState::Authenticated;
                Ok(user)
            }
            None => {
                debug!("invalid credentials for '{username}'");
                self.reject(stream, RejectReason::Credentials)
            }
        }
    }

    pub fn accept<W: Write>(&mut self, stream: &mut W) -> Result<(), ProtocolError> {
        Handshake::Accept.write(stream)?;
        self.state = HandshakeState::Active;
        Ok(())
    }

    /// Sends the generic rejection and reports `reason` to the caller only.
    pub fn reject<W: Write, T>(
        &mut self,
        stream: &mut W,
        reason: RejectReason,
    ) -> Result<T, ProtocolError> {
        self.state = HandshakeState::Rejected;
        if let Err(e) = Handshake::Reject.write(stream) {
            debug!("could not deliver rejection: {e}");
        }
        Err(ProtocolError::HandshakeRejected { reason })
    }
}

/// Connecting side of the handshake.
pub(crate) fn initiate<S: Read + Write>(
    stream: &mut S,
    version: (i64, i64, i64),
    username: &str,
    password: &str,
    encrypt: &Encryptor,
) -> Result<(), ProtocolError> {
    let (major, minor, revision) = version;
    Handshake::Hello {
        major,
        minor,
        revision,
    }
    .write(stream)?;

    let salt = match Handshake::read(stream)? {
        Handshake::Challenge { salt } => salt,
        other => return Err(unexpected(other)),
    };

    Handshake::Credentials {
        username: username.to_string(),
        credential: encrypt(password, &salt),
    }
    .write(stream)?;

    match Handshake::read(stream)? {
        Handshake::Accept => Ok(()),
        other => Err(unexpected(other)),
    }
}

/// Turns the expiry of a login read timeout into [`ProtocolError::Timeout`].
pub(crate) fn login_timeout(error: ProtocolError) -> ProtocolError {
    match error {
        ProtocolError::Io(e)
            if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) =>
        {
            ProtocolError::Timeout
        }
        e => e,
    }
}

fn unexpected(frame: Handshake) -> ProtocolError {
    match frame {
        Handshake::Reject => ProtocolError::HandshakeRejected {
            reason: RejectReason::Unspecified,
        },
        other => ProtocolError::MalformedMessage(format!("unexpected handshake frame {other:?}")),
    }
}

#[cfg(test)]
mod tests {
    use std::{
        io::Cursor,
        net::{TcpListener, TcpStream},
        sync::Mutex,
        thread,
    };

    use super::*;

    fn encryptor() -> Encryptor {
        Arc::new(|password: &str, salt: &[u8]| {
            let mut out = password.as_bytes().to_vec();
            out.extend_from_slice(salt);
            out
        })
    }

    fn validators(min_major: i64) -> (VersionValidator, UserValidator) {
        let versions: VersionValidator =
            Arc::new(move |major: i64, _: i64, _: i64| major >= min_major);
        let encrypt = encryptor();
        let users: UserValidator =
            Arc::new(move |username: &str, credential: &[u8], salt: &[u8]| {
                (username == "michael" && credential == encrypt("secret", salt).as_slice())
                    .then(|| User::new(username))
            });
        (versions, users)
    }

    fn pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, _) = listener.accept().unwrap();
        (server, client)
    }

    fn run(
        min_major: i64,
        version: (i64, i64, i64),
        password: &'static str,
    ) -> (
        Result<User, ProtocolError>,
        HandshakeState,
        Result<(), ProtocolError>,
    ) {
        let (mut server, mut client) = pair();
        let peer = thread::spawn(move || {
            initiate(&mut client, version, "michael", password, &encryptor())
        });

        let (versions, users) = validators(min_major);
        let mut handshake = ServerHandshake::new(&versions, &users);
        let result = handshake.authenticate(&mut server);
        if result.is_ok() {
            handshake.accept(&mut server).unwrap();
        }
        let state = handshake.state();
        drop(server);

        (result, state, peer.join().unwrap())
    }

    #[test]
    fn sha256_credential_depends_on_salt() {
        let a = sha256_credential("secret", b"one");

        assert_eq!(a.len(), 32);
        assert_eq!(a, sha256_credential("secret", b"one"));
        assert_ne!(a, sha256_credential("secret", b"two"));
        assert_ne!(a, sha256_credential("Secret", b"one"));
    }

    #[test]
    fn handshake_frame_encoding() {
        let mut stream = Cursor::new(Vec::new());
        let frame = Handshake::Credentials {
            username: "michael".into(),
            credential: vec![1, 2, 3],
        };

        frame.write(&mut stream).unwrap();
        stream.set_position(0);
        assert_eq!(Handshake::read(&mut stream).unwrap(), frame);
    }

    #[test]
    fn handshake_accepted() {
        let (result, state, client) = run(1, (1, 2, 3), "secret");

        assert_eq!(result.unwrap().name(), "michael");
        assert_eq!(state, HandshakeState::Active);
        client.unwrap();
    }

    #[test]
    fn handshake_rejects_version() {
        let (result, state, client) = run(2, (1, 0, 0), "secret");

        assert!(matches!(
            result,
            Err(ProtocolError::HandshakeRejected {
                reason: RejectReason::Version
            })
        ));
        assert_eq!(state, HandshakeState::Rejected);
        assert!(matches!(
            client,
            Err(ProtocolError::HandshakeRejected {
                reason: RejectReason::Unspecified
            })
        ));
    }

    #[test]
    fn handshake_rejects_credentials() {
        let (result, state, client) = run(1, (1, 0, 0), "wrong");

        assert!(matches!(
            result,
            Err(ProtocolError::HandshakeRejected {
                reason: RejectReason::Credentials
            })
        ));
        assert_eq!(state, HandshakeState::Rejected);
        assert!(matches!(
            client,
            Err(ProtocolError::HandshakeRejected {
                reason: RejectReason::Unspecified
            })
        ));
    }

    #[test]
    fn salt_is_fresh_per_attempt() {
        let salts = Arc::new(Mutex::new(Vec::new()));
        for _ in 0..2 {
            let (mut server, mut client) = pair();
            let peer = thread::spawn(move || {
                initiate(&mut client, (1, 0, 0), "michael", "secret", &encryptor())
            });

            let versions: VersionValidator = Arc::new(|_: i64, _: i64, _: i64| true);
            let seen = Arc::clone(&salts);
            let users: UserValidator = Arc::new(move |name: &str, _: &[u8], salt: &[u8]| {
                seen.lock().unwrap().push(salt.to_vec());
                Some(User::new(name))
            });
            let mut handshake = ServerHandshake::new(&versions, &users);
            handshake.authenticate(&mut server).unwrap();
            handshake.accept(&mut server).unwrap();
            peer.join().unwrap().unwrap();
        }

        let salts = salts.lock().unwrap();
        assert_eq!(salts[0].len(), SALT_SIZE);
        assert_ne!(salts[0], salts[1]);
    }

    #[test]
    fn handshake_rejects_unexpected_frame() {
        let (mut server, mut client) = pair();
        Handshake::Accept.write(&mut client).unwrap();

        let (versions, users) = validators(1);
        let mut handshake = ServerHandshake::new(&versions, &users);
        let result = handshake.authenticate(&mut server);

        assert!(matches!(
            result,
            Err(ProtocolError::HandshakeRejected {
                reason: RejectReason::UnexpectedFrame
            })
        ));
        assert_eq!(Handshake::read(&mut client).unwrap(), Handshake::Reject);
    }
}
