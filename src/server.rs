// Copyright © 2024 The Johns Hopkins Applied Physics Laboratory LLC.
//
// This program is free software: you can redistribute it and/or
// modify it under the terms of the GNU Affero General Public License,
// version 3, as published by the Free Software Foundation.  If you
// would like to purchase a commercial license for this software, please
// contact APL’s Tech Transfer at 240-592-0817 or
// techtransfer@jhuapl.edu.
//
// This program is distributed in the hope that it will be useful, but
// WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the GNU
// Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public
// License along with this program.  If not, see
// <https://www.gnu.org/licenses/>.

//! The identity propagation server.
//!
//! A [GSSTestServer] logs in, binds its primary port, and then serves
//! connections until told to stop.  Each connection opens with a
//! [Command].  For [Command::Name], the server accepts a security
//! context from the client, then returns the client's authenticated
//! name sealed under that context:
//!
//! ```text
//! client -> server: NAME
//! client -> server: token
//! server -> client: token
//!   ... (as many legs as the mechanism needs)
//! server -> client: sealed(client name)
//! ```
//!
//! Failures are contained to the session in which they occur: a
//! malformed command, a dropped connection, or a failed handshake is
//! logged and the server goes back to accepting connections.
//!
//! # Stopping
//!
//! The server stops when its [StopHandle] is triggered, either
//! directly, by the remote control channel (see
//! [control](crate::control)), or by a [Command::Stop] on the primary
//! port when the [StopPolicy::Command] policy is in effect.  The stop
//! flag is checked before each accept and again as soon as an accept
//! returns; a connection accepted after the flag is set is dropped
//! without being served.  Sessions in progress run to completion.
use std::fmt::Display;
use std::fmt::Formatter;
use std::io::Error;
use std::net::IpAddr;
use std::net::Ipv4Addr;
use std::net::Ipv6Addr;
use std::net::SocketAddr;
use std::net::TcpListener;
use std::net::TcpStream;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use log::debug;
use log::error;
use log::info;
use log::trace;
use log::warn;

use crate::config::Concurrency;
use crate::config::ServerConfig;
use crate::config::StopPolicy;
use crate::cred::CredUsage;
use crate::cred::CredentialHandler;
use crate::cred::CredentialProvider;
use crate::cred::LoginError;
use crate::error::accept_retry_delay;
use crate::error::ErrorScope;
use crate::error::ScopedError;
use crate::mech::negotiate::NegotiateError;
use crate::mech::negotiate::Negotiator;
use crate::mech::Mechanism;
use crate::mech::Role;
use crate::mech::SecurityContext;
use crate::proto::read_command;
use crate::proto::Command;
use crate::proto::CommandError;
use crate::proto::DispatchError;

const WAKE_TIMEOUT: Duration = Duration::from_secs(1);

/// Handle that stops a running [GSSTestServer].
///
/// Handles are cheap to clone and can be sent to other threads.
#[derive(Clone, Debug)]
pub struct StopHandle {
    flag: Arc<AtomicBool>,
    /// Address to connect to in order to wake a blocked accept.
    wake: SocketAddr
}

/// Summary of a server run.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
pub struct ServerReport {
    sessions: usize,
    identities: usize,
    failures: usize
}

/// Errors that can end a single session.
#[derive(Debug)]
pub enum SessionError<C, E> {
    /// Low-level IO error setting up the connection.
    IO {
        /// IO error.
        error: Error
    },
    /// The opening command could not be read.
    Command {
        /// The command error.
        error: CommandError
    },
    /// The command was not one the server accepts.
    Dispatch {
        /// The dispatch error.
        error: DispatchError
    },
    /// The acceptor context could not be created.
    Create {
        /// The mechanism error.
        error: C
    },
    /// Negotiation or the sealed exchange failed.
    Negotiate {
        /// The negotiation error.
        error: NegotiateError<E>
    }
}

/// Errors that prevent the server from starting or end its run.
#[derive(Debug)]
pub enum ServerError {
    /// The server could not log in.
    Login {
        /// The login error.
        error: LoginError
    },
    /// The primary port could not be bound.
    Bind {
        /// The address.
        addr: SocketAddr,
        /// IO error.
        error: Error
    },
    /// Accepting connections failed.
    Accept {
        /// IO error.
        error: Error
    }
}

/// Session errors for mechanism `M`.
pub type ServerSessionError<M> = SessionError<
    <M as Mechanism>::CreateError,
    <<M as Mechanism>::Context as SecurityContext>::Error
>;

/// Identity propagation server.
pub struct GSSTestServer<M: Mechanism> {
    config: ServerConfig,
    mech: M,
    provider: M::Provider,
    cred: M::Credential,
    listener: TcpListener,
    stop: StopHandle
}

/// What a session did.
enum Outcome {
    Identity(String),
    Stop,
    Ignored(Command)
}

#[derive(Default)]
struct Counters {
    sessions: AtomicUsize,
    identities: AtomicUsize,
    failures: AtomicUsize
}

/// The parts of the server a session needs.
struct Sessions<'a, M: Mechanism> {
    config: &'a ServerConfig,
    mech: &'a M,
    cred: &'a M::Credential,
    stop: &'a StopHandle,
    counters: &'a Counters
}

impl<'a, M> Clone for Sessions<'a, M>
where
    M: Mechanism
{
    #[inline]
    fn clone(&self) -> Self {
        *self
    }
}

impl<'a, M> Copy for Sessions<'a, M> where M: Mechanism {}

/// Get an address from which `local` can be reached on this host.
///
/// Unspecified addresses are replaced with the loopback address of
/// the same family.
pub fn reachable_addr(local: SocketAddr) -> SocketAddr {
    let ip = match local.ip() {
        IpAddr::V4(ip) if ip.is_unspecified() => {
            IpAddr::V4(Ipv4Addr::LOCALHOST)
        }
        IpAddr::V6(ip) if ip.is_unspecified() => {
            IpAddr::V6(Ipv6Addr::LOCALHOST)
        }
        ip => ip
    };

    SocketAddr::new(ip, local.port())
}

impl StopHandle {
    fn new(local: SocketAddr) -> Self {
        StopHandle {
            flag: Arc::new(AtomicBool::new(false)),
            wake: reachable_addr(local)
        }
    }

    /// Whether the server has been told to stop.
    #[inline]
    pub fn is_stopped(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Tell the server to stop, and wake it if it is waiting for a
    /// connection.
    pub fn stop(&self) {
        if !self.flag.swap(true, Ordering::SeqCst) {
            info!(target: "gss-server",
                  "stop requested");

            let res = TcpStream::connect_timeout(&self.wake, WAKE_TIMEOUT);

            if let Err(err) = res {
                debug!(target: "gss-server",
                       "could not wake server at {}: {}",
                       self.wake, err);
            }
        }
    }
}

impl ServerReport {
    /// Number of connections served.
    #[inline]
    pub fn sessions(&self) -> usize {
        self.sessions
    }

    /// Number of identities returned to clients.
    #[inline]
    pub fn identities(&self) -> usize {
        self.identities
    }

    /// Number of sessions that failed.
    #[inline]
    pub fn failures(&self) -> usize {
        self.failures
    }
}

impl Counters {
    fn report(&self) -> ServerReport {
        ServerReport {
            sessions: self.sessions.load(Ordering::SeqCst),
            identities: self.identities.load(Ordering::SeqCst),
            failures: self.failures.load(Ordering::SeqCst)
        }
    }
}

impl<'a, M> Sessions<'a, M>
where
    M: Mechanism
{
    /// Accept a context and return the peer's name sealed under it.
    fn propagate_identity(
        &self,
        stream: &mut TcpStream
    ) -> Result<String, ServerSessionError<M>> {
        let ctx = self
            .mech
            .acceptor(Some(self.cred))
            .map_err(|err| SessionError::Create { error: err })?;
        let mut negotiator = Negotiator::new(ctx, Role::Acceptor)
            .with_frame_limit(self.config.max_frame_len());
        let res = negotiator.accept(stream).and_then(|peer| {
            debug!(target: "gss-server",
                   "context established with client {}",
                   peer);

            negotiator
                .send_sealed(stream, peer.as_bytes(), true)
                .map(|_| peer)
        });

        negotiator
            .finish(res)
            .map_err(|err| SessionError::Negotiate { error: err })
    }

    fn session(
        &self,
        stream: &mut TcpStream
    ) -> Result<Outcome, ServerSessionError<M>> {
        stream
            .set_read_timeout(Some(self.config.read_timeout()))
            .map_err(|err| SessionError::IO { error: err })?;

        let cmd = read_command(stream, self.config.command_encoding())
            .map_err(|err| SessionError::Command { error: err })?;

        debug!(target: "gss-server",
               "command {}",
               cmd);

        match (cmd, self.config.stop_policy()) {
            (Command::Name, _) => {
                self.propagate_identity(stream).map(Outcome::Identity)
            }
            (Command::Stop, StopPolicy::Command) => Ok(Outcome::Stop),
            (cmd, _) if self.config.strict_commands() => {
                let err = cmd
                    .require(Command::Name)
                    .err()
                    .map(|err| SessionError::Dispatch { error: err });

                match err {
                    Some(err) => Err(err),
                    None => Ok(Outcome::Ignored(cmd))
                }
            }
            (cmd, _) => Ok(Outcome::Ignored(cmd))
        }
    }

    fn serve(
        self,
        mut stream: TcpStream,
        peer: SocketAddr
    ) {
        self.counters.sessions.fetch_add(1, Ordering::SeqCst);

        debug!(target: "gss-server",
               "client connected from {}",
               peer);

        match self.session(&mut stream) {
            Ok(Outcome::Identity(name)) => {
                self.counters.identities.fetch_add(1, Ordering::SeqCst);

                info!(target: "gss-server",
                      "returned identity {} to {}",
                      name, peer);
            }
            Ok(Outcome::Stop) => {
                info!(target: "gss-server",
                      "STOP command received from {}",
                      peer);

                self.stop.stop();
            }
            Ok(Outcome::Ignored(Command::Stop)) => {
                warn!(target: "gss-server",
                      "ignoring STOP command from {} (use the control port)",
                      peer);
            }
            Ok(Outcome::Ignored(cmd)) => {
                debug!(target: "gss-server",
                       "nothing to do for command {} from {}",
                       cmd, peer);
            }
            Err(err) => {
                self.counters.failures.fetch_add(1, Ordering::SeqCst);

                warn!(target: "gss-server",
                      "session with {} failed: {}",
                      peer, err);
            }
        }
    }
}

impl<M> GSSTestServer<M>
where
    M: Mechanism
{
    /// Log in with `handler`, then bind the primary port.
    ///
    /// The server does not start if either step fails.
    pub fn new<H>(
        config: ServerConfig,
        mech: M,
        handler: &H
    ) -> Result<Self, ServerError>
    where
        H: CredentialHandler + ?Sized {
        info!(target: "gss-server",
              "logging in as {} ({})",
              config.principal(), M::NAME);

        let mut provider = mech.credential_provider();
        let cred = provider
            .login(handler, CredUsage::Accept)
            .map_err(|err| {
                provider.reset();

                ServerError::Login { error: err }
            })?;
        let addr = config.socket_addr();
        let listener = match TcpListener::bind(addr) {
            Ok(listener) => listener,
            Err(err) => {
                provider.reset();

                return Err(ServerError::Bind {
                    addr: addr,
                    error: err
                });
            }
        };
        let local = listener.local_addr().map_err(|err| {
            provider.reset();

            ServerError::Bind {
                addr: addr,
                error: err
            }
        })?;

        info!(target: "gss-server",
              "server bound to {}",
              local);

        Ok(GSSTestServer {
            config: config,
            mech: mech,
            provider: provider,
            cred: cred,
            listener: listener,
            stop: StopHandle::new(local)
        })
    }

    /// Get a handle that stops this server.
    #[inline]
    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    /// Get the address the server is bound to.
    #[inline]
    pub fn local_addr(&self) -> Result<SocketAddr, Error> {
        self.listener.local_addr()
    }

    /// Get the configuration.
    #[inline]
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    fn accept_loop<F>(
        &self,
        mut handle: F
    ) -> Result<(), ServerError>
    where
        F: FnMut(TcpStream, SocketAddr) {
        while !self.stop.is_stopped() {
            trace!(target: "gss-server",
                   "waiting for client connection");

            match self.listener.accept() {
                Ok((stream, peer)) => {
                    if self.stop.is_stopped() {
                        debug!(target: "gss-server",
                               "dropping connection from {} after stop",
                               peer);

                        break;
                    }

                    handle(stream, peer)
                }
                Err(err) => match accept_retry_delay(err.scope()) {
                    Some(delay) => {
                        warn!(target: "gss-server",
                              "error accepting connection: {}",
                              err);

                        if !delay.is_zero() {
                            thread::sleep(delay)
                        }
                    }
                    None => {
                        error!(target: "gss-server",
                               "fatal error accepting connections: {}",
                               err);

                        return Err(ServerError::Accept { error: err });
                    }
                }
            }
        }

        Ok(())
    }

    /// Serve connections until stopped.
    ///
    /// In threaded mode, this waits for all sessions in progress to
    /// finish before returning.
    pub fn run(&self) -> Result<ServerReport, ServerError>
    where
        M: Sync,
        M::Credential: Sync {
        let counters = Counters::default();
        let sessions = Sessions {
            config: &self.config,
            mech: &self.mech,
            cred: &self.cred,
            stop: &self.stop,
            counters: &counters
        };

        info!(target: "gss-server",
              "serving connections ({:?})",
              self.config.concurrency());

        match self.config.concurrency() {
            Concurrency::Sequential => {
                self.accept_loop(|stream, peer| sessions.serve(stream, peer))?
            }
            Concurrency::Threaded => thread::scope(|scope| {
                self.accept_loop(|stream, peer| {
                    let res = thread::Builder::new()
                        .name(format!("gss-session-{}", peer))
                        .spawn_scoped(scope, move || {
                            sessions.serve(stream, peer)
                        });

                    if let Err(err) = res {
                        counters.failures.fetch_add(1, Ordering::SeqCst);

                        warn!(target: "gss-server",
                              "could not start session for {}: {}",
                              peer, err);
                    }
                })
            })?
        }

        let report = counters.report();

        info!(target: "gss-server",
              "server stopped ({} sessions, {} identities, {} failures)",
              report.sessions, report.identities, report.failures);

        Ok(report)
    }
}

impl<M> Drop for GSSTestServer<M>
where
    M: Mechanism
{
    fn drop(&mut self) {
        debug!(target: "gss-server",
               "logging out");

        self.provider.reset();
    }
}

impl<C, E> ScopedError for SessionError<C, E>
where
    C: ScopedError,
    E: ScopedError
{
    fn scope(&self) -> ErrorScope {
        match self {
            SessionError::IO { error } => error.scope(),
            SessionError::Command { error } => error.scope(),
            SessionError::Dispatch { error } => error.scope(),
            SessionError::Create { error } => error.scope(),
            SessionError::Negotiate { error } => error.scope()
        }
    }
}

impl ScopedError for ServerError {
    fn scope(&self) -> ErrorScope {
        match self {
            ServerError::Login { error } => error.scope(),
            ServerError::Bind { .. } => ErrorScope::Unrecoverable,
            ServerError::Accept { error } => error.scope()
        }
    }
}

impl<C, E> Display for SessionError<C, E>
where
    C: Display,
    E: Display
{
    fn fmt(
        &self,
        f: &mut Formatter
    ) -> Result<(), std::fmt::Error> {
        match self {
            SessionError::IO { error } => error.fmt(f),
            SessionError::Command { error } => {
                write!(f, "error reading command: {}", error)
            }
            SessionError::Dispatch { error } => error.fmt(f),
            SessionError::Create { error } => {
                write!(f, "error creating context: {}", error)
            }
            SessionError::Negotiate { error } => error.fmt(f)
        }
    }
}

impl Display for ServerError {
    fn fmt(
        &self,
        f: &mut Formatter
    ) -> Result<(), std::fmt::Error> {
        match self {
            ServerError::Login { error } => error.fmt(f),
            ServerError::Bind { addr, error } => {
                write!(f, "error binding {}: {}", addr, error)
            }
            ServerError::Accept { error } => error.fmt(f)
        }
    }
}

#[cfg(test)]
use std::io::Write;
#[cfg(test)]
use std::thread::spawn;

#[cfg(test)]
use crate::client::send_stop;
#[cfg(test)]
use crate::client::GSSTestClient;
#[cfg(test)]
use crate::config::ClientConfig;
#[cfg(test)]
use crate::config::ClientVariant;
#[cfg(test)]
use crate::cred::PasswordHandler;
#[cfg(test)]
use crate::init;
#[cfg(test)]
use crate::mech::loopback::LoopbackCredential;
#[cfg(test)]
use crate::mech::loopback::LoopbackMechanism;
#[cfg(test)]
use crate::proto::write_command;
#[cfg(test)]
use crate::proto::CommandEncoding;

#[cfg(test)]
fn test_server(
    mech: &LoopbackMechanism,
    config: ServerConfig
) -> (SocketAddr, StopHandle, thread::JoinHandle<ServerReport>) {
    let config = config.with_socket_addr("127.0.0.1:0".parse().unwrap());
    let handler = PasswordHandler::with_password(
        config.principal(),
        config.secret()
    );
    let server = GSSTestServer::new(config, mech.clone(), &handler)
        .expect("expected success");
    let addr = server.local_addr().unwrap();
    let stop = server.stop_handle();
    let join = spawn(move || server.run().expect("expected success"));

    (addr, stop, join)
}

#[cfg(test)]
fn test_client(addr: SocketAddr) -> GSSTestClient {
    let config = ClientConfig::default()
        .with_server("127.0.0.1", addr.port())
        .with_timeouts(Duration::from_secs(5), Duration::from_secs(5));

    GSSTestClient::new(config)
}

#[cfg(test)]
fn client_cred() -> LoopbackCredential {
    LoopbackCredential::from_principal("hnelson@KERBEROS.EXAMPLE")
}

#[test]
fn test_identity_then_stop_command() {
    init();

    let mech = LoopbackMechanism::default();
    let config = ServerConfig::default().with_stop_policy(StopPolicy::Command);
    let (addr, _, join) = test_server(&mech, config);
    let client = test_client(addr);
    let name = client
        .get_name(&mech, Some(&client_cred()))
        .expect("expected success");

    assert_eq!("hnelson@KERBEROS.EXAMPLE", name);

    send_stop(addr, CommandEncoding::Framed, Duration::from_secs(5))
        .expect("expected success");

    let report = join.join().unwrap();

    assert_eq!(2, report.sessions());
    assert_eq!(1, report.identities());
    assert_eq!(0, report.failures());
    // One acceptor and one initiator context.
    assert_eq!(2, mech.disposals());
}

#[test]
fn test_unilateral_client() {
    init();

    let mech = LoopbackMechanism::default();
    let (addr, stop, join) = test_server(&mech, ServerConfig::default());
    let config = ClientConfig::default()
        .with_server("127.0.0.1", addr.port())
        .with_timeouts(Duration::from_secs(5), Duration::from_secs(5))
        .with_variant(ClientVariant::Unilateral);
    let name = GSSTestClient::new(config)
        .get_name(&mech, Some(&client_cred()))
        .expect("expected success");

    assert_eq!("hnelson@KERBEROS.EXAMPLE", name);

    stop.stop();

    let report = join.join().unwrap();

    assert_eq!(1, report.sessions());
    assert_eq!(1, report.identities());
    assert_eq!(0, report.failures());
}

#[test]
fn test_failed_session_does_not_stop_loop() {
    init();

    let mech = LoopbackMechanism::default();
    let (addr, stop, join) = test_server(&mech, ServerConfig::default());

    // Send half a command header and hang up.
    {
        let mut stream = TcpStream::connect(addr).unwrap();

        stream.write_all(&[0x00, 0x00]).unwrap();
    }

    // Target the wrong principal, so the handshake fails.
    let client = GSSTestClient::new(
        ClientConfig::default()
            .with_server("127.0.0.1", addr.port())
            .with_service("HTTP/elsewhere@KERBEROS.EXAMPLE")
            .with_timeouts(Duration::from_secs(5), Duration::from_secs(5))
    );

    assert!(client.get_name(&mech, Some(&client_cred())).is_err());

    let name = test_client(addr)
        .get_name(&mech, Some(&client_cred()))
        .expect("expected success");

    assert_eq!("hnelson@KERBEROS.EXAMPLE", name);

    stop.stop();

    let report = join.join().unwrap();

    assert_eq!(3, report.sessions());
    assert_eq!(1, report.identities());
    assert_eq!(2, report.failures());
    assert_eq!(4, mech.disposals());
}

#[test]
fn test_stop_command_ignored_under_remote_control() {
    init();

    let mech = LoopbackMechanism::default();
    let (addr, stop, join) = test_server(&mech, ServerConfig::default());

    send_stop(addr, CommandEncoding::Framed, Duration::from_secs(5))
        .expect("expected success");

    let name = test_client(addr)
        .get_name(&mech, Some(&client_cred()))
        .expect("expected success");

    assert_eq!("hnelson@KERBEROS.EXAMPLE", name);
    assert!(!stop.is_stopped());

    stop.stop();

    let report = join.join().unwrap();

    assert_eq!(2, report.sessions());
    assert_eq!(1, report.identities());
}

#[test]
fn test_strict_commands() {
    init();

    let mech = LoopbackMechanism::default();
    let config = ServerConfig::default().with_strict_commands(true);
    let (addr, stop, join) = test_server(&mech, config);

    {
        let mut stream = TcpStream::connect(addr).unwrap();

        write_command(&mut stream, Command::Noop, CommandEncoding::Framed)
            .unwrap();
    }

    // Sequential service means the NOOP session ends before this one.
    test_client(addr)
        .get_name(&mech, Some(&client_cred()))
        .expect("expected success");
    stop.stop();

    let report = join.join().unwrap();

    assert_eq!(2, report.sessions());
    assert_eq!(1, report.failures());
}

#[test]
fn test_raw_command_encoding() {
    init();

    let mech = LoopbackMechanism::new("JBOSS.ORG", 1);
    let config = ServerConfig::default()
        .with_command_encoding(CommandEncoding::Raw)
        .with_stop_policy(StopPolicy::Command);
    let (addr, _, join) = test_server(&mech, config);
    let client = GSSTestClient::new(
        ClientConfig::default()
            .with_server("127.0.0.1", addr.port())
            .with_command_encoding(CommandEncoding::Raw)
            .with_timeouts(Duration::from_secs(5), Duration::from_secs(5))
    );
    let cred = LoopbackCredential::from_principal("jduke@JBOSS.ORG");

    assert_eq!(
        "jduke@JBOSS.ORG",
        client.get_name(&mech, Some(&cred)).expect("expected success")
    );

    send_stop(addr, CommandEncoding::Raw, Duration::from_secs(5))
        .expect("expected success");

    let report = join.join().unwrap();

    assert_eq!(1, report.identities());
}

#[test]
fn test_threaded_sessions() {
    init();

    let mech = LoopbackMechanism::new("KERBEROS.EXAMPLE", 3);
    let config = ServerConfig::default().with_concurrency(Concurrency::Threaded);
    let (addr, stop, join) = test_server(&mech, config);
    let clients: Vec<_> = (0..4)
        .map(|i| {
            let mech = mech.clone();

            spawn(move || {
                let cred = LoopbackCredential::from_principal(&format!(
                    "user{}@KERBEROS.EXAMPLE",
                    i
                ));

                test_client(addr)
                    .get_name(&mech, Some(&cred))
                    .expect("expected success")
            })
        })
        .collect();

    for (i, client) in clients.into_iter().enumerate() {
        assert_eq!(format!("user{}@KERBEROS.EXAMPLE", i), client.join().unwrap());
    }

    stop.stop();

    let report = join.join().unwrap();

    assert_eq!(4, report.sessions());
    assert_eq!(4, report.identities());
    assert_eq!(8, mech.disposals());
}

#[test]
fn test_reachable_addr() {
    assert_eq!(
        "127.0.0.1:10961".parse::<SocketAddr>().unwrap(),
        reachable_addr("0.0.0.0:10961".parse().unwrap())
    );
    assert_eq!(
        "[::1]:10959".parse::<SocketAddr>().unwrap(),
        reachable_addr("[::]:10959".parse().unwrap())
    );
    assert_eq!(
        "10.0.0.7:10961".parse::<SocketAddr>().unwrap(),
        reachable_addr("10.0.0.7:10961".parse().unwrap())
    );
}

#[test]
fn test_stop_handle_wakes_idle_server() {
    init();

    let mech = LoopbackMechanism::default();
    let (_, stop, join) = test_server(&mech, ServerConfig::default());

    stop.stop();
    stop.stop();

    let report = join.join().unwrap();

    assert_eq!(ServerReport::default(), report);
}

#[test]
fn test_login_failure_prevents_start() {
    init();

    let mech = LoopbackMechanism::default()
        .with_principal("gsstestserver/xxx@JBOSS.ORG", b"gsstestpwd");
    let config = ServerConfig::default()
        .with_socket_addr("127.0.0.1:0".parse().unwrap())
        .with_principal("gsstestserver/xxx@JBOSS.ORG", "wrong");
    let handler = PasswordHandler::with_password(
        config.principal(),
        config.secret()
    );

    match GSSTestServer::new(config, mech, &handler) {
        Err(ServerError::Login {
            error: LoginError::BadSecret { principal }
        }) => assert_eq!("gsstestserver/xxx@JBOSS.ORG", principal),
        Err(err) => panic!("expected login failure, got {}", err),
        Ok(_) => panic!("expected login failure")
    }
}
