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

//! The identity propagation client.
//!
//! A [GSSTestClient] connects to a [GSSTestServer](crate::server::GSSTestServer),
//! sends [Command::Name], establishes a context with the server's
//! principal, and returns the name the server unseals from the
//! reply.  That name is the identity the server authenticated, which
//! should match the client's own principal.
//!
//! This module also provides [send_stop], which asks a server to
//! leave its accept loop, and [local_identity], which reports the
//! names an initiator context holds after its first step.
use std::fmt::Display;
use std::fmt::Formatter;
use std::io::Error;
use std::net::SocketAddr;
use std::net::TcpStream;
use std::net::ToSocketAddrs;
use std::string::FromUtf8Error;
use std::time::Duration;

use log::debug;
use log::info;
use log::trace;
use log::warn;

use crate::config::ClientConfig;
use crate::error::ErrorScope;
use crate::error::ScopedError;
use crate::frame::FrameError;
use crate::mech::negotiate::NegotiateError;
use crate::mech::negotiate::Negotiator;
use crate::mech::InitiatorFlags;
use crate::mech::Mechanism;
use crate::mech::Role;
use crate::mech::SecurityContext;
use crate::proto::write_command;
use crate::proto::Command;
use crate::proto::CommandEncoding;

/// Errors that can occur in the client.
#[derive(Debug)]
pub enum ClientError<C, E> {
    /// The server host could not be resolved.
    Resolve {
        /// The host name.
        host: String,
        /// IO error.
        error: Error
    },
    /// None of the server's addresses accepted a connection.
    Connect {
        /// The host name.
        host: String,
        /// Error from the last address tried.
        error: Option<Error>
    },
    /// Low-level IO error on an established connection.
    IO {
        /// IO error.
        error: Error
    },
    /// The command could not be sent.
    Command {
        /// The framing error.
        error: FrameError
    },
    /// A context could not be created.
    Create {
        /// The mechanism error.
        error: C
    },
    /// A context operation failed outside of negotiation.
    Context {
        /// The mechanism error.
        error: E
    },
    /// Negotiation or the sealed exchange failed.
    Negotiate {
        /// The negotiation error.
        error: NegotiateError<E>
    },
    /// The unsealed reply was not a UTF-8 name.
    BadPayload {
        /// The decoding error.
        error: FromUtf8Error
    }
}

/// Client errors for mechanism `M`.
pub type MechClientError<M> = ClientError<
    <M as Mechanism>::CreateError,
    <<M as Mechanism>::Context as SecurityContext>::Error
>;

/// Identity propagation client.
#[derive(Clone, Debug)]
pub struct GSSTestClient {
    config: ClientConfig
}

fn connect<C, E>(
    host: &str,
    port: u16,
    timeout: Duration
) -> Result<TcpStream, ClientError<C, E>> {
    let addrs: Vec<SocketAddr> = (host, port)
        .to_socket_addrs()
        .map_err(|err| ClientError::Resolve {
            host: String::from(host),
            error: err
        })?
        .collect();
    let mut last = None;

    for addr in addrs {
        trace!(target: "gss-client",
               "trying {}",
               addr);

        match TcpStream::connect_timeout(&addr, timeout) {
            Ok(stream) => {
                debug!(target: "gss-client",
                       "connected to {}",
                       addr);

                return Ok(stream);
            }
            Err(err) => {
                debug!(target: "gss-client",
                       "could not connect to {}: {}",
                       addr, err);

                last = Some(err);
            }
        }
    }

    Err(ClientError::Connect {
        host: String::from(host),
        error: last
    })
}

impl GSSTestClient {
    /// Create a client from its configuration.
    #[inline]
    pub fn new(config: ClientConfig) -> Self {
        GSSTestClient { config: config }
    }

    /// Get the configuration.
    #[inline]
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    fn exchange<M>(
        &self,
        mech: &M,
        cred: Option<&M::Credential>,
        stream: &mut TcpStream
    ) -> Result<String, MechClientError<M>>
    where
        M: Mechanism {
        let flags = self.config.variant().flags();
        let ctx = mech
            .initiator(self.config.service(), cred, flags)
            .map_err(|err| ClientError::Create { error: err })?;
        let mut negotiator = Negotiator::new(ctx, Role::Initiator);
        let res = negotiator
            .initiate(stream)
            .and_then(|_| negotiator.recv_sealed(stream))
            .map_err(|err| ClientError::Negotiate { error: err })
            .and_then(|payload| {
                String::from_utf8(payload)
                    .map_err(|err| ClientError::BadPayload { error: err })
            });

        negotiator.finish(res)
    }

    /// Ask the server for the identity it authenticates this client
    /// as.
    ///
    /// If `cred` is `None`, the mechanism's default credentials are
    /// used.
    pub fn get_name<M>(
        &self,
        mech: &M,
        cred: Option<&M::Credential>
    ) -> Result<String, MechClientError<M>>
    where
        M: Mechanism {
        let host = self.config.host();
        let port = self.config.port();

        info!(target: "gss-client",
              "requesting identity from {}:{} ({}, target {})",
              host, port, M::NAME, self.config.service());

        let mut stream = connect(host, port, self.config.connect_timeout())?;

        stream
            .set_read_timeout(Some(self.config.read_timeout()))
            .map_err(|err| ClientError::IO { error: err })?;
        write_command(
            &mut stream,
            Command::Name,
            self.config.command_encoding()
        )
        .map_err(|err| ClientError::Command { error: err })?;

        let name = self.exchange(mech, cred, &mut stream)?;

        info!(target: "gss-client",
              "server authenticated us as {}",
              name);

        Ok(name)
    }
}

/// Send [Command::Stop] to the server at `addr`.
///
/// Servers only act on this under the
/// [Command](crate::config::StopPolicy::Command) stop policy.
pub fn send_stop(
    addr: SocketAddr,
    encoding: CommandEncoding,
    timeout: Duration
) -> Result<(), FrameError> {
    info!(target: "gss-client",
          "sending STOP to {}",
          addr);

    let mut stream = TcpStream::connect_timeout(&addr, timeout)
        .map_err(|err| FrameError::IO { error: err })?;

    write_command(&mut stream, Command::Stop, encoding)
}

/// Create an initiator context for `target`, take its first step,
/// and report the source and target names the context holds.
///
/// This checks that `cred` can reach `target` without involving a
/// server.  The token produced by the first step is discarded.
pub fn local_identity<M>(
    mech: &M,
    target: &str,
    cred: Option<&M::Credential>
) -> Result<(String, String), MechClientError<M>>
where
    M: Mechanism {
    let mut ctx = mech
        .initiator(target, cred, InitiatorFlags::unilateral())
        .map_err(|err| ClientError::Create { error: err })?;
    let res = first_step(&mut ctx);

    release(&mut ctx);

    res
}

fn first_step<Ctx, C>(
    ctx: &mut Ctx
) -> Result<(String, String), ClientError<C, Ctx::Error>>
where
    Ctx: SecurityContext {
    // Zero-leg mechanisms are established on creation.
    if !ctx.is_established() {
        let token = ctx
            .step(&[])
            .map_err(|err| ClientError::Context { error: err })?;

        trace!(target: "gss-client",
               "first token is {} bytes",
               token.map_or(0, |token| token.len()));
    }

    let source = ctx
        .source_name()
        .map_err(|err| ClientError::Context { error: err })?;
    let target = ctx
        .target_name()
        .map_err(|err| ClientError::Context { error: err })?;

    Ok((source, target))
}

fn release<Ctx>(ctx: &mut Ctx)
where
    Ctx: SecurityContext {
    if let Err(err) = ctx.dispose() {
        warn!(target: "gss-client",
              "error releasing context: {}",
              err);
    }
}

impl<C, E> ScopedError for ClientError<C, E>
where
    C: ScopedError,
    E: ScopedError
{
    fn scope(&self) -> ErrorScope {
        match self {
            ClientError::Resolve { .. } => ErrorScope::Unrecoverable,
            ClientError::Connect { error: Some(error), .. } => error.scope(),
            ClientError::Connect { error: None, .. } => {
                ErrorScope::Unrecoverable
            }
            ClientError::IO { error } => error.scope(),
            ClientError::Command { error } => error.scope(),
            ClientError::Create { error } => error.scope(),
            ClientError::Context { error } => error.scope(),
            ClientError::Negotiate { error } => error.scope(),
            ClientError::BadPayload { .. } => ErrorScope::External
        }
    }
}

impl<C, E> Display for ClientError<C, E>
where
    C: Display,
    E: Display
{
    fn fmt(
        &self,
        f: &mut Formatter
    ) -> Result<(), std::fmt::Error> {
        match self {
            ClientError::Resolve { host, error } => {
                write!(f, "could not resolve {}: {}", host, error)
            }
            ClientError::Connect {
                host,
                error: Some(error)
            } => write!(f, "could not connect to {}: {}", host, error),
            ClientError::Connect { host, error: None } => {
                write!(f, "no addresses found for {}", host)
            }
            ClientError::IO { error } => error.fmt(f),
            ClientError::Command { error } => {
                write!(f, "error sending command: {}", error)
            }
            ClientError::Create { error } => {
                write!(f, "error creating context: {}", error)
            }
            ClientError::Context { error } => error.fmt(f),
            ClientError::Negotiate { error } => error.fmt(f),
            ClientError::BadPayload { error } => {
                write!(f, "server returned a name that is not UTF-8: {}", error)
            }
        }
    }
}

#[cfg(test)]
use std::net::TcpListener;
#[cfg(test)]
use std::thread::spawn;

#[cfg(test)]
use crate::init;
#[cfg(test)]
use crate::mech::loopback::LoopbackCredential;
#[cfg(test)]
use crate::mech::loopback::LoopbackError;
#[cfg(test)]
use crate::mech::loopback::LoopbackMechanism;
#[cfg(test)]
use crate::proto::read_command;

#[cfg(test)]
fn client_for(addr: SocketAddr) -> GSSTestClient {
    GSSTestClient::new(
        ClientConfig::default()
            .with_server("127.0.0.1", addr.port())
            .with_timeouts(Duration::from_secs(5), Duration::from_secs(5))
    )
}

/// Serve one session by hand, sealing `reply` instead of the peer
/// name.
#[cfg(test)]
fn fake_server(
    mech: &LoopbackMechanism,
    reply: Option<Vec<u8>>
) -> (SocketAddr, std::thread::JoinHandle<Command>) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let mech = mech.clone();
    let join = spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        let cmd = read_command(&mut stream, CommandEncoding::Framed).unwrap();

        if cmd == Command::Name {
            let cred = LoopbackCredential::from_principal(
                "gsstestserver/xxx@JBOSS.ORG"
            );
            let ctx = mech.acceptor(Some(&cred)).unwrap();
            let mut negotiator = Negotiator::new(ctx, Role::Acceptor);
            let peer = negotiator.accept(&mut stream).unwrap();
            let reply = reply.unwrap_or_else(|| peer.into_bytes());

            negotiator.send_sealed(&mut stream, &reply, true).unwrap();
        }

        cmd
    });

    (addr, join)
}

#[test]
fn test_get_name() {
    init();

    let mech = LoopbackMechanism::default();
    let (addr, join) = fake_server(&mech, None);
    let cred = LoopbackCredential::from_principal("jduke@KERBEROS.EXAMPLE");
    let name = client_for(addr)
        .get_name(&mech, Some(&cred))
        .expect("expected success");

    assert_eq!("jduke@KERBEROS.EXAMPLE", name);
    assert_eq!(Command::Name, join.join().unwrap());
}

#[test]
fn test_get_name_bad_payload() {
    init();

    let mech = LoopbackMechanism::default();
    let (addr, join) = fake_server(&mech, Some(vec![0xff, 0xfe, 0x00]));
    let cred = LoopbackCredential::from_principal("jduke@KERBEROS.EXAMPLE");

    match client_for(addr).get_name(&mech, Some(&cred)) {
        Err(ClientError::BadPayload { .. }) => {}
        Err(err) => panic!("expected bad payload, got {}", err),
        Ok(name) => panic!("expected bad payload, got {}", name)
    }

    join.join().unwrap();
    assert_eq!(2, mech.disposals());
}

#[test]
fn test_get_name_connection_refused() {
    init();

    let addr = {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();

        listener.local_addr().unwrap()
    };
    let mech = LoopbackMechanism::default();
    let cred = LoopbackCredential::from_principal("jduke@KERBEROS.EXAMPLE");

    match client_for(addr).get_name(&mech, Some(&cred)) {
        Err(ClientError::Connect { error: Some(_), .. }) => {}
        Err(err) => panic!("expected connect failure, got {}", err),
        Ok(name) => panic!("expected connect failure, got {}", name)
    }

    assert_eq!(0, mech.disposals());
}

#[test]
fn test_send_stop() {
    init();

    let mech = LoopbackMechanism::default();
    let (addr, join) = fake_server(&mech, None);

    send_stop(addr, CommandEncoding::Framed, Duration::from_secs(5))
        .expect("expected success");

    assert_eq!(Command::Stop, join.join().unwrap());
}

#[test]
fn test_local_identity() {
    init();

    let mech = LoopbackMechanism::new("JBOSS.ORG", 3);
    let cred = LoopbackCredential::from_principal("jduke@JBOSS.ORG");
    let (source, target) = local_identity(&mech, "HTTP/localhost", Some(&cred))
        .expect("expected success");

    assert_eq!("jduke@JBOSS.ORG", source);
    assert_eq!("HTTP/localhost@JBOSS.ORG", target);
    assert_eq!(1, mech.disposals());
}

#[test]
fn test_local_identity_zero_legs() {
    init();

    let mech = LoopbackMechanism::new("JBOSS.ORG", 0);
    let (source, target) = local_identity(&mech, "HTTP/localhost", None)
        .expect("expected success");

    assert_eq!(crate::mech::loopback::ANONYMOUS_PRINCIPAL, source);
    assert_eq!("HTTP/localhost@JBOSS.ORG", target);
}

#[test]
fn test_local_identity_bad_target() {
    init();

    let mech = LoopbackMechanism::default();

    match local_identity(&mech, "", None) {
        Err(ClientError::Create {
            error: LoopbackError::BadName
        }) => {}
        Err(err) => panic!("expected bad name, got {}", err),
        Ok(_) => panic!("expected bad name")
    }

    assert_eq!(0, mech.disposals());
}
