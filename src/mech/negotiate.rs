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

//! Token exchange over framed streams.
//!
//! A [Negotiator] owns one side of a [SecurityContext] and drives it
//! through the handshake:
//!
//! ```text
//! Init -> Negotiating -> Established -> SealedExchanged
//!   \          \              \
//!    `----------`--------------`----> Failed
//! ```
//!
//! Every token travels as one frame.  The number of legs is decided
//! entirely by the mechanism: the exchange ends when the local context
//! reports itself established, which for some mechanisms happens
//! before any token has been sent.  Empty tokens are never sent.
//!
//! The context is released exactly once, either through
//! [finish](Negotiator::finish) or when the negotiator is dropped.
use std::fmt::Display;
use std::fmt::Formatter;
use std::io::Read;
use std::io::Write;

use log::debug;
use log::trace;
use log::warn;

use crate::error::ErrorScope;
use crate::error::ScopedError;
use crate::frame::read_frame_limited;
use crate::frame::write_frame;
use crate::frame::FrameError;
use crate::mech::Role;
use crate::mech::SecurityContext;

/// Default largest token or sealed frame that will be read.
pub const DEFAULT_MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Progress of a negotiation.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum NegotiationState {
    /// Nothing has happened yet.
    Init,
    /// Tokens are being exchanged.
    Negotiating,
    /// The context is established; sealed messages may be exchanged.
    Established,
    /// The sealed message has been sent or received.
    SealedExchanged,
    /// Some step failed.
    Failed
}

/// Errors that can occur during negotiation.
#[derive(Debug)]
pub enum NegotiateError<E> {
    /// Error reading or writing a frame.
    Frame {
        /// The framing error.
        error: FrameError
    },
    /// Error from the security context.
    Context {
        /// The mechanism error.
        error: E
    },
    /// A sealed operation was attempted outside the established state.
    NotEstablished {
        /// The state at the time.
        state: NegotiationState
    },
    /// The handshake was started twice.
    AlreadyStarted {
        /// The state at the time.
        state: NegotiationState
    },
    /// The handshake was started for the wrong side of the context.
    WrongRole {
        /// The side this negotiator holds.
        role: Role
    }
}

/// Drives one side of a security context over a framed stream.
pub struct Negotiator<Ctx: SecurityContext> {
    ctx: Ctx,
    role: Role,
    state: NegotiationState,
    sent: usize,
    received: usize,
    released: bool,
    max_frame_len: usize
}

impl<Ctx> Negotiator<Ctx>
where
    Ctx: SecurityContext
{
    /// Take ownership of `ctx`, which is the `role` side of a context.
    #[inline]
    pub fn new(
        ctx: Ctx,
        role: Role
    ) -> Self {
        Negotiator {
            ctx: ctx,
            role: role,
            state: NegotiationState::Init,
            sent: 0,
            received: 0,
            released: false,
            max_frame_len: DEFAULT_MAX_FRAME_LEN
        }
    }

    /// Set the largest frame that will be read from the peer.
    #[inline]
    pub fn with_frame_limit(
        mut self,
        limit: usize
    ) -> Self {
        self.max_frame_len = limit;

        self
    }

    /// Get the current state.
    #[inline]
    pub fn state(&self) -> NegotiationState {
        self.state
    }

    /// Get the side of the context.
    #[inline]
    pub fn role(&self) -> Role {
        self.role
    }

    /// Number of token frames sent to the peer.
    #[inline]
    pub fn tokens_sent(&self) -> usize {
        self.sent
    }

    /// Number of token frames received from the peer.
    #[inline]
    pub fn tokens_received(&self) -> usize {
        self.received
    }

    fn start(
        &mut self,
        role: Role
    ) -> Result<(), NegotiateError<Ctx::Error>> {
        if self.role != role {
            return Err(NegotiateError::WrongRole { role: self.role });
        }

        if self.state != NegotiationState::Init {
            return Err(NegotiateError::AlreadyStarted { state: self.state });
        }

        debug!(target: "gss-negotiate",
               "beginning negotiation as {}",
               self.role);

        Ok(())
    }

    /// Record the outcome of a step, moving to `Failed` on error.
    fn settle<T>(
        &mut self,
        res: Result<T, NegotiateError<Ctx::Error>>
    ) -> Result<T, NegotiateError<Ctx::Error>> {
        if let Err(err) = &res {
            warn!(target: "gss-negotiate",
                  "{} negotiation failed after {} tokens sent, {} received: {}",
                  self.role, self.sent, self.received, err);

            self.state = NegotiationState::Failed;
        }

        res
    }

    fn send_token<S>(
        &mut self,
        stream: &mut S,
        token: Option<Vec<u8>>
    ) -> Result<(), NegotiateError<Ctx::Error>>
    where
        S: Write {
        match token {
            Some(token) if !token.is_empty() => {
                trace!(target: "gss-negotiate",
                       "sending token of {} bytes",
                       token.len());

                write_frame(stream, &token)
                    .map_err(|err| NegotiateError::Frame { error: err })?;
                self.sent += 1;

                Ok(())
            }
            _ => Ok(())
        }
    }

    fn recv_token<S>(
        &mut self,
        stream: &mut S
    ) -> Result<Vec<u8>, NegotiateError<Ctx::Error>>
    where
        S: Read {
        let token = read_frame_limited(stream, self.max_frame_len)
            .map_err(|err| NegotiateError::Frame { error: err })?;

        trace!(target: "gss-negotiate",
               "received token of {} bytes",
               token.len());

        self.received += 1;

        Ok(token)
    }

    fn step(
        &mut self,
        token: &[u8]
    ) -> Result<Option<Vec<u8>>, NegotiateError<Ctx::Error>> {
        self.state = NegotiationState::Negotiating;

        self.ctx
            .step(token)
            .map_err(|err| NegotiateError::Context { error: err })
    }

    fn run_initiator<S>(
        &mut self,
        stream: &mut S
    ) -> Result<(), NegotiateError<Ctx::Error>>
    where
        S: Read + Write {
        let mut token = Vec::new();

        while !self.ctx.is_established() {
            let out = self.step(&token)?;

            self.send_token(stream, out)?;

            if !self.ctx.is_established() {
                token = self.recv_token(stream)?;
            }
        }

        Ok(())
    }

    fn run_acceptor<S>(
        &mut self,
        stream: &mut S
    ) -> Result<String, NegotiateError<Ctx::Error>>
    where
        S: Read + Write {
        while !self.ctx.is_established() {
            let token = self.recv_token(stream)?;
            let out = self.step(&token)?;

            self.send_token(stream, out)?;
        }

        self.ctx
            .source_name()
            .map_err(|err| NegotiateError::Context { error: err })
    }

    /// Run the initiating side of the handshake.
    pub fn initiate<S>(
        &mut self,
        stream: &mut S
    ) -> Result<(), NegotiateError<Ctx::Error>>
    where
        S: Read + Write {
        self.start(Role::Initiator)?;

        let res = self.run_initiator(stream);

        self.settle(res)?;
        self.state = NegotiationState::Established;

        debug!(target: "gss-negotiate",
               "initiator established ({} tokens sent, {} received)",
               self.sent, self.received);

        Ok(())
    }

    /// Run the accepting side of the handshake, returning the
    /// authenticated name of the initiator.
    pub fn accept<S>(
        &mut self,
        stream: &mut S
    ) -> Result<String, NegotiateError<Ctx::Error>>
    where
        S: Read + Write {
        self.start(Role::Acceptor)?;

        let res = self.run_acceptor(stream);
        let peer = self.settle(res)?;

        self.state = NegotiationState::Established;

        debug!(target: "gss-negotiate",
               "acceptor established with {} ({} tokens sent, {} received)",
               peer, self.sent, self.received);

        Ok(peer)
    }

    fn check_established(&self) -> Result<(), NegotiateError<Ctx::Error>> {
        if self.state == NegotiationState::Established {
            Ok(())
        } else {
            Err(NegotiateError::NotEstablished { state: self.state })
        }
    }

    /// Seal `msg` and send it as one frame.
    pub fn send_sealed<S>(
        &mut self,
        stream: &mut S,
        msg: &[u8],
        encrypt: bool
    ) -> Result<(), NegotiateError<Ctx::Error>>
    where
        S: Write {
        self.check_established()?;

        let res = self
            .ctx
            .wrap(encrypt, msg)
            .map_err(|err| NegotiateError::Context { error: err })
            .and_then(|sealed| {
                write_frame(stream, &sealed)
                    .map_err(|err| NegotiateError::Frame { error: err })
            });

        self.settle(res)?;
        self.state = NegotiationState::SealedExchanged;

        Ok(())
    }

    /// Read one frame and unseal it.
    pub fn recv_sealed<S>(
        &mut self,
        stream: &mut S
    ) -> Result<Vec<u8>, NegotiateError<Ctx::Error>>
    where
        S: Read {
        self.check_established()?;

        let res = read_frame_limited(stream, self.max_frame_len)
            .map_err(|err| NegotiateError::Frame { error: err })
            .and_then(|sealed| {
                self.ctx
                    .unwrap(&sealed)
                    .map_err(|err| NegotiateError::Context { error: err })
            });
        let msg = self.settle(res)?;

        self.state = NegotiationState::SealedExchanged;

        Ok(msg)
    }

    fn release(&mut self) {
        if !self.released {
            self.released = true;

            trace!(target: "gss-negotiate",
                   "releasing {} context",
                   self.role);

            if let Err(err) = self.ctx.dispose() {
                warn!(target: "gss-negotiate",
                      "error releasing {} context: {}",
                      self.role, err);
            }
        }
    }

    /// Release the context and pass `result` through.
    ///
    /// Errors from the release are logged, never returned.
    pub fn finish<T, E>(
        mut self,
        result: Result<T, E>
    ) -> Result<T, E> {
        self.release();

        result
    }
}

impl<Ctx> Drop for Negotiator<Ctx>
where
    Ctx: SecurityContext
{
    fn drop(&mut self) {
        self.release()
    }
}

impl<E> ScopedError for NegotiateError<E>
where
    E: ScopedError
{
    fn scope(&self) -> ErrorScope {
        match self {
            NegotiateError::Frame { error } => error.scope(),
            NegotiateError::Context { error } => error.scope(),
            NegotiateError::NotEstablished { .. } |
            NegotiateError::AlreadyStarted { .. } |
            NegotiateError::WrongRole { .. } => ErrorScope::Session
        }
    }
}

impl Display for NegotiationState {
    fn fmt(
        &self,
        f: &mut Formatter
    ) -> Result<(), std::fmt::Error> {
        match self {
            NegotiationState::Init => write!(f, "init"),
            NegotiationState::Negotiating => write!(f, "negotiating"),
            NegotiationState::Established => write!(f, "established"),
            NegotiationState::SealedExchanged => write!(f, "sealed exchanged"),
            NegotiationState::Failed => write!(f, "failed")
        }
    }
}

impl<E> Display for NegotiateError<E>
where
    E: Display
{
    fn fmt(
        &self,
        f: &mut Formatter
    ) -> Result<(), std::fmt::Error> {
        match self {
            NegotiateError::Frame { error } => error.fmt(f),
            NegotiateError::Context { error } => {
                write!(f, "security context error: {}", error)
            }
            NegotiateError::NotEstablished { state } => {
                write!(f, "context not established (state is {})", state)
            }
            NegotiateError::AlreadyStarted { state } => {
                write!(f, "negotiation already started (state is {})", state)
            }
            NegotiateError::WrongRole { role } => {
                write!(f, "negotiator holds the {} side", role)
            }
        }
    }
}

#[cfg(test)]
use std::net::TcpListener;
#[cfg(test)]
use std::net::TcpStream;
#[cfg(test)]
use std::thread::spawn;
#[cfg(test)]
use std::time::Duration;

#[cfg(test)]
use crate::init;
#[cfg(test)]
use crate::mech::loopback::LoopbackCredential;
#[cfg(test)]
use crate::mech::loopback::LoopbackError;
#[cfg(test)]
use crate::mech::loopback::LoopbackMechanism;
#[cfg(test)]
use crate::mech::loopback::DEFAULT_REALM;
#[cfg(test)]
use crate::mech::InitiatorFlags;
#[cfg(test)]
use crate::mech::Mechanism;

#[cfg(test)]
const CLIENT_PRINCIPAL: &str = "hnelson@KERBEROS.EXAMPLE";

/// Run one identity exchange, returning the client's view of the
/// identity, the server's view, and the token frame counts.
#[cfg(test)]
fn exchange(
    mech: LoopbackMechanism,
    encrypt: bool
) -> (String, String, usize, usize) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let server_mech = mech.clone();
    let server = spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();

        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();

        let ctx = server_mech.acceptor(None).unwrap();
        let mut negotiator = Negotiator::new(ctx, Role::Acceptor);
        let peer = negotiator.accept(&mut stream).expect("expected success");

        negotiator
            .send_sealed(&mut stream, peer.as_bytes(), encrypt)
            .expect("expected success");

        assert_eq!(NegotiationState::SealedExchanged, negotiator.state());

        let ntokens = negotiator.tokens_sent() + negotiator.tokens_received();

        negotiator.finish::<_, ()>(Ok((peer, ntokens))).unwrap()
    });
    let mut stream = TcpStream::connect(addr).unwrap();

    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();

    let cred = LoopbackCredential::from_principal(CLIENT_PRINCIPAL);
    let ctx = mech
        .initiator("gsstestserver/xxx", Some(&cred), InitiatorFlags::mutual())
        .unwrap();
    let mut negotiator = Negotiator::new(ctx, Role::Initiator);

    negotiator.initiate(&mut stream).expect("expected success");

    let sealed = negotiator
        .recv_sealed(&mut stream)
        .expect("expected success");
    let name = String::from_utf8(sealed).unwrap();
    let ntokens = negotiator.tokens_sent() + negotiator.tokens_received();

    drop(negotiator);

    let (peer, server_ntokens) = server.join().unwrap();

    assert_eq!(ntokens, server_ntokens);

    (name, peer, ntokens, server_ntokens)
}

#[test]
fn test_identity_round_trip() {
    init();

    let mech = LoopbackMechanism::default();
    let (name, peer, ntokens, _) = exchange(mech.clone(), true);

    assert_eq!(CLIENT_PRINCIPAL, name);
    assert_eq!(CLIENT_PRINCIPAL, peer);
    assert_eq!(2, ntokens);
    assert_eq!(2, mech.disposals());
}

#[test]
fn test_three_legs() {
    init();

    let mech = LoopbackMechanism::new(DEFAULT_REALM, 3);
    let (name, _, ntokens, _) = exchange(mech, true);

    assert_eq!(CLIENT_PRINCIPAL, name);
    assert_eq!(3, ntokens);
}

#[test]
fn test_zero_legs() {
    init();

    let mech = LoopbackMechanism::new(DEFAULT_REALM, 0);
    let (name, peer, ntokens, _) = exchange(mech, true);

    assert_eq!(0, ntokens);
    assert_eq!(crate::mech::loopback::ANONYMOUS_PRINCIPAL, peer);
    assert_eq!(peer, name);
}

#[test]
fn test_confidentiality_toggle() {
    init();

    let (name, _, _, _) = exchange(LoopbackMechanism::default(), false);

    assert_eq!(CLIENT_PRINCIPAL, name);
}

#[test]
fn test_sealed_requires_established() {
    init();

    let mech = LoopbackMechanism::default();
    let ctx = mech.acceptor(None).unwrap();
    let mut negotiator = Negotiator::new(ctx, Role::Acceptor);
    let mut buf = Vec::new();

    match negotiator.send_sealed(&mut buf, b"early", true) {
        Err(NegotiateError::NotEstablished { state }) => {
            assert_eq!(NegotiationState::Init, state)
        }
        other => panic!("expected not established, got {:?}", other)
    }

    match negotiator.initiate(&mut std::io::Cursor::new(Vec::new())) {
        Err(NegotiateError::WrongRole { role }) => {
            assert_eq!(Role::Acceptor, role)
        }
        other => panic!("expected wrong role, got {:?}", other)
    }

    assert!(buf.is_empty());
    drop(negotiator);
    assert_eq!(1, mech.disposals());
}

#[test]
fn test_handshake_failure_releases_once() {
    init();

    let mech = LoopbackMechanism::default();
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let server_mech = mech.clone();
    let server = spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        let cred = LoopbackCredential::from_principal("HTTP/other@KERBEROS.EXAMPLE");
        let ctx = server_mech.acceptor(Some(&cred)).unwrap();
        let mut negotiator = Negotiator::new(ctx, Role::Acceptor);
        let err = negotiator.accept(&mut stream).expect_err("expected failure");

        assert_eq!(NegotiationState::Failed, negotiator.state());
        assert_eq!(ErrorScope::External, err.scope());

        match err {
            NegotiateError::Context {
                error: LoopbackError::WrongTarget { .. }
            } => {}
            other => panic!("expected wrong target, got {:?}", other)
        }
    });
    let mut stream = TcpStream::connect(addr).unwrap();

    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();

    let ctx = mech
        .initiator("gsstestserver/xxx", None, InitiatorFlags::mutual())
        .unwrap();
    let mut negotiator = Negotiator::new(ctx, Role::Initiator);
    let err = negotiator
        .initiate(&mut stream)
        .expect_err("expected failure");

    assert!(matches!(err, NegotiateError::Frame { .. }));
    assert_eq!(NegotiationState::Failed, negotiator.state());

    server.join().unwrap();

    let res: Result<(), ()> = negotiator.finish(Ok(()));

    assert!(res.is_ok());
    assert_eq!(2, mech.disposals());
}
