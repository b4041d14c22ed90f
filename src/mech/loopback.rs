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

//! Deterministic in-process mechanism.
//!
//! The loopback mechanism behaves like a Kerberos mechanism from the
//! point of view of the negotiation protocol (opaque tokens, a
//! mechanism-chosen number of legs, sealed messages), but needs no KDC
//! and no keys.  It exists so that the protocol machinery can be
//! exercised in tests and demonstrations.
//!
//! **This mechanism provides no security whatsoever.**  Confidential
//! messages are masked, not encrypted, and anyone can claim any
//! principal.
//!
//! # Legs
//!
//! A loopback context is established after a fixed number of token
//! *legs*, alternating between initiator and acceptor and starting
//! with the initiator.  The default of two legs mirrors a mutually
//! authenticated Kerberos exchange (AP-REQ, AP-REP).  One leg mirrors
//! an exchange without mutual authentication, and an initiator that
//! does not ask for mutual authentication never negotiates more than
//! one leg.  The initiator's first token carries the leg count, which
//! the acceptor adopts.  With zero legs, both sides are established on
//! creation, the acceptor sees the anonymous principal, and messages
//! are sealed under a key that depends on neither side's names.
//!
//! # Realm
//!
//! Principal names without a realm are completed with the mechanism's
//! realm, so `hnelson` logs in as `hnelson@KERBEROS.EXAMPLE` by
//! default.  If any principals are registered with
//! [with_principal](LoopbackMechanism::with_principal), logins must
//! name one of them and supply its secret; otherwise any name is
//! accepted.
use std::collections::HashMap;
use std::convert::TryFrom;
use std::fmt::Display;
use std::fmt::Formatter;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use log::debug;
use log::info;
use log::trace;
use log::warn;

use crate::cred::CredUsage;
use crate::cred::CredentialField;
use crate::cred::CredentialHandler;
use crate::cred::CredentialProvider;
use crate::cred::LoginError;
use crate::error::ErrorScope;
use crate::error::ScopedError;
use crate::mech::InitiatorFlags;
use crate::mech::Mechanism;
use crate::mech::Role;
use crate::mech::SecurityContext;

/// The Kerberos anonymous principal.
pub const ANONYMOUS_PRINCIPAL: &str = "WELLKNOWN/ANONYMOUS@WELLKNOWN:ANONYMOUS";
/// Default realm for unqualified principal names.
pub const DEFAULT_REALM: &str = "KERBEROS.EXAMPLE";
/// Default number of token legs.
pub const DEFAULT_LEGS: usize = 2;

const TOKEN_TAG: [u8; 4] = *b"LBK1";
const TOKEN_HEADER_LEN: usize = 12;
const SEAL_CONF: u8 = 0x01;
const SEAL_HEADER_LEN: usize = 5;
const FNV_OFFSET: u32 = 0x811c_9dc5;
const FNV_PRIME: u32 = 0x0100_0193;

/// Loopback mechanism.
///
/// Clones share their principal registry and disposal counter.
#[derive(Clone, Debug)]
pub struct LoopbackMechanism {
    realm: String,
    legs: usize,
    principals: Arc<HashMap<String, Vec<u8>>>,
    disposals: Arc<AtomicUsize>
}

/// Credential produced by a loopback login.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct LoopbackCredential {
    principal: String
}

/// Login provider for [LoopbackMechanism].
#[derive(Debug)]
pub struct LoopbackCredentialProvider {
    realm: String,
    principals: Arc<HashMap<String, Vec<u8>>>,
    current: Option<String>
}

/// One side of a loopback context.
#[derive(Debug)]
pub struct LoopbackContext {
    role: Role,
    realm: String,
    /// Total number of legs, once known.
    legs: usize,
    /// Index of the next leg to be sent or received.
    leg: usize,
    established: bool,
    disposed: bool,
    /// Initiating principal, once known.
    source: Option<String>,
    /// Target principal, once known.
    target: Option<String>,
    /// Acceptor's own principal, if it has a credential.
    local: Option<String>,
    disposals: Arc<AtomicUsize>
}

/// Errors from the loopback mechanism.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum LoopbackError {
    /// A sealed operation was attempted before establishment.
    NotEstablished,
    /// A token arrived after establishment.
    AlreadyEstablished,
    /// The context has been disposed.
    Disposed,
    /// A principal name was empty.
    BadName,
    /// A token could not be parsed.
    BadToken {
        /// What was wrong with it.
        reason: &'static str
    },
    /// A token arrived out of order.
    WrongLeg {
        /// Leg that was expected.
        expected: usize,
        /// Leg that arrived.
        actual: usize
    },
    /// The initiator targeted a different principal.
    WrongTarget {
        /// This acceptor's principal.
        expected: String,
        /// The principal named in the token.
        actual: String
    },
    /// A sealed message failed its integrity check.
    BadChecksum
}

/// Complete `name` with `realm` if it has none.
pub fn canonicalize(
    name: &str,
    realm: &str
) -> String {
    if name.contains('@') {
        String::from(name)
    } else {
        format!("{}@{}", name, realm)
    }
}

fn fnv1a(
    seed: u32,
    data: &[u8]
) -> u32 {
    data.iter()
        .fold(seed, |hash, b| (hash ^ (*b as u32)).wrapping_mul(FNV_PRIME))
}

impl Default for LoopbackMechanism {
    #[inline]
    fn default() -> Self {
        LoopbackMechanism::new(DEFAULT_REALM, DEFAULT_LEGS)
    }
}

impl LoopbackMechanism {
    /// Create a mechanism for `realm` that negotiates in `legs` legs.
    #[inline]
    pub fn new(
        realm: &str,
        legs: usize
    ) -> Self {
        LoopbackMechanism {
            realm: String::from(realm),
            legs: legs,
            principals: Arc::new(HashMap::new()),
            disposals: Arc::new(AtomicUsize::new(0))
        }
    }

    /// Register a principal and its secret.
    ///
    /// Once any principal is registered, logins are checked against
    /// the registry.
    pub fn with_principal(
        mut self,
        name: &str,
        secret: &[u8]
    ) -> Self {
        Arc::make_mut(&mut self.principals)
            .insert(canonicalize(name, &self.realm), secret.to_vec());

        self
    }

    /// Get the realm.
    #[inline]
    pub fn realm(&self) -> &str {
        &self.realm
    }

    /// Get the number of legs.
    #[inline]
    pub fn legs(&self) -> usize {
        self.legs
    }

    /// Number of [dispose](SecurityContext::dispose) calls made on
    /// contexts created by this mechanism (or its clones).
    #[inline]
    pub fn disposals(&self) -> usize {
        self.disposals.load(Ordering::SeqCst)
    }

    fn context(
        &self,
        role: Role
    ) -> LoopbackContext {
        LoopbackContext {
            role: role,
            realm: self.realm.clone(),
            legs: self.legs,
            leg: 0,
            established: false,
            disposed: false,
            source: None,
            target: None,
            local: None,
            disposals: self.disposals.clone()
        }
    }
}

impl LoopbackCredential {
    /// Create a credential for an already-canonical `principal`
    /// without logging in.
    #[inline]
    pub fn from_principal(principal: &str) -> Self {
        LoopbackCredential {
            principal: String::from(principal)
        }
    }

    /// Get the canonical principal name.
    #[inline]
    pub fn principal(&self) -> &str {
        &self.principal
    }
}

impl LoopbackCredentialProvider {
    /// Get the principal currently logged in, if any.
    #[inline]
    pub fn current(&self) -> Option<&str> {
        self.current.as_deref()
    }
}

impl CredentialProvider for LoopbackCredentialProvider {
    type Credential = LoopbackCredential;

    fn login<H>(
        &mut self,
        handler: &H,
        usage: CredUsage
    ) -> Result<LoopbackCredential, LoginError>
    where
        H: CredentialHandler + ?Sized {
        let name = handler.name()?.ok_or(LoginError::UnsupportedField {
            field: CredentialField::Name
        })?;

        if name.is_empty() {
            return Err(LoginError::UnknownPrincipal { principal: name });
        }

        let principal = canonicalize(&name, &self.realm);

        if !self.principals.is_empty() {
            let expected = self.principals.get(&principal).ok_or_else(|| {
                LoginError::UnknownPrincipal {
                    principal: principal.clone()
                }
            })?;
            let secret = handler.secret()?.ok_or(
                LoginError::UnsupportedField {
                    field: CredentialField::Secret
                }
            )?;

            if &secret != expected {
                warn!(target: "loopback-mech",
                      "bad secret for {}",
                      principal);

                return Err(LoginError::BadSecret {
                    principal: principal
                });
            }
        }

        info!(target: "loopback-mech",
              "logged in as {} ({})",
              principal, usage);

        self.current = Some(principal.clone());

        Ok(LoopbackCredential {
            principal: principal
        })
    }

    #[inline]
    fn reset(&mut self) {
        self.current = None;
    }
}

impl LoopbackContext {
    /// Get the side of this context.
    #[inline]
    pub fn role(&self) -> Role {
        self.role
    }

    /// Index of the next leg.
    #[inline]
    pub fn leg(&self) -> usize {
        self.leg
    }

    fn check_live(&self) -> Result<(), LoopbackError> {
        if self.disposed {
            Err(LoopbackError::Disposed)
        } else {
            Ok(())
        }
    }

    fn next_token(&mut self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(TOKEN_HEADER_LEN);

        buf.extend_from_slice(&TOKEN_TAG);
        buf.extend_from_slice(&(self.leg as u32).to_be_bytes());
        buf.extend_from_slice(&(self.legs as u32).to_be_bytes());

        if self.leg == 0 {
            if let (Some(source), Some(target)) = (&self.source, &self.target)
            {
                buf.extend_from_slice(source.as_bytes());
                buf.push(0);
                buf.extend_from_slice(target.as_bytes());
            }
        }

        trace!(target: "loopback-mech",
               "{} produced leg {} of {}",
               self.role, self.leg, self.legs);

        self.leg += 1;

        if self.leg >= self.legs {
            self.established = true;
        }

        buf
    }

    /// Parse a token header, returning the leg count and the body.
    fn parse_token<'a>(
        &self,
        token: &'a [u8]
    ) -> Result<(usize, &'a [u8]), LoopbackError> {
        if token.len() < TOKEN_HEADER_LEN {
            return Err(LoopbackError::BadToken {
                reason: "token too short"
            });
        }

        if token[..4] != TOKEN_TAG {
            return Err(LoopbackError::BadToken {
                reason: "bad token tag"
            });
        }

        let mut word = [0; 4];

        word.copy_from_slice(&token[4..8]);

        let leg = u32::from_be_bytes(word) as usize;

        word.copy_from_slice(&token[8..12]);

        let legs = u32::from_be_bytes(word) as usize;

        if leg != self.leg {
            return Err(LoopbackError::WrongLeg {
                expected: self.leg,
                actual: leg
            });
        }

        if leg >= legs {
            return Err(LoopbackError::BadToken {
                reason: "leg beyond end of exchange"
            });
        }

        Ok((legs, &token[TOKEN_HEADER_LEN..]))
    }

    fn accept_first(
        &mut self,
        legs: usize,
        body: &[u8]
    ) -> Result<(), LoopbackError> {
        let split = body.iter().position(|b| *b == 0).ok_or(
            LoopbackError::BadToken {
                reason: "missing principal names"
            }
        )?;
        let source = String::from_utf8(body[..split].to_vec()).map_err(|_| {
            LoopbackError::BadToken {
                reason: "source name is not UTF-8"
            }
        })?;
        let target = String::from_utf8(body[split + 1..].to_vec()).map_err(
            |_| LoopbackError::BadToken {
                reason: "target name is not UTF-8"
            }
        )?;

        let target = canonicalize(&target, &self.realm);

        if let Some(local) = &self.local {
            if local != &target {
                warn!(target: "loopback-mech",
                      "initiator {} targeted {}, but this is {}",
                      source, target, local);

                return Err(LoopbackError::WrongTarget {
                    expected: local.clone(),
                    actual: target
                });
            }
        }

        debug!(target: "loopback-mech",
               "initiator {} targeting {} in {} legs",
               source, target, legs);

        self.legs = legs;
        self.source = Some(source);
        self.target = Some(target);

        Ok(())
    }

    fn session_key(&self) -> u32 {
        // With no legs, no names pass between the two sides.
        let (source, target) = if self.legs == 0 {
            (ANONYMOUS_PRINCIPAL, "")
        } else {
            (
                self.source.as_deref().unwrap_or(ANONYMOUS_PRINCIPAL),
                self.target.as_deref().unwrap_or("")
            )
        };
        let hash = fnv1a(FNV_OFFSET, source.as_bytes());

        fnv1a(fnv1a(hash, &[0]), target.as_bytes())
    }

    fn mask(
        &self,
        data: &mut [u8]
    ) {
        let key = self.session_key();

        for (i, b) in data.iter_mut().enumerate() {
            *b ^= key.rotate_left((i % 32) as u32) as u8;
        }
    }
}

impl SecurityContext for LoopbackContext {
    type Error = LoopbackError;

    fn step(
        &mut self,
        token: &[u8]
    ) -> Result<Option<Vec<u8>>, LoopbackError> {
        self.check_live()?;

        if self.established {
            return Err(LoopbackError::AlreadyEstablished);
        }

        match self.role {
            // The first initiator step produces leg 0 from nothing.
            Role::Initiator if self.leg == 0 => {
                if !token.is_empty() {
                    return Err(LoopbackError::BadToken {
                        reason: "unexpected token before first leg"
                    });
                }

                Ok(Some(self.next_token()))
            }
            role => {
                let (legs, body) = self.parse_token(token)?;

                if role == Role::Acceptor && self.leg == 0 {
                    self.accept_first(legs, body)?;
                }

                self.leg += 1;

                if self.leg >= self.legs {
                    debug!(target: "loopback-mech",
                           "{} established after {} legs",
                           self.role, self.legs);

                    self.established = true;

                    Ok(None)
                } else {
                    Ok(Some(self.next_token()))
                }
            }
        }
    }

    #[inline]
    fn is_established(&self) -> bool {
        self.established
    }

    fn wrap(
        &mut self,
        encrypt: bool,
        msg: &[u8]
    ) -> Result<Vec<u8>, LoopbackError> {
        self.check_live()?;

        if !self.established {
            return Err(LoopbackError::NotEstablished);
        }

        let checksum = fnv1a(self.session_key(), msg);
        let mut buf = Vec::with_capacity(msg.len() + SEAL_HEADER_LEN);

        buf.push(if encrypt { SEAL_CONF } else { 0 });
        buf.extend_from_slice(&checksum.to_be_bytes());
        buf.extend_from_slice(msg);

        if encrypt {
            self.mask(&mut buf[SEAL_HEADER_LEN..]);
        }

        Ok(buf)
    }

    fn unwrap(
        &mut self,
        msg: &[u8]
    ) -> Result<Vec<u8>, LoopbackError> {
        self.check_live()?;

        if !self.established {
            return Err(LoopbackError::NotEstablished);
        }

        if msg.len() < SEAL_HEADER_LEN {
            return Err(LoopbackError::BadToken {
                reason: "sealed message too short"
            });
        }

        let word = <[u8; 4]>::try_from(&msg[1..SEAL_HEADER_LEN]).map_err(
            |_| LoopbackError::BadToken {
                reason: "sealed message too short"
            }
        )?;
        let checksum = u32::from_be_bytes(word);
        let mut body = msg[SEAL_HEADER_LEN..].to_vec();

        if msg[0] & SEAL_CONF != 0 {
            self.mask(&mut body);
        }

        if fnv1a(self.session_key(), &body) != checksum {
            return Err(LoopbackError::BadChecksum);
        }

        Ok(body)
    }

    fn source_name(&mut self) -> Result<String, LoopbackError> {
        self.check_live()?;

        match (&self.source, self.role) {
            (Some(source), _) => Ok(source.clone()),
            // An acceptor that never saw a token is anonymous.
            (None, Role::Acceptor) if self.established => {
                Ok(String::from(ANONYMOUS_PRINCIPAL))
            }
            (None, _) => Err(LoopbackError::NotEstablished)
        }
    }

    fn target_name(&mut self) -> Result<String, LoopbackError> {
        self.check_live()?;

        match (&self.local, &self.target) {
            (Some(local), _) => Ok(local.clone()),
            (None, Some(target)) => Ok(target.clone()),
            (None, None) => Err(LoopbackError::NotEstablished)
        }
    }

    fn dispose(&mut self) -> Result<(), LoopbackError> {
        self.disposals.fetch_add(1, Ordering::SeqCst);

        if !self.disposed {
            trace!(target: "loopback-mech",
                   "disposing {} context",
                   self.role);

            self.disposed = true;
        }

        Ok(())
    }
}

impl Mechanism for LoopbackMechanism {
    type Context = LoopbackContext;
    type CreateError = LoopbackError;
    type Credential = LoopbackCredential;
    type Provider = LoopbackCredentialProvider;

    const NAME: &'static str = "loopback";

    fn initiator(
        &self,
        target: &str,
        cred: Option<&LoopbackCredential>,
        flags: InitiatorFlags
    ) -> Result<LoopbackContext, LoopbackError> {
        if target.is_empty() {
            return Err(LoopbackError::BadName);
        }

        let mut ctx = self.context(Role::Initiator);

        // The acceptor's reply leg is what authenticates it.
        if !flags.is_mutual() {
            ctx.legs = self.legs.min(1);
        }

        let source = match cred {
            Some(cred) => cred.principal.clone(),
            None => String::from(ANONYMOUS_PRINCIPAL)
        };

        ctx.source = Some(source);
        ctx.target = Some(canonicalize(target, &self.realm));
        ctx.established = ctx.legs == 0;

        Ok(ctx)
    }

    fn acceptor(
        &self,
        cred: Option<&LoopbackCredential>
    ) -> Result<LoopbackContext, LoopbackError> {
        let mut ctx = self.context(Role::Acceptor);

        ctx.local = cred.map(|cred| cred.principal.clone());
        ctx.established = self.legs == 0;

        Ok(ctx)
    }

    fn credential_provider(&self) -> LoopbackCredentialProvider {
        LoopbackCredentialProvider {
            realm: self.realm.clone(),
            principals: self.principals.clone(),
            current: None
        }
    }
}

impl ScopedError for LoopbackError {
    fn scope(&self) -> ErrorScope {
        match self {
            LoopbackError::NotEstablished |
            LoopbackError::AlreadyEstablished |
            LoopbackError::Disposed => ErrorScope::Session,
            LoopbackError::BadName => ErrorScope::Unrecoverable,
            LoopbackError::BadToken { .. } |
            LoopbackError::WrongLeg { .. } |
            LoopbackError::WrongTarget { .. } |
            LoopbackError::BadChecksum => ErrorScope::External
        }
    }
}

impl Display for LoopbackError {
    fn fmt(
        &self,
        f: &mut Formatter
    ) -> Result<(), std::fmt::Error> {
        match self {
            LoopbackError::NotEstablished => {
                write!(f, "context is not established")
            }
            LoopbackError::AlreadyEstablished => {
                write!(f, "context is already established")
            }
            LoopbackError::Disposed => write!(f, "context has been disposed"),
            LoopbackError::BadName => write!(f, "empty principal name"),
            LoopbackError::BadToken { reason } => {
                write!(f, "bad loopback token ({})", reason)
            }
            LoopbackError::WrongLeg { expected, actual } => write!(
                f,
                "expected token for leg {}, got leg {}",
                expected, actual
            ),
            LoopbackError::WrongTarget { expected, actual } => write!(
                f,
                "token targets {}, but acceptor is {}",
                actual, expected
            ),
            LoopbackError::BadChecksum => {
                write!(f, "sealed message failed integrity check")
            }
        }
    }
}

#[cfg(test)]
use crate::cred::NoCredentials;
#[cfg(test)]
use crate::cred::PasswordHandler;

#[cfg(test)]
fn drive(
    init: &mut LoopbackContext,
    accept: &mut LoopbackContext
) -> usize {
    let mut ntokens = 0;
    let mut token = Vec::new();

    while !init.is_established() || !accept.is_established() {
        if !init.is_established() {
            match init.step(&token).expect("expected success") {
                Some(out) => {
                    ntokens += 1;
                    token = out;
                }
                None => token.clear()
            }
        }

        if !accept.is_established() && !token.is_empty() {
            match accept.step(&token).expect("expected success") {
                Some(out) => {
                    ntokens += 1;
                    token = out;
                }
                None => token.clear()
            }
        }
    }

    ntokens
}

#[test]
fn test_canonicalize() {
    assert_eq!("hnelson@EXAMPLE", canonicalize("hnelson", "EXAMPLE"));
    assert_eq!(
        "gsstestserver/xxx@JBOSS.ORG",
        canonicalize("gsstestserver/xxx@JBOSS.ORG", "EXAMPLE")
    );
}

#[test]
fn test_legs_drive_establishment() {
    for legs in 0..5 {
        let mech = LoopbackMechanism::new(DEFAULT_REALM, legs);
        let cred = LoopbackCredential {
            principal: String::from("hnelson@KERBEROS.EXAMPLE")
        };
        let mut init = mech
            .initiator("HTTP/localhost", Some(&cred), InitiatorFlags::mutual())
            .unwrap();
        let mut accept = mech.acceptor(None).unwrap();

        assert_eq!(legs, drive(&mut init, &mut accept));

        let expected = if legs == 0 {
            ANONYMOUS_PRINCIPAL
        } else {
            "hnelson@KERBEROS.EXAMPLE"
        };

        assert_eq!(expected, accept.source_name().unwrap());
    }
}

#[test]
fn test_wrap_unwrap() {
    let mech = LoopbackMechanism::default();
    let cred = LoopbackCredential {
        principal: String::from("jduke@KERBEROS.EXAMPLE")
    };
    let mut init = mech
        .initiator("gsstestserver/xxx", Some(&cred), InitiatorFlags::mutual())
        .unwrap();
    let mut accept = mech.acceptor(None).unwrap();

    assert_eq!(
        Err(LoopbackError::NotEstablished),
        accept.wrap(true, b"early")
    );

    drive(&mut init, &mut accept);

    let sealed = accept.wrap(true, b"jduke@KERBEROS.EXAMPLE").unwrap();

    assert_ne!(&b"jduke@KERBEROS.EXAMPLE"[..], &sealed[SEAL_HEADER_LEN..]);
    assert_eq!(b"jduke@KERBEROS.EXAMPLE".to_vec(), init.unwrap(&sealed).unwrap());

    let plain = accept.wrap(false, b"visible").unwrap();

    assert_eq!(b"visible", &plain[SEAL_HEADER_LEN..]);
    assert_eq!(b"visible".to_vec(), init.unwrap(&plain).unwrap());

    let mut tampered = plain.clone();
    let last = tampered.len() - 1;

    tampered[last] ^= 0xff;

    assert_eq!(Err(LoopbackError::BadChecksum), init.unwrap(&tampered));
}

#[test]
fn test_wrong_target_rejected() {
    let mech = LoopbackMechanism::default();
    let server = LoopbackCredential {
        principal: String::from("gsstestserver/xxx@JBOSS.ORG")
    };
    let mut init = mech
        .initiator("HTTP/elsewhere", None, InitiatorFlags::mutual())
        .unwrap();
    let mut accept = mech.acceptor(Some(&server)).unwrap();
    let token = init.step(&[]).unwrap().unwrap();

    match accept.step(&token) {
        Err(LoopbackError::WrongTarget { expected, actual }) => {
            assert_eq!("gsstestserver/xxx@JBOSS.ORG", expected);
            assert_eq!("HTTP/elsewhere@KERBEROS.EXAMPLE", actual);
        }
        other => panic!("expected wrong target, got {:?}", other)
    }
}

#[test]
fn test_out_of_order_token_rejected() {
    let mech = LoopbackMechanism::new(DEFAULT_REALM, 3);
    let mut init = mech
        .initiator("HTTP/localhost", None, InitiatorFlags::mutual())
        .unwrap();
    let mut accept = mech.acceptor(None).unwrap();
    let first = init.step(&[]).unwrap().unwrap();

    accept.step(&first).unwrap();

    assert_eq!(
        Err(LoopbackError::WrongLeg {
            expected: 1,
            actual: 0
        }),
        init.step(&first)
    );
    assert_eq!(
        Err(LoopbackError::BadToken {
            reason: "bad token tag"
        }),
        accept.step(b"garbage-garbage")
    );
}

#[test]
fn test_login_registry() {
    let mech = LoopbackMechanism::default()
        .with_principal("hnelson", b"secret")
        .with_principal("gsstestserver/xxx@JBOSS.ORG", b"gsstestpwd");
    let mut provider = mech.credential_provider();
    let cred = provider
        .login(
            &PasswordHandler::with_password("hnelson", "secret"),
            CredUsage::Initiate
        )
        .expect("expected success");

    assert_eq!("hnelson@KERBEROS.EXAMPLE", cred.principal());
    assert_eq!(Some("hnelson@KERBEROS.EXAMPLE"), provider.current());

    provider.reset();

    assert_eq!(None, provider.current());
    assert_eq!(
        Err(LoginError::BadSecret {
            principal: String::from("hnelson@KERBEROS.EXAMPLE")
        }),
        provider.login(
            &PasswordHandler::with_password("hnelson", "wrong"),
            CredUsage::Initiate
        )
    );
    assert_eq!(
        Err(LoginError::UnknownPrincipal {
            principal: String::from("jduke@KERBEROS.EXAMPLE")
        }),
        provider.login(
            &PasswordHandler::with_password("jduke", "theduke"),
            CredUsage::Initiate
        )
    );
    assert_eq!(
        Err(LoginError::UnsupportedField {
            field: CredentialField::Name
        }),
        provider.login(&NoCredentials, CredUsage::Accept)
    );
}

#[test]
fn test_dispose_counts() {
    let mech = LoopbackMechanism::default();
    let mut ctx = mech.acceptor(None).unwrap();

    ctx.dispose().unwrap();

    assert_eq!(Err(LoopbackError::Disposed), ctx.step(b"anything"));
    assert_eq!(1, mech.disposals());
}

#[test]
fn test_zero_legs_wrap_with_credential() {
    let mech = LoopbackMechanism::new(DEFAULT_REALM, 0);
    let cred = LoopbackCredential {
        principal: String::from("hnelson@KERBEROS.EXAMPLE")
    };
    let mut init = mech
        .initiator("gsstestserver/xxx", Some(&cred), InitiatorFlags::mutual())
        .unwrap();
    let mut accept = mech.acceptor(None).unwrap();

    assert!(init.is_established());
    assert!(accept.is_established());
    assert_eq!(ANONYMOUS_PRINCIPAL, accept.source_name().unwrap());

    let sealed = accept.wrap(true, ANONYMOUS_PRINCIPAL.as_bytes()).unwrap();

    assert_eq!(
        ANONYMOUS_PRINCIPAL.as_bytes().to_vec(),
        init.unwrap(&sealed).unwrap()
    );

    let reply = init.wrap(false, b"thanks").unwrap();

    assert_eq!(b"thanks".to_vec(), accept.unwrap(&reply).unwrap());
}

#[test]
fn test_unilateral_drops_reply_leg() {
    let mech = LoopbackMechanism::default();
    let cred = LoopbackCredential {
        principal: String::from("hnelson@KERBEROS.EXAMPLE")
    };
    let mut init = mech
        .initiator(
            "gsstestserver/xxx",
            Some(&cred),
            InitiatorFlags::unilateral()
        )
        .unwrap();
    let mut accept = mech.acceptor(None).unwrap();
    let token = init.step(&[]).unwrap().unwrap();

    assert!(init.is_established());
    assert_eq!(None, accept.step(&token).unwrap());
    assert!(accept.is_established());
    assert_eq!("hnelson@KERBEROS.EXAMPLE", accept.source_name().unwrap());

    let sealed = accept.wrap(true, b"hnelson@KERBEROS.EXAMPLE").unwrap();

    assert_eq!(
        b"hnelson@KERBEROS.EXAMPLE".to_vec(),
        init.unwrap(&sealed).unwrap()
    );
}
