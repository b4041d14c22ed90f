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

//! Security mechanisms and context negotiation.
//!
//! A *mechanism* creates *security contexts*.  Each context belongs to
//! one side of one connection and is driven to establishment by
//! feeding it the tokens produced by its peer.  Once established, a
//! context can seal (wrap) and unseal (unwrap) application messages.
//!
//! This module defines the [Mechanism] and [SecurityContext] traits
//! that the rest of the crate is written against, and the
//! [Negotiator](negotiate::Negotiator) that runs the token exchange
//! over a framed stream.  Two mechanisms are provided:
//!
//! - [gssapi]: Kerberos 5 through the platform GSSAPI library (requires
//!   the `gssapi` feature)
//!
//! - [loopback]: a deterministic in-process mechanism for tests and for
//!   running the tools without a KDC (not secure)
use std::fmt::Display;

use serde::Deserialize;
use serde::Serialize;

use crate::cred::CredentialProvider;
use crate::error::ScopedError;

#[cfg(feature = "gssapi")]
pub mod gssapi;
pub mod loopback;
pub mod negotiate;

/// Flags requested by the initiating side of a context.
///
/// # YAML Format
///
/// The YAML format has three optional boolean fields, `mutual`,
/// `confidentiality`, and `integrity`, all defaulting to `false`.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
#[serde(default)]
pub struct InitiatorFlags {
    /// Request mutual authentication.
    mutual: bool,
    /// Request confidentiality for sealed messages.
    confidentiality: bool,
    /// Request integrity protection for sealed messages.
    integrity: bool
}

/// The side of a context.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Role {
    /// The client side, which sends the first token.
    Initiator,
    /// The server side.
    Acceptor
}

/// One side of a security context.
pub trait SecurityContext {
    /// Errors from the underlying mechanism.
    type Error: Display + ScopedError;

    /// Advance the negotiation.
    ///
    /// The initiator's first call is made with an empty token.  The
    /// result is the token to send to the peer, if any.  Whether the
    /// context is finished is reported separately by
    /// [is_established](SecurityContext::is_established).
    fn step(
        &mut self,
        token: &[u8]
    ) -> Result<Option<Vec<u8>>, Self::Error>;

    /// Whether negotiation has completed.
    fn is_established(&self) -> bool;

    /// Seal `msg` for the peer.  If `encrypt` is set, confidentiality
    /// is requested.
    fn wrap(
        &mut self,
        encrypt: bool,
        msg: &[u8]
    ) -> Result<Vec<u8>, Self::Error>;

    /// Recover a message sealed by the peer.
    fn unwrap(
        &mut self,
        msg: &[u8]
    ) -> Result<Vec<u8>, Self::Error>;

    /// Name of the initiating principal.
    ///
    /// On an established acceptor, this is the authenticated peer.
    fn source_name(&mut self) -> Result<String, Self::Error>;

    /// Name of the accepting principal.
    fn target_name(&mut self) -> Result<String, Self::Error>;

    /// Release the resources held by this context.
    ///
    /// Calling this more than once is harmless.
    fn dispose(&mut self) -> Result<(), Self::Error>;
}

/// A factory for [SecurityContext]s.
pub trait Mechanism {
    /// Name of the mechanism, used in logging.
    const NAME: &'static str;

    /// Local credentials accepted by this mechanism.
    type Credential: Clone;
    /// Contexts created by this mechanism.
    type Context: SecurityContext;
    /// Errors that can occur creating a context.
    type CreateError: Display + ScopedError;
    /// Login provider producing [Credential](Mechanism::Credential)s.
    type Provider: CredentialProvider<Credential = Self::Credential>;

    /// Create the initiating side of a context aimed at `target`.
    ///
    /// If `cred` is `None`, the default credentials are used.
    fn initiator(
        &self,
        target: &str,
        cred: Option<&Self::Credential>,
        flags: InitiatorFlags
    ) -> Result<Self::Context, Self::CreateError>;

    /// Create the accepting side of a context.
    ///
    /// If `cred` is `None`, the default credentials are used.
    fn acceptor(
        &self,
        cred: Option<&Self::Credential>
    ) -> Result<Self::Context, Self::CreateError>;

    /// Get a login provider for this mechanism.
    fn credential_provider(&self) -> Self::Provider;
}

impl InitiatorFlags {
    /// Create flags from their components.
    #[inline]
    pub fn new(
        mutual: bool,
        confidentiality: bool,
        integrity: bool
    ) -> Self {
        InitiatorFlags {
            mutual: mutual,
            confidentiality: confidentiality,
            integrity: integrity
        }
    }

    /// Request mutual authentication, confidentiality, and integrity.
    #[inline]
    pub fn mutual() -> Self {
        InitiatorFlags::new(true, true, true)
    }

    /// Request nothing beyond authenticating the initiator.
    #[inline]
    pub fn unilateral() -> Self {
        InitiatorFlags::new(false, false, false)
    }

    /// Whether mutual authentication is requested.
    #[inline]
    pub fn is_mutual(&self) -> bool {
        self.mutual
    }

    /// Whether confidentiality is requested.
    #[inline]
    pub fn is_confidential(&self) -> bool {
        self.confidentiality
    }

    /// Whether integrity protection is requested.
    #[inline]
    pub fn is_integrity(&self) -> bool {
        self.integrity
    }
}

impl Display for Role {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter
    ) -> Result<(), std::fmt::Error> {
        match self {
            Role::Initiator => write!(f, "initiator"),
            Role::Acceptor => write!(f, "acceptor")
        }
    }
}

#[test]
fn test_deserialize_flags() {
    let yaml = concat!("mutual: true\n", "confidentiality: true\n");
    let expected = InitiatorFlags::new(true, true, false);
    let actual = serde_yaml::from_str(yaml).unwrap();

    assert_eq!(expected, actual);
    assert_eq!(
        InitiatorFlags::unilateral(),
        serde_yaml::from_str("{}").unwrap()
    );
}
