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

//! Kerberos 5 through the platform GSSAPI library.
//!
//! This mechanism wraps `libgssapi` contexts.  Keys never pass through
//! this crate: initiators take their tickets from the platform
//! credential cache and acceptors take their keys from the platform
//! keytab.  Logging in with this mechanism therefore only selects
//! *which* principal's credentials are used (the default principal if
//! none is named), and checks that they can be acquired.
//!
//! Only the Kerberos 5 mechanism is requested.  Note that many
//! installations use encryption that is far too weak by modern
//! standards to establish meaningful security.
//!
//! # Name Forms
//!
//! Principal names (`user@REALM`, `service/host@REALM`) are imported
//! as Kerberos principal names.  Target names of the form
//! `service@host`, where the host part has no upper-case letters, are
//! imported as host-based service names.  All names are canonicalized
//! for Kerberos 5.
use std::fmt::Display;
use std::fmt::Formatter;
use std::time::Duration;

use libgssapi::context::ClientCtx;
use libgssapi::context::CtxFlags;
use libgssapi::context::SecurityContext as GSSContext;
use libgssapi::context::ServerCtx;
use libgssapi::credential::Cred;
use libgssapi::credential::CredUsage as GSSCredUsage;
use libgssapi::name::Name;
use libgssapi::oid::OidSet;
use libgssapi::oid::GSS_KRB5_NT_PRINCIPAL_NAME;
use libgssapi::oid::GSS_MECH_KRB5;
use libgssapi::oid::GSS_NT_HOSTBASED_SERVICE;
use log::debug;
use log::info;
use log::trace;

use crate::cred::CredUsage;
use crate::cred::CredentialHandler;
use crate::cred::CredentialProvider;
use crate::cred::LoginError;
use crate::error::ErrorScope;
use crate::error::ScopedError;
use crate::mech::InitiatorFlags;
use crate::mech::Mechanism;
use crate::mech::SecurityContext;

/// GSSAPI Kerberos 5 mechanism.
#[derive(Clone, Debug, Default)]
pub struct GSSAPIMechanism {
    time_req: Option<Duration>
}

/// Descriptor of GSSAPI credentials.
///
/// Platform credentials are acquired from this for each context.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct GSSAPICredential {
    principal: Option<String>,
    usage: CredUsage,
    time_req: Option<Duration>
}

/// Login provider for [GSSAPIMechanism].
#[derive(Debug)]
pub struct GSSAPICredentialProvider {
    time_req: Option<Duration>,
    current: Option<GSSAPICredential>
}

/// One side of a GSSAPI context.
pub enum GSSAPIContext {
    /// Initiating side.
    Client {
        /// The context, until disposed.
        ctx: Option<ClientCtx>
    },
    /// Accepting side.
    Server {
        /// The context, until disposed.
        ctx: Option<ServerCtx>
    }
}

/// Errors from the GSSAPI mechanism.
#[derive(Debug)]
pub enum GSSAPIError {
    /// GSSAPI error.
    GSSAPI {
        /// GSSAPI error.
        error: libgssapi::error::Error
    },
    /// The context has been disposed.
    Disposed
}

#[derive(Clone, Copy)]
enum NameKind {
    Principal,
    Target
}

fn name_type(
    name: &str,
    kind: NameKind
) -> &'static libgssapi::oid::Oid {
    match (kind, name.split_once('@')) {
        (NameKind::Target, Some((service, host)))
            if !service.contains('/') &&
                !host.chars().any(|c| c.is_ascii_uppercase()) =>
        {
            &GSS_NT_HOSTBASED_SERVICE
        }
        _ => &GSS_KRB5_NT_PRINCIPAL_NAME
    }
}

/// Import and canonicalize `name` for Kerberos 5.
fn import_name(
    name: &str,
    kind: NameKind
) -> Result<Name, libgssapi::error::Error> {
    let name = Name::new(name.as_bytes(), Some(name_type(name, kind)))?;

    name.canonicalize(Some(&GSS_MECH_KRB5))
}

impl GSSAPIMechanism {
    /// Create a mechanism requesting credentials valid for `time_req`.
    #[inline]
    pub fn new(time_req: Option<Duration>) -> Self {
        GSSAPIMechanism { time_req: time_req }
    }
}

impl GSSAPICredential {
    /// Get the principal, or `None` for the default principal.
    #[inline]
    pub fn principal(&self) -> Option<&str> {
        self.principal.as_deref()
    }

    /// Get the intended usage.
    #[inline]
    pub fn usage(&self) -> CredUsage {
        self.usage
    }

    /// Acquire platform credentials.
    fn acquire(&self) -> Result<Cred, libgssapi::error::Error> {
        let mut mechs = OidSet::new()?;

        mechs.add(&GSS_MECH_KRB5)?;

        let usage = match self.usage {
            CredUsage::Initiate => GSSCredUsage::Initiate,
            CredUsage::Accept => GSSCredUsage::Accept
        };

        match &self.principal {
            // A principal name was provided.
            Some(principal) => {
                let name = import_name(principal, NameKind::Principal)?;

                Cred::acquire(Some(&name), self.time_req, usage, Some(&mechs))
            }
            // No principal name was provided.
            None => Cred::acquire(None, self.time_req, usage, Some(&mechs))
        }
    }
}

impl GSSAPICredentialProvider {
    /// Get the credential from the current login, if any.
    #[inline]
    pub fn current(&self) -> Option<&GSSAPICredential> {
        self.current.as_ref()
    }
}

impl CredentialProvider for GSSAPICredentialProvider {
    type Credential = GSSAPICredential;

    fn login<H>(
        &mut self,
        handler: &H,
        usage: CredUsage
    ) -> Result<GSSAPICredential, LoginError>
    where
        H: CredentialHandler + ?Sized {
        let cred = GSSAPICredential {
            principal: handler.name()?,
            usage: usage,
            time_req: self.time_req
        };

        // Check now that the platform has credentials for this
        // principal, so that failures surface at login.
        cred.acquire().map_err(|err| LoginError::Mechanism {
            mech: GSSAPIMechanism::NAME,
            msg: err.to_string()
        })?;

        info!(target: "gssapi-mech",
              "acquired {} credentials for {}",
              usage,
              cred.principal().unwrap_or("default principal"));

        self.current = Some(cred.clone());

        Ok(cred)
    }

    #[inline]
    fn reset(&mut self) {
        self.current = None;
    }
}

impl SecurityContext for GSSAPIContext {
    type Error = GSSAPIError;

    fn step(
        &mut self,
        token: &[u8]
    ) -> Result<Option<Vec<u8>>, GSSAPIError> {
        let out = match self {
            GSSAPIContext::Client { ctx: Some(ctx) } => {
                let token = if token.is_empty() { None } else { Some(token) };

                ctx.step(token, None)
            }
            GSSAPIContext::Server { ctx: Some(ctx) } => ctx.step(token),
            _ => return Err(GSSAPIError::Disposed)
        }
        .map_err(|err| GSSAPIError::GSSAPI { error: err })?;

        trace!(target: "gssapi-mech",
               "step produced {} token",
               if out.is_some() { "a" } else { "no" });

        Ok(out.map(|buf| buf.to_vec()))
    }

    fn is_established(&self) -> bool {
        match self {
            GSSAPIContext::Client { ctx: Some(ctx) } => ctx.is_complete(),
            GSSAPIContext::Server { ctx: Some(ctx) } => ctx.is_complete(),
            _ => false
        }
    }

    fn wrap(
        &mut self,
        encrypt: bool,
        msg: &[u8]
    ) -> Result<Vec<u8>, GSSAPIError> {
        let res = match self {
            GSSAPIContext::Client { ctx: Some(ctx) } => ctx.wrap(encrypt, msg),
            GSSAPIContext::Server { ctx: Some(ctx) } => ctx.wrap(encrypt, msg),
            _ => return Err(GSSAPIError::Disposed)
        };

        res.map(|buf| buf.to_vec())
            .map_err(|err| GSSAPIError::GSSAPI { error: err })
    }

    fn unwrap(
        &mut self,
        msg: &[u8]
    ) -> Result<Vec<u8>, GSSAPIError> {
        let res = match self {
            GSSAPIContext::Client { ctx: Some(ctx) } => ctx.unwrap(msg),
            GSSAPIContext::Server { ctx: Some(ctx) } => ctx.unwrap(msg),
            _ => return Err(GSSAPIError::Disposed)
        };

        res.map(|buf| buf.to_vec())
            .map_err(|err| GSSAPIError::GSSAPI { error: err })
    }

    fn source_name(&mut self) -> Result<String, GSSAPIError> {
        let res = match self {
            GSSAPIContext::Client { ctx: Some(ctx) } => ctx.source_name(),
            GSSAPIContext::Server { ctx: Some(ctx) } => ctx.source_name(),
            _ => return Err(GSSAPIError::Disposed)
        };

        res.map(|name| name.to_string())
            .map_err(|err| GSSAPIError::GSSAPI { error: err })
    }

    fn target_name(&mut self) -> Result<String, GSSAPIError> {
        let res = match self {
            GSSAPIContext::Client { ctx: Some(ctx) } => ctx.target_name(),
            GSSAPIContext::Server { ctx: Some(ctx) } => ctx.target_name(),
            _ => return Err(GSSAPIError::Disposed)
        };

        res.map(|name| name.to_string())
            .map_err(|err| GSSAPIError::GSSAPI { error: err })
    }

    fn dispose(&mut self) -> Result<(), GSSAPIError> {
        // Dropping the library context deletes it.
        match self {
            GSSAPIContext::Client { ctx } => {
                ctx.take();
            }
            GSSAPIContext::Server { ctx } => {
                ctx.take();
            }
        }

        Ok(())
    }
}

impl Mechanism for GSSAPIMechanism {
    type Context = GSSAPIContext;
    type CreateError = GSSAPIError;
    type Credential = GSSAPICredential;
    type Provider = GSSAPICredentialProvider;

    const NAME: &'static str = "gssapi";

    fn initiator(
        &self,
        target: &str,
        cred: Option<&GSSAPICredential>,
        flags: InitiatorFlags
    ) -> Result<GSSAPIContext, GSSAPIError> {
        let default = GSSAPICredential {
            principal: None,
            usage: CredUsage::Initiate,
            time_req: self.time_req
        };
        let cred = cred
            .unwrap_or(&default)
            .acquire()
            .map_err(|err| GSSAPIError::GSSAPI { error: err })?;
        let service = import_name(target, NameKind::Target)
            .map_err(|err| GSSAPIError::GSSAPI { error: err })?;
        let mut ctxflags = CtxFlags::empty();

        if flags.is_mutual() {
            ctxflags |= CtxFlags::GSS_C_MUTUAL_FLAG;
        }

        if flags.is_confidential() {
            ctxflags |= CtxFlags::GSS_C_CONF_FLAG;
        }

        if flags.is_integrity() {
            ctxflags |= CtxFlags::GSS_C_INTEG_FLAG;
        }

        debug!(target: "gssapi-mech",
               "creating initiator context for {}",
               target);

        Ok(GSSAPIContext::Client {
            ctx: Some(ClientCtx::new(
                Some(cred),
                service,
                ctxflags,
                Some(&GSS_MECH_KRB5)
            ))
        })
    }

    fn acceptor(
        &self,
        cred: Option<&GSSAPICredential>
    ) -> Result<GSSAPIContext, GSSAPIError> {
        let default = GSSAPICredential {
            principal: None,
            usage: CredUsage::Accept,
            time_req: self.time_req
        };
        let cred = cred
            .unwrap_or(&default)
            .acquire()
            .map_err(|err| GSSAPIError::GSSAPI { error: err })?;

        debug!(target: "gssapi-mech",
               "creating acceptor context");

        Ok(GSSAPIContext::Server {
            ctx: Some(ServerCtx::new(cred))
        })
    }

    fn credential_provider(&self) -> GSSAPICredentialProvider {
        GSSAPICredentialProvider {
            time_req: self.time_req,
            current: None
        }
    }
}

impl ScopedError for GSSAPIError {
    fn scope(&self) -> ErrorScope {
        match self {
            // Most GSSAPI failures come from bad or unexpected tokens.
            GSSAPIError::GSSAPI { .. } => ErrorScope::External,
            GSSAPIError::Disposed => ErrorScope::Session
        }
    }
}

impl Display for GSSAPIError {
    fn fmt(
        &self,
        f: &mut Formatter
    ) -> Result<(), std::fmt::Error> {
        match self {
            GSSAPIError::GSSAPI { error } => error.fmt(f),
            GSSAPIError::Disposed => write!(f, "context has been disposed")
        }
    }
}

#[test]
fn test_name_types() {
    let principal: &libgssapi::oid::Oid = &GSS_KRB5_NT_PRINCIPAL_NAME;
    let hostbased: &libgssapi::oid::Oid = &GSS_NT_HOSTBASED_SERVICE;

    assert!(std::ptr::eq(
        principal,
        name_type("gsstestserver/xxx@JBOSS.ORG", NameKind::Target)
    ));
    assert!(std::ptr::eq(
        principal,
        name_type("hnelson@KERBEROS.EXAMPLE", NameKind::Target)
    ));
    assert!(std::ptr::eq(
        hostbased,
        name_type("HTTP@localhost", NameKind::Target)
    ));
    assert!(std::ptr::eq(
        principal,
        name_type("HTTP@localhost", NameKind::Principal)
    ));
    assert!(std::ptr::eq(principal, name_type("hnelson", NameKind::Target)));
}
