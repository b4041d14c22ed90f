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

//! Credentials and login.
//!
//! Before a session can be negotiated, each side needs a local
//! credential to negotiate with.  Obtaining it is the job of a
//! [CredentialProvider], which stands in for the platform's login
//! subsystem (a Kerberos ticket cache or keytab, or a test realm).
//!
//! Providers ask for the information they need one
//! [CredentialField] at a time, and a [CredentialHandler] answers.
//! A handler that has no answer for a field returns
//! [LoginError::UnsupportedField]; providers that can fall back to a
//! default (such as the default principal in a ticket cache) treat
//! that as "not supplied".
//!
//! Logins are scoped: a [Login] holds the credential for as long as
//! it lives and resets the provider when dropped.
use std::fmt::Debug;
use std::fmt::Display;
use std::fmt::Formatter;

use log::debug;
use log::info;
use serde::Deserialize;
use serde::Serialize;

use crate::error::ErrorScope;
use crate::error::ScopedError;

/// Pieces of information a [CredentialProvider] can ask for.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum CredentialField {
    /// The principal name.
    Name,
    /// The principal's secret (password).
    Secret
}

/// Answers to a [CredentialField] request.
#[derive(Clone, Eq, PartialEq)]
pub enum CredentialValue {
    /// The principal name.
    Name(String),
    /// The principal's secret.
    Secret(Vec<u8>)
}

/// What a credential will be used for.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum CredUsage {
    /// Initiating contexts (clients).
    Initiate,
    /// Accepting contexts (servers).
    Accept
}

/// Errors that can occur while logging in.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum LoginError {
    /// The handler cannot supply a required field.
    UnsupportedField {
        /// The field that was requested.
        field: CredentialField
    },
    /// The handler answered a request with the wrong kind of value.
    WrongField {
        /// The field that was requested.
        field: CredentialField
    },
    /// The principal is not known to the realm.
    UnknownPrincipal {
        /// The principal name.
        principal: String
    },
    /// The secret did not match.
    BadSecret {
        /// The principal name.
        principal: String
    },
    /// The mechanism failed to acquire credentials.
    Mechanism {
        /// Name of the mechanism.
        mech: &'static str,
        /// Description of the failure.
        msg: String
    }
}

/// Source of answers to [CredentialField] requests.
pub trait CredentialHandler {
    /// Supply the value of `field`.
    fn handle(
        &self,
        field: CredentialField
    ) -> Result<CredentialValue, LoginError>;

    /// Get the principal name, or `None` if this handler doesn't
    /// supply one.
    fn name(&self) -> Result<Option<String>, LoginError> {
        match self.handle(CredentialField::Name) {
            Ok(CredentialValue::Name(name)) => Ok(Some(name)),
            Ok(CredentialValue::Secret(_)) => Err(LoginError::WrongField {
                field: CredentialField::Name
            }),
            Err(LoginError::UnsupportedField { .. }) => Ok(None),
            Err(err) => Err(err)
        }
    }

    /// Get the secret, or `None` if this handler doesn't supply one.
    fn secret(&self) -> Result<Option<Vec<u8>>, LoginError> {
        match self.handle(CredentialField::Secret) {
            Ok(CredentialValue::Secret(secret)) => Ok(Some(secret)),
            Ok(CredentialValue::Name(_)) => Err(LoginError::WrongField {
                field: CredentialField::Secret
            }),
            Err(LoginError::UnsupportedField { .. }) => Ok(None),
            Err(err) => Err(err)
        }
    }
}

/// A provider of local credentials.
///
/// This is an explicit value, passed to whoever needs it, in place of
/// any process-wide login configuration.
pub trait CredentialProvider {
    /// Credentials produced by a successful login.
    type Credential: Clone;

    /// Log in, asking `handler` for whatever is needed.
    fn login<H>(
        &mut self,
        handler: &H,
        usage: CredUsage
    ) -> Result<Self::Credential, LoginError>
    where
        H: CredentialHandler + ?Sized;

    /// Discard any state left over from previous logins.
    fn reset(&mut self);
}

/// [CredentialHandler] holding a fixed principal and secret.
///
/// Either part may be absent, in which case requests for it are
/// refused with [LoginError::UnsupportedField].
#[derive(Clone, Default)]
pub struct PasswordHandler {
    name: Option<String>,
    secret: Option<Vec<u8>>
}

/// [CredentialHandler] that supplies nothing.
///
/// Providers that can fall back to default credentials will do so.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoCredentials;

/// A scoped login.
///
/// The provider is reset when this is dropped.
pub struct Login<'a, P: CredentialProvider> {
    provider: &'a mut P,
    credential: P::Credential
}

impl Debug for CredentialValue {
    fn fmt(
        &self,
        f: &mut Formatter
    ) -> Result<(), std::fmt::Error> {
        match self {
            CredentialValue::Name(name) => {
                f.debug_tuple("Name").field(name).finish()
            }
            CredentialValue::Secret(_) => {
                f.debug_tuple("Secret").field(&"<redacted>").finish()
            }
        }
    }
}

impl Debug for PasswordHandler {
    fn fmt(
        &self,
        f: &mut Formatter
    ) -> Result<(), std::fmt::Error> {
        f.debug_struct("PasswordHandler")
            .field("name", &self.name)
            .field("secret", &self.secret.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl PasswordHandler {
    /// Create a handler from its parts.
    #[inline]
    pub fn new(
        name: Option<String>,
        secret: Option<Vec<u8>>
    ) -> Self {
        PasswordHandler {
            name: name,
            secret: secret
        }
    }

    /// Create a handler with both a principal and a password.
    #[inline]
    pub fn with_password(
        name: &str,
        password: &str
    ) -> Self {
        PasswordHandler {
            name: Some(String::from(name)),
            secret: Some(password.as_bytes().to_vec())
        }
    }
}

impl CredentialHandler for PasswordHandler {
    fn handle(
        &self,
        field: CredentialField
    ) -> Result<CredentialValue, LoginError> {
        match field {
            CredentialField::Name => match &self.name {
                Some(name) => Ok(CredentialValue::Name(name.clone())),
                None => Err(LoginError::UnsupportedField { field: field })
            },
            CredentialField::Secret => match &self.secret {
                Some(secret) => Ok(CredentialValue::Secret(secret.clone())),
                None => Err(LoginError::UnsupportedField { field: field })
            }
        }
    }
}

impl CredentialHandler for NoCredentials {
    #[inline]
    fn handle(
        &self,
        field: CredentialField
    ) -> Result<CredentialValue, LoginError> {
        Err(LoginError::UnsupportedField { field: field })
    }
}

impl<'a, P> Login<'a, P>
where
    P: CredentialProvider
{
    /// Log in using `provider`.
    ///
    /// If the login fails, the provider is reset before returning.
    pub fn new<H>(
        provider: &'a mut P,
        handler: &H,
        usage: CredUsage
    ) -> Result<Self, LoginError>
    where
        H: CredentialHandler + ?Sized {
        match provider.login(handler, usage) {
            Ok(credential) => {
                info!(target: "gss-cred",
                      "login succeeded");

                Ok(Login {
                    provider: provider,
                    credential: credential
                })
            }
            Err(err) => {
                provider.reset();

                Err(err)
            }
        }
    }

    /// Get the credential obtained by this login.
    #[inline]
    pub fn credential(&self) -> &P::Credential {
        &self.credential
    }
}

impl<'a, P> Drop for Login<'a, P>
where
    P: CredentialProvider
{
    fn drop(&mut self) {
        debug!(target: "gss-cred",
               "logging out");

        self.provider.reset();
    }
}

impl ScopedError for LoginError {
    #[inline]
    fn scope(&self) -> ErrorScope {
        ErrorScope::Unrecoverable
    }
}

impl Display for CredentialField {
    fn fmt(
        &self,
        f: &mut Formatter
    ) -> Result<(), std::fmt::Error> {
        match self {
            CredentialField::Name => write!(f, "name"),
            CredentialField::Secret => write!(f, "secret")
        }
    }
}

impl Display for CredUsage {
    fn fmt(
        &self,
        f: &mut Formatter
    ) -> Result<(), std::fmt::Error> {
        match self {
            CredUsage::Initiate => write!(f, "initiate"),
            CredUsage::Accept => write!(f, "accept")
        }
    }
}

impl Display for LoginError {
    fn fmt(
        &self,
        f: &mut Formatter
    ) -> Result<(), std::fmt::Error> {
        match self {
            LoginError::UnsupportedField { field } => {
                write!(f, "credential {} not available", field)
            }
            LoginError::WrongField { field } => {
                write!(f, "wrong kind of value supplied for {}", field)
            }
            LoginError::UnknownPrincipal { principal } => {
                write!(f, "unknown principal {}", principal)
            }
            LoginError::BadSecret { principal } => {
                write!(f, "bad secret for principal {}", principal)
            }
            LoginError::Mechanism { mech, msg } => {
                write!(f, "{} login failed: {}", mech, msg)
            }
        }
    }
}

#[cfg(test)]
use std::cell::Cell;

#[cfg(test)]
struct CountingProvider {
    logins: usize,
    resets: Cell<usize>
}

#[cfg(test)]
impl CredentialProvider for CountingProvider {
    type Credential = String;

    fn login<H>(
        &mut self,
        handler: &H,
        _usage: CredUsage
    ) -> Result<String, LoginError>
    where
        H: CredentialHandler + ?Sized {
        self.logins += 1;

        handler.name()?.ok_or(LoginError::UnsupportedField {
            field: CredentialField::Name
        })
    }

    fn reset(&mut self) {
        self.resets.set(self.resets.get() + 1)
    }
}

#[test]
fn test_password_handler_dispatch() {
    let handler = PasswordHandler::with_password("hnelson", "secret");

    assert_eq!(
        Ok(CredentialValue::Name(String::from("hnelson"))),
        handler.handle(CredentialField::Name)
    );
    assert_eq!(
        Ok(CredentialValue::Secret(b"secret".to_vec())),
        handler.handle(CredentialField::Secret)
    );
    assert_eq!(Ok(Some(String::from("hnelson"))), handler.name());
}

#[test]
fn test_partial_and_empty_handlers() {
    let handler = PasswordHandler::new(Some(String::from("jduke")), None);

    assert_eq!(Ok(None), handler.secret());
    assert_eq!(
        Err(LoginError::UnsupportedField {
            field: CredentialField::Secret
        }),
        handler.handle(CredentialField::Secret)
    );
    assert_eq!(Ok(None), NoCredentials.name());
    assert_eq!(Ok(None), NoCredentials.secret());
}

#[test]
fn test_secret_not_in_debug() {
    let handler = PasswordHandler::with_password("hnelson", "hunter2");
    let out = format!("{:?}", handler);

    assert!(out.contains("hnelson"));
    assert!(!out.contains("hunter2"));
}

#[test]
fn test_login_scope_resets() {
    let mut provider = CountingProvider {
        logins: 0,
        resets: Cell::new(0)
    };

    {
        let login = Login::new(
            &mut provider,
            &PasswordHandler::new(Some(String::from("jduke")), None),
            CredUsage::Initiate
        )
        .expect("expected success");

        assert_eq!("jduke", login.credential().as_str());
    }

    assert_eq!(1, provider.logins);
    assert_eq!(1, provider.resets.get());

    let err = Login::new(&mut provider, &NoCredentials, CredUsage::Accept)
        .err()
        .expect("expected failure");

    assert_eq!(
        LoginError::UnsupportedField {
            field: CredentialField::Name
        },
        err
    );
    assert_eq!(2, provider.resets.get());
}
