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

//! Error scoping.
//!
//! Every error type in this crate is classified by an [ErrorScope],
//! which describes how far the damage extends.  The server loop uses
//! this to decide whether a failure ends only the current session or
//! the whole process.
use std::fmt::Display;
use std::fmt::Formatter;
use std::io::Error;
use std::io::ErrorKind;
use std::time::Duration;

/// Pause before accepting again after a
/// [System](ErrorScope::System) error.
pub const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// How far the effects of an error extend.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum ErrorScope {
    /// The error ends the current session only.
    Session,
    /// The error was caused by the remote peer (bad data, wrong
    /// protocol, rejected credentials).  Also session-local.
    External,
    /// A system resource failed (file descriptors, memory, and so
    /// on).  Retrying later may succeed.
    System,
    /// Nothing further can be done in this process.
    Unrecoverable
}

/// Errors that know their [ErrorScope].
pub trait ScopedError {
    /// Get the scope of this error.
    fn scope(&self) -> ErrorScope;

    /// Whether this error is contained to a single session.
    #[inline]
    fn is_session_local(&self) -> bool {
        matches!(self.scope(), ErrorScope::Session | ErrorScope::External)
    }
}

/// Decide how an accept loop continues after an error of `scope`.
///
/// Returns the pause before the next accept, or `None` if the loop
/// must end.
pub fn accept_retry_delay(scope: ErrorScope) -> Option<Duration> {
    match scope {
        ErrorScope::Session | ErrorScope::External => Some(Duration::ZERO),
        ErrorScope::System => Some(ACCEPT_RETRY_DELAY),
        ErrorScope::Unrecoverable => None
    }
}

impl ScopedError for Error {
    fn scope(&self) -> ErrorScope {
        match self.kind() {
            ErrorKind::UnexpectedEof |
            ErrorKind::ConnectionReset |
            ErrorKind::ConnectionAborted |
            ErrorKind::ConnectionRefused |
            ErrorKind::BrokenPipe |
            ErrorKind::NotConnected |
            ErrorKind::TimedOut |
            ErrorKind::WouldBlock |
            ErrorKind::Interrupted => ErrorScope::Session,
            ErrorKind::InvalidData | ErrorKind::InvalidInput => {
                ErrorScope::External
            }
            ErrorKind::AddrInUse |
            ErrorKind::AddrNotAvailable |
            ErrorKind::PermissionDenied => ErrorScope::Unrecoverable,
            _ => ErrorScope::System
        }
    }
}

impl Display for ErrorScope {
    fn fmt(
        &self,
        f: &mut Formatter
    ) -> Result<(), std::fmt::Error> {
        match self {
            ErrorScope::Session => write!(f, "session"),
            ErrorScope::External => write!(f, "external"),
            ErrorScope::System => write!(f, "system"),
            ErrorScope::Unrecoverable => write!(f, "unrecoverable")
        }
    }
}

#[test]
fn test_io_error_scopes() {
    let eof = Error::new(ErrorKind::UnexpectedEof, "eof");
    let timeout = Error::new(ErrorKind::TimedOut, "timeout");
    let inuse = Error::new(ErrorKind::AddrInUse, "in use");
    let other = Error::new(ErrorKind::Other, "other");

    assert_eq!(ErrorScope::Session, eof.scope());
    assert!(eof.is_session_local());
    assert_eq!(ErrorScope::Session, timeout.scope());
    assert_eq!(ErrorScope::Unrecoverable, inuse.scope());
    assert!(!inuse.is_session_local());
    assert_eq!(ErrorScope::System, other.scope());
}

#[test]
fn test_accept_retry_delay() {
    let emfile = Error::from_raw_os_error(24);
    let reset = Error::new(ErrorKind::ConnectionAborted, "aborted");
    let denied = Error::new(ErrorKind::PermissionDenied, "denied");

    assert_eq!(ErrorScope::System, emfile.scope());
    assert_eq!(Some(ACCEPT_RETRY_DELAY), accept_retry_delay(emfile.scope()));
    assert_eq!(Some(Duration::ZERO), accept_retry_delay(reset.scope()));
    assert_eq!(
        Some(Duration::ZERO),
        accept_retry_delay(ErrorScope::External)
    );
    assert_eq!(None, accept_retry_delay(denied.scope()));
}
