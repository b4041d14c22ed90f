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

#![allow(clippy::redundant_field_names)]
#![allow(clippy::type_complexity)]
#![allow(clippy::upper_case_acronyms)]

//! Kerberos identity propagation over GSSAPI-negotiated TCP sessions.
//!
//! This package provides a small test server and client for checking
//! that Kerberos credentials work end to end.  A client connects to
//! the server, the two negotiate a security context, and the server
//! returns the client's authenticated name, sealed under that
//! context.  If the name the client unseals matches its own
//! principal, identity propagation works.
//!
//! The pieces are usable in their own right:
//!
//!  - [frame] and [proto] define the wire format: length-prefixed
//!    frames, and the command code that opens each session.
//!
//!  - [cred] defines how local credentials are obtained, through a
//!    [CredentialProvider](cred::CredentialProvider) that asks a
//!    [CredentialHandler](cred::CredentialHandler) for what it needs.
//!
//!  - [mech] abstracts security mechanisms.  Two are provided: a
//!    GSSAPI mechanism (Kerberos 5 through the platform library,
//!    enabled by the `gssapi` feature), and a deterministic
//!    in-process loopback mechanism for tests.  The
//!    [Negotiator](mech::negotiate::Negotiator) drives the token
//!    exchange for either.
//!
//!  - [server], [client], and [control] implement the test tools
//!    themselves.
//!
//! Servers and clients are configurable; each has a configuration
//! object that can be parsed from YAML using `serde_yaml`, with a
//! small set of environment overrides.  See the [config] module.
pub mod client;
pub mod config;
pub mod control;
pub mod cred;
pub mod error;
pub mod frame;
pub mod mech;
pub mod proto;
pub mod server;

#[cfg(test)]
use std::sync::Once;

#[cfg(test)]
use log::LevelFilter;

#[cfg(test)]
static INIT: Once = Once::new();

#[cfg(test)]
fn init() {
    INIT.call_once(|| {
        env_logger::builder()
            .is_test(true)
            .filter_level(LevelFilter::Trace)
            .init()
    })
}
