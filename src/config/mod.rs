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

//! Configuration structures.
//!
//! This module contains definitions of types that supply
//! configuration information for the server and client.  Each of
//! these types has a YAML format, which can be parsed using
//! `serde_yaml`, thus allowing configurations to be easily loaded
//! from text files.  Every field has a default, so an empty document
//! is a valid configuration.
//!
//! Configurations are read once, at process start.  After a file (if
//! any) is parsed, a small set of environment variables can override
//! the most commonly changed settings:
//!
//! - `GSSTESTSERVER_PORT`: the server port (server and client)
//! - `GSSTESTSERVER_PRINCIPAL`: the server principal (server), or the
//!   target service principal (client)
//! - `GSSTESTSERVER_PASSWORD`: the server password (server only)
//! - `GSSTESTCLIENT_HOST`: the server host (client only)
//! - `GSSTESTCLIENT_PRINCIPAL`: the client principal (client only)
//! - `GSSTESTCLIENT_PASSWORD`: the client password (client only)
use std::convert::TryFrom;
use std::fmt::Debug;
use std::fmt::Display;
use std::fmt::Formatter;
use std::fs::File;
use std::net::IpAddr;
use std::net::Ipv4Addr;
use std::net::SocketAddr;
use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;

use log::debug;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde::Serialize;

use crate::error::ErrorScope;
use crate::error::ScopedError;
use crate::mech::loopback::DEFAULT_LEGS;
use crate::mech::loopback::DEFAULT_REALM;
use crate::mech::negotiate::DEFAULT_MAX_FRAME_LEN;
use crate::mech::InitiatorFlags;
use crate::proto::CommandEncoding;

/// Default primary server port.
pub const DEFAULT_PORT: u16 = 10961;
/// Default remote control port.
pub const DEFAULT_CONTROL_PORT: u16 = 10959;
/// Default server principal.
pub const DEFAULT_PRINCIPAL: &str = "gsstestserver/xxx@JBOSS.ORG";
/// Default server password.
pub const DEFAULT_PASSWORD: &str = "gsstestpwd";

const ENV_SERVER_PORT: &str = "GSSTESTSERVER_PORT";
const ENV_SERVER_PRINCIPAL: &str = "GSSTESTSERVER_PRINCIPAL";
const ENV_SERVER_PASSWORD: &str = "GSSTESTSERVER_PASSWORD";
const ENV_CLIENT_HOST: &str = "GSSTESTCLIENT_HOST";
const ENV_CLIENT_PRINCIPAL: &str = "GSSTESTCLIENT_PRINCIPAL";
const ENV_CLIENT_PASSWORD: &str = "GSSTESTCLIENT_PASSWORD";

/// How the server is told to stop.
///
/// # YAML Format
///
/// The YAML format is one of the strings `remote-control` or
/// `command`.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum StopPolicy {
    /// The stop keyword on the remote control port stops the server.
    /// `STOP` commands on the primary port are ignored.
    RemoteControl,
    /// A `STOP` command on the primary port stops the server.
    Command
}

/// How the server services connections.
///
/// # YAML Format
///
/// The YAML format is one of the strings `sequential` or `threaded`.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Concurrency {
    /// Each connection is served fully before the next is accepted.
    Sequential,
    /// Each connection is served on its own thread.
    Threaded
}

/// Which flags the client requests.
///
/// # YAML Format
///
/// The YAML format is one of the strings `mutual` or `unilateral`.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ClientVariant {
    /// Request mutual authentication, confidentiality, and integrity.
    Mutual,
    /// Request none of them.
    Unilateral
}

/// Configuration for the GSSAPI mechanism.
///
/// # YAML Format
///
/// The YAML format has one optional field:
///
/// - `time-req`: Requested credential lifetime in milliseconds.
#[derive(Clone, Debug, Default, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct GSSAPIConfig {
    #[serde(default)]
    time_req: Option<u64>
}

/// Configuration for the loopback mechanism.
///
/// # YAML Format
///
/// The YAML format has two optional fields:
///
/// - `realm`: Realm for unqualified names (default `KERBEROS.EXAMPLE`).
///
/// - `legs`: Number of token legs in a handshake (default 2).
#[derive(Clone, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct LoopbackConfig {
    #[serde(default = "LoopbackConfig::default_realm")]
    realm: String,
    #[serde(default = "LoopbackConfig::default_legs")]
    legs: usize
}

/// Choice of security mechanism.
///
/// # YAML Format
///
/// The YAML format is either a bare mechanism name (`gssapi` or
/// `loopback`), which selects the mechanism with its defaults, or a
/// map with one key naming the mechanism, whose value is its
/// configuration.
///
/// ## Examples
///
/// ```yaml
/// gssapi
/// ```
///
/// ```yaml
/// loopback:
///   realm: JBOSS.ORG
///   legs: 3
/// ```
#[derive(Clone, Debug, Deserialize, Eq, Hash, PartialEq)]
#[serde(try_from = "MechanismIntermediate")]
pub enum MechanismConfig {
    /// Kerberos 5 through the platform GSSAPI library.
    GSSAPI {
        /// GSSAPI configuration.
        gssapi: GSSAPIConfig
    },
    /// The in-process loopback mechanism.
    Loopback {
        /// Loopback configuration.
        loopback: LoopbackConfig
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum MechanismIntermediate {
    Name(String),
    #[serde(rename_all = "kebab-case")]
    GSSAPI { gssapi: GSSAPIConfig },
    #[serde(rename_all = "kebab-case")]
    Loopback { loopback: LoopbackConfig }
}

/// Remote control channel configuration.
///
/// # YAML Format
///
/// The YAML format has three optional fields:
///
/// - `addr`: Address at which to listen (default `0.0.0.0`).
///
/// - `port`: Port on which to listen (default 10959).
///
/// - `read-timeout`: Read timeout in milliseconds (default 2000).
#[derive(Clone, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct ControlConfig {
    #[serde(default = "ControlConfig::default_addr")]
    addr: IpAddr,
    #[serde(default = "ControlConfig::default_port")]
    port: u16,
    #[serde(default = "ControlConfig::default_read_timeout")]
    read_timeout: u64
}

/// Server configuration.
///
/// # YAML Format
///
/// The YAML format has the following fields, all optional:
///
/// - `addr`: Address at which to listen (default `0.0.0.0`).
///
/// - `port`: Port on which to listen (default 10961).
///
/// - `principal`: The server's principal (default
///   `gsstestserver/xxx@JBOSS.ORG`).
///
/// - `secret`: The server's password (default `gsstestpwd`).
///
/// - `read-timeout`: Per-session read timeout in milliseconds (default
///   30000).
///
/// - `max-frame-len`: Largest frame accepted from a client (default 16
///   MiB).
///
/// - `stop-policy`: A [StopPolicy] (default `remote-control`).
///
/// - `concurrency`: A [Concurrency] (default `sequential`).
///
/// - `strict-commands`: Treat commands other than `NAME` (and `STOP`
///   under the `command` policy) as session errors (default `false`).
///
/// - `command-encoding`: A [CommandEncoding] (default `framed`).
///
/// - `mechanism`: A [MechanismConfig] (default `gssapi`).
///
/// - `control`: A [ControlConfig].
///
/// ## Examples
///
/// ```yaml
/// port: 10961
/// principal: gsstestserver/xxx@JBOSS.ORG
/// secret: gsstestpwd
/// concurrency: threaded
/// mechanism:
///   loopback:
///     legs: 2
/// control:
///   port: 10959
/// ```
#[derive(Clone, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct ServerConfig {
    #[serde(default = "ServerConfig::default_addr")]
    addr: IpAddr,
    #[serde(default = "ServerConfig::default_port")]
    port: u16,
    #[serde(default = "ServerConfig::default_principal")]
    principal: String,
    #[serde(default = "ServerConfig::default_secret")]
    secret: String,
    #[serde(default = "ServerConfig::default_read_timeout")]
    read_timeout: u64,
    #[serde(default = "ServerConfig::default_max_frame_len")]
    max_frame_len: usize,
    #[serde(default = "ServerConfig::default_stop_policy")]
    stop_policy: StopPolicy,
    #[serde(default = "ServerConfig::default_concurrency")]
    concurrency: Concurrency,
    #[serde(default)]
    strict_commands: bool,
    #[serde(default)]
    command_encoding: CommandEncoding,
    #[serde(default)]
    mechanism: MechanismConfig,
    #[serde(default)]
    control: ControlConfig
}

/// Client configuration.
///
/// # YAML Format
///
/// The YAML format has the following fields, all optional:
///
/// - `host`: Server host name or address (default `localhost`).
///
/// - `port`: Server port (default 10961).
///
/// - `service`: Target service principal (default
///   `gsstestserver/xxx@JBOSS.ORG`).
///
/// - `principal`: The client's principal.  If absent, the default
///   credentials are used.
///
/// - `secret`: The client's password.
///
/// - `variant`: A [ClientVariant] (default `mutual`).
///
/// - `connect-timeout`: Connect timeout in milliseconds (default 30000).
///
/// - `read-timeout`: Read timeout in milliseconds (default 30000).
///
/// - `command-encoding`: A [CommandEncoding] (default `framed`).
///
/// - `mechanism`: A [MechanismConfig] (default `gssapi`).
#[derive(Clone, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct ClientConfig {
    #[serde(default = "ClientConfig::default_host")]
    host: String,
    #[serde(default = "ClientConfig::default_port")]
    port: u16,
    #[serde(default = "ClientConfig::default_service")]
    service: String,
    #[serde(default)]
    principal: Option<String>,
    #[serde(default)]
    secret: Option<String>,
    #[serde(default = "ClientConfig::default_variant")]
    variant: ClientVariant,
    #[serde(default = "ClientConfig::default_connect_timeout")]
    connect_timeout: u64,
    #[serde(default = "ClientConfig::default_read_timeout")]
    read_timeout: u64,
    #[serde(default)]
    command_encoding: CommandEncoding,
    #[serde(default)]
    mechanism: MechanismConfig
}

/// Errors that can occur loading configuration.
#[derive(Debug)]
pub enum ConfigError {
    /// The configuration file could not be opened.
    IO {
        /// Path to the file.
        path: PathBuf,
        /// IO error.
        error: std::io::Error
    },
    /// The configuration could not be parsed.
    Parse {
        /// YAML error.
        error: serde_yaml::Error
    },
    /// An environment variable held a malformed value.
    BadEnv {
        /// Name of the variable.
        name: &'static str,
        /// Its value.
        value: String
    },
    /// Unknown mechanism name.
    BadMechanism {
        /// The name given.
        name: String
    }
}

fn parse_port(
    name: &'static str,
    value: String
) -> Result<u16, ConfigError> {
    match value.trim().parse() {
        Ok(port) => Ok(port),
        Err(_) => Err(ConfigError::BadEnv {
            name: name,
            value: value
        })
    }
}

fn nonempty(
    name: &'static str,
    value: String
) -> Result<String, ConfigError> {
    if value.is_empty() {
        Err(ConfigError::BadEnv {
            name: name,
            value: value
        })
    } else {
        Ok(value)
    }
}

fn load_yaml<T>(path: Option<&Path>) -> Result<Option<T>, ConfigError>
where
    T: DeserializeOwned {
    match path {
        Some(path) => {
            debug!(target: "gss-config",
                   "loading configuration from {}",
                   path.display());

            let file = File::open(path).map_err(|err| ConfigError::IO {
                path: path.to_path_buf(),
                error: err
            })?;

            serde_yaml::from_reader(file)
                .map(Some)
                .map_err(|err| ConfigError::Parse { error: err })
        }
        None => Ok(None)
    }
}

impl Default for StopPolicy {
    #[inline]
    fn default() -> Self {
        StopPolicy::RemoteControl
    }
}

impl Default for Concurrency {
    #[inline]
    fn default() -> Self {
        Concurrency::Sequential
    }
}

impl Default for ClientVariant {
    #[inline]
    fn default() -> Self {
        ClientVariant::Mutual
    }
}

impl Default for LoopbackConfig {
    #[inline]
    fn default() -> Self {
        LoopbackConfig {
            realm: LoopbackConfig::default_realm(),
            legs: LoopbackConfig::default_legs()
        }
    }
}

impl Default for MechanismConfig {
    #[inline]
    fn default() -> Self {
        MechanismConfig::GSSAPI {
            gssapi: GSSAPIConfig::default()
        }
    }
}

impl Default for ControlConfig {
    #[inline]
    fn default() -> Self {
        ControlConfig {
            addr: ControlConfig::default_addr(),
            port: ControlConfig::default_port(),
            read_timeout: ControlConfig::default_read_timeout()
        }
    }
}

impl Default for ServerConfig {
    #[inline]
    fn default() -> Self {
        ServerConfig {
            addr: ServerConfig::default_addr(),
            port: ServerConfig::default_port(),
            principal: ServerConfig::default_principal(),
            secret: ServerConfig::default_secret(),
            read_timeout: ServerConfig::default_read_timeout(),
            max_frame_len: ServerConfig::default_max_frame_len(),
            stop_policy: ServerConfig::default_stop_policy(),
            concurrency: ServerConfig::default_concurrency(),
            strict_commands: false,
            command_encoding: CommandEncoding::default(),
            mechanism: MechanismConfig::default(),
            control: ControlConfig::default()
        }
    }
}

impl Default for ClientConfig {
    #[inline]
    fn default() -> Self {
        ClientConfig {
            host: ClientConfig::default_host(),
            port: ClientConfig::default_port(),
            service: ClientConfig::default_service(),
            principal: None,
            secret: None,
            variant: ClientConfig::default_variant(),
            connect_timeout: ClientConfig::default_connect_timeout(),
            read_timeout: ClientConfig::default_read_timeout(),
            command_encoding: CommandEncoding::default(),
            mechanism: MechanismConfig::default()
        }
    }
}

impl TryFrom<MechanismIntermediate> for MechanismConfig {
    type Error = ConfigError;

    fn try_from(
        val: MechanismIntermediate
    ) -> Result<MechanismConfig, ConfigError> {
        match val {
            MechanismIntermediate::Name(name) => match name.as_str() {
                "gssapi" => Ok(MechanismConfig::GSSAPI {
                    gssapi: GSSAPIConfig::default()
                }),
                "loopback" => Ok(MechanismConfig::Loopback {
                    loopback: LoopbackConfig::default()
                }),
                _ => Err(ConfigError::BadMechanism { name: name })
            },
            MechanismIntermediate::GSSAPI { gssapi } => {
                Ok(MechanismConfig::GSSAPI { gssapi: gssapi })
            }
            MechanismIntermediate::Loopback { loopback } => {
                Ok(MechanismConfig::Loopback { loopback: loopback })
            }
        }
    }
}

impl ClientVariant {
    /// Get the [InitiatorFlags] requested by this variant.
    #[inline]
    pub fn flags(&self) -> InitiatorFlags {
        match self {
            ClientVariant::Mutual => InitiatorFlags::mutual(),
            ClientVariant::Unilateral => InitiatorFlags::unilateral()
        }
    }
}

impl GSSAPIConfig {
    /// Create a [GSSAPIConfig] from its components.
    #[inline]
    pub fn new(time_req: Option<Duration>) -> Self {
        GSSAPIConfig {
            time_req: time_req.map(|t| t.as_millis() as u64)
        }
    }

    /// Get the requested credential lifetime.
    #[inline]
    pub fn time_req(&self) -> Option<Duration> {
        self.time_req.map(Duration::from_millis)
    }
}

impl LoopbackConfig {
    /// Create a [LoopbackConfig] from its components.
    ///
    /// # Examples
    ///
    /// ```
    /// # use gsstest::config::LoopbackConfig;
    /// #
    /// let yaml = concat!("realm: JBOSS.ORG\n",
    ///                    "legs: 3\n");
    ///
    /// assert_eq!(
    ///     LoopbackConfig::new("JBOSS.ORG", 3),
    ///     serde_yaml::from_str(yaml).unwrap()
    /// );
    /// ```
    #[inline]
    pub fn new(
        realm: &str,
        legs: usize
    ) -> Self {
        LoopbackConfig {
            realm: String::from(realm),
            legs: legs
        }
    }

    /// Get the realm.
    #[inline]
    pub fn realm(&self) -> &str {
        &self.realm
    }

    /// Get the number of token legs.
    #[inline]
    pub fn legs(&self) -> usize {
        self.legs
    }

    #[inline]
    fn default_realm() -> String {
        String::from(DEFAULT_REALM)
    }

    #[inline]
    fn default_legs() -> usize {
        DEFAULT_LEGS
    }
}

impl ControlConfig {
    /// Create a [ControlConfig] from its components.
    #[inline]
    pub fn new(
        addr: IpAddr,
        port: u16,
        read_timeout: Duration
    ) -> Self {
        ControlConfig {
            addr: addr,
            port: port,
            read_timeout: read_timeout.as_millis() as u64
        }
    }

    /// Get the address at which to listen.
    #[inline]
    pub fn addr(&self) -> IpAddr {
        self.addr
    }

    /// Get the port on which to listen.
    #[inline]
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Get the socket address at which to listen.
    #[inline]
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.addr, self.port)
    }

    /// Get the read timeout.
    #[inline]
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout)
    }

    #[inline]
    fn default_addr() -> IpAddr {
        IpAddr::V4(Ipv4Addr::UNSPECIFIED)
    }

    #[inline]
    fn default_port() -> u16 {
        DEFAULT_CONTROL_PORT
    }

    #[inline]
    fn default_read_timeout() -> u64 {
        2000
    }
}

impl ServerConfig {
    /// Load a configuration from `path`, or use the defaults if
    /// `path` is `None`, then apply environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        load_yaml::<Self>(path)?
            .unwrap_or_default()
            .with_overrides(|name| std::env::var(name).ok())
    }

    /// Apply overrides, looking each variable up with `lookup`.
    pub fn with_overrides<F>(
        mut self,
        lookup: F
    ) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String> {
        if let Some(value) = lookup(ENV_SERVER_PORT) {
            self.port = parse_port(ENV_SERVER_PORT, value)?;
        }

        if let Some(value) = lookup(ENV_SERVER_PRINCIPAL) {
            self.principal = nonempty(ENV_SERVER_PRINCIPAL, value)?;
        }

        if let Some(value) = lookup(ENV_SERVER_PASSWORD) {
            self.secret = value;
        }

        Ok(self)
    }

    /// Get the address at which to listen.
    #[inline]
    pub fn addr(&self) -> IpAddr {
        self.addr
    }

    /// Get the port on which to listen.
    #[inline]
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Get the socket address at which to listen.
    #[inline]
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.addr, self.port)
    }

    /// Get the server principal.
    #[inline]
    pub fn principal(&self) -> &str {
        &self.principal
    }

    /// Get the server password.
    #[inline]
    pub fn secret(&self) -> &str {
        &self.secret
    }

    /// Get the per-session read timeout.
    #[inline]
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout)
    }

    /// Get the largest frame accepted from a client.
    #[inline]
    pub fn max_frame_len(&self) -> usize {
        self.max_frame_len
    }

    /// Get the stop policy.
    #[inline]
    pub fn stop_policy(&self) -> StopPolicy {
        self.stop_policy
    }

    /// Get the concurrency mode.
    #[inline]
    pub fn concurrency(&self) -> Concurrency {
        self.concurrency
    }

    /// Whether unexpected commands are errors.
    #[inline]
    pub fn strict_commands(&self) -> bool {
        self.strict_commands
    }

    /// Get the command encoding.
    #[inline]
    pub fn command_encoding(&self) -> CommandEncoding {
        self.command_encoding
    }

    /// Get the mechanism configuration.
    #[inline]
    pub fn mechanism(&self) -> &MechanismConfig {
        &self.mechanism
    }

    /// Get the remote control configuration.
    #[inline]
    pub fn control(&self) -> &ControlConfig {
        &self.control
    }

    /// Set the address and port.
    #[inline]
    pub fn with_socket_addr(
        mut self,
        addr: SocketAddr
    ) -> Self {
        self.addr = addr.ip();
        self.port = addr.port();

        self
    }

    /// Set the stop policy.
    #[inline]
    pub fn with_stop_policy(
        mut self,
        policy: StopPolicy
    ) -> Self {
        self.stop_policy = policy;

        self
    }

    /// Set the concurrency mode.
    #[inline]
    pub fn with_concurrency(
        mut self,
        concurrency: Concurrency
    ) -> Self {
        self.concurrency = concurrency;

        self
    }

    /// Set whether unexpected commands are errors.
    #[inline]
    pub fn with_strict_commands(
        mut self,
        strict: bool
    ) -> Self {
        self.strict_commands = strict;

        self
    }

    /// Set the command encoding.
    #[inline]
    pub fn with_command_encoding(
        mut self,
        encoding: CommandEncoding
    ) -> Self {
        self.command_encoding = encoding;

        self
    }

    /// Set the per-session read timeout.
    #[inline]
    pub fn with_read_timeout(
        mut self,
        timeout: Duration
    ) -> Self {
        self.read_timeout = timeout.as_millis() as u64;

        self
    }

    /// Set the server principal and password.
    #[inline]
    pub fn with_principal(
        mut self,
        principal: &str,
        secret: &str
    ) -> Self {
        self.principal = String::from(principal);
        self.secret = String::from(secret);

        self
    }

    #[inline]
    fn default_addr() -> IpAddr {
        IpAddr::V4(Ipv4Addr::UNSPECIFIED)
    }

    #[inline]
    fn default_port() -> u16 {
        DEFAULT_PORT
    }

    #[inline]
    fn default_principal() -> String {
        String::from(DEFAULT_PRINCIPAL)
    }

    #[inline]
    fn default_secret() -> String {
        String::from(DEFAULT_PASSWORD)
    }

    #[inline]
    fn default_read_timeout() -> u64 {
        30000
    }

    #[inline]
    fn default_max_frame_len() -> usize {
        DEFAULT_MAX_FRAME_LEN
    }

    #[inline]
    fn default_stop_policy() -> StopPolicy {
        StopPolicy::RemoteControl
    }

    #[inline]
    fn default_concurrency() -> Concurrency {
        Concurrency::Sequential
    }
}

impl ClientConfig {
    /// Load a configuration from `path`, or use the defaults if
    /// `path` is `None`, then apply environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        load_yaml::<Self>(path)?
            .unwrap_or_default()
            .with_overrides(|name| std::env::var(name).ok())
    }

    /// Apply overrides, looking each variable up with `lookup`.
    pub fn with_overrides<F>(
        mut self,
        lookup: F
    ) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String> {
        if let Some(value) = lookup(ENV_SERVER_PORT) {
            self.port = parse_port(ENV_SERVER_PORT, value)?;
        }

        if let Some(value) = lookup(ENV_SERVER_PRINCIPAL) {
            self.service = nonempty(ENV_SERVER_PRINCIPAL, value)?;
        }

        if let Some(value) = lookup(ENV_CLIENT_HOST) {
            self.host = nonempty(ENV_CLIENT_HOST, value)?;
        }

        if let Some(value) = lookup(ENV_CLIENT_PRINCIPAL) {
            self.principal = Some(nonempty(ENV_CLIENT_PRINCIPAL, value)?);
        }

        if let Some(value) = lookup(ENV_CLIENT_PASSWORD) {
            self.secret = Some(value);
        }

        Ok(self)
    }

    /// Get the server host.
    #[inline]
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Get the server port.
    #[inline]
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Get the target service principal.
    #[inline]
    pub fn service(&self) -> &str {
        &self.service
    }

    /// Get the client principal, if one was given.
    #[inline]
    pub fn principal(&self) -> Option<&str> {
        self.principal.as_deref()
    }

    /// Get the client password, if one was given.
    #[inline]
    pub fn secret(&self) -> Option<&str> {
        self.secret.as_deref()
    }

    /// Get the client variant.
    #[inline]
    pub fn variant(&self) -> ClientVariant {
        self.variant
    }

    /// Get the connect timeout.
    #[inline]
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout)
    }

    /// Get the read timeout.
    #[inline]
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout)
    }

    /// Get the command encoding.
    #[inline]
    pub fn command_encoding(&self) -> CommandEncoding {
        self.command_encoding
    }

    /// Get the mechanism configuration.
    #[inline]
    pub fn mechanism(&self) -> &MechanismConfig {
        &self.mechanism
    }

    /// Set the server host and port.
    #[inline]
    pub fn with_server(
        mut self,
        host: &str,
        port: u16
    ) -> Self {
        self.host = String::from(host);
        self.port = port;

        self
    }

    /// Set the target service principal.
    #[inline]
    pub fn with_service(
        mut self,
        service: &str
    ) -> Self {
        self.service = String::from(service);

        self
    }

    /// Set the client principal and password.
    #[inline]
    pub fn with_principal(
        mut self,
        principal: &str,
        secret: Option<&str>
    ) -> Self {
        self.principal = Some(String::from(principal));
        self.secret = secret.map(String::from);

        self
    }

    /// Set the variant.
    #[inline]
    pub fn with_variant(
        mut self,
        variant: ClientVariant
    ) -> Self {
        self.variant = variant;

        self
    }

    /// Set the command encoding.
    #[inline]
    pub fn with_command_encoding(
        mut self,
        encoding: CommandEncoding
    ) -> Self {
        self.command_encoding = encoding;

        self
    }

    /// Set the connect and read timeouts.
    #[inline]
    pub fn with_timeouts(
        mut self,
        connect: Duration,
        read: Duration
    ) -> Self {
        self.connect_timeout = connect.as_millis() as u64;
        self.read_timeout = read.as_millis() as u64;

        self
    }

    #[inline]
    fn default_host() -> String {
        String::from("localhost")
    }

    #[inline]
    fn default_port() -> u16 {
        DEFAULT_PORT
    }

    #[inline]
    fn default_service() -> String {
        String::from(DEFAULT_PRINCIPAL)
    }

    #[inline]
    fn default_variant() -> ClientVariant {
        ClientVariant::Mutual
    }

    #[inline]
    fn default_connect_timeout() -> u64 {
        30000
    }

    #[inline]
    fn default_read_timeout() -> u64 {
        30000
    }
}

impl Debug for ServerConfig {
    fn fmt(
        &self,
        f: &mut Formatter
    ) -> Result<(), std::fmt::Error> {
        f.debug_struct("ServerConfig")
            .field("addr", &self.addr)
            .field("port", &self.port)
            .field("principal", &self.principal)
            .field("secret", &"<redacted>")
            .field("read_timeout", &self.read_timeout)
            .field("max_frame_len", &self.max_frame_len)
            .field("stop_policy", &self.stop_policy)
            .field("concurrency", &self.concurrency)
            .field("strict_commands", &self.strict_commands)
            .field("command_encoding", &self.command_encoding)
            .field("mechanism", &self.mechanism)
            .field("control", &self.control)
            .finish()
    }
}

impl Debug for ClientConfig {
    fn fmt(
        &self,
        f: &mut Formatter
    ) -> Result<(), std::fmt::Error> {
        f.debug_struct("ClientConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("service", &self.service)
            .field("principal", &self.principal)
            .field("secret", &self.secret.as_ref().map(|_| "<redacted>"))
            .field("variant", &self.variant)
            .field("connect_timeout", &self.connect_timeout)
            .field("read_timeout", &self.read_timeout)
            .field("command_encoding", &self.command_encoding)
            .field("mechanism", &self.mechanism)
            .finish()
    }
}

impl ScopedError for ConfigError {
    #[inline]
    fn scope(&self) -> ErrorScope {
        ErrorScope::Unrecoverable
    }
}

impl Display for ConfigError {
    fn fmt(
        &self,
        f: &mut Formatter
    ) -> Result<(), std::fmt::Error> {
        match self {
            ConfigError::IO { path, error } => {
                write!(f, "error reading {}: {}", path.display(), error)
            }
            ConfigError::Parse { error } => {
                write!(f, "error parsing configuration: {}", error)
            }
            ConfigError::BadEnv { name, value } => {
                write!(f, "bad value \"{}\" for {}", value, name)
            }
            ConfigError::BadMechanism { name } => {
                write!(f, "unknown mechanism {}", name)
            }
        }
    }
}

#[cfg(test)]
use std::collections::HashMap;

#[test]
fn test_deserialize_server_default() {
    let actual: ServerConfig = serde_yaml::from_str("{}").unwrap();

    assert_eq!(ServerConfig::default(), actual);
    assert_eq!(10961, actual.port());
    assert_eq!("gsstestserver/xxx@JBOSS.ORG", actual.principal());
    assert_eq!("gsstestpwd", actual.secret());
    assert_eq!(Duration::from_secs(30), actual.read_timeout());
    assert_eq!(StopPolicy::RemoteControl, actual.stop_policy());
    assert_eq!(Concurrency::Sequential, actual.concurrency());
    assert_eq!(10959, actual.control().port());
    assert_eq!(Duration::from_secs(2), actual.control().read_timeout());
}

#[test]
fn test_deserialize_server_full() {
    let yaml = concat!(
        "addr: 127.0.0.1\n",
        "port: 6000\n",
        "principal: HTTP/localhost@KERBEROS.EXAMPLE\n",
        "secret: httppwd\n",
        "read-timeout: 5000\n",
        "max-frame-len: 65536\n",
        "stop-policy: command\n",
        "concurrency: threaded\n",
        "strict-commands: true\n",
        "command-encoding: raw\n",
        "mechanism:\n",
        "  loopback:\n",
        "    legs: 3\n",
        "control:\n",
        "  port: 6001\n"
    );
    let expected = ServerConfig {
        addr: IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)),
        port: 6000,
        principal: String::from("HTTP/localhost@KERBEROS.EXAMPLE"),
        secret: String::from("httppwd"),
        read_timeout: 5000,
        max_frame_len: 65536,
        stop_policy: StopPolicy::Command,
        concurrency: Concurrency::Threaded,
        strict_commands: true,
        command_encoding: CommandEncoding::Raw,
        mechanism: MechanismConfig::Loopback {
            loopback: LoopbackConfig::new(DEFAULT_REALM, 3)
        },
        control: ControlConfig {
            addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: 6001,
            read_timeout: 2000
        }
    };
    let actual = serde_yaml::from_str(yaml).unwrap();

    assert_eq!(expected, actual)
}

#[test]
fn test_deserialize_mechanism_names() {
    assert_eq!(
        MechanismConfig::default(),
        serde_yaml::from_str("gssapi\n").unwrap()
    );
    assert_eq!(
        MechanismConfig::Loopback {
            loopback: LoopbackConfig::default()
        },
        serde_yaml::from_str("loopback\n").unwrap()
    );
    assert_eq!(
        MechanismConfig::GSSAPI {
            gssapi: GSSAPIConfig::new(Some(Duration::from_secs(60)))
        },
        serde_yaml::from_str("gssapi:\n  time-req: 60000\n").unwrap()
    );
    assert!(serde_yaml::from_str::<MechanismConfig>("ntlm\n").is_err());
}

#[test]
fn test_deserialize_client() {
    let yaml = concat!(
        "host: kdc.example.com\n",
        "principal: hnelson\n",
        "secret: secret\n",
        "variant: unilateral\n",
        "connect-timeout: 1000\n"
    );
    let actual: ClientConfig = serde_yaml::from_str(yaml).unwrap();

    assert_eq!("kdc.example.com", actual.host());
    assert_eq!(10961, actual.port());
    assert_eq!("gsstestserver/xxx@JBOSS.ORG", actual.service());
    assert_eq!(Some("hnelson"), actual.principal());
    assert_eq!(Some("secret"), actual.secret());
    assert_eq!(InitiatorFlags::unilateral(), actual.variant().flags());
    assert_eq!(Duration::from_secs(1), actual.connect_timeout());
    assert_eq!(Duration::from_secs(30), actual.read_timeout());
}

#[test]
fn test_server_env_overrides() {
    let env: HashMap<&str, &str> = vec![
        ("GSSTESTSERVER_PORT", "12000"),
        ("GSSTESTSERVER_PRINCIPAL", "HTTP/localhost@JBOSS.ORG"),
        ("GSSTESTSERVER_PASSWORD", "httppwd")
    ]
    .into_iter()
    .collect();
    let config = ServerConfig::default()
        .with_overrides(|name| env.get(name).map(|v| String::from(*v)))
        .expect("expected success");

    assert_eq!(12000, config.port());
    assert_eq!("HTTP/localhost@JBOSS.ORG", config.principal());
    assert_eq!("httppwd", config.secret());
    assert!(!format!("{:?}", config).contains("httppwd"));
}

#[test]
fn test_client_env_overrides() {
    let env: HashMap<&str, &str> = vec![
        ("GSSTESTSERVER_PORT", "12001"),
        ("GSSTESTSERVER_PRINCIPAL", "HTTP/localhost@JBOSS.ORG"),
        ("GSSTESTCLIENT_HOST", "server.example.com"),
        ("GSSTESTCLIENT_PRINCIPAL", "jduke"),
        ("GSSTESTCLIENT_PASSWORD", "theduke")
    ]
    .into_iter()
    .collect();
    let config = ClientConfig::default()
        .with_overrides(|name| env.get(name).map(|v| String::from(*v)))
        .expect("expected success");

    assert_eq!(12001, config.port());
    assert_eq!("HTTP/localhost@JBOSS.ORG", config.service());
    assert_eq!("server.example.com", config.host());
    assert_eq!(Some("jduke"), config.principal());
    assert_eq!(Some("theduke"), config.secret());
}

#[test]
fn test_bad_env_override() {
    let res = ServerConfig::default().with_overrides(|name| {
        if name == "GSSTESTSERVER_PORT" {
            Some(String::from("not-a-port"))
        } else {
            None
        }
    });

    match res {
        Err(ConfigError::BadEnv { name, value }) => {
            assert_eq!("GSSTESTSERVER_PORT", name);
            assert_eq!("not-a-port", value);
        }
        other => panic!("expected bad env, got {:?}", other)
    }
}

#[test]
fn test_missing_config_file() {
    let path = Path::new("/nonexistent/gsstest.yaml");

    match ServerConfig::load(Some(path)) {
        Err(ConfigError::IO { path: err_path, .. }) => {
            assert_eq!(path, err_path.as_path())
        }
        other => panic!("expected IO error, got {:?}", other)
    }
}
