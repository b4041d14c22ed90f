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

//! Remote control channel.
//!
//! The control channel is a second listener, separate from the
//! server's primary port.  Each connection sends one line of plain
//! text.  If that line is the [STOP_KEYWORD], the channel triggers the
//! server's [StopHandle] and exits; anything else is logged and
//! ignored.  No authentication is performed, so the control port
//! should only be reachable from trusted hosts.
use std::fmt::Display;
use std::fmt::Formatter;
use std::io::BufRead;
use std::io::BufReader;
use std::io::Error;
use std::io::Read;
use std::io::Write;
use std::net::SocketAddr;
use std::net::TcpListener;
use std::net::TcpStream;
use std::thread;
use std::thread::JoinHandle;
use std::time::Duration;

use log::debug;
use log::error;
use log::info;
use log::warn;

use crate::config::ControlConfig;
use crate::error::accept_retry_delay;
use crate::error::ErrorScope;
use crate::error::ScopedError;
use crate::server::StopHandle;

/// The line that stops the server.
pub const STOP_KEYWORD: &str = "stop";

/// Longest line read from a control connection.
const MAX_LINE_LEN: u64 = 256;

/// Errors that can occur in the control channel.
#[derive(Debug)]
pub enum ControlError {
    /// The control port could not be bound.
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
    },
    /// The control thread could not be started.
    Spawn {
        /// IO error.
        error: Error
    }
}

/// Listener for the stop keyword.
pub struct ControlChannel {
    listener: TcpListener,
    stop: StopHandle,
    read_timeout: Duration
}

/// Read one line from `stream` and check it against [STOP_KEYWORD].
fn read_keyword(
    stream: TcpStream,
    read_timeout: Duration
) -> Result<bool, Error> {
    stream.set_read_timeout(Some(read_timeout))?;

    let mut reader = BufReader::new(stream).take(MAX_LINE_LEN);
    let mut line = String::new();

    reader.read_line(&mut line)?;

    let line = line.strip_suffix('\n').unwrap_or(&line);
    let line = line.strip_suffix('\r').unwrap_or(line);

    if line == STOP_KEYWORD {
        Ok(true)
    } else {
        debug!(target: "gss-control",
               "ignoring control line {:?}",
               line);

        Ok(false)
    }
}

impl ControlChannel {
    /// Bind the control port described by `config`.
    ///
    /// The stop keyword will trigger `stop`.
    pub fn bind(
        config: &ControlConfig,
        stop: StopHandle
    ) -> Result<Self, ControlError> {
        let addr = config.socket_addr();
        let listener = TcpListener::bind(addr).map_err(|err| {
            ControlError::Bind {
                addr: addr,
                error: err
            }
        })?;

        info!(target: "gss-control",
              "control channel bound to {}",
              addr);

        Ok(ControlChannel {
            listener: listener,
            stop: stop,
            read_timeout: config.read_timeout()
        })
    }

    /// Get the address the control channel is bound to.
    #[inline]
    pub fn local_addr(&self) -> Result<SocketAddr, Error> {
        self.listener.local_addr()
    }

    /// Accept control connections until the stop keyword arrives, or
    /// until the server is stopped some other way.
    ///
    /// A server stopped by other means is only noticed when the next
    /// control connection arrives.
    pub fn run(self) -> Result<(), ControlError> {
        while !self.stop.is_stopped() {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    debug!(target: "gss-control",
                           "control connection from {}",
                           peer);

                    match read_keyword(stream, self.read_timeout) {
                        Ok(true) => {
                            info!(target: "gss-control",
                                  "stop keyword received from {}",
                                  peer);

                            self.stop.stop();

                            return Ok(());
                        }
                        Ok(false) => {}
                        Err(err) => {
                            warn!(target: "gss-control",
                                  "error reading from {}: {}",
                                  peer, err);
                        }
                    }
                }
                Err(err) => match accept_retry_delay(err.scope()) {
                    Some(delay) => {
                        warn!(target: "gss-control",
                              "error accepting connection: {}",
                              err);

                        if !delay.is_zero() {
                            thread::sleep(delay)
                        }
                    }
                    None => {
                        error!(target: "gss-control",
                               "fatal error accepting connections: {}",
                               err);

                        return Err(ControlError::Accept { error: err });
                    }
                }
            }
        }

        Ok(())
    }

    /// Run the control channel on its own thread.
    pub fn spawn(
        self
    ) -> Result<JoinHandle<Result<(), ControlError>>, ControlError> {
        thread::Builder::new()
            .name(String::from("gss-control"))
            .spawn(move || self.run())
            .map_err(|err| ControlError::Spawn { error: err })
    }
}

/// Send the stop keyword to the control channel at `addr`.
pub fn send_stop_keyword(
    addr: SocketAddr,
    timeout: Duration
) -> Result<(), Error> {
    info!(target: "gss-control",
          "sending stop keyword to {}",
          addr);

    let mut stream = TcpStream::connect_timeout(&addr, timeout)?;

    stream.write_all(STOP_KEYWORD.as_bytes())?;
    stream.write_all(b"\n")?;
    stream.flush()
}

impl ScopedError for ControlError {
    fn scope(&self) -> ErrorScope {
        match self {
            ControlError::Bind { .. } => ErrorScope::Unrecoverable,
            ControlError::Accept { error } => error.scope(),
            ControlError::Spawn { error } => error.scope()
        }
    }
}

impl Display for ControlError {
    fn fmt(
        &self,
        f: &mut Formatter
    ) -> Result<(), std::fmt::Error> {
        match self {
            ControlError::Bind { addr, error } => {
                write!(f, "error binding control port {}: {}", addr, error)
            }
            ControlError::Accept { error } => error.fmt(f),
            ControlError::Spawn { error } => {
                write!(f, "error starting control thread: {}", error)
            }
        }
    }
}

#[cfg(test)]
use std::thread::spawn;

#[cfg(test)]
use crate::client::GSSTestClient;
#[cfg(test)]
use crate::config::ClientConfig;
#[cfg(test)]
use crate::config::ServerConfig;
#[cfg(test)]
use crate::cred::PasswordHandler;
#[cfg(test)]
use crate::frame::read_frame;
#[cfg(test)]
use crate::frame::write_frame;
#[cfg(test)]
use crate::init;
#[cfg(test)]
use crate::mech::loopback::LoopbackCredential;
#[cfg(test)]
use crate::mech::loopback::LoopbackMechanism;
#[cfg(test)]
use crate::mech::loopback::DEFAULT_REALM;
#[cfg(test)]
use crate::mech::InitiatorFlags;
#[cfg(test)]
use crate::mech::Mechanism;
#[cfg(test)]
use crate::mech::SecurityContext;
#[cfg(test)]
use crate::proto::write_command;
#[cfg(test)]
use crate::proto::Command;
#[cfg(test)]
use crate::proto::CommandEncoding;
#[cfg(test)]
use crate::server::GSSTestServer;

#[cfg(test)]
fn test_control_config() -> ControlConfig {
    ControlConfig::new(
        "127.0.0.1".parse().unwrap(),
        0,
        Duration::from_millis(500)
    )
}

#[test]
fn test_stop_keyword_stops_server() {
    init();

    let mech = LoopbackMechanism::default();
    let config = ServerConfig::default()
        .with_socket_addr("127.0.0.1:0".parse().unwrap());
    let handler =
        PasswordHandler::with_password(config.principal(), config.secret());
    let server = GSSTestServer::new(config, mech.clone(), &handler)
        .expect("expected success");
    let addr = server.local_addr().unwrap();
    let control = ControlChannel::bind(&test_control_config(), server.stop_handle())
        .expect("expected success");
    let control_addr = control.local_addr().unwrap();
    let control_join = control.spawn().expect("expected success");
    let server_join = spawn(move || server.run().expect("expected success"));
    let client = GSSTestClient::new(
        ClientConfig::default()
            .with_server("127.0.0.1", addr.port())
            .with_timeouts(Duration::from_secs(5), Duration::from_secs(5))
    );
    let cred = LoopbackCredential::from_principal("hnelson@KERBEROS.EXAMPLE");

    client
        .get_name(&mech, Some(&cred))
        .expect("expected success");
    send_stop_keyword(control_addr, Duration::from_secs(5))
        .expect("expected success");

    control_join.join().unwrap().expect("expected success");

    let report = server_join.join().unwrap();

    assert_eq!(1, report.sessions());
    assert_eq!(1, report.identities());

    // Nothing is listening any more.
    assert!(client.get_name(&mech, Some(&cred)).is_err());
}

#[test]
fn test_stop_during_session() {
    init();

    let mech = LoopbackMechanism::new(DEFAULT_REALM, 3);
    let config = ServerConfig::default()
        .with_socket_addr("127.0.0.1:0".parse().unwrap());
    let handler =
        PasswordHandler::with_password(config.principal(), config.secret());
    let server = GSSTestServer::new(config, mech.clone(), &handler)
        .expect("expected success");
    let addr = server.local_addr().unwrap();
    let control = ControlChannel::bind(&test_control_config(), server.stop_handle())
        .expect("expected success");
    let control_addr = control.local_addr().unwrap();
    let control_join = control.spawn().expect("expected success");
    let server_join = spawn(move || server.run().expect("expected success"));
    let mut stream = TcpStream::connect(addr).unwrap();

    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();

    let cred = LoopbackCredential::from_principal("hnelson@KERBEROS.EXAMPLE");
    let mut ctx = mech
        .initiator(
            "gsstestserver/xxx@JBOSS.ORG",
            Some(&cred),
            InitiatorFlags::mutual()
        )
        .unwrap();

    write_command(&mut stream, Command::Name, CommandEncoding::Framed)
        .expect("expected success");

    let first = ctx.step(&[]).unwrap().unwrap();

    write_frame(&mut stream, &first).expect("expected success");

    let reply = read_frame(&mut stream).expect("expected success");

    // Stop while the server is waiting for the last leg.
    send_stop_keyword(control_addr, Duration::from_secs(5))
        .expect("expected success");
    control_join.join().unwrap().expect("expected success");

    let last = ctx.step(&reply).unwrap().unwrap();

    write_frame(&mut stream, &last).expect("expected success");

    assert!(ctx.is_established());

    let sealed = read_frame(&mut stream).expect("expected success");

    assert_eq!(
        b"hnelson@KERBEROS.EXAMPLE".to_vec(),
        ctx.unwrap(&sealed).unwrap()
    );

    let report = server_join.join().unwrap();

    assert_eq!(1, report.sessions());
    assert_eq!(1, report.identities());
    assert!(TcpStream::connect(addr).is_err());

    ctx.dispose().unwrap();
}

#[test]
fn test_other_lines_ignored() {
    init();

    let mech = LoopbackMechanism::default();
    let config = ServerConfig::default()
        .with_socket_addr("127.0.0.1:0".parse().unwrap());
    let handler =
        PasswordHandler::with_password(config.principal(), config.secret());
    let server = GSSTestServer::new(config, mech, &handler)
        .expect("expected success");
    let stop = server.stop_handle();
    let control = ControlChannel::bind(&test_control_config(), stop.clone())
        .expect("expected success");
    let control_addr = control.local_addr().unwrap();
    let control_join = control.spawn().expect("expected success");

    for line in ["STOP\n", "stopp\n", " stop\n", "halt"] {
        let mut stream = TcpStream::connect(control_addr).unwrap();
        let mut buf = Vec::new();

        stream.write_all(line.as_bytes()).unwrap();
        stream.shutdown(std::net::Shutdown::Write).unwrap();
        // The channel closes the connection once it has read a line.
        stream.read_to_end(&mut buf).unwrap();
    }

    assert!(!stop.is_stopped());

    // A silent connection times out without stopping anything.
    {
        let mut stream = TcpStream::connect(control_addr).unwrap();
        let mut buf = Vec::new();

        stream.read_to_end(&mut buf).unwrap();
    }

    assert!(!stop.is_stopped());

    // Windows-style line endings are accepted.
    {
        let mut stream = TcpStream::connect(control_addr).unwrap();

        stream.write_all(b"stop\r\n").unwrap();
    }

    control_join.join().unwrap().expect("expected success");
    assert!(stop.is_stopped());
}
