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

//! Command vocabulary for the primary port.
//!
//! The first frame of every session carries a [Command].  The server
//! reads it exactly once per accepted connection and dispatches on it.
//! Only [Command::Name] starts a negotiation; everything else is
//! answered with silence.
use std::fmt::Display;
use std::fmt::Formatter;
use std::io::Read;
use std::io::Write;

use log::trace;
use log::warn;
use serde::Deserialize;
use serde::Serialize;

use crate::error::ErrorScope;
use crate::error::ScopedError;
use crate::frame::fill;
use crate::frame::read_frame_limited;
use crate::frame::write_frame;
use crate::frame::FrameError;
use crate::frame::FRAME_HEADER_LEN;

const CMD_NOOP: u32 = 0;
const CMD_NAME: u32 = 1;
const CMD_STOP: u32 = 2;

/// Size of an encoded command code.
pub const COMMAND_LEN: usize = 4;

/// Session commands.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Command {
    /// Do nothing.
    Noop,
    /// Request identity propagation.
    Name,
    /// Ask the server to leave its accept loop.
    Stop,
    /// Any other code.  Treated like [Noop](Command::Noop) unless a
    /// dispatcher requires something specific.
    Unknown(u32)
}

/// How commands are placed on the wire.
///
/// # YAML Format
///
/// The YAML format is one of the strings `framed` or `raw`.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum CommandEncoding {
    /// The command code is the payload of an ordinary frame.
    Framed,
    /// The command code is written as a bare 4-byte integer, as the
    /// legacy Java test tools do.
    Raw
}

/// Errors that can occur reading a command.
#[derive(Debug)]
pub enum CommandError {
    /// Error reading the frame.
    Frame {
        /// The framing error.
        error: FrameError
    },
    /// The command frame did not carry exactly four bytes.
    BadLength {
        /// Length of the received payload.
        len: usize
    }
}

/// A dispatcher required one command and received another.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DispatchError {
    expected: Command,
    actual: Command
}

impl Default for CommandEncoding {
    #[inline]
    fn default() -> Self {
        CommandEncoding::Framed
    }
}

impl From<u32> for Command {
    #[inline]
    fn from(code: u32) -> Command {
        match code {
            CMD_NOOP => Command::Noop,
            CMD_NAME => Command::Name,
            CMD_STOP => Command::Stop,
            code => Command::Unknown(code)
        }
    }
}

impl From<Command> for u32 {
    #[inline]
    fn from(cmd: Command) -> u32 {
        match cmd {
            Command::Noop => CMD_NOOP,
            Command::Name => CMD_NAME,
            Command::Stop => CMD_STOP,
            Command::Unknown(code) => code
        }
    }
}

impl Command {
    /// Get the wire code for this command.
    #[inline]
    pub fn code(&self) -> u32 {
        u32::from(*self)
    }

    /// Check that this is the `expected` command.
    #[inline]
    pub fn require(
        self,
        expected: Command
    ) -> Result<Command, DispatchError> {
        if self == expected {
            Ok(self)
        } else {
            Err(DispatchError {
                expected: expected,
                actual: self
            })
        }
    }
}

impl DispatchError {
    /// The command the dispatcher wanted.
    #[inline]
    pub fn expected(&self) -> Command {
        self.expected
    }

    /// The command that actually arrived.
    #[inline]
    pub fn actual(&self) -> Command {
        self.actual
    }
}

/// Write `cmd` as the opening message of a session.
pub fn write_command<W>(
    stream: &mut W,
    cmd: Command,
    encoding: CommandEncoding
) -> Result<(), FrameError>
where
    W: Write {
    let code = cmd.code().to_be_bytes();

    trace!(target: "gss-proto",
           "sending command {}",
           cmd);

    match encoding {
        CommandEncoding::Framed => write_frame(stream, &code),
        CommandEncoding::Raw => {
            stream
                .write_all(&code)
                .map_err(|err| FrameError::IO { error: err })?;
            stream.flush().map_err(|err| FrameError::IO { error: err })
        }
    }
}

/// Read the opening command of a session.
pub fn read_command<R>(
    stream: &mut R,
    encoding: CommandEncoding
) -> Result<Command, CommandError>
where
    R: Read {
    let mut code = [0; COMMAND_LEN];

    match encoding {
        CommandEncoding::Framed => {
            // Commands are four bytes; don't buffer much past that.
            let payload =
                read_frame_limited(stream, COMMAND_LEN + FRAME_HEADER_LEN)
                    .map_err(|err| CommandError::Frame { error: err })?;

            if payload.len() != COMMAND_LEN {
                warn!(target: "gss-proto",
                      "command frame carried {} bytes",
                      payload.len());

                return Err(CommandError::BadLength { len: payload.len() });
            }

            code.copy_from_slice(&payload);
        }
        CommandEncoding::Raw => {
            let nread = fill(stream, &mut code).map_err(|err| {
                CommandError::Frame {
                    error: FrameError::IO { error: err }
                }
            })?;

            if nread < COMMAND_LEN {
                return Err(CommandError::Frame {
                    error: FrameError::Truncated {
                        expected: COMMAND_LEN,
                        received: nread
                    }
                });
            }
        }
    }

    Ok(Command::from(u32::from_be_bytes(code)))
}

impl ScopedError for CommandError {
    fn scope(&self) -> ErrorScope {
        match self {
            CommandError::Frame { error } => error.scope(),
            CommandError::BadLength { .. } => ErrorScope::External
        }
    }
}

impl ScopedError for DispatchError {
    #[inline]
    fn scope(&self) -> ErrorScope {
        ErrorScope::External
    }
}

impl Display for Command {
    fn fmt(
        &self,
        f: &mut Formatter
    ) -> Result<(), std::fmt::Error> {
        match self {
            Command::Noop => write!(f, "NOOP"),
            Command::Name => write!(f, "NAME"),
            Command::Stop => write!(f, "STOP"),
            Command::Unknown(code) => write!(f, "unknown ({})", code)
        }
    }
}

impl Display for CommandError {
    fn fmt(
        &self,
        f: &mut Formatter
    ) -> Result<(), std::fmt::Error> {
        match self {
            CommandError::Frame { error } => error.fmt(f),
            CommandError::BadLength { len } => {
                write!(f, "command frame has bad length {}", len)
            }
        }
    }
}

impl Display for DispatchError {
    fn fmt(
        &self,
        f: &mut Formatter
    ) -> Result<(), std::fmt::Error> {
        write!(
            f,
            "expected command {}, received {}",
            self.expected, self.actual
        )
    }
}

#[cfg(test)]
use std::io::Cursor;

#[cfg(test)]
use crate::init;

#[test]
fn test_command_codes() {
    assert_eq!(Command::Noop, Command::from(0));
    assert_eq!(Command::Name, Command::from(1));
    assert_eq!(Command::Stop, Command::from(2));
    assert_eq!(Command::Unknown(77), Command::from(77));
    assert_eq!(77, Command::Unknown(77).code());
}

#[test]
fn test_framed_command_wire_format() {
    init();

    let mut buf = Vec::new();

    write_command(&mut buf, Command::Name, CommandEncoding::Framed)
        .expect("expected success");

    assert_eq!(buf, [0x00, 0x00, 0x00, 0x04, 0x00, 0x00, 0x00, 0x01]);

    let mut cursor = Cursor::new(buf);
    let cmd = read_command(&mut cursor, CommandEncoding::Framed)
        .expect("expected success");

    assert_eq!(Command::Name, cmd);
}

#[test]
fn test_raw_command_wire_format() {
    init();

    let mut buf = Vec::new();

    write_command(&mut buf, Command::Stop, CommandEncoding::Raw)
        .expect("expected success");

    assert_eq!(buf, [0x00, 0x00, 0x00, 0x02]);

    let mut cursor = Cursor::new(buf);
    let cmd = read_command(&mut cursor, CommandEncoding::Raw)
        .expect("expected success");

    assert_eq!(Command::Stop, cmd);
}

#[test]
fn test_command_bad_length() {
    init();

    let mut buf = Vec::new();

    write_frame(&mut buf, &[0x00, 0x01]).unwrap();

    let mut cursor = Cursor::new(buf);

    match read_command(&mut cursor, CommandEncoding::Framed) {
        Err(CommandError::BadLength { len }) => assert_eq!(2, len),
        other => panic!("expected bad length, got {:?}", other)
    }
}

#[test]
fn test_command_truncated_raw() {
    init();

    let mut cursor = Cursor::new(vec![0x00, 0x00, 0x00]);

    match read_command(&mut cursor, CommandEncoding::Raw) {
        Err(CommandError::Frame {
            error: FrameError::Truncated { expected, received }
        }) => {
            assert_eq!(COMMAND_LEN, expected);
            assert_eq!(3, received);
        }
        other => panic!("expected truncation, got {:?}", other)
    }
}

#[test]
fn test_command_require() {
    assert_eq!(Ok(Command::Name), Command::Name.require(Command::Name));

    let err = Command::Unknown(9)
        .require(Command::Name)
        .expect_err("expected failure");

    assert_eq!(Command::Name, err.expected());
    assert_eq!(Command::Unknown(9), err.actual());
}
