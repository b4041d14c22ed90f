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

//! Length-prefixed framing.
//!
//! Every message exchanged on the primary port (commands, negotiation
//! tokens, and the sealed reply) travels as a *frame*: a 4-byte
//! big-endian length followed by exactly that many payload bytes.  A
//! length of zero is a valid, empty frame.
//!
//! Reads block until the whole frame has arrived or the stream ends.
//! A stream that ends part-way through a frame produces
//! [FrameError::Truncated].
//!
//! # Examples
//!
//! ```
//! # use gsstest::frame::read_frame;
//! # use gsstest::frame::write_frame;
//! # use std::io::Cursor;
//! #
//! let mut buf = Vec::new();
//!
//! write_frame(&mut buf, b"token").unwrap();
//!
//! assert_eq!(buf[..4], [0x00, 0x00, 0x00, 0x05]);
//!
//! let mut cursor = Cursor::new(buf);
//!
//! assert_eq!(read_frame(&mut cursor).unwrap(), b"token");
//! ```
use std::convert::TryFrom;
use std::fmt::Display;
use std::fmt::Formatter;
use std::io::Error;
use std::io::ErrorKind;
use std::io::Read;
use std::io::Write;

use log::trace;
use log::warn;

use crate::error::ErrorScope;
use crate::error::ScopedError;

/// Size of the length prefix.
pub const FRAME_HEADER_LEN: usize = 4;

/// Errors that can occur reading or writing frames.
#[derive(Debug)]
pub enum FrameError {
    /// The stream ended before a complete frame was received.
    Truncated {
        /// Number of bytes that were expected.
        expected: usize,
        /// Number of bytes that actually arrived.
        received: usize
    },
    /// The frame length exceeds what can be sent or what the reader
    /// will accept.
    Oversized {
        /// Length of the frame.
        len: usize,
        /// Largest permitted length.
        limit: usize
    },
    /// Low-level IO error.
    IO {
        /// IO error.
        error: Error
    }
}

/// Read until `buf` is full or the stream ends, returning the number
/// of bytes read.
pub(crate) fn fill<R>(
    stream: &mut R,
    buf: &mut [u8]
) -> Result<usize, Error>
where
    R: Read {
    let mut nread = 0;

    while nread < buf.len() {
        match stream.read(&mut buf[nread..]) {
            Ok(0) => break,
            Ok(n) => nread += n,
            Err(err) if err.kind() == ErrorKind::Interrupted => {}
            Err(err) => return Err(err)
        }
    }

    Ok(nread)
}

/// Write `payload` as a single frame and flush the stream.
pub fn write_frame<W>(
    stream: &mut W,
    payload: &[u8]
) -> Result<(), FrameError>
where
    W: Write {
    let len = u32::try_from(payload.len()).map_err(|_| FrameError::Oversized {
        len: payload.len(),
        limit: u32::MAX as usize
    })?;
    let mut buf = Vec::with_capacity(payload.len() + FRAME_HEADER_LEN);

    buf.extend_from_slice(&len.to_be_bytes());
    buf.extend_from_slice(payload);

    trace!(target: "gss-frame",
           "writing frame of {} bytes",
           len);

    stream
        .write_all(&buf)
        .map_err(|err| FrameError::IO { error: err })?;
    stream.flush().map_err(|err| FrameError::IO { error: err })
}

/// Read the 4-byte length prefix of a frame.
fn read_header<R>(stream: &mut R) -> Result<usize, FrameError>
where
    R: Read {
    let mut header = [0; FRAME_HEADER_LEN];
    let nread =
        fill(stream, &mut header).map_err(|err| FrameError::IO { error: err })?;

    if nread < FRAME_HEADER_LEN {
        return Err(FrameError::Truncated {
            expected: FRAME_HEADER_LEN,
            received: nread
        });
    }

    Ok(u32::from_be_bytes(header) as usize)
}

/// Read the payload of a frame whose header advertised `len` bytes.
///
/// The buffer grows as data arrives, so a bogus length never causes a
/// large allocation by itself.
fn read_payload<R>(
    stream: &mut R,
    len: usize
) -> Result<Vec<u8>, FrameError>
where
    R: Read {
    let mut buf = Vec::new();
    let nread = stream
        .take(len as u64)
        .read_to_end(&mut buf)
        .map_err(|err| FrameError::IO { error: err })?;

    if nread < len {
        warn!(target: "gss-frame",
              "stream closed after {} of {} payload bytes",
              nread, len);

        return Err(FrameError::Truncated {
            expected: len,
            received: nread
        });
    }

    trace!(target: "gss-frame",
           "read frame of {} bytes",
           len);

    Ok(buf)
}

/// Read one complete frame.
pub fn read_frame<R>(stream: &mut R) -> Result<Vec<u8>, FrameError>
where
    R: Read {
    let len = read_header(stream)?;

    read_payload(stream, len)
}

/// Read one complete frame, rejecting frames longer than `limit`.
///
/// The length is checked before any of the payload is read.
pub fn read_frame_limited<R>(
    stream: &mut R,
    limit: usize
) -> Result<Vec<u8>, FrameError>
where
    R: Read {
    let len = read_header(stream)?;

    if len > limit {
        warn!(target: "gss-frame",
              "peer advertised frame of {} bytes (limit {})",
              len, limit);

        return Err(FrameError::Oversized {
            len: len,
            limit: limit
        });
    }

    read_payload(stream, len)
}

impl FrameError {
    /// Whether this error represents a stream that ended mid-frame.
    #[inline]
    pub fn is_truncated(&self) -> bool {
        matches!(self, FrameError::Truncated { .. })
    }
}

impl ScopedError for FrameError {
    fn scope(&self) -> ErrorScope {
        match self {
            FrameError::Truncated { .. } => ErrorScope::Session,
            FrameError::Oversized { .. } => ErrorScope::External,
            FrameError::IO { error } => error.scope()
        }
    }
}

impl Display for FrameError {
    fn fmt(
        &self,
        f: &mut Formatter
    ) -> Result<(), std::fmt::Error> {
        match self {
            FrameError::Truncated { expected, received } => write!(
                f,
                "stream truncated ({} of {} bytes received)",
                received, expected
            ),
            FrameError::Oversized { len, limit } => write!(
                f,
                "frame of {} bytes exceeds limit of {} bytes",
                len, limit
            ),
            FrameError::IO { error } => error.fmt(f)
        }
    }
}

#[cfg(test)]
use std::io::Cursor;
#[cfg(test)]
use std::net::Shutdown;
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

#[test]
fn test_frame_roundtrip_empty_and_large() {
    init();

    let large: Vec<u8> = (0..70000).map(|i| (i % 251) as u8).collect();
    let mut buf = Vec::new();

    write_frame(&mut buf, &[]).expect("expected success");
    write_frame(&mut buf, &large).expect("expected success");

    assert_eq!(buf[..FRAME_HEADER_LEN], [0, 0, 0, 0]);

    let mut cursor = Cursor::new(buf);

    assert!(read_frame(&mut cursor).expect("expected success").is_empty());
    assert_eq!(large, read_frame(&mut cursor).expect("expected success"));

    // Clean end of stream is still a truncated header.
    match read_frame(&mut cursor) {
        Err(FrameError::Truncated { expected, received }) => {
            assert_eq!(FRAME_HEADER_LEN, expected);
            assert_eq!(0, received);
        }
        other => panic!("expected truncation, got {:?}", other)
    }
}

#[test]
fn test_frame_truncated_header() {
    init();

    let mut cursor = Cursor::new(vec![0x00, 0x00]);

    match read_frame(&mut cursor) {
        Err(FrameError::Truncated { expected, received }) => {
            assert_eq!(4, expected);
            assert_eq!(2, received);
        }
        other => panic!("expected truncation, got {:?}", other)
    }
}

#[test]
fn test_frame_limited_rejects_before_payload() {
    init();

    let mut buf = Vec::new();

    write_frame(&mut buf, &[0xaa; 64]).expect("expected success");

    let mut cursor = Cursor::new(buf);

    match read_frame_limited(&mut cursor, 16) {
        Err(FrameError::Oversized { len, limit }) => {
            assert_eq!(64, len);
            assert_eq!(16, limit);
        }
        other => panic!("expected oversized, got {:?}", other)
    }

    assert_eq!(FRAME_HEADER_LEN as u64, cursor.position());
}

#[test]
fn test_frame_truncated_socket() {
    init();

    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let send = spawn(move || {
        let mut stream = TcpStream::connect(addr).unwrap();

        // Advertise 16 bytes, send none of them, and hang up.
        stream.write_all(&[0x00, 0x00, 0x00, 0x10]).unwrap();
        stream.flush().unwrap();
        stream.shutdown(Shutdown::Both).unwrap();
    });
    let (mut stream, _) = listener.accept().unwrap();

    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();

    let err = read_frame(&mut stream).expect_err("expected failure");

    assert!(err.is_truncated());
    assert_eq!(ErrorScope::Session, err.scope());

    send.join().unwrap();
}
