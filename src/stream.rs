// Copyright (c) 2019 Parity Technologies (UK) Ltd.
//
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. All files in the project carrying such notice may not be copied,
// modified, or distributed except according to those terms.

//! An incremental byte-stream reader.
//!
//! [`StreamReader`] accumulates inbound bytes fed to it in arbitrary chunks
//! and offers suspendable read operations on top of them: a read that can
//! not yet be satisfied returns `Ok(None)` instead of blocking and can be
//! retried once more bytes have been fed. Feeding the bytes in one piece or
//! byte by byte is observably identical.

use bytes::BytesMut;

/// A suspendable reader over a growing byte buffer.
///
/// The reader lives for one HTTP handshake; once the connection upgrades,
/// the unread residue is handed to the frame codec via [`take_buffer`].
///
/// [`take_buffer`]: StreamReader::take_buffer
#[derive(Debug, Default)]
pub struct StreamReader {
    buffer: BytesMut,
    eof: bool,
    /// Buffer prefix already scanned for LF by an unfinished `read_line`.
    scanned: usize
}

impl StreamReader {
    /// Create an empty reader.
    pub fn new() -> Self {
        StreamReader::default()
    }

    /// Read one line, up to and including the terminating LF.
    ///
    /// Returns `Ok(None)` until a LF is buffered. Re-entry after a
    /// suspension resumes the scan where it left off.
    pub fn read_line(&mut self) -> Result<Option<BytesMut>, Error> {
        if let Some(i) = self.buffer[self.scanned ..].iter().position(|&b| b == b'\n') {
            let end = self.scanned + i + 1;
            self.scanned = 0;
            return Ok(Some(self.buffer.split_to(end)))
        }
        self.scanned = self.buffer.len();
        if self.eof {
            return Err(Error::UnexpectedEof { buffered: self.scanned })
        }
        Ok(None)
    }

    /// Read exactly `n` bytes.
    ///
    /// Returns `Ok(None)` while fewer than `n` bytes are buffered.
    pub fn read_exact(&mut self, n: usize) -> Result<Option<BytesMut>, Error> {
        if self.buffer.len() < n {
            if self.eof {
                return Err(Error::ShortRead { have: self.buffer.len(), want: n })
            }
            return Ok(None)
        }
        self.scanned = 0;
        Ok(Some(self.buffer.split_to(n)))
    }

    /// Append bytes to the buffer.
    ///
    /// Must not be called after [`feed_eof`](StreamReader::feed_eof).
    pub fn feed_data(&mut self, data: &[u8]) {
        assert!(!self.eof, "feed_data called after feed_eof");
        self.buffer.extend_from_slice(data)
    }

    /// Mark the end of the stream. Idempotent.
    pub fn feed_eof(&mut self) {
        self.eof = true
    }

    /// Has the stream ended with all buffered data consumed?
    pub fn at_eof(&self) -> bool {
        self.eof && self.buffer.is_empty()
    }

    /// The number of unread bytes currently buffered.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Take the unread residue out of the reader.
    pub fn take_buffer(&mut self) -> BytesMut {
        self.scanned = 0;
        self.buffer.split()
    }
}

/// Errors raised when the stream ends before a read is satisfied.
///
/// Both are terminal for the read that raised them.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// The stream ended before the line delimiter was seen.
    #[error("stream ends after {buffered} bytes, before end of line")]
    UnexpectedEof {
        /// Bytes buffered without a terminator when the stream ended.
        buffered: usize
    },

    /// The stream ended before an exact-length read was satisfied.
    #[error("stream ends after {have} bytes, expected {want} bytes")]
    ShortRead {
        /// Bytes available.
        have: usize,
        /// Bytes requested.
        want: usize
    }
}
