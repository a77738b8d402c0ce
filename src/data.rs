// Copyright (c) 2019 Parity Technologies (UK) Ltd.
//
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. All files in the project carrying such notice may not be copied,
// modified, or distributed except according to those terms.

//! Value types crossing the connection boundary.
//!
//! [`Event`] values are produced when receiving data and drained by the
//! host through [`Connection::events_received`]; [`ByteSlice125`] caps the
//! payload of outgoing PING/PONG control frames at the type level.
//!
//! [`Connection::events_received`]: crate::connection::Connection::events_received

use bytes::BytesMut;
use crate::http::Request;
use std::{convert::TryFrom, fmt};

/// Something that happened on the connection, in arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// The opening handshake finished successfully.
    HandshakeCompleted {
        /// The subprotocol selected during the handshake, if any.
        protocol: Option<String>
    },

    /// A handshake request arrived (server mode).
    ///
    /// The host inspects it and answers with [`Connection::accept`] or
    /// [`Connection::reject`].
    ///
    /// [`Connection::accept`]: crate::connection::Connection::accept
    /// [`Connection::reject`]: crate::connection::Connection::reject
    RequestReceived(Request),

    /// A complete text message, reassembled from its fragments.
    TextMessage(String),

    /// A complete binary message, reassembled from its fragments.
    BinaryMessage(BytesMut),

    /// A PING control frame and its application data.
    PingReceived(BytesMut),

    /// A PONG control frame and its application data.
    PongReceived(BytesMut),

    /// The peer sent a CLOSE frame.
    CloseReceived {
        /// The close code, if the payload carried one.
        code: Option<u16>,
        /// The close reason.
        reason: String
    },

    /// The connection reached its final state.
    ///
    /// `was_clean` is `true` only if the close handshake completed.
    ConnectionClosed {
        /// The close code, if one was exchanged.
        code: Option<u16>,
        /// The close reason or failure description.
        reason: String,
        /// Did the close handshake complete?
        was_clean: bool
    }
}

/// A byte slice of at most 125 bytes, the payload limit of control frames.
#[derive(Debug, Clone, Copy)]
pub struct ByteSlice125<'a>(&'a [u8]);

/// An error indicating a slice of length greater than 125 bytes.
#[derive(Debug, Clone, Copy)]
pub struct SliceTooLarge(());

impl fmt::Display for SliceTooLarge {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("slice larger than 125 bytes")
    }
}

impl std::error::Error for SliceTooLarge {}

impl<'a> TryFrom<&'a [u8]> for ByteSlice125<'a> {
    type Error = SliceTooLarge;

    fn try_from(value: &'a [u8]) -> Result<Self, Self::Error> {
        if value.len() > crate::base::MAX_CTRL_PAYLOAD {
            Err(SliceTooLarge(()))
        } else {
            Ok(ByteSlice125(value))
        }
    }
}

impl AsRef<[u8]> for ByteSlice125<'_> {
    fn as_ref(&self) -> &[u8] {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use std::convert::TryFrom;
    use super::ByteSlice125;

    #[test]
    fn byte_slice_125() {
        assert!(ByteSlice125::try_from(&[0_u8; 125][..]).is_ok());
        assert!(ByteSlice125::try_from(&[][..]).is_ok());
        assert!(ByteSlice125::try_from(&[0_u8; 126][..]).is_err());
    }
}
