// Copyright (c) 2019 Parity Technologies (UK) Ltd.
//
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. All files in the project carrying such notice may not be copied,
// modified, or distributed except according to those terms.

//! An implementation of the [RFC 6455][rfc6455] websocket protocol as a
//! sans-I/O state machine.
//!
//! The crate owns no sockets, timers or event loops. A [`Connection`]
//! consumes arbitrary-sized chunks of inbound bytes via
//! [`receive_data`][Connection::receive_data] and produces outbound bytes
//! via [`bytes_to_send`][Connection::bytes_to_send] together with
//! [`Event`]s describing what happened. Transport, TLS and per-connection
//! scheduling are the host's business, which makes the same protocol core
//! usable from blocking, async or test code alike.
//!
//! # Basic usage
//!
//! ```
//! use presa::{Connection, Event, handshake};
//!
//! // Configure and start the client handshake.
//! let mut conn = Connection::client(handshake::Client::new("server.example.com", "/chat"));
//! conn.initiate().unwrap();
//!
//! // Write these bytes to your transport ...
//! let _outbound = conn.bytes_to_send();
//!
//! // ... feed whatever the transport delivers back in, in any chunking ...
//! // conn.receive_data(&chunk);
//!
//! // ... and act on the events that fall out.
//! for event in conn.events_received() {
//!     match event {
//!         Event::HandshakeCompleted { .. } => { /* open for business */ }
//!         Event::TextMessage(_text) => { /* ... */ }
//!         _ => {}
//!     }
//! }
//! ```
//!
//! [rfc6455]: https://tools.ietf.org/html/rfc6455

#![deny(missing_docs)]

pub mod base;
pub mod connection;
pub mod data;
pub mod extension;
pub mod handshake;
pub mod http;
pub mod stream;

mod utf8;

pub use connection::{Builder, Connection, Mode, State};
pub use data::{ByteSlice125, Event};
pub use stream::StreamReader;

/// A boxed error, as produced by extensions.
pub type BoxedError = Box<dyn std::error::Error + Send + Sync + 'static>;
