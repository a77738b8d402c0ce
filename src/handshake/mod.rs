// Copyright (c) 2019 Parity Technologies (UK) Ltd.
//
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. All files in the project carrying such notice may not be copied,
// modified, or distributed except according to those terms.

//! Websocket [handshake] negotiation.
//!
//! [`client::Client`] builds the upgrade request and validates the
//! server's answer; [`server::Server`] validates an upgrade request and
//! builds the answer. Both operate on the [`http`](crate::http) value
//! types and perform no I/O.
//!
//! [handshake]: https://tools.ietf.org/html/rfc6455#section-4

pub mod client;
pub mod server;

use base64::encode as base64_encode;
use crate::extension::{Extension, Param};
use crate::http::Headers;
use sha1::{Digest, Sha1};

pub use client::{Client, ServerResponse};
pub use server::Server;

// Defined in RFC 6455 and used to generate the `Sec-WebSocket-Accept`
// header in the server handshake response.
const KEY: &[u8] = b"258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

// Some HTTP headers we need to look at during negotiation.
const SEC_WEBSOCKET_EXTENSIONS: &str = "Sec-WebSocket-Extensions";
const SEC_WEBSOCKET_PROTOCOL: &str = "Sec-WebSocket-Protocol";

/// Compute the `Sec-WebSocket-Accept` value for a request nonce.
pub fn accept_key(key: &str) -> String {
    let mut digest = Sha1::new();
    digest.update(key.as_bytes());
    digest.update(KEY);
    base64_encode(digest.finalize())
}

/// Check that the first header with the given name has the expected value
/// (ASCII case-insensitive).
fn expect_ascii_header(headers: &Headers, name: &str, expected: &str) -> Result<(), Error> {
    with_first_header(headers, name, |value| {
        if value.eq_ignore_ascii_case(expected) {
            Ok(())
        } else {
            Err(Error::UnexpectedHeader(name.into()))
        }
    })
}

/// Check that a header with the given name contains the expected token in
/// its comma-separated value list.
fn expect_token_header(headers: &Headers, name: &str, token: &str) -> Result<(), Error> {
    if headers.get(name).is_none() {
        return Err(Error::HeaderNotFound(name.into()))
    }
    if headers.contains_token(name, token) {
        Ok(())
    } else {
        Err(Error::UnexpectedHeader(name.into()))
    }
}

/// Pick the first header with the given name and apply the given closure
/// to its value.
fn with_first_header<F, R>(headers: &Headers, name: &str, f: F) -> Result<R, Error>
where
    F: FnOnce(&str) -> Result<R, Error>
{
    match headers.get(name) {
        Some(value) => f(value),
        None => Err(Error::HeaderNotFound(name.into()))
    }
}

/// Configure registered extensions from a `Sec-WebSocket-Extensions`
/// header value.
///
/// Offers are matched by name; parameters are handed to
/// [`Extension::configure`]. With `reject_unknown` an offer naming no
/// registered extension is an error (a client must not see extensions it
/// never asked for), otherwise it is skipped.
fn configure_extensions(
    extensions: &mut [Box<dyn Extension + Send>],
    line: &str,
    reject_unknown: bool
) -> Result<(), Error> {
    for offer in line.split(',') {
        let mut parts = offer.split(';');
        let name = parts.next().unwrap_or("").trim();
        if name.is_empty() {
            continue
        }
        match extensions.iter_mut().find(|e| e.name().eq_ignore_ascii_case(name)) {
            Some(ext) => {
                let mut params = Vec::new();
                for p in parts {
                    let p = p.trim();
                    if p.is_empty() {
                        continue
                    }
                    let mut kv = p.splitn(2, '=');
                    let key = kv.next().unwrap_or("").trim();
                    let mut param = Param::new(key);
                    if let Some(value) = kv.next() {
                        param.set_value(Some(value.trim().trim_matches('"').into()));
                    }
                    params.push(param)
                }
                log::trace!("configuring extension: {}", name);
                ext.configure(&params).map_err(Error::Extension)?
            }
            None if reject_unknown => return Err(Error::UnsolicitedExtension),
            None => log::debug!("ignoring unknown extension: {}", name)
        }
    }
    Ok(())
}

/// Append a `Sec-WebSocket-Extensions` header listing the given
/// extensions, if there are any.
fn append_extensions<'a, I>(extensions: I, headers: &mut Headers)
where
    I: IntoIterator<Item = &'a Box<dyn Extension + Send>>
{
    let mut value = String::new();
    for e in extensions {
        if !value.is_empty() {
            value.push_str(", ")
        }
        value.push_str(e.name());
        for p in e.params() {
            value.push_str("; ");
            value.push_str(&p.to_string())
        }
    }
    if !value.is_empty() {
        headers.append(SEC_WEBSOCKET_EXTENSIONS, value);
    }
}

/// Enumeration of possible handshake errors.
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The HTTP entity could not be parsed successfully.
    #[error("http parser error: {0}")]
    Http(#[from] crate::http::Error),

    /// An HTTP header was not present.
    #[error("header {0} not found")]
    HeaderNotFound(String),

    /// An HTTP header had an unexpected value.
    #[error("header {0} had unexpected value")]
    UnexpectedHeader(String),

    /// The `Sec-WebSocket-Accept` header value did not match.
    #[error("websocket key mismatch")]
    InvalidSecWebSocketAccept,

    /// The `Sec-WebSocket-Version` was not 13.
    #[error("unsupported websocket version: {0}")]
    UnsupportedWebSocketVersion(String),

    /// The request `Origin` was not in the allowed set.
    #[error("origin {0} is not allowed")]
    UnacceptableOrigin(String),

    /// The server returned an extension we did not ask for.
    #[error("unsolicited extension returned")]
    UnsolicitedExtension,

    /// The server returned a protocol we did not ask for.
    #[error("unsolicited protocol returned")]
    UnsolicitedProtocol,

    /// An extension produced an error during negotiation.
    #[error("extension error: {0}")]
    Extension(#[source] crate::BoxedError)
}
