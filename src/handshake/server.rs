// Copyright (c) 2019 Parity Technologies (UK) Ltd.
//
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. All files in the project carrying such notice may not be copied,
// modified, or distributed except according to those terms.

//! Websocket server [handshake].
//!
//! [handshake]: https://tools.ietf.org/html/rfc6455#section-4.2

use crate::extension::Extension;
use crate::http::{Headers, Request, Response};
use http::StatusCode;
use smallvec::SmallVec;
use std::{borrow::Cow, fmt};
use super::{
    Error,
    SEC_WEBSOCKET_EXTENSIONS,
    SEC_WEBSOCKET_PROTOCOL,
    accept_key,
    append_extensions,
    configure_extensions,
    expect_ascii_header,
    expect_token_header,
    with_first_header
};

/// Picks at most one of the client's protocol offers.
///
/// Arguments are the client's offers and the server's supported protocols,
/// both in declaration order.
pub type ProtocolSelector = Box<dyn Fn(&[&str], &[&str]) -> Option<String> + Send>;

/// Websocket server handshake.
pub struct Server<'a> {
    /// Protocols the server supports.
    protocols: SmallVec<[Cow<'a, str>; 4]>,
    /// Extensions the server supports.
    extensions: SmallVec<[Box<dyn Extension + Send>; 4]>,
    /// Origins the server accepts (`None` accepts every origin).
    origins: Option<SmallVec<[Cow<'a, str>; 4]>>,
    /// Value of the `Server` header to include in responses.
    server_header: Option<Cow<'a, str>>,
    /// Custom subprotocol selection, if the default is not wanted.
    selector: Option<ProtocolSelector>
}

impl fmt::Debug for Server<'_> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Server")
            .field("protocols", &self.protocols)
            .field("extensions", &self.extensions)
            .field("origins", &self.origins)
            .field("server_header", &self.server_header)
            .finish()
    }
}

impl<'a> Server<'a> {
    /// Create a new server handshake.
    pub fn new() -> Self {
        Server {
            protocols: SmallVec::new(),
            extensions: SmallVec::new(),
            origins: None,
            server_header: None,
            selector: None
        }
    }

    /// Add a protocol the server supports.
    pub fn add_protocol(&mut self, proto: impl Into<Cow<'a, str>>) -> &mut Self {
        self.protocols.push(proto.into());
        self
    }

    /// Add an extension the server supports.
    pub fn add_extension(&mut self, ext: Box<dyn Extension + Send>) -> &mut Self {
        self.extensions.push(ext);
        self
    }

    /// Restrict the accepted `Origin` values.
    ///
    /// Requests without an `Origin` header, or with one not in this set,
    /// will be refused. Without a restriction every origin is accepted.
    pub fn restrict_origins<I>(&mut self, origins: I) -> &mut Self
    where
        I: IntoIterator,
        I::Item: Into<Cow<'a, str>>
    {
        self.origins = Some(origins.into_iter().map(Into::into).collect());
        self
    }

    /// Set the `Server` header to include in responses.
    pub fn set_server_header(&mut self, value: impl Into<Cow<'a, str>>) -> &mut Self {
        self.server_header = Some(value.into());
        self
    }

    /// Replace the default subprotocol selection (first client offer the
    /// server supports) with a custom one.
    pub fn set_protocol_selector(&mut self, selector: ProtocolSelector) -> &mut Self {
        self.selector = Some(selector);
        self
    }

    /// Take the extensions out of this handshake.
    pub(crate) fn take_extensions(&mut self) -> SmallVec<[Box<dyn Extension + Send>; 4]> {
        std::mem::take(&mut self.extensions)
    }

    /// Validate an upgrade request and build the `101 Switching Protocols`
    /// answer for it.
    ///
    /// Extensions are negotiated left-to-right, a subprotocol is selected
    /// with the configured selector.
    pub fn accept(&mut self, request: &Request) -> Result<Response, Error> {
        with_first_header(request.headers(), "Host", |_| Ok(()))?;
        expect_ascii_header(request.headers(), "Upgrade", "websocket")?;
        expect_token_header(request.headers(), "Connection", "Upgrade")?;
        with_first_header(request.headers(), "Sec-WebSocket-Version", |version| {
            if version.trim() == "13" {
                Ok(())
            } else {
                Err(Error::UnsupportedWebSocketVersion(version.into()))
            }
        })?;

        if let Some(allowed) = &self.origins {
            let origin = with_first_header(request.headers(), "Origin", |o| Ok(String::from(o)))?;
            if !allowed.iter().any(|a| a.eq_ignore_ascii_case(&origin)) {
                return Err(Error::UnacceptableOrigin(origin))
            }
        }

        let ws_key = with_first_header(request.headers(), "Sec-WebSocket-Key", |k| {
            Ok(String::from(k.trim()))
        })?;

        for line in request.headers().get_all(SEC_WEBSOCKET_EXTENSIONS) {
            configure_extensions(&mut self.extensions, line, false)?
        }

        let offers: Vec<&str> = request.headers()
            .get_all(SEC_WEBSOCKET_PROTOCOL)
            .flat_map(|v| v.split(','))
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .collect();
        let supported: Vec<&str> = self.protocols.iter().map(|p| p.as_ref()).collect();
        let protocol = match &self.selector {
            Some(select) => select(&offers, &supported),
            None => offers.iter()
                .find(|o| supported.iter().any(|s| s.eq_ignore_ascii_case(o)))
                .map(|p| String::from(*p))
        };

        let mut headers = Headers::new();
        if let Some(server) = &self.server_header {
            headers.append("Server", server.to_string());
        }
        headers.append("Upgrade", "websocket");
        headers.append("Connection", "Upgrade");
        headers.append("Sec-WebSocket-Accept", accept_key(&ws_key));
        if let Some(proto) = &protocol {
            headers.append(SEC_WEBSOCKET_PROTOCOL, proto.clone());
        }
        append_extensions(self.extensions.iter().filter(|e| e.is_enabled()), &mut headers);

        Ok(Response::new(101, "Switching Protocols", headers))
    }

    /// Build an error response refusing the handshake.
    ///
    /// Unknown status codes fall back to `500`.
    pub fn reject(&self, status_code: u16) -> Response {
        let status = StatusCode::from_u16(status_code)
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let reason = status.canonical_reason().unwrap_or("N/A");
        let mut headers = Headers::new();
        if let Some(server) = &self.server_header {
            headers.append("Server", server.to_string());
        }
        Response::new(status.as_u16(), reason, headers)
    }
}

impl Default for Server<'_> {
    fn default() -> Self {
        Server::new()
    }
}
