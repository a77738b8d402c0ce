// Copyright (c) 2019 Parity Technologies (UK) Ltd.
//
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. All files in the project carrying such notice may not be copied,
// modified, or distributed except according to those terms.

//! Websocket client [handshake].
//!
//! [handshake]: https://tools.ietf.org/html/rfc6455#section-4.1

use crate::extension::Extension;
use crate::http::{Headers, Request, Response};
use rand::Rng;
use smallvec::SmallVec;
use std::borrow::Cow;
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

/// Websocket client handshake.
#[derive(Debug)]
pub struct Client<'a> {
    /// The HTTP host to send the handshake to.
    host: Cow<'a, str>,
    /// The HTTP resource to request.
    resource: Cow<'a, str>,
    /// The HTTP origin header.
    origin: Option<Cow<'a, str>>,
    /// The user agent header to include in the request.
    user_agent: Option<Cow<'a, str>>,
    /// The base64-encoded request nonce.
    nonce: String,
    /// The protocols to include in the handshake.
    protocols: SmallVec<[Cow<'a, str>; 4]>,
    /// The extensions the client wishes to include in the request.
    extensions: SmallVec<[Box<dyn Extension + Send>; 4]>
}

impl<'a> Client<'a> {
    /// Create a new client handshake for some host and resource.
    pub fn new(host: impl Into<Cow<'a, str>>, resource: impl Into<Cow<'a, str>>) -> Self {
        let mut buf = [0; 16];
        rand::thread_rng().fill(&mut buf[..]);
        Client {
            host: host.into(),
            resource: resource.into(),
            origin: None,
            user_agent: None,
            nonce: base64::encode(&buf),
            protocols: SmallVec::new(),
            extensions: SmallVec::new()
        }
    }

    /// The nonce sent as `Sec-WebSocket-Key`.
    pub fn ws_key(&self) -> &str {
        &self.nonce
    }

    /// Set the handshake origin header.
    pub fn set_origin(&mut self, origin: impl Into<Cow<'a, str>>) -> &mut Self {
        self.origin = Some(origin.into());
        self
    }

    /// Set the user agent header to send with the request.
    pub fn set_user_agent(&mut self, agent: impl Into<Cow<'a, str>>) -> &mut Self {
        self.user_agent = Some(agent.into());
        self
    }

    /// Add a protocol to offer in the handshake.
    pub fn add_protocol(&mut self, proto: impl Into<Cow<'a, str>>) -> &mut Self {
        self.protocols.push(proto.into());
        self
    }

    /// Add an extension to offer in the handshake.
    pub fn add_extension(&mut self, ext: Box<dyn Extension + Send>) -> &mut Self {
        self.extensions.push(ext);
        self
    }

    /// Take the extensions out of this handshake.
    pub(crate) fn take_extensions(&mut self) -> SmallVec<[Box<dyn Extension + Send>; 4]> {
        std::mem::take(&mut self.extensions)
    }

    /// Build the upgrade request to send to the server.
    pub fn request(&self) -> Request {
        let mut headers = Headers::new();
        headers.append("Host", self.host.to_string());
        headers.append("Upgrade", "websocket");
        headers.append("Connection", "Upgrade");
        headers.append("Sec-WebSocket-Key", self.nonce.clone());
        if let Some(origin) = &self.origin {
            headers.append("Origin", origin.to_string());
        }
        if let Some(agent) = &self.user_agent {
            headers.append("User-Agent", agent.to_string());
        }
        if !self.protocols.is_empty() {
            headers.append(SEC_WEBSOCKET_PROTOCOL, self.protocols.join(", "));
        }
        append_extensions(self.extensions.iter(), &mut headers);
        headers.append("Sec-WebSocket-Version", "13");
        Request::new(self.resource.to_string(), headers)
    }

    /// Validate the server's answer to the upgrade request.
    ///
    /// A redirect or a plain rejection is not an error; it is reported as
    /// the corresponding [`ServerResponse`] variant and following the
    /// location of a redirect is left to the caller.
    pub fn receive_response(&mut self, response: &Response) -> Result<ServerResponse, Error> {
        match response.status_code() {
            101 => {}
            code @ 301 ..= 303 | code @ 307 | code @ 308 => {
                let location = with_first_header(response.headers(), "Location", |loc| {
                    Ok(String::from(loc))
                })?;
                log::debug!("handshake redirected to {}", location);
                return Ok(ServerResponse::Redirect { status_code: code, location })
            }
            code => {
                log::debug!("handshake rejected with status {}", code);
                return Ok(ServerResponse::Rejected { status_code: code })
            }
        }

        expect_ascii_header(response.headers(), "Upgrade", "websocket")?;
        expect_token_header(response.headers(), "Connection", "Upgrade")?;

        let ours = accept_key(&self.nonce);
        with_first_header(response.headers(), "Sec-WebSocket-Accept", |theirs| {
            if theirs.trim() != ours {
                return Err(Error::InvalidSecWebSocketAccept)
            }
            Ok(())
        })?;

        // The server may only pick extensions we offered.
        for line in response.headers().get_all(SEC_WEBSOCKET_EXTENSIONS) {
            configure_extensions(&mut self.extensions, line, true)?
        }

        // The server may only pick a protocol we offered.
        let mut protocol = None;
        if let Some(theirs) = response.headers().get(SEC_WEBSOCKET_PROTOCOL) {
            match self.protocols.iter().find(|p| p.as_ref() == theirs.trim()) {
                Some(p) => protocol = Some(p.to_string()),
                None => return Err(Error::UnsolicitedProtocol)
            }
        }

        Ok(ServerResponse::Accepted { protocol })
    }
}

/// Handshake response received from the server.
#[derive(Debug)]
pub enum ServerResponse {
    /// The server has accepted our request.
    Accepted {
        /// The protocol (if any) the server has selected.
        protocol: Option<String>
    },
    /// The server is redirecting us to some other location.
    Redirect {
        /// The HTTP response status code.
        status_code: u16,
        /// The location URL we should go to.
        location: String
    },
    /// The server rejected our request.
    Rejected {
        /// HTTP response status code.
        status_code: u16
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use crate::http::{Headers, Response};
    use super::super::{Error, accept_key};
    use super::{Client, ServerResponse};

    fn accepted_response(client: &Client) -> Response {
        let mut headers = Headers::new();
        headers
            .append("Upgrade", "websocket")
            .append("Connection", "Upgrade")
            .append("Sec-WebSocket-Accept", accept_key(client.ws_key()));
        Response::new(101, "Switching Protocols", headers)
    }

    #[test]
    fn request_has_the_required_headers() {
        let mut client = Client::new("server.example.com", "/chat");
        client.set_origin("http://example.com");
        client.add_protocol("chat");
        let request = client.request();
        assert_eq!(request.path(), "/chat");
        let headers = request.headers();
        assert_eq!(headers.get("Host"), Some("server.example.com"));
        assert_eq!(headers.get("Upgrade"), Some("websocket"));
        assert_eq!(headers.get("Connection"), Some("Upgrade"));
        assert_eq!(headers.get("Sec-WebSocket-Version"), Some("13"));
        assert_eq!(headers.get("Sec-WebSocket-Protocol"), Some("chat"));
        assert_eq!(headers.get("Origin"), Some("http://example.com"));
        assert_eq!(headers.get("Sec-WebSocket-Key"), Some(client.ws_key()));
        assert_eq!(base64::decode(client.ws_key()).unwrap().len(), 16);
    }

    #[test]
    fn accepts_valid_response() {
        let mut client = Client::new("localhost", "/");
        let response = accepted_response(&client);
        assert_matches!(
            client.receive_response(&response),
            Ok(ServerResponse::Accepted { protocol: None })
        );
    }

    #[test]
    fn rejects_wrong_accept_key() {
        let mut client = Client::new("localhost", "/");
        let mut headers = Headers::new();
        headers
            .append("Upgrade", "websocket")
            .append("Connection", "Upgrade")
            .append("Sec-WebSocket-Accept", "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=");
        let response = Response::new(101, "Switching Protocols", headers);
        assert_matches!(
            client.receive_response(&response),
            Err(Error::InvalidSecWebSocketAccept)
        );
    }

    #[test]
    fn rejects_missing_upgrade_header() {
        let mut client = Client::new("localhost", "/");
        let mut headers = Headers::new();
        headers
            .append("Connection", "Upgrade")
            .append("Sec-WebSocket-Accept", accept_key(client.ws_key()));
        let response = Response::new(101, "Switching Protocols", headers);
        assert_matches!(client.receive_response(&response), Err(Error::HeaderNotFound(_)));
    }

    #[test]
    fn rejects_unsolicited_protocol() {
        let mut client = Client::new("localhost", "/");
        let mut response = accepted_response(&client);
        response.headers_mut().append("Sec-WebSocket-Protocol", "superchat");
        assert_matches!(client.receive_response(&response), Err(Error::UnsolicitedProtocol));
    }

    #[test]
    fn accepts_offered_protocol() {
        let mut client = Client::new("localhost", "/");
        client.add_protocol("chat");
        let mut response = accepted_response(&client);
        response.headers_mut().append("Sec-WebSocket-Protocol", "chat");
        assert_matches!(
            client.receive_response(&response),
            Ok(ServerResponse::Accepted { protocol: Some(p) }) if p == "chat"
        );
    }

    #[test]
    fn rejects_unsolicited_extension() {
        let mut client = Client::new("localhost", "/");
        let mut response = accepted_response(&client);
        response.headers_mut().append("Sec-WebSocket-Extensions", "x-snappy");
        assert_matches!(client.receive_response(&response), Err(Error::UnsolicitedExtension));
    }

    #[test]
    fn surfaces_redirects() {
        let mut client = Client::new("localhost", "/");
        let mut headers = Headers::new();
        headers.append("Location", "wss://other.example.com/");
        let response = Response::new(302, "Found", headers);
        assert_matches!(
            client.receive_response(&response),
            Ok(ServerResponse::Redirect { status_code: 302, location }) if location == "wss://other.example.com/"
        );
    }

    #[test]
    fn surfaces_rejections() {
        let mut client = Client::new("localhost", "/");
        let response = Response::new(403, "Forbidden", Headers::new());
        assert_matches!(
            client.receive_response(&response),
            Ok(ServerResponse::Rejected { status_code: 403 })
        );
    }
}
