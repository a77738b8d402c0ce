// Copyright (c) 2019 Parity Technologies (UK) Ltd.
//
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. All files in the project carrying such notice may not be copied,
// modified, or distributed except according to those terms.

//! HTTP/1.1 codec for the websocket [handshake].
//!
//! Only the fraction of HTTP/1.1 that can occur during a websocket opening
//! handshake is supported: `GET` requests and responses with an optional
//! `Content-Length` delimited body. The grammar is strict and malformed
//! input is rejected with an error naming the offending part.
//!
//! The parsers are driven by a [`StreamReader`] and are resumable: they
//! return `Ok(None)` when they run out of input and continue where they
//! left off on the next call.
//!
//! [handshake]: https://tools.ietf.org/html/rfc6455#section-1.3

use bytes::BytesMut;
use crate::stream::StreamReader;
use smallvec::SmallVec;
use std::{fmt, mem};

/// Default maximum length of a header line, CRLF included.
pub const MAX_HEADER_LINE: usize = 4096;

/// Default maximum number of header fields in one header block.
pub const MAX_HEADERS: usize = 256;

// Headers ////////////////////////////////////////////////////////////////////////////////////////

/// An ordered multi-map of HTTP header fields.
///
/// Iteration preserves insertion order, lookup by name is case-insensitive
/// and returns the first match, and repeated names (e.g. `Set-Cookie`) are
/// kept as separate entries.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers {
    fields: SmallVec<[(String, String); 8]>
}

impl Headers {
    /// Create an empty header map.
    pub fn new() -> Self {
        Headers::default()
    }

    /// The number of header fields.
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// Is the header map empty?
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Append a field, keeping any existing fields with the same name.
    pub fn append(&mut self, name: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.fields.push((name.into(), value.into()));
        self
    }

    /// The value of the first field with the given name, if any.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.fields.iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// All values of fields with the given name, in insertion order.
    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.fields.iter()
            .filter(move |(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Does any field with the given name contain `token` in its
    /// comma-separated value list?
    pub fn contains_token(&self, name: &str, token: &str) -> bool {
        self.get_all(name)
            .flat_map(|v| v.split(','))
            .any(|t| t.trim_matches(|c| c == ' ' || c == '\t').eq_ignore_ascii_case(token))
    }

    /// Iterate over all `(name, value)` pairs in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.fields.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    fn encode(&self, buf: &mut BytesMut) {
        for (name, value) in self.iter() {
            buf.extend_from_slice(name.as_bytes());
            buf.extend_from_slice(b": ");
            buf.extend_from_slice(value.as_bytes());
            buf.extend_from_slice(b"\r\n")
        }
    }
}

// Request ////////////////////////////////////////////////////////////////////////////////////////

/// A websocket handshake request.
///
/// The path is the raw request target as received, without normalization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    path: String,
    headers: Headers
}

impl Request {
    /// Create a new `GET` request for the given target.
    pub fn new(path: impl Into<String>, headers: Headers) -> Self {
        Request { path: path.into(), headers }
    }

    /// The raw request target.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// The request headers.
    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// Mutable access to the request headers.
    pub fn headers_mut(&mut self) -> &mut Headers {
        &mut self.headers
    }

    /// Serialize the request. Headers are written verbatim, in order;
    /// nothing is injected.
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.extend_from_slice(b"GET ");
        buf.extend_from_slice(self.path.as_bytes());
        buf.extend_from_slice(b" HTTP/1.1\r\n");
        self.headers.encode(buf);
        buf.extend_from_slice(b"\r\n")
    }
}

// Response ///////////////////////////////////////////////////////////////////////////////////////

/// A websocket handshake response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    status_code: u16,
    reason: String,
    headers: Headers,
    body: Option<Vec<u8>>
}

impl Response {
    /// Create a new response without a body.
    pub fn new(status_code: u16, reason: impl Into<String>, headers: Headers) -> Self {
        Response { status_code, reason: reason.into(), headers, body: None }
    }

    /// The response status code.
    pub fn status_code(&self) -> u16 {
        self.status_code
    }

    /// The reason phrase.
    pub fn reason(&self) -> &str {
        &self.reason
    }

    /// The response headers.
    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// Mutable access to the response headers.
    pub fn headers_mut(&mut self) -> &mut Headers {
        &mut self.headers
    }

    /// The response body, if one was present.
    pub fn body(&self) -> Option<&[u8]> {
        self.body.as_deref()
    }

    /// Attach a body. The caller is responsible for a matching
    /// `Content-Length` header; nothing is injected.
    pub fn set_body(&mut self, body: Vec<u8>) -> &mut Self {
        self.body = Some(body);
        self
    }

    /// Serialize the response, including the body bytes if present.
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.extend_from_slice(b"HTTP/1.1 ");
        buf.extend_from_slice(self.status_code.to_string().as_bytes());
        buf.extend_from_slice(b" ");
        buf.extend_from_slice(self.reason.as_bytes());
        buf.extend_from_slice(b"\r\n");
        self.headers.encode(buf);
        buf.extend_from_slice(b"\r\n");
        if let Some(body) = &self.body {
            buf.extend_from_slice(body)
        }
    }
}

// Parsing ////////////////////////////////////////////////////////////////////////////////////////

/// Resumable parser for one header block.
#[derive(Debug)]
pub struct HeaderParser {
    headers: Headers,
    max_line: usize,
    max_headers: usize
}

impl Default for HeaderParser {
    fn default() -> Self {
        HeaderParser::with_limits(MAX_HEADER_LINE, MAX_HEADERS)
    }
}

impl HeaderParser {
    /// Create a parser with the default security limits.
    pub fn new() -> Self {
        HeaderParser::default()
    }

    /// Create a parser with custom security limits.
    pub fn with_limits(max_line: usize, max_headers: usize) -> Self {
        HeaderParser { headers: Headers::new(), max_line, max_headers }
    }

    /// Parse header lines until the empty CRLF terminator line.
    ///
    /// Returns `Ok(None)` when more input is required.
    pub fn parse(&mut self, reader: &mut StreamReader) -> Result<Option<Headers>, Error> {
        loop {
            let line = match parse_line(reader, self.max_line)? {
                Some(line) => line,
                None => return Ok(None)
            };
            if line.is_empty() {
                return Ok(Some(mem::take(&mut self.headers)))
            }
            if self.headers.len() == self.max_headers {
                return Err(Error::TooManyHeaders(self.max_headers))
            }
            let (name, value) = parse_header_line(&line)?;
            self.headers.append(name, value);
        }
    }
}

/// Resumable parser for a handshake request.
#[derive(Debug)]
pub struct RequestParser {
    max_line: usize,
    max_headers: usize,
    state: RequestState
}

#[derive(Debug)]
enum RequestState {
    Line,
    Fields { path: String, fields: HeaderParser }
}

impl Default for RequestParser {
    fn default() -> Self {
        RequestParser::with_limits(MAX_HEADER_LINE, MAX_HEADERS)
    }
}

impl RequestParser {
    /// Create a parser with the default security limits.
    pub fn new() -> Self {
        RequestParser::default()
    }

    /// Create a parser with custom security limits.
    pub fn with_limits(max_line: usize, max_headers: usize) -> Self {
        RequestParser { max_line, max_headers, state: RequestState::Line }
    }

    /// Parse a request, suspending with `Ok(None)` while input is missing.
    pub fn parse(&mut self, reader: &mut StreamReader) -> Result<Option<Request>, Error> {
        loop {
            match &mut self.state {
                RequestState::Line => {
                    let line = match parse_line(reader, self.max_line) {
                        Ok(Some(line)) => line,
                        Ok(None) => return Ok(None),
                        // Any end of stream here means the peer hung up
                        // before sending a complete request line.
                        Err(e) if e.is_eof() => return Err(Error::EofAwaitingRequestLine),
                        Err(e) => return Err(e)
                    };
                    let path = parse_request_line(&line)?;
                    let fields = HeaderParser::with_limits(self.max_line, self.max_headers);
                    self.state = RequestState::Fields { path, fields }
                }
                RequestState::Fields { path, fields } => {
                    match fields.parse(reader)? {
                        Some(headers) => {
                            let request = Request { path: mem::take(path), headers };
                            self.state = RequestState::Line;
                            return Ok(Some(request))
                        }
                        None => return Ok(None)
                    }
                }
            }
        }
    }
}

/// Resumable parser for a handshake response.
#[derive(Debug)]
pub struct ResponseParser {
    max_line: usize,
    max_headers: usize,
    state: ResponseState
}

#[derive(Debug)]
enum ResponseState {
    Line,
    Fields { status_code: u16, reason: String, fields: HeaderParser },
    Body { status_code: u16, reason: String, headers: Headers, length: usize }
}

impl Default for ResponseParser {
    fn default() -> Self {
        ResponseParser::with_limits(MAX_HEADER_LINE, MAX_HEADERS)
    }
}

impl ResponseParser {
    /// Create a parser with the default security limits.
    pub fn new() -> Self {
        ResponseParser::default()
    }

    /// Create a parser with custom security limits.
    pub fn with_limits(max_line: usize, max_headers: usize) -> Self {
        ResponseParser { max_line, max_headers, state: ResponseState::Line }
    }

    /// Parse a response, suspending with `Ok(None)` while input is missing.
    ///
    /// A body is read only if the response carries a `Content-Length`
    /// header; the handshake success response never does.
    pub fn parse(&mut self, reader: &mut StreamReader) -> Result<Option<Response>, Error> {
        loop {
            match &mut self.state {
                ResponseState::Line => {
                    let line = match parse_line(reader, self.max_line) {
                        Ok(Some(line)) => line,
                        Ok(None) => return Ok(None),
                        Err(e) if e.is_eof() => return Err(Error::EofAwaitingStatusLine),
                        Err(e) => return Err(e)
                    };
                    let (status_code, reason) = parse_status_line(&line)?;
                    let fields = HeaderParser::with_limits(self.max_line, self.max_headers);
                    self.state = ResponseState::Fields { status_code, reason, fields }
                }
                ResponseState::Fields { status_code, reason, fields } => {
                    let headers = match fields.parse(reader)? {
                        Some(headers) => headers,
                        None => return Ok(None)
                    };
                    let status_code = *status_code;
                    let reason = mem::take(reason);
                    match headers.get("Content-Length") {
                        Some(v) => {
                            let length = v.parse::<usize>()
                                .map_err(|_| Error::InvalidHeaderValue(v.into()))?;
                            self.state = ResponseState::Body { status_code, reason, headers, length }
                        }
                        None => {
                            self.state = ResponseState::Line;
                            return Ok(Some(Response { status_code, reason, headers, body: None }))
                        }
                    }
                }
                ResponseState::Body { status_code, reason, headers, length } => {
                    let body = match reader.read_exact(*length)? {
                        Some(bytes) => bytes,
                        None => return Ok(None)
                    };
                    let response = Response {
                        status_code: *status_code,
                        reason: mem::take(reason),
                        headers: mem::take(headers),
                        body: Some(body.to_vec())
                    };
                    self.state = ResponseState::Line;
                    return Ok(Some(response))
                }
            }
        }
    }
}

// One CRLF-terminated line, CRLF stripped. The length cap fires as soon
// as it is exceeded, not only once a LF finally shows up.
fn parse_line(reader: &mut StreamReader, max_line: usize) -> Result<Option<BytesMut>, Error> {
    let mut line = match reader.read_line()? {
        Some(line) => line,
        None => {
            if reader.buffered() > max_line {
                return Err(Error::LineTooLong(reader.buffered()))
            }
            return Ok(None)
        }
    };
    if line.len() > max_line {
        return Err(Error::LineTooLong(line.len()))
    }
    if !line.ends_with(b"\r\n") {
        return Err(Error::LineWithoutCrlf)
    }
    line.truncate(line.len() - 2);
    Ok(Some(line))
}

fn parse_request_line(line: &[u8]) -> Result<String, Error> {
    let mut parts = line.splitn(3, |&b| b == b' ');
    let method = parts.next().unwrap_or(b"");
    let (target, version) = match (parts.next(), parts.next()) {
        (Some(t), Some(v)) => (t, v),
        _ => return Err(Error::InvalidRequestLine(lossy(line)))
    };
    if method != b"GET" {
        return Err(Error::UnsupportedMethod(lossy(method)))
    }
    if version != b"HTTP/1.1" {
        return Err(Error::UnsupportedVersion(lossy(version)))
    }
    Ok(lossy(target))
}

fn parse_status_line(line: &[u8]) -> Result<(u16, String), Error> {
    let mut parts = line.splitn(3, |&b| b == b' ');
    let version = parts.next().unwrap_or(b"");
    let (status, reason) = match (parts.next(), parts.next()) {
        (Some(s), Some(r)) => (s, r),
        _ => return Err(Error::InvalidStatusLine(lossy(line)))
    };
    if version != b"HTTP/1.1" {
        return Err(Error::UnsupportedVersion(lossy(version)))
    }
    // Exactly three ASCII digits, nothing else.
    if status.len() != 3 || !status.iter().all(u8::is_ascii_digit) {
        return Err(Error::InvalidStatusCode(lossy(status)))
    }
    let code = status.iter().fold(0_u16, |n, &d| n * 10 + u16::from(d - b'0'));
    if !(100 ..= 599).contains(&code) {
        return Err(Error::UnsupportedStatusCode(lossy(status)))
    }
    for &b in reason {
        let ok = b == b'\t' || b == b' ' || (0x21 ..= 0x7E).contains(&b) || b >= 0x80;
        if !ok {
            return Err(Error::InvalidReasonPhrase(reason.escape_ascii().to_string()))
        }
    }
    Ok((code, lossy(reason)))
}

fn parse_header_line(line: &[u8]) -> Result<(String, String), Error> {
    let colon = line.iter()
        .position(|&b| b == b':')
        .ok_or_else(|| Error::InvalidHeaderLine(lossy(line)))?;
    let (name, rest) = line.split_at(colon);
    if name.is_empty() || !name.iter().all(|&b| is_tchar(b)) {
        return Err(Error::InvalidHeaderName(lossy(name)))
    }
    let mut value = &rest[1 ..];
    while let [b' ' | b'\t', tail @ ..] = value {
        value = tail
    }
    while let [head @ .., b' ' | b'\t'] = value {
        value = head
    }
    if !value.iter().all(|&b| b == b'\t' || (0x20 ..= 0x7E).contains(&b)) {
        return Err(Error::InvalidHeaderValue(value.escape_ascii().to_string()))
    }
    Ok((lossy(name), lossy(value)))
}

// tchar of the RFC7230 `token` rule.
fn is_tchar(b: u8) -> bool {
    b.is_ascii_alphanumeric()
        || matches!(b, b'!' | b'#' | b'$' | b'%' | b'&' | b'\'' | b'*' | b'+'
            | b'-' | b'.' | b'^' | b'_' | b'`' | b'|' | b'~')
}

fn lossy(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

// Errors /////////////////////////////////////////////////////////////////////////////////////////

/// Enumeration of possible HTTP parsing errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// The stream ended in the middle of a read.
    #[error(transparent)]
    Stream(#[from] crate::stream::Error),

    /// The stream ended before a complete request line arrived.
    #[error("connection closed while reading HTTP request line")]
    EofAwaitingRequestLine,

    /// The stream ended before a complete status line arrived.
    #[error("connection closed while reading HTTP status line")]
    EofAwaitingStatusLine,

    /// A line was not terminated by CRLF.
    #[error("line without CRLF")]
    LineWithoutCrlf,

    /// The request line did not match `METHOD SP TARGET SP VERSION`.
    #[error("invalid HTTP request line: {0}")]
    InvalidRequestLine(String),

    /// The request method was not `GET`.
    #[error("unsupported HTTP method: {0}")]
    UnsupportedMethod(String),

    /// The protocol version was not `HTTP/1.1`.
    #[error("unsupported HTTP version: {0}")]
    UnsupportedVersion(String),

    /// The status line did not match `VERSION SP STATUS SP REASON`.
    #[error("invalid HTTP status line: {0}")]
    InvalidStatusLine(String),

    /// The status code was not numeric.
    #[error("invalid HTTP status code: {0}")]
    InvalidStatusCode(String),

    /// The status code was outside of 100 ..= 599.
    #[error("unsupported HTTP status code: {0}")]
    UnsupportedStatusCode(String),

    /// The reason phrase contained a forbidden byte.
    #[error("invalid HTTP reason phrase: {0}")]
    InvalidReasonPhrase(String),

    /// A header line contained no colon.
    #[error("invalid HTTP header line: {0}")]
    InvalidHeaderLine(String),

    /// A header field name was not a token.
    #[error("invalid HTTP header name: {0}")]
    InvalidHeaderName(String),

    /// A header field value contained a forbidden byte.
    #[error("invalid HTTP header value: {0}")]
    InvalidHeaderValue(String),

    /// A header line exceeded the maximum length.
    #[error("header line too long ({0} bytes)")]
    LineTooLong(usize),

    /// A header block exceeded the maximum number of fields.
    #[error("too many headers (maximum is {0})")]
    TooManyHeaders(usize)
}

impl Error {
    /// Is this error caused by the stream ending prematurely?
    pub fn is_eof(&self) -> bool {
        matches!(self,
            Error::Stream(_)
            | Error::EofAwaitingRequestLine
            | Error::EofAwaitingStatusLine
            | Error::LineWithoutCrlf)
    }
}

impl fmt::Display for Headers {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for (name, value) in self.iter() {
            writeln!(f, "{}: {}", name, value)?
        }
        Ok(())
    }
}

// Tests //////////////////////////////////////////////////////////////////////////////////////////
