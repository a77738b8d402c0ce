// Copyright (c) 2019 Parity Technologies (UK) Ltd.
//
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. All files in the project carrying such notice may not be copied,
// modified, or distributed except according to those terms.

//! A websocket connection as a pure state machine.
//!
//! [`Connection`] owns no socket. Inbound bytes enter through
//! [`receive_data`][Connection::receive_data] and
//! [`receive_eof`][Connection::receive_eof], outbound bytes leave through
//! [`bytes_to_send`][Connection::bytes_to_send], and everything that
//! happened is reported through
//! [`events_received`][Connection::events_received]. The host owns the
//! transport, the scheduling and all timers.
//!
//! During the opening handshake inbound bytes feed a [`StreamReader`]
//! driving the HTTP parsers; once the upgrade completes, the unread
//! residue is handed to the frame codec and data frames flow.

use bytes::BytesMut;
use crate::{base::{self, Frame, OpCode}, data::{ByteSlice125, Event}, handshake, http, utf8};
use crate::extension::Extension;
use smallvec::SmallVec;
use std::{collections::VecDeque, mem};

/// Accumulated maximum size of a complete message.
const MAX_MESSAGE_SIZE: usize = 256 * 1024 * 1024;
/// Maximum size of a single message frame.
const MAX_FRAME_SIZE: usize = MAX_MESSAGE_SIZE;

/// Is the connection used by a client or server?
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Mode {
    /// Client-side of a connection (implies masking of payload data).
    Client,
    /// Server-side of a connection.
    Server
}

impl Mode {
    /// Is this the client side?
    pub fn is_client(self) -> bool {
        matches!(self, Mode::Client)
    }

    /// Is this the server side?
    pub fn is_server(self) -> bool {
        !self.is_client()
    }
}

/// The lifecycle state of a connection. Transitions are one-way.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum State {
    /// The opening handshake has not finished yet.
    Connecting,
    /// Data can flow in both directions.
    Open,
    /// We sent a CLOSE frame and await the peer's answer.
    Closing,
    /// The connection is over.
    Closed
}

/// Where in the handshake we are and who negotiates it.
#[derive(Debug)]
enum Phase<'a> {
    /// Client before `initiate` was called.
    ClientStart(handshake::Client<'a>),
    /// Client request sent, awaiting the server response.
    ClientAwait { client: handshake::Client<'a>, parser: http::ResponseParser },
    /// Server awaiting the client request.
    ServerAwait { server: handshake::Server<'a>, parser: http::RequestParser },
    /// Server holding a parsed request, awaiting `accept` or `reject`.
    ServerRespond(handshake::Server<'a>),
    /// The handshake is over, one way or the other.
    Done
}

/// A connection builder.
///
/// Allows configuring limits and behavior before creating the
/// [`Connection`].
#[derive(Debug)]
pub struct Builder<'a> {
    phase: Phase<'a>,
    mode: Mode,
    max_message_size: usize,
    max_frame_size: usize,
    max_header_line: usize,
    max_headers: usize,
    auto_pong: bool
}

impl<'a> Builder<'a> {
    /// Create a builder for the client side of a connection.
    pub fn client(client: handshake::Client<'a>) -> Self {
        Builder {
            phase: Phase::ClientStart(client),
            mode: Mode::Client,
            max_message_size: MAX_MESSAGE_SIZE,
            max_frame_size: MAX_FRAME_SIZE,
            max_header_line: http::MAX_HEADER_LINE,
            max_headers: http::MAX_HEADERS,
            auto_pong: true
        }
    }

    /// Create a builder for the server side of a connection.
    pub fn server(server: handshake::Server<'a>) -> Self {
        Builder {
            phase: Phase::ServerAwait {
                parser: http::RequestParser::with_limits(http::MAX_HEADER_LINE, http::MAX_HEADERS),
                server
            },
            mode: Mode::Server,
            max_message_size: MAX_MESSAGE_SIZE,
            max_frame_size: MAX_FRAME_SIZE,
            max_header_line: http::MAX_HEADER_LINE,
            max_headers: http::MAX_HEADERS,
            auto_pong: true
        }
    }

    /// Set the maximum size of a complete message.
    ///
    /// Message fragments will be buffered and concatenated up to this
    /// value, i.e. the sum of all message frames payload lengths will not
    /// be greater than this maximum.
    pub fn set_max_message_size(&mut self, max: usize) -> &mut Self {
        self.max_message_size = max;
        self
    }

    /// Set the maximum size of a single websocket frame payload.
    pub fn set_max_frame_size(&mut self, max: usize) -> &mut Self {
        self.max_frame_size = max;
        self
    }

    /// Set the maximum length of a handshake header line.
    pub fn set_max_header_line(&mut self, max: usize) -> &mut Self {
        self.max_header_line = max;
        self
    }

    /// Set the maximum number of handshake headers.
    pub fn set_max_headers(&mut self, max: usize) -> &mut Self {
        self.max_headers = max;
        self
    }

    /// Answer inbound PINGs with PONGs automatically (on by default).
    pub fn set_auto_pong(&mut self, auto: bool) -> &mut Self {
        self.auto_pong = auto;
        self
    }

    /// Create the configured [`Connection`].
    pub fn finish(self) -> Connection<'a> {
        let mut codec = base::Codec::new(self.mode);
        codec.set_max_data_size(self.max_frame_size);
        let phase = match self.phase {
            Phase::ServerAwait { server, .. } => Phase::ServerAwait {
                parser: http::RequestParser::with_limits(self.max_header_line, self.max_headers),
                server
            },
            other => other
        };
        Connection {
            mode: self.mode,
            state: State::Connecting,
            phase,
            reader: crate::stream::StreamReader::new(),
            input: BytesMut::new(),
            output: BytesMut::new(),
            codec,
            extensions: SmallVec::new(),
            validator: utf8::Validator::new(),
            message: BytesMut::new(),
            message_rsv: (false, false, false),
            first_fragment_opcode: None,
            events: VecDeque::new(),
            max_message_size: self.max_message_size,
            max_header_line: self.max_header_line,
            max_headers: self.max_headers,
            auto_pong: self.auto_pong,
            close_sent: false,
            eof: false,
            needs_input: true,
            error: None,
            bytes_in: 0,
            bytes_out: 0
        }
    }
}

/// A sans-I/O websocket connection.
#[derive(Debug)]
pub struct Connection<'a> {
    mode: Mode,
    state: State,
    phase: Phase<'a>,
    /// Handshake phase input.
    reader: crate::stream::StreamReader,
    /// Frame phase input.
    input: BytesMut,
    /// Outbound bytes, drained by the host.
    output: BytesMut,
    codec: base::Codec,
    extensions: SmallVec<[Box<dyn Extension + Send>; 4]>,
    validator: utf8::Validator,
    /// Message buffer (concatenated fragment payloads).
    message: BytesMut,
    /// Reserved bits of the frame that started the current message.
    message_rsv: (bool, bool, bool),
    first_fragment_opcode: Option<OpCode>,
    events: VecDeque<Event>,
    max_message_size: usize,
    max_header_line: usize,
    max_headers: usize,
    auto_pong: bool,
    close_sent: bool,
    eof: bool,
    needs_input: bool,
    error: Option<Error>,
    bytes_in: u64,
    bytes_out: u64
}

impl<'a> Connection<'a> {
    /// Create a client connection with default limits.
    pub fn client(client: handshake::Client<'a>) -> Self {
        Builder::client(client).finish()
    }

    /// Create a server connection with default limits.
    pub fn server(server: handshake::Server<'a>) -> Self {
        Builder::server(server).finish()
    }

    /// The mode of this connection.
    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// The current lifecycle state.
    pub fn state(&self) -> State {
        self.state
    }

    /// Queue the client handshake request (client mode only).
    ///
    /// The serialized request becomes available via
    /// [`bytes_to_send`][Connection::bytes_to_send].
    pub fn initiate(&mut self) -> Result<(), Error> {
        match mem::replace(&mut self.phase, Phase::Done) {
            Phase::ClientStart(client) => {
                let request = client.request();
                let before = self.output.len();
                request.encode(&mut self.output);
                self.bytes_out += (self.output.len() - before) as u64;
                log::debug!("sent handshake request for {}", request.path());
                let parser = http::ResponseParser::with_limits(self.max_header_line, self.max_headers);
                self.phase = Phase::ClientAwait { client, parser };
                Ok(())
            }
            other => {
                self.phase = other;
                Err(Error::InvalidState)
            }
        }
    }

    /// Accept a previously received handshake request (server mode only).
    ///
    /// Queues the `101 Switching Protocols` response and opens the
    /// connection. On a negotiation error a `400 Bad Request` answer is
    /// queued instead and the connection closes.
    pub fn accept(&mut self, request: &http::Request) -> Result<(), Error> {
        match mem::replace(&mut self.phase, Phase::Done) {
            Phase::ServerRespond(mut server) => match server.accept(request) {
                Ok(response) => {
                    let protocol = response.headers()
                        .get("Sec-WebSocket-Protocol")
                        .map(String::from);
                    self.queue_response(&response);
                    let extensions = server.take_extensions();
                    self.complete_handshake(extensions, protocol);
                    Ok(())
                }
                Err(e) => {
                    self.queue_response(&server.reject(400));
                    let e = Error::Handshake(e);
                    log::debug!("handshake refused: {}", e);
                    self.state = State::Closed;
                    self.events.push_back(Event::ConnectionClosed {
                        code: None,
                        reason: e.to_string(),
                        was_clean: false
                    });
                    Err(e)
                }
            },
            other => {
                self.phase = other;
                Err(Error::InvalidState)
            }
        }
    }

    /// Refuse a previously received handshake request (server mode only)
    /// with the given status code.
    pub fn reject(&mut self, status_code: u16) -> Result<(), Error> {
        match mem::replace(&mut self.phase, Phase::Done) {
            Phase::ServerRespond(server) => {
                self.queue_response(&server.reject(status_code));
                log::debug!("handshake rejected with status {}", status_code);
                self.state = State::Closed;
                self.events.push_back(Event::ConnectionClosed {
                    code: None,
                    reason: format!("handshake rejected with status {}", status_code),
                    was_clean: false
                });
                Ok(())
            }
            other => {
                self.phase = other;
                Err(Error::InvalidState)
            }
        }
    }

    /// Feed inbound bytes into the connection.
    ///
    /// Never blocks and never fails; whatever the bytes caused is
    /// reported through [`events_received`][Connection::events_received].
    pub fn receive_data(&mut self, data: &[u8]) {
        if self.state == State::Closed {
            log::debug!("connection closed, discarding {} bytes", data.len());
            return
        }
        if self.eof {
            log::warn!("data after eof, discarding {} bytes", data.len());
            return
        }
        self.bytes_in += data.len() as u64;
        self.needs_input = false;
        if self.state == State::Connecting {
            self.reader.feed_data(data);
            self.drive_handshake()
        } else {
            self.input.extend_from_slice(data);
            self.drive_frames()
        }
    }

    /// Signal the end of the inbound byte stream.
    pub fn receive_eof(&mut self) {
        if self.eof {
            return
        }
        self.eof = true;
        match self.state {
            State::Connecting => {
                self.reader.feed_eof();
                self.drive_handshake()
            }
            State::Open | State::Closing => {
                log::debug!("connection closed abruptly");
                self.state = State::Closed;
                self.events.push_back(Event::ConnectionClosed {
                    code: None,
                    reason: "connection closed abruptly".into(),
                    was_clean: false
                })
            }
            State::Closed => {}
        }
    }

    /// Send a text message.
    pub fn send_text(&mut self, data: impl AsRef<str>) -> Result<(), Error> {
        let mut frame = Frame::new(OpCode::Text);
        frame.set_payload(data.as_ref().as_bytes());
        self.send_data_frame(frame)
    }

    /// Send a binary message.
    pub fn send_binary(&mut self, data: impl AsRef<[u8]>) -> Result<(), Error> {
        let mut frame = Frame::new(OpCode::Binary);
        frame.set_payload(data.as_ref());
        self.send_data_frame(frame)
    }

    /// Ping the remote end.
    pub fn send_ping(&mut self, data: ByteSlice125) -> Result<(), Error> {
        self.check_open()?;
        let mut frame = Frame::new(OpCode::Ping);
        frame.set_payload(data.as_ref());
        self.queue_frame(frame);
        Ok(())
    }

    /// Send an unsolicited PONG to the remote end.
    pub fn send_pong(&mut self, data: ByteSlice125) -> Result<(), Error> {
        self.check_open()?;
        let mut frame = Frame::new(OpCode::Pong);
        frame.set_payload(data.as_ref());
        self.queue_frame(frame);
        Ok(())
    }

    /// Start the closing handshake.
    ///
    /// Previously queued data frames are flushed ahead of the CLOSE frame;
    /// the connection reaches its final state once the peer's CLOSE
    /// answer arrives.
    pub fn send_close(&mut self, code: u16, reason: &str) -> Result<(), Error> {
        self.check_open()?;
        if !is_close_code(code) {
            return Err(Error::InvalidCloseCode(code))
        }
        let reason = truncated(reason);
        let mut payload = BytesMut::with_capacity(2 + reason.len());
        payload.extend_from_slice(&code.to_be_bytes());
        payload.extend_from_slice(reason.as_bytes());
        let mut frame = Frame::new(OpCode::Close);
        frame.set_payload(payload);
        self.queue_frame(frame);
        self.close_sent = true;
        self.state = State::Closing;
        log::trace!("sent close with code {}", code);
        Ok(())
    }

    /// Drain the outbound byte queue.
    ///
    /// Bytes produced by a single call appear contiguously; the host
    /// writes them to its transport in order.
    pub fn bytes_to_send(&mut self) -> BytesMut {
        self.output.split()
    }

    /// Drain the events produced so far, in the order their terminating
    /// bytes arrived.
    pub fn events_received(&mut self) -> Vec<Event> {
        self.events.drain(..).collect()
    }

    /// Does the connection need more input to make progress?
    pub fn needs_more_input(&self) -> bool {
        self.needs_input && self.state != State::Closed
    }

    /// Are there outbound bytes waiting to be drained?
    pub fn has_output(&self) -> bool {
        !self.output.is_empty()
    }

    /// Has the connection reached its final state?
    pub fn is_closed(&self) -> bool {
        self.state == State::Closed
    }

    /// Total bytes fed into the connection.
    pub fn bytes_received(&self) -> u64 {
        self.bytes_in
    }

    /// Total bytes queued for sending.
    pub fn bytes_sent(&self) -> u64 {
        self.bytes_out
    }

    /// The error that closed this connection, if it failed.
    pub fn last_error(&self) -> Option<&Error> {
        self.error.as_ref()
    }

    // Drive the handshake phase parsers as far as the buffered input goes.
    fn drive_handshake(&mut self) {
        debug_assert_eq!(self.state, State::Connecting);
        match mem::replace(&mut self.phase, Phase::Done) {
            Phase::ClientAwait { mut client, mut parser } => match parser.parse(&mut self.reader) {
                Ok(None) => {
                    self.needs_input = true;
                    self.phase = Phase::ClientAwait { client, parser }
                }
                Ok(Some(response)) => match client.receive_response(&response) {
                    Ok(handshake::ServerResponse::Accepted { protocol }) => {
                        let extensions = client.take_extensions();
                        self.complete_handshake(extensions, protocol)
                    }
                    Ok(handshake::ServerResponse::Redirect { status_code, location }) => {
                        self.state = State::Closed;
                        self.events.push_back(Event::ConnectionClosed {
                            code: None,
                            reason: format!(
                                "handshake redirected to {} (status {})",
                                location, status_code
                            ),
                            was_clean: false
                        })
                    }
                    Ok(handshake::ServerResponse::Rejected { status_code }) => {
                        self.state = State::Closed;
                        self.events.push_back(Event::ConnectionClosed {
                            code: None,
                            reason: format!("handshake rejected with status {}", status_code),
                            was_clean: false
                        })
                    }
                    Err(e) => self.fail_handshake(Error::Handshake(e))
                },
                Err(e) => self.fail_handshake(Error::Handshake(e.into()))
            },
            Phase::ServerAwait { server, mut parser } => match parser.parse(&mut self.reader) {
                Ok(None) => {
                    self.needs_input = true;
                    self.phase = Phase::ServerAwait { server, parser }
                }
                Ok(Some(request)) => {
                    log::debug!("received handshake request for {}", request.path());
                    self.events.push_back(Event::RequestReceived(request));
                    self.phase = Phase::ServerRespond(server)
                }
                Err(e) => self.fail_handshake(Error::Handshake(e.into()))
            },
            other => self.phase = other
        }
    }

    // Upgrade: keep the enabled extensions, move the reader residue over
    // to the frame codec and start decoding frames.
    fn complete_handshake(
        &mut self,
        extensions: SmallVec<[Box<dyn Extension + Send>; 4]>,
        protocol: Option<String>
    ) {
        for e in extensions {
            if e.is_enabled() {
                log::debug!("using extension: {}", e.name());
                self.codec.add_reserved_bits(e.reserved_bits());
                self.extensions.push(e)
            }
        }
        self.state = State::Open;
        self.phase = Phase::Done;
        self.input = self.reader.take_buffer();
        self.events.push_back(Event::HandshakeCompleted { protocol });
        log::debug!("connection open");
        self.drive_frames()
    }

    fn fail_handshake(&mut self, e: Error) {
        log::debug!("handshake failed: {}", e);
        self.state = State::Closed;
        self.phase = Phase::Done;
        self.events.push_back(Event::ConnectionClosed {
            code: None,
            reason: e.to_string(),
            was_clean: false
        });
        self.error = Some(e)
    }

    // Decode as many frames as the buffered input holds.
    fn drive_frames(&mut self) {
        loop {
            if self.state == State::Closed {
                self.input.clear();
                return
            }
            match self.codec.decode(&mut self.input) {
                Ok(Some(frame)) => self.on_frame(frame),
                Ok(None) => {
                    self.needs_input = true;
                    return
                }
                Err(e) => {
                    let code = close_code_for(&e);
                    self.fail(code, Error::Codec(e));
                    return
                }
            }
        }
    }

    fn on_frame(&mut self, frame: Frame) {
        log::trace!(
            "recv: fin = {}, opcode = {}, len = {}",
            frame.is_fin(),
            frame.opcode(),
            frame.payload_len()
        );
        match frame.opcode() {
            OpCode::Ping => {
                let payload = frame.into_payload();
                if self.auto_pong && self.state == State::Open {
                    let mut pong = Frame::new(OpCode::Pong);
                    pong.set_payload(payload.clone());
                    self.queue_frame(pong)
                }
                self.events.push_back(Event::PingReceived(payload))
            }
            OpCode::Pong => self.events.push_back(Event::PongReceived(frame.into_payload())),
            OpCode::Close => self.on_close(frame.into_payload()),
            OpCode::Text | OpCode::Binary | OpCode::Continue => self.on_data_frame(frame)
        }
    }

    fn on_close(&mut self, payload: BytesMut) {
        let (code, reason) = if payload.is_empty() {
            (None, String::new())
        } else if payload.len() == 1 {
            self.fail(1002, Error::InvalidClosePayload);
            return
        } else {
            let code = u16::from_be_bytes([payload[0], payload[1]]);
            if !is_close_code(code) {
                self.fail(1002, Error::InvalidCloseCode(code));
                return
            }
            match std::str::from_utf8(&payload[2 ..]) {
                Ok(reason) => (Some(code), String::from(reason)),
                Err(_) => {
                    self.fail(1007, Error::Utf8);
                    return
                }
            }
        };
        log::trace!("received close with code {:?}", code);
        self.events.push_back(Event::CloseReceived { code, reason: reason.clone() });
        if !self.close_sent {
            // Peer initiated: echo the code to finish the close handshake.
            let mut answer = Frame::new(OpCode::Close);
            if let Some(c) = code {
                answer.set_payload(&c.to_be_bytes()[..]);
            }
            self.queue_frame(answer);
            self.close_sent = true
        }
        self.state = State::Closed;
        self.events.push_back(Event::ConnectionClosed { code, reason, was_clean: true })
    }

    fn on_data_frame(&mut self, frame: Frame) {
        let fin = frame.is_fin();
        let opcode = frame.opcode();

        if opcode == OpCode::Continue {
            if self.first_fragment_opcode.is_none() {
                log::debug!("continue frame while not processing message fragments");
                self.fail(1002, Error::UnexpectedOpCode(OpCode::Continue));
                return
            }
        } else if self.first_fragment_opcode.is_some() {
            log::debug!("new data frame while processing message fragments");
            self.fail(1002, Error::UnexpectedOpCode(opcode));
            return
        } else {
            self.message_rsv = (frame.is_rsv1(), frame.is_rsv2(), frame.is_rsv3());
            if !fin {
                self.first_fragment_opcode = Some(opcode)
            }
        }

        if frame.payload_len() + self.message.len() > self.max_message_size {
            let current = self.message.len() + frame.payload_len();
            self.fail(1009, Error::MessageTooLarge { current, maximum: self.max_message_size });
            return
        }

        let message_opcode = self.first_fragment_opcode.unwrap_or(opcode);
        if message_opcode == OpCode::Text
            && self.incremental_utf8()
            && self.validator.validate(frame.payload()).is_err()
        {
            self.fail(1007, Error::Utf8);
            return
        }

        self.message.unsplit(frame.into_payload());

        if fin {
            let opcode = self.first_fragment_opcode.take().unwrap_or(opcode);
            self.deliver_message(opcode)
        }
    }

    // A complete message: run the extension chain, validate text and
    // surface the event.
    fn deliver_message(&mut self, opcode: OpCode) {
        let mut frame = Frame::new(opcode);
        let (rsv1, rsv2, rsv3) = self.message_rsv;
        frame.set_rsv1(rsv1);
        frame.set_rsv2(rsv2);
        frame.set_rsv3(rsv3);
        frame.set_payload(mem::take(&mut self.message));

        let mut ext_error = None;
        for e in self.extensions.iter_mut().filter(|e| e.is_enabled()) {
            log::trace!("decoding with extension: {}", e.name());
            if let Err(e) = e.decode(&mut frame) {
                ext_error = Some(e);
                break
            }
        }
        if let Some(e) = ext_error {
            self.fail(1007, Error::Extension(e));
            return
        }

        let payload = frame.into_payload();
        if opcode == OpCode::Text {
            if !self.incremental_utf8() && self.validator.validate(&payload).is_err() {
                self.fail(1007, Error::Utf8);
                return
            }
            if self.validator.finish().is_err() {
                self.fail(1007, Error::Utf8);
                return
            }
            match String::from_utf8(payload.to_vec()) {
                Ok(text) => self.events.push_back(Event::TextMessage(text)),
                Err(_) => self.fail(1007, Error::Utf8)
            }
        } else {
            self.events.push_back(Event::BinaryMessage(payload))
        }
    }

    fn send_data_frame(&mut self, mut frame: Frame) -> Result<(), Error> {
        self.check_open()?;
        let mut ext_error = None;
        for e in self.extensions.iter_mut().filter(|e| e.is_enabled()) {
            log::trace!("encoding with extension: {}", e.name());
            if let Err(e) = e.encode(&mut frame) {
                ext_error = Some(e);
                break
            }
        }
        if let Some(e) = ext_error {
            return Err(Error::Extension(e))
        }
        self.queue_frame(frame);
        Ok(())
    }

    fn check_open(&self) -> Result<(), Error> {
        match self.state {
            State::Open => Ok(()),
            State::Connecting => Err(Error::InvalidState),
            State::Closing | State::Closed => Err(Error::Closed)
        }
    }

    // Encode a frame onto the outbound queue.
    fn queue_frame(&mut self, frame: Frame) {
        log::trace!(
            "send: fin = {}, opcode = {}, len = {}",
            frame.is_fin(),
            frame.opcode(),
            frame.payload_len()
        );
        let before = self.output.len();
        if let Err(e) = self.codec.encode(frame, &mut self.output) {
            log::error!("failed to encode frame: {}", e)
        }
        self.bytes_out += (self.output.len() - before) as u64
    }

    fn queue_response(&mut self, response: &http::Response) {
        let before = self.output.len();
        response.encode(&mut self.output);
        self.bytes_out += (self.output.len() - before) as u64
    }

    // A protocol violation: try to tell the peer why, then shut down.
    // Everything still buffered is discarded.
    fn fail(&mut self, code: u16, e: Error) {
        log::debug!("connection failed: {}", e);
        if !self.close_sent && matches!(self.state, State::Open | State::Closing) {
            let reason = e.to_string();
            let reason = truncated(&reason);
            let mut payload = BytesMut::with_capacity(2 + reason.len());
            payload.extend_from_slice(&code.to_be_bytes());
            payload.extend_from_slice(reason.as_bytes());
            let mut frame = Frame::new(OpCode::Close);
            frame.set_payload(payload);
            self.queue_frame(frame);
            self.close_sent = true
        }
        self.state = State::Closed;
        self.input.clear();
        self.events.push_back(Event::ConnectionClosed {
            code: Some(code),
            reason: e.to_string(),
            was_clean: false
        });
        self.error = Some(e)
    }

    // Are text payload fragments validated as they arrive? With
    // extensions on the connection the payload may be rewritten, so
    // validation has to wait for the decoded complete message.
    fn incremental_utf8(&self) -> bool {
        self.extensions.is_empty()
    }
}

/// Close codes valid on the wire (RFC 6455, section 7.4).
fn is_close_code(code: u16) -> bool {
    matches!(code, 1000 ..= 1003 | 1007 ..= 1011 | 3000 ..= 4999)
}

// The close code a frame decode error maps to.
fn close_code_for(e: &base::Error) -> u16 {
    match e {
        base::Error::PayloadTooLarge { .. } => 1009,
        _ => 1002
    }
}

// Cap a close reason at the 123 bytes that fit a control frame next to
// the close code, respecting character boundaries.
fn truncated(reason: &str) -> &str {
    let max = base::MAX_CTRL_PAYLOAD - 2;
    if reason.len() <= max {
        return reason
    }
    let mut end = max;
    while !reason.is_char_boundary(end) {
        end -= 1
    }
    &reason[.. end]
}

/// Errors which may occur when sending or receiving messages.
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The frame codec errored.
    #[error("codec error: {0}")]
    Codec(#[from] base::Error),

    /// The opening handshake failed.
    #[error("handshake error: {0}")]
    Handshake(#[from] handshake::Error),

    /// An extension produced an error while encoding or decoding.
    #[error("extension error: {0}")]
    Extension(#[source] crate::BoxedError),

    /// An unexpected opcode was encountered.
    #[error("unexpected opcode: {0}")]
    UnexpectedOpCode(OpCode),

    /// A close frame carried a code outside of the allowed set.
    #[error("invalid close code: {0}")]
    InvalidCloseCode(u16),

    /// A close frame payload was too short to carry a code.
    #[error("close frame payload too short")]
    InvalidClosePayload,

    /// A text payload or close reason was not valid UTF-8.
    #[error("invalid utf-8 payload")]
    Utf8,

    /// The accumulated message size exceeds the configured maximum.
    #[error("message too large: len >= {current}, maximum = {maximum}")]
    MessageTooLarge {
        /// Accumulated size of the offending message.
        current: usize,
        /// The configured limit.
        maximum: usize
    },

    /// The connection is closed.
    #[error("connection is closed")]
    Closed,

    /// The operation is not valid in the current lifecycle state.
    #[error("operation not valid in the current connection state")]
    InvalidState
}

// Tests //////////////////////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use bytes::BytesMut;
    use crate::BoxedError;
    use crate::base::{self, Frame, OpCode};
    use crate::data::{ByteSlice125, Event};
    use crate::extension::{Extension, Param};
    use crate::handshake;
    use quickcheck::quickcheck;
    use std::convert::TryFrom;
    use super::{Builder, Connection, Error, Mode, State};

    fn pair(
        client_hs: handshake::Client<'static>,
        server_hs: handshake::Server<'static>
    ) -> (Connection<'static>, Connection<'static>) {
        let mut client = Connection::client(client_hs);
        let mut server = Connection::server(server_hs);
        connect(&mut client, &mut server);
        (client, server)
    }

    fn connect(client: &mut Connection<'static>, server: &mut Connection<'static>) {
        client.initiate().unwrap();
        server.receive_data(&client.bytes_to_send());
        let request = match server.events_received().as_slice() {
            [Event::RequestReceived(r)] => r.clone(),
            other => panic!("unexpected events: {:?}", other)
        };
        server.accept(&request).unwrap();
        assert_matches!(server.events_received().as_slice(), [Event::HandshakeCompleted { .. }]);
        client.receive_data(&server.bytes_to_send());
        assert_matches!(client.events_received().as_slice(), [Event::HandshakeCompleted { .. }]);
        assert_eq!(client.state(), State::Open);
        assert_eq!(server.state(), State::Open);
    }

    fn default_pair() -> (Connection<'static>, Connection<'static>) {
        pair(handshake::Client::new("localhost", "/"), handshake::Server::new())
    }

    // Encode raw frames the way a remote client would.
    fn client_frames(frames: Vec<Frame>) -> BytesMut {
        let mut codec = base::Codec::new(Mode::Client);
        let mut wire = BytesMut::new();
        for frame in frames {
            codec.encode(frame, &mut wire).unwrap()
        }
        wire
    }

    fn data_frame(opcode: OpCode, fin: bool, payload: &[u8]) -> Frame {
        let mut frame = Frame::new(opcode);
        frame.set_fin(fin);
        frame.set_payload(payload);
        frame
    }

    #[test]
    fn handshake_with_subprotocol() {
        let mut client_hs = handshake::Client::new("localhost", "/");
        client_hs.add_protocol("chat").add_protocol("superchat");
        let mut server_hs = handshake::Server::new();
        server_hs.add_protocol("chat");

        let mut client = Connection::client(client_hs);
        let mut server = Connection::server(server_hs);
        client.initiate().unwrap();
        server.receive_data(&client.bytes_to_send());
        let request = match server.events_received().remove(0) {
            Event::RequestReceived(r) => r,
            other => panic!("unexpected event: {:?}", other)
        };
        server.accept(&request).unwrap();
        assert_eq!(
            server.events_received(),
            vec![Event::HandshakeCompleted { protocol: Some("chat".into()) }]
        );
        client.receive_data(&server.bytes_to_send());
        assert_eq!(
            client.events_received(),
            vec![Event::HandshakeCompleted { protocol: Some("chat".into()) }]
        );
    }

    #[test]
    fn text_messages_both_directions() {
        let (mut client, mut server) = default_pair();
        client.send_text("hello").unwrap();
        server.receive_data(&client.bytes_to_send());
        assert_eq!(server.events_received(), vec![Event::TextMessage("hello".into())]);

        server.send_text("world").unwrap();
        client.receive_data(&server.bytes_to_send());
        assert_eq!(client.events_received(), vec![Event::TextMessage("world".into())]);
    }

    #[test]
    fn binary_message() {
        let (mut client, mut server) = default_pair();
        client.send_binary(&[0_u8, 159, 146, 150][..]).unwrap();
        server.receive_data(&client.bytes_to_send());
        assert_eq!(
            server.events_received(),
            vec![Event::BinaryMessage(BytesMut::from(&[0_u8, 159, 146, 150][..]))]
        );
    }

    #[test]
    fn fragmented_message_is_reassembled() {
        let (_, mut server) = default_pair();
        let wire = client_frames(vec![
            data_frame(OpCode::Text, false, b"he"),
            data_frame(OpCode::Continue, false, b"ll"),
            data_frame(OpCode::Continue, true, b"o")
        ]);
        server.receive_data(&wire);
        assert_eq!(server.events_received(), vec![Event::TextMessage("hello".into())]);
    }

    #[test]
    fn control_frames_interleave_with_fragments() {
        let (_, mut server) = default_pair();
        let mut ping = Frame::new(OpCode::Ping);
        ping.set_payload(&b"now"[..]);
        let wire = client_frames(vec![
            data_frame(OpCode::Text, false, b"spam"),
            ping,
            data_frame(OpCode::Continue, true, b" eggs")
        ]);
        server.receive_data(&wire);
        assert_eq!(
            server.events_received(),
            vec![
                Event::PingReceived(BytesMut::from(&b"now"[..])),
                Event::TextMessage("spam eggs".into())
            ]
        );
    }

    #[test]
    fn pings_are_answered_automatically() {
        let (mut client, mut server) = default_pair();
        client.send_ping(ByteSlice125::try_from(&b"hi"[..]).unwrap()).unwrap();
        server.receive_data(&client.bytes_to_send());
        assert_eq!(server.events_received(), vec![Event::PingReceived(BytesMut::from(&b"hi"[..]))]);
        assert!(server.has_output());
        client.receive_data(&server.bytes_to_send());
        assert_eq!(client.events_received(), vec![Event::PongReceived(BytesMut::from(&b"hi"[..]))]);
    }

    #[test]
    fn auto_pong_can_be_disabled() {
        let mut client = Connection::client(handshake::Client::new("localhost", "/"));
        let mut builder = Builder::server(handshake::Server::new());
        builder.set_auto_pong(false);
        let mut server = builder.finish();
        connect(&mut client, &mut server);

        client.send_ping(ByteSlice125::try_from(&b"hi"[..]).unwrap()).unwrap();
        server.receive_data(&client.bytes_to_send());
        assert_eq!(server.events_received(), vec![Event::PingReceived(BytesMut::from(&b"hi"[..]))]);
        assert!(!server.has_output());
    }

    #[test]
    fn close_initiated_by_client() {
        let (mut client, mut server) = default_pair();
        client.send_text("last words").unwrap();
        client.send_close(1000, "bye").unwrap();
        assert_eq!(client.state(), State::Closing);

        // Data queued before the close is flushed ahead of it.
        server.receive_data(&client.bytes_to_send());
        assert_eq!(
            server.events_received(),
            vec![
                Event::TextMessage("last words".into()),
                Event::CloseReceived { code: Some(1000), reason: "bye".into() },
                Event::ConnectionClosed { code: Some(1000), reason: "bye".into(), was_clean: true }
            ]
        );
        assert!(server.is_closed());

        client.receive_data(&server.bytes_to_send());
        assert_eq!(
            client.events_received(),
            vec![
                Event::CloseReceived { code: Some(1000), reason: String::new() },
                Event::ConnectionClosed { code: Some(1000), reason: String::new(), was_clean: true }
            ]
        );
        assert!(client.is_closed());
    }

    #[test]
    fn close_initiated_by_server() {
        let (mut client, mut server) = default_pair();
        server.send_close(1001, "going away").unwrap();
        client.receive_data(&server.bytes_to_send());
        assert_matches!(
            client.events_received().as_slice(),
            [
                Event::CloseReceived { code: Some(1001), .. },
                Event::ConnectionClosed { code: Some(1001), was_clean: true, .. }
            ]
        );
        server.receive_data(&client.bytes_to_send());
        assert_matches!(
            server.events_received().as_slice(),
            [
                Event::CloseReceived { code: Some(1001), .. },
                Event::ConnectionClosed { code: Some(1001), was_clean: true, .. }
            ]
        );
        assert!(client.is_closed());
        assert!(server.is_closed());
    }

    #[test]
    fn stray_continuation_is_a_protocol_error() {
        let (mut client, mut server) = default_pair();
        let wire = client_frames(vec![data_frame(OpCode::Continue, true, b"stray")]);
        server.receive_data(&wire);
        assert_matches!(
            server.events_received().as_slice(),
            [Event::ConnectionClosed { code: Some(1002), was_clean: false, .. }]
        );
        assert!(server.is_closed());
        assert_matches!(server.last_error(), Some(Error::UnexpectedOpCode(OpCode::Continue)));

        // The peer is told why.
        client.receive_data(&server.bytes_to_send());
        assert_matches!(
            client.events_received().as_slice(),
            [
                Event::CloseReceived { code: Some(1002), .. },
                Event::ConnectionClosed { code: Some(1002), .. }
            ]
        );
    }

    #[test]
    fn new_data_opcode_during_fragmentation_is_a_protocol_error() {
        let (_, mut server) = default_pair();
        let wire = client_frames(vec![
            data_frame(OpCode::Text, false, b"spam"),
            data_frame(OpCode::Binary, true, b"eggs")
        ]);
        server.receive_data(&wire);
        assert_matches!(
            server.events_received().as_slice(),
            [Event::ConnectionClosed { code: Some(1002), was_clean: false, .. }]
        );
        assert_matches!(server.last_error(), Some(Error::UnexpectedOpCode(OpCode::Binary)));
    }

    #[test]
    fn invalid_utf8_closes_with_1007() {
        let (_, mut server) = default_pair();
        let wire = client_frames(vec![data_frame(OpCode::Text, true, b"\xf4\x90\x80\x80")]);
        server.receive_data(&wire);
        assert_matches!(
            server.events_received().as_slice(),
            [Event::ConnectionClosed { code: Some(1007), was_clean: false, .. }]
        );
        assert_matches!(server.last_error(), Some(Error::Utf8));
    }

    #[test]
    fn invalid_utf8_is_rejected_before_the_final_fragment() {
        let (_, mut server) = default_pair();
        // The message never finishes, the first fragment is proof enough.
        let wire = client_frames(vec![data_frame(OpCode::Text, false, b"ok\xff")]);
        server.receive_data(&wire);
        assert_matches!(
            server.events_received().as_slice(),
            [Event::ConnectionClosed { code: Some(1007), was_clean: false, .. }]
        );
    }

    #[test]
    fn oversized_message_closes_with_1009() {
        let mut client = Connection::client(handshake::Client::new("localhost", "/"));
        let mut builder = Builder::server(handshake::Server::new());
        builder.set_max_message_size(8);
        let mut server = builder.finish();
        connect(&mut client, &mut server);

        client.send_binary(&[0_u8; 9][..]).unwrap();
        server.receive_data(&client.bytes_to_send());
        assert_matches!(
            server.events_received().as_slice(),
            [Event::ConnectionClosed { code: Some(1009), was_clean: false, .. }]
        );
        assert_matches!(
            server.last_error(),
            Some(Error::MessageTooLarge { current: 9, maximum: 8 })
        );
    }

    #[test]
    fn oversized_fragments_accumulate_to_1009() {
        let mut client = Connection::client(handshake::Client::new("localhost", "/"));
        let mut builder = Builder::server(handshake::Server::new());
        builder.set_max_message_size(8);
        let mut server = builder.finish();
        connect(&mut client, &mut server);

        let wire = client_frames(vec![
            data_frame(OpCode::Binary, false, &[0; 5]),
            data_frame(OpCode::Continue, false, &[0; 5])
        ]);
        server.receive_data(&wire);
        assert_matches!(
            server.events_received().as_slice(),
            [Event::ConnectionClosed { code: Some(1009), was_clean: false, .. }]
        );
    }

    #[test]
    fn oversized_frame_closes_with_1009() {
        let mut client = Connection::client(handshake::Client::new("localhost", "/"));
        let mut builder = Builder::server(handshake::Server::new());
        builder.set_max_frame_size(4);
        let mut server = builder.finish();
        connect(&mut client, &mut server);

        client.send_binary(&[0_u8; 5][..]).unwrap();
        server.receive_data(&client.bytes_to_send());
        assert_matches!(
            server.events_received().as_slice(),
            [Event::ConnectionClosed { code: Some(1009), was_clean: false, .. }]
        );
        assert_matches!(server.last_error(), Some(Error::Codec(base::Error::PayloadTooLarge { .. })));
    }

    #[test]
    fn unmasked_client_frames_are_rejected() {
        let (_, mut server) = default_pair();
        // Encoded as a server would, i.e. unmasked.
        let mut codec = base::Codec::new(Mode::Server);
        let mut wire = BytesMut::new();
        codec.encode(data_frame(OpCode::Text, true, b"nope"), &mut wire).unwrap();
        server.receive_data(&wire);
        assert_matches!(
            server.events_received().as_slice(),
            [Event::ConnectionClosed { code: Some(1002), was_clean: false, .. }]
        );
        assert_matches!(server.last_error(), Some(Error::Codec(base::Error::InvalidMaskBit)));
    }

    #[test]
    fn input_after_a_fatal_error_is_discarded() {
        let (_, mut server) = default_pair();
        let wire = client_frames(vec![data_frame(OpCode::Continue, true, b"stray")]);
        server.receive_data(&wire);
        server.events_received();

        let wire = client_frames(vec![data_frame(OpCode::Text, true, b"after")]);
        server.receive_data(&wire);
        assert_eq!(server.events_received(), vec![]);
    }

    #[test]
    fn invalid_close_code_is_a_protocol_error() {
        let (_, mut server) = default_pair();
        let mut close = Frame::new(OpCode::Close);
        close.set_payload(&1005_u16.to_be_bytes()[..]);
        server.receive_data(&client_frames(vec![close]));
        assert_matches!(
            server.events_received().as_slice(),
            [Event::ConnectionClosed { code: Some(1002), was_clean: false, .. }]
        );
        assert_matches!(server.last_error(), Some(Error::InvalidCloseCode(1005)));
    }

    #[test]
    fn one_byte_close_payload_is_a_protocol_error() {
        let (_, mut server) = default_pair();
        let mut close = Frame::new(OpCode::Close);
        close.set_payload(&[0x03][..]);
        server.receive_data(&client_frames(vec![close]));
        assert_matches!(server.last_error(), Some(Error::InvalidClosePayload));
    }

    #[test]
    fn sending_is_fenced_by_the_lifecycle() {
        let mut client = Connection::client(handshake::Client::new("localhost", "/"));
        assert_matches!(client.send_text("early"), Err(Error::InvalidState));

        let (mut client, mut server) = default_pair();
        client.send_close(1000, "").unwrap();
        assert_matches!(client.send_text("late"), Err(Error::Closed));
        server.receive_data(&client.bytes_to_send());
        client.receive_data(&server.bytes_to_send());
        assert_matches!(client.send_text("too late"), Err(Error::Closed));
    }

    #[test]
    fn send_close_validates_the_code() {
        let (mut client, _) = default_pair();
        assert_matches!(client.send_close(1005, ""), Err(Error::InvalidCloseCode(1005)));
        assert_matches!(client.send_close(2999, ""), Err(Error::InvalidCloseCode(2999)));
        assert!(client.send_close(4000, "app specific").is_ok());
    }

    #[test]
    fn initiate_twice_is_an_error() {
        let mut client = Connection::client(handshake::Client::new("localhost", "/"));
        client.initiate().unwrap();
        assert_matches!(client.initiate(), Err(Error::InvalidState));
    }

    #[test]
    fn eof_before_the_request_fails_the_handshake() {
        let mut server = Connection::server(handshake::Server::new());
        server.receive_eof();
        assert_matches!(
            server.events_received().as_slice(),
            [Event::ConnectionClosed { code: None, reason, was_clean: false }]
                if reason.contains("connection closed while reading HTTP request line")
        );
        assert!(server.is_closed());
    }

    #[test]
    fn eof_while_open_is_an_abrupt_close() {
        let (mut client, _) = default_pair();
        client.receive_eof();
        assert_matches!(
            client.events_received().as_slice(),
            [Event::ConnectionClosed { code: None, was_clean: false, .. }]
        );
        assert!(client.is_closed());
    }

    #[test]
    fn rejecting_a_request_closes_the_connection() {
        let mut client = Connection::client(handshake::Client::new("localhost", "/"));
        let mut server = Connection::server(handshake::Server::new());
        client.initiate().unwrap();
        server.receive_data(&client.bytes_to_send());
        server.events_received();
        server.reject(403).unwrap();
        assert!(server.is_closed());

        client.receive_data(&server.bytes_to_send());
        assert_matches!(
            client.events_received().as_slice(),
            [Event::ConnectionClosed { code: None, reason, was_clean: false }]
                if reason.contains("status 403")
        );
    }

    #[test]
    fn handshake_flags() {
        let mut server = Connection::server(handshake::Server::new());
        assert!(server.needs_more_input());
        assert!(!server.has_output());
        assert!(!server.is_closed());

        server.receive_data(b"GET / HTTP/1.1\r\n");
        assert!(server.needs_more_input());

        let (client, server) = default_pair();
        assert!(client.needs_more_input());
        assert!(server.needs_more_input());
        assert!(client.bytes_received() > 0);
        assert!(client.bytes_sent() > 0);
        assert!(server.bytes_received() > 0);
    }

    // An extension that marks messages with rsv1 and a trailing bang.
    #[derive(Debug, Default)]
    struct Bang {
        enabled: bool
    }

    impl Extension for Bang {
        fn is_enabled(&self) -> bool {
            self.enabled
        }

        fn name(&self) -> &str {
            "x-bang"
        }

        fn params(&self) -> &[Param] {
            &[]
        }

        fn configure(&mut self, _: &[Param]) -> Result<(), BoxedError> {
            self.enabled = true;
            Ok(())
        }

        fn encode(&mut self, frame: &mut Frame) -> Result<(), BoxedError> {
            frame.set_rsv1(true);
            frame.payload_mut().extend_from_slice(b"!");
            Ok(())
        }

        fn decode(&mut self, frame: &mut Frame) -> Result<(), BoxedError> {
            if !frame.is_rsv1() {
                return Err("rsv1 not set".into())
            }
            let len = frame.payload_len();
            frame.payload_mut().truncate(len - 1);
            Ok(())
        }

        fn reserved_bits(&self) -> (bool, bool, bool) {
            (true, false, false)
        }
    }

    #[test]
    fn extensions_negotiate_and_transform_messages() {
        let mut client_hs = handshake::Client::new("localhost", "/");
        client_hs.add_extension(Box::new(Bang::default()));
        let mut server_hs = handshake::Server::new();
        server_hs.add_extension(Box::new(Bang::default()));
        let (mut client, mut server) = pair(client_hs, server_hs);

        client.send_text("hello").unwrap();
        server.receive_data(&client.bytes_to_send());
        assert_eq!(server.events_received(), vec![Event::TextMessage("hello".into())]);

        server.send_text("hello").unwrap();
        client.receive_data(&server.bytes_to_send());
        assert_eq!(client.events_received(), vec![Event::TextMessage("hello".into())]);
    }

    quickcheck! {
        // Chunk independence of the full stack: however the inbound bytes
        // are split, the same events come out in the same order.
        fn prop_chunk_independence(messages: Vec<String>, chunk: usize) -> bool {
            let chunk = chunk % 13 + 1;

            let mut wire = BytesMut::new();
            handshake::Client::new("localhost", "/").request().encode(&mut wire);
            let mut codec = base::Codec::new(Mode::Client);
            for m in &messages {
                let mut frame = Frame::new(OpCode::Text);
                frame.set_payload(m.as_bytes());
                codec.encode(frame, &mut wire).unwrap()
            }

            let run = |sizes: &mut dyn Iterator<Item = usize>| -> Vec<Event> {
                let mut server = Connection::server(handshake::Server::new());
                let mut events = Vec::new();
                let mut fed = 0;
                while fed < wire.len() {
                    let n = sizes.next().unwrap().min(wire.len() - fed);
                    server.receive_data(&wire[fed .. fed + n]);
                    fed += n;
                    for event in server.events_received() {
                        if let Event::RequestReceived(request) = &event {
                            server.accept(request).unwrap();
                        }
                        events.push(event)
                    }
                    events.extend(server.events_received())
                }
                events
            };

            let all_at_once = run(&mut std::iter::repeat(wire.len()));
            let in_chunks = run(&mut std::iter::repeat(chunk));
            all_at_once == in_chunks
        }
    }
}
