// Copyright (c) 2019 Parity Technologies (UK) Ltd.
//
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. All files in the project carrying such notice may not be copied,
// modified, or distributed except according to those terms.

//! A websocket [base] frame and accompanying codec.
//!
//! The decoder is resumable: when the input buffer does not yet hold a
//! complete frame it returns `Ok(None)` and remembers how far it got, so
//! feeding the wire bytes in arbitrary chunks yields the same frames as
//! feeding them at once.
//!
//! [base]: https://tools.ietf.org/html/rfc6455#section-5.2

use bytes::BytesMut;
use crate::connection::Mode;
use static_assertions::const_assert;
use std::{convert::TryFrom, fmt};

/// Maximum payload length of a control frame.
pub const MAX_CTRL_PAYLOAD: usize = 125;

/// If the payload length byte is 126, the following two bytes represent the
/// actual payload length.
const TWO_EXT: u8 = 126;

/// If the payload length byte is 127, the following eight bytes represent
/// the actual payload length.
const EIGHT_EXT: u8 = 127;

// Control frames always fit the 7-bit length encoding.
const_assert!(MAX_CTRL_PAYLOAD < TWO_EXT as usize);

// OpCode /////////////////////////////////////////////////////////////////////////////////////////

/// Operation codes defined in [RFC6455](https://tools.ietf.org/html/rfc6455#section-5.2).
#[derive(Debug, Eq, PartialEq, Clone, Copy, Hash)]
pub enum OpCode {
    /// A continuation frame of a fragmented message.
    Continue,
    /// A text data frame.
    Text,
    /// A binary data frame.
    Binary,
    /// A close control frame.
    Close,
    /// A ping control frame.
    Ping,
    /// A pong control frame.
    Pong
}

impl OpCode {
    /// Is this a control opcode?
    pub fn is_control(self) -> bool {
        matches!(self, OpCode::Close | OpCode::Ping | OpCode::Pong)
    }

    /// Is this a text or binary opcode?
    pub fn is_data(self) -> bool {
        matches!(self, OpCode::Text | OpCode::Binary)
    }
}

impl fmt::Display for OpCode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            OpCode::Continue => f.write_str("Continue"),
            OpCode::Text => f.write_str("Text"),
            OpCode::Binary => f.write_str("Binary"),
            OpCode::Close => f.write_str("Close"),
            OpCode::Ping => f.write_str("Ping"),
            OpCode::Pong => f.write_str("Pong")
        }
    }
}

/// Error returned by `OpCode::try_from` if an unknown opcode
/// number is encountered.
#[derive(Debug)]
pub struct UnknownOpCode(());

impl fmt::Display for UnknownOpCode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("unknown opcode")
    }
}

impl std::error::Error for UnknownOpCode {}

impl TryFrom<u8> for OpCode {
    type Error = UnknownOpCode;

    fn try_from(val: u8) -> Result<OpCode, Self::Error> {
        match val {
            0 => Ok(OpCode::Continue),
            1 => Ok(OpCode::Text),
            2 => Ok(OpCode::Binary),
            8 => Ok(OpCode::Close),
            9 => Ok(OpCode::Ping),
            10 => Ok(OpCode::Pong),
            _ => Err(UnknownOpCode(()))
        }
    }
}

impl From<OpCode> for u8 {
    fn from(opcode: OpCode) -> u8 {
        match opcode {
            OpCode::Continue => 0,
            OpCode::Text => 1,
            OpCode::Binary => 2,
            OpCode::Close => 8,
            OpCode::Ping => 9,
            OpCode::Pong => 10
        }
    }
}

// Frame //////////////////////////////////////////////////////////////////////////////////////////

/// A websocket [base](https://tools.ietf.org/html/rfc6455#section-5.2) frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    fin: bool,
    rsv1: bool,
    rsv2: bool,
    rsv3: bool,
    masked: bool,
    opcode: OpCode,
    mask: u32,
    payload: BytesMut
}

impl Frame {
    /// Create a new unmasked final frame without payload data.
    pub fn new(opcode: OpCode) -> Self {
        Frame {
            fin: true,
            rsv1: false,
            rsv2: false,
            rsv3: false,
            masked: false,
            opcode,
            mask: 0,
            payload: BytesMut::new()
        }
    }

    /// Is the `fin` flag set?
    pub fn is_fin(&self) -> bool {
        self.fin
    }

    /// Set the `fin` flag.
    pub fn set_fin(&mut self, fin: bool) -> &mut Self {
        self.fin = fin;
        self
    }

    /// Is the `rsv1` flag set?
    pub fn is_rsv1(&self) -> bool {
        self.rsv1
    }

    /// Set the `rsv1` flag.
    pub fn set_rsv1(&mut self, rsv1: bool) -> &mut Self {
        self.rsv1 = rsv1;
        self
    }

    /// Is the `rsv2` flag set?
    pub fn is_rsv2(&self) -> bool {
        self.rsv2
    }

    /// Set the `rsv2` flag.
    pub fn set_rsv2(&mut self, rsv2: bool) -> &mut Self {
        self.rsv2 = rsv2;
        self
    }

    /// Is the `rsv3` flag set?
    pub fn is_rsv3(&self) -> bool {
        self.rsv3
    }

    /// Set the `rsv3` flag.
    pub fn set_rsv3(&mut self, rsv3: bool) -> &mut Self {
        self.rsv3 = rsv3;
        self
    }

    /// Is the `masked` flag set?
    pub fn is_masked(&self) -> bool {
        self.masked
    }

    /// Get the `opcode`.
    pub fn opcode(&self) -> OpCode {
        self.opcode
    }

    /// Set the `opcode`.
    pub fn set_opcode(&mut self, opcode: OpCode) -> &mut Self {
        self.opcode = opcode;
        self
    }

    /// Get the masking key.
    pub fn mask(&self) -> u32 {
        self.mask
    }

    /// The payload length in bytes.
    pub fn payload_len(&self) -> usize {
        self.payload.len()
    }

    /// A reference to the payload data (unmasked).
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// A mutable reference to the payload data.
    pub fn payload_mut(&mut self) -> &mut BytesMut {
        &mut self.payload
    }

    /// Consume the frame and return the payload only.
    pub fn into_payload(self) -> BytesMut {
        self.payload
    }

    /// Set the payload data.
    pub fn set_payload(&mut self, data: impl Into<BytesMut>) -> &mut Self {
        self.payload = data.into();
        self
    }
}

// Frame codec ////////////////////////////////////////////////////////////////////////////////////

/// Codec for encoding and decoding websocket [base] [`Frame`]s.
///
/// The mode decides both masking directions: a server codec rejects
/// unmasked inbound frames and never masks outbound ones; a client codec
/// rejects masked inbound frames and masks every outbound frame with a
/// fresh random key.
///
/// [base]: https://tools.ietf.org/html/rfc6455#section-5.2
#[derive(Debug)]
pub struct Codec {
    /// Decode state.
    state: Option<DecodeState>,
    /// Are we the client or the server side of the connection?
    mode: Mode,
    /// Maximum size of payload data per frame.
    max_data_size: usize,
    /// Bits reserved by extensions.
    reserved_bits: u8
}

#[derive(Debug)]
enum DecodeState {
    /// Initial decoding state.
    Start,
    /// The first 2 bytes of a new frame have been decoded.
    /// Next is to decode the total frame length.
    Length { frame: Frame, length_code: u8 },
    /// The frame length has been decoded.
    /// Next is to read the masking key if present.
    Mask { frame: Frame, length: usize },
    /// Frame length and masking key have been decoded.
    /// As the final step, the payload data will be decoded.
    Body { frame: Frame, length: usize }
}

impl Codec {
    /// Create a new frame codec for the given mode.
    ///
    /// The codec will support decoding payload lengths up to 256 MiB
    /// (use `set_max_data_size` to change this value).
    pub fn new(mode: Mode) -> Self {
        Codec {
            state: Some(DecodeState::Start),
            mode,
            max_data_size: 256 * 1024 * 1024,
            reserved_bits: 0
        }
    }

    /// Get the configured maximum payload length.
    pub fn max_data_size(&self) -> usize {
        self.max_data_size
    }

    /// Limit the maximum size of payload data to `size` bytes.
    pub fn set_max_data_size(&mut self, size: usize) -> &mut Self {
        self.max_data_size = size;
        self
    }

    /// The reserved bits currently configured.
    pub fn reserved_bits(&self) -> (bool, bool, bool) {
        let r = self.reserved_bits;
        (r & 4 == 4, r & 2 == 2, r & 1 == 1)
    }

    /// Add to the reserved bits in use.
    pub fn add_reserved_bits(&mut self, bits: (bool, bool, bool)) -> &mut Self {
        let (r1, r2, r3) = bits;
        self.reserved_bits |= (r1 as u8) << 2 | (r2 as u8) << 1 | r3 as u8;
        self
    }

    /// Decode the next frame from `buf`, or return `Ok(None)` if the
    /// buffer does not yet hold a complete frame.
    ///
    /// Decoded payload data is unmasked.
    pub fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Frame>, Error> {
        loop {
            match self.state.take() {
                Some(DecodeState::Start) => {
                    if buf.len() < 2 {
                        self.state = Some(DecodeState::Start);
                        return Ok(None)
                    }

                    let header_bytes = buf.split_to(2);
                    let first = header_bytes[0];
                    let second = header_bytes[1];

                    let fin = first & 0x80 != 0;
                    let opcode = OpCode::try_from(first & 0xF)?;
                    if opcode.is_control() && !fin {
                        return Err(Error::FragmentedControl)
                    }

                    let mut frame = Frame::new(opcode);
                    frame.set_fin(fin);

                    let rsv1 = first & 0x40 != 0;
                    if rsv1 && (self.reserved_bits & 4 == 0) {
                        return Err(Error::InvalidReservedBit(1))
                    }
                    frame.set_rsv1(rsv1);

                    let rsv2 = first & 0x20 != 0;
                    if rsv2 && (self.reserved_bits & 2 == 0) {
                        return Err(Error::InvalidReservedBit(2))
                    }
                    frame.set_rsv2(rsv2);

                    let rsv3 = first & 0x10 != 0;
                    if rsv3 && (self.reserved_bits & 1 == 0) {
                        return Err(Error::InvalidReservedBit(3))
                    }
                    frame.set_rsv3(rsv3);

                    // Clients must mask what they send, servers must not.
                    let masked = second & 0x80 != 0;
                    if masked != self.mode.is_server() {
                        return Err(Error::InvalidMaskBit)
                    }
                    frame.masked = masked;

                    self.state = Some(DecodeState::Length { frame, length_code: second & 0x7F })
                }
                Some(DecodeState::Length { frame, length_code }) => {
                    let len = match length_code {
                        TWO_EXT => {
                            if buf.len() < 2 {
                                self.state = Some(DecodeState::Length { frame, length_code });
                                return Ok(None)
                            }
                            let len = u16::from_be_bytes([buf[0], buf[1]]);
                            buf.split_to(2);
                            u64::from(len)
                        }
                        EIGHT_EXT => {
                            if buf.len() < 8 {
                                self.state = Some(DecodeState::Length { frame, length_code });
                                return Ok(None)
                            }
                            if buf[0] & 0x80 != 0 {
                                return Err(Error::LengthMsbSet)
                            }
                            let mut bytes = [0; 8];
                            bytes.copy_from_slice(&buf.split_to(8));
                            u64::from_be_bytes(bytes)
                        }
                        n => u64::from(n)
                    };

                    if len > MAX_CTRL_PAYLOAD as u64 && frame.opcode().is_control() {
                        return Err(Error::InvalidControlFrameLen)
                    }

                    if len > self.max_data_size as u64 {
                        return Err(Error::PayloadTooLarge {
                            actual: len,
                            maximum: self.max_data_size as u64
                        })
                    }

                    self.state = Some(DecodeState::Mask { frame, length: len as usize })
                }
                Some(DecodeState::Mask { mut frame, length }) => {
                    if !frame.is_masked() {
                        self.state = Some(DecodeState::Body { frame, length });
                        continue
                    }
                    if buf.len() < 4 {
                        self.state = Some(DecodeState::Mask { frame, length });
                        return Ok(None)
                    }
                    frame.mask = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
                    buf.split_to(4);
                    self.state = Some(DecodeState::Body { frame, length })
                }
                Some(DecodeState::Body { mut frame, length }) => {
                    if buf.len() < length {
                        self.state = Some(DecodeState::Body { frame, length });
                        return Ok(None)
                    }
                    frame.payload = buf.split_to(length);
                    if frame.is_masked() {
                        let mask = frame.mask();
                        apply_mask(&mut frame.payload, mask)
                    }
                    self.state = Some(DecodeState::Start);
                    return Ok(Some(frame))
                }
                None => return Err(Error::IllegalCodecState)
            }
        }
    }

    /// Encode a frame into `buf`, choosing the shortest length encoding.
    ///
    /// In client mode a fresh random masking key is generated and applied
    /// to every frame; in server mode no masking takes place, whatever the
    /// frame's own flags say.
    pub fn encode(&mut self, mut frame: Frame, buf: &mut BytesMut) -> Result<(), Error> {
        if frame.opcode().is_control() {
            if !frame.is_fin() {
                return Err(Error::FragmentedControl)
            }
            if frame.payload_len() > MAX_CTRL_PAYLOAD {
                return Err(Error::InvalidControlFrameLen)
            }
        }

        if self.mode.is_client() {
            frame.masked = true;
            frame.mask = rand::random()
        } else {
            frame.masked = false;
            frame.mask = 0
        }

        let mut first_byte = 0_u8;
        if frame.is_fin() {
            first_byte |= 0x80
        }
        if frame.is_rsv1() {
            first_byte |= 0x40
        }
        if frame.is_rsv2() {
            first_byte |= 0x20
        }
        if frame.is_rsv3() {
            first_byte |= 0x10
        }
        first_byte |= u8::from(frame.opcode());

        let mut second_byte = 0_u8;
        if frame.is_masked() {
            second_byte |= 0x80
        }

        let len = frame.payload_len();
        buf.reserve(14 + len);
        buf.extend_from_slice(&[first_byte]);

        if len < usize::from(TWO_EXT) {
            second_byte |= len as u8;
            buf.extend_from_slice(&[second_byte])
        } else if len <= usize::from(u16::max_value()) {
            second_byte |= TWO_EXT;
            buf.extend_from_slice(&[second_byte]);
            buf.extend_from_slice(&(len as u16).to_be_bytes())
        } else {
            second_byte |= EIGHT_EXT;
            buf.extend_from_slice(&[second_byte]);
            buf.extend_from_slice(&(len as u64).to_be_bytes())
        }

        if frame.is_masked() {
            buf.extend_from_slice(&frame.mask().to_be_bytes());
            let mask = frame.mask();
            apply_mask(&mut frame.payload, mask)
        }

        buf.extend_from_slice(&frame.payload);
        Ok(())
    }
}

// Apply the masking key to the payload data.
fn apply_mask(buf: &mut [u8], mask: u32) {
    let mask_buf = mask.to_be_bytes();
    for (byte, &key) in buf.iter_mut().zip(mask_buf.iter().cycle()) {
        *byte ^= key;
    }
}

// Codec error type ///////////////////////////////////////////////////////////////////////////////

/// Errors produced while encoding or decoding frames.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// Some unknown opcode number has been decoded.
    #[error("unknown opcode")]
    UnknownOpCode,

    /// A fragmented control frame (fin bit not set) has been decoded.
    #[error("fragmented control frame")]
    FragmentedControl,

    /// A control frame with an invalid length code has been decoded.
    #[error("invalid control frame length")]
    InvalidControlFrameLen,

    /// A reserved bit was set without an extension claiming it.
    #[error("invalid reserved bit: {0}")]
    InvalidReservedBit(u8),

    /// The most significant bit of the 8-byte payload length was set.
    #[error("most significant bit of payload length is set")]
    LengthMsbSet,

    /// The frame's masking did not match the peer's role.
    #[error("frame masking does not match connection mode")]
    InvalidMaskBit,

    /// The payload length of a frame exceeded the configured maximum.
    #[error("payload too large: len = {actual}, maximum = {maximum}")]
    PayloadTooLarge {
        /// The length of the offending frame.
        actual: u64,
        /// The configured per-frame limit.
        maximum: u64
    },

    /// The codec transitioned into an illegal state.
    /// This happens if the codec is used after it has returned an error.
    #[error("illegal codec state")]
    IllegalCodecState
}

impl From<UnknownOpCode> for Error {
    fn from(_: UnknownOpCode) -> Self {
        Error::UnknownOpCode
    }
}

// Tests //////////////////////////////////////////////////////////////////////////////////////////
