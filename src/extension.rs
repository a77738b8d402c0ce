// Copyright (c) 2019 Parity Technologies (UK) Ltd.
//
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. All files in the project carrying such notice may not be copied,
// modified, or distributed except according to those terms.

//! Websocket [extensions][ext] as per RFC 6455, section 9.
//!
//! No concrete extension ships with this crate; the trait is the seam
//! through which hosts plug in their own. Registered extensions take part
//! in handshake negotiation, may claim reserved header bits, and get to
//! rewrite complete messages on their way in and out.
//!
//! [ext]: https://tools.ietf.org/html/rfc6455#section-9

use crate::base::Frame;
use crate::BoxedError;
use std::{borrow::Cow, fmt};

/// A websocket extension.
///
/// Extensions are negotiated during the handshake: the offering side sends
/// `name` and [`params`][Extension::params], the answering side calls
/// [`configure`][Extension::configure] with the parameters it received and
/// [`is_enabled`][Extension::is_enabled] decides whether the extension
/// ends up active on the connection.
pub trait Extension: std::fmt::Debug {
    /// Is this extension enabled?
    fn is_enabled(&self) -> bool;

    /// The name of this extension.
    fn name(&self) -> &str;

    /// The parameters this extension wants to send for negotiation.
    fn params(&self) -> &[Param];

    /// Configure this extension with the parameters received from
    /// negotiation.
    fn configure(&mut self, params: &[Param]) -> Result<(), BoxedError>;

    /// Encode a complete outgoing message frame.
    fn encode(&mut self, frame: &mut Frame) -> Result<(), BoxedError>;

    /// Decode a complete incoming message frame.
    fn decode(&mut self, frame: &mut Frame) -> Result<(), BoxedError>;

    /// The reserved bits this extension uses.
    fn reserved_bits(&self) -> (bool, bool, bool) {
        (false, false, false)
    }
}

impl<E: Extension + ?Sized> Extension for Box<E> {
    fn is_enabled(&self) -> bool {
        (**self).is_enabled()
    }

    fn name(&self) -> &str {
        (**self).name()
    }

    fn params(&self) -> &[Param] {
        (**self).params()
    }

    fn configure(&mut self, params: &[Param]) -> Result<(), BoxedError> {
        (**self).configure(params)
    }

    fn encode(&mut self, frame: &mut Frame) -> Result<(), BoxedError> {
        (**self).encode(frame)
    }

    fn decode(&mut self, frame: &mut Frame) -> Result<(), BoxedError> {
        (**self).decode(frame)
    }

    fn reserved_bits(&self) -> (bool, bool, bool) {
        (**self).reserved_bits()
    }
}

/// Extension parameter (used for negotiation).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Param<'a> {
    name: Cow<'a, str>,
    value: Option<Cow<'a, str>>
}

impl<'a> Param<'a> {
    /// Create a new parameter with the given name and no value.
    pub fn new(name: impl Into<Cow<'a, str>>) -> Self {
        Param { name: name.into(), value: None }
    }

    /// The parameter name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The optional parameter value.
    pub fn value(&self) -> Option<&str> {
        self.value.as_ref().map(|v| v.as_ref())
    }

    /// Set the parameter value.
    pub fn set_value(&mut self, value: Option<Cow<'a, str>>) -> &mut Self {
        self.value = value;
        self
    }

    /// Turn this parameter into one that owns its values.
    pub fn acquire(self) -> Param<'static> {
        Param {
            name: Cow::Owned(self.name.into_owned()),
            value: self.value.map(|v| Cow::Owned(v.into_owned()))
        }
    }
}

impl fmt::Display for Param<'_> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if let Some(v) = self.value() {
            write!(f, "{}={}", self.name, v)
        } else {
            write!(f, "{}", self.name)
        }
    }
}
