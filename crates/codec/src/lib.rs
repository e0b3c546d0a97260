//! ## Session Traversal Utilities for NAT (STUN)
//!
//! [RFC8445]: https://tools.ietf.org/html/rfc8445
//! [RFC5389]: https://tools.ietf.org/html/rfc5389
//! [Section 13]: https://tools.ietf.org/html/rfc8489#section-13
//!
//! ### STUN Message Structure
//!
//! ```text
//! 0                   1                   2                   3
//! 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |0 0|     STUN Message Type     |         Message Length        |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                         Magic Cookie                          |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                                                               |
//! |                     Transaction ID (96 bits)                  |
//! |                                                               |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```
//!
//! STUN is intended to be used in the context of one or more NAT
//! traversal solutions.  These solutions are known as "STUN Usages".
//! Each usage describes how STUN is utilized to achieve the NAT
//! traversal solution.  Typically, a usage indicates when STUN messages
//! get sent, which optional attributes to include, what server is used,
//! and what authentication mechanism is to be used.  Interactive
//! Connectivity Establishment (ICE) [RFC8445] is one usage of STUN,
//! TURN relaying is another.  More information on STUN Usages can be
//! found in [Section 13].

pub mod attribute;
pub mod channel_data;
pub mod crypto;
pub mod message;
pub mod util;

pub use channel_data::ChannelData;
pub use message::{Kind, MessageReader, MessageWriter, Method};

use self::attribute::AttrKind;

use std::{array::TryFromSliceError, ops::Range, str::Utf8Error};

/// The fixed magic cookie carried by every modern STUN message.
pub const COOKIE: [u8; 4] = 0x2112A442u32.to_be_bytes();

#[derive(Debug)]
pub enum Error {
    InvalidInput,
    SummaryFailed,
    NotFoundIntegrity,
    IntegrityFailed,
    NotFoundMagicNumber,
    UnknownMethod,
    Utf8Error(Utf8Error),
    TryFromSliceError(TryFromSliceError),
}

impl std::error::Error for Error {}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl From<Utf8Error> for Error {
    fn from(value: Utf8Error) -> Self {
        Self::Utf8Error(value)
    }
}

impl From<TryFromSliceError> for Error {
    fn from(value: TryFromSliceError) -> Self {
        Self::TryFromSliceError(value)
    }
}

/// Which revision of the STUN family a peer speaks.
///
/// The wire codec is shared; the variant decides whether the magic
/// cookie is required on inbound messages, whether addresses should be
/// exchanged XOR-obfuscated, and which credential mechanism applies.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum RfcVariant {
    /// Classic STUN. No magic cookie check, plain MAPPED-ADDRESS.
    Rfc3489,
    /// Modern STUN.
    #[default]
    Rfc5389,
    /// ICE connectivity checks, short-term credentials.
    Rfc5245Ice,
    /// TURN allocations, long-term credentials.
    Rfc5766Turn,
}

/// Credential mechanism selected by an [`RfcVariant`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialMechanism {
    None,
    ShortTerm,
    LongTerm,
}

impl RfcVariant {
    /// whether inbound messages must carry the magic cookie.
    pub fn requires_cookie(&self) -> bool {
        !matches!(self, Self::Rfc3489)
    }

    /// whether addresses travel XOR-obfuscated.
    pub fn xor_addresses(&self) -> bool {
        !matches!(self, Self::Rfc3489)
    }

    pub fn credential_mechanism(&self) -> CredentialMechanism {
        match self {
            Self::Rfc5245Ice => CredentialMechanism::ShortTerm,
            Self::Rfc5766Turn => CredentialMechanism::LongTerm,
            _ => CredentialMechanism::None,
        }
    }
}

pub enum Payload<'a, 'b> {
    Message(MessageReader<'a, 'b>),
    ChannelData(ChannelData<'a>),
}

/// A cache of the list of attributes, this is for internal use only.
#[derive(Debug, Clone)]
pub struct Attributes(Vec<(AttrKind, Range<usize>)>);

impl Default for Attributes {
    fn default() -> Self {
        Self(Vec::with_capacity(20))
    }
}

impl Attributes {
    pub fn append(&mut self, kind: AttrKind, range: Range<usize>) {
        self.0.push((kind, range));
    }

    /// Gets an attribute from the list.
    ///
    /// Note: This function will only look for the first matching
    /// attribute in the list and return it.
    pub fn get(&self, kind: &AttrKind) -> Option<Range<usize>> {
        self.0
            .iter()
            .find(|(k, _)| k == kind)
            .map(|(_, v)| v.clone())
    }

    /// Gets all the values of an attribute from the list.
    ///
    /// A stun message can carry multiple attributes with the same type,
    /// this returns every occurrence in message order.
    pub fn get_all<'a>(&'a self, kind: AttrKind) -> impl Iterator<Item = &'a Range<usize>> {
        self.0.iter().filter(move |(k, _)| *k == kind).map(|(_, v)| v)
    }

    pub fn clear(&mut self) {
        if !self.0.is_empty() {
            self.0.clear();
        }
    }
}

/// Streaming decoder with a reusable attribute cache.
#[derive(Default)]
pub struct Decoder(Attributes);

impl Decoder {
    /// # Test
    ///
    /// ```
    /// use icelink_codec::attribute::UserName;
    /// use icelink_codec::{Decoder, Payload};
    ///
    /// let buffer = [
    ///     0x00, 0x01, 0x00, 0x4c, 0x21, 0x12, 0xa4, 0x42, 0x71, 0x66, 0x46, 0x31,
    ///     0x2b, 0x59, 0x79, 0x65, 0x56, 0x69, 0x32, 0x72, 0x00, 0x06, 0x00, 0x09,
    ///     0x55, 0x43, 0x74, 0x39, 0x3a, 0x56, 0x2f, 0x2b, 0x2f, 0x00, 0x00, 0x00,
    ///     0xc0, 0x57, 0x00, 0x04, 0x00, 0x00, 0x03, 0xe7, 0x80, 0x29, 0x00, 0x08,
    ///     0x22, 0x49, 0xda, 0x28, 0x2c, 0x6f, 0x2e, 0xdb, 0x00, 0x24, 0x00, 0x04,
    ///     0x6e, 0x00, 0x28, 0xff, 0x00, 0x08, 0x00, 0x14, 0x19, 0x58, 0xda, 0x38,
    ///     0xed, 0x1e, 0xdd, 0xc8, 0x6b, 0x8e, 0x22, 0x63, 0x3a, 0x22, 0x63, 0x97,
    ///     0xcf, 0xf5, 0xde, 0x82, 0x80, 0x28, 0x00, 0x04, 0x56, 0xf7, 0xa3, 0xed,
    /// ];
    ///
    /// let mut decoder = Decoder::default();
    /// let payload = decoder.decode(&buffer).unwrap();
    ///
    /// if let Payload::Message(reader) = payload {
    ///     assert!(reader.get::<UserName>().is_some())
    /// }
    /// ```
    pub fn decode<'a>(&'a mut self, bytes: &'a [u8]) -> Result<Payload<'a, 'a>, Error> {
        if bytes.len() < 4 {
            return Err(Error::InvalidInput);
        }

        let flag = bytes[0] >> 6;
        if flag > 3 {
            return Err(Error::InvalidInput);
        }

        Ok(if flag == 0 {
            self.0.clear();

            Payload::Message(MessageReader::decode(bytes, &mut self.0)?)
        } else {
            Payload::ChannelData(ChannelData::decode(bytes)?)
        })
    }

    /// Size of the leading message in the buffer, padding included for
    /// tcp framed channel data.
    ///
    /// # Test
    ///
    /// ```
    /// use icelink_codec::Decoder;
    ///
    /// let buffer = [
    ///     0x00, 0x01, 0x00, 0x00, 0x21, 0x12, 0xa4, 0x42, 0x71, 0x66, 0x46, 0x31,
    ///     0x2b, 0x59, 0x79, 0x65, 0x56, 0x69, 0x32, 0x72,
    /// ];
    ///
    /// let size = Decoder::message_size(&buffer, false).unwrap();
    ///
    /// assert_eq!(size, 20);
    /// ```
    pub fn message_size(bytes: &[u8], is_tcp: bool) -> Result<usize, Error> {
        if bytes.len() < 4 {
            return Err(Error::InvalidInput);
        }

        let flag = bytes[0] >> 6;
        if flag > 3 {
            return Err(Error::InvalidInput);
        }

        Ok(if flag == 0 {
            MessageReader::message_size(bytes)?
        } else {
            ChannelData::message_size(bytes, is_tcp)?
        })
    }
}
