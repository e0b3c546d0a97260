use bytes::{BufMut, BytesMut};
use num_enum::TryFromPrimitive;

use crate::{Error, util};

/// The following error codes, along with their recommended reason
/// phrases, are defined:
///
/// 300  Try Alternate: The client should contact an alternate server
///      for this request.
///
/// 400  Bad Request: The request was malformed.  The client SHOULD NOT
///      retry the request without modification from the previous
///      attempt.
///
/// 401  Unauthenticated: The request did not contain the correct
///      credentials to proceed.  The client should retry the request
///      with proper credentials.
///
/// 420  Unknown Attribute: The server received a STUN packet containing
///      a comprehension-required attribute that it did not understand.
///
/// 438  Stale Nonce: The NONCE used by the client was no longer valid.
///      The client should retry, using the NONCE provided in the
///      response.
///
/// 500  Server Error: The server has suffered a temporary error.  The
///      client should try again.
#[repr(u16)]
#[derive(TryFromPrimitive, PartialEq, Eq, Copy, Clone, Debug)]
pub enum ErrKind {
    TryAlternate = 0x0300,
    BadRequest = 0x0400,
    Unauthorized = 0x0401,
    Forbidden = 0x0403,
    RequestTimedout = 0x0408,
    UnknownAttribute = 0x0414,
    AllocationMismatch = 0x0425,
    StaleNonce = 0x0426,
    AddressFamilyNotSupported = 0x0428,
    WrongCredentials = 0x0429,
    RoleConflict = 0x0487,
    UnsupportedTransportAddress = 0x042A,
    AllocationQuotaReached = 0x0456,
    ServerError = 0x0500,
    InsufficientCapacity = 0x0508,
}

impl ErrKind {
    pub fn message(&self) -> &'static str {
        match self {
            Self::TryAlternate => "Try Alternate",
            Self::BadRequest => "Bad Request",
            Self::Unauthorized => "Unauthorized",
            Self::Forbidden => "Forbidden",
            Self::RequestTimedout => "Request Timed out",
            Self::UnknownAttribute => "Unknown Attribute",
            Self::AllocationMismatch => "Allocation Mismatch",
            Self::StaleNonce => "Stale Nonce",
            Self::AddressFamilyNotSupported => "Address Family not Supported",
            Self::WrongCredentials => "Wrong Credentials",
            Self::RoleConflict => "Role Conflict",
            Self::UnsupportedTransportAddress => "Unsupported Transport Address",
            Self::AllocationQuotaReached => "Allocation Quota Reached",
            Self::ServerError => "Server Error",
            Self::InsufficientCapacity => "Insufficient Capacity",
        }
    }
}

/// The ERROR-CODE attribute is used in error response messages.  It
/// contains a numeric error code value in the range of 300 to 699 plus
/// a textual reason phrase encoded in UTF-8.
///
/// ```text
/// 0                   1                   2                   3
/// 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |           Reserved, should be 0         |Class|     Number    |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |      Reason Phrase (variable)                                ..
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// ```
///
/// The class of the error code (the hundreds digit) is encoded
/// separately from the rest of the code.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ErrorValue<'a> {
    pub code: u16,
    pub message: &'a str,
}

impl<'a> ErrorValue<'a> {
    /// create an error value from a well-known error kind.
    ///
    /// # Test
    ///
    /// ```
    /// use icelink_codec::attribute::{ErrKind, ErrorValue};
    ///
    /// let value = ErrorValue::from(ErrKind::Unauthorized);
    ///
    /// assert_eq!(value.code, 0x0401);
    /// assert_eq!(value.message, "Unauthorized");
    /// ```
    pub fn from(kind: ErrKind) -> Self {
        Self {
            code: kind as u16,
            message: kind.message(),
        }
    }

    /// whether this error is the given well-known kind.
    pub fn is(&self, kind: ErrKind) -> bool {
        self.code == kind as u16
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u16(0);
        // the class lives in the high byte, the number in the low byte,
        // so the hex form of the code is already the wire form.
        buf.put_u16(self.code);
        buf.put(self.message.as_bytes());
    }

    pub fn decode(packet: &'a [u8]) -> Result<Self, Error> {
        if packet.len() < 4 {
            return Err(Error::InvalidInput);
        }

        if util::as_u16(&packet[..2]) != 0 {
            return Err(Error::InvalidInput);
        }

        let code = util::as_u16(&packet[2..4]);
        let message = std::str::from_utf8(&packet[4..])?;

        Ok(Self { code, message })
    }
}
