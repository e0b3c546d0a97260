pub mod address;
pub mod error;

pub use address::Addr;
pub use error::{ErrKind, ErrorValue};

use bytes::{BufMut, BytesMut};
use num_enum::TryFromPrimitive;

use std::net::SocketAddr;

use crate::{Error, util};

/// attribute type.
#[repr(u16)]
#[derive(TryFromPrimitive, PartialEq, Eq, Hash, Debug, Clone, Copy)]
pub enum AttrKind {
    MappedAddress = 0x0001,
    UserName = 0x0006,
    MessageIntegrity = 0x0008,
    ErrorCode = 0x0009,
    ChannelNumber = 0x000C,
    Lifetime = 0x000D,
    XorPeerAddress = 0x0012,
    Data = 0x0013,
    Realm = 0x0014,
    Nonce = 0x0015,
    XorRelayedAddress = 0x0016,
    RequestedTransport = 0x0019,
    XorMappedAddress = 0x0020,
    Priority = 0x0024,
    UseCandidate = 0x0025,
    Software = 0x8022,
    AlternateServer = 0x8023,
    Fingerprint = 0x8028,
    IceControlled = 0x8029,
    IceControlling = 0x802A,
    MobilityTicket = 0x8030,
}

/// dyn stun/turn message attribute.
pub trait Property<'a> {
    /// current attribute inner type.
    type Inner;
    /// get current attribute type.
    fn kind() -> AttrKind;
    /// write the current attribute to the buffer.
    fn into(value: Self::Inner, buf: &mut BytesMut, token: &'a [u8]);
    /// convert buffer to current attribute.
    fn try_from(buf: &'a [u8], token: &'a [u8]) -> Result<Self::Inner, Error>;
}

/// The transport protocol requested for a TURN allocation.
///
/// The REQUESTED-TRANSPORT value is the IANA protocol number; only UDP
/// is allowed between the server and the peers, TCP shows up when the
/// client-to-server leg runs over a stream.
#[repr(u8)]
#[derive(TryFromPrimitive, PartialEq, Eq, Hash, Debug, Clone, Copy)]
pub enum Transport {
    TCP = 0x06,
    UDP = 0x11,
}

/// The USERNAME attribute is used for message integrity.  It identifies
/// the username and password combination used in the message-integrity
/// check.
///
/// The value of USERNAME is a variable-length value containing the
/// authentication username.  It MUST contain a UTF-8-encoded [RFC3629]
/// sequence of fewer than 509 bytes and MUST have been processed using
/// the OpaqueString profile [RFC8265].
pub struct UserName;
impl<'a> Property<'a> for UserName {
    type Inner = &'a str;

    fn kind() -> AttrKind {
        AttrKind::UserName
    }

    fn into(value: Self::Inner, buf: &mut BytesMut, _: &[u8]) {
        buf.put(value.as_bytes());
    }

    fn try_from(buf: &'a [u8], _: &'a [u8]) -> Result<Self::Inner, Error> {
        Ok(std::str::from_utf8(buf)?)
    }
}

/// The DATA attribute is present in all Send and Data indications.  The
/// value portion of this attribute is variable length and consists of
/// the application data (that is, the data that would immediately
/// follow the UDP header if the data was sent directly between the
/// client and the peer).
pub struct Data;
impl<'a> Property<'a> for Data {
    type Inner = &'a [u8];

    fn kind() -> AttrKind {
        AttrKind::Data
    }

    fn into(value: Self::Inner, buf: &mut BytesMut, _: &[u8]) {
        buf.put(value);
    }

    fn try_from(buf: &'a [u8], _: &'a [u8]) -> Result<Self::Inner, Error> {
        Ok(buf)
    }
}

/// The REALM attribute may be present in requests and responses.
///
/// Presence of the REALM attribute in a request indicates that
/// long-term credentials are being used for authentication.  Presence
/// in certain error responses indicates that the server wishes the
/// client to use a long-term credential in that realm for
/// authentication.
pub struct Realm;
impl<'a> Property<'a> for Realm {
    type Inner = &'a str;

    fn kind() -> AttrKind {
        AttrKind::Realm
    }

    fn into(value: Self::Inner, buf: &mut BytesMut, _: &[u8]) {
        buf.put(value.as_bytes());
    }

    fn try_from(buf: &'a [u8], _: &'a [u8]) -> Result<Self::Inner, Error> {
        Ok(std::str::from_utf8(buf)?)
    }
}

/// The NONCE attribute may be present in requests and responses.  It
/// contains a sequence of qdtext or quoted-pair, without the
/// surrounding quote characters.  See Section 5.4 of [RFC7616] for
/// guidance on selection of nonce values in a server.
pub struct Nonce;
impl<'a> Property<'a> for Nonce {
    type Inner = &'a str;

    fn kind() -> AttrKind {
        AttrKind::Nonce
    }

    fn into(value: Self::Inner, buf: &mut BytesMut, _: &[u8]) {
        buf.put(value.as_bytes());
    }

    fn try_from(buf: &'a [u8], _: &'a [u8]) -> Result<Self::Inner, Error> {
        Ok(std::str::from_utf8(buf)?)
    }
}

/// The SOFTWARE attribute contains a textual description of the
/// software being used by the agent sending the message.  The
/// attribute has no impact on operation of the protocol and serves
/// only as a tool for diagnostic and debugging purposes.
pub struct Software;
impl<'a> Property<'a> for Software {
    type Inner = &'a str;

    fn kind() -> AttrKind {
        AttrKind::Software
    }

    fn into(value: Self::Inner, buf: &mut BytesMut, _: &[u8]) {
        buf.put(value.as_bytes());
    }

    fn try_from(buf: &'a [u8], _: &'a [u8]) -> Result<Self::Inner, Error> {
        Ok(std::str::from_utf8(buf)?)
    }
}

/// The MESSAGE-INTEGRITY attribute contains an HMAC-SHA1 [RFC2104] of
/// the STUN message.  Since it uses the SHA-1 hash, the HMAC will be
/// 20 bytes.
///
/// The text used as input to HMAC is the STUN message, up to and
/// including the attribute preceding the MESSAGE-INTEGRITY attribute.
/// The Length field of the STUN message header is adjusted to point to
/// the end of the MESSAGE-INTEGRITY attribute.
pub struct MessageIntegrity;
impl<'a> Property<'a> for MessageIntegrity {
    type Inner = &'a [u8];

    fn kind() -> AttrKind {
        AttrKind::MessageIntegrity
    }

    fn into(value: Self::Inner, buf: &mut BytesMut, _: &[u8]) {
        buf.put(value);
    }

    fn try_from(buf: &'a [u8], _: &'a [u8]) -> Result<Self::Inner, Error> {
        Ok(buf)
    }
}

/// The MAPPED-ADDRESS attribute indicates a reflexive transport
/// address of the client, in plain binary.  This attribute is used
/// only for backwards compatibility with [RFC3489] clients.
pub struct MappedAddress;
impl<'a> Property<'a> for MappedAddress {
    type Inner = SocketAddr;

    fn kind() -> AttrKind {
        AttrKind::MappedAddress
    }

    fn into(value: Self::Inner, buf: &mut BytesMut, token: &[u8]) {
        Addr::into(&value, token, buf, false)
    }

    fn try_from(buf: &'a [u8], token: &'a [u8]) -> Result<Self::Inner, Error> {
        Addr::try_from(buf, token, false)
    }
}

/// The XOR-MAPPED-ADDRESS attribute is identical to the MAPPED-ADDRESS
/// attribute, except that the reflexive transport address is
/// obfuscated through the XOR function.
pub struct XorMappedAddress;
impl<'a> Property<'a> for XorMappedAddress {
    type Inner = SocketAddr;

    fn kind() -> AttrKind {
        AttrKind::XorMappedAddress
    }

    fn into(value: Self::Inner, buf: &mut BytesMut, token: &[u8]) {
        Addr::into(&value, token, buf, true)
    }

    fn try_from(buf: &'a [u8], token: &'a [u8]) -> Result<Self::Inner, Error> {
        Addr::try_from(buf, token, true)
    }
}

/// The XOR-PEER-ADDRESS specifies the address and port of the peer as
/// seen from the TURN server.  (For example, the peer's
/// server-reflexive transport address if the peer is behind a NAT.)
pub struct XorPeerAddress;
impl<'a> Property<'a> for XorPeerAddress {
    type Inner = SocketAddr;

    fn kind() -> AttrKind {
        AttrKind::XorPeerAddress
    }

    fn into(value: Self::Inner, buf: &mut BytesMut, token: &[u8]) {
        Addr::into(&value, token, buf, true)
    }

    fn try_from(buf: &'a [u8], token: &'a [u8]) -> Result<Self::Inner, Error> {
        Addr::try_from(buf, token, true)
    }
}

/// The XOR-RELAYED-ADDRESS is present in Allocate responses.  It
/// specifies the address and port that the server allocated to the
/// client.
pub struct XorRelayedAddress;
impl<'a> Property<'a> for XorRelayedAddress {
    type Inner = SocketAddr;

    fn kind() -> AttrKind {
        AttrKind::XorRelayedAddress
    }

    fn into(value: Self::Inner, buf: &mut BytesMut, token: &[u8]) {
        Addr::into(&value, token, buf, true)
    }

    fn try_from(buf: &'a [u8], token: &'a [u8]) -> Result<Self::Inner, Error> {
        Addr::try_from(buf, token, true)
    }
}

/// The alternate server represents an alternate transport address
/// identifying a different STUN server that the STUN client should
/// try.  It is encoded in the same way as MAPPED-ADDRESS.
pub struct AlternateServer;
impl<'a> Property<'a> for AlternateServer {
    type Inner = SocketAddr;

    fn kind() -> AttrKind {
        AttrKind::AlternateServer
    }

    fn into(value: Self::Inner, buf: &mut BytesMut, token: &[u8]) {
        Addr::into(&value, token, buf, false)
    }

    fn try_from(buf: &'a [u8], token: &'a [u8]) -> Result<Self::Inner, Error> {
        Addr::try_from(buf, token, false)
    }
}

/// The ERROR-CODE attribute; see [`ErrorValue`].
pub struct ErrorCode;
impl<'a> Property<'a> for ErrorCode {
    type Inner = ErrorValue<'a>;

    fn kind() -> AttrKind {
        AttrKind::ErrorCode
    }

    fn into(value: Self::Inner, buf: &mut BytesMut, _: &[u8]) {
        value.encode(buf);
    }

    fn try_from(buf: &'a [u8], _: &'a [u8]) -> Result<Self::Inner, Error> {
        ErrorValue::decode(buf)
    }
}

/// The LIFETIME attribute represents the duration for which the server
/// will maintain an allocation in the absence of a refresh, in
/// seconds.
pub struct Lifetime;
impl<'a> Property<'a> for Lifetime {
    type Inner = u32;

    fn kind() -> AttrKind {
        AttrKind::Lifetime
    }

    fn into(value: Self::Inner, buf: &mut BytesMut, _: &[u8]) {
        buf.put_u32(value);
    }

    fn try_from(buf: &'a [u8], _: &'a [u8]) -> Result<Self::Inner, Error> {
        if buf.len() != 4 {
            return Err(Error::InvalidInput);
        }

        Ok(u32::from_be_bytes(buf.try_into()?))
    }
}

/// The REQUESTED-TRANSPORT attribute is used by the client to request
/// a specific transport protocol for the allocated transport address.
/// The Protocol field is one byte followed by three RFFU bytes which
/// MUST be set to zero.
pub struct RequestedTransport;
impl<'a> Property<'a> for RequestedTransport {
    type Inner = Transport;

    fn kind() -> AttrKind {
        AttrKind::RequestedTransport
    }

    fn into(value: Self::Inner, buf: &mut BytesMut, _: &[u8]) {
        buf.put_u8(value as u8);
        buf.put(&[0u8; 3][..]);
    }

    fn try_from(buf: &'a [u8], _: &'a [u8]) -> Result<Self::Inner, Error> {
        if buf.is_empty() {
            return Err(Error::InvalidInput);
        }

        Transport::try_from(buf[0]).map_err(|_| Error::InvalidInput)
    }
}

/// The CHANNEL-NUMBER attribute contains the number of the channel.
/// The value portion of this attribute is 4 bytes long and consists of
/// a 16-bit unsigned integer, followed by a two-octet RFFU field.
pub struct ChannelNumber;
impl<'a> Property<'a> for ChannelNumber {
    type Inner = u16;

    fn kind() -> AttrKind {
        AttrKind::ChannelNumber
    }

    fn into(value: Self::Inner, buf: &mut BytesMut, _: &[u8]) {
        buf.put_u16(value);
        buf.put_u16(0);
    }

    fn try_from(buf: &'a [u8], _: &'a [u8]) -> Result<Self::Inner, Error> {
        if buf.len() < 2 {
            return Err(Error::InvalidInput);
        }

        Ok(util::as_u16(buf))
    }
}

/// The PRIORITY attribute indicates the priority that is to be
/// associated with a peer-reflexive candidate, if one will be
/// discovered by this check.
pub struct Priority;
impl<'a> Property<'a> for Priority {
    type Inner = u32;

    fn kind() -> AttrKind {
        AttrKind::Priority
    }

    fn into(value: Self::Inner, buf: &mut BytesMut, _: &[u8]) {
        buf.put_u32(value);
    }

    fn try_from(buf: &'a [u8], _: &'a [u8]) -> Result<Self::Inner, Error> {
        if buf.len() != 4 {
            return Err(Error::InvalidInput);
        }

        Ok(u32::from_be_bytes(buf.try_into()?))
    }
}

/// The USE-CANDIDATE attribute indicates that the candidate pair
/// resulting from this check will be used for transmission of data.
/// The attribute has no content (the Length field of the attribute is
/// zero); it serves as a flag.
pub struct UseCandidate;
impl<'a> Property<'a> for UseCandidate {
    type Inner = ();

    fn kind() -> AttrKind {
        AttrKind::UseCandidate
    }

    fn into(_: Self::Inner, _: &mut BytesMut, _: &[u8]) {}

    fn try_from(_: &'a [u8], _: &'a [u8]) -> Result<Self::Inner, Error> {
        Ok(())
    }
}

/// The ICE-CONTROLLING attribute is present in a Binding request.  The
/// attribute indicates that the client believes it is currently in the
/// controlling role.  The content of the attribute is a 64-bit
/// unsigned integer in network byte order, which contains a random
/// number used for tie-breaking of role conflicts.
pub struct IceControlling;
impl<'a> Property<'a> for IceControlling {
    type Inner = u64;

    fn kind() -> AttrKind {
        AttrKind::IceControlling
    }

    fn into(value: Self::Inner, buf: &mut BytesMut, _: &[u8]) {
        buf.put_u64(value);
    }

    fn try_from(buf: &'a [u8], _: &'a [u8]) -> Result<Self::Inner, Error> {
        if buf.len() != 8 {
            return Err(Error::InvalidInput);
        }

        Ok(u64::from_be_bytes(buf.try_into()?))
    }
}

/// The ICE-CONTROLLED attribute is present in a Binding request.  The
/// attribute indicates that the client believes it is currently in the
/// controlled role.  Same tie-breaker content as ICE-CONTROLLING.
pub struct IceControlled;
impl<'a> Property<'a> for IceControlled {
    type Inner = u64;

    fn kind() -> AttrKind {
        AttrKind::IceControlled
    }

    fn into(value: Self::Inner, buf: &mut BytesMut, _: &[u8]) {
        buf.put_u64(value);
    }

    fn try_from(buf: &'a [u8], _: &'a [u8]) -> Result<Self::Inner, Error> {
        if buf.len() != 8 {
            return Err(Error::InvalidInput);
        }

        Ok(u64::from_be_bytes(buf.try_into()?))
    }
}

/// An opaque ticket handed out by a mobility-capable relay on
/// allocation.  The client replays it on refresh so the allocation
/// survives a local transport address change.
pub struct MobilityTicket;
impl<'a> Property<'a> for MobilityTicket {
    type Inner = &'a [u8];

    fn kind() -> AttrKind {
        AttrKind::MobilityTicket
    }

    fn into(value: Self::Inner, buf: &mut BytesMut, _: &[u8]) {
        buf.put(value);
    }

    fn try_from(buf: &'a [u8], _: &'a [u8]) -> Result<Self::Inner, Error> {
        Ok(buf)
    }
}

/// The FINGERPRINT attribute may be present in all STUN messages.  The
/// value of the attribute is computed as the CRC-32 of the STUN
/// message XOR'ed with the 32-bit value 0x5354554e.
pub struct Fingerprint;
impl<'a> Property<'a> for Fingerprint {
    type Inner = u32;

    fn kind() -> AttrKind {
        AttrKind::Fingerprint
    }

    fn into(value: Self::Inner, buf: &mut BytesMut, _: &[u8]) {
        buf.put_u32(value);
    }

    fn try_from(buf: &'a [u8], _: &'a [u8]) -> Result<Self::Inner, Error> {
        if buf.len() != 4 {
            return Err(Error::InvalidInput);
        }

        Ok(u32::from_be_bytes(buf.try_into()?))
    }
}
