use bytes::{BufMut, BytesMut};

use crate::attribute::{AttrKind, MessageIntegrity, Property};
use crate::{Attributes, COOKIE, Error, util};

const ZERO_BUF: [u8; 10] = [0u8; 10];

/// STUN message class.
#[derive(PartialEq, Eq, Hash, Debug, Clone, Copy)]
pub enum Kind {
    Request,
    Response,
    Error,
}

/// STUN Methods Registry
///
/// [RFC8489]: https://datatracker.ietf.org/doc/html/rfc8489
/// [RFC8126]: https://datatracker.ietf.org/doc/html/rfc8126
/// [Section 5]: https://datatracker.ietf.org/doc/html/rfc8489#section-5
///
/// A STUN method is a hex number in the range 0x000-0x0FF.  The encoding
/// of a STUN method into a STUN message is described in [Section 5].
///
/// STUN methods in the range 0x000-0x07F are assigned by IETF Review
/// [RFC8126].
///
/// 0x001: Binding
/// 0x003: Allocate
/// 0x004: Refresh
/// 0x006: Send
/// 0x007: Data
/// 0x008: CreatePermission
/// 0x009: ChannelBind
///
/// The reliable-channel methods are not IANA assigned; they ride in the
/// gaps of the request registry and are only ever exchanged between two
/// endpoints of this library.
#[derive(PartialEq, Eq, Hash, Debug, Clone, Copy)]
pub enum Method {
    Binding(Kind),
    BindingIndication,
    Allocate(Kind),
    CreatePermission(Kind),
    ChannelBind(Kind),
    Refresh(Kind),
    ReliableChannelOpen(Kind),
    ReliableAck(Kind),
    SendIndication,
    DataIndication,
}

impl Method {
    /// whether this method expects a response to come back.
    pub fn is_request(&self) -> bool {
        matches!(
            self,
            Method::Binding(Kind::Request)
                | Method::Allocate(Kind::Request)
                | Method::CreatePermission(Kind::Request)
                | Method::ChannelBind(Kind::Request)
                | Method::Refresh(Kind::Request)
                | Method::ReliableChannelOpen(Kind::Request)
                | Method::ReliableAck(Kind::Request)
        )
    }

    /// success or error response counterpart of a request method.
    pub fn response(&self, kind: Kind) -> Method {
        match self {
            Method::Binding(_) => Method::Binding(kind),
            Method::Allocate(_) => Method::Allocate(kind),
            Method::CreatePermission(_) => Method::CreatePermission(kind),
            Method::ChannelBind(_) => Method::ChannelBind(kind),
            Method::Refresh(_) => Method::Refresh(kind),
            Method::ReliableChannelOpen(_) => Method::ReliableChannelOpen(kind),
            Method::ReliableAck(_) => Method::ReliableAck(kind),
            other => *other,
        }
    }
}

impl TryFrom<u16> for Method {
    type Error = crate::Error;

    /// # Test
    ///
    /// ```
    /// use icelink_codec::{Kind, Method};
    ///
    /// assert_eq!(Method::try_from(0x0001).unwrap(), Method::Binding(Kind::Request));
    /// assert_eq!(Method::try_from(0x0101).unwrap(), Method::Binding(Kind::Response));
    /// assert_eq!(Method::try_from(0x0111).unwrap(), Method::Binding(Kind::Error));
    /// assert_eq!(Method::try_from(0x0011).unwrap(), Method::BindingIndication);
    /// assert_eq!(Method::try_from(0x0003).unwrap(), Method::Allocate(Kind::Request));
    /// assert_eq!(Method::try_from(0x0016).unwrap(), Method::SendIndication);
    /// assert_eq!(Method::try_from(0x0017).unwrap(), Method::DataIndication);
    /// ```
    fn try_from(value: u16) -> Result<Self, crate::Error> {
        Ok(match value {
            0x0001 => Self::Binding(Kind::Request),
            0x0101 => Self::Binding(Kind::Response),
            0x0111 => Self::Binding(Kind::Error),
            0x0011 => Self::BindingIndication,
            0x0003 => Self::Allocate(Kind::Request),
            0x0103 => Self::Allocate(Kind::Response),
            0x0113 => Self::Allocate(Kind::Error),
            0x0008 => Self::CreatePermission(Kind::Request),
            0x0108 => Self::CreatePermission(Kind::Response),
            0x0118 => Self::CreatePermission(Kind::Error),
            0x0009 => Self::ChannelBind(Kind::Request),
            0x0109 => Self::ChannelBind(Kind::Response),
            0x0119 => Self::ChannelBind(Kind::Error),
            0x0004 => Self::Refresh(Kind::Request),
            0x0104 => Self::Refresh(Kind::Response),
            0x0114 => Self::Refresh(Kind::Error),
            0x0005 => Self::ReliableChannelOpen(Kind::Request),
            0x0105 => Self::ReliableChannelOpen(Kind::Response),
            0x0115 => Self::ReliableChannelOpen(Kind::Error),
            0x000A => Self::ReliableAck(Kind::Request),
            0x010A => Self::ReliableAck(Kind::Response),
            0x011A => Self::ReliableAck(Kind::Error),
            0x0016 => Self::SendIndication,
            0x0017 => Self::DataIndication,
            _ => return Err(Error::UnknownMethod),
        })
    }
}

impl From<Method> for u16 {
    fn from(val: Method) -> Self {
        match val {
            Method::Binding(Kind::Request) => 0x0001,
            Method::Binding(Kind::Response) => 0x0101,
            Method::Binding(Kind::Error) => 0x0111,
            Method::BindingIndication => 0x0011,
            Method::Allocate(Kind::Request) => 0x0003,
            Method::Allocate(Kind::Response) => 0x0103,
            Method::Allocate(Kind::Error) => 0x0113,
            Method::CreatePermission(Kind::Request) => 0x0008,
            Method::CreatePermission(Kind::Response) => 0x0108,
            Method::CreatePermission(Kind::Error) => 0x0118,
            Method::ChannelBind(Kind::Request) => 0x0009,
            Method::ChannelBind(Kind::Response) => 0x0109,
            Method::ChannelBind(Kind::Error) => 0x0119,
            Method::Refresh(Kind::Request) => 0x0004,
            Method::Refresh(Kind::Response) => 0x0104,
            Method::Refresh(Kind::Error) => 0x0114,
            Method::ReliableChannelOpen(Kind::Request) => 0x0005,
            Method::ReliableChannelOpen(Kind::Response) => 0x0105,
            Method::ReliableChannelOpen(Kind::Error) => 0x0115,
            Method::ReliableAck(Kind::Request) => 0x000A,
            Method::ReliableAck(Kind::Response) => 0x010A,
            Method::ReliableAck(Kind::Error) => 0x011A,
            Method::SendIndication => 0x0016,
            Method::DataIndication => 0x0017,
        }
    }
}

pub struct MessageWriter<'a> {
    token: &'a [u8],
    raw: &'a mut BytesMut,
}

impl<'a> MessageWriter<'a> {
    /// start a new message in the buffer.
    pub fn new(method: Method, token: &'a [u8; 12], buf: &'a mut BytesMut) -> Self {
        buf.clear();
        buf.put_u16(method.into());
        buf.put_u16(0);
        buf.put(&COOKIE[..]);
        buf.put(token.as_slice());
        Self { raw: buf, token }
    }

    /// rely on an old message to create a new message.
    ///
    /// # Test
    ///
    /// ```
    /// use bytes::BytesMut;
    /// use icelink_codec::{Attributes, Kind, MessageReader, MessageWriter, Method};
    ///
    /// let buffer = [
    ///     0x00u8, 0x01, 0x00, 0x00, 0x21, 0x12, 0xa4, 0x42, 0x72, 0x6d, 0x49,
    ///     0x42, 0x72, 0x52, 0x64, 0x48, 0x57, 0x62, 0x4b, 0x2b,
    /// ];
    ///
    /// let mut attributes = Attributes::default();
    /// let mut buf = BytesMut::new();
    /// let old = MessageReader::decode(&buffer[..], &mut attributes).unwrap();
    /// MessageWriter::extend(Method::Binding(Kind::Request), &old, &mut buf);
    ///
    /// assert_eq!(&buf[..], &buffer[..]);
    /// ```
    pub fn extend(method: Method, reader: &MessageReader<'a, '_>, buf: &'a mut BytesMut) -> Self {
        buf.clear();
        buf.put_u16(method.into());
        buf.put_u16(0);
        buf.put(&COOKIE[..]);
        buf.put(reader.token);
        Self {
            raw: buf,
            token: reader.token,
        }
    }

    /// append an attribute to the message attribute list.
    ///
    /// # Test
    ///
    /// ```
    /// use bytes::BytesMut;
    /// use icelink_codec::attribute::UserName;
    /// use icelink_codec::{Kind, MessageWriter, Method};
    ///
    /// let token = [
    ///     0x72u8, 0x6d, 0x49, 0x42, 0x72, 0x52, 0x64, 0x48, 0x57, 0x62, 0x4b,
    ///     0x2b,
    /// ];
    ///
    /// let result = [
    ///     0x00u8, 0x01, 0x00, 0x00, 0x21, 0x12, 0xa4, 0x42, 0x72, 0x6d, 0x49,
    ///     0x42, 0x72, 0x52, 0x64, 0x48, 0x57, 0x62, 0x4b, 0x2b, 0x00, 0x06,
    ///     0x00, 0x05, 0x70, 0x61, 0x6e, 0x64, 0x61, 0x00, 0x00, 0x00,
    /// ];
    ///
    /// let mut buf = BytesMut::new();
    /// let mut message = MessageWriter::new(Method::Binding(Kind::Request), &token, &mut buf);
    /// message.append::<UserName>("panda");
    ///
    /// assert_eq!(&buf[20..24], &result[20..24]);
    /// assert_eq!(&buf[24..29], b"panda");
    /// ```
    pub fn append<T: Property<'a>>(&mut self, value: T::Inner) {
        self.raw.put_u16(T::kind() as u16);

        // record the current position, then advance the internal cursor
        // two bytes to reserve space for the value length.
        let os = self.raw.len();
        self.raw.put_u16(0);
        T::into(value, self.raw, self.token);

        // compute write index, back to source index write size.
        let size = self.raw.len() - os - 2;
        let size_buf = (size as u16).to_be_bytes();
        self.raw[os] = size_buf[0];
        self.raw[os + 1] = size_buf[1];

        // pad the value out to a 32-bit boundary with zero bytes.
        let psize = util::pad_size(size);
        if psize > 0 {
            self.raw.put(&ZERO_BUF[0..psize]);
        }
    }

    /// finalise the message.
    ///
    /// Writes the message length, then, when an integrity key is given,
    /// appends MESSAGE-INTEGRITY (second to last) and FINGERPRINT
    /// (always last), each with the length field pre-adjusted per
    /// RFC 5389 section 15.4 / 15.5.
    ///
    /// # Test
    ///
    /// ```
    /// use bytes::BytesMut;
    /// use icelink_codec::crypto::long_term_credential_digest;
    /// use icelink_codec::{Kind, MessageWriter, Method};
    ///
    /// let token = [
    ///     0x72u8, 0x6d, 0x49, 0x42, 0x72, 0x52, 0x64, 0x48, 0x57, 0x62, 0x4b,
    ///     0x2b,
    /// ];
    ///
    /// let result = [
    ///     0x00u8, 0x01, 0x00, 0x20, 0x21, 0x12, 0xa4, 0x42, 0x72, 0x6d, 0x49,
    ///     0x42, 0x72, 0x52, 0x64, 0x48, 0x57, 0x62, 0x4b, 0x2b, 0x00, 0x08,
    ///     0x00, 0x14, 0x45, 0x0e, 0x6e, 0x44, 0x52, 0x1e, 0xe8, 0xde, 0x2c,
    ///     0xf0, 0xfa, 0xb6, 0x9c, 0x5c, 0x19, 0x17, 0x98, 0xc6, 0xd9, 0xde,
    ///     0x80, 0x28, 0x00, 0x04, 0xed, 0x41, 0xb6, 0xbe,
    /// ];
    ///
    /// let mut buf = BytesMut::with_capacity(1280);
    /// let mut message = MessageWriter::new(Method::Binding(Kind::Request), &token, &mut buf);
    /// message
    ///     .flush(Some(&long_term_credential_digest("panda", "panda", "raspberry")))
    ///     .unwrap();
    ///
    /// assert_eq!(&buf[..], &result[..]);
    /// ```
    pub fn flush(&mut self, auth: Option<&[u8]>) -> Result<(), Error> {
        // write attribute list size.
        let size = (self.raw.len() - 20) as u16;
        let size_buf = size.to_be_bytes();
        self.raw[2] = size_buf[0];
        self.raw[3] = size_buf[1];

        if let Some(a) = auth {
            self.integrity(a)?;
        }

        Ok(())
    }

    /// append MESSAGE-INTEGRITY and FINGERPRINT attributes.
    fn integrity(&mut self, auth: &[u8]) -> Result<(), Error> {
        if self.raw.len() < 20 {
            return Err(Error::InvalidInput);
        }

        // the integrity digest runs over the message with the length
        // field already counting the integrity attribute itself.
        let mut buf_size = (self.raw.len() + 4) as u16;
        let size_buf = buf_size.to_be_bytes();
        self.raw[2] = size_buf[0];
        self.raw[3] = size_buf[1];

        let hmac_output = crate::crypto::hmac_sha1(auth, &[self.raw])?;

        self.raw.put_u16(AttrKind::MessageIntegrity as u16);
        self.raw.put_u16(20);
        self.raw.put(&hmac_output[..]);

        // same adjustment again for the fingerprint attribute.
        buf_size += 8;
        let size_buf = buf_size.to_be_bytes();
        self.raw[2] = size_buf[0];
        self.raw[3] = size_buf[1];

        self.raw.put_u16(AttrKind::Fingerprint as u16);
        self.raw.put_u16(4);
        let crc = crate::crypto::fingerprint(self.raw);
        self.raw.put_u32(crc);

        Ok(())
    }
}

#[derive(Debug)]
pub struct MessageReader<'a, 'b> {
    /// message type.
    pub method: Method,
    /// message transaction id.
    pub token: &'a [u8],
    /// the magic cookie field as found on the wire.
    pub cookie: [u8; 4],
    /// message source bytes.
    buf: &'a [u8],
    /// offset of the MESSAGE-INTEGRITY attribute, when present.
    valid_offset: u16,
    /// message attribute list.
    attributes: &'b Attributes,
}

impl<'a, 'b> MessageReader<'a, 'b> {
    /// get the first attribute of the given type.
    pub fn get<T: Property<'a>>(&self) -> Option<T::Inner> {
        self.attributes
            .get(&T::kind())
            .and_then(|r| T::try_from(&self.buf[r], self.token).ok())
    }

    /// get every occurrence of the given attribute type, in order.
    pub fn get_all<T: Property<'a>>(&'a self) -> impl Iterator<Item = T::Inner> + 'a {
        self.attributes
            .get_all(T::kind())
            .filter_map(|r| T::try_from(&self.buf[r.clone()], self.token).ok())
    }

    /// check the MESSAGE-INTEGRITY attribute.
    ///
    /// The digest covers the message prefix up to but not including the
    /// integrity attribute, with the header length field adjusted to
    /// include the attribute itself.
    ///
    /// # Test
    ///
    /// ```
    /// use icelink_codec::crypto::long_term_credential_digest;
    /// use icelink_codec::{Attributes, MessageReader};
    ///
    /// let buffer = [
    ///     0x00u8, 0x03, 0x00, 0x50, 0x21, 0x12, 0xa4, 0x42, 0x64, 0x4f, 0x5a,
    ///     0x78, 0x6a, 0x56, 0x33, 0x62, 0x4b, 0x52, 0x33, 0x31, 0x00, 0x19,
    ///     0x00, 0x04, 0x11, 0x00, 0x00, 0x00, 0x00, 0x06, 0x00, 0x05, 0x70,
    ///     0x61, 0x6e, 0x64, 0x61, 0x00, 0x00, 0x00, 0x00, 0x14, 0x00, 0x09,
    ///     0x72, 0x61, 0x73, 0x70, 0x62, 0x65, 0x72, 0x72, 0x79, 0x00, 0x00,
    ///     0x00, 0x00, 0x15, 0x00, 0x10, 0x31, 0x63, 0x31, 0x33, 0x64, 0x32,
    ///     0x62, 0x32, 0x34, 0x35, 0x62, 0x33, 0x61, 0x37, 0x33, 0x34, 0x00,
    ///     0x08, 0x00, 0x14, 0xd6, 0x78, 0x26, 0x99, 0x0e, 0x15, 0x56, 0x15,
    ///     0xe5, 0xf4, 0x24, 0x74, 0xe2, 0x3c, 0x26, 0xc5, 0xb1, 0x03, 0xb2,
    ///     0x6d,
    /// ];
    ///
    /// let mut attributes = Attributes::default();
    /// let message = MessageReader::decode(&buffer[..], &mut attributes).unwrap();
    /// let result = message
    ///     .integrity(&long_term_credential_digest("panda", "panda", "raspberry"))
    ///     .is_ok();
    ///
    /// assert!(result);
    /// ```
    pub fn integrity(&self, auth: &[u8]) -> Result<(), Error> {
        if self.buf.is_empty() || self.valid_offset < 20 {
            return Err(Error::InvalidInput);
        }

        let integrity = self
            .get::<MessageIntegrity>()
            .ok_or(Error::NotFoundIntegrity)?;

        // the header length is rewritten to cover the integrity
        // attribute before digesting.
        let size_buf = (self.valid_offset + 4).to_be_bytes();
        let body = [
            &self.buf[0..2],
            &size_buf[..],
            &self.buf[4..self.valid_offset as usize],
        ];

        let hmac_output = crate::crypto::hmac_sha1(auth, &body)?;
        if integrity != hmac_output {
            return Err(Error::IntegrityFailed);
        }

        Ok(())
    }

    /// whether this message is the response matching a previously sent
    /// request.
    ///
    /// The transaction id must be equal and, for the modern variants,
    /// the magic cookie must be intact.
    pub fn is_valid_response_to(&self, token: &[u8; 12], variant: crate::RfcVariant) -> bool {
        if variant.requires_cookie() && self.cookie != COOKIE {
            return false;
        }

        if self.token != token {
            return false;
        }

        matches!(
            self.method,
            Method::Binding(Kind::Response)
                | Method::Binding(Kind::Error)
                | Method::Allocate(Kind::Response)
                | Method::Allocate(Kind::Error)
                | Method::CreatePermission(Kind::Response)
                | Method::CreatePermission(Kind::Error)
                | Method::ChannelBind(Kind::Response)
                | Method::ChannelBind(Kind::Error)
                | Method::Refresh(Kind::Response)
                | Method::Refresh(Kind::Error)
                | Method::ReliableChannelOpen(Kind::Response)
                | Method::ReliableChannelOpen(Kind::Error)
                | Method::ReliableAck(Kind::Response)
                | Method::ReliableAck(Kind::Error)
        )
    }

    /// # Test
    ///
    /// ```
    /// use icelink_codec::attribute::UserName;
    /// use icelink_codec::{Attributes, Kind, MessageReader, Method};
    ///
    /// let buffer: [u8; 20] = [
    ///     0x00, 0x01, 0x00, 0x00, 0x21, 0x12, 0xa4, 0x42, 0x72, 0x6d, 0x49,
    ///     0x42, 0x72, 0x52, 0x64, 0x48, 0x57, 0x62, 0x4b, 0x2b,
    /// ];
    ///
    /// let mut attributes = Attributes::default();
    /// let message = MessageReader::decode(&buffer[..], &mut attributes).unwrap();
    ///
    /// assert_eq!(message.method, Method::Binding(Kind::Request));
    /// assert!(message.get::<UserName>().is_none());
    /// ```
    pub fn decode(buf: &'a [u8], attributes: &'b mut Attributes) -> Result<Self, Error> {
        if buf.len() < 20 || buf[0] >> 6 != 0 {
            return Err(Error::InvalidInput);
        }

        let mut find_integrity = false;
        let mut valid_offset = 0;
        let count_size = buf.len();

        let method = Method::try_from(util::as_u16(&buf[..2]))?;
        let size = util::as_u16(&buf[2..4]) as usize + 20;
        if size % 4 != 0 || count_size < size {
            return Err(Error::InvalidInput);
        }

        let cookie: [u8; 4] = buf[4..8].try_into()?;
        let token = &buf[8..20];
        let mut offset = 20;

        loop {
            // if the buf length is not long enough to continue, jump out
            // of the loop.
            if offset + 4 > size {
                break;
            }

            let key = util::as_u16(&buf[offset..offset + 2]);

            // until the MESSAGE-INTEGRITY attribute shows up, keep
            // tracking the offset it would cover.
            if !find_integrity {
                valid_offset = offset as u16;
            }

            if key == AttrKind::MessageIntegrity as u16 {
                find_integrity = true;
            }

            let value_size = util::as_u16(&buf[offset + 2..offset + 4]) as usize;

            offset += 4;
            if offset + value_size > size {
                break;
            }

            let range = offset..(offset + value_size);

            if value_size > 0 {
                offset += value_size;
                offset += util::pad_size(value_size);
            }

            // skip the attributes that are not supported.
            let attrkind = match AttrKind::try_from(key) {
                Err(_) => continue,
                Ok(a) => a,
            };

            attributes.append(attrkind, range);
        }

        Ok(Self {
            buf,
            token,
            cookie,
            method,
            attributes,
            valid_offset,
        })
    }

    /// # Test
    ///
    /// ```
    /// use icelink_codec::MessageReader;
    ///
    /// let buffer: [u8; 20] = [
    ///     0x00, 0x01, 0x00, 0x00, 0x21, 0x12, 0xa4, 0x42, 0x72, 0x6d, 0x49,
    ///     0x42, 0x72, 0x52, 0x64, 0x48, 0x57, 0x62, 0x4b, 0x2b,
    /// ];
    ///
    /// let size = MessageReader::message_size(&buffer[..]).unwrap();
    ///
    /// assert_eq!(size, 20);
    /// ```
    pub fn message_size(buf: &[u8]) -> Result<usize, Error> {
        if buf.len() < 20 || buf[0] >> 6 != 0 {
            return Err(Error::InvalidInput);
        }

        Ok((util::as_u16(&buf[2..4]) + 20) as usize)
    }
}

impl<'a> AsRef<[u8]> for MessageReader<'a, '_> {
    fn as_ref(&self) -> &'a [u8] {
        self.buf
    }
}

impl<'a> std::ops::Deref for MessageReader<'a, '_> {
    type Target = [u8];

    fn deref(&self) -> &'a Self::Target {
        self.buf
    }
}
