use bytes::{BufMut, BytesMut};

use crate::Error;

/// The ChannelData Message
///
/// The ChannelData message is used to carry application data between
/// the client and the server.  It has the following format:
///
/// ```text
/// 0                   1                   2                   3
/// 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |         Channel Number        |            Length             |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                                                               |
/// |                       Application Data                        |
/// |                                                               |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// ```
///
/// The Length field specifies the length in bytes of the application
/// data field, not including the 4-byte header.  Over stream
/// transports the message is padded out to a multiple of four bytes;
/// the padding is not reflected in the Length field.
pub struct ChannelData<'a> {
    /// channel data bytes.
    pub bytes: &'a [u8],
    /// channel number.
    pub number: u16,
}

impl<'a> ChannelData<'a> {
    pub fn number(&self) -> u16 {
        self.number
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.bytes
    }

    /// The true size of the leading channel data message in the
    /// buffer, including the tcp padding when requested.
    ///
    /// # Test
    ///
    /// ```
    /// use bytes::BytesMut;
    /// use icelink_codec::ChannelData;
    ///
    /// let data: [u8; 2] = [0x40, 0x00];
    /// let mut bytes = BytesMut::with_capacity(1500);
    ///
    /// ChannelData {
    ///     number: 0x4000,
    ///     bytes: &data[..],
    /// }
    /// .encode(&mut bytes);
    ///
    /// assert_eq!(ChannelData::message_size(&bytes[..], false).unwrap(), 6);
    /// assert_eq!(ChannelData::message_size(&bytes[..], true).unwrap(), 8);
    /// ```
    pub fn message_size(bytes: &[u8], is_tcp: bool) -> Result<usize, Error> {
        if bytes.len() < 4 {
            return Err(Error::InvalidInput);
        }

        if !(1..3).contains(&(bytes[0] >> 6)) {
            return Err(Error::InvalidInput);
        }

        let mut size = (u16::from_be_bytes(bytes[2..4].try_into()?) + 4) as usize;
        if is_tcp && (size % 4) > 0 {
            size += 4 - (size % 4);
        }

        Ok(size)
    }

    /// # Test
    ///
    /// ```
    /// use bytes::BytesMut;
    /// use icelink_codec::ChannelData;
    ///
    /// let data: [u8; 4] = [0x40, 0x00, 0x00, 0x40];
    /// let mut bytes = BytesMut::with_capacity(1500);
    ///
    /// ChannelData {
    ///     number: 0x4000,
    ///     bytes: &data[..],
    /// }
    /// .encode(&mut bytes);
    ///
    /// let ret = ChannelData::decode(&bytes[..]).unwrap();
    ///
    /// assert_eq!(ret.number, 0x4000);
    /// assert_eq!(ret.bytes, &data[..]);
    /// ```
    pub fn encode(self, bytes: &mut BytesMut) {
        bytes.clear();
        bytes.put_u16(self.number);
        bytes.put_u16(self.bytes.len() as u16);
        bytes.extend_from_slice(self.bytes);
    }

    pub fn decode(bytes: &'a [u8]) -> Result<Self, Error> {
        if bytes.len() < 4 {
            return Err(Error::InvalidInput);
        }

        let number = u16::from_be_bytes(bytes[..2].try_into()?);
        if !(0x4000..0x8000).contains(&number) {
            return Err(Error::InvalidInput);
        }

        let size = u16::from_be_bytes(bytes[2..4].try_into()?) as usize;
        if size > bytes.len() - 4 {
            return Err(Error::InvalidInput);
        }

        Ok(Self {
            bytes: &bytes[4..4 + size],
            number,
        })
    }
}
