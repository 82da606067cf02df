use bytes::{BufMut, BytesMut};

use crate::Error;

/// Valid TURN channel numbers, RFC 5766 §11: `0x4000` through `0x7FFE`
/// inclusive (`0x7FFF` is reserved).
pub const CHANNEL_NUMBER_RANGE: std::ops::RangeInclusive<u16> = 0x4000..=0x7FFE;

/// A ChannelData message: a 4-byte header (channel number, length)
/// followed by the application payload. Over stream transports the frame
/// is zero-padded to a 4-byte boundary; `length` always denotes the
/// logical (unpadded) size.
pub struct ChannelData<'a> {
    pub bytes: &'a [u8],
    pub number: u16,
}

impl<'a> ChannelData<'a> {
    pub fn number(&self) -> u16 {
        self.number
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.bytes
    }

    /// Size in bytes of the framed message, including header and any
    /// stream padding.
    ///
    /// # Test
    ///
    /// ```
    /// use turn_server_codec::channel_data::ChannelData;
    ///
    /// let bytes = [0x40u8, 0x00, 0x00, 0x05, 1, 2, 3, 4, 5];
    /// assert_eq!(ChannelData::message_size(&bytes, false).unwrap(), 9);
    /// assert_eq!(ChannelData::message_size(&bytes, true).unwrap(), 12);
    /// ```
    pub fn message_size(bytes: &[u8], is_stream: bool) -> Result<usize, Error> {
        if bytes.len() < 4 {
            return Err(Error::InvalidInput);
        }

        if bytes[0] >> 6 != 1 {
            return Err(Error::InvalidInput);
        }

        let mut size = (u16::from_be_bytes(bytes[2..4].try_into()?) as usize) + 4;
        if is_stream && size % 4 != 0 {
            size += 4 - (size % 4);
        }

        Ok(size)
    }

    /// Encode into `bytes`, zero-padding to a 4-byte boundary when
    /// `is_stream` is set.
    ///
    /// # Test
    ///
    /// ```
    /// use bytes::BytesMut;
    /// use turn_server_codec::channel_data::ChannelData;
    ///
    /// let data: [u8; 5] = [1, 2, 3, 4, 5];
    /// let mut bytes = BytesMut::with_capacity(1500);
    ///
    /// ChannelData { number: 0x4000, bytes: &data[..] }.encode(&mut bytes, true);
    /// assert_eq!(bytes.len(), 12);
    /// ```
    pub fn encode(self, bytes: &mut BytesMut, is_stream: bool) {
        bytes.clear();
        bytes.put_u16(self.number);
        bytes.put_u16(self.bytes.len() as u16);
        bytes.extend_from_slice(self.bytes);

        if is_stream {
            let pad = (4 - (bytes.len() % 4)) % 4;
            bytes.put_bytes(0, pad);
        }
    }

    /// Decode a ChannelData frame; `length` may exceed the remainder of
    /// `bytes` only by stream padding, never by a missing byte.
    ///
    /// # Test
    ///
    /// ```
    /// use bytes::BytesMut;
    /// use turn_server_codec::channel_data::ChannelData;
    ///
    /// let data: [u8; 4] = [0x40, 0x00, 0x00, 0x40];
    /// let mut bytes = BytesMut::with_capacity(1500);
    ///
    /// ChannelData { number: 0x4001, bytes: &data[..] }.encode(&mut bytes, false);
    ///
    /// let ret = ChannelData::decode(&bytes[..]).unwrap();
    /// assert_eq!(ret.number, 0x4001);
    /// assert_eq!(ret.bytes, &data[..]);
    /// ```
    pub fn decode(bytes: &'a [u8]) -> Result<Self, Error> {
        if bytes.len() < 4 {
            return Err(Error::InvalidInput);
        }

        let number = u16::from_be_bytes(bytes[..2].try_into()?);
        if !CHANNEL_NUMBER_RANGE.contains(&number) {
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
