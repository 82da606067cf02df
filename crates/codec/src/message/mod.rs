pub mod attributes;
pub mod methods;

use crate::{
    Attributes, Error,
    crypto::{Key, fingerprint, fingerprint_gather, hmac_sha1},
    message::{
        attributes::{Attribute, AttributeType, Fingerprint, MessageIntegrity},
        methods::Method,
    },
};

use bytes::{BufMut, BytesMut};

/// Fixed STUN magic cookie, RFC 5389 §6.
pub static MAGIC_NUMBER: u32 = 0x2112A442;

/// Maximum number of comprehension-required unknown attribute types
/// recorded per message; further ones are silently dropped (§4.1).
const MAX_UNKNOWN_ATTRIBUTES: usize = 16;

pub struct MessageEncoder<'a> {
    token: &'a [u8],
    bytes: &'a mut BytesMut,
}

impl<'a> MessageEncoder<'a> {
    pub fn new(method: Method, token: &'a [u8; 12], bytes: &'a mut BytesMut) -> Self {
        bytes.clear();
        bytes.put_u16(method.into());
        bytes.put_u16(0);
        bytes.put_u32(MAGIC_NUMBER);
        bytes.put(token.as_slice());

        Self { bytes, token }
    }

    /// Build a new message reusing an inbound message's transaction id —
    /// the common case of building a response to a request.
    ///
    /// # Test
    ///
    /// ```
    /// use bytes::BytesMut;
    /// use turn_server_codec::message::methods::*;
    /// use turn_server_codec::message::*;
    /// use turn_server_codec::*;
    ///
    /// let buffer = [
    ///     0x00u8, 0x01, 0x00, 0x00, 0x21, 0x12, 0xa4, 0x42, 0x72, 0x6d, 0x49,
    ///     0x42, 0x72, 0x52, 0x64, 0x48, 0x57, 0x62, 0x4b, 0x2b,
    /// ];
    ///
    /// let mut attributes = Attributes::default();
    /// let mut buf = BytesMut::new();
    /// let old = Message::decode(&buffer[..], &mut attributes).unwrap();
    /// MessageEncoder::extend(Method::Binding(MethodType::Response), &old, &mut buf);
    ///
    /// assert_eq!(&buf[..8], &buffer[..8]);
    /// assert_eq!(&buf[8..20], &buffer[8..20]);
    /// ```
    pub fn extend(method: Method, reader: &Message<'a>, bytes: &'a mut BytesMut) -> Self {
        let token = reader.token();

        bytes.clear();
        bytes.put_u16(method.into());
        bytes.put_u16(0);
        bytes.put_u32(MAGIC_NUMBER);
        bytes.put(token);
        Self { bytes, token }
    }

    /// Append a typed attribute, writing its TLV header, value, and the
    /// zero padding needed to reach a 4-byte boundary.
    pub fn append<'c, T: Attribute<'c>>(&'c mut self, value: T::Item) {
        self.bytes.put_u16(T::TYPE as u16);

        let os = self.bytes.len();
        unsafe { self.bytes.advance_mut(2) }
        T::serialize(value, self.bytes, self.token);

        let size = self.bytes.len() - os - 2;
        let size_buf = (size as u16).to_be_bytes();
        self.bytes[os] = size_buf[0];
        self.bytes[os + 1] = size_buf[1];

        let psize = alignment_32(size);
        if psize > 0 {
            self.bytes.put_bytes(0, psize);
        }
    }

    /// Finalize the message: write the header length, and, if `key` is
    /// given, append MESSAGE-INTEGRITY followed by FINGERPRINT.
    ///
    /// # Test
    ///
    /// ```
    /// use bytes::BytesMut;
    /// use turn_server_codec::crypto::long_term_key;
    /// use turn_server_codec::message::attributes::*;
    /// use turn_server_codec::message::methods::*;
    /// use turn_server_codec::message::*;
    /// use turn_server_codec::*;
    ///
    /// let token = [0u8; 12];
    /// let mut bytes = BytesMut::new();
    /// let mut message = MessageEncoder::new(Method::Binding(MethodType::Request), &token, &mut bytes);
    /// message.append::<UserName>("panda");
    ///
    /// let key = long_term_key("panda", "raspberry", "panda");
    /// message.flush(Some(&key)).unwrap();
    ///
    /// let mut attributes = Attributes::default();
    /// let decoded = Message::decode(&bytes[..], &mut attributes).unwrap();
    /// assert!(decoded.checksum(&key).is_ok());
    /// ```
    pub fn flush(&mut self, key: Option<&Key>) -> Result<(), Error> {
        self.set_len(self.bytes.len() - 20);

        if let Some(key) = key {
            self.checksum(key)?;
        }

        Ok(())
    }

    fn checksum(&mut self, key: &Key) -> Result<(), Error> {
        assert!(self.bytes.len() >= 20);
        let len = self.bytes.len();

        self.set_len(len - 20 + 4 + 20);

        {
            let hmac = hmac_sha1(key, &[self.bytes]);
            self.bytes.put_u16(AttributeType::MessageIntegrity as u16);
            self.bytes.put_u16(20);
            self.bytes.put(hmac.as_slice());
        }

        self.set_len(len - 20 + 4 + 20 + 8);

        let fp = fingerprint(self.bytes);
        self.bytes.put_u16(AttributeType::Fingerprint as u16);
        self.bytes.put_u16(4);
        self.bytes.put_u32(fp);

        Ok(())
    }

    fn set_len(&mut self, len: usize) {
        self.bytes[2..4].copy_from_slice((len as u16).to_be_bytes().as_slice());
    }
}

/// A parsed STUN/TURN message: a borrow over the original datagram plus a
/// sparse index of recognized attribute positions. No payload bytes are
/// copied during parsing.
pub struct Message<'a> {
    method: Method,
    bytes: &'a [u8],
    size: u16,
    attributes: &'a Attributes,
    unknown: Vec<u16>,
}

impl<'a> Message<'a> {
    #[inline]
    pub fn method(&self) -> Method {
        self.method
    }

    /// The 96-bit transaction id.
    #[inline]
    pub fn token(&self) -> &'a [u8] {
        &self.bytes[8..20]
    }

    /// Comprehension-required attribute types present on the wire that
    /// this codec does not recognize (§4.1); used to build a `420`
    /// response carrying UNKNOWN-ATTRIBUTES.
    pub fn unknown_attributes(&self) -> &[u16] {
        &self.unknown
    }

    pub fn get<T: Attribute<'a>>(&self) -> Option<T::Item> {
        let range = self.attributes.get(&T::TYPE)?;
        T::deserialize(&self.bytes[range], self.token()).ok()
    }

    pub fn get_all<T: Attribute<'a>>(&self) -> impl Iterator<Item = T::Item> {
        self.attributes
            .get_all(&T::TYPE)
            .map(|it| T::deserialize(&self.bytes[it.clone()], self.token()))
            .filter_map(Result::ok)
    }

    /// Verify MESSAGE-INTEGRITY against the derived long-term key. The
    /// HMAC is computed over the message as if any trailing FINGERPRINT
    /// were absent (the header length used matches that state too).
    pub fn checksum(&self, key: &Key) -> Result<(), Error> {
        if self.bytes.is_empty() || self.size < 20 {
            return Err(Error::InvalidInput);
        }

        let integrity = self
            .get::<MessageIntegrity>()
            .ok_or(Error::NotFoundIntegrity)?;

        let size_buf = (self.size + 4).to_be_bytes();
        let body = [
            &self.bytes[0..2],
            &size_buf[..],
            &self.bytes[4..self.size as usize],
        ];

        if integrity != hmac_sha1(key, &body).as_slice() {
            return Err(Error::IntegrityFailed);
        }

        Ok(())
    }

    /// Parse a STUN message out of `bytes`, recording recognized
    /// attribute positions into `attributes`.
    pub fn decode(bytes: &'a [u8], attributes: &'a mut Attributes) -> Result<Self, Error> {
        let len = bytes.len();

        if len < 20 {
            return Err(Error::InvalidInput);
        }

        let method = Method::try_from(u16::from_be_bytes(bytes[..2].try_into()?))?;

        let msg_len = u16::from_be_bytes(bytes[2..4].try_into()?) as usize;
        if msg_len % 4 != 0 || msg_len + 20 > len {
            return Err(Error::InvalidInput);
        }

        if bytes[4..8] != MAGIC_NUMBER.to_be_bytes() {
            return Err(Error::NotFoundMagicNumber);
        }

        let mut find_integrity = false;
        let mut content_len = 0;
        let mut offset = 20;
        let mut unknown = Vec::new();

        loop {
            if len - offset < 4 {
                break;
            }

            let tlv_start = offset;
            let key = u16::from_be_bytes([bytes[offset], bytes[offset + 1]]);

            if !find_integrity {
                content_len = offset as u16;
            }

            let size = u16::from_be_bytes([bytes[offset + 2], bytes[offset + 3]]) as usize;

            offset += 4;
            if len - offset < size {
                break;
            }

            let range = offset..(offset + size);
            if size > 0 {
                offset += size + alignment_32(size);
            }

            let attrkind = if let Ok(kind) = AttributeType::try_from(key) {
                kind
            } else {
                // Comprehension-required types (<=0x7FFF) are recorded so
                // the dispatcher may reject the request with 420; types
                // above that are comprehension-optional and simply
                // skipped (RFC 5389 §15). Once MESSAGE-INTEGRITY has been
                // seen, only FINGERPRINT may still follow (§4.1), so later
                // unknown attributes are no longer worth recording either.
                if !find_integrity && key <= 0x7FFF && unknown.len() < MAX_UNKNOWN_ATTRIBUTES {
                    unknown.push(key);
                }

                continue;
            };

            // After MESSAGE-INTEGRITY, only FINGERPRINT may appear; any
            // other attribute is ignored rather than indexed (§4.1).
            if find_integrity && attrkind != AttributeType::Fingerprint {
                continue;
            }

            if attrkind == AttributeType::Fingerprint {
                let expected = match Fingerprint::deserialize(&bytes[range.clone()], &bytes[8..20]) {
                    Ok(value) => value,
                    Err(_) => break,
                };

                let size_buf = (tlv_start as u16 - 12).to_be_bytes();
                let actual =
                    fingerprint_gather(&[&bytes[0..2], &size_buf, &bytes[4..tlv_start]]);

                if actual != expected {
                    return Err(Error::FingerprintFailed);
                }

                attributes.append(attrkind, range);
                break;
            }

            if attrkind == AttributeType::MessageIntegrity {
                find_integrity = true;
            }

            attributes.append(attrkind, range);
        }

        Ok(Self {
            size: content_len,
            attributes,
            method,
            bytes,
            unknown,
        })
    }

    /// # Test
    ///
    /// ```
    /// use turn_server_codec::message::*;
    ///
    /// let buffer: [u8; 20] = [
    ///     0x00, 0x01, 0x00, 0x00, 0x21, 0x12, 0xa4, 0x42, 0x72, 0x6d, 0x49, 0x42,
    ///     0x72, 0x52, 0x64, 0x48, 0x57, 0x62, 0x4b, 0x2b,
    /// ];
    ///
    /// assert_eq!(Message::message_size(&buffer[..]).unwrap(), 20);
    /// ```
    pub fn message_size(buffer: &[u8]) -> Result<usize, Error> {
        if buffer.len() < 20 || buffer[0] >> 6 != 0 {
            return Err(Error::InvalidInput);
        }

        Ok((u16::from_be_bytes(buffer[2..4].try_into()?) as usize) + 20)
    }
}

/// Padding, in bytes, needed to round `size` up to a multiple of 4.
///
/// # Test
///
/// ```
/// use turn_server_codec::message::alignment_32;
///
/// assert_eq!(alignment_32(4), 0);
/// assert_eq!(alignment_32(0), 0);
/// assert_eq!(alignment_32(5), 3);
/// ```
#[inline(always)]
pub fn alignment_32(size: usize) -> usize {
    let rem = size % 4;
    if rem == 0 { 0 } else { 4 - rem }
}
