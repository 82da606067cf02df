//! STUN (RFC 5389) / TURN (RFC 5766) wire codec.
//!
//! This crate parses and writes STUN/TURN messages and ChannelData frames
//! without copying attribute payloads: [`Message::decode`] only validates
//! framing and records attribute positions as offsets into the caller's
//! buffer. [`Decoder`] tells a STUN message apart from a ChannelData frame
//! by the top two bits of the first byte (`00` vs `01`), as required by
//! RFC 5766 §11.

pub mod channel_data;
pub mod crypto;
pub mod message;

use std::{array::TryFromSliceError, ops::Range};

use message::{Message, attributes::AttributeType};

use channel_data::ChannelData;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// A buffer was too short, malformed, or otherwise failed a framing
    /// check.
    InvalidInput,
    /// A STUN header's magic cookie did not match `0x2112A442`.
    NotFoundMagicNumber,
    /// MESSAGE-INTEGRITY verification was requested but the attribute is
    /// absent.
    NotFoundIntegrity,
    /// MESSAGE-INTEGRITY was present but the HMAC did not match.
    IntegrityFailed,
    /// FINGERPRINT was present but the CRC32 did not match; the message
    /// must be silently ignored rather than answered (§4.4).
    FingerprintFailed,
    /// The 16-bit method/class word did not map to a known method.
    UnknownMethod,
}

impl From<TryFromSliceError> for Error {
    fn from(_: TryFromSliceError) -> Self {
        Error::InvalidInput
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let msg = match self {
            Error::InvalidInput => "invalid input",
            Error::NotFoundMagicNumber => "magic cookie not found",
            Error::NotFoundIntegrity => "message-integrity attribute not found",
            Error::IntegrityFailed => "message-integrity verification failed",
            Error::FingerprintFailed => "fingerprint verification failed",
            Error::UnknownMethod => "unknown stun method",
        };

        write!(f, "{}", msg)
    }
}

impl std::error::Error for Error {}

/// The result of telling a STUN message apart from a ChannelData frame.
pub enum DecodeResult<'a> {
    Message(Message<'a>),
    ChannelData(ChannelData<'a>),
}

/// A bounded, zero-copy index of `(attribute type, byte range)` pairs
/// recorded during [`Message::decode`]. Reused across messages via
/// [`Attributes::clear`] to avoid reallocating per packet.
#[derive(Default)]
pub struct Attributes(Vec<(AttributeType, Range<usize>)>);

/// Caps the number of attributes tracked per message; a message with
/// more TLVs than this simply stops being indexed past the limit
/// (parsing itself still completes).
const MAX_ATTRIBUTES: usize = 32;

impl Attributes {
    pub fn append(&mut self, kind: AttributeType, range: Range<usize>) {
        if self.0.len() < MAX_ATTRIBUTES {
            self.0.push((kind, range));
        }
    }

    pub fn get(&self, kind: &AttributeType) -> Option<Range<usize>> {
        self.0.iter().find(|(k, _)| k == kind).map(|(_, r)| r.clone())
    }

    pub fn get_all<'a>(&'a self, kind: &'a AttributeType) -> impl Iterator<Item = Range<usize>> + 'a {
        self.0.iter().filter(move |(k, _)| k == kind).map(|(_, r)| r.clone())
    }

    pub fn clear(&mut self) {
        self.0.clear();
    }
}

/// Top-level framing dispatch: tells a STUN message apart from a
/// ChannelData frame and decodes whichever it is.
#[derive(Default)]
pub struct Decoder {
    attributes: Attributes,
}

impl Decoder {
    /// # Test
    ///
    /// ```
    /// use turn_server_codec::{Decoder, DecodeResult};
    ///
    /// let buffer: [u8; 20] = [
    ///     0x00, 0x01, 0x00, 0x00, 0x21, 0x12, 0xa4, 0x42, 0x72, 0x6d, 0x49, 0x42,
    ///     0x72, 0x52, 0x64, 0x48, 0x57, 0x62, 0x4b, 0x2b,
    /// ];
    ///
    /// let mut decoder = Decoder::default();
    /// assert!(matches!(decoder.decode(&buffer).unwrap(), DecodeResult::Message(_)));
    /// ```
    pub fn decode<'a>(&'a mut self, bytes: &'a [u8]) -> Result<DecodeResult<'a>, Error> {
        if bytes.is_empty() {
            return Err(Error::InvalidInput);
        }

        self.attributes.clear();

        match bytes[0] >> 6 {
            0 => Message::decode(bytes, &mut self.attributes).map(DecodeResult::Message),
            1 => ChannelData::decode(bytes).map(DecodeResult::ChannelData),
            _ => Err(Error::InvalidInput),
        }
    }

    /// Size, in bytes, of the next framed message at the start of
    /// `bytes` — used by stream transports to know how much to buffer
    /// before calling [`Decoder::decode`].
    pub fn message_size(bytes: &[u8], is_stream: bool) -> Result<usize, Error> {
        if bytes.is_empty() {
            return Err(Error::InvalidInput);
        }

        match bytes[0] >> 6 {
            0 => Message::message_size(bytes),
            1 => ChannelData::message_size(bytes, is_stream),
            _ => Err(Error::InvalidInput),
        }
    }
}
