//! STUN/TURN attribute catalogue.
//!
//! Every attribute is a zero-sized marker type implementing [`Attribute`],
//! parameterized by the message's 12-byte transaction token (needed for
//! the XOR-address family). Parsing never copies: `deserialize` borrows
//! straight out of the original datagram buffer.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};

use bytes::{BufMut, BytesMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::Error;

const MAGIC_NUMBER: u32 = 0x2112_A442;

#[derive(PartialEq, Eq, Debug, Clone, Copy, Hash, TryFromPrimitive, IntoPrimitive)]
#[repr(u16)]
pub enum AttributeType {
    MappedAddress = 0x0001,
    UserName = 0x0006,
    MessageIntegrity = 0x0008,
    ErrorCode = 0x0009,
    UnknownAttributes = 0x000A,
    ChannelNumber = 0x000C,
    Lifetime = 0x000D,
    XorPeerAddress = 0x0012,
    Data = 0x0013,
    Realm = 0x0014,
    Nonce = 0x0015,
    XorRelayedAddress = 0x0016,
    RequestedAddressFamily = 0x0017,
    EvenPort = 0x0018,
    RequestedTransport = 0x0019,
    DontFragment = 0x001A,
    XorMappedAddress = 0x0020,
    ReservationToken = 0x0022,
    Software = 0x8022,
    Fingerprint = 0x8028,
}

/// A typed STUN attribute: how to write `Item` into the wire form and how
/// to read it back out, given the enclosing message's transaction token.
pub trait Attribute<'a>: Sized {
    const TYPE: AttributeType;
    type Item;

    fn serialize(value: Self::Item, bytes: &mut BytesMut, token: &[u8]);
    fn deserialize(buf: &'a [u8], token: &[u8]) -> Result<Self::Item, Error>;
}

fn require(buf: &[u8], len: usize) -> Result<(), Error> {
    if buf.len() < len {
        Err(Error::InvalidInput)
    } else {
        Ok(())
    }
}

// ---------------------------------------------------------------------
// address family helpers
// ---------------------------------------------------------------------

fn encode_addr(addr: &SocketAddr, bytes: &mut BytesMut) {
    bytes.put_u8(0);
    match addr {
        SocketAddr::V4(a) => {
            bytes.put_u8(1);
            bytes.put_u16(a.port());
            bytes.put_slice(&a.ip().octets());
        }
        SocketAddr::V6(a) => {
            bytes.put_u8(2);
            bytes.put_u16(a.port());
            bytes.put_slice(&a.ip().octets());
        }
    }
}

fn decode_addr(buf: &[u8]) -> Result<SocketAddr, Error> {
    require(buf, 4)?;
    let port = u16::from_be_bytes(buf[2..4].try_into()?);
    match buf[1] {
        1 => {
            require(buf, 8)?;
            let octets: [u8; 4] = buf[4..8].try_into()?;
            Ok(SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::from(octets), port)))
        }
        2 => {
            require(buf, 20)?;
            let octets: [u8; 16] = buf[4..20].try_into()?;
            Ok(SocketAddr::V6(SocketAddrV6::new(
                Ipv6Addr::from(octets),
                port,
                0,
                0,
            )))
        }
        _ => Err(Error::InvalidInput),
    }
}

/// XOR an address with the magic cookie (and, for IPv6, the transaction
/// token), per RFC 5389 §15.2.
fn xor_addr(addr: &SocketAddr, token: &[u8]) -> SocketAddr {
    let cookie = MAGIC_NUMBER.to_be_bytes();
    let port = addr.port() ^ ((MAGIC_NUMBER >> 16) as u16);

    match addr {
        SocketAddr::V4(a) => {
            let octets = a.ip().octets();
            let mut out = [0u8; 4];
            for i in 0..4 {
                out[i] = octets[i] ^ cookie[i];
            }
            SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::from(out), port))
        }
        SocketAddr::V6(a) => {
            let octets = a.ip().octets();
            let mut out = [0u8; 16];
            for i in 0..4 {
                out[i] = octets[i] ^ cookie[i];
            }
            for i in 0..12 {
                out[4 + i] = octets[4 + i] ^ token.get(i).copied().unwrap_or(0);
            }
            SocketAddr::V6(SocketAddrV6::new(Ipv6Addr::from(out), port, 0, 0))
        }
    }
}

fn encode_xor_addr(addr: &SocketAddr, token: &[u8], bytes: &mut BytesMut) {
    encode_addr(&xor_addr(addr, token), bytes)
}

fn decode_xor_addr(buf: &[u8], token: &[u8]) -> Result<SocketAddr, Error> {
    Ok(xor_addr(&decode_addr(buf)?, token))
}

// ---------------------------------------------------------------------
// address attributes
// ---------------------------------------------------------------------

pub struct MappedAddress;

impl<'a> Attribute<'a> for MappedAddress {
    const TYPE: AttributeType = AttributeType::MappedAddress;
    type Item = SocketAddr;

    fn serialize(value: Self::Item, bytes: &mut BytesMut, _token: &[u8]) {
        encode_addr(&value, bytes)
    }

    fn deserialize(buf: &'a [u8], _token: &[u8]) -> Result<Self::Item, Error> {
        decode_addr(buf)
    }
}

macro_rules! xor_address_attribute {
    ($name:ident, $kind:expr) => {
        pub struct $name;

        impl<'a> Attribute<'a> for $name {
            const TYPE: AttributeType = $kind;
            type Item = SocketAddr;

            fn serialize(value: Self::Item, bytes: &mut BytesMut, token: &[u8]) {
                encode_xor_addr(&value, token, bytes)
            }

            fn deserialize(buf: &'a [u8], token: &[u8]) -> Result<Self::Item, Error> {
                decode_xor_addr(buf, token)
            }
        }
    };
}

/// # Test
///
/// ```
/// use bytes::BytesMut;
/// use std::net::SocketAddr;
/// use turn_server_codec::message::attributes::{Attribute, XorMappedAddress};
///
/// let token = [1u8, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12];
/// let addr: SocketAddr = "192.168.0.107:56748".parse().unwrap();
///
/// let mut bytes = BytesMut::new();
/// XorMappedAddress::serialize(addr, &mut bytes, &token);
/// let decoded = XorMappedAddress::deserialize(&bytes[..], &token).unwrap();
///
/// assert_eq!(decoded, addr);
/// ```
///
/// ```
/// use bytes::BytesMut;
/// use std::net::SocketAddr;
/// use turn_server_codec::message::attributes::{Attribute, XorMappedAddress};
///
/// let token = [9u8, 8, 7, 6, 5, 4, 3, 2, 1, 0, 11, 12];
/// let addr: SocketAddr = "[::1]:443".parse().unwrap();
///
/// let mut bytes = BytesMut::new();
/// XorMappedAddress::serialize(addr, &mut bytes, &token);
/// let decoded = XorMappedAddress::deserialize(&bytes[..], &token).unwrap();
///
/// assert_eq!(decoded, addr);
/// ```
xor_address_attribute!(XorMappedAddress, AttributeType::XorMappedAddress);
xor_address_attribute!(XorPeerAddress, AttributeType::XorPeerAddress);
xor_address_attribute!(XorRelayedAddress, AttributeType::XorRelayedAddress);

// ---------------------------------------------------------------------
// sized string/byte attributes
// ---------------------------------------------------------------------

macro_rules! str_attribute {
    ($name:ident, $kind:expr) => {
        pub struct $name;

        impl<'a> Attribute<'a> for $name {
            const TYPE: AttributeType = $kind;
            type Item = &'a str;

            fn serialize(value: Self::Item, bytes: &mut BytesMut, _token: &[u8]) {
                bytes.put_slice(value.as_bytes())
            }

            fn deserialize(buf: &'a [u8], _token: &[u8]) -> Result<Self::Item, Error> {
                std::str::from_utf8(buf).map_err(|_| Error::InvalidInput)
            }
        }
    };
}

str_attribute!(UserName, AttributeType::UserName);
str_attribute!(Realm, AttributeType::Realm);
str_attribute!(Nonce, AttributeType::Nonce);
str_attribute!(Software, AttributeType::Software);

pub struct Data;

impl<'a> Attribute<'a> for Data {
    const TYPE: AttributeType = AttributeType::Data;
    type Item = &'a [u8];

    fn serialize(value: Self::Item, bytes: &mut BytesMut, _token: &[u8]) {
        bytes.put_slice(value)
    }

    fn deserialize(buf: &'a [u8], _token: &[u8]) -> Result<Self::Item, Error> {
        Ok(buf)
    }
}

// ---------------------------------------------------------------------
// MESSAGE-INTEGRITY / FINGERPRINT
// ---------------------------------------------------------------------

pub struct MessageIntegrity;

impl<'a> Attribute<'a> for MessageIntegrity {
    const TYPE: AttributeType = AttributeType::MessageIntegrity;
    type Item = &'a [u8];

    fn serialize(value: Self::Item, bytes: &mut BytesMut, _token: &[u8]) {
        bytes.put_slice(value)
    }

    fn deserialize(buf: &'a [u8], _token: &[u8]) -> Result<Self::Item, Error> {
        require(buf, 20)?;
        Ok(&buf[..20])
    }
}

pub struct Fingerprint;

impl<'a> Attribute<'a> for Fingerprint {
    const TYPE: AttributeType = AttributeType::Fingerprint;
    type Item = u32;

    fn serialize(value: Self::Item, bytes: &mut BytesMut, _token: &[u8]) {
        bytes.put_u32(value)
    }

    fn deserialize(buf: &'a [u8], _token: &[u8]) -> Result<Self::Item, Error> {
        require(buf, 4)?;
        Ok(u32::from_be_bytes(buf[..4].try_into()?))
    }
}

// ---------------------------------------------------------------------
// ERROR-CODE
// ---------------------------------------------------------------------

/// `reserved(21) | class(3) | number(8)` followed by a UTF-8 reason.
pub struct ErrorCode;

impl<'a> Attribute<'a> for ErrorCode {
    const TYPE: AttributeType = AttributeType::ErrorCode;
    type Item = (u16, &'a str);

    /// # Test
    ///
    /// ```
    /// use bytes::BytesMut;
    /// use turn_server_codec::message::attributes::{Attribute, ErrorCode};
    ///
    /// let mut bytes = BytesMut::new();
    /// ErrorCode::serialize((401, "Unauthorized"), &mut bytes, &[]);
    ///
    /// assert_eq!(&bytes[..4], &[0, 0, 4, 1]);
    /// assert_eq!(ErrorCode::deserialize(&bytes[..], &[]).unwrap(), (401, "Unauthorized"));
    /// ```
    fn serialize(value: Self::Item, bytes: &mut BytesMut, _token: &[u8]) {
        let (code, reason) = value;
        let class = (code / 100) as u8;
        let number = (code % 100) as u8;

        bytes.put_u16(0);
        bytes.put_u8(class);
        bytes.put_u8(number);
        bytes.put_slice(reason.as_bytes());
    }

    fn deserialize(buf: &'a [u8], _token: &[u8]) -> Result<Self::Item, Error> {
        require(buf, 4)?;

        let class = buf[2] & 0x07;
        let number = buf[3];
        let code = class as u16 * 100 + number as u16;
        let reason = std::str::from_utf8(&buf[4..]).map_err(|_| Error::InvalidInput)?;

        Ok((code, reason))
    }
}

// ---------------------------------------------------------------------
// UNKNOWN-ATTRIBUTES
// ---------------------------------------------------------------------

pub struct UnknownAttributes;

impl<'a> Attribute<'a> for UnknownAttributes {
    const TYPE: AttributeType = AttributeType::UnknownAttributes;
    type Item = Vec<u16>;

    /// # Test
    ///
    /// ```
    /// use bytes::BytesMut;
    /// use turn_server_codec::message::attributes::{Attribute, UnknownAttributes};
    ///
    /// let mut bytes = BytesMut::new();
    /// UnknownAttributes::serialize(vec![0x7001, 0x7002, 0x7003], &mut bytes, &[]);
    ///
    /// assert_eq!(bytes.len(), 8);
    /// assert_eq!(
    ///     UnknownAttributes::deserialize(&bytes[..], &[]).unwrap(),
    ///     vec![0x7001, 0x7002, 0x7003, 0x7003]
    /// );
    /// ```
    fn serialize(value: Self::Item, bytes: &mut BytesMut, _token: &[u8]) {
        let mut types = value;
        if types.len() % 2 != 0 {
            if let Some(&last) = types.last() {
                types.push(last);
            }
        }

        for t in types {
            bytes.put_u16(t);
        }
    }

    fn deserialize(buf: &'a [u8], _token: &[u8]) -> Result<Self::Item, Error> {
        Ok(buf.chunks_exact(2).map(|c| u16::from_be_bytes([c[0], c[1]])).collect())
    }
}

// ---------------------------------------------------------------------
// integer / flag attributes
// ---------------------------------------------------------------------

pub struct Lifetime;

impl<'a> Attribute<'a> for Lifetime {
    const TYPE: AttributeType = AttributeType::Lifetime;
    type Item = u32;

    fn serialize(value: Self::Item, bytes: &mut BytesMut, _token: &[u8]) {
        bytes.put_u32(value)
    }

    fn deserialize(buf: &'a [u8], _token: &[u8]) -> Result<Self::Item, Error> {
        require(buf, 4)?;
        Ok(u32::from_be_bytes(buf[..4].try_into()?))
    }
}

pub struct ChannelNumber;

impl<'a> Attribute<'a> for ChannelNumber {
    const TYPE: AttributeType = AttributeType::ChannelNumber;
    type Item = u16;

    fn serialize(value: Self::Item, bytes: &mut BytesMut, _token: &[u8]) {
        bytes.put_u16(value);
        bytes.put_u16(0);
    }

    fn deserialize(buf: &'a [u8], _token: &[u8]) -> Result<Self::Item, Error> {
        require(buf, 2)?;
        Ok(u16::from_be_bytes(buf[..2].try_into()?))
    }
}

/// UDP transport protocol number, RFC 5766 §14.7.
pub const REQUESTED_TRANSPORT_UDP: u8 = 17;

pub struct RequestedTransport;

impl<'a> Attribute<'a> for RequestedTransport {
    const TYPE: AttributeType = AttributeType::RequestedTransport;
    type Item = u8;

    fn serialize(value: Self::Item, bytes: &mut BytesMut, _token: &[u8]) {
        bytes.put_u8(value);
        bytes.put_bytes(0, 3);
    }

    fn deserialize(buf: &'a [u8], _token: &[u8]) -> Result<Self::Item, Error> {
        require(buf, 1)?;
        Ok(buf[0])
    }
}

pub struct RequestedAddressFamily;

impl<'a> Attribute<'a> for RequestedAddressFamily {
    const TYPE: AttributeType = AttributeType::RequestedAddressFamily;
    type Item = u8;

    fn serialize(value: Self::Item, bytes: &mut BytesMut, _token: &[u8]) {
        bytes.put_u8(value);
        bytes.put_bytes(0, 3);
    }

    fn deserialize(buf: &'a [u8], _token: &[u8]) -> Result<Self::Item, Error> {
        require(buf, 1)?;
        Ok(buf[0])
    }
}

/// EVEN-PORT: a single reservation-request bit in the top bit of byte 0.
pub struct EvenPort;

impl<'a> Attribute<'a> for EvenPort {
    const TYPE: AttributeType = AttributeType::EvenPort;
    type Item = bool;

    fn serialize(value: Self::Item, bytes: &mut BytesMut, _token: &[u8]) {
        bytes.put_u8(if value { 0x80 } else { 0x00 });
    }

    fn deserialize(buf: &'a [u8], _token: &[u8]) -> Result<Self::Item, Error> {
        require(buf, 1)?;
        Ok(buf[0] & 0x80 != 0)
    }
}

pub struct ReservationToken;

impl<'a> Attribute<'a> for ReservationToken {
    const TYPE: AttributeType = AttributeType::ReservationToken;
    type Item = [u8; 8];

    fn serialize(value: Self::Item, bytes: &mut BytesMut, _token: &[u8]) {
        bytes.put_slice(&value)
    }

    fn deserialize(buf: &'a [u8], _token: &[u8]) -> Result<Self::Item, Error> {
        require(buf, 8)?;
        Ok(buf[..8].try_into()?)
    }
}

/// DONT-FRAGMENT carries no value; its presence is the signal.
pub struct DontFragment;

impl<'a> Attribute<'a> for DontFragment {
    const TYPE: AttributeType = AttributeType::DontFragment;
    type Item = ();

    fn serialize(_value: Self::Item, _bytes: &mut BytesMut, _token: &[u8]) {}

    fn deserialize(_buf: &'a [u8], _token: &[u8]) -> Result<Self::Item, Error> {
        Ok(())
    }
}
