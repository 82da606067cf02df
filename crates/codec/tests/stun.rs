use anyhow::Result;
use bytes::BytesMut;

use turn_server_codec::crypto::long_term_key;
use turn_server_codec::message::attributes::*;
use turn_server_codec::message::methods::*;
use turn_server_codec::message::*;
use turn_server_codec::*;

const USERNAME: &str = "panda";
const REALM: &str = "raspberry";
const PASSWORD: &str = "panda";

fn signed_binding(token: &[u8; 12]) -> BytesMut {
    let key = long_term_key(USERNAME, REALM, PASSWORD);

    let mut bytes = BytesMut::new();
    let mut message = MessageEncoder::new(Method::Binding(MethodType::Request), token, &mut bytes);
    message.append::<UserName>(USERNAME);
    message.flush(Some(&key)).unwrap();

    bytes
}

#[test]
fn decodes_a_plain_binding_request() -> Result<()> {
    let token = [0x45u8, 0x58, 0x65, 0x61, 0x57, 0x53, 0x5a, 0x6e, 0x57, 0x35, 0x76, 0x46];

    let mut bytes = BytesMut::new();
    MessageEncoder::new(Method::Binding(MethodType::Request), &token, &mut bytes)
        .flush(None)
        .unwrap();

    let mut attributes = Attributes::default();
    let message = Message::decode(&bytes[..], &mut attributes)?;

    assert_eq!(message.method(), BINDING_REQUEST);
    assert_eq!(message.token(), &token);

    Ok(())
}

#[test]
fn round_trips_a_signed_allocate_with_message_integrity_and_fingerprint() -> Result<()> {
    let key = long_term_key(USERNAME, REALM, PASSWORD);
    let token = [1u8; 12];

    let mut bytes = BytesMut::new();
    let mut message = MessageEncoder::new(Method::Allocate(MethodType::Request), &token, &mut bytes);
    message.append::<RequestedTransport>(REQUESTED_TRANSPORT_UDP);
    message.append::<UserName>(USERNAME);
    message.append::<Realm>(REALM);
    message.flush(Some(&key)).unwrap();

    let mut attributes = Attributes::default();
    let message = Message::decode(&bytes[..], &mut attributes)?;

    assert_eq!(message.method(), ALLOCATE_REQUEST);
    assert_eq!(message.get::<UserName>(), Some(USERNAME));
    message.checksum(&key)?;

    Ok(())
}

/// A FINGERPRINT covering the whole signed message proves that an
/// attribute appended after it never gets indexed: the decode loop
/// must stop at FINGERPRINT rather than keep walking the buffer.
#[test]
fn stops_parsing_at_fingerprint_ignoring_anything_appended_after() -> Result<()> {
    let key = long_term_key(USERNAME, REALM, PASSWORD);
    let token = [2u8; 12];

    let mut bytes = signed_binding(&token);

    // Splice in a forged XOR-PEER-ADDRESS TLV after the signed tail.
    let mut forged = BytesMut::new();
    forged.extend_from_slice(&bytes);
    let mut tail = BytesMut::new();
    tail.put_u16_attr(AttributeType::XorPeerAddress as u16, &[0, 1, 0x13, 0x37, 127, 0, 0, 1]);
    forged.extend_from_slice(&tail);

    let new_len = (forged.len() - 20) as u16;
    forged[2..4].copy_from_slice(&new_len.to_be_bytes());
    bytes = forged;

    let mut attributes = Attributes::default();
    let message = Message::decode(&bytes[..], &mut attributes)?;

    assert_eq!(message.get::<XorPeerAddress>(), None);
    message.checksum(&key)?;

    Ok(())
}

/// A tampered FINGERPRINT must make the whole message unreadable rather
/// than merely invalidate the trailing attribute.
#[test]
fn fingerprint_mismatch_is_rejected() {
    let token = [3u8; 12];
    let mut bytes = signed_binding(&token);

    let last = bytes.len() - 1;
    bytes[last] ^= 0xff;

    let mut attributes = Attributes::default();
    let err = Message::decode(&bytes[..], &mut attributes).unwrap_err();
    assert_eq!(err, Error::FingerprintFailed);
}

#[test]
fn message_integrity_mismatch_is_rejected() {
    let key = long_term_key(USERNAME, REALM, PASSWORD);
    let wrong_key = long_term_key(USERNAME, REALM, "wrong");
    let token = [4u8; 12];

    let mut bytes = BytesMut::new();
    MessageEncoder::new(Method::Binding(MethodType::Request), &token, &mut bytes)
        .flush(Some(&key))
        .unwrap();

    let mut attributes = Attributes::default();
    let message = Message::decode(&bytes[..], &mut attributes).unwrap();

    assert_eq!(message.checksum(&wrong_key), Err(Error::IntegrityFailed));
}

#[test]
fn message_integrity_absent_is_reported() {
    let key = long_term_key(USERNAME, REALM, PASSWORD);
    let token = [5u8; 12];

    let mut bytes = BytesMut::new();
    MessageEncoder::new(Method::Binding(MethodType::Request), &token, &mut bytes)
        .flush(None)
        .unwrap();

    let mut attributes = Attributes::default();
    let message = Message::decode(&bytes[..], &mut attributes).unwrap();

    assert_eq!(message.checksum(&key), Err(Error::NotFoundIntegrity));
}

#[test]
fn short_buffer_is_invalid_input() {
    let mut attributes = Attributes::default();
    let err = Message::decode(&[0u8; 10], &mut attributes).unwrap_err();
    assert_eq!(err, Error::InvalidInput);
}

#[test]
fn wrong_magic_cookie_is_rejected() {
    let token = [6u8; 12];
    let mut bytes = BytesMut::new();
    MessageEncoder::new(Method::Binding(MethodType::Request), &token, &mut bytes)
        .flush(None)
        .unwrap();

    bytes[4] ^= 0xff;

    let mut attributes = Attributes::default();
    let err = Message::decode(&bytes[..], &mut attributes).unwrap_err();
    assert_eq!(err, Error::NotFoundMagicNumber);
}

#[test]
fn unknown_method_is_rejected() {
    // A bare 20-byte header with an unrecognized method word.
    let mut header = BytesMut::new();
    header.extend_from_slice(&0xffffu16.to_be_bytes());
    header.extend_from_slice(&0u16.to_be_bytes());
    header.extend_from_slice(&MAGIC_NUMBER.to_be_bytes());
    header.extend_from_slice(&[0u8; 12]);

    let mut attributes = Attributes::default();
    let err = Message::decode(&header[..], &mut attributes).unwrap_err();
    assert_eq!(err, Error::UnknownMethod);
}

/// Small helper trait so the splice tests above can append a raw TLV
/// without reaching for the full encoder.
trait PutAttr {
    fn put_u16_attr(&mut self, kind: u16, value: &[u8]);
}

impl PutAttr for BytesMut {
    fn put_u16_attr(&mut self, kind: u16, value: &[u8]) {
        use bytes::BufMut;

        self.put_u16(kind);
        self.put_u16(value.len() as u16);
        self.put_slice(value);

        let pad = alignment_32(value.len());
        if pad > 0 {
            self.put_bytes(0, pad);
        }
    }
}
