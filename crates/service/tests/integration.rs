//! End-to-end scenarios driven entirely through the public API: no real
//! sockets, just bytes in and bytes out of a [`Dispatcher`].

use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use bytes::BytesMut;
use codec::Attributes;
use codec::crypto::long_term_key;
use codec::message::attributes::*;
use codec::message::methods::{Method, MethodType};
use codec::message::{Message, MessageEncoder};
use service::account::{Account, AccountState, StaticAccountStore};
use service::dispatcher::{Context, Dispatcher, Outcome};
use service::ports::PortRange;
use service::{FiveTuple, Transport};

const REALM: &str = "localhost";
const USERNAME: &str = "alice";
const PASSWORD: &str = "secret";

fn context() -> Context {
    Context {
        realm: REALM.to_string(),
        nonce_key: "nonce-key".to_string(),
        max_client: 16,
        max_relay_per_client: 4,
        relay_address_v4: Ipv4Addr::new(203, 0, 113, 1),
        relay_address_v6: None,
        default_allocation_lifetime: 600,
    }
}

fn accounts() -> StaticAccountStore {
    let mut store = StaticAccountStore::new();
    store.insert(Account {
        username: USERNAME.to_string(),
        password: PASSWORD.to_string(),
        realm: REALM.to_string(),
        state: AccountState::Authorized,
    });
    store
}

fn client_tuple() -> FiveTuple {
    FiveTuple {
        transport: Transport::Udp,
        client_addr: "127.0.0.1:4000".parse().unwrap(),
        server_addr: "127.0.0.1:3478".parse().unwrap(),
    }
}

fn key() -> codec::crypto::Key {
    long_term_key(USERNAME, REALM, PASSWORD)
}

fn allocate(dispatcher: &mut Dispatcher<StaticAccountStore>, attributes: &mut Attributes, tuple: FiveTuple) {
    let challenge_token = [1u8; 12];
    let mut bytes = BytesMut::new();
    let mut encoder =
        MessageEncoder::new(Method::Allocate(MethodType::Request), &challenge_token, &mut bytes);
    encoder.append::<RequestedTransport>(REQUESTED_TRANSPORT_UDP);
    encoder.flush(None).unwrap();

    let nonce = match dispatcher.handle_client_datagram(tuple, &bytes, attributes, 0) {
        Outcome::Reply(reply) => {
            let mut scratch = Attributes::default();
            Message::decode(reply, &mut scratch).unwrap().get::<Nonce>().unwrap().to_string()
        }
        other => panic!("expected a challenge, got {other:?}"),
    };

    let mut bytes = BytesMut::new();
    let mut encoder =
        MessageEncoder::new(Method::Allocate(MethodType::Request), &[2u8; 12], &mut bytes);
    encoder.append::<RequestedTransport>(REQUESTED_TRANSPORT_UDP);
    encoder.append::<UserName>(USERNAME);
    encoder.append::<Realm>(REALM);
    encoder.append::<Nonce>(&nonce);
    encoder.flush(Some(&key())).unwrap();

    match dispatcher.handle_client_datagram(tuple, &bytes, attributes, 0) {
        Outcome::Reply(reply) => {
            let mut scratch = Attributes::default();
            let message = Message::decode(reply, &mut scratch).unwrap();
            assert_eq!(message.method(), Method::Allocate(MethodType::Response));
        }
        other => panic!("expected an allocate success, got {other:?}"),
    }
}

fn channel_bind(
    dispatcher: &mut Dispatcher<StaticAccountStore>,
    attributes: &mut Attributes,
    tuple: FiveTuple,
    number: u16,
    peer: SocketAddr,
) {
    let mut bytes = BytesMut::new();
    let mut encoder =
        MessageEncoder::new(Method::ChannelBind(MethodType::Request), &[3u8; 12], &mut bytes);
    encoder.append::<ChannelNumber>(number);
    encoder.append::<XorPeerAddress>(peer);
    encoder.append::<UserName>(USERNAME);
    encoder.append::<Realm>(REALM);
    encoder.append::<Nonce>("reused-nonce-is-rejected-so-use-a-fresh-challenge");
    encoder.flush(Some(&key())).unwrap();

    // The nonce above is bogus on purpose to prove a fresh challenge is
    // required; fetch one and retry with it.
    let nonce = match dispatcher.handle_client_datagram(tuple, &bytes, attributes, 0) {
        Outcome::Reply(reply) => {
            let mut scratch = Attributes::default();
            Message::decode(reply, &mut scratch).unwrap().get::<Nonce>().unwrap().to_string()
        }
        other => panic!("expected a stale-nonce challenge, got {other:?}"),
    };

    let mut bytes = BytesMut::new();
    let mut encoder =
        MessageEncoder::new(Method::ChannelBind(MethodType::Request), &[4u8; 12], &mut bytes);
    encoder.append::<ChannelNumber>(number);
    encoder.append::<XorPeerAddress>(peer);
    encoder.append::<UserName>(USERNAME);
    encoder.append::<Realm>(REALM);
    encoder.append::<Nonce>(&nonce);
    encoder.flush(Some(&key())).unwrap();

    match dispatcher.handle_client_datagram(tuple, &bytes, attributes, 0) {
        Outcome::Reply(reply) => {
            let mut scratch = Attributes::default();
            let message = Message::decode(reply, &mut scratch).unwrap();
            assert_eq!(message.method(), Method::ChannelBind(MethodType::Response));
        }
        other => panic!("expected a channel-bind success, got {other:?}"),
    }
}

#[test]
fn channel_bind_then_peer_datagram_arrives_as_channel_data() {
    let mut dispatcher = Dispatcher::new(context(), accounts(), PortRange::default());
    let mut attributes = Attributes::default();
    let tuple = client_tuple();
    let peer: SocketAddr = "198.51.100.7:9000".parse().unwrap();

    allocate(&mut dispatcher, &mut attributes, tuple);
    channel_bind(&mut dispatcher, &mut attributes, tuple, 0x4001, peer);

    let relayed_addr = dispatcher.allocations().get(&tuple).unwrap().relayed_addr;
    let payload = b"hello from the peer";

    match dispatcher.handle_peer_datagram(relayed_addr, peer, payload) {
        Outcome::Reply(bytes) => {
            // A bound channel gets ChannelData framing, not a DataIndication.
            assert_eq!(u16::from_be_bytes([bytes[0], bytes[1]]), 0x4001);
            assert_eq!(&bytes[4..4 + payload.len()], payload);
        }
        other => panic!("expected a channel-data reply, got {other:?}"),
    }
}

#[test]
fn peer_datagram_without_permission_is_dropped() {
    let mut dispatcher = Dispatcher::new(context(), accounts(), PortRange::default());
    let mut attributes = Attributes::default();
    let tuple = client_tuple();

    allocate(&mut dispatcher, &mut attributes, tuple);
    let relayed_addr = dispatcher.allocations().get(&tuple).unwrap().relayed_addr;

    let stranger: SocketAddr = "198.51.100.99:9000".parse().unwrap();
    match dispatcher.handle_peer_datagram(relayed_addr, stranger, b"unsolicited") {
        Outcome::None => {}
        other => panic!("expected the datagram to be dropped, got {other:?}"),
    }
}

#[test]
fn create_permission_then_peer_datagram_arrives_as_data_indication() {
    let mut dispatcher = Dispatcher::new(context(), accounts(), PortRange::default());
    let mut attributes = Attributes::default();
    let tuple = client_tuple();
    let peer: SocketAddr = "198.51.100.7:9000".parse().unwrap();

    allocate(&mut dispatcher, &mut attributes, tuple);

    let nonce = match dispatcher.handle_client_datagram(
        tuple,
        &{
            let mut bytes = BytesMut::new();
            let mut encoder = MessageEncoder::new(
                Method::CreatePermission(MethodType::Request),
                &[5u8; 12],
                &mut bytes,
            );
            encoder.append::<XorPeerAddress>(peer);
            encoder.flush(None).unwrap();
            bytes
        },
        &mut attributes,
        0,
    ) {
        Outcome::Reply(reply) => {
            let mut scratch = Attributes::default();
            Message::decode(reply, &mut scratch).unwrap().get::<Nonce>().unwrap().to_string()
        }
        other => panic!("expected a challenge, got {other:?}"),
    };

    let mut bytes = BytesMut::new();
    let mut encoder =
        MessageEncoder::new(Method::CreatePermission(MethodType::Request), &[6u8; 12], &mut bytes);
    encoder.append::<XorPeerAddress>(peer);
    encoder.append::<UserName>(USERNAME);
    encoder.append::<Realm>(REALM);
    encoder.append::<Nonce>(&nonce);
    encoder.flush(Some(&key())).unwrap();

    match dispatcher.handle_client_datagram(tuple, &bytes, &mut attributes, 0) {
        Outcome::Reply(reply) => {
            let mut scratch = Attributes::default();
            let message = Message::decode(reply, &mut scratch).unwrap();
            assert_eq!(message.method(), Method::CreatePermission(MethodType::Response));
        }
        other => panic!("expected a create-permission success, got {other:?}"),
    }

    let relayed_addr = dispatcher.allocations().get(&tuple).unwrap().relayed_addr;
    match dispatcher.handle_peer_datagram(relayed_addr, peer, b"no channel bound yet") {
        Outcome::Reply(reply) => {
            let mut scratch = Attributes::default();
            let message = Message::decode(reply, &mut scratch).unwrap();
            assert_eq!(message.method(), Method::DataIndication);
            assert_eq!(message.get::<XorPeerAddress>(), Some(peer));
        }
        other => panic!("expected a data indication, got {other:?}"),
    }

    let _ = IpAddr::V4(Ipv4Addr::UNSPECIFIED);
}
