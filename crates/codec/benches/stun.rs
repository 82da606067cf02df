use bytes::BytesMut;
use criterion::{Criterion, criterion_group, criterion_main};

use turn_server_codec::{
    Attributes, Decoder,
    crypto::long_term_key,
    message::{
        MessageEncoder,
        attributes::{Lifetime, UserName},
        methods::{Method, MethodType},
    },
};

fn encode(c: &mut Criterion) {
    let token = [0u8; 12];
    let key = long_term_key("panda", "raspberry", "panda");
    let mut bytes = BytesMut::with_capacity(1280);

    c.bench_function("encode allocate success", |b| {
        b.iter(|| {
            let mut message =
                MessageEncoder::new(Method::Allocate(MethodType::Response), &token, &mut bytes);
            message.append::<UserName>("panda");
            message.append::<Lifetime>(600);
            message.flush(Some(&key)).unwrap();
        })
    });
}

fn decode(c: &mut Criterion) {
    let token = [0u8; 12];
    let key = long_term_key("panda", "raspberry", "panda");
    let mut bytes = BytesMut::with_capacity(1280);

    {
        let mut message =
            MessageEncoder::new(Method::Allocate(MethodType::Response), &token, &mut bytes);
        message.append::<UserName>("panda");
        message.append::<Lifetime>(600);
        message.flush(Some(&key)).unwrap();
    }

    let mut decoder = Decoder::default();
    let frozen = bytes.freeze();

    c.bench_function("decode allocate success", |b| {
        b.iter(|| {
            decoder.decode(&frozen).unwrap();
        })
    });
}

fn attributes(c: &mut Criterion) {
    c.bench_function("attributes insert+clear", |b| {
        b.iter(|| {
            let mut attrs = Attributes::default();
            for _ in 0..8 {
                attrs.append(
                    turn_server_codec::message::attributes::AttributeType::UserName,
                    0..4,
                );
            }
            attrs.clear();
        })
    });
}

criterion_group!(benches, encode, decode, attributes);
criterion_main!(benches);
