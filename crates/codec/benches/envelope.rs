use criterion::{criterion_group, criterion_main, Criterion};
use pinch_relay_codec::{decode, encode, Envelope, Payload};

fn sample() -> Envelope {
    Envelope::new(
        "pinch:alice@relay.example.com",
        "pinch:bob@relay.example.com",
        vec![0u8; 16],
        1_700_000_000,
        Payload::Encrypted {
            nonce: [3u8; 24],
            ciphertext: vec![0u8; 512],
            sender_public_key: [1u8; 32],
        },
    )
}

fn bench_encode(c: &mut Criterion) {
    let envelope = sample();
    c.bench_function("envelope_encode", |b| {
        b.iter(|| encode(&envelope).unwrap());
    });
}

fn bench_decode(c: &mut Criterion) {
    let bytes = encode(&sample()).unwrap();
    c.bench_function("envelope_decode", |b| {
        b.iter(|| decode(&bytes).unwrap());
    });
}

criterion_group!(benches, bench_encode, bench_decode);
criterion_main!(benches);
