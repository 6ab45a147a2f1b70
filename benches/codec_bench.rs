//! Codec micro-benchmarks: conversation-key derivation, frame
//! seal/open and envelope sign/verify dominate per-event cost.

use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use uuid::Uuid;

use newt::codec::{ConversationKey, MessageCodec, PeerKeys, StreamFrame};
use newt::resolver;

fn bench_conversation_key(c: &mut Criterion) {
    let ours = PeerKeys::generate();
    let theirs = PeerKeys::generate().public_hex();

    c.bench_function("conversation_key_derive", |b| {
        b.iter(|| ConversationKey::derive(black_box(&ours), black_box(&theirs)).unwrap())
    });
}

fn bench_seal_open(c: &mut Criterion) {
    let ours = PeerKeys::generate();
    let theirs = PeerKeys::generate();
    let key = ConversationKey::derive(&ours, &theirs.public_hex()).unwrap();

    let mut group = c.benchmark_group("frame_payload");
    for size in [128usize, 1024, 16 * 1024] {
        let frame = StreamFrame::data(Uuid::new_v4(), vec![0xAB; size], "127.0.0.1:3338");
        let plaintext = frame.to_bytes().unwrap();
        let sealed = key.seal(&plaintext).unwrap();

        group.throughput(Throughput::Bytes(size as u64));
        group.bench_function(format!("seal_{size}"), |b| {
            b.iter(|| key.seal(black_box(&plaintext)).unwrap())
        });
        group.bench_function(format!("open_{size}"), |b| {
            b.iter(|| key.open(black_box(&sealed)).unwrap())
        });
    }
    group.finish();
}

fn bench_sign_verify(c: &mut Criterion) {
    let codec = MessageCodec::new(Arc::new(PeerKeys::generate()));
    let peer = PeerKeys::generate().public_hex();
    let frame = StreamFrame::data(Uuid::new_v4(), vec![0xAB; 1024], "127.0.0.1:3338");
    let envelope = codec.stream_event(&frame, &peer).unwrap();

    c.bench_function("stream_event_sign", |b| {
        b.iter(|| codec.stream_event(black_box(&frame), black_box(&peer)).unwrap())
    });
    c.bench_function("envelope_verify", |b| {
        b.iter(|| black_box(&envelope).verify().unwrap())
    });
}

fn bench_resolver(c: &mut Criterion) {
    let pubkey = PeerKeys::generate().public_hex();
    let relays = vec!["ws://r:6666".to_string(), "wss://relay.example".to_string()];
    let host = resolver::encode_nostr_host(&pubkey, &relays).unwrap();
    let token = resolver::encode_nprofile(&pubkey, &relays).unwrap();
    let defaults = vec!["wss://default.relay".to_string()];

    c.bench_function("resolve_nostr_host", |b| {
        b.iter(|| resolver::resolve(black_box(&host), black_box(&defaults)).unwrap())
    });
    c.bench_function("resolve_nprofile", |b| {
        b.iter(|| resolver::resolve(black_box(&token), black_box(&defaults)).unwrap())
    });
}

criterion_group!(
    benches,
    bench_conversation_key,
    bench_seal_open,
    bench_sign_verify,
    bench_resolver
);
criterion_main!(benches);
