use criterion::{criterion_group, criterion_main, Criterion};

use aircast::{
    crypto::aead::{protect, unprotect, SessionKey},
    wire::{build_frame, frame_aad, parse_frame, FrameHeader, RadiotapTxHeader, Role},
};

fn bench_frame_build_parse(c: &mut Criterion) {
    let radiotap = RadiotapTxHeader::default();
    let key = SessionKey::new([7u8; 32]);
    let payload = vec![0xabu8; 1024];

    c.bench_function("protect_1k", |b| {
        b.iter(|| {
            let aad = frame_aad(0x05, 1);
            protect(&key, 1, &aad, &payload, true).unwrap()
        })
    });

    let aad = frame_aad(0x05, 1);
    let region = protect(&key, 1, &aad, &payload, true).unwrap();
    let header = FrameHeader {
        role: Role::Air,
        radio_port: 0x05,
        nonce: 1,
        seq_ctrl: 16,
    };
    let frame = build_frame(&radiotap, &header, &region);

    c.bench_function("parse_and_unprotect_1k", |b| {
        b.iter(|| {
            let parts = parse_frame(Role::Ground, &frame).unwrap();
            let aad = frame_aad(parts.header.radio_port, parts.header.nonce);
            unprotect(&key, parts.header.nonce, &aad, parts.payload, true).unwrap()
        })
    });
}

criterion_group!(benches, bench_frame_build_parse);
criterion_main!(benches);
