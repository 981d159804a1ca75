//! Benchmarks for payload sealing, encoding and merging
//!
//! Run with: cargo bench

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use privtx::codec::PayloadCodec;
use privtx::enclave::{Enclave, LocalEnclave};
use privtx::payload::{EncodedPayload, PrivacyMetadata};
use privtx::types::PublicKey;

fn seal(enclave: &LocalEnclave, recipients: &[PublicKey]) -> EncodedPayload {
    enclave
        .encrypt_payload(
            &[7u8; 4096],
            &enclave.default_public_key(),
            recipients,
            &PrivacyMetadata::standard(),
        )
        .unwrap()
}

fn bench_encrypt(c: &mut Criterion) {
    let enclave = LocalEnclave::generate(1).unwrap();
    let remote = LocalEnclave::generate(10).unwrap();
    let recipients: Vec<PublicKey> = remote.managed_keys().into_iter().collect();

    c.bench_function("encrypt_4k_to_10_recipients", |b| {
        b.iter(|| seal(&enclave, black_box(&recipients)))
    });
}

fn bench_codecs(c: &mut Criterion) {
    let enclave = LocalEnclave::generate(1).unwrap();
    let remote = LocalEnclave::generate(10).unwrap();
    let recipients: Vec<PublicKey> = remote.managed_keys().into_iter().collect();
    let payload = seal(&enclave, &recipients);

    for codec in [PayloadCodec::Bincode, PayloadCodec::Json] {
        let encoded = codec.encode(&payload).unwrap();

        c.bench_function(&format!("encode_{}", codec), |b| {
            b.iter(|| codec.encode(black_box(&payload)).unwrap())
        });
        c.bench_function(&format!("decode_{}", codec), |b| {
            b.iter(|| codec.decode(black_box(&encoded)).unwrap())
        });
    }
}

fn bench_merge_recipient_boxes(c: &mut Criterion) {
    let enclave = LocalEnclave::generate(1).unwrap();
    let remote = LocalEnclave::generate(20).unwrap();
    let recipients: Vec<PublicKey> = remote.managed_keys().into_iter().collect();
    let full = seal(&enclave, &recipients);

    // Every recipient's single-box view, as pushed to it
    let views: Vec<EncodedPayload> = recipients
        .iter()
        .filter_map(|key| full.for_recipient(key))
        .collect();

    c.bench_function("merge_20_single_recipient_views", |b| {
        b.iter(|| {
            let mut merged = views[0].clone();
            for view in &views[1..] {
                if let Some(next) = merged.merge_recipient_boxes(black_box(view)).unwrap() {
                    merged = next;
                }
            }
            merged
        })
    });
}

criterion_group!(
    benches,
    bench_encrypt,
    bench_codecs,
    bench_merge_recipient_boxes
);
criterion_main!(benches);
