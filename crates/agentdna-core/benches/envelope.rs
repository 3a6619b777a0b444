#![allow(clippy::unwrap_used, clippy::expect_used)]
//! Criterion benchmarks for envelope build and verification.

use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use serde_json::json;

use agentdna_core::codec;
use agentdna_core::{
    canonicalize_json, BuildInput, EnvelopeBuilder, EnvelopeKind, Identity, Keypair,
    PeerDirectory, Verifier, VerifierConfig, VerifyMode,
};

fn sample_state() -> serde_json::Value {
    json!({
        "task_id": "t1",
        "context_id": "c1",
        "calendar": {
            "owner": "alice",
            "slots": [
                {"start": "2026-10-18T09:00:00Z", "end": "2026-10-18T10:00:00Z", "busy": true},
                {"start": "2026-10-18T15:00:00Z", "end": "2026-10-18T16:00:00Z", "busy": false}
            ]
        },
        "weights": [0.5, 1.25, 1e-7, 42]
    })
}

fn bench_canonicalize(c: &mut Criterion) {
    let state = sample_state();
    c.bench_function("canonicalize_state", |b| {
        b.iter(|| canonicalize_json(black_box(&state)).unwrap());
    });
}

fn bench_build(c: &mut Criterion) {
    let builder = EnvelopeBuilder::new(Arc::new(Identity::new("bench", Keypair::generate())));
    c.bench_function("build_host_request", |b| {
        b.iter(|| {
            builder
                .build(BuildInput::host(
                    black_box("Are you free tomorrow?"),
                    sample_state(),
                ))
                .unwrap()
        });
    });
}

fn bench_verify(c: &mut Criterion) {
    let identity = Arc::new(Identity::new("bench", Keypair::generate()));
    let envelope = EnvelopeBuilder::new(identity.clone())
        .build(BuildInput::host("Are you free tomorrow?", sample_state()))
        .unwrap();
    let raw = envelope.to_json_bytes().unwrap();
    let verifier = Verifier::new(VerifierConfig::default(), Arc::new(PeerDirectory::new()));

    c.bench_function("decode_envelope", |b| {
        b.iter(|| codec::decode(black_box(&raw)).unwrap());
    });

    c.bench_function("assess_light", |b| {
        b.iter(|| {
            let decoded = codec::decode(black_box(&raw)).unwrap();
            verifier.assess(
                &decoded,
                identity.public_key(),
                VerifyMode::Light,
                Some(EnvelopeKind::HostRequest),
                chrono::Utc::now(),
            )
        });
    });
}

criterion_group!(benches, bench_canonicalize, bench_build, bench_verify);
criterion_main!(benches);
