//! Concurrent submissions of one envelope under heavy verification.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::sync::Arc;

use agentdna_core::{
    BuildInput, EnvelopeBuilder, EnvelopeKind, Identity, Keypair, NonceWindow, PeerDirectory,
    TrustIssueKind, Verifier, VerifierConfig, VerifyMode,
};
use serde_json::json;

fn setup() -> (Arc<Verifier>, Vec<u8>) {
    let identity = Arc::new(Identity::new("host", Keypair::generate()));
    let directory = Arc::new(PeerDirectory::new());
    directory.register_key(identity.public_key().clone());
    let raw = EnvelopeBuilder::new(identity)
        .build(BuildInput::host("once only", json!({})))
        .unwrap()
        .to_json_bytes()
        .unwrap();
    (
        Arc::new(Verifier::new(VerifierConfig::default(), directory)),
        raw,
    )
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn exactly_one_concurrent_submission_is_accepted() {
    let (verifier, raw) = setup();
    let raw = Arc::new(raw);

    let tasks: Vec<_> = (0..32)
        .map(|_| {
            let verifier = verifier.clone();
            let raw = raw.clone();
            tokio::spawn(async move {
                verifier
                    .handle(&raw, VerifyMode::Heavy, Some(EnvelopeKind::HostRequest))
                    .await
                    .unwrap()
            })
        })
        .collect();

    let mut accepted = 0;
    let mut replays = 0;
    for task in tasks {
        let trust = task.await.unwrap();
        if trust.is_fully_trusted() {
            accepted += 1;
        } else {
            assert_eq!(trust.issue_kinds(), vec![TrustIssueKind::ReplayDetected]);
            replays += 1;
        }
    }
    assert_eq!(accepted, 1);
    assert_eq!(replays, 31);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn light_mode_accepts_every_copy() {
    let (verifier, raw) = setup();
    for _ in 0..4 {
        let trust = verifier.handle(&raw, VerifyMode::Light, None).await.unwrap();
        assert!(trust.is_fully_trusted());
    }
    assert!(verifier.nonce_window().is_empty());
}

#[test]
fn nonce_window_insert_is_atomic() {
    let window = Arc::new(NonceWindow::new(16));
    let handles: Vec<_> = (0..8)
        .map(|_| {
            let window = window.clone();
            std::thread::spawn(move || window.check_and_insert("did:dna:shared", "n-1"))
        })
        .collect();
    let inserted = handles
        .into_iter()
        .map(|h| h.join().unwrap())
        .filter(|fresh| *fresh)
        .count();
    assert_eq!(inserted, 1);
    assert_eq!(window.len(), 1);
}
