// tests/pipeline_scenarios.rs
mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;

use ethers::types::transaction::eip712::Eip712;
use ethers::types::{Bytes, H256, I256, U256};

use pq_delegate::composer::{decode_standard, decode_zk, SignatureBundle};
use pq_delegate::config::{Mode, FALCON_DELEGATE, FALCON_DELEGATE_ZK, SEPOLIA_CHAIN_ID};
use pq_delegate::bundler::BundlerError;
use pq_delegate::delegation::delegated_code;
use pq_delegate::handoff::{Phase, ProofExportPacket};
use pq_delegate::signer::ledger::LedgerSigner;
use pq_delegate::signer::{ClassicalSigner, ConnectedSigner, DeviceError, SignerError, DEFAULT_SIGNING_PATH};
use pq_delegate::types::{ClassicalSignature, DelegationAuthorization, EIP7702_FACTORY_MARKER};
use pq_delegate::{PipelineError, SubmissionPipeline, SubmitOutcome, ValidationError};

use common::*;

const PROOF: &str = "0xc0ffee00aa [7,-3,0x10]";

fn standard_blob(signature: &Bytes) -> (ClassicalSignature, Bytes) {
    match decode_standard(signature).unwrap() {
        SignatureBundle::HybridClassicalPq { classical, pq } => (classical, pq),
        other => panic!("unexpected bundle {:?}", other),
    }
}

fn pq_message(pq: &[u8]) -> &[u8] {
    &pq[pq.len() - 32..]
}

#[tokio::test]
async fn amount_over_balance_fails_before_any_signature() {
    let card = CountingCard::new();
    let signer = ConnectedSigner::connect(&card, DEFAULT_SIGNING_PATH).await.unwrap();
    let (mut pipeline, _, bundler) = pipeline(FakeChain::new(one_ether()));

    let err = pipeline.submit(&signer, &transfer("1.5", Mode::Standard)).await.unwrap_err();

    assert!(matches!(
        err,
        PipelineError::Validation(ValidationError::AmountExceedsBalance { .. })
    ));
    assert_eq!(card.requests(), 0);
    assert_eq!(bundler.sponsor_calls(), 0);
    assert!(bundler.sent().is_empty());
    assert_eq!(pipeline.phase(), Phase::Idle);
}

#[tokio::test]
async fn standard_transfer_installs_delegate_and_submits() {
    let card = CountingCard::new();
    let signer = ConnectedSigner::connect(&card, DEFAULT_SIGNING_PATH).await.unwrap();
    let sender = signer.account().address;
    let (mut pipeline, _, bundler) = pipeline(FakeChain::new(one_ether() * 2));

    let outcome = pipeline.submit(&signer, &transfer("0.25", Mode::Standard)).await.unwrap();

    let receipt = match outcome {
        SubmitOutcome::Submitted(receipt) => receipt,
        other => panic!("expected submission, got {:?}", other),
    };
    assert_eq!(receipt.user_op_hash, user_op_hash());
    assert_eq!(receipt.transaction_hash, transaction_hash());
    assert!(receipt.success);
    assert_eq!(receipt.account.as_ref().map(|a| a.address), Some(sender));
    assert_eq!(pipeline.account().map(|a| a.address), Some(sender));

    let sent = bundler.sent();
    assert_eq!(sent.len(), 1);
    let op = &sent[0];
    assert_eq!(op.sender, sender);
    assert_eq!(op.factory, Some(EIP7702_FACTORY_MARKER));
    assert!(op.factory_data.as_ref().map_or(false, |data| data.len() > 4));

    let auth = op.eip7702_auth.as_ref().unwrap();
    assert_eq!(auth.address, FALCON_DELEGATE);
    assert_eq!(auth.chain_id.as_u64(), SEPOLIA_CHAIN_ID);
    assert_eq!(auth.nonce.as_u64(), 4);
    let authorization = DelegationAuthorization {
        delegate: FALCON_DELEGATE,
        chain_id: SEPOLIA_CHAIN_ID,
        nonce: 4,
    };
    assert!(signed_by(auth.r, auth.s, authorization.signing_hash(), sender));

    // Classical and post-quantum halves attest to the same digest.
    let (classical, pq) = standard_blob(&op.signature);
    let digest = H256::from_slice(pq_message(&pq));
    assert!(signed_by(classical.r, classical.s, digest, sender));

    // The sponsor is asked with the configured paymaster limit and its answer is kept.
    let sponsored = bundler.sponsored.lock().unwrap().clone();
    assert_eq!(sponsored.len(), 1);
    assert_eq!(
        sponsored[0].paymaster_verification_gas_limit,
        Some(pipeline.settings().gas.paymaster_verification_gas_limit)
    );
    assert_eq!(op.paymaster_verification_gas_limit, Some(U256::from(50_000u64)));
    assert_eq!(op.paymaster_post_op_gas_limit, Some(U256::from(10_000u64)));

    assert_eq!(card.authorization_requests.load(Ordering::SeqCst), 1);
    assert_eq!(card.digest_requests.load(Ordering::SeqCst), 1);
    assert_eq!(pipeline.phase(), Phase::Submitted);
    assert!(pipeline.pending_export().is_none());
}

#[tokio::test]
async fn delegated_account_skips_authorization() {
    let card = CountingCard::new();
    let signer = ConnectedSigner::connect(&card, DEFAULT_SIGNING_PATH).await.unwrap();
    let chain = FakeChain::new(one_ether()).with_code(delegated_code(FALCON_DELEGATE));
    let (mut pipeline, _, bundler) = pipeline(chain);

    pipeline.submit(&signer, &transfer("0.1", Mode::Standard)).await.unwrap();

    let sent = bundler.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].factory, None);
    assert_eq!(sent[0].factory_data, None);
    assert_eq!(sent[0].eip7702_auth, None);
    assert_eq!(card.authorization_requests.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn zk_transfer_without_proof_exports_and_waits() {
    let card = CountingCard::new();
    let signer = ConnectedSigner::connect(&card, DEFAULT_SIGNING_PATH).await.unwrap();
    let account = card.device_account(DEFAULT_SIGNING_PATH).await.unwrap();
    let (mut pipeline, _, bundler) = pipeline(FakeChain::new(one_ether()));
    let request = transfer("0.1", Mode::Zk);

    let packet = match pipeline.submit(&signer, &request).await.unwrap() {
        SubmitOutcome::AwaitingProof(packet) => packet,
        other => panic!("expected export packet, got {:?}", other),
    };

    let (x, y) = account.public_key_coordinates().unwrap();
    assert_eq!(packet.public_key_x, x);
    assert_eq!(packet.public_key_y, y);
    assert!(signed_by(packet.r, packet.s, packet.digest, account.address));
    assert!(bundler.sent().is_empty());
    assert_eq!(pipeline.phase(), Phase::AwaitingExternalProof);
    assert_eq!(pipeline.pending_export(), Some(packet));

    // Asking again replays the packet without signing or sponsoring anew.
    let replay = pipeline.submit(&signer, &request).await.unwrap();
    assert_eq!(replay, SubmitOutcome::AwaitingProof(packet));
    assert_eq!(card.digest_requests.load(Ordering::SeqCst), 1);
    assert_eq!(bundler.sponsor_calls(), 1);
    assert_eq!(packet.to_string().parse::<ProofExportPacket>().unwrap(), packet);
}

#[tokio::test]
async fn zk_transfer_without_commitment_is_rejected() {
    let card = CountingCard::new();
    let signer = ConnectedSigner::connect(&card, DEFAULT_SIGNING_PATH).await.unwrap();
    let (mut pipeline, _, _) = pipeline(FakeChain::new(one_ether()));
    let mut request = transfer("0.1", Mode::Zk);
    request.public_key_commitment = None;

    let err = pipeline.submit(&signer, &request).await.unwrap_err();

    assert!(matches!(
        err,
        PipelineError::Validation(ValidationError::MissingCommitment)
    ));
    assert_eq!(card.requests(), 0);
    assert_eq!(pipeline.phase(), Phase::Idle);
}

#[tokio::test]
async fn imported_proof_finalizes_retained_operation_once() {
    let card = CountingCard::new();
    let signer = ConnectedSigner::connect(&card, DEFAULT_SIGNING_PATH).await.unwrap();
    let (mut pipeline, _, bundler) = pipeline(FakeChain::new(one_ether()));
    let mut request = transfer("0.1", Mode::Zk);

    let packet = match pipeline.submit(&signer, &request).await.unwrap() {
        SubmitOutcome::AwaitingProof(packet) => packet,
        other => panic!("expected export packet, got {:?}", other),
    };

    request.proof = Some(PROOF.to_string());
    let receipt = match pipeline.submit(&signer, &request).await.unwrap() {
        SubmitOutcome::Submitted(receipt) => receipt,
        other => panic!("expected submission, got {:?}", other),
    };
    assert_eq!(receipt.user_op_hash, user_op_hash());

    let sent = bundler.sent();
    assert_eq!(sent.len(), 1);
    let auth = sent[0].eip7702_auth.as_ref().unwrap();
    assert_eq!(auth.address, FALCON_DELEGATE_ZK);

    match decode_zk(&sent[0].signature).unwrap() {
        SignatureBundle::ZkBundle { proof, public_inputs, pq } => {
            assert_eq!(proof.to_vec(), vec![0xc0, 0xff, 0xee, 0x00, 0xaa]);
            assert_eq!(
                public_inputs,
                vec![I256::from(7), I256::from(-3), I256::from(16)]
            );
            assert_eq!(pq_message(&pq), packet.digest.as_bytes());
        }
        other => panic!("unexpected bundle {:?}", other),
    }

    // Finalization reuses the retained signature and operation.
    assert_eq!(card.digest_requests.load(Ordering::SeqCst), 1);
    assert_eq!(bundler.sponsor_calls(), 1);
    assert_eq!(pipeline.phase(), Phase::Submitted);
    assert!(pipeline.pending_export().is_none());
}

#[tokio::test]
async fn malformed_proof_keeps_operation_pending() {
    let card = CountingCard::new();
    let signer = ConnectedSigner::connect(&card, DEFAULT_SIGNING_PATH).await.unwrap();
    let (mut pipeline, _, bundler) = pipeline(FakeChain::new(one_ether()));
    let mut request = transfer("0.1", Mode::Zk);
    pipeline.submit(&signer, &request).await.unwrap();
    let export = pipeline.pending_export();

    for bad in ["", "c0ffee", "zz [1]", "c0ffee [1,two]"] {
        request.proof = Some(bad.to_string());
        let err = pipeline.submit(&signer, &request).await.unwrap_err();
        assert!(matches!(err, PipelineError::ProofFormat(_)), "{}", bad);
        assert_eq!(pipeline.phase(), Phase::AwaitingExternalProof);
        assert_eq!(pipeline.pending_export(), export);
    }

    request.proof = Some(PROOF.to_string());
    assert!(matches!(
        pipeline.submit(&signer, &request).await.unwrap(),
        SubmitOutcome::Submitted(_)
    ));
    assert_eq!(bundler.sent().len(), 1);
}

#[tokio::test]
async fn rejected_send_keeps_operation_pending() {
    let card = CountingCard::new();
    let signer = ConnectedSigner::connect(&card, DEFAULT_SIGNING_PATH).await.unwrap();
    let (mut pipeline, _, bundler) = pipeline(FakeChain::new(one_ether()));
    let mut request = transfer("0.1", Mode::Zk);
    pipeline.submit(&signer, &request).await.unwrap();
    let export = pipeline.pending_export();

    *bundler.reject_sends.lock().unwrap() = true;
    request.proof = Some(PROOF.to_string());
    let err = pipeline.submit(&signer, &request).await.unwrap_err();
    assert!(matches!(err, PipelineError::Bundler(_)));
    assert!(err.is_retryable());
    assert_eq!(pipeline.phase(), Phase::AwaitingExternalProof);
    assert_eq!(pipeline.pending_export(), export);

    *bundler.reject_sends.lock().unwrap() = false;
    pipeline.submit(&signer, &request).await.unwrap();
    assert_eq!(bundler.sent().len(), 1);
}

#[tokio::test]
async fn standard_request_while_proof_pending_is_rejected() {
    let card = CountingCard::new();
    let signer = ConnectedSigner::connect(&card, DEFAULT_SIGNING_PATH).await.unwrap();
    let (mut pipeline, _, bundler) = pipeline(FakeChain::new(one_ether()));
    pipeline.submit(&signer, &transfer("0.1", Mode::Zk)).await.unwrap();
    let export = pipeline.pending_export();

    let err = pipeline.submit(&signer, &transfer("0.1", Mode::Standard)).await.unwrap_err();

    assert!(matches!(
        err,
        PipelineError::Validation(ValidationError::PendingZkOperation)
    ));
    assert_eq!(pipeline.pending_export(), export);
    assert!(bundler.sent().is_empty());

    pipeline.reset();
    assert_eq!(pipeline.phase(), Phase::Idle);
    assert!(matches!(
        pipeline.submit(&signer, &transfer("0.1", Mode::Standard)).await.unwrap(),
        SubmitOutcome::Submitted(_)
    ));
}

#[tokio::test]
async fn proof_without_pending_operation_is_rejected() {
    let card = CountingCard::new();
    let signer = ConnectedSigner::connect(&card, DEFAULT_SIGNING_PATH).await.unwrap();
    let (mut pipeline, _, _) = pipeline(FakeChain::new(one_ether()));
    let mut request = transfer("0.1", Mode::Zk);
    request.proof = Some(PROOF.to_string());

    let err = pipeline.submit(&signer, &request).await.unwrap_err();

    assert!(matches!(
        err,
        PipelineError::Validation(ValidationError::ProofWithoutPendingOperation)
    ));
    assert_eq!(card.requests(), 0);
}

#[tokio::test]
async fn device_failure_leaves_state_untouched() {
    let card = CountingCard::failing(DeviceError::new("0x6985", "Condition of use not satisfied"));
    let signer = ConnectedSigner::connect(&card, DEFAULT_SIGNING_PATH).await.unwrap();
    let (mut pipeline, _, bundler) = pipeline(FakeChain::new(one_ether()));

    let err = pipeline.submit(&signer, &transfer("0.1", Mode::Standard)).await.unwrap_err();

    assert!(matches!(err, PipelineError::Signer(_)));
    assert!(pipeline.account().is_none());
    assert!(pipeline.pending_export().is_none());
    assert_eq!(pipeline.phase(), Phase::Idle);
    assert!(bundler.sent().is_empty());
}

#[tokio::test]
async fn zk_without_required_proof_submits_standard_blob() {
    let card = CountingCard::new();
    let signer = ConnectedSigner::connect(&card, DEFAULT_SIGNING_PATH).await.unwrap();
    let mut settings = settings();
    settings.proof_required = false;
    let bundler = Arc::new(FakeBundler::default());
    let mut pipeline = SubmissionPipeline::new(settings, Arc::new(FakeChain::new(one_ether())), bundler.clone());

    let outcome = pipeline.submit(&signer, &transfer("0.1", Mode::Zk)).await.unwrap();

    assert!(matches!(outcome, SubmitOutcome::Submitted(_)));
    let sent = bundler.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].eip7702_auth.as_ref().map(|a| a.address), Some(FALCON_DELEGATE_ZK));
    let (_, pq) = standard_blob(&sent[0].signature);
    assert!(!pq.is_empty());
}

#[tokio::test]
async fn failed_account_refresh_still_reports_submission() {
    let card = CountingCard::new();
    let signer = ConnectedSigner::connect(&card, DEFAULT_SIGNING_PATH).await.unwrap();
    let mut chain = FakeChain::new(one_ether());
    chain.fail_balance_from = Some(2);
    let (mut pipeline, chain, _) = pipeline(chain);

    let receipt = match pipeline.submit(&signer, &transfer("0.1", Mode::Standard)).await.unwrap() {
        SubmitOutcome::Submitted(receipt) => receipt,
        other => panic!("expected submission, got {:?}", other),
    };

    assert!(receipt.account.is_none());
    assert!(pipeline.account().is_none());
    assert_eq!(chain.balance_reads.load(Ordering::SeqCst), 2);
    assert!(receipt.success);
}

#[tokio::test]
async fn failed_receipt_lookup_reports_the_sent_operation() {
    let card = CountingCard::new();
    let signer = ConnectedSigner::connect(&card, DEFAULT_SIGNING_PATH).await.unwrap();
    let (mut pipeline, _, bundler) = pipeline(FakeChain::new(one_ether()));
    *bundler.receipt_error.lock().unwrap() = Some(BundlerError::Transport("503 Service Unavailable".to_string()));

    let err = pipeline.submit(&signer, &transfer("0.1", Mode::Standard)).await.unwrap_err();

    match &err {
        PipelineError::Unconfirmed { user_op_hash: hash, source } => {
            assert_eq!(*hash, user_op_hash());
            assert!(matches!(source, BundlerError::Transport(_)));
        }
        other => panic!("expected unconfirmed operation, got {:?}", other),
    }
    assert!(!err.is_retryable());
    assert_eq!(err.user_op_hash(), Some(user_op_hash()));
    assert_eq!(bundler.sent().len(), 1);
    assert_eq!(pipeline.phase(), Phase::Submitted);
    assert!(pipeline.pending_export().is_none());
}

#[tokio::test]
async fn ledger_rejection_stops_before_sponsorship() {
    let ledger = LedgerSigner::new(WalletDevice::failing(DeviceError::new(
        "0x6985",
        "Condition of use not satisfied",
    )));
    let signer = ConnectedSigner::connect(&ledger, DEFAULT_SIGNING_PATH).await.unwrap();
    let (mut pipeline, _, bundler) = pipeline(FakeChain::new(one_ether()));
    assert!(pipeline.account().is_none());

    let err = pipeline.submit(&signer, &transfer("0.1", Mode::Standard)).await.unwrap_err();

    match &err {
        PipelineError::Signer(SignerError::Device(cause)) => assert_eq!(cause.code, "0x6985"),
        other => panic!("expected device error, got {:?}", other),
    }
    assert_eq!(pipeline.phase(), Phase::Idle);
    assert!(pipeline.account().is_none());
    assert!(pipeline.pending_export().is_none());
    assert_eq!(bundler.sponsor_calls(), 0);
    assert!(bundler.sent().is_empty());
}

#[tokio::test]
async fn ledger_clear_signs_the_user_operation() {
    let device = WalletDevice::new();
    let address = device.address();
    let documents = device.documents.clone();
    let ledger = LedgerSigner::new(device);
    let signer = ConnectedSigner::connect(&ledger, DEFAULT_SIGNING_PATH).await.unwrap();
    assert_eq!(signer.account().address, address);
    let (mut pipeline, _, bundler) = pipeline(FakeChain::new(one_ether()));

    let packet = match pipeline.submit(&signer, &transfer("0.1", Mode::Zk)).await.unwrap() {
        SubmitOutcome::AwaitingProof(packet) => packet,
        other => panic!("expected export packet, got {:?}", other),
    };

    assert!(signed_by(packet.r, packet.s, packet.digest, address));

    // The device saw the whole document, and it hashes to the signed digest.
    let documents = documents.lock().unwrap().clone();
    assert_eq!(documents.len(), 1);
    assert_eq!(documents[0].primary_type, "PackedUserOperation");
    assert_eq!(H256(documents[0].encode_eip712().unwrap()), packet.digest);
    assert_eq!(bundler.sponsor_calls(), 1);
    assert!(bundler.sent().is_empty());
}

