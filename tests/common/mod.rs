// tests/common/mod.rs
#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use ethers::signers::{LocalWallet, Signer};
use ethers::types::transaction::eip712::{Eip712, TypedData};
use ethers::types::{Address, Bytes, Signature, H256, U256};
use futures::stream;
use futures::StreamExt;

use pq_delegate::bundler::{Bundler, BundlerError};
use pq_delegate::chain::{ChainReadError, ChainReader};
use pq_delegate::config::{Mode, PipelineSettings, ReceiptPolling, SEPOLIA_CHAIN_ID};
use pq_delegate::signer::discovery::SessionId;
use pq_delegate::signer::halo::{HaloSigner, SoftCard};
use pq_delegate::signer::ledger::{ActionStream, AddressOutput, DeviceActionState, DeviceSession, RawSignature};
use pq_delegate::signer::{ClassicalSigner, DeviceAccount, DeviceError, SignerBackend, SignerError, TypedDigest};
use pq_delegate::types::{
    ClassicalSignature, DelegationAuthorization, GasFees, PaymasterContext, RpcUserOperation, Sponsorship,
    TransactionReceiptRef, UserOperationReceipt,
};
use pq_delegate::{SubmissionPipeline, TransferRequest};

pub const CARD_KEY: &str = "4c0883a69102937d6231471b5dbb6204fe5129617082792ae468d01a3f362318";
pub const DESTINATION: &str = "0x00000000000000000000000000000000000000de";
pub const PQ_SEED: [u8; 32] = [7u8; 32];

pub fn one_ether() -> U256 {
    U256::exp10(18)
}

pub struct FakeChain {
    pub code: Mutex<Bytes>,
    pub balance: U256,
    pub nonce: U256,
    pub balance_reads: AtomicUsize,
    /// `get_balance` fails from this read on (1-based).
    pub fail_balance_from: Option<usize>,
}

impl FakeChain {
    pub fn new(balance: U256) -> Self {
        Self {
            code: Mutex::new(Bytes::default()),
            balance,
            nonce: U256::from(4),
            balance_reads: AtomicUsize::new(0),
            fail_balance_from: None,
        }
    }

    pub fn with_code(self, code: Bytes) -> Self {
        *self.code.lock().unwrap() = code;
        self
    }
}

#[async_trait]
impl ChainReader for FakeChain {
    async fn get_code(&self, _address: Address) -> Result<Bytes, ChainReadError> {
        Ok(self.code.lock().unwrap().clone())
    }

    async fn get_balance(&self, _address: Address) -> Result<U256, ChainReadError> {
        let read = self.balance_reads.fetch_add(1, Ordering::SeqCst) + 1;
        match self.fail_balance_from {
            Some(from) if read >= from => Err(ChainReadError::Provider("connection reset".to_string())),
            _ => Ok(self.balance),
        }
    }

    async fn get_transaction_count(&self, _address: Address) -> Result<U256, ChainReadError> {
        Ok(self.nonce)
    }

    async fn get_entry_point_nonce(&self, _entry_point: Address, _sender: Address) -> Result<U256, ChainReadError> {
        Ok(U256::zero())
    }
}

#[derive(Default)]
pub struct FakeBundler {
    pub sponsored: Mutex<Vec<RpcUserOperation>>,
    pub sent: Mutex<Vec<RpcUserOperation>>,
    pub reject_sends: Mutex<bool>,
    /// Returned by every receipt lookup once set.
    pub receipt_error: Mutex<Option<BundlerError>>,
}

impl FakeBundler {
    pub fn sent(&self) -> Vec<RpcUserOperation> {
        self.sent.lock().unwrap().clone()
    }

    pub fn sponsor_calls(&self) -> usize {
        self.sponsored.lock().unwrap().len()
    }
}

pub fn user_op_hash() -> H256 {
    H256::repeat_byte(0x0b)
}

pub fn transaction_hash() -> H256 {
    H256::repeat_byte(0x0c)
}

#[async_trait]
impl Bundler for FakeBundler {
    async fn estimate_fees(&self) -> Result<GasFees, BundlerError> {
        Ok(GasFees {
            max_fee_per_gas: U256::from(20_000_000_000u64),
            max_priority_fee_per_gas: U256::from(1_000_000_000u64),
        })
    }

    async fn sponsor_user_operation(
        &self,
        op: &RpcUserOperation,
        _entry_point: Address,
        _context: &PaymasterContext,
    ) -> Result<Sponsorship, BundlerError> {
        self.sponsored.lock().unwrap().push(op.clone());
        Ok(Sponsorship {
            paymaster: Address::repeat_byte(0x77),
            paymaster_data: Bytes::from(vec![0x01, 0x02]),
            paymaster_verification_gas_limit: U256::from(50_000u64),
            paymaster_post_op_gas_limit: U256::from(10_000u64),
            call_gas_limit: U256::from(60_000u64),
            verification_gas_limit: U256::from(70_000u64),
            pre_verification_gas: U256::from(80_000u64),
        })
    }

    async fn send_user_operation(&self, op: &RpcUserOperation, _entry_point: Address) -> Result<H256, BundlerError> {
        if *self.reject_sends.lock().unwrap() {
            return Err(BundlerError::Rejected("AA23 reverted".to_string()));
        }
        self.sent.lock().unwrap().push(op.clone());
        Ok(user_op_hash())
    }

    async fn get_user_operation_receipt(&self, hash: H256) -> Result<Option<UserOperationReceipt>, BundlerError> {
        if let Some(e) = self.receipt_error.lock().unwrap().clone() {
            return Err(e);
        }
        Ok(Some(UserOperationReceipt {
            user_op_hash: hash,
            success: true,
            receipt: TransactionReceiptRef {
                transaction_hash: transaction_hash(),
            },
        }))
    }
}

/// Tap card that counts requests and can be told to fail digest signing.
pub struct CountingCard {
    inner: HaloSigner<SoftCard>,
    pub digest_requests: AtomicUsize,
    pub authorization_requests: AtomicUsize,
    pub fail_digest: Option<DeviceError>,
}

impl CountingCard {
    pub fn new() -> Self {
        Self {
            inner: HaloSigner::new(SoftCard::new(CARD_KEY.parse::<LocalWallet>().unwrap())),
            digest_requests: AtomicUsize::new(0),
            authorization_requests: AtomicUsize::new(0),
            fail_digest: None,
        }
    }

    pub fn failing(cause: DeviceError) -> Self {
        Self {
            fail_digest: Some(cause),
            ..Self::new()
        }
    }

    pub fn requests(&self) -> usize {
        self.digest_requests.load(Ordering::SeqCst) + self.authorization_requests.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ClassicalSigner for CountingCard {
    fn backend(&self) -> SignerBackend {
        SignerBackend::Halo
    }

    async fn device_account(&self, path: &str) -> Result<DeviceAccount, SignerError> {
        self.inner.device_account(path).await
    }

    async fn sign_digest(&self, path: &str, digest: &TypedDigest) -> Result<ClassicalSignature, SignerError> {
        self.digest_requests.fetch_add(1, Ordering::SeqCst);
        if let Some(cause) = &self.fail_digest {
            return Err(SignerError::Device(cause.clone()));
        }
        self.inner.sign_digest(path, digest).await
    }

    async fn sign_delegation_authorization(
        &self,
        path: &str,
        authorization: &DelegationAuthorization,
    ) -> Result<ClassicalSignature, SignerError> {
        self.authorization_requests.fetch_add(1, Ordering::SeqCst);
        self.inner.sign_delegation_authorization(path, authorization).await
    }
}

/// Ledger session answering from a local key. Each action reports `Pending`
/// first, then either a signature or the configured device error.
pub struct WalletDevice {
    id: SessionId,
    wallet: LocalWallet,
    pub fail_with: Option<DeviceError>,
    /// Shared so a test can keep a handle after the session moves into a signer.
    pub documents: Arc<Mutex<Vec<TypedData>>>,
    pub hashed_requests: AtomicUsize,
    pub authorization_requests: AtomicUsize,
}

impl WalletDevice {
    pub fn new() -> Self {
        Self {
            id: SessionId::from("ledger-session"),
            wallet: CARD_KEY.parse::<LocalWallet>().unwrap(),
            fail_with: None,
            documents: Arc::new(Mutex::new(Vec::new())),
            hashed_requests: AtomicUsize::new(0),
            authorization_requests: AtomicUsize::new(0),
        }
    }

    pub fn failing(cause: DeviceError) -> Self {
        Self {
            fail_with: Some(cause),
            ..Self::new()
        }
    }

    pub fn address(&self) -> Address {
        self.wallet.address()
    }

    pub fn requests(&self) -> usize {
        self.documents.lock().unwrap().len()
            + self.hashed_requests.load(Ordering::SeqCst)
            + self.authorization_requests.load(Ordering::SeqCst)
    }

    fn answer(&self, hash: H256) -> ActionStream<RawSignature> {
        let terminal = match &self.fail_with {
            Some(cause) => DeviceActionState::Error(cause.clone()),
            None => {
                let signature = self.wallet.sign_hash(hash).unwrap();
                let (mut r, mut s) = ([0u8; 32], [0u8; 32]);
                signature.r.to_big_endian(&mut r);
                signature.s.to_big_endian(&mut s);
                DeviceActionState::Completed(RawSignature {
                    v: signature.v,
                    r: H256(r),
                    s: H256(s),
                })
            }
        };
        stream::iter(vec![DeviceActionState::Pending, terminal]).boxed()
    }
}

impl DeviceSession for WalletDevice {
    fn session_id(&self) -> &SessionId {
        &self.id
    }

    fn get_address(&self, _path: &str) -> ActionStream<AddressOutput> {
        let point = self.wallet.signer().verifying_key().to_encoded_point(false);
        let output = AddressOutput {
            address: self.wallet.address(),
            public_key: Bytes::from(point.as_bytes().to_vec()),
        };
        stream::iter(vec![DeviceActionState::Pending, DeviceActionState::Completed(output)]).boxed()
    }

    fn sign_eip712_hashed(&self, _path: &str, domain_separator: H256, struct_hash: H256) -> ActionStream<RawSignature> {
        self.hashed_requests.fetch_add(1, Ordering::SeqCst);
        self.answer(
            TypedDigest {
                domain_separator,
                struct_hash,
            }
            .digest(),
        )
    }

    fn sign_typed_data(&self, _path: &str, document: &TypedData) -> ActionStream<RawSignature> {
        self.documents.lock().unwrap().push(document.clone());
        self.answer(H256(document.encode_eip712().unwrap()))
    }

    fn sign_delegation_authorization(
        &self,
        _path: &str,
        chain_id: u64,
        delegate: Address,
        nonce: u64,
    ) -> ActionStream<RawSignature> {
        self.authorization_requests.fetch_add(1, Ordering::SeqCst);
        let authorization = DelegationAuthorization {
            delegate,
            chain_id,
            nonce,
        };
        self.answer(authorization.signing_hash())
    }
}

pub fn settings() -> PipelineSettings {
    let mut settings = PipelineSettings::new(
        SEPOLIA_CHAIN_ID,
        PQ_SEED,
        PaymasterContext {
            sponsorship_policy_id: Some("sp_test_policy".to_string()),
        },
    );
    settings.receipt_polling = ReceiptPolling {
        interval: Duration::from_millis(1),
        max_attempts: 3,
    };
    settings
}

pub type TestPipeline = SubmissionPipeline<FakeChain, FakeBundler>;

pub fn pipeline(chain: FakeChain) -> (TestPipeline, Arc<FakeChain>, Arc<FakeBundler>) {
    let chain = Arc::new(chain);
    let bundler = Arc::new(FakeBundler::default());
    (
        SubmissionPipeline::new(settings(), chain.clone(), bundler.clone()),
        chain,
        bundler,
    )
}

pub fn transfer(amount: &str, mode: Mode) -> TransferRequest {
    TransferRequest {
        destination: DESTINATION.to_string(),
        amount: amount.to_string(),
        mode,
        public_key_commitment: Some("12345".to_string()),
        proof: None,
    }
}

/// Whether `(r, s)` over `hash` was made by `address` with either parity.
pub fn signed_by(r: H256, s: H256, hash: H256, address: Address) -> bool {
    [27u64, 28].iter().any(|&v| {
        let signature = Signature {
            r: U256::from_big_endian(r.as_bytes()),
            s: U256::from_big_endian(s.as_bytes()),
            v,
        };
        signature.recover(hash).map(|a| a == address).unwrap_or(false)
    })
}
