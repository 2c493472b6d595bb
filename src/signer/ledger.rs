// src/signer/ledger.rs
//! Hardware-dongle signer.
//!
//! Every device request is a multi-step action reported as a stream of
//! [`DeviceActionState`]s. The signer waits for the first terminal state.
//! Dropping the returned future unsubscribes from the stream; the device itself
//! is unaffected and finishes or times out on its own.

use async_trait::async_trait;
use ethers::types::transaction::eip712::TypedData;
use ethers::types::{Address, Bytes, H256};
use futures::stream::BoxStream;
use futures::StreamExt;
use tokio::sync::Mutex;
use tracing::{debug, error, info};

use super::discovery::SessionId;
use super::{ClassicalSigner, DeviceAccount, DeviceError, SignerBackend, SignerError, TypedDigest};
use crate::types::{ClassicalSignature, DelegationAuthorization};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceActionState<T> {
    /// Waiting on the device, usually for user confirmation.
    Pending,
    Completed(T),
    Error(DeviceError),
}

pub type ActionStream<T> = BoxStream<'static, DeviceActionState<T>>;

/// Signature as returned by the device app, `v` in whatever form it chose.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawSignature {
    pub v: u64,
    pub r: H256,
    pub s: H256,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressOutput {
    pub address: Address,
    pub public_key: Bytes,
}

/// An open session with the device's Ethereum app.
pub trait DeviceSession: Send + Sync {
    fn session_id(&self) -> &SessionId;

    fn get_address(&self, path: &str) -> ActionStream<AddressOutput>;

    fn sign_eip712_hashed(&self, path: &str, domain_separator: H256, struct_hash: H256) -> ActionStream<RawSignature>;

    /// Clear-signs a full EIP-712 document.
    fn sign_typed_data(&self, path: &str, document: &TypedData) -> ActionStream<RawSignature>;

    fn sign_delegation_authorization(
        &self,
        path: &str,
        chain_id: u64,
        delegate: Address,
        nonce: u64,
    ) -> ActionStream<RawSignature>;
}

/// Drives an action to its terminal state.
pub async fn await_terminal<T>(mut states: ActionStream<T>) -> Result<T, SignerError> {
    while let Some(state) = states.next().await {
        match state {
            DeviceActionState::Pending => debug!("device action pending"),
            DeviceActionState::Completed(output) => return Ok(output),
            DeviceActionState::Error(cause) => {
                error!("device action failed: {}", cause);
                return Err(SignerError::Device(cause));
            }
        }
    }
    Err(SignerError::Interrupted)
}

fn normalize(raw: RawSignature) -> Result<ClassicalSignature, SignerError> {
    ClassicalSignature::from_rsv(raw.r, raw.s, raw.v)
        .ok_or_else(|| SignerError::MalformedResponse(format!("recovery id v={}", raw.v)))
}

pub struct LedgerSigner<S> {
    // Held for the whole of one request: a session never runs two actions at once.
    session: Mutex<S>,
}

impl<S: DeviceSession> LedgerSigner<S> {
    pub fn new(session: S) -> Self {
        Self {
            session: Mutex::new(session),
        }
    }

    pub async fn session_id(&self) -> SessionId {
        self.session.lock().await.session_id().clone()
    }
}

#[async_trait]
impl<S: DeviceSession> ClassicalSigner for LedgerSigner<S> {
    fn backend(&self) -> SignerBackend {
        SignerBackend::Ledger
    }

    async fn device_account(&self, path: &str) -> Result<DeviceAccount, SignerError> {
        let session = self.session.lock().await;
        let output = await_terminal(session.get_address(path)).await?;
        let account = DeviceAccount::from_public_key(&output.public_key)?;
        if account.address != output.address {
            return Err(SignerError::MalformedResponse(format!(
                "address {:?} does not match public key",
                output.address
            )));
        }
        Ok(account)
    }

    async fn sign_digest(&self, path: &str, digest: &TypedDigest) -> Result<ClassicalSignature, SignerError> {
        let session = self.session.lock().await;
        info!("Requesting EIP-712 signature from Ledger on {}", path);
        let raw = await_terminal(session.sign_eip712_hashed(path, digest.domain_separator, digest.struct_hash)).await?;
        normalize(raw)
    }

    async fn sign_typed_data(
        &self,
        path: &str,
        document: &TypedData,
        digest: &TypedDigest,
    ) -> Result<ClassicalSignature, SignerError> {
        let session = self.session.lock().await;
        info!("Requesting typed-data signature from Ledger on {}", path);
        debug!("document digest {:?}", digest.digest());
        let raw = await_terminal(session.sign_typed_data(path, document)).await?;
        normalize(raw)
    }

    async fn sign_delegation_authorization(
        &self,
        path: &str,
        authorization: &DelegationAuthorization,
    ) -> Result<ClassicalSignature, SignerError> {
        let session = self.session.lock().await;
        info!(
            "Requesting delegation authorization to {:?} from Ledger on {}",
            authorization.delegate, path
        );
        let raw = await_terminal(session.sign_delegation_authorization(
            path,
            authorization.chain_id,
            authorization.delegate,
            authorization.nonce,
        ))
        .await?;
        normalize(raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ethers::types::transaction::eip712::EIP712Domain;
    use futures::stream;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    /// Each request pops the next script; `None` models a device that never answers.
    struct ScriptedSession {
        id: SessionId,
        scripts: std::sync::Mutex<VecDeque<Option<Vec<DeviceActionState<RawSignature>>>>>,
        requests: Arc<AtomicUsize>,
        documents: AtomicUsize,
    }

    impl ScriptedSession {
        fn new(scripts: Vec<Option<Vec<DeviceActionState<RawSignature>>>>) -> Self {
            Self {
                id: SessionId::from("session-1"),
                scripts: std::sync::Mutex::new(scripts.into()),
                requests: Arc::new(AtomicUsize::new(0)),
                documents: AtomicUsize::new(0),
            }
        }

        fn next_script(&self) -> ActionStream<RawSignature> {
            self.requests.fetch_add(1, Ordering::SeqCst);
            match self.scripts.lock().unwrap().pop_front().flatten() {
                Some(states) => stream::iter(states).boxed(),
                None => stream::pending().boxed(),
            }
        }
    }

    impl DeviceSession for ScriptedSession {
        fn session_id(&self) -> &SessionId {
            &self.id
        }

        fn get_address(&self, _path: &str) -> ActionStream<AddressOutput> {
            let mut public_key = vec![0x04];
            public_key.extend_from_slice(&[7u8; 64]);
            let account = DeviceAccount::from_public_key(&public_key).unwrap();
            stream::iter(vec![
                DeviceActionState::Pending,
                DeviceActionState::Completed(AddressOutput {
                    address: account.address,
                    public_key: account.public_key,
                }),
            ])
            .boxed()
        }

        fn sign_eip712_hashed(&self, _path: &str, _domain: H256, _message: H256) -> ActionStream<RawSignature> {
            self.next_script()
        }

        fn sign_typed_data(&self, _path: &str, _document: &TypedData) -> ActionStream<RawSignature> {
            self.documents.fetch_add(1, Ordering::SeqCst);
            self.next_script()
        }

        fn sign_delegation_authorization(
            &self,
            _path: &str,
            _chain_id: u64,
            _delegate: Address,
            _nonce: u64,
        ) -> ActionStream<RawSignature> {
            self.next_script()
        }
    }

    const PATH: &str = "44'/60'/0'/0'/0";

    fn digest() -> TypedDigest {
        TypedDigest {
            domain_separator: H256::repeat_byte(1),
            struct_hash: H256::repeat_byte(2),
        }
    }

    fn completed(v: u64) -> DeviceActionState<RawSignature> {
        DeviceActionState::Completed(RawSignature {
            v,
            r: H256::repeat_byte(3),
            s: H256::repeat_byte(4),
        })
    }

    #[tokio::test]
    async fn waits_through_pending_states_and_normalizes_v() {
        let signer = LedgerSigner::new(ScriptedSession::new(vec![Some(vec![
            DeviceActionState::Pending,
            DeviceActionState::Pending,
            completed(28),
        ])]));

        let sig = signer.sign_digest(PATH, &digest()).await.unwrap();
        assert_eq!(sig.y_parity, 1);
        assert_eq!(sig.r, H256::repeat_byte(3));
    }

    #[tokio::test]
    async fn device_error_is_surfaced() {
        let signer = LedgerSigner::new(ScriptedSession::new(vec![Some(vec![
            DeviceActionState::Pending,
            DeviceActionState::Error(DeviceError::new("6985", "rejected by user")),
        ])]));

        let authorization = DelegationAuthorization {
            delegate: Address::repeat_byte(9),
            chain_id: 1,
            nonce: 0,
        };
        let err = signer
            .sign_delegation_authorization(PATH, &authorization)
            .await
            .unwrap_err();
        assert_eq!(err, SignerError::Device(DeviceError::new("6985", "rejected by user")));
    }

    #[tokio::test]
    async fn stream_ending_early_is_an_interruption() {
        let signer = LedgerSigner::new(ScriptedSession::new(vec![Some(vec![DeviceActionState::Pending])]));
        let err = signer.sign_digest(PATH, &digest()).await.unwrap_err();
        assert_eq!(err, SignerError::Interrupted);
    }

    #[tokio::test]
    async fn abandoned_request_releases_the_session() {
        let session = ScriptedSession::new(vec![None, Some(vec![completed(0)])]);
        let requests = session.requests.clone();
        let signer = LedgerSigner::new(session);

        // The device never answers; the caller gives up.
        let abandoned = tokio::time::timeout(Duration::from_millis(20), signer.sign_digest(PATH, &digest())).await;
        assert!(abandoned.is_err());

        let sig = signer.sign_digest(PATH, &digest()).await.unwrap();
        assert_eq!(sig.y_parity, 0);
        assert_eq!(requests.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn malformed_recovery_id_is_rejected() {
        let signer = LedgerSigner::new(ScriptedSession::new(vec![Some(vec![completed(7)])]));
        let err = signer.sign_digest(PATH, &digest()).await.unwrap_err();
        assert!(matches!(err, SignerError::MalformedResponse(_)));
    }

    #[tokio::test]
    async fn typed_data_goes_to_the_device_whole() {
        let session = ScriptedSession::new(vec![Some(vec![DeviceActionState::Pending, completed(27)])]);
        let signer = LedgerSigner::new(session);
        let document = TypedData {
            domain: EIP712Domain {
                name: Some("ERC4337".to_string()),
                version: Some("1".to_string()),
                chain_id: None,
                verifying_contract: None,
                salt: None,
            },
            types: Default::default(),
            primary_type: "PackedUserOperation".to_string(),
            message: Default::default(),
        };

        let sig = signer.sign_typed_data(PATH, &document, &digest()).await.unwrap();

        assert_eq!(sig.y_parity, 0);
        assert_eq!(signer.session.lock().await.documents.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn device_account_checks_reported_address() {
        let signer = LedgerSigner::new(ScriptedSession::new(vec![]));
        let account = signer.device_account(PATH).await.unwrap();
        assert_eq!(account.public_key.len(), 65);
        assert_eq!(signer.session_id().await, SessionId::from("session-1"));
    }
}
