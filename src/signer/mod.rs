// src/signer/mod.rs
//! Classical (secp256k1) signer backends.
//!
//! Both backends normalize their output to [`ClassicalSignature`], which carries
//! the recovery id as a parity bit. Nothing past this boundary sees a raw `v`.

pub mod discovery;
pub mod halo;
pub mod ledger;

use std::fmt;

use async_trait::async_trait;
use ethers::types::transaction::eip712::TypedData;
use ethers::types::{Address, Bytes, H256};
use ethers::utils::keccak256;
use thiserror::Error;

use crate::types::{ClassicalSignature, DelegationAuthorization};

pub const DEFAULT_SIGNING_PATH: &str = "44'/60'/0'/0'/0";

/// Failure reported by a device or its transport.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{code}: {message}")]
pub struct DeviceError {
    pub code: String,
    pub message: String,
}

impl DeviceError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SignerError {
    #[error("Device error: {0}")]
    Device(#[from] DeviceError),

    #[error("Device action ended without a result")]
    Interrupted,

    #[error("Malformed device response: {0}")]
    MalformedResponse(String),

    #[error("No device found")]
    NoDevice,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignerBackend {
    Ledger,
    Halo,
}

impl fmt::Display for SignerBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SignerBackend::Ledger => write!(f, "Ledger"),
            SignerBackend::Halo => write!(f, "HaLo"),
        }
    }
}

/// Address and uncompressed public key (`0x04 ‖ X ‖ Y`) of the device key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceAccount {
    pub address: Address,
    pub public_key: Bytes,
}

impl DeviceAccount {
    /// Derives the address from a 65-byte uncompressed or 64-byte raw public key.
    pub fn from_public_key(public_key: &[u8]) -> Result<Self, SignerError> {
        let raw = match public_key.len() {
            65 if public_key[0] == 0x04 => &public_key[1..],
            64 => public_key,
            len => {
                return Err(SignerError::MalformedResponse(format!(
                    "public key of {} bytes",
                    len
                )))
            }
        };
        let mut uncompressed = Vec::with_capacity(65);
        uncompressed.push(0x04);
        uncompressed.extend_from_slice(raw);

        Ok(Self {
            address: Address::from_slice(&keccak256(raw)[12..]),
            public_key: Bytes::from(uncompressed),
        })
    }

    /// X and Y coordinates of the public key.
    pub fn public_key_coordinates(&self) -> Result<(H256, H256), SignerError> {
        let key = self.public_key.as_ref();
        let raw = match key.len() {
            65 if key[0] == 0x04 => &key[1..],
            64 => key,
            len => {
                return Err(SignerError::MalformedResponse(format!(
                    "public key of {} bytes",
                    len
                )))
            }
        };
        Ok((H256::from_slice(&raw[..32]), H256::from_slice(&raw[32..])))
    }
}

/// EIP-712 digest kept in its two halves, since hardware signers display and
/// sign the domain and message hashes separately.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TypedDigest {
    pub domain_separator: H256,
    pub struct_hash: H256,
}

impl TypedDigest {
    /// `keccak256(0x1901 ‖ domainSeparator ‖ structHash)`
    pub fn digest(&self) -> H256 {
        let mut preimage = Vec::with_capacity(66);
        preimage.extend_from_slice(&[0x19, 0x01]);
        preimage.extend_from_slice(self.domain_separator.as_bytes());
        preimage.extend_from_slice(self.struct_hash.as_bytes());
        H256(keccak256(preimage))
    }
}

/// Capability shared by the hardware-dongle and tap-card signers.
#[async_trait]
pub trait ClassicalSigner: Send + Sync {
    fn backend(&self) -> SignerBackend;

    async fn device_account(&self, path: &str) -> Result<DeviceAccount, SignerError>;

    async fn sign_digest(&self, path: &str, digest: &TypedDigest) -> Result<ClassicalSignature, SignerError>;

    /// Signs a user operation given as a typed-data document hashing to
    /// `digest`. Signers that cannot clear-sign sign the digest.
    async fn sign_typed_data(
        &self,
        path: &str,
        _document: &TypedData,
        digest: &TypedDigest,
    ) -> Result<ClassicalSignature, SignerError> {
        self.sign_digest(path, digest).await
    }

    async fn sign_delegation_authorization(
        &self,
        path: &str,
        authorization: &DelegationAuthorization,
    ) -> Result<ClassicalSignature, SignerError>;
}

/// A signer together with the account it controls, resolved once at connection.
pub struct ConnectedSigner<'a> {
    signer: &'a dyn ClassicalSigner,
    account: DeviceAccount,
}

impl<'a> ConnectedSigner<'a> {
    pub async fn connect(signer: &'a dyn ClassicalSigner, path: &str) -> Result<Self, SignerError> {
        let account = signer.device_account(path).await?;
        tracing::info!("Connected {} signer for {:?}", signer.backend(), account.address);
        Ok(Self { signer, account })
    }

    pub fn new(signer: &'a dyn ClassicalSigner, account: DeviceAccount) -> Self {
        Self { signer, account }
    }

    pub fn signer(&self) -> &'a dyn ClassicalSigner {
        self.signer
    }

    pub fn account(&self) -> &DeviceAccount {
        &self.account
    }
}
