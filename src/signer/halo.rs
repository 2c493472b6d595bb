// src/signer/halo.rs
//! Tap-card (NFC) signer.
//!
//! The card speaks a small JSON command protocol: one command per tap, one
//! response. It only ever signs raw 32-byte digests with a numbered key slot.

use std::collections::HashMap;

use async_trait::async_trait;
use ethers::signers::LocalWallet;
use ethers::types::H256;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info};

use super::{ClassicalSigner, DeviceAccount, DeviceError, SignerBackend, SignerError, TypedDigest};
use crate::codec::{decode_hex, encode_hex, encode_hex_bare, h256_from_hex};
use crate::types::{ClassicalSignature, DelegationAuthorization};

pub const DEFAULT_KEY_SLOT: u8 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "name", rename_all = "snake_case")]
pub enum CardCommand {
    GetPkeys,
    Sign {
        #[serde(rename = "keyNo")]
        key_no: u8,
        /// Bare hex, no `0x`.
        digest: String,
    },
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PkeysResponse {
    public_keys: HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct SignResponse {
    signature: CardSignature,
}

#[derive(Debug, Deserialize)]
struct CardSignature {
    /// `0x ‖ r ‖ s ‖ v` with `v` in 27/28 form.
    ether: String,
}

/// One request/response exchange with the card.
#[async_trait]
pub trait CardTransport: Send + Sync {
    async fn exec(&self, command: &CardCommand) -> Result<Value, DeviceError>;
}

pub struct HaloSigner<T> {
    transport: T,
    key_slot: u8,
}

impl<T: CardTransport> HaloSigner<T> {
    pub fn new(transport: T) -> Self {
        Self::with_key_slot(transport, DEFAULT_KEY_SLOT)
    }

    pub fn with_key_slot(transport: T, key_slot: u8) -> Self {
        Self { transport, key_slot }
    }

    async fn sign_hash(&self, hash: H256) -> Result<ClassicalSignature, SignerError> {
        let command = CardCommand::Sign {
            key_no: self.key_slot,
            digest: encode_hex_bare(hash),
        };
        let response: SignResponse = serde_json::from_value(self.transport.exec(&command).await?)
            .map_err(|e| SignerError::MalformedResponse(e.to_string()))?;
        let bytes = decode_hex(&response.signature.ether)
            .map_err(|e| SignerError::MalformedResponse(e.to_string()))?;
        ClassicalSignature::from_bytes(&bytes)
            .ok_or_else(|| SignerError::MalformedResponse(format!("signature of {} bytes", bytes.len())))
    }
}

#[async_trait]
impl<T: CardTransport> ClassicalSigner for HaloSigner<T> {
    fn backend(&self) -> SignerBackend {
        SignerBackend::Halo
    }

    async fn device_account(&self, _path: &str) -> Result<DeviceAccount, SignerError> {
        let response: PkeysResponse = serde_json::from_value(self.transport.exec(&CardCommand::GetPkeys).await?)
            .map_err(|e| SignerError::MalformedResponse(e.to_string()))?;
        let key = response
            .public_keys
            .get(&self.key_slot.to_string())
            .ok_or_else(|| SignerError::MalformedResponse(format!("no public key in slot {}", self.key_slot)))?;
        let bytes = decode_hex(key).map_err(|e| SignerError::MalformedResponse(e.to_string()))?;
        DeviceAccount::from_public_key(&bytes)
    }

    async fn sign_digest(&self, _path: &str, digest: &TypedDigest) -> Result<ClassicalSignature, SignerError> {
        let hash = digest.digest();
        info!("Tap card to sign digest {:?}", hash);
        self.sign_hash(hash).await
    }

    async fn sign_delegation_authorization(
        &self,
        _path: &str,
        authorization: &DelegationAuthorization,
    ) -> Result<ClassicalSignature, SignerError> {
        let hash = authorization.signing_hash();
        info!(
            "Tap card to authorize delegation to {:?} (hash {:?})",
            authorization.delegate, hash
        );
        self.sign_hash(hash).await
    }
}

/// Software stand-in for a card, answering the same commands from a local key.
pub struct SoftCard {
    wallet: LocalWallet,
}

impl SoftCard {
    pub fn new(wallet: LocalWallet) -> Self {
        Self { wallet }
    }

    fn public_key_hex(&self) -> String {
        let point = self.wallet.signer().verifying_key().to_encoded_point(false);
        encode_hex_bare(point.as_bytes())
    }
}

#[async_trait]
impl CardTransport for SoftCard {
    async fn exec(&self, command: &CardCommand) -> Result<Value, DeviceError> {
        debug!("soft card command {:?}", command);
        match command {
            CardCommand::GetPkeys => Ok(json!({
                "publicKeys": { DEFAULT_KEY_SLOT.to_string(): self.public_key_hex() }
            })),
            CardCommand::Sign { key_no, digest } if *key_no == DEFAULT_KEY_SLOT => {
                let hash = h256_from_hex(digest).map_err(|e| DeviceError::new("ERROR_CODE_INVALID_DIGEST", e.to_string()))?;
                let signature = self
                    .wallet
                    .sign_hash(hash)
                    .map_err(|e| DeviceError::new("ERROR_CODE_SIGN_FAILED", e.to_string()))?;
                Ok(json!({
                    "signature": { "ether": encode_hex(signature.to_vec()) }
                }))
            }
            CardCommand::Sign { key_no, .. } => Err(DeviceError::new(
                "ERROR_CODE_INVALID_KEY_NO",
                format!("key slot {} is not provisioned", key_no),
            )),
        }
    }
}
