// src/types.rs
use ethers::types::{Address, Bytes, H160, H256, U256, U64};
use ethers::utils::{keccak256, rlp::RlpStream};
use hex_literal::hex;
use serde::{Deserialize, Serialize};

/// `factory` value telling the EntryPoint that the sender is an EIP-7702 account.
pub const EIP7702_FACTORY_MARKER: Address = H160(hex!("7702000000000000000000000000000000000000"));

/// EIP-7702 authorization signing magic.
pub const AUTHORIZATION_MAGIC: u8 = 0x05;

/// Chain view of an externally owned account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub address: Address,
    pub code: Bytes,
    pub balance: U256,
    pub nonce: U256,
}

/// ECDSA signature with its recovery id as a bare parity bit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassicalSignature {
    pub r: H256,
    pub s: H256,
    pub y_parity: u8,
}

impl ClassicalSignature {
    /// Accepts any of the recovery-id spellings devices produce: `0/1`, `27/28`
    /// or an EIP-155 `v`.
    pub fn from_rsv(r: H256, s: H256, v: u64) -> Option<Self> {
        let y_parity = match v {
            0 | 1 => v,
            27 | 28 => v - 27,
            v if v >= 35 => (v - 35) % 2,
            _ => return None,
        };
        Some(Self {
            r,
            s,
            y_parity: y_parity as u8,
        })
    }

    /// Parses the 65-byte `r ‖ s ‖ v` form.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != 65 {
            return None;
        }
        Self::from_rsv(
            H256::from_slice(&bytes[..32]),
            H256::from_slice(&bytes[32..64]),
            u64::from(bytes[64]),
        )
    }

    /// Legacy `v` (27 or 28).
    pub fn v(&self) -> u8 {
        27 + self.y_parity
    }

    pub fn to_bytes(&self) -> [u8; 65] {
        let mut out = [0u8; 65];
        out[..32].copy_from_slice(self.r.as_bytes());
        out[32..64].copy_from_slice(self.s.as_bytes());
        out[64] = self.v();
        out
    }
}

/// Unsigned EIP-7702 authorization tuple.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DelegationAuthorization {
    pub delegate: Address,
    pub chain_id: u64,
    pub nonce: u64,
}

impl DelegationAuthorization {
    /// `keccak256(0x05 ‖ rlp([chain_id, address, nonce]))`
    pub fn signing_hash(&self) -> H256 {
        let mut stream = RlpStream::new_list(3);
        stream.append(&self.chain_id);
        stream.append(&self.delegate);
        stream.append(&self.nonce);
        let mut preimage = vec![AUTHORIZATION_MAGIC];
        preimage.extend_from_slice(&stream.out());
        H256(keccak256(preimage))
    }

    /// Attaches a signature. The tuple cannot change afterwards.
    pub fn into_signed(self, signature: ClassicalSignature) -> SignedAuthorization {
        SignedAuthorization {
            authorization: self,
            signature,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SignedAuthorization {
    authorization: DelegationAuthorization,
    signature: ClassicalSignature,
}

impl SignedAuthorization {
    pub fn authorization(&self) -> &DelegationAuthorization {
        &self.authorization
    }

    pub fn signature(&self) -> &ClassicalSignature {
        &self.signature
    }

    pub fn to_rpc(&self) -> RpcAuthorization {
        RpcAuthorization {
            chain_id: U64::from(self.authorization.chain_id),
            address: self.authorization.delegate,
            nonce: U64::from(self.authorization.nonce),
            y_parity: U64::from(self.signature.y_parity),
            r: self.signature.r,
            s: self.signature.s,
        }
    }
}

/// Delegation install payload carried by a user operation from a not-yet-delegated account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DelegationInit {
    pub factory_data: Bytes,
    pub authorization: SignedAuthorization,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Call {
    pub to: Address,
    pub value: U256,
    pub data: Bytes,
}

impl Call {
    pub fn transfer(to: Address, value: U256) -> Self {
        Self {
            to,
            value,
            data: Bytes::default(),
        }
    }
}

/// Gas limits sized for checking two or three signatures during validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GasLimits {
    pub verification_gas_limit: U256,
    pub pre_verification_gas: U256,
    pub paymaster_verification_gas_limit: U256,
}

impl Default for GasLimits {
    fn default() -> Self {
        Self {
            verification_gas_limit: U256::from(9_000_000u64),
            pre_verification_gas: U256::from(5_000_000u64),
            paymaster_verification_gas_limit: U256::from(9_000_000u64),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GasFees {
    pub max_fee_per_gas: U256,
    pub max_priority_fee_per_gas: U256,
}

/// Opaque context forwarded to the paymaster when asking for sponsorship.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymasterContext {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sponsorship_policy_id: Option<String>,
}

/// Paymaster answer to a sponsorship request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Sponsorship {
    pub paymaster: Address,
    #[serde(default)]
    pub paymaster_data: Bytes,
    #[serde(default)]
    pub paymaster_verification_gas_limit: U256,
    #[serde(default)]
    pub paymaster_post_op_gas_limit: U256,
    #[serde(default)]
    pub call_gas_limit: U256,
    #[serde(default)]
    pub verification_gas_limit: U256,
    #[serde(default)]
    pub pre_verification_gas: U256,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymasterFields {
    pub paymaster: Address,
    pub verification_gas_limit: U256,
    pub post_op_gas_limit: U256,
    pub data: Bytes,
}

/// Sponsored transaction request for EntryPoint v0.8.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserOperation {
    pub sender: Address,
    pub nonce: U256,
    pub calls: Vec<Call>,
    pub call_data: Bytes,
    /// Present iff the account is not yet delegated.
    pub init: Option<DelegationInit>,
    pub call_gas_limit: U256,
    pub verification_gas_limit: U256,
    pub pre_verification_gas: U256,
    pub fees: GasFees,
    pub paymaster: Option<PaymasterFields>,
    pub paymaster_context: PaymasterContext,
    pub signature: Option<Bytes>,
}

impl UserOperation {
    pub fn factory(&self) -> Option<Address> {
        self.init.as_ref().map(|_| EIP7702_FACTORY_MARKER)
    }

    pub fn factory_data(&self) -> Option<&Bytes> {
        self.init.as_ref().map(|init| &init.factory_data)
    }

    pub fn authorization(&self) -> Option<&SignedAuthorization> {
        self.init.as_ref().map(|init| &init.authorization)
    }

    pub fn with_signature(mut self, signature: Bytes) -> Self {
        self.signature = Some(signature);
        self
    }

    /// Wire form. An unsigned operation is sent with `stub` in the signature slot.
    pub fn to_rpc(&self, stub: &Bytes) -> RpcUserOperation {
        RpcUserOperation {
            sender: self.sender,
            nonce: self.nonce,
            factory: self.factory(),
            factory_data: self.factory_data().cloned(),
            call_data: self.call_data.clone(),
            call_gas_limit: self.call_gas_limit,
            verification_gas_limit: self.verification_gas_limit,
            pre_verification_gas: self.pre_verification_gas,
            max_fee_per_gas: self.fees.max_fee_per_gas,
            max_priority_fee_per_gas: self.fees.max_priority_fee_per_gas,
            paymaster: self.paymaster.as_ref().map(|p| p.paymaster),
            paymaster_verification_gas_limit: self.paymaster.as_ref().map(|p| p.verification_gas_limit),
            paymaster_post_op_gas_limit: self.paymaster.as_ref().map(|p| p.post_op_gas_limit),
            paymaster_data: self.paymaster.as_ref().map(|p| p.data.clone()),
            signature: self.signature.clone().unwrap_or_else(|| stub.clone()),
            eip7702_auth: self.authorization().map(SignedAuthorization::to_rpc),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcAuthorization {
    pub chain_id: U64,
    pub address: Address,
    pub nonce: U64,
    pub y_parity: U64,
    pub r: H256,
    pub s: H256,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcUserOperation {
    pub sender: Address,
    pub nonce: U256,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub factory: Option<Address>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub factory_data: Option<Bytes>,
    pub call_data: Bytes,
    pub call_gas_limit: U256,
    pub verification_gas_limit: U256,
    pub pre_verification_gas: U256,
    pub max_fee_per_gas: U256,
    pub max_priority_fee_per_gas: U256,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub paymaster: Option<Address>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub paymaster_verification_gas_limit: Option<U256>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub paymaster_post_op_gas_limit: Option<U256>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub paymaster_data: Option<Bytes>,
    pub signature: Bytes,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub eip7702_auth: Option<RpcAuthorization>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionReceiptRef {
    pub transaction_hash: H256,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserOperationReceipt {
    pub user_op_hash: H256,
    #[serde(default)]
    pub success: bool,
    pub receipt: TransactionReceiptRef,
}
