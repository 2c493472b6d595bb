// src/user_op.rs
//! User-operation assembly and the EntryPoint v0.8 signing digest.

use std::collections::BTreeMap;

use ethers::abi::{encode, Token};
use ethers::types::transaction::eip712::{EIP712Domain, Eip712DomainType, TypedData};
use ethers::types::{Address, Bytes, H256, U256};
use ethers::utils::{id, keccak256};
use serde_json::json;
use tracing::{debug, info};

use crate::bundler::{Bundler, BundlerError};
use crate::codec::{encode_hex, pack_u128_pair, u128_be};
use crate::signer::TypedDigest;
use crate::types::{Call, DelegationInit, GasLimits, PaymasterContext, PaymasterFields, UserOperation};

const EIP712_DOMAIN_TYPE: &str =
    "EIP712Domain(string name,string version,uint256 chainId,address verifyingContract)";
const PACKED_USER_OPERATION_TYPE: &str = "PackedUserOperation(address sender,uint256 nonce,bytes initCode,bytes callData,bytes32 accountGasLimits,uint256 preVerificationGas,bytes32 gasFees,bytes paymasterAndData)";
const PRIMARY_TYPE: &str = "PackedUserOperation";
const DOMAIN_NAME: &str = "ERC4337";
const DOMAIN_VERSION: &str = "1";

const EXECUTE: &str = "execute(address,uint256,bytes)";
const EXECUTE_BATCH: &str = "executeBatch((address,uint256,bytes)[])";

/// Calldata for the delegated account: `execute` for one call, `executeBatch` otherwise.
pub fn encode_calls(calls: &[Call]) -> Bytes {
    let (signature, tokens) = match calls {
        [call] => (
            EXECUTE,
            vec![
                Token::Address(call.to),
                Token::Uint(call.value),
                Token::Bytes(call.data.to_vec()),
            ],
        ),
        calls => (
            EXECUTE_BATCH,
            vec![Token::Array(
                calls
                    .iter()
                    .map(|c| {
                        Token::Tuple(vec![
                            Token::Address(c.to),
                            Token::Uint(c.value),
                            Token::Bytes(c.data.to_vec()),
                        ])
                    })
                    .collect(),
            )],
        ),
    };
    let mut calldata = id(signature).to_vec();
    calldata.extend(encode(&tokens));
    Bytes::from(calldata)
}

/// The on-chain packed form the EntryPoint hashes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackedUserOperation {
    pub sender: Address,
    pub nonce: U256,
    pub init_code: Bytes,
    pub call_data: Bytes,
    pub account_gas_limits: [u8; 32],
    pub pre_verification_gas: U256,
    pub gas_fees: [u8; 32],
    pub paymaster_and_data: Bytes,
}

impl PackedUserOperation {
    pub fn from_user_operation(op: &UserOperation) -> Self {
        // For a 7702 account the EntryPoint hashes the delegate in place of the factory marker.
        let init_code = match &op.init {
            Some(init) => {
                let mut code = init.authorization.authorization().delegate.as_bytes().to_vec();
                code.extend_from_slice(&init.factory_data);
                Bytes::from(code)
            }
            None => Bytes::default(),
        };

        let paymaster_and_data = match &op.paymaster {
            Some(p) => {
                let mut packed = p.paymaster.as_bytes().to_vec();
                packed.extend_from_slice(&u128_be(p.verification_gas_limit));
                packed.extend_from_slice(&u128_be(p.post_op_gas_limit));
                packed.extend_from_slice(&p.data);
                Bytes::from(packed)
            }
            None => Bytes::default(),
        };

        Self {
            sender: op.sender,
            nonce: op.nonce,
            init_code,
            call_data: op.call_data.clone(),
            account_gas_limits: pack_u128_pair(op.verification_gas_limit, op.call_gas_limit),
            pre_verification_gas: op.pre_verification_gas,
            gas_fees: pack_u128_pair(op.fees.max_priority_fee_per_gas, op.fees.max_fee_per_gas),
            paymaster_and_data,
        }
    }

    pub fn struct_hash(&self) -> H256 {
        H256(keccak256(encode(&[
            Token::FixedBytes(keccak256(PACKED_USER_OPERATION_TYPE).to_vec()),
            Token::Address(self.sender),
            Token::Uint(self.nonce),
            Token::FixedBytes(keccak256(&self.init_code).to_vec()),
            Token::FixedBytes(keccak256(&self.call_data).to_vec()),
            Token::FixedBytes(self.account_gas_limits.to_vec()),
            Token::Uint(self.pre_verification_gas),
            Token::FixedBytes(self.gas_fees.to_vec()),
            Token::FixedBytes(keccak256(&self.paymaster_and_data).to_vec()),
        ])))
    }
}

pub fn domain_separator(chain_id: u64, entry_point: Address) -> H256 {
    H256(keccak256(encode(&[
        Token::FixedBytes(keccak256(EIP712_DOMAIN_TYPE).to_vec()),
        Token::FixedBytes(keccak256(DOMAIN_NAME).to_vec()),
        Token::FixedBytes(keccak256(DOMAIN_VERSION).to_vec()),
        Token::Uint(U256::from(chain_id)),
        Token::Address(entry_point),
    ])))
}

/// The digest every signature and proof over `op` attests to. The signature
/// field is not part of it.
pub fn typed_digest(op: &UserOperation, chain_id: u64, entry_point: Address) -> TypedDigest {
    TypedDigest {
        domain_separator: domain_separator(chain_id, entry_point),
        struct_hash: PackedUserOperation::from_user_operation(op).struct_hash(),
    }
}

fn fields(list: &[(&str, &str)]) -> Vec<Eip712DomainType> {
    list.iter()
        .map(|(name, ty)| Eip712DomainType {
            name: name.to_string(),
            r#type: ty.to_string(),
        })
        .collect()
}

/// The same digest as a typed-data document, for signers that clear-sign it.
pub fn typed_data(op: &UserOperation, chain_id: u64, entry_point: Address) -> TypedData {
    let packed = PackedUserOperation::from_user_operation(op);

    let mut types = BTreeMap::new();
    types.insert(
        "EIP712Domain".to_string(),
        fields(&[
            ("name", "string"),
            ("version", "string"),
            ("chainId", "uint256"),
            ("verifyingContract", "address"),
        ]),
    );
    types.insert(
        PRIMARY_TYPE.to_string(),
        fields(&[
            ("sender", "address"),
            ("nonce", "uint256"),
            ("initCode", "bytes"),
            ("callData", "bytes"),
            ("accountGasLimits", "bytes32"),
            ("preVerificationGas", "uint256"),
            ("gasFees", "bytes32"),
            ("paymasterAndData", "bytes"),
        ]),
    );

    let mut message = BTreeMap::new();
    message.insert("sender".to_string(), json!(packed.sender));
    message.insert("nonce".to_string(), json!(packed.nonce.to_string()));
    message.insert("initCode".to_string(), json!(encode_hex(&packed.init_code)));
    message.insert("callData".to_string(), json!(encode_hex(&packed.call_data)));
    message.insert("accountGasLimits".to_string(), json!(encode_hex(packed.account_gas_limits)));
    message.insert("preVerificationGas".to_string(), json!(packed.pre_verification_gas.to_string()));
    message.insert("gasFees".to_string(), json!(encode_hex(packed.gas_fees)));
    message.insert("paymasterAndData".to_string(), json!(encode_hex(&packed.paymaster_and_data)));

    TypedData {
        domain: EIP712Domain {
            name: Some(DOMAIN_NAME.to_string()),
            version: Some(DOMAIN_VERSION.to_string()),
            chain_id: Some(U256::from(chain_id)),
            verifying_contract: Some(entry_point),
            salt: None,
        },
        types,
        primary_type: PRIMARY_TYPE.to_string(),
        message,
    }
}

/// Inputs known before the bundler is consulted.
#[derive(Debug, Clone)]
pub struct UserOperationDraft {
    pub sender: Address,
    pub nonce: U256,
    pub calls: Vec<Call>,
    pub init: Option<DelegationInit>,
}

/// A limit the sponsor left out of its answer is the one it was asked to sign.
fn answered_or(answered: U256, requested: U256) -> U256 {
    if answered.is_zero() {
        requested
    } else {
        answered
    }
}

pub struct UserOperationBuilder<'a> {
    entry_point: Address,
    gas: &'a GasLimits,
    paymaster_context: &'a PaymasterContext,
}

impl<'a> UserOperationBuilder<'a> {
    pub fn new(entry_point: Address, gas: &'a GasLimits, paymaster_context: &'a PaymasterContext) -> Self {
        Self {
            entry_point,
            gas,
            paymaster_context,
        }
    }

    /// Prices and sponsors the draft. `stub` fills the signature slot for
    /// simulation and must have the shape of the final blob.
    pub async fn prepare<B: Bundler + ?Sized>(
        &self,
        bundler: &B,
        draft: UserOperationDraft,
        stub: &Bytes,
    ) -> Result<UserOperation, BundlerError> {
        let fees = bundler.estimate_fees().await?;
        debug!("fees: max {} priority {}", fees.max_fee_per_gas, fees.max_priority_fee_per_gas);

        let mut op = UserOperation {
            sender: draft.sender,
            nonce: draft.nonce,
            call_data: encode_calls(&draft.calls),
            calls: draft.calls,
            init: draft.init,
            call_gas_limit: U256::zero(),
            verification_gas_limit: self.gas.verification_gas_limit,
            pre_verification_gas: self.gas.pre_verification_gas,
            fees,
            paymaster: None,
            paymaster_context: self.paymaster_context.clone(),
            signature: None,
        };

        // The request carries the configured limits; the paymaster signs over
        // whatever it answers, so the answer is used as is.
        let mut request = op.to_rpc(stub);
        request.paymaster_verification_gas_limit = Some(self.gas.paymaster_verification_gas_limit);
        let sponsorship = bundler
            .sponsor_user_operation(&request, self.entry_point, self.paymaster_context)
            .await?;
        info!("Sponsored by paymaster {:?}", sponsorship.paymaster);

        op.call_gas_limit = sponsorship.call_gas_limit;
        op.verification_gas_limit = answered_or(sponsorship.verification_gas_limit, op.verification_gas_limit);
        op.pre_verification_gas = answered_or(sponsorship.pre_verification_gas, op.pre_verification_gas);
        op.paymaster = Some(PaymasterFields {
            paymaster: sponsorship.paymaster,
            verification_gas_limit: answered_or(
                sponsorship.paymaster_verification_gas_limit,
                self.gas.paymaster_verification_gas_limit,
            ),
            post_op_gas_limit: sponsorship.paymaster_post_op_gas_limit,
            data: sponsorship.paymaster_data,
        });
        Ok(op)
    }
}
