// src/composer.rs
//! Serializes signature bundles into the single blob the delegate verifies.
//!
//! Standard delegate: `abi.encode(uint8 v, bytes32 r, bytes32 s, bytes pq)`.
//! ZK delegate: `abi.encode(bytes proof, int256[] publicInputs, bytes pq)`.

use ethers::abi::{decode, encode, ParamType, Token};
use ethers::types::{Bytes, I256, H256, U256};
use thiserror::Error;

use crate::config::Mode;
use crate::falcon::SIGNATURE_MAX_LEN;
use crate::types::ClassicalSignature;

const STUB_PROOF_LEN: usize = 256;
const STUB_PUBLIC_INPUTS: usize = 2;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignatureBundle {
    Classical(ClassicalSignature),
    HybridClassicalPq {
        classical: ClassicalSignature,
        pq: Bytes,
    },
    ZkBundle {
        proof: Bytes,
        public_inputs: Vec<I256>,
        pq: Bytes,
    },
}

impl SignatureBundle {
    fn kind(&self) -> &'static str {
        match self {
            SignatureBundle::Classical(_) => "classical",
            SignatureBundle::HybridClassicalPq { .. } => "hybrid",
            SignatureBundle::ZkBundle { .. } => "zk",
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ComposeError {
    #[error("A {bundle} bundle cannot be composed for {mode} mode")]
    IncompatibleBundle { bundle: &'static str, mode: Mode },

    #[error("Bundle field '{0}' is empty")]
    MissingField(&'static str),

    #[error("Malformed signature blob: {0}")]
    Malformed(String),
}

/// Encodes the one bundle variant valid for `mode`.
pub fn compose(bundle: &SignatureBundle, mode: Mode) -> Result<Bytes, ComposeError> {
    let tokens = match (mode, bundle) {
        (Mode::Standard, SignatureBundle::HybridClassicalPq { classical, pq }) => {
            if pq.is_empty() {
                return Err(ComposeError::MissingField("pq"));
            }
            vec![
                Token::Uint(U256::from(classical.v())),
                Token::FixedBytes(classical.r.as_bytes().to_vec()),
                Token::FixedBytes(classical.s.as_bytes().to_vec()),
                Token::Bytes(pq.to_vec()),
            ]
        }
        (Mode::Zk, SignatureBundle::ZkBundle { proof, public_inputs, pq }) => {
            if proof.is_empty() {
                return Err(ComposeError::MissingField("proof"));
            }
            if pq.is_empty() {
                return Err(ComposeError::MissingField("pq"));
            }
            vec![
                Token::Bytes(proof.to_vec()),
                Token::Array(public_inputs.iter().map(|i| Token::Int(i.into_raw())).collect()),
                Token::Bytes(pq.to_vec()),
            ]
        }
        (mode, bundle) => {
            return Err(ComposeError::IncompatibleBundle {
                bundle: bundle.kind(),
                mode,
            })
        }
    };
    Ok(Bytes::from(encode(&tokens)))
}

/// Blob of the right shape and size for sponsorship and gas simulation.
pub fn stub_signature(mode: Mode) -> Bytes {
    let pq = Bytes::from(vec![0xff; SIGNATURE_MAX_LEN + 32]);
    let bundle = match mode {
        Mode::Standard => SignatureBundle::HybridClassicalPq {
            classical: ClassicalSignature {
                r: H256::repeat_byte(0xff),
                s: H256::repeat_byte(0x7f),
                y_parity: 0,
            },
            pq,
        },
        Mode::Zk => SignatureBundle::ZkBundle {
            proof: Bytes::from(vec![0xff; STUB_PROOF_LEN]),
            public_inputs: vec![I256::MAX; STUB_PUBLIC_INPUTS],
            pq,
        },
    };
    // Both arms pair the bundle with its own mode.
    compose(&bundle, mode).unwrap_or_default()
}

fn malformed(e: impl ToString) -> ComposeError {
    ComposeError::Malformed(e.to_string())
}

pub fn decode_standard(blob: &[u8]) -> Result<SignatureBundle, ComposeError> {
    let tokens = decode(
        &[
            ParamType::Uint(8),
            ParamType::FixedBytes(32),
            ParamType::FixedBytes(32),
            ParamType::Bytes,
        ],
        blob,
    )
    .map_err(malformed)?;

    match tokens.as_slice() {
        [Token::Uint(v), Token::FixedBytes(r), Token::FixedBytes(s), Token::Bytes(pq)] => {
            if *v > U256::from(u8::MAX) {
                return Err(malformed(format!("recovery id v={}", v)));
            }
            let classical = ClassicalSignature::from_rsv(H256::from_slice(r), H256::from_slice(s), v.low_u64())
                .ok_or_else(|| malformed(format!("recovery id v={}", v)))?;
            Ok(SignatureBundle::HybridClassicalPq {
                classical,
                pq: Bytes::from(pq.clone()),
            })
        }
        _ => Err(malformed("unexpected token layout")),
    }
}

pub fn decode_zk(blob: &[u8]) -> Result<SignatureBundle, ComposeError> {
    let tokens = decode(
        &[
            ParamType::Bytes,
            ParamType::Array(Box::new(ParamType::Int(256))),
            ParamType::Bytes,
        ],
        blob,
    )
    .map_err(malformed)?;

    match tokens.as_slice() {
        [Token::Bytes(proof), Token::Array(inputs), Token::Bytes(pq)] => {
            let public_inputs = inputs
                .iter()
                .map(|token| match token {
                    Token::Int(raw) => Ok(I256::from_raw(*raw)),
                    other => Err(malformed(format!("public input {:?}", other))),
                })
                .collect::<Result<Vec<_>, _>>()?;
            Ok(SignatureBundle::ZkBundle {
                proof: Bytes::from(proof.clone()),
                public_inputs,
                pq: Bytes::from(pq.clone()),
            })
        }
        _ => Err(malformed("unexpected token layout")),
    }
}
