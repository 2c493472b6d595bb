// src/codec.rs
//! Canonical hex and byte conversions shared by the signers, builders and packets.

use ethers::types::{H256, U256};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CodecError {
    #[error("Invalid hex: {0}")]
    InvalidHex(#[from] hex::FromHexError),

    #[error("Invalid length: expected {expected} bytes, got {actual}")]
    InvalidLength { expected: usize, actual: usize },
}

pub fn strip_0x(value: &str) -> &str {
    value
        .strip_prefix("0x")
        .or_else(|| value.strip_prefix("0X"))
        .unwrap_or(value)
}

/// Decodes hex with or without a `0x` prefix.
pub fn decode_hex(value: &str) -> Result<Vec<u8>, CodecError> {
    Ok(hex::decode(strip_0x(value.trim()))?)
}

/// `0x`-prefixed lowercase hex.
pub fn encode_hex(bytes: impl AsRef<[u8]>) -> String {
    format!("0x{}", hex::encode(bytes))
}

/// Lowercase hex without prefix, as exchanged with the proof generator and the tap-card.
pub fn encode_hex_bare(bytes: impl AsRef<[u8]>) -> String {
    hex::encode(bytes)
}

pub fn decode_fixed<const N: usize>(value: &str) -> Result<[u8; N], CodecError> {
    let bytes = decode_hex(value)?;
    bytes
        .as_slice()
        .try_into()
        .map_err(|_| CodecError::InvalidLength {
            expected: N,
            actual: bytes.len(),
        })
}

pub fn h256_from_hex(value: &str) -> Result<H256, CodecError> {
    decode_fixed::<32>(value).map(H256)
}

/// Low 128 bits of `value`, big-endian.
pub fn u128_be(value: U256) -> [u8; 16] {
    value.low_u128().to_be_bytes()
}

/// Packs two 128-bit quantities into one 32-byte word: `high ‖ low`.
pub fn pack_u128_pair(high: U256, low: U256) -> [u8; 32] {
    let mut word = [0u8; 32];
    word[..16].copy_from_slice(&u128_be(high));
    word[16..].copy_from_slice(&u128_be(low));
    word
}
