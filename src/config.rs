// src/config.rs
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use ethers::types::{Address, H160, U256};
use hex_literal::hex;
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use crate::signer::DEFAULT_SIGNING_PATH;
use crate::types::{GasLimits, PaymasterContext};

pub const SEPOLIA_CHAIN_ID: u64 = 11_155_111;

/// EntryPoint v0.8
pub const ENTRY_POINT_V08: Address = H160(hex!("4337084D9E255Ff0702461CF8895CE9E3b5Ff108"));

pub const FALCON_CORE: Address = H160(hex!("13b79503ED87a507551160a9E57FdBf46e6Fa444"));
pub const PQ_PUBLIC_KEY_CONTRACT: Address = H160(hex!("eAb06b810F3ECa9f3D00bad3Fd286A04ab03B3Db"));
pub const FALCON_DELEGATE: Address = H160(hex!("78898a02c0ef4B5Fa1a15929997FDcDA758EE815"));
pub const FALCON_DELEGATE_ZK: Address = H160(hex!("BFF9BBC799a93b344ededE632e5e6c8d5Ef3e7Cb"));
pub const ZK_VERIFIER: Address = H160(hex!("720915F3843C5c72deaa5bb09a73757dd3E7592E"));

/// Falcon-512 with SHAKE hashing, as registered with the core verifier.
pub const FALCON_SHAKE_ALGORITHM_ID: u64 = 0x0216_8401_1013_4321;

/// Which delegate the account runs and which signature blob it verifies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Standard,
    Zk,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::Standard => write!(f, "standard"),
            Mode::Zk => write!(f, "zk"),
        }
    }
}

impl FromStr for Mode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "standard" => Ok(Mode::Standard),
            "zk" => Ok(Mode::Zk),
            other => Err(format!("unknown mode '{}', expected 'standard' or 'zk'", other)),
        }
    }
}

/// Addresses of the on-chain contracts the account delegates to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Deployment {
    pub entry_point: Address,
    pub falcon_core: Address,
    pub pq_public_key: Address,
    pub standard_delegate: Address,
    pub zk_delegate: Address,
    pub zk_verifier: Address,
    pub algorithm_id: U256,
}

impl Deployment {
    pub fn delegate_for(&self, mode: Mode) -> Address {
        match mode {
            Mode::Standard => self.standard_delegate,
            Mode::Zk => self.zk_delegate,
        }
    }
}

impl Default for Deployment {
    fn default() -> Self {
        Self {
            entry_point: ENTRY_POINT_V08,
            falcon_core: FALCON_CORE,
            pq_public_key: PQ_PUBLIC_KEY_CONTRACT,
            standard_delegate: FALCON_DELEGATE,
            zk_delegate: FALCON_DELEGATE_ZK,
            zk_verifier: ZK_VERIFIER,
            algorithm_id: U256::from(FALCON_SHAKE_ALGORITHM_ID),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ReceiptPolling {
    pub interval: Duration,
    pub max_attempts: u32,
}

impl Default for ReceiptPolling {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(2),
            max_attempts: 90,
        }
    }
}

/// Everything the submission pipeline needs besides its collaborators.
#[derive(Clone)]
pub struct PipelineSettings {
    pub chain_id: u64,
    pub deployment: Deployment,
    pub signing_path: String,
    pub pq_seed: Zeroizing<[u8; 32]>,
    pub gas: GasLimits,
    pub paymaster_context: PaymasterContext,
    /// In zk mode, suspend for an external proof instead of submitting directly.
    pub proof_required: bool,
    pub receipt_polling: ReceiptPolling,
}

impl PipelineSettings {
    pub fn new(chain_id: u64, pq_seed: [u8; 32], paymaster_context: PaymasterContext) -> Self {
        Self {
            chain_id,
            deployment: Deployment::default(),
            signing_path: DEFAULT_SIGNING_PATH.to_string(),
            pq_seed: Zeroizing::new(pq_seed),
            gas: GasLimits::default(),
            paymaster_context,
            proof_required: true,
            receipt_polling: ReceiptPolling::default(),
        }
    }
}

impl fmt::Debug for PipelineSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineSettings")
            .field("chain_id", &self.chain_id)
            .field("deployment", &self.deployment)
            .field("signing_path", &self.signing_path)
            .field("pq_seed", &"<redacted>")
            .field("gas", &self.gas)
            .field("paymaster_context", &self.paymaster_context)
            .field("proof_required", &self.proof_required)
            .field("receipt_polling", &self.receipt_polling)
            .finish()
    }
}
