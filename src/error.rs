// src/error.rs
use ethers::types::H256;
use thiserror::Error;

use crate::bundler::BundlerError;
use crate::chain::ChainReadError;
use crate::composer::ComposeError;
use crate::falcon::PqError;
use crate::handoff::{InvalidTransition, ProofFormatError};
use crate::signer::SignerError;

/// Bad request input. Raised before any signer is touched.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Invalid destination address: {0}")]
    InvalidDestination(String),

    #[error("Invalid amount: {0}")]
    InvalidAmount(String),

    #[error("Amount {amount} exceeds balance {balance}")]
    AmountExceedsBalance { amount: String, balance: String },

    #[error("Invalid public-key commitment: {0}")]
    InvalidCommitment(String),

    #[error("A public-key commitment is required to install the zk delegate")]
    MissingCommitment,

    #[error("A zk operation is awaiting its proof; finalize or reset it first")]
    PendingZkOperation,

    #[error("A proof was supplied but no operation is awaiting one")]
    ProofWithoutPendingOperation,
}

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Signer error: {0}")]
    Signer(#[from] SignerError),

    #[error("Post-quantum signing failed: {0}")]
    PqSignFailure(#[from] PqError),

    #[error("Chain read error: {0}")]
    ChainRead(#[from] ChainReadError),

    #[error("Bundler error: {0}")]
    Bundler(#[from] BundlerError),

    #[error("User operation {user_op_hash:?} was sent but not confirmed: {source}")]
    Unconfirmed {
        user_op_hash: H256,
        #[source]
        source: BundlerError,
    },

    #[error("Proof format error: {0}")]
    ProofFormat(#[from] ProofFormatError),

    #[error("Signature composition error: {0}")]
    Composition(#[from] ComposeError),

    #[error("Invalid state transition: {0}")]
    InvalidTransition(#[from] InvalidTransition),
}

impl PipelineError {
    /// Failures after which the same request may simply be tried again.
    /// An unconfirmed operation is not one of them: it may still be mined.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            PipelineError::Validation(_)
                | PipelineError::Composition(_)
                | PipelineError::InvalidTransition(_)
                | PipelineError::Unconfirmed { .. }
        )
    }

    /// Hash of an operation the bundler accepted before the failure.
    pub fn user_op_hash(&self) -> Option<H256> {
        match self {
            PipelineError::Unconfirmed { user_op_hash, .. } => Some(*user_op_hash),
            _ => None,
        }
    }
}
