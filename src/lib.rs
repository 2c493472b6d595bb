// src/lib.rs
//! Hybrid classical / post-quantum signing for EIP-7702 delegated accounts
//! submitting sponsored ERC-4337 user operations.

pub mod authorization;
pub mod bundler;
pub mod chain;
pub mod codec;
pub mod composer;
pub mod config;
pub mod delegation;
pub mod error;
pub mod falcon;
pub mod handoff;
pub mod pipeline;
pub mod signer;
pub mod types;
pub mod user_op;

pub use error::{PipelineError, ValidationError};
pub use pipeline::{SubmissionPipeline, SubmissionReceipt, SubmitOutcome, TransferRequest};
