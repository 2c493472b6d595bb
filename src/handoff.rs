// src/handoff.rs
//! Two-phase zk flow: export the proof inputs and suspend, then resume with
//! the externally generated proof.
//!
//! The text packets exchanged with the proof generator are a stable contract:
//!
//! * export: `digest r s publicKeyX publicKeyY`, bare lowercase hex, single spaces
//! * import: `proof [input, input, ...]`, bare or `0x` hex proof followed by a
//!   JSON array of integers (decimal, or `0x` hex strings)

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use ethers::types::{Bytes, H256, I256, U256};
use thiserror::Error;
use tracing::{debug, info};

use crate::codec::{decode_hex, encode_hex_bare, h256_from_hex, CodecError};
use crate::signer::{DeviceAccount, SignerError, TypedDigest};
use crate::types::{ClassicalSignature, UserOperation};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    Idle,
    AwaitingClassicalSig,
    AwaitingExternalProof,
    Finalizing,
    Submitted,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("cannot {event} while {from}")]
pub struct InvalidTransition {
    pub from: Phase,
    pub event: &'static str,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProofFormatError {
    #[error("Empty proof packet")]
    Empty,

    #[error("Expected {expected} fields, got {actual}")]
    FieldCount { expected: usize, actual: usize },

    #[error("Invalid hex field: {0}")]
    Hex(#[from] CodecError),

    #[error("Public inputs must be a JSON array of integers")]
    MissingInputs,

    #[error("Invalid public input '{0}'")]
    InvalidInput(String),
}

/// Data handed to the proof generator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProofExportPacket {
    pub digest: H256,
    pub r: H256,
    pub s: H256,
    pub public_key_x: H256,
    pub public_key_y: H256,
}

impl ProofExportPacket {
    pub fn new(
        digest: H256,
        signature: &ClassicalSignature,
        account: &DeviceAccount,
    ) -> Result<Self, SignerError> {
        let (public_key_x, public_key_y) = account.public_key_coordinates()?;
        Ok(Self {
            digest,
            r: signature.r,
            s: signature.s,
            public_key_x,
            public_key_y,
        })
    }
}

impl fmt::Display for ProofExportPacket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {} {} {}",
            encode_hex_bare(self.digest),
            encode_hex_bare(self.r),
            encode_hex_bare(self.s),
            encode_hex_bare(self.public_key_x),
            encode_hex_bare(self.public_key_y)
        )
    }
}

impl FromStr for ProofExportPacket {
    type Err = ProofFormatError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let fields: Vec<&str> = s.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(ProofFormatError::FieldCount {
                expected: 5,
                actual: fields.len(),
            });
        }
        Ok(Self {
            digest: h256_from_hex(fields[0])?,
            r: h256_from_hex(fields[1])?,
            s: h256_from_hex(fields[2])?,
            public_key_x: h256_from_hex(fields[3])?,
            public_key_y: h256_from_hex(fields[4])?,
        })
    }
}

/// Data returned by the proof generator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProofImportPacket {
    pub proof: Bytes,
    pub public_inputs: Vec<I256>,
}

fn parse_input(raw: &str) -> Result<I256, ProofFormatError> {
    let value = raw.trim().trim_matches('"');
    let invalid = || ProofFormatError::InvalidInput(raw.trim().to_string());
    if let Some(hex) = value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")) {
        U256::from_str_radix(hex, 16).map(I256::from_raw).map_err(|_| invalid())
    } else {
        I256::from_dec_str(value).map_err(|_| invalid())
    }
}

impl FromStr for ProofImportPacket {
    type Err = ProofFormatError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(ProofFormatError::Empty);
        }
        let (proof, inputs) = s.split_once(char::is_whitespace).ok_or(ProofFormatError::MissingInputs)?;

        let proof = decode_hex(proof)?;
        if proof.is_empty() {
            return Err(ProofFormatError::Empty);
        }

        let body = inputs
            .trim()
            .strip_prefix('[')
            .and_then(|rest| rest.strip_suffix(']'))
            .ok_or(ProofFormatError::MissingInputs)?;
        let public_inputs = if body.trim().is_empty() {
            Vec::new()
        } else {
            body.split(',').map(parse_input).collect::<Result<Vec<_>, _>>()?
        };

        Ok(Self {
            proof: Bytes::from(proof),
            public_inputs,
        })
    }
}

impl fmt::Display for ProofImportPacket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inputs: Vec<String> = self.public_inputs.iter().map(|i| i.to_string()).collect();
        write!(f, "{} [{}]", encode_hex_bare(&self.proof), inputs.join(","))
    }
}

/// A suspended zk operation: everything finalization needs, captured at export.
pub struct PendingOperationHandle<B: ?Sized> {
    pub user_operation: UserOperation,
    pub bundler: Arc<B>,
    pub digest: TypedDigest,
    pub export: ProofExportPacket,
}

impl<B: ?Sized> fmt::Debug for PendingOperationHandle<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingOperationHandle")
            .field("sender", &self.user_operation.sender)
            .field("nonce", &self.user_operation.nonce)
            .field("digest", &self.digest.digest())
            .finish()
    }
}

/// What lets the machine enter [`Phase::Finalizing`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinalizeTrigger {
    /// A classical signature was just obtained and no proof is required.
    FreshSignature,
    /// A proof was imported for the retained pending operation.
    ImportedProof,
}

pub struct HandoffMachine<B: ?Sized> {
    phase: Phase,
    pending: Option<PendingOperationHandle<B>>,
}

impl<B: ?Sized> Default for HandoffMachine<B> {
    fn default() -> Self {
        Self {
            phase: Phase::Idle,
            pending: None,
        }
    }
}

impl<B: ?Sized> HandoffMachine<B> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn pending(&self) -> Option<&PendingOperationHandle<B>> {
        self.pending.as_ref()
    }

    fn transition(&mut self, to: Phase) {
        debug!("handoff {} -> {}", self.phase, to);
        self.phase = to;
    }

    /// A new operation starts. A pending zk operation blocks it.
    pub fn begin(&mut self) -> Result<(), InvalidTransition> {
        match self.phase {
            Phase::Idle | Phase::Submitted => {
                self.transition(Phase::AwaitingClassicalSig);
                Ok(())
            }
            from => Err(InvalidTransition { from, event: "begin" }),
        }
    }

    /// Retains the operation and waits for its proof.
    pub fn suspend(&mut self, handle: PendingOperationHandle<B>) -> Result<ProofExportPacket, InvalidTransition> {
        if self.phase != Phase::AwaitingClassicalSig {
            return Err(InvalidTransition {
                from: self.phase,
                event: "suspend",
            });
        }
        let export = handle.export;
        info!("Awaiting external proof for digest {:?}", export.digest);
        self.pending = Some(handle);
        self.transition(Phase::AwaitingExternalProof);
        Ok(export)
    }

    pub fn enter_finalizing(&mut self, trigger: FinalizeTrigger) -> Result<(), InvalidTransition> {
        let allowed = match trigger {
            FinalizeTrigger::FreshSignature => {
                matches!(self.phase, Phase::Idle | Phase::AwaitingClassicalSig) && self.pending.is_none()
            }
            FinalizeTrigger::ImportedProof => self.phase == Phase::AwaitingExternalProof && self.pending.is_some(),
        };
        if !allowed {
            return Err(InvalidTransition {
                from: self.phase,
                event: match trigger {
                    FinalizeTrigger::FreshSignature => "finalize with a fresh signature",
                    FinalizeTrigger::ImportedProof => "finalize with an imported proof",
                },
            });
        }
        self.transition(Phase::Finalizing);
        Ok(())
    }

    /// Submission done: the pending handle, if any, is released.
    pub fn finish(&mut self) -> Result<Option<PendingOperationHandle<B>>, InvalidTransition> {
        if self.phase != Phase::Finalizing {
            return Err(InvalidTransition {
                from: self.phase,
                event: "finish",
            });
        }
        self.transition(Phase::Submitted);
        Ok(self.pending.take())
    }

    /// A step before submission failed. A retained zk operation stays
    /// retained; anything else goes back to idle.
    pub fn abort(&mut self) {
        if !matches!(self.phase, Phase::AwaitingClassicalSig | Phase::Finalizing) {
            return;
        }
        let to = if self.pending.is_some() {
            Phase::AwaitingExternalProof
        } else {
            Phase::Idle
        };
        self.transition(to);
    }

    /// Drops any retained operation.
    pub fn reset(&mut self) {
        if self.pending.take().is_some() {
            info!("Discarding pending zk operation");
        }
        self.transition(Phase::Idle);
    }
}
