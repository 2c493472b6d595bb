// src/delegation.rs
//! Decides from account bytecode whether a delegate is already installed.

use std::fmt;

use ethers::types::{Address, Bytes};

use crate::config::{Deployment, Mode};

/// EIP-7702 delegation designator prefix.
pub const DELEGATION_DESIGNATOR: [u8; 3] = [0xef, 0x01, 0x00];

/// Bytecode an account carries once delegated to `delegate`.
pub fn delegated_code(delegate: Address) -> Bytes {
    let mut code = Vec::with_capacity(23);
    code.extend_from_slice(&DELEGATION_DESIGNATOR);
    code.extend_from_slice(delegate.as_bytes());
    Bytes::from(code)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DelegationStatus {
    Eoa,
    Delegated(Mode),
    /// Some other code: a different delegate or a regular contract.
    Other,
}

impl fmt::Display for DelegationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DelegationStatus::Eoa => write!(f, "EOA"),
            DelegationStatus::Delegated(mode) => write!(f, "DELEGATED ({})", mode),
            DelegationStatus::Other => write!(f, "OTHER"),
        }
    }
}

pub struct DelegationDetector<'a> {
    deployment: &'a Deployment,
}

impl<'a> DelegationDetector<'a> {
    pub fn new(deployment: &'a Deployment) -> Self {
        Self { deployment }
    }

    pub fn expected_code(&self, mode: Mode) -> Bytes {
        delegated_code(self.deployment.delegate_for(mode))
    }

    pub fn is_delegated(&self, code: &Bytes, mode: Mode) -> bool {
        code.as_ref() == self.expected_code(mode).as_ref()
    }

    pub fn status(&self, code: &Bytes) -> DelegationStatus {
        if code.is_empty() {
            DelegationStatus::Eoa
        } else if self.is_delegated(code, Mode::Standard) {
            DelegationStatus::Delegated(Mode::Standard)
        } else if self.is_delegated(code, Mode::Zk) {
            DelegationStatus::Delegated(Mode::Zk)
        } else {
            DelegationStatus::Other
        }
    }
}
