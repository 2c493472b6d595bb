// src/authorization.rs
//! Builds the EIP-7702 delegation authorization and the delegate's `initialize`
//! call that rides along in `factoryData`.

use ethers::abi::{encode, Token};
use ethers::types::{Address, Bytes, U256};
use ethers::utils::id;
use tracing::{debug, info};

use crate::config::{Deployment, Mode};
use crate::error::ValidationError;
use crate::signer::{ClassicalSigner, SignerError};
use crate::types::{DelegationAuthorization, DelegationInit};

const STANDARD_INITIALIZE: &str = "initialize(uint256,address,address,address)";
const ZK_INITIALIZE: &str = "initialize(uint256,address,address,uint256,address)";

/// Arguments of the delegate's `initialize` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InitArgs {
    Standard {
        algorithm_id: U256,
        core: Address,
        owner: Address,
        pq_public_key: Address,
    },
    Zk {
        algorithm_id: U256,
        core: Address,
        verifier: Address,
        public_key_commitment: U256,
        pq_public_key: Address,
    },
}

impl InitArgs {
    pub fn signature(&self) -> &'static str {
        match self {
            InitArgs::Standard { .. } => STANDARD_INITIALIZE,
            InitArgs::Zk { .. } => ZK_INITIALIZE,
        }
    }

    /// Selector-prefixed ABI calldata.
    pub fn encode(&self) -> Bytes {
        let tokens = match self {
            InitArgs::Standard {
                algorithm_id,
                core,
                owner,
                pq_public_key,
            } => vec![
                Token::Uint(*algorithm_id),
                Token::Address(*core),
                Token::Address(*owner),
                Token::Address(*pq_public_key),
            ],
            InitArgs::Zk {
                algorithm_id,
                core,
                verifier,
                public_key_commitment,
                pq_public_key,
            } => vec![
                Token::Uint(*algorithm_id),
                Token::Address(*core),
                Token::Address(*verifier),
                Token::Uint(*public_key_commitment),
                Token::Address(*pq_public_key),
            ],
        };
        let mut calldata = id(self.signature()).to_vec();
        calldata.extend(encode(&tokens));
        Bytes::from(calldata)
    }
}

/// What the account needs before the user operation can be built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthorizationPlan {
    /// Delegate code already installed: no factory, no authorization.
    AlreadyDelegated,
    Install {
        authorization: DelegationAuthorization,
        init: InitArgs,
    },
}

impl AuthorizationPlan {
    pub fn is_delegated(&self) -> bool {
        matches!(self, AuthorizationPlan::AlreadyDelegated)
    }

    /// Obtains the authorization signature. Returns `None` for an already
    /// delegated account without touching the signer.
    pub async fn sign(
        &self,
        signer: &dyn ClassicalSigner,
        path: &str,
    ) -> Result<Option<DelegationInit>, SignerError> {
        match self {
            AuthorizationPlan::AlreadyDelegated => Ok(None),
            AuthorizationPlan::Install { authorization, init } => {
                info!(
                    "Signing delegation to {:?} (chain {}, nonce {}) with {}",
                    authorization.delegate,
                    authorization.chain_id,
                    authorization.nonce,
                    signer.backend()
                );
                let signature = signer.sign_delegation_authorization(path, authorization).await?;
                Ok(Some(DelegationInit {
                    factory_data: init.encode(),
                    authorization: authorization.into_signed(signature),
                }))
            }
        }
    }
}

pub struct AuthorizationBuilder<'a> {
    deployment: &'a Deployment,
    chain_id: u64,
}

impl<'a> AuthorizationBuilder<'a> {
    pub fn new(deployment: &'a Deployment, chain_id: u64) -> Self {
        Self { deployment, chain_id }
    }

    /// `nonce` is the account's transaction count. The zk delegate needs the
    /// public-key commitment at install time; once installed it is not re-sent.
    pub fn prepare(
        &self,
        mode: Mode,
        owner: Address,
        nonce: u64,
        is_delegated: bool,
        public_key_commitment: Option<U256>,
    ) -> Result<AuthorizationPlan, ValidationError> {
        if is_delegated {
            debug!("{:?} already delegated in {} mode", owner, mode);
            return Ok(AuthorizationPlan::AlreadyDelegated);
        }

        let d = self.deployment;
        let init = match mode {
            Mode::Standard => InitArgs::Standard {
                algorithm_id: d.algorithm_id,
                core: d.falcon_core,
                owner,
                pq_public_key: d.pq_public_key,
            },
            Mode::Zk => InitArgs::Zk {
                algorithm_id: d.algorithm_id,
                core: d.falcon_core,
                verifier: d.zk_verifier,
                public_key_commitment: public_key_commitment.ok_or(ValidationError::MissingCommitment)?,
                pq_public_key: d.pq_public_key,
            },
        };

        Ok(AuthorizationPlan::Install {
            authorization: DelegationAuthorization {
                delegate: d.delegate_for(mode),
                chain_id: self.chain_id,
                nonce,
            },
            init,
        })
    }
}
