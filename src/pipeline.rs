// src/pipeline.rs
//! Drives one transfer from validation to a mined user operation.
//!
//! Standard mode runs in a single call. In zk mode with a proof required the
//! first call stops after the classical signature and returns the export
//! packet; a later call carrying the proof finalizes the retained operation.

use std::sync::Arc;

use ethers::types::{Address, Bytes, H256, U256};
use ethers::utils::{format_ether, parse_ether};
use tracing::{debug, info, warn};

use crate::authorization::{AuthorizationBuilder, AuthorizationPlan};
use crate::bundler::{wait_for_user_operation_receipt, Bundler};
use crate::chain::{read_account, ChainReader};
use crate::codec::decode_fixed;
use crate::composer::{compose, stub_signature, SignatureBundle};
use crate::config::{Mode, PipelineSettings};
use crate::delegation::DelegationDetector;
use crate::error::{PipelineError, ValidationError};
use crate::falcon::{FalconModule, FalconSigner, NativeFalconModule, PqKeyMaterial};
use crate::handoff::{
    FinalizeTrigger, HandoffMachine, PendingOperationHandle, Phase, ProofExportPacket, ProofImportPacket,
};
use crate::signer::{ConnectedSigner, TypedDigest};
use crate::types::{Account, Call, UserOperation};
use crate::user_op::{typed_data, typed_digest, UserOperationBuilder, UserOperationDraft};

/// A transfer as entered by the user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferRequest {
    pub destination: String,
    /// Decimal ether amount.
    pub amount: String,
    pub mode: Mode,
    /// Decimal or `0x` hex. Needed to install the zk delegate.
    pub public_key_commitment: Option<String>,
    /// Proof import packet, once the external prover has produced one.
    pub proof: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmissionReceipt {
    pub user_op_hash: H256,
    pub transaction_hash: H256,
    pub success: bool,
    /// Fresh chain view of the sender, if it could be read.
    pub account: Option<Account>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// Hand the packet to the prover and submit again with its answer.
    AwaitingProof(ProofExportPacket),
    Submitted(SubmissionReceipt),
}

struct ValidatedTransfer {
    destination: Address,
    amount: U256,
    commitment: Option<U256>,
}

fn validate(request: &TransferRequest) -> Result<ValidatedTransfer, ValidationError> {
    let destination = request.destination.trim();
    if !destination.starts_with("0x") {
        return Err(ValidationError::InvalidDestination(destination.to_string()));
    }
    let destination = decode_fixed::<20>(destination)
        .map(Address::from)
        .map_err(|e| ValidationError::InvalidDestination(e.to_string()))?;
    if destination.is_zero() {
        return Err(ValidationError::InvalidDestination("zero address".to_string()));
    }

    let amount = request.amount.trim();
    if amount.starts_with('-') {
        return Err(ValidationError::InvalidAmount(amount.to_string()));
    }
    let amount = parse_ether(amount).map_err(|e| ValidationError::InvalidAmount(e.to_string()))?;
    if amount.is_zero() {
        return Err(ValidationError::InvalidAmount("amount must be positive".to_string()));
    }

    let commitment = match request.public_key_commitment.as_deref().map(str::trim) {
        None | Some("") => None,
        Some(raw) => {
            let parsed = match raw.strip_prefix("0x") {
                Some(hex) => U256::from_str_radix(hex, 16).ok(),
                None => U256::from_dec_str(raw).ok(),
            };
            Some(parsed.ok_or_else(|| ValidationError::InvalidCommitment(raw.to_string()))?)
        }
    };

    Ok(ValidatedTransfer {
        destination,
        amount,
        commitment,
    })
}

pub struct SubmissionPipeline<C: ?Sized, B: ?Sized, M = NativeFalconModule> {
    settings: PipelineSettings,
    chain: Arc<C>,
    bundler: Arc<B>,
    falcon: FalconSigner<M>,
    machine: HandoffMachine<B>,
    account: Option<Account>,
}

impl<C, B> SubmissionPipeline<C, B, NativeFalconModule>
where
    C: ChainReader + ?Sized,
    B: Bundler + ?Sized,
{
    pub fn new(settings: PipelineSettings, chain: Arc<C>, bundler: Arc<B>) -> Self {
        Self::with_falcon(settings, chain, bundler, FalconSigner::default())
    }
}

impl<C, B, M> SubmissionPipeline<C, B, M>
where
    C: ChainReader + ?Sized,
    B: Bundler + ?Sized,
    M: FalconModule,
{
    pub fn with_falcon(settings: PipelineSettings, chain: Arc<C>, bundler: Arc<B>, falcon: FalconSigner<M>) -> Self {
        Self {
            settings,
            chain,
            bundler,
            falcon,
            machine: HandoffMachine::new(),
            account: None,
        }
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    pub fn phase(&self) -> Phase {
        self.machine.phase()
    }

    /// Export packet of the operation awaiting its proof.
    pub fn pending_export(&self) -> Option<ProofExportPacket> {
        self.machine.pending().map(|handle| handle.export)
    }

    /// Sender state as last read after a submission.
    pub fn account(&self) -> Option<&Account> {
        self.account.as_ref()
    }

    /// Abandons any pending zk operation.
    pub fn reset(&mut self) {
        self.machine.reset();
    }

    pub async fn submit(
        &mut self,
        signer: &ConnectedSigner<'_>,
        request: &TransferRequest,
    ) -> Result<SubmitOutcome, PipelineError> {
        let transfer = validate(request)?;

        if self.machine.phase() == Phase::AwaitingExternalProof {
            if request.mode != Mode::Zk {
                return Err(ValidationError::PendingZkOperation.into());
            }
            return match request.proof.as_deref() {
                // Same request again: hand back the same packet.
                None => {
                    let export = self.pending_export().ok_or(ValidationError::ProofWithoutPendingOperation)?;
                    info!("Replaying export packet for pending operation");
                    Ok(SubmitOutcome::AwaitingProof(export))
                }
                Some(proof) => self.finalize_with_proof(proof).await.map(SubmitOutcome::Submitted),
            };
        }

        if request.mode == Mode::Zk && request.proof.is_some() {
            return Err(ValidationError::ProofWithoutPendingOperation.into());
        }

        self.run(signer, request.mode, transfer).await
    }

    async fn run(
        &mut self,
        signer: &ConnectedSigner<'_>,
        mode: Mode,
        transfer: ValidatedTransfer,
    ) -> Result<SubmitOutcome, PipelineError> {
        let sender = signer.account().address;
        let account = read_account(&*self.chain, sender).await?;
        if transfer.amount > account.balance {
            return Err(ValidationError::AmountExceedsBalance {
                amount: format_ether(transfer.amount),
                balance: format_ether(account.balance),
            }
            .into());
        }

        let deployment = &self.settings.deployment;
        let is_delegated = DelegationDetector::new(deployment).is_delegated(&account.code, mode);
        let plan = AuthorizationBuilder::new(deployment, self.settings.chain_id).prepare(
            mode,
            sender,
            account.nonce.low_u64(),
            is_delegated,
            transfer.commitment,
        )?;

        self.machine.begin()?;
        let result = self
            .sign_fresh(signer, mode, &plan, sender, Call::transfer(transfer.destination, transfer.amount))
            .await;
        if result.is_err() {
            self.machine.abort();
        }
        result
    }

    async fn sign_fresh(
        &mut self,
        signer: &ConnectedSigner<'_>,
        mode: Mode,
        plan: &AuthorizationPlan,
        sender: Address,
        call: Call,
    ) -> Result<SubmitOutcome, PipelineError> {
        let path = self.settings.signing_path.clone();
        let entry_point = self.settings.deployment.entry_point;
        let awaits_proof = mode == Mode::Zk && self.settings.proof_required;
        let blob_format = if awaits_proof { Mode::Zk } else { Mode::Standard };

        let init = plan.sign(signer.signer(), &path).await?;
        let nonce = self.chain.get_entry_point_nonce(entry_point, sender).await?;

        let op = UserOperationBuilder::new(entry_point, &self.settings.gas, &self.settings.paymaster_context)
            .prepare(
                &*self.bundler,
                UserOperationDraft {
                    sender,
                    nonce,
                    calls: vec![call],
                    init,
                },
                &stub_signature(blob_format),
            )
            .await?;

        let digest = typed_digest(&op, self.settings.chain_id, entry_point);
        let document = typed_data(&op, self.settings.chain_id, entry_point);
        info!("Signing user operation digest {:?} with {}", digest.digest(), signer.signer().backend());
        let classical = signer.signer().sign_typed_data(&path, &document, &digest).await?;

        if awaits_proof {
            let export = ProofExportPacket::new(digest.digest(), &classical, signer.account())?;
            let export = self.machine.suspend(PendingOperationHandle {
                user_operation: op,
                bundler: self.bundler.clone(),
                digest,
                export,
            })?;
            return Ok(SubmitOutcome::AwaitingProof(export));
        }

        self.machine.enter_finalizing(FinalizeTrigger::FreshSignature)?;
        let pq = self.pq_sign(&digest)?;
        let blob = compose(&SignatureBundle::HybridClassicalPq { classical, pq }, Mode::Standard)?;
        let bundler = self.bundler.clone();
        self.submit_signed(op.with_signature(blob), &*bundler)
            .await
            .map(SubmitOutcome::Submitted)
    }

    async fn finalize_with_proof(&mut self, proof: &str) -> Result<SubmissionReceipt, PipelineError> {
        // A malformed proof leaves the operation waiting for a corrected one.
        let import: ProofImportPacket = proof.parse()?;
        self.machine.enter_finalizing(FinalizeTrigger::ImportedProof)?;

        let (op, bundler, digest) = match self.machine.pending() {
            Some(handle) => (handle.user_operation.clone(), handle.bundler.clone(), handle.digest),
            None => {
                self.machine.abort();
                return Err(ValidationError::ProofWithoutPendingOperation.into());
            }
        };
        debug!("finalizing retained digest {:?}", digest.digest());

        let blob = self.pq_sign(&digest).and_then(|pq| {
            let bundle = SignatureBundle::ZkBundle {
                proof: import.proof,
                public_inputs: import.public_inputs,
                pq,
            };
            compose(&bundle, Mode::Zk).map_err(PipelineError::from)
        });
        let blob = match blob {
            Ok(blob) => blob,
            Err(e) => {
                self.machine.abort();
                return Err(e);
            }
        };

        self.submit_signed(op.with_signature(blob), &*bundler).await
    }

    fn pq_sign(&self, digest: &TypedDigest) -> Result<Bytes, PipelineError> {
        let signature = self
            .falcon
            .sign(PqKeyMaterial::Seed(&*self.settings.pq_seed), digest.digest().as_bytes())?;
        Ok(Bytes::from(signature.into_bytes()))
    }

    /// Sends once. After the bundler accepts the operation the handle is
    /// released, whatever happens while waiting for the receipt, and a
    /// receipt failure is reported as `Unconfirmed`.
    async fn submit_signed(&mut self, op: UserOperation, bundler: &B) -> Result<SubmissionReceipt, PipelineError> {
        let entry_point = self.settings.deployment.entry_point;
        let rpc = op.to_rpc(&Bytes::default());
        let user_op_hash = match bundler.send_user_operation(&rpc, entry_point).await {
            Ok(hash) => hash,
            Err(e) => {
                self.machine.abort();
                return Err(e.into());
            }
        };
        self.machine.finish()?;

        // The operation is out; from here a failure must not invite a resend.
        let receipt = wait_for_user_operation_receipt(bundler, user_op_hash, &self.settings.receipt_polling)
            .await
            .map_err(|source| PipelineError::Unconfirmed { user_op_hash, source })?;
        let account = self.refresh_account(op.sender).await;

        Ok(SubmissionReceipt {
            user_op_hash,
            transaction_hash: receipt.receipt.transaction_hash,
            success: receipt.success,
            account,
        })
    }

    async fn refresh_account(&mut self, address: Address) -> Option<Account> {
        match read_account(&*self.chain, address).await {
            Ok(account) => {
                let status = DelegationDetector::new(&self.settings.deployment).status(&account.code);
                info!(
                    "Account {:?}: {} ETH, nonce {}, {}",
                    address,
                    format_ether(account.balance),
                    account.nonce,
                    status
                );
                self.account = Some(account.clone());
                Some(account)
            }
            Err(e) => {
                warn!("Skipping account refresh: {}", e);
                None
            }
        }
    }
}
