// src/bundler.rs
//! Bundler and paymaster collaborator, with a Pimlico JSON-RPC implementation.

use async_trait::async_trait;
use ethers::types::{Address, H256};
use jsonrpsee::http_client::{HttpClient, HttpClientBuilder};
use jsonrpsee::proc_macros::rpc;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::ReceiptPolling;
use crate::types::{GasFees, PaymasterContext, RpcUserOperation, Sponsorship, UserOperationReceipt};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BundlerError {
    #[error("Bundler transport error: {0}")]
    Transport(String),

    #[error("Sponsorship refused: {0}")]
    Sponsorship(String),

    #[error("User operation rejected: {0}")]
    Rejected(String),

    #[error("No receipt for user operation {hash:?} after {attempts} attempts")]
    ReceiptTimeout { hash: H256, attempts: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GasPriceTiers {
    pub slow: GasFees,
    pub standard: GasFees,
    pub fast: GasFees,
}

/// Bundler and paymaster operations the pipeline consumes.
#[async_trait]
pub trait Bundler: Send + Sync {
    async fn estimate_fees(&self) -> Result<GasFees, BundlerError>;

    async fn sponsor_user_operation(
        &self,
        op: &RpcUserOperation,
        entry_point: Address,
        context: &PaymasterContext,
    ) -> Result<Sponsorship, BundlerError>;

    /// Returns the user-operation hash.
    async fn send_user_operation(&self, op: &RpcUserOperation, entry_point: Address) -> Result<H256, BundlerError>;

    async fn get_user_operation_receipt(&self, hash: H256) -> Result<Option<UserOperationReceipt>, BundlerError>;
}

/// Polls for the receipt until it appears or the attempt budget runs out.
pub async fn wait_for_user_operation_receipt<B: Bundler + ?Sized>(
    bundler: &B,
    hash: H256,
    polling: &ReceiptPolling,
) -> Result<UserOperationReceipt, BundlerError> {
    for attempt in 1..=polling.max_attempts {
        if let Some(receipt) = bundler.get_user_operation_receipt(hash).await? {
            info!(
                "User operation {:?} included in transaction {:?}",
                hash, receipt.receipt.transaction_hash
            );
            if !receipt.success {
                warn!("User operation {:?} reverted", hash);
            }
            return Ok(receipt);
        }
        debug!("no receipt for {:?} yet (attempt {})", hash, attempt);
        if attempt < polling.max_attempts {
            tokio::time::sleep(polling.interval).await;
        }
    }
    Err(BundlerError::ReceiptTimeout {
        hash,
        attempts: polling.max_attempts,
    })
}

#[rpc(client)]
pub trait PimlicoRpc {
    #[method(name = "pimlico_getUserOperationGasPrice")]
    async fn gas_price(&self) -> jsonrpsee::core::RpcResult<GasPriceTiers>;

    #[method(name = "pm_sponsorUserOperation")]
    async fn sponsor(
        &self,
        user_op: RpcUserOperation,
        entry_point: Address,
        context: PaymasterContext,
    ) -> jsonrpsee::core::RpcResult<Sponsorship>;

    #[method(name = "eth_sendUserOperation")]
    async fn send(&self, user_op: RpcUserOperation, entry_point: Address) -> jsonrpsee::core::RpcResult<H256>;

    #[method(name = "eth_getUserOperationReceipt")]
    async fn receipt(&self, hash: H256) -> jsonrpsee::core::RpcResult<Option<UserOperationReceipt>>;
}

/// Pimlico bundler and verifying paymaster behind one endpoint.
pub struct PimlicoClient {
    client: HttpClient,
}

impl PimlicoClient {
    pub fn new(url: &str) -> Result<Self, BundlerError> {
        let client = HttpClientBuilder::default()
            .build(url)
            .map_err(|e| BundlerError::Transport(e.to_string()))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Bundler for PimlicoClient {
    async fn estimate_fees(&self) -> Result<GasFees, BundlerError> {
        let tiers = self
            .client
            .gas_price()
            .await
            .map_err(|e| BundlerError::Transport(e.to_string()))?;
        Ok(tiers.fast)
    }

    async fn sponsor_user_operation(
        &self,
        op: &RpcUserOperation,
        entry_point: Address,
        context: &PaymasterContext,
    ) -> Result<Sponsorship, BundlerError> {
        debug!("Requesting sponsorship for sender: {:?}", op.sender);
        self.client
            .sponsor(op.clone(), entry_point, context.clone())
            .await
            .map_err(|e| BundlerError::Sponsorship(e.to_string()))
    }

    async fn send_user_operation(&self, op: &RpcUserOperation, entry_point: Address) -> Result<H256, BundlerError> {
        let hash = self
            .client
            .send(op.clone(), entry_point)
            .await
            .map_err(|e| BundlerError::Rejected(e.to_string()))?;
        info!("Submitted user operation {:?}", hash);
        Ok(hash)
    }

    async fn get_user_operation_receipt(&self, hash: H256) -> Result<Option<UserOperationReceipt>, BundlerError> {
        self.client
            .receipt(hash)
            .await
            .map_err(|e| BundlerError::Transport(e.to_string()))
    }
}
