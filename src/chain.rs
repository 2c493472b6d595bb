// src/chain.rs
use std::sync::Arc;

use async_trait::async_trait;
use ethers::prelude::*;
use thiserror::Error;
use tracing::debug;

use crate::types::Account;

abigen!(
    EntryPoint,
    r#"[
        function getNonce(address sender, uint192 key) external view returns (uint256 nonce)
    ]"#
);

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChainReadError {
    #[error("Ethereum provider error: {0}")]
    Provider(String),

    #[error("Contract call failed: {0}")]
    Contract(String),
}

/// Read-only view of chain state.
#[async_trait]
pub trait ChainReader: Send + Sync {
    async fn get_code(&self, address: Address) -> Result<Bytes, ChainReadError>;

    async fn get_balance(&self, address: Address) -> Result<U256, ChainReadError>;

    async fn get_transaction_count(&self, address: Address) -> Result<U256, ChainReadError>;

    /// `EntryPoint.getNonce(sender, 0)`
    async fn get_entry_point_nonce(&self, entry_point: Address, sender: Address) -> Result<U256, ChainReadError>;
}

pub async fn read_account<C: ChainReader + ?Sized>(chain: &C, address: Address) -> Result<Account, ChainReadError> {
    let code = chain.get_code(address).await?;
    let balance = chain.get_balance(address).await?;
    let nonce = chain.get_transaction_count(address).await?;
    debug!(
        "account {:?}: {} code bytes, balance {}, nonce {}",
        address,
        code.len(),
        balance,
        nonce
    );
    Ok(Account {
        address,
        code,
        balance,
        nonce,
    })
}

pub struct ProviderChainReader {
    client: Arc<Provider<Http>>,
}

impl ProviderChainReader {
    pub fn new(eth_rpc_url: &str) -> Result<Self, ChainReadError> {
        let provider = Provider::<Http>::try_from(eth_rpc_url).map_err(|e| ChainReadError::Provider(e.to_string()))?;
        Ok(Self {
            client: Arc::new(provider),
        })
    }
}

#[async_trait]
impl ChainReader for ProviderChainReader {
    async fn get_code(&self, address: Address) -> Result<Bytes, ChainReadError> {
        self.client
            .get_code(address, None)
            .await
            .map_err(|e| ChainReadError::Provider(e.to_string()))
    }

    async fn get_balance(&self, address: Address) -> Result<U256, ChainReadError> {
        self.client
            .get_balance(address, None)
            .await
            .map_err(|e| ChainReadError::Provider(e.to_string()))
    }

    async fn get_transaction_count(&self, address: Address) -> Result<U256, ChainReadError> {
        self.client
            .get_transaction_count(address, None)
            .await
            .map_err(|e| ChainReadError::Provider(e.to_string()))
    }

    async fn get_entry_point_nonce(&self, entry_point: Address, sender: Address) -> Result<U256, ChainReadError> {
        EntryPoint::new(entry_point, self.client.clone())
            .get_nonce(sender, U256::zero())
            .call()
            .await
            .map_err(|e| ChainReadError::Contract(e.to_string()))
    }
}
