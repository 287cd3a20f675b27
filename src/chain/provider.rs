//! HTTP chain client

use crate::error::{TxmError, TxmResult};

use ethers::providers::{Http, Middleware, Provider};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Polling interval for pending transaction watchers
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Connection to a single RPC endpoint
pub struct ChainClient {
    url: String,
    provider: Arc<Provider<Http>>,
}

impl ChainClient {
    /// Build a client for `url`. No request is made until first use.
    pub fn dial(url: &str) -> TxmResult<Self> {
        let provider = Provider::<Http>::try_from(url)
            .map_err(|e| TxmError::ChainConnection(format!("Invalid RPC url {}: {}", url, e)))?
            .interval(POLL_INTERVAL);

        debug!("Created HTTP provider for {}", url);
        Ok(Self {
            url: url.to_string(),
            provider: Arc::new(provider),
        })
    }

    /// Shared handle to the underlying provider
    pub fn provider(&self) -> Arc<Provider<Http>> {
        self.provider.clone()
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Fetch the chain ID
    pub async fn chain_id(&self) -> TxmResult<u64> {
        self.provider
            .get_chainid()
            .await
            .map(|id| id.as_u64())
            .map_err(|e| TxmError::ChainConnection(format!("Error fetching chain ID: {}", e)))
    }

    /// Get current block number
    pub async fn block_number(&self) -> TxmResult<u64> {
        self.provider
            .get_block_number()
            .await
            .map(|b| b.as_u64())
            .map_err(|e| TxmError::ChainConnection(e.to_string()))
    }
}
