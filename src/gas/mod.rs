//! Fee estimation for outgoing transactions
//!
//! This module provides:
//! - The capability traits a fee estimator reads its policy from
//! - The `FeeEstimator` seam used by the attempt builder
//! - A fee-history backed estimator on top of the ethers middleware

mod estimator;

pub use estimator::FeeHistoryEstimator;

use crate::error::{TxmError, TxmResult};

use async_trait::async_trait;
use ethers::providers::Middleware;
use ethers::types::{Address, U256};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

/// Name of the only estimator mode available outside a full node deployment
pub const FEE_HISTORY_MODE: &str = "FeeHistory";

/// Data-availability oracle flavours used by rollups
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaOracleType {
    OpStack,
    Arbitrum,
    ZkSync,
    CustomCalldata,
}

impl FromStr for DaOracleType {
    type Err = TxmError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "opstack" => Ok(DaOracleType::OpStack),
            "arbitrum" => Ok(DaOracleType::Arbitrum),
            "zksync" => Ok(DaOracleType::ZkSync),
            "custom_calldata" => Ok(DaOracleType::CustomCalldata),
            other => Err(TxmError::Config(format!("Unknown DA oracle type {:?}", other))),
        }
    }
}

/// Fee policy consumed by estimators and the attempt builder
pub trait GasEstimatorSettings: Send + Sync {
    fn price_max_key(&self, address: Address) -> Option<U256>;
    fn eip1559_dynamic_fees(&self) -> bool;
    fn bump_percent(&self) -> u16;
    fn bump_threshold(&self) -> u64;
    fn bump_tx_depth(&self) -> u32;
    fn bump_min(&self) -> Option<U256>;
    fn fee_cap_default(&self) -> Option<U256>;
    fn limit_default(&self) -> u64;
    fn limit_max(&self) -> u64;
    fn limit_multiplier(&self) -> f32;
    fn limit_transfer(&self) -> u64;
    fn price_default(&self) -> Option<U256>;
    fn tip_cap_default(&self) -> Option<U256>;
    fn tip_cap_min(&self) -> Option<U256>;
    fn price_max(&self) -> Option<U256>;
    fn price_min(&self) -> Option<U256>;
    fn mode(&self) -> &str;
    fn estimate_limit(&self) -> bool;
    fn sender_address(&self) -> Option<Address>;
    fn da_oracle(&self) -> &dyn DaOracleSettings;
    fn fee_history(&self) -> &dyn FeeHistorySettings;
    fn block_history(&self) -> &dyn BlockHistorySettings;
}

pub trait DaOracleSettings: Send + Sync {
    fn oracle_type(&self) -> Option<DaOracleType>;
    fn oracle_address(&self) -> Option<Address>;
    fn custom_gas_price_calldata(&self) -> Option<&str>;
}

pub trait FeeHistorySettings: Send + Sync {
    /// How long a fetched price stays valid before it is refreshed
    fn cache_timeout(&self) -> Duration;
}

pub trait BlockHistorySettings: Send + Sync {
    fn batch_size(&self) -> u32;
    fn block_history_size(&self) -> u16;
    fn block_delay(&self) -> u16;
    fn check_inclusion_blocks(&self) -> u16;
    fn check_inclusion_percentile(&self) -> u16;
    fn eip1559_fee_cap_buffer_blocks(&self) -> u16;
    fn transaction_percentile(&self) -> u16;
}

/// Fee parameters for a single transaction attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeeEstimate {
    Legacy(U256),
    Dynamic {
        max_fee_per_gas: U256,
        max_priority_fee_per_gas: U256,
    },
}

impl FeeEstimate {
    /// Highest price per gas this estimate may pay
    pub fn price_cap(&self) -> U256 {
        match self {
            FeeEstimate::Legacy(price) => *price,
            FeeEstimate::Dynamic { max_fee_per_gas, .. } => *max_fee_per_gas,
        }
    }

    /// Calculate total cost in wei
    pub fn max_cost(&self, gas_limit: u64) -> U256 {
        self.price_cap() * U256::from(gas_limit)
    }
}

impl fmt::Display for FeeEstimate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FeeEstimate::Legacy(price) => write!(f, "gasPrice={}", price),
            FeeEstimate::Dynamic {
                max_fee_per_gas,
                max_priority_fee_per_gas,
            } => write!(
                f,
                "maxFeePerGas={} maxPriorityFeePerGas={}",
                max_fee_per_gas, max_priority_fee_per_gas
            ),
        }
    }
}

/// Source of fee estimates for the attempt builder
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait FeeEstimator: Send + Sync {
    /// Fetch initial prices and begin refreshing them in the background
    async fn start(&self) -> TxmResult<()>;

    /// Fee and final gas limit for a new attempt, capped at `max_price`
    async fn get_fee(
        &self,
        gas_limit: u64,
        max_price: Option<U256>,
        dynamic: bool,
    ) -> TxmResult<(FeeEstimate, u64)>;

    /// Fee for a replacement of an attempt that paid `original`
    async fn bump_fee(
        &self,
        original: &FeeEstimate,
        gas_limit: u64,
        max_price: Option<U256>,
    ) -> TxmResult<(FeeEstimate, u64)>;

    /// Stop background refreshing
    async fn close(&self) -> TxmResult<()>;
}

/// Build the estimator selected by `settings.mode()`
pub fn new_estimator<M>(
    client: Arc<M>,
    settings: Arc<dyn GasEstimatorSettings>,
) -> TxmResult<Arc<dyn FeeEstimator>>
where
    M: Middleware + 'static,
{
    match settings.mode() {
        FEE_HISTORY_MODE => Ok(Arc::new(FeeHistoryEstimator::new(client, settings))),
        other => Err(TxmError::Config(format!(
            "Unsupported estimator mode {:?}: only {} is available",
            other, FEE_HISTORY_MODE
        ))),
    }
}

/// Convert a whole number of gwei to wei
pub fn gwei(amount: u64) -> U256 {
    U256::from(amount) * U256::exp10(9)
}
