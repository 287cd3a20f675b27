//! Gas policy records
//!
//! Plain values handed to the fee estimator and the attempt builder. Each
//! record implements the matching settings trait from `crate::gas` by
//! returning its fields unchanged.

use crate::error::TxmResult;
use crate::gas::{
    gwei, BlockHistorySettings, DaOracleSettings, DaOracleType, FeeHistorySettings,
    GasEstimatorSettings, FEE_HISTORY_MODE,
};

use ethers::types::{Address, U256};
use std::env;
use std::time::Duration;

/// Environment variable selecting the DA oracle of a rollup chain
pub const DA_ORACLE_TYPE_ENV: &str = "DA_ORACLE_TYPE";

#[derive(Debug, Clone, Default, PartialEq)]
pub struct GasEstimatorConfig {
    pub eip1559_dynamic_fees: bool,
    pub bump_percent: u16,
    pub bump_threshold: u64,
    pub bump_tx_depth: u32,
    pub bump_min: Option<U256>,
    pub fee_cap_default: Option<U256>,
    pub limit_default: u64,
    pub limit_max: u64,
    pub limit_multiplier: f32,
    pub limit_transfer: u64,
    pub price_default: Option<U256>,
    pub tip_cap_default: Option<U256>,
    pub tip_cap_min: Option<U256>,
    pub price_max: Option<U256>,
    pub price_min: Option<U256>,
    pub mode: String,
    pub estimate_limit: bool,
    pub sender_address: Option<Address>,
    pub da_oracle: DaOracleConfig,
    pub fee_history: Option<FeeHistoryConfig>,
    pub block_history: Option<BlockHistoryConfig>,
}

impl GasEstimatorConfig {
    /// Policy tuned for Ethereum Sepolia
    pub fn sepolia() -> Self {
        Self {
            eip1559_dynamic_fees: true,
            bump_percent: 20,
            bump_threshold: 3,
            limit_default: 30_000,
            limit_multiplier: 1.0,
            price_max: Some(gwei(700)),
            mode: FEE_HISTORY_MODE.to_string(),
            fee_history: Some(FeeHistoryConfig {
                cache_timeout: Duration::from_secs(11),
            }),
            block_history: Some(BlockHistoryConfig {
                block_history_size: 4,
                transaction_percentile: 55,
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    /// Apply `DA_ORACLE_TYPE` (`opstack`, `arbitrum`, `zksync` or
    /// `custom_calldata`) when it is set
    pub fn with_env_overrides(mut self) -> TxmResult<Self> {
        if let Ok(value) = env::var(DA_ORACLE_TYPE_ENV) {
            if !value.is_empty() {
                self.da_oracle.oracle_type = Some(value.parse()?);
            }
        }
        Ok(self)
    }
}

// Shared fallbacks for absent nested records
static DEFAULT_FEE_HISTORY: FeeHistoryConfig = FeeHistoryConfig {
    cache_timeout: Duration::ZERO,
};
static DEFAULT_BLOCK_HISTORY: BlockHistoryConfig = BlockHistoryConfig {
    batch_size: 0,
    block_history_size: 0,
    block_delay: 0,
    check_inclusion_blocks: 0,
    check_inclusion_percentile: 0,
    eip1559_fee_cap_buffer_blocks: 0,
    transaction_percentile: 0,
};

impl GasEstimatorSettings for GasEstimatorConfig {
    fn price_max_key(&self, _address: Address) -> Option<U256> {
        self.price_max
    }

    fn eip1559_dynamic_fees(&self) -> bool {
        self.eip1559_dynamic_fees
    }

    fn bump_percent(&self) -> u16 {
        self.bump_percent
    }

    fn bump_threshold(&self) -> u64 {
        self.bump_threshold
    }

    fn bump_tx_depth(&self) -> u32 {
        self.bump_tx_depth
    }

    fn bump_min(&self) -> Option<U256> {
        self.bump_min
    }

    fn fee_cap_default(&self) -> Option<U256> {
        self.fee_cap_default
    }

    fn limit_default(&self) -> u64 {
        self.limit_default
    }

    fn limit_max(&self) -> u64 {
        self.limit_max
    }

    fn limit_multiplier(&self) -> f32 {
        self.limit_multiplier
    }

    fn limit_transfer(&self) -> u64 {
        self.limit_transfer
    }

    fn price_default(&self) -> Option<U256> {
        self.price_default
    }

    fn tip_cap_default(&self) -> Option<U256> {
        self.tip_cap_default
    }

    fn tip_cap_min(&self) -> Option<U256> {
        self.tip_cap_min
    }

    fn price_max(&self) -> Option<U256> {
        self.price_max
    }

    fn price_min(&self) -> Option<U256> {
        self.price_min
    }

    fn mode(&self) -> &str {
        &self.mode
    }

    fn estimate_limit(&self) -> bool {
        self.estimate_limit
    }

    fn sender_address(&self) -> Option<Address> {
        self.sender_address
    }

    fn da_oracle(&self) -> &dyn DaOracleSettings {
        &self.da_oracle
    }

    fn fee_history(&self) -> &dyn FeeHistorySettings {
        self.fee_history.as_ref().unwrap_or(&DEFAULT_FEE_HISTORY)
    }

    fn block_history(&self) -> &dyn BlockHistorySettings {
        self.block_history.as_ref().unwrap_or(&DEFAULT_BLOCK_HISTORY)
    }
}

/// Data-availability oracle; left empty on L1 chains
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DaOracleConfig {
    pub oracle_type: Option<DaOracleType>,
    pub oracle_address: Option<Address>,
    pub custom_gas_price_calldata: Option<String>,
}

impl DaOracleSettings for DaOracleConfig {
    fn oracle_type(&self) -> Option<DaOracleType> {
        self.oracle_type
    }

    fn oracle_address(&self) -> Option<Address> {
        self.oracle_address
    }

    fn custom_gas_price_calldata(&self) -> Option<&str> {
        self.custom_gas_price_calldata.as_deref()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FeeHistoryConfig {
    pub cache_timeout: Duration,
}

impl FeeHistorySettings for FeeHistoryConfig {
    fn cache_timeout(&self) -> Duration {
        self.cache_timeout
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlockHistoryConfig {
    pub batch_size: u32,
    pub block_history_size: u16,
    pub block_delay: u16,
    pub check_inclusion_blocks: u16,
    pub check_inclusion_percentile: u16,
    pub eip1559_fee_cap_buffer_blocks: u16,
    pub transaction_percentile: u16,
}

impl BlockHistorySettings for BlockHistoryConfig {
    fn batch_size(&self) -> u32 {
        self.batch_size
    }

    fn block_history_size(&self) -> u16 {
        self.block_history_size
    }

    fn block_delay(&self) -> u16 {
        self.block_delay
    }

    fn check_inclusion_blocks(&self) -> u16 {
        self.check_inclusion_blocks
    }

    fn check_inclusion_percentile(&self) -> u16 {
        self.check_inclusion_percentile
    }

    fn eip1559_fee_cap_buffer_blocks(&self) -> u16 {
        self.eip1559_fee_cap_buffer_blocks
    }

    fn transaction_percentile(&self) -> u16 {
        self.transaction_percentile
    }
}
