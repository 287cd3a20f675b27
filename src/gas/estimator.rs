//! Fee-history backed estimator
//!
//! Prices come from `eth_feeHistory` (dynamic fees) or `eth_gasPrice`
//! (legacy) and are cached for the configured cache timeout.

use super::{FeeEstimate, FeeEstimator, GasEstimatorSettings};
use crate::error::{TxmError, TxmResult};

use async_trait::async_trait;
use ethers::providers::Middleware;
use ethers::types::{BlockNumber, U256};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

const SERVICE: &str = "FeeHistoryEstimator";

/// Most nodes reject replacements that raise the fee by less than this
const MIN_REPLACEMENT_BUMP_PERCENT: u16 = 10;

/// Refresh period used when no cache timeout is configured
const DEFAULT_CACHE_TIMEOUT: Duration = Duration::from_secs(10);

/// Latest market prices seen on chain
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MarketPrice {
    Legacy(U256),
    Dynamic { base_fee: U256, tip: U256 },
}

struct Inner<M> {
    client: Arc<M>,
    settings: Arc<dyn GasEstimatorSettings>,
    prices: RwLock<Option<MarketPrice>>,
}

struct Refresher {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Fee estimator that follows the recent fee history of the chain
pub struct FeeHistoryEstimator<M> {
    inner: Arc<Inner<M>>,
    refresher: Mutex<Option<Refresher>>,
}

impl<M> FeeHistoryEstimator<M>
where
    M: Middleware + 'static,
{
    pub fn new(client: Arc<M>, settings: Arc<dyn GasEstimatorSettings>) -> Self {
        Self {
            inner: Arc::new(Inner {
                client,
                settings,
                prices: RwLock::new(None),
            }),
            refresher: Mutex::new(None),
        }
    }

    async fn ensure_started(&self) -> TxmResult<()> {
        if self.refresher.lock().await.is_none() {
            return Err(TxmError::NotStarted { service: SERVICE });
        }
        Ok(())
    }
}

impl<M> Inner<M>
where
    M: Middleware + 'static,
{
    async fn refresh(&self) -> TxmResult<MarketPrice> {
        let price = if self.settings.eip1559_dynamic_fees() {
            self.fetch_dynamic().await?
        } else {
            let gas_price = self
                .client
                .get_gas_price()
                .await
                .map_err(|e| TxmError::GasEstimation(e.to_string()))?;
            MarketPrice::Legacy(gas_price)
        };

        *self.prices.write().await = Some(price);
        debug!("Refreshed market fee prices: {:?}", price);
        Ok(price)
    }

    async fn fetch_dynamic(&self) -> TxmResult<MarketPrice> {
        let history = self.settings.block_history();
        let block_count = u64::from(history.block_history_size().max(1));
        let percentile = f64::from(history.transaction_percentile());

        let fee_history = self
            .client
            .fee_history(block_count, BlockNumber::Latest, &[percentile])
            .await
            .map_err(|e| TxmError::GasEstimation(e.to_string()))?;

        // The last entry is the base fee of the next block
        let base_fee = fee_history
            .base_fee_per_gas
            .last()
            .copied()
            .ok_or_else(|| TxmError::GasEstimation("Empty fee history".to_string()))?;

        let tip = fee_history
            .reward
            .iter()
            .filter_map(|rewards| rewards.first().copied())
            .max()
            .or_else(|| self.settings.tip_cap_default())
            .unwrap_or_default();

        Ok(MarketPrice::Dynamic { base_fee, tip })
    }

    async fn current(&self) -> TxmResult<MarketPrice> {
        self.prices
            .read()
            .await
            .ok_or_else(|| TxmError::GasEstimation("No fee prices fetched yet".to_string()))
    }

    fn gas_limit(&self, specified: u64) -> TxmResult<u64> {
        let base = if specified == 0 {
            self.settings.limit_default()
        } else {
            specified
        };

        let multiplier = self.settings.limit_multiplier();
        let limit = if multiplier > 0.0 {
            (base as f64 * f64::from(multiplier)) as u64
        } else {
            base
        };

        let limit_max = self.settings.limit_max();
        if limit_max > 0 && limit > limit_max {
            return Err(TxmError::GasEstimation(format!(
                "Gas limit {} exceeds maximum {}",
                limit, limit_max
            )));
        }
        Ok(limit)
    }

    fn legacy_fee(&self, market: U256, max_price: Option<U256>) -> U256 {
        let price = market.max(self.settings.price_min().unwrap_or_default());
        cap(price, max_price)
    }

    fn dynamic_fee(&self, base_fee: U256, tip: U256, max_price: Option<U256>) -> FeeEstimate {
        let tip = tip.max(self.settings.tip_cap_min().unwrap_or_default());

        // Leave room for the base fee to rise 12.5% per block
        let mut buffer_blocks =
            u64::from(self.settings.block_history().eip1559_fee_cap_buffer_blocks());
        if buffer_blocks == 0 {
            buffer_blocks = self.settings.bump_threshold() + 1;
        }
        let mut buffered = base_fee;
        for _ in 0..buffer_blocks {
            buffered = buffered * 9 / 8;
        }

        let max_fee_per_gas = cap(buffered + tip, max_price);
        FeeEstimate::Dynamic {
            max_fee_per_gas,
            max_priority_fee_per_gas: tip.min(max_fee_per_gas),
        }
    }

    fn bump_value(&self, value: U256) -> U256 {
        let percent = U256::from(100 + u64::from(self.settings.bump_percent()));
        let by_percent = value * percent / 100;
        let by_min = value + self.settings.bump_min().unwrap_or_default();
        by_percent.max(by_min)
    }
}

fn cap(value: U256, max_price: Option<U256>) -> U256 {
    match max_price {
        Some(max) if value > max => {
            warn!("Fee {} exceeds max price {}, capping", value, max);
            max
        }
        _ => value,
    }
}

fn bump_exceeds(original: U256, max_price: Option<U256>) -> TxmError {
    TxmError::BumpExceedsLimit {
        original: original.to_string(),
        max: max_price.map(|m| m.to_string()).unwrap_or_else(|| "unbounded".to_string()),
    }
}

#[async_trait]
impl<M> FeeEstimator for FeeHistoryEstimator<M>
where
    M: Middleware + 'static,
{
    async fn start(&self) -> TxmResult<()> {
        let mut refresher = self.refresher.lock().await;
        if refresher.is_some() {
            return Err(TxmError::AlreadyStarted { service: SERVICE });
        }

        let settings = &self.inner.settings;
        if settings.bump_percent() < MIN_REPLACEMENT_BUMP_PERCENT {
            warn!(
                "Bump percent {} is below the {}% most nodes require for replacements",
                settings.bump_percent(),
                MIN_REPLACEMENT_BUMP_PERCENT
            );
        }
        if let Some(oracle) = settings.da_oracle().oracle_type() {
            warn!(
                "DA oracle {:?} configured; L1 data fees are not included in estimates",
                oracle
            );
        }

        let price = self.inner.refresh().await?;
        info!("Fee estimator started with {:?}", price);

        let mut period = settings.fee_history().cache_timeout();
        if period.is_zero() {
            period = DEFAULT_CACHE_TIMEOUT;
        }

        let (shutdown, mut shutdown_rx) = watch::channel(false);
        let inner = self.inner.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = inner.refresh().await {
                            warn!("Failed to refresh fee prices: {}", e);
                        }
                    }
                    _ = shutdown_rx.changed() => break,
                }
            }
            debug!("Fee refresh loop stopped");
        });

        *refresher = Some(Refresher { shutdown, handle });
        Ok(())
    }

    async fn get_fee(
        &self,
        gas_limit: u64,
        max_price: Option<U256>,
        dynamic: bool,
    ) -> TxmResult<(FeeEstimate, u64)> {
        self.ensure_started().await?;
        let limit = self.inner.gas_limit(gas_limit)?;

        let fee = match (self.inner.current().await?, dynamic) {
            (MarketPrice::Legacy(price), false) => {
                FeeEstimate::Legacy(self.inner.legacy_fee(price, max_price))
            }
            (MarketPrice::Dynamic { base_fee, tip }, true) => {
                self.inner.dynamic_fee(base_fee, tip, max_price)
            }
            (_, dynamic) => {
                return Err(TxmError::Config(format!(
                    "Requested {} fees but the estimator is configured for {} fees",
                    if dynamic { "dynamic" } else { "legacy" },
                    if dynamic { "legacy" } else { "dynamic" },
                )))
            }
        };

        debug!("Estimated fee {} with gas limit {}", fee, limit);
        Ok((fee, limit))
    }

    async fn bump_fee(
        &self,
        original: &FeeEstimate,
        gas_limit: u64,
        max_price: Option<U256>,
    ) -> TxmResult<(FeeEstimate, u64)> {
        self.ensure_started().await?;
        let market = self.inner.current().await.ok();

        let bumped = match *original {
            FeeEstimate::Legacy(price) => {
                let mut new_price = self.inner.bump_value(price);
                if let Some(MarketPrice::Legacy(current)) = market {
                    new_price = new_price.max(self.inner.legacy_fee(current, None));
                }
                let new_price = cap(new_price, max_price);
                if new_price <= price {
                    return Err(bump_exceeds(price, max_price));
                }
                FeeEstimate::Legacy(new_price)
            }
            FeeEstimate::Dynamic {
                max_fee_per_gas,
                max_priority_fee_per_gas,
            } => {
                let mut new_fee = self.inner.bump_value(max_fee_per_gas);
                let mut new_tip = self.inner.bump_value(max_priority_fee_per_gas);
                if let Some(MarketPrice::Dynamic { base_fee, tip }) = market {
                    let current = self.inner.dynamic_fee(base_fee, tip, None);
                    if let FeeEstimate::Dynamic {
                        max_fee_per_gas,
                        max_priority_fee_per_gas,
                    } = current
                    {
                        new_fee = new_fee.max(max_fee_per_gas);
                        new_tip = new_tip.max(max_priority_fee_per_gas);
                    }
                }
                let new_fee = cap(new_fee, max_price);
                if new_fee <= max_fee_per_gas {
                    return Err(bump_exceeds(max_fee_per_gas, max_price));
                }
                FeeEstimate::Dynamic {
                    max_fee_per_gas: new_fee,
                    max_priority_fee_per_gas: new_tip.min(new_fee),
                }
            }
        };

        debug!("Bumped fee from {} to {}", original, bumped);
        Ok((bumped, gas_limit))
    }

    async fn close(&self) -> TxmResult<()> {
        let refresher = self
            .refresher
            .lock()
            .await
            .take()
            .ok_or(TxmError::NotStarted { service: SERVICE })?;

        let _ = refresher.shutdown.send(true);
        refresher
            .handle
            .await
            .map_err(|e| TxmError::Internal(format!("Fee refresh task failed: {}", e)))?;

        info!("Fee estimator stopped");
        Ok(())
    }
}
