//! Attempt builder: combines fee estimates with the keystore to produce
//! signed transactions

use super::keystore::Keystore;
use super::types::{Attempt, Transaction};
use crate::error::{TxmError, TxmResult};
use crate::gas::{FeeEstimate, FeeEstimator};

use chrono::Utc;
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{Address, Bytes, Eip1559TransactionRequest, TransactionRequest, U256};
use std::sync::Arc;
use tracing::debug;

/// Per-address fee ceiling
pub type PriceMaxKey = Arc<dyn Fn(Address) -> Option<U256> + Send + Sync>;

/// Builds and signs attempts for stored transactions
pub struct AttemptBuilder {
    price_max_key: PriceMaxKey,
    estimator: Arc<dyn FeeEstimator>,
    keystore: Arc<Keystore>,
    empty_tx_limit_default: u64,
}

impl AttemptBuilder {
    pub fn new(
        price_max_key: impl Fn(Address) -> Option<U256> + Send + Sync + 'static,
        estimator: Arc<dyn FeeEstimator>,
        keystore: Arc<Keystore>,
        empty_tx_limit_default: u64,
    ) -> Self {
        Self {
            price_max_key: Arc::new(price_max_key),
            estimator,
            keystore,
            empty_tx_limit_default,
        }
    }

    /// First attempt for a transaction, priced at the current market
    pub async fn new_attempt(&self, tx: &Transaction, dynamic: bool) -> TxmResult<Attempt> {
        let max_price = (self.price_max_key)(tx.from_address);
        let (fee, gas_limit) = self
            .estimator
            .get_fee(tx.specified_gas_limit, max_price, dynamic)
            .await?;

        self.build(tx, tx.to_address, tx.value, tx.data.clone(), fee, gas_limit)
    }

    /// Replacement for `previous` with a higher fee
    pub async fn new_bump_attempt(&self, tx: &Transaction, previous: &Attempt) -> TxmResult<Attempt> {
        let max_price = (self.price_max_key)(tx.from_address);
        let (fee, gas_limit) = self
            .estimator
            .bump_fee(&previous.fee, previous.gas_limit, max_price)
            .await?;

        self.build(tx, tx.to_address, tx.value, tx.data.clone(), fee, gas_limit)
    }

    /// Empty self-transfer that takes over the nonce of a stuck transaction
    pub async fn new_purge_attempt(
        &self,
        tx: &Transaction,
        previous: Option<&Attempt>,
        dynamic: bool,
    ) -> TxmResult<Attempt> {
        let max_price = (self.price_max_key)(tx.from_address);
        let (fee, _) = match previous {
            Some(previous) => {
                self.estimator
                    .bump_fee(&previous.fee, self.empty_tx_limit_default, max_price)
                    .await?
            }
            None => {
                self.estimator
                    .get_fee(self.empty_tx_limit_default, max_price, dynamic)
                    .await?
            }
        };

        self.build(
            tx,
            tx.from_address,
            U256::zero(),
            Bytes::new(),
            fee,
            self.empty_tx_limit_default,
        )
    }

    fn build(
        &self,
        tx: &Transaction,
        to: Address,
        value: U256,
        data: Bytes,
        fee: FeeEstimate,
        gas_limit: u64,
    ) -> TxmResult<Attempt> {
        let nonce = tx.nonce.ok_or_else(|| {
            TxmError::Transaction(format!("Transaction {} has no nonce assigned", tx.id))
        })?;

        let typed_tx = match fee {
            FeeEstimate::Legacy(gas_price) => TypedTransaction::Legacy(
                TransactionRequest::new()
                    .from(tx.from_address)
                    .to(to)
                    .value(value)
                    .data(data)
                    .nonce(nonce)
                    .gas(gas_limit)
                    .gas_price(gas_price)
                    .chain_id(tx.chain_id),
            ),
            FeeEstimate::Dynamic {
                max_fee_per_gas,
                max_priority_fee_per_gas,
            } => TypedTransaction::Eip1559(
                Eip1559TransactionRequest::new()
                    .from(tx.from_address)
                    .to(to)
                    .value(value)
                    .data(data)
                    .nonce(nonce)
                    .gas(gas_limit)
                    .max_fee_per_gas(max_fee_per_gas)
                    .max_priority_fee_per_gas(max_priority_fee_per_gas)
                    .chain_id(tx.chain_id),
            ),
        };

        let (hash, signed_transaction) = self.keystore.sign(tx.from_address, &typed_tx)?;
        debug!(
            "Built attempt {:?} for tx {} (nonce {}, {}, gas limit {}, max cost {})",
            hash,
            tx.id,
            nonce,
            fee,
            gas_limit,
            fee.max_cost(gas_limit)
        );

        Ok(Attempt {
            tx_id: tx.id,
            hash,
            fee,
            gas_limit,
            signed_transaction,
            created_at: Utc::now(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gas::{gwei, MockFeeEstimator};
    use crate::txm::keystore::tests::TEST_KEY;
    use crate::txm::types::TxRequest;

    const CHAIN_ID: u64 = 11155111;

    fn dynamic_fee(max_fee: u64, tip: u64) -> FeeEstimate {
        FeeEstimate::Dynamic {
            max_fee_per_gas: gwei(max_fee),
            max_priority_fee_per_gas: gwei(tip),
        }
    }

    fn builder(estimator: MockFeeEstimator) -> (AttemptBuilder, Address) {
        let keystore = Arc::new(Keystore::new(CHAIN_ID));
        let from = keystore.add(TEST_KEY).unwrap();
        let builder = AttemptBuilder::new(|_| Some(gwei(700)), Arc::new(estimator), keystore, 21_000);
        (builder, from)
    }

    fn transaction(from: Address, nonce: Option<u64>) -> Transaction {
        let mut tx = Transaction::from_request(
            1,
            TxRequest {
                chain_id: CHAIN_ID,
                from_address: from,
                to_address: Address::repeat_byte(0x45),
                value: U256::from(50u64),
                data: Bytes::from(vec![128, 100, 11]),
                specified_gas_limit: 40_000,
            },
        );
        tx.nonce = nonce;
        tx
    }

    #[tokio::test]
    async fn test_new_attempt_uses_estimate() {
        let mut estimator = MockFeeEstimator::new();
        estimator
            .expect_get_fee()
            .withf(|limit, max, dynamic| *limit == 40_000 && *max == Some(gwei(700)) && *dynamic)
            .times(1)
            .returning(|limit, _, _| Ok((dynamic_fee(30, 2), limit)));
        let (builder, from) = builder(estimator);

        let attempt = builder.new_attempt(&transaction(from, Some(3)), true).await.unwrap();
        assert_eq!(attempt.tx_id, 1);
        assert_eq!(attempt.fee, dynamic_fee(30, 2));
        assert_eq!(attempt.gas_limit, 40_000);
        assert!(!attempt.signed_transaction.is_empty());
    }

    #[tokio::test]
    async fn test_attempt_requires_nonce() {
        let mut estimator = MockFeeEstimator::new();
        estimator
            .expect_get_fee()
            .returning(|limit, _, _| Ok((FeeEstimate::Legacy(gwei(1)), limit)));
        let (builder, from) = builder(estimator);

        let result = builder.new_attempt(&transaction(from, None), false).await;
        assert!(matches!(result, Err(TxmError::Transaction(_))));
    }

    #[tokio::test]
    async fn test_bump_attempt_changes_hash() {
        let mut estimator = MockFeeEstimator::new();
        estimator
            .expect_get_fee()
            .returning(|limit, _, _| Ok((dynamic_fee(30, 2), limit)));
        estimator
            .expect_bump_fee()
            .withf(|fee, limit, _| fee.price_cap() == gwei(30) && *limit == 40_000)
            .returning(|_, limit, _| Ok((dynamic_fee(36, 3), limit)));
        let (builder, from) = builder(estimator);
        let tx = transaction(from, Some(0));

        let first = builder.new_attempt(&tx, true).await.unwrap();
        let bumped = builder.new_bump_attempt(&tx, &first).await.unwrap();
        assert_eq!(bumped.fee, dynamic_fee(36, 3));
        assert_ne!(bumped.hash, first.hash);
    }

    #[tokio::test]
    async fn test_purge_attempt_uses_empty_limit() {
        let mut estimator = MockFeeEstimator::new();
        estimator
            .expect_bump_fee()
            .withf(|_, limit, _| *limit == 21_000)
            .returning(|_, limit, _| Ok((dynamic_fee(40, 4), limit)));
        let (builder, from) = builder(estimator);
        let tx = transaction(from, Some(0));
        let previous = Attempt {
            tx_id: tx.id,
            hash: Default::default(),
            fee: dynamic_fee(30, 2),
            gas_limit: 40_000,
            signed_transaction: Bytes::new(),
            created_at: Utc::now(),
        };

        let purge = builder.new_purge_attempt(&tx, Some(&previous), true).await.unwrap();
        assert_eq!(purge.gas_limit, 21_000);
        assert_eq!(purge.fee, dynamic_fee(40, 4));
    }

    #[tokio::test]
    async fn test_estimator_errors_propagate() {
        let mut estimator = MockFeeEstimator::new();
        estimator
            .expect_get_fee()
            .returning(|_, _, _| Err(TxmError::GasEstimation("rpc down".into())));
        let (builder, from) = builder(estimator);

        let result = builder.new_attempt(&transaction(from, Some(0)), true).await;
        assert!(matches!(result, Err(TxmError::GasEstimation(_))));
    }
}
