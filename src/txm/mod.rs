//! Transaction manager
//!
//! Handles:
//! - Queueing transaction requests per sending address
//! - Nonce assignment and broadcast of signed attempts
//! - Confirmation tracking through the on-chain nonce
//! - Fee bumping and purging of stuck transactions

mod attempt;
mod keystore;
mod store;
mod stuck;
mod types;

pub use attempt::AttemptBuilder;
pub use keystore::Keystore;
pub use store::InMemoryStore;
pub use stuck::{StuckTxDetector, StuckTxDetectorConfig};
pub use types::{Transaction, TxRequest};

use crate::error::{TxmError, TxmResult};
use crate::metrics;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use ethers::providers::Middleware;
use ethers::types::{Address, BlockNumber};
use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

const SERVICE: &str = "Txm";

/// Unconfirmed transactions allowed per address before broadcasting pauses
pub const MAX_IN_FLIGHT_TRANSACTIONS: usize = 16;

/// Cycle period used when no block time is configured
const DEFAULT_BLOCK_TIME: Duration = Duration::from_secs(12);

/// Node errors meaning the attempt (or one of its siblings) is already known
const ALREADY_KNOWN_ERRORS: &[&str] = &["already known", "known transaction", "nonce too low"];

#[derive(Debug, Clone)]
pub struct TxmConfig {
    pub eip1559: bool,
    pub block_time: Duration,
    /// Blocks without confirmation before a fee bump; zero disables bumping
    pub retry_block_threshold: u16,
    pub empty_tx_limit_default: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AttemptKind {
    New,
    Bump,
    Purge,
}

struct TxmInner<M> {
    chain_id: u64,
    client: Arc<M>,
    attempt_builder: AttemptBuilder,
    store: Arc<InMemoryStore>,
    stuck_detector: Option<StuckTxDetector>,
    config: TxmConfig,
    keystore: Arc<Keystore>,
    /// Wakes the worker of an address ahead of its next cycle
    triggers: DashMap<Address, mpsc::Sender<()>>,
    /// Next nonce to hand out per address
    nonces: DashMap<Address, u64>,
}

struct Workers {
    shutdown: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

/// Transaction manager service: one worker per address in the store
pub struct Txm<M> {
    inner: Arc<TxmInner<M>>,
    workers: Mutex<Option<Workers>>,
}

impl<M> Txm<M>
where
    M: Middleware + 'static,
{
    pub fn new(
        chain_id: u64,
        client: Arc<M>,
        attempt_builder: AttemptBuilder,
        store: Arc<InMemoryStore>,
        stuck_detector: Option<StuckTxDetector>,
        config: TxmConfig,
        keystore: Arc<Keystore>,
    ) -> Self {
        Self {
            inner: Arc::new(TxmInner {
                chain_id,
                client,
                attempt_builder,
                store,
                stuck_detector,
                config,
                keystore,
                triggers: DashMap::new(),
                nonces: DashMap::new(),
            }),
            workers: Mutex::new(None),
        }
    }

    /// Spawn a worker for every address tracked by the store
    pub async fn start(&self) -> TxmResult<()> {
        let mut workers = self.workers.lock().await;
        if workers.is_some() {
            return Err(TxmError::AlreadyStarted { service: SERVICE });
        }

        let addresses = self.inner.store.addresses();
        if let Some(missing) = addresses.iter().find(|a| !self.inner.keystore.contains(a)) {
            return Err(TxmError::KeyNotFound(*missing));
        }
        for unused in self.inner.keystore.addresses() {
            if !addresses.contains(&unused) {
                debug!("Key for {:?} has no transaction book, it will not send", unused);
            }
        }

        let config = &self.inner.config;
        info!(
            "Starting txm for chain {} (eip1559={}, block time {:?}, retry threshold {}, empty tx limit {})",
            self.inner.chain_id,
            config.eip1559,
            config.block_time,
            config.retry_block_threshold,
            config.empty_tx_limit_default
        );

        let (shutdown, shutdown_rx) = watch::channel(false);
        let mut handles = Vec::with_capacity(addresses.len());
        for address in addresses {
            let (trigger_tx, trigger_rx) = mpsc::channel(1);
            self.inner.triggers.insert(address, trigger_tx);

            let inner = self.inner.clone();
            let shutdown_rx = shutdown_rx.clone();
            handles.push(tokio::spawn(async move {
                inner.run(address, trigger_rx, shutdown_rx).await;
            }));
        }

        *workers = Some(Workers { shutdown, handles });
        Ok(())
    }

    /// Queue a transaction for broadcast
    pub fn create_transaction(&self, request: TxRequest) -> TxmResult<Transaction> {
        if request.chain_id != self.inner.chain_id {
            return Err(TxmError::Transaction(format!(
                "Request for chain {} sent to txm for chain {}",
                request.chain_id, self.inner.chain_id
            )));
        }

        let tx = self.inner.store.create_transaction(request)?;
        metrics::record_tx_created(self.inner.chain_id);
        debug!("Created transaction {} from {:?}", tx.id, tx.from_address);
        Ok(tx)
    }

    /// Run the worker of `address` now instead of waiting for its next cycle
    pub fn trigger(&self, address: Address) {
        match self.inner.triggers.get(&address) {
            // A full channel already holds a pending wake-up
            Some(trigger) => {
                let _ = trigger.try_send(());
            }
            None => warn!("Cannot trigger unknown address {:?}", address),
        }
    }

    /// Stop every worker and wait for it to finish
    pub async fn close(&self) -> TxmResult<()> {
        let workers = self
            .workers
            .lock()
            .await
            .take()
            .ok_or(TxmError::NotStarted { service: SERVICE })?;

        let _ = workers.shutdown.send(true);
        self.inner.triggers.clear();

        for result in join_all(workers.handles).await {
            if let Err(e) = result {
                error!("Txm worker failed: {}", e);
            }
        }

        info!("Txm stopped for chain {}", self.inner.chain_id);
        Ok(())
    }
}

impl<M> TxmInner<M>
where
    M: Middleware + 'static,
{
    async fn run(
        &self,
        address: Address,
        mut trigger_rx: mpsc::Receiver<()>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        let mut period = self.config.block_time;
        if period.is_zero() {
            period = DEFAULT_BLOCK_TIME;
        }
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);

        debug!("Txm worker started for {:?}", address);
        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => break,
                msg = trigger_rx.recv() => {
                    if msg.is_none() {
                        break;
                    }
                    debug!("Txm triggered for {:?}", address);
                }
                _ = ticker.tick() => {}
            }

            if let Err(e) = self.process(address).await {
                if e.is_retryable() {
                    warn!("Txm cycle for {:?} failed, retrying next cycle: {}", address, e);
                } else {
                    error!("Txm cycle for {:?} failed: {}", address, e);
                }
            }
        }
        debug!("Txm worker stopped for {:?}", address);
    }

    /// One cycle: confirm, retry the oldest pending transaction, broadcast new ones
    async fn process(&self, address: Address) -> TxmResult<()> {
        let latest_nonce = self
            .client
            .get_transaction_count(address, Some(BlockNumber::Latest.into()))
            .await
            .map_err(|e| TxmError::ChainConnection(e.to_string()))?
            .as_u64();

        let confirmed = self.store.mark_confirmed(address, latest_nonce)?;
        if !confirmed.is_empty() {
            info!("Confirmed transactions {:?} for {:?}", confirmed, address);
            metrics::record_tx_confirmed(self.chain_id, confirmed.len());
        }

        self.backfill(address, latest_nonce).await?;
        self.broadcast(address, latest_nonce).await?;

        let unstarted = self.store.count_unstarted_transactions(address)?;
        let (_, unconfirmed) = self
            .store
            .fetch_unconfirmed_transaction_at_nonce_with_count(latest_nonce, address)?;
        metrics::set_queue_depth(&format!("{:?}", address), unstarted, unconfirmed);
        Ok(())
    }

    async fn backfill(&self, address: Address, latest_nonce: u64) -> TxmResult<()> {
        let (tx, _) = self
            .store
            .fetch_unconfirmed_transaction_at_nonce_with_count(latest_nonce, address)?;
        let Some(tx) = tx else {
            return Ok(());
        };

        let now = Utc::now();
        let kind = match tx.last_broadcast_at {
            None if tx.is_purgeable => AttemptKind::Purge,
            None => AttemptKind::New,
            Some(last) if self.retry_due(last, now) => {
                let stuck = !tx.is_purgeable
                    && self
                        .stuck_detector
                        .as_ref()
                        .is_some_and(|detector| detector.detect(&tx, now));
                if stuck {
                    self.store.mark_purgeable(address, latest_nonce, tx.id)?;
                    metrics::record_tx_purged(self.chain_id);
                    AttemptKind::Purge
                } else if tx.is_purgeable {
                    AttemptKind::Purge
                } else {
                    AttemptKind::Bump
                }
            }
            Some(_) => return Ok(()),
        };

        self.create_and_send_attempt(address, &tx, kind).await
    }

    fn retry_due(&self, last_broadcast: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        if self.config.retry_block_threshold == 0 {
            return false;
        }
        let wait = self.config.block_time * u32::from(self.config.retry_block_threshold);
        match chrono::Duration::from_std(wait) {
            Ok(wait) => now - last_broadcast >= wait,
            Err(_) => false,
        }
    }

    async fn broadcast(&self, address: Address, latest_nonce: u64) -> TxmResult<()> {
        loop {
            let (_, in_flight) = self
                .store
                .fetch_unconfirmed_transaction_at_nonce_with_count(latest_nonce, address)?;
            if in_flight >= MAX_IN_FLIGHT_TRANSACTIONS {
                warn!(
                    "{} transactions in flight for {:?}, waiting for confirmations",
                    in_flight, address
                );
                return Ok(());
            }
            if self.store.count_unstarted_transactions(address)? == 0 {
                return Ok(());
            }

            let nonce = self.next_nonce(address, latest_nonce).await?;
            let Some(tx) = self.store.update_unstarted_to_unconfirmed(address, nonce)? else {
                return Ok(());
            };
            self.nonces.insert(address, nonce + 1);

            self.create_and_send_attempt(address, &tx, AttemptKind::New).await?;
        }
    }

    async fn next_nonce(&self, address: Address, latest_nonce: u64) -> TxmResult<u64> {
        if let Some(next) = self.nonces.get(&address).map(|n| *n) {
            return Ok(next.max(latest_nonce));
        }

        let pending = self
            .client
            .get_transaction_count(address, Some(BlockNumber::Pending.into()))
            .await
            .map_err(|e| TxmError::ChainConnection(e.to_string()))?
            .as_u64();
        debug!("Initial nonce for {:?}: {}", address, pending);
        Ok(pending.max(latest_nonce))
    }

    async fn create_and_send_attempt(
        &self,
        address: Address,
        tx: &Transaction,
        kind: AttemptKind,
    ) -> TxmResult<()> {
        let nonce = tx.nonce.ok_or_else(|| {
            TxmError::Transaction(format!("Transaction {} has no nonce assigned", tx.id))
        })?;

        let builder = &self.attempt_builder;
        let attempt = match (kind, tx.last_attempt()) {
            (AttemptKind::Bump, Some(previous)) => builder.new_bump_attempt(tx, previous).await?,
            (AttemptKind::Purge, previous) => {
                builder.new_purge_attempt(tx, previous, self.config.eip1559).await?
            }
            _ => builder.new_attempt(tx, self.config.eip1559).await?,
        };

        self.store.append_attempt(address, nonce, attempt.clone())?;

        match self
            .client
            .send_raw_transaction(attempt.signed_transaction.clone())
            .await
        {
            Ok(pending) => {
                info!(
                    "Broadcast {:?} attempt {:?} for tx {} (nonce {}, {})",
                    kind,
                    pending.tx_hash(),
                    tx.id,
                    nonce,
                    attempt.fee
                );
            }
            Err(e) => {
                let message = e.to_string();
                if !ALREADY_KNOWN_ERRORS.iter().any(|known| message.contains(known)) {
                    metrics::record_broadcast_error(self.chain_id);
                    return Err(TxmError::Transaction(format!(
                        "Failed to broadcast attempt {:?} for tx {}: {}",
                        attempt.hash, tx.id, message
                    )));
                }
                debug!("Attempt {:?} already known to the node: {}", attempt.hash, message);
            }
        }

        self.store.mark_broadcast(address, nonce, tx.id, Utc::now())?;
        metrics::record_attempt_broadcast(self.chain_id);
        if kind == AttemptKind::Bump {
            metrics::record_attempt_bumped(self.chain_id);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gas::{gwei, FeeEstimate, MockFeeEstimator};
    use ethers::providers::{MockProvider, Provider};
    use ethers::types::{Bytes, H256, U256};
    use crate::txm::keystore::tests::TEST_KEY;
    use crate::txm::types::TxState;

    const CHAIN_ID: u64 = 11155111;

    struct Harness {
        txm: Txm<Provider<MockProvider>>,
        mock: MockProvider,
        store: Arc<InMemoryStore>,
        address: Address,
    }

    fn dynamic_fee(max_fee: u64, tip: u64) -> FeeEstimate {
        FeeEstimate::Dynamic {
            max_fee_per_gas: gwei(max_fee),
            max_priority_fee_per_gas: gwei(tip),
        }
    }

    fn estimator() -> MockFeeEstimator {
        let mut estimator = MockFeeEstimator::new();
        estimator
            .expect_get_fee()
            .returning(|limit, _, _| Ok((dynamic_fee(30, 2), limit)));
        estimator
            .expect_bump_fee()
            .returning(|_, limit, _| Ok((dynamic_fee(36, 3), limit)));
        estimator
    }

    fn harness(block_time: Duration, stuck_detector: Option<StuckTxDetector>) -> Harness {
        let (provider, mock) = Provider::mocked();
        let keystore = Arc::new(Keystore::new(CHAIN_ID));
        let address = keystore.add(TEST_KEY).unwrap();
        let store = Arc::new(InMemoryStore::new(CHAIN_ID));
        store.add(address).unwrap();

        let builder = AttemptBuilder::new(|_| Some(gwei(700)), Arc::new(estimator()), keystore.clone(), 21_000);
        let config = TxmConfig {
            eip1559: true,
            block_time,
            retry_block_threshold: 3,
            empty_tx_limit_default: 21_000,
        };
        let txm = Txm::new(
            CHAIN_ID,
            Arc::new(provider),
            builder,
            store.clone(),
            stuck_detector,
            config,
            keystore,
        );

        Harness {
            txm,
            mock,
            store,
            address,
        }
    }

    fn request(address: Address) -> TxRequest {
        TxRequest {
            chain_id: CHAIN_ID,
            from_address: address,
            to_address: "0x45BB36B79E02e59d3C49b863B31F530C991dd554".parse().unwrap(),
            value: U256::from(50u64),
            data: Bytes::from(vec![128, 100, 11]),
            specified_gas_limit: 40_000,
        }
    }

    /// Queue `n` zero-valued responses. A zero hash decodes as nonce 0 as
    /// well, so the order in which the mock hands them out does not matter.
    fn push_zero_responses(mock: &MockProvider, n: usize) {
        for _ in 0..n {
            mock.push(H256::zero()).unwrap();
        }
    }

    fn unconfirmed_at(h: &Harness, nonce: u64) -> Option<Transaction> {
        h.store
            .fetch_unconfirmed_transaction_at_nonce_with_count(nonce, h.address)
            .unwrap()
            .0
    }

    #[test]
    fn test_create_transaction_checks_chain_id() {
        let h = harness(Duration::from_secs(12), None);
        let mut wrong = request(h.address);
        wrong.chain_id = 1;
        assert!(matches!(
            h.txm.create_transaction(wrong),
            Err(TxmError::Transaction(_))
        ));

        h.txm.create_transaction(request(h.address)).unwrap();
        assert_eq!(h.store.count_unstarted_transactions(h.address).unwrap(), 1);
    }

    #[tokio::test]
    async fn test_start_and_close_lifecycle() {
        let h = harness(Duration::from_secs(12), None);
        assert!(matches!(h.txm.close().await, Err(TxmError::NotStarted { .. })));

        h.txm.start().await.unwrap();
        assert!(matches!(
            h.txm.start().await,
            Err(TxmError::AlreadyStarted { .. })
        ));

        // No responses queued: the triggered cycle fails and is logged
        h.txm.trigger(h.address);
        h.txm.trigger(Address::repeat_byte(0x99));

        h.txm.close().await.unwrap();
        assert!(matches!(h.txm.close().await, Err(TxmError::NotStarted { .. })));
    }

    #[tokio::test]
    async fn test_trigger_runs_cycle_before_next_tick() {
        let h = harness(Duration::from_secs(3600), None);
        h.txm.create_transaction(request(h.address)).unwrap();
        push_zero_responses(&h.mock, 3);

        h.txm.start().await.unwrap();
        h.txm.trigger(h.address);

        let deadline = Instant::now() + Duration::from_secs(5);
        while unconfirmed_at(&h, 0).and_then(|tx| tx.last_broadcast_at).is_none() {
            assert!(Instant::now() < deadline, "triggered cycle never ran");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(h.store.count_unstarted_transactions(h.address).unwrap(), 0);

        h.txm.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_start_requires_keys_for_every_address() {
        let h = harness(Duration::from_secs(12), None);
        h.store.add(Address::repeat_byte(0x77)).unwrap();
        assert!(matches!(h.txm.start().await, Err(TxmError::KeyNotFound(_))));
    }

    #[tokio::test]
    async fn test_cycle_broadcasts_then_confirms() {
        let h = harness(Duration::from_secs(12), None);
        h.txm.create_transaction(request(h.address)).unwrap();

        // latest nonce, pending nonce, send
        push_zero_responses(&h.mock, 3);
        h.txm.inner.process(h.address).await.unwrap();

        assert_eq!(h.store.count_unstarted_transactions(h.address).unwrap(), 0);
        let tx = unconfirmed_at(&h, 0).unwrap();
        assert_eq!(tx.state, TxState::Unconfirmed);
        assert_eq!(tx.attempts.len(), 1);
        assert_eq!(tx.attempts[0].fee, dynamic_fee(30, 2));
        assert!(tx.last_broadcast_at.is_some());

        // The chain has mined nonce 0
        h.mock.push(U256::from(1u64)).unwrap();
        h.txm.inner.process(h.address).await.unwrap();

        let (none, unconfirmed) = h
            .store
            .fetch_unconfirmed_transaction_at_nonce_with_count(0, h.address)
            .unwrap();
        assert!(none.is_none());
        assert_eq!(unconfirmed, 0);
        assert_eq!(h.store.count_confirmed_transactions(h.address).unwrap(), 1);
    }

    #[tokio::test]
    async fn test_nonces_are_sequential() {
        let h = harness(Duration::from_secs(12), None);
        for _ in 0..3 {
            h.txm.create_transaction(request(h.address)).unwrap();
        }

        // latest nonce, pending nonce, three sends
        push_zero_responses(&h.mock, 5);
        h.txm.inner.process(h.address).await.unwrap();

        for nonce in 0..3 {
            assert!(unconfirmed_at(&h, nonce).is_some());
        }
    }

    #[tokio::test]
    async fn test_unconfirmed_transaction_is_bumped() {
        let h = harness(Duration::ZERO, None);
        h.txm.create_transaction(request(h.address)).unwrap();
        push_zero_responses(&h.mock, 3);
        h.txm.inner.process(h.address).await.unwrap();

        // latest nonce, send bump
        push_zero_responses(&h.mock, 2);
        h.txm.inner.process(h.address).await.unwrap();

        let tx = unconfirmed_at(&h, 0).unwrap();
        assert_eq!(tx.attempts.len(), 2);
        assert_eq!(tx.last_attempt().unwrap().fee, dynamic_fee(36, 3));
        assert!(!tx.is_purgeable);
    }

    #[tokio::test]
    async fn test_stuck_transaction_is_purged() {
        let detector = StuckTxDetector::new(StuckTxDetectorConfig {
            block_time: Duration::ZERO,
            stuck_tx_block_threshold: 1,
        });
        let h = harness(Duration::ZERO, Some(detector));
        h.txm.create_transaction(request(h.address)).unwrap();
        push_zero_responses(&h.mock, 3);
        h.txm.inner.process(h.address).await.unwrap();

        // First retry bumps, the second finds it stuck
        push_zero_responses(&h.mock, 2);
        h.txm.inner.process(h.address).await.unwrap();
        push_zero_responses(&h.mock, 2);
        h.txm.inner.process(h.address).await.unwrap();

        let tx = unconfirmed_at(&h, 0).unwrap();
        assert!(tx.is_purgeable);
        assert_eq!(tx.attempts.len(), 3);
        assert_eq!(tx.last_attempt().unwrap().gas_limit, 21_000);
    }

    #[tokio::test]
    async fn test_broadcast_failure_is_retryable() {
        let h = harness(Duration::from_secs(12), None);
        h.txm.create_transaction(request(h.address)).unwrap();

        // Nonces answered, send has no response
        push_zero_responses(&h.mock, 2);
        let err = h.txm.inner.process(h.address).await.unwrap_err();
        assert!(err.is_retryable());

        let tx = unconfirmed_at(&h, 0).unwrap();
        assert_eq!(tx.attempts.len(), 1);
        assert!(tx.last_broadcast_at.is_none());
    }
}
