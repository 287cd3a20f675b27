//! Stuck transaction detection
//!
//! A transaction is stuck when it has already been bumped and is still not
//! mined long after its first broadcast. Stuck transactions get their nonce
//! taken over by an empty self-transfer.

use super::types::Transaction;

use chrono::{DateTime, Utc};
use std::time::Duration;
use tracing::warn;

#[derive(Debug, Clone)]
pub struct StuckTxDetectorConfig {
    pub block_time: Duration,
    /// Zero disables detection
    pub stuck_tx_block_threshold: u32,
}

pub struct StuckTxDetector {
    config: StuckTxDetectorConfig,
}

impl StuckTxDetector {
    pub fn new(config: StuckTxDetectorConfig) -> Self {
        Self { config }
    }

    pub fn threshold(&self) -> Duration {
        self.config.block_time * self.config.stuck_tx_block_threshold
    }

    /// Check whether `tx` should be purged
    pub fn detect(&self, tx: &Transaction, now: DateTime<Utc>) -> bool {
        if self.config.stuck_tx_block_threshold == 0 || tx.attempts.len() < 2 {
            return false;
        }

        let Some(initial) = tx.initial_broadcast_at else {
            return false;
        };

        let threshold = match chrono::Duration::from_std(self.threshold()) {
            Ok(threshold) => threshold,
            Err(_) => return false,
        };

        let stuck = now - initial >= threshold;
        if stuck {
            warn!(
                "Transaction {} (nonce {:?}) stuck since {}: {} attempts, no confirmation",
                tx.id,
                tx.nonce,
                initial,
                tx.attempts.len()
            );
        }
        stuck
    }
}
