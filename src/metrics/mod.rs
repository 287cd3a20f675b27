//! Prometheus metrics for the transaction manager
//!
//! Tracks:
//! - Transaction creation and confirmation
//! - Attempts broadcast, bumped and purged
//! - Queue depth per sending address

use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_gauge_vec, CounterVec, Encoder, GaugeVec, TextEncoder,
};

lazy_static! {
    pub static ref TX_CREATED: CounterVec = register_counter_vec!(
        "txm_transactions_created_total",
        "Total transactions queued",
        &["chain_id"]
    ).unwrap();

    pub static ref TX_CONFIRMED: CounterVec = register_counter_vec!(
        "txm_transactions_confirmed_total",
        "Total transactions confirmed",
        &["chain_id"]
    ).unwrap();

    pub static ref ATTEMPTS_BROADCAST: CounterVec = register_counter_vec!(
        "txm_attempts_broadcast_total",
        "Total attempts broadcast",
        &["chain_id"]
    ).unwrap();

    pub static ref ATTEMPTS_BUMPED: CounterVec = register_counter_vec!(
        "txm_attempts_bumped_total",
        "Total fee bumps",
        &["chain_id"]
    ).unwrap();

    pub static ref TX_PURGED: CounterVec = register_counter_vec!(
        "txm_transactions_purged_total",
        "Total stuck transactions replaced by an empty transaction",
        &["chain_id"]
    ).unwrap();

    pub static ref BROADCAST_ERRORS: CounterVec = register_counter_vec!(
        "txm_broadcast_errors_total",
        "Total attempts rejected by the node",
        &["chain_id"]
    ).unwrap();

    pub static ref UNSTARTED: GaugeVec = register_gauge_vec!(
        "txm_unstarted_transactions",
        "Transactions waiting for a nonce",
        &["address"]
    ).unwrap();

    pub static ref UNCONFIRMED: GaugeVec = register_gauge_vec!(
        "txm_unconfirmed_transactions",
        "Transactions broadcast but not yet mined",
        &["address"]
    ).unwrap();
}

pub fn record_tx_created(chain_id: u64) {
    TX_CREATED.with_label_values(&[&chain_id.to_string()]).inc();
}

pub fn record_tx_confirmed(chain_id: u64, count: usize) {
    TX_CONFIRMED
        .with_label_values(&[&chain_id.to_string()])
        .inc_by(count as f64);
}

pub fn record_attempt_broadcast(chain_id: u64) {
    ATTEMPTS_BROADCAST.with_label_values(&[&chain_id.to_string()]).inc();
}

pub fn record_attempt_bumped(chain_id: u64) {
    ATTEMPTS_BUMPED.with_label_values(&[&chain_id.to_string()]).inc();
}

pub fn record_tx_purged(chain_id: u64) {
    TX_PURGED.with_label_values(&[&chain_id.to_string()]).inc();
}

pub fn record_broadcast_error(chain_id: u64) {
    BROADCAST_ERRORS.with_label_values(&[&chain_id.to_string()]).inc();
}

pub fn set_queue_depth(address: &str, unstarted: usize, unconfirmed: usize) {
    UNSTARTED.with_label_values(&[address]).set(unstarted as f64);
    UNCONFIRMED.with_label_values(&[address]).set(unconfirmed as f64);
}

/// Encode every registered metric in the Prometheus text format
pub fn render() -> String {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&prometheus::gather(), &mut buffer) {
        tracing::warn!("Failed to encode metrics: {}", e);
    }
    String::from_utf8_lossy(&buffer).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_and_render() {
        let before = TX_CREATED.with_label_values(&["424242"]).get();
        record_tx_created(424242);
        record_tx_created(424242);
        assert_eq!(TX_CREATED.with_label_values(&["424242"]).get(), before + 2.0);

        set_queue_depth("0xabc", 3, 1);
        assert_eq!(UNSTARTED.with_label_values(&["0xabc"]).get(), 3.0);
        assert_eq!(UNCONFIRMED.with_label_values(&["0xabc"]).get(), 1.0);

        let text = render();
        assert!(text.contains("txm_transactions_created_total"));
        assert!(text.contains("txm_unstarted_transactions"));
    }
}
