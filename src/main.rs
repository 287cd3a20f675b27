//! Transaction manager runner
//!
//! Wires a fee-history gas estimator, a local keystore and an in-memory
//! transaction store into the transaction manager, submits a batch of
//! sample transactions on Sepolia and waits until every one is mined.

use anyhow::{ensure, Context, Result};
use ethers::types::{Address, Bytes, U256};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{debug, error, info, warn};

mod chain;
mod config;
mod error;
mod gas;
mod metrics;
mod txm;

use chain::ChainClient;
use config::{AppConfig, GasEstimatorConfig};
use gas::GasEstimatorSettings;
use txm::{
    AttemptBuilder, InMemoryStore, Keystore, StuckTxDetector, StuckTxDetectorConfig, TxRequest,
    Txm, TxmConfig,
};

const SAMPLE_TRANSACTIONS: usize = 5;
const SAMPLE_RECIPIENT: &str = "0x45BB36B79E02e59d3C49b863B31F530C991dd554";
const SAMPLE_GAS_LIMIT: u64 = 40_000;
const STUCK_TX_BLOCK_THRESHOLD: u32 = 3;
const POLL_INTERVAL: Duration = Duration::from_secs(4);

#[tokio::main]
async fn main() {
    init_logging();

    let code = exit_code(run().await);
    if code != 0 {
        std::process::exit(code);
    }
}

/// Log a fatal error through the tracing pipeline and map it to an exit code
fn exit_code(result: Result<()>) -> i32 {
    match result {
        Ok(()) => 0,
        Err(e) => {
            error!("{:#}", e);
            1
        }
    }
}

/// The whole harness; the first error stops it
async fn run() -> Result<()> {
    info!("Starting transaction manager runner v{}", env!("CARGO_PKG_VERSION"));

    let app_config = AppConfig::load()?;
    let from_address = app_config.from_address()?;
    let gas_config = Arc::new(GasEstimatorConfig::sepolia().with_env_overrides()?);

    let client = ChainClient::dial(&app_config.rpc)?;
    let chain_id = client
        .chain_id()
        .await
        .context("failed to fetch chain id")?;
    let head = client.block_number().await?;
    info!("Connected to chain {} at block {} via {}", chain_id, head, client.url());

    let estimator = gas::new_estimator(client.provider(), gas_config.clone())?;
    estimator.start().await?;

    let keystore = Arc::new(Keystore::new(chain_id));
    let key_address = keystore.add(&app_config.private_key)?;
    ensure!(
        key_address == from_address,
        "PRIVATE_KEY belongs to {:?}, not FROM_ADDRESS {:?}",
        key_address,
        from_address
    );

    let price_max = gas_config.clone();
    let attempt_builder = AttemptBuilder::new(
        move |address| price_max.price_max_key(address),
        estimator.clone(),
        keystore.clone(),
        gas_config.limit_default,
    );

    let store = Arc::new(InMemoryStore::new(chain_id));
    store.add(from_address)?;

    let block_time = gas_config
        .fee_history
        .as_ref()
        .map(|fh| fh.cache_timeout)
        .unwrap_or(Duration::from_secs(12));
    let txm_config = TxmConfig {
        eip1559: gas_config.eip1559_dynamic_fees,
        block_time,
        retry_block_threshold: u16::try_from(gas_config.bump_threshold).unwrap_or(u16::MAX),
        empty_tx_limit_default: gas_config.limit_default,
    };
    let stuck_detector = StuckTxDetector::new(StuckTxDetectorConfig {
        block_time,
        stuck_tx_block_threshold: STUCK_TX_BLOCK_THRESHOLD,
    });

    let txm = Txm::new(
        chain_id,
        client.provider(),
        attempt_builder,
        store.clone(),
        Some(stuck_detector),
        txm_config,
        keystore,
    );
    txm.start().await?;

    let to_address: Address = SAMPLE_RECIPIENT
        .parse()
        .context("invalid sample recipient")?;
    for _ in 0..SAMPLE_TRANSACTIONS {
        let tx = txm.create_transaction(TxRequest {
            chain_id,
            from_address,
            to_address,
            value: U256::from(50u64),
            data: Bytes::from(vec![128, 100, 11]),
            specified_gas_limit: SAMPLE_GAS_LIMIT,
        })?;
        debug!("Queued transaction {}", tx.id);
    }
    txm.trigger(from_address);

    let interrupted = tokio::select! {
        result = wait_for_drain(&store, from_address) => {
            result?;
            false
        }
        _ = shutdown_signal() => true,
    };
    if interrupted {
        warn!("Shutdown signal received before all transactions were mined");
    }

    txm.close().await?;
    estimator.close().await?;

    info!(
        "Confirmed {} transactions from {:?}",
        store.count_confirmed_transactions(from_address)?,
        from_address
    );
    debug!("Final metrics:\n{}", metrics::render());
    debug!("Thanks for using the transaction manager!");
    Ok(())
}

/// Poll the store until no transaction is waiting or in flight
async fn wait_for_drain(store: &InMemoryStore, address: Address) -> Result<()> {
    loop {
        let unstarted = store.count_unstarted_transactions(address)?;
        let (_, unconfirmed) = store.fetch_unconfirmed_transaction_at_nonce_with_count(0, address)?;
        info!("Unstarted: {} - Unconfirmed: {}", unstarted, unconfirmed);

        if unstarted == 0 && unconfirmed == 0 {
            return Ok(());
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

fn init_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,txm_runner=debug,hyper=warn,reqwest=warn"));

    // LOG_FORMAT=json for log shippers, human readable otherwise
    let json = std::env::var("LOG_FORMAT").is_ok_and(|format| format.eq_ignore_ascii_case("json"));

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(fmt::layer().json().with_target(true)).init();
    } else {
        registry
            .with(fmt::layer().with_target(true).with_thread_ids(true))
            .init();
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
