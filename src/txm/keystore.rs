//! Local keystore holding raw private keys for signing

use crate::error::{TxmError, TxmResult};

use dashmap::DashMap;
use ethers::signers::{LocalWallet, Signer};
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{Address, Bytes, H256};
use tracing::info;

/// In-process keystore. Keys never leave memory.
pub struct Keystore {
    chain_id: u64,
    wallets: DashMap<Address, LocalWallet>,
}

impl Keystore {
    pub fn new(chain_id: u64) -> Self {
        Self {
            chain_id,
            wallets: DashMap::new(),
        }
    }

    /// Import a hex encoded private key, with or without `0x` prefix
    pub fn add(&self, private_key: &str) -> TxmResult<Address> {
        let trimmed = private_key.trim();
        let hex_key = trimmed
            .strip_prefix("0x")
            .or_else(|| trimmed.strip_prefix("0X"))
            .unwrap_or(trimmed);

        let bytes = hex::decode(hex_key)
            .map_err(|e| TxmError::Keystore(format!("Invalid private key: {}", e)))?;
        let wallet = LocalWallet::from_bytes(&bytes)
            .map_err(|e| TxmError::Keystore(format!("Invalid private key: {}", e)))?
            .with_chain_id(self.chain_id);

        let address = wallet.address();
        self.wallets.insert(address, wallet);
        info!("Added key for {:?} to keystore", address);
        Ok(address)
    }

    pub fn addresses(&self) -> Vec<Address> {
        self.wallets.iter().map(|e| *e.key()).collect()
    }

    pub fn contains(&self, address: &Address) -> bool {
        self.wallets.contains_key(address)
    }

    /// Sign `tx` with the key of `from`, returning the transaction hash and
    /// the RLP encoded signed transaction
    pub fn sign(&self, from: Address, tx: &TypedTransaction) -> TxmResult<(H256, Bytes)> {
        let wallet = self.wallets.get(&from).ok_or(TxmError::KeyNotFound(from))?;
        let signature = wallet
            .sign_transaction_sync(tx)
            .map_err(|e| TxmError::Keystore(format!("Failed to sign transaction: {}", e)))?;

        Ok((tx.hash(&signature), tx.rlp_signed(&signature)))
    }
}
